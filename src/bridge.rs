//! RPC to the out-of-process bridge sidecar.
//!
//! The bridge executes capabilities the runtime cannot perform natively
//! (web search, MQTT, BLE scanning, OTA, robot hardware). Requests are
//! `{"type":"tool","name":…,"input":<raw>}` envelopes over a framed
//! carrier; the reply mirrors the shape with an `output` string or an
//! `error`. The bridge implementation itself lives outside this crate.

use crate::json::{self, JsonWriter};
use crate::tools::ToolContext;
use crate::transport;

/// Output ceiling for bridge-executed tools.
pub const MAX_BRIDGE_OUTPUT: usize = 256 * 1024;

/// Run a tool on the bridge, returning its output or an error message
/// suitable for an error tool-result.
pub async fn call_tool(
    ctx: &ToolContext,
    name: &str,
    input_raw: &str,
) -> Result<String, String> {
    let Some(endpoint) = &ctx.bridge else {
        return Err(format!("Tool '{name}' requires the bridge, which is not connected"));
    };

    let input = if input_raw.trim().is_empty() {
        "{}"
    } else {
        input_raw
    };
    let mut writer = JsonWriter::with_capacity(input.len() + 64);
    writer
        .begin_object()
        .field_string("type", "tool")
        .field_string("name", name)
        .field_raw("input", input)
        .end_object();
    let envelope = writer.finish();

    let mut carrier = transport::open_remote(endpoint)
        .await
        .map_err(|e| format!("Bridge unavailable: {e}"))?;
    let result = carrier.send(envelope.as_bytes()).await;
    carrier.close().await;
    let reply_bytes = result.map_err(|e| format!("Bridge call failed: {e}"))?;

    let reply = String::from_utf8(reply_bytes)
        .map_err(|_| "Bridge returned non-UTF-8 data".to_string())?;
    if let Some(error) = json::extract_string(&reply, "error") {
        return Err(json::unescape(error));
    }
    let output = json::extract_string(&reply, "output")
        .map(json::unescape)
        .ok_or_else(|| "Bridge reply missing output".to_string())?;
    Ok(cap_output(output))
}

fn cap_output(mut output: String) -> String {
    if output.len() <= MAX_BRIDGE_OUTPUT {
        return output;
    }
    let mut end = MAX_BRIDGE_OUTPUT;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str("\n... output truncated");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_respects_char_boundaries() {
        let long = "é".repeat(MAX_BRIDGE_OUTPUT);
        let capped = cap_output(long);
        assert!(capped.len() <= MAX_BRIDGE_OUTPUT + 32);
        assert!(capped.ends_with("... output truncated"));
        assert_eq!(cap_output("short".into()), "short");
    }
}
