//! IoT profile: messaging and device tools.
//!
//! MQTT lives on the bridge sidecar; the runtime validates inputs, applies
//! the shared bridge rate limit, and relays the verbatim input object.
//! Shell access and file writes are rejected outright in this profile,
//! before any fall-through.

use super::policy::now_secs;
use super::{optional_str, require_str, Tool, ToolContext};

/// Output ceiling for http_request bodies.
const MAX_HTTP_OUTPUT: usize = 256 * 1024;

pub fn tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(PublishMqttTool),
        Box::new(SubscribeMqttTool),
        Box::new(HttpRequestTool),
        Box::new(DeviceInfoTool),
    ]
}

/// Names this profile refuses regardless of who would handle them.
pub fn policy_gate(name: &str) -> Result<(), String> {
    match name {
        "bash" | "write_file" | "edit_file" | "apply_patch" => {
            Err(format!("Tool '{name}' is not permitted in the iot profile"))
        }
        _ => Ok(()),
    }
}

async fn bridge_relay(ctx: &ToolContext, name: &str, input_raw: &str) -> Result<String, String> {
    if !ctx.safety.allow_bridge_call(now_secs()) {
        return Err("Bridge rate limit reached (30 calls/minute); wait before retrying".to_string());
    }
    crate::bridge::call_tool(ctx, name, input_raw).await
}

struct PublishMqttTool;

#[async_trait::async_trait]
impl Tool for PublishMqttTool {
    fn name(&self) -> &str {
        "publish_mqtt"
    }

    fn description(&self) -> &str {
        "Publish a payload to an MQTT topic."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"topic":{"type":"string","description":"Topic to publish to"},"payload":{"type":"string","description":"Message payload"}},"required":["topic","payload"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let topic = require_str(input_raw, "topic")?;
        require_str(input_raw, "payload")?;
        if topic.is_empty() {
            return Err("topic cannot be empty".to_string());
        }
        bridge_relay(ctx, "publish_mqtt", input_raw).await
    }
}

struct SubscribeMqttTool;

#[async_trait::async_trait]
impl Tool for SubscribeMqttTool {
    fn name(&self) -> &str {
        "subscribe_mqtt"
    }

    fn description(&self) -> &str {
        "Subscribe to an MQTT topic and return the next message."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"topic":{"type":"string","description":"Topic to subscribe to"},"timeout_s":{"type":"integer","description":"Seconds to wait (default 10)"}},"required":["topic"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let topic = require_str(input_raw, "topic")?;
        if topic.is_empty() {
            return Err("topic cannot be empty".to_string());
        }
        bridge_relay(ctx, "subscribe_mqtt", input_raw).await
    }
}

struct HttpRequestTool;

#[async_trait::async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP request and return the response body."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"method":{"type":"string","description":"GET, POST, PUT, or DELETE"},"url":{"type":"string","description":"Request URL"},"body":{"type":"string","description":"Optional request body"}},"required":["method","url"]}"#
    }

    async fn execute(&self, input_raw: &str, _ctx: &ToolContext) -> Result<String, String> {
        let method_arg = require_str(input_raw, "method")?;
        let url = require_str(input_raw, "url")?;
        let method = match method_arg.to_ascii_uppercase().as_str() {
            "GET" => reqwest::Method::GET,
            "POST" => reqwest::Method::POST,
            "PUT" => reqwest::Method::PUT,
            "DELETE" => reqwest::Method::DELETE,
            other => return Err(format!("Unsupported method: {other}")),
        };
        let client = reqwest::Client::new();
        let mut request = client.request(method, &url);
        if let Some(body) = optional_str(input_raw, "body") {
            request = request.body(body);
        }
        let response = request.send().await.map_err(|e| format!("Request failed: {e}"))?;
        let status = response.status().as_u16();
        let mut body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {e}"))?;
        if body.len() > MAX_HTTP_OUTPUT {
            let mut end = MAX_HTTP_OUTPUT;
            while end > 0 && !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push_str("\n... truncated");
        }
        Ok(format!("HTTP {status}\n{body}"))
    }
}

struct DeviceInfoTool;

#[async_trait::async_trait]
impl Tool for DeviceInfoTool {
    fn name(&self) -> &str {
        "device_info"
    }

    fn description(&self) -> &str {
        "Report the host OS, architecture, and working directory."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{}}"#
    }

    async fn execute(&self, _input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        Ok(format!(
            "os: {}\narch: {}\nhostname: {}\nworkspace: {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            ctx.paths.workspace().display(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejects_shell_and_writes() {
        assert!(policy_gate("bash").is_err());
        assert!(policy_gate("write_file").is_err());
        assert!(policy_gate("edit_file").is_err());
        assert!(policy_gate("apply_patch").is_err());
        assert!(policy_gate("publish_mqtt").is_ok());
        assert!(policy_gate("kv_get").is_ok());
    }

    #[tokio::test]
    async fn mqtt_requires_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::for_tests(dir.path().to_path_buf());
        let err = PublishMqttTool
            .execute(r#"{"topic": "home/led", "payload": "on"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("bridge"), "{err}");
        // Parameter checks run before the relay.
        let err = PublishMqttTool
            .execute(r#"{"topic": "home/led"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("Missing 'payload'"), "{err}");
    }

    #[tokio::test]
    async fn device_info_reports_host() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::for_tests(dir.path().to_path_buf());
        let info = DeviceInfoTool.execute("{}", &ctx).await.unwrap();
        assert!(info.contains("os:"));
        assert!(info.contains("arch:"));
    }
}
