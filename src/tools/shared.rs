//! Tools available in every profile: clock, the file-backed KV store, and
//! the bridge-delegated capabilities (web search, session control, OTA).

use super::policy::{now_secs, validate_kv_key};
use super::{require_str, Tool, ToolContext};

pub fn tools() -> Vec<Box<dyn Tool>> {
    let mut all: Vec<Box<dyn Tool>> = vec![
        Box::new(TimeTool),
        Box::new(KvGetTool),
        Box::new(KvSetTool),
    ];
    for &(name, description, schema) in BRIDGE_TOOLS {
        all.push(Box::new(BridgeTool {
            name,
            description,
            schema,
        }));
    }
    all
}

struct TimeTool;

#[async_trait::async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Get the current date and time."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{}}"#
    }

    async fn execute(&self, _input_raw: &str, _ctx: &ToolContext) -> Result<String, String> {
        Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z").to_string())
    }
}

struct KvGetTool;

#[async_trait::async_trait]
impl Tool for KvGetTool {
    fn name(&self) -> &str {
        "kv_get"
    }

    fn description(&self) -> &str {
        "Read a value from the persistent key-value store."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"key":{"type":"string","description":"Key to read"}},"required":["key"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let key = require_str(input_raw, "key")?;
        validate_kv_key(&key)?;
        match std::fs::read_to_string(ctx.kv_dir.join(&key)) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(format!("Key not found: {key}"))
            }
            Err(e) => Err(format!("Cannot read key {key}: {e}")),
        }
    }
}

struct KvSetTool;

#[async_trait::async_trait]
impl Tool for KvSetTool {
    fn name(&self) -> &str {
        "kv_set"
    }

    fn description(&self) -> &str {
        "Write a value to the persistent key-value store."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"key":{"type":"string","description":"Key to write"},"value":{"type":"string","description":"Value to store"}},"required":["key","value"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let key = require_str(input_raw, "key")?;
        let value = require_str(input_raw, "value")?;
        validate_kv_key(&key)?;
        std::fs::create_dir_all(&ctx.kv_dir)
            .map_err(|e| format!("Cannot create store: {e}"))?;
        std::fs::write(ctx.kv_dir.join(&key), &value)
            .map_err(|e| format!("Cannot write key {key}: {e}"))?;
        Ok(format!("Stored {key} ({} bytes)", value.len()))
    }
}

/// Definitions of the bridge-delegated shared tools. Execution is remoted
/// through the envelope protocol; the runtime only rate-limits and relays
/// the verbatim input.
const BRIDGE_TOOLS: &[(&str, &str, &str)] = &[
    (
        "web_search",
        "Search the web and return result snippets.",
        r#"{"type":"object","properties":{"query":{"type":"string","description":"Search query"}},"required":["query"]}"#,
    ),
    (
        "session_list",
        "List agent sessions known to the bridge.",
        r#"{"type":"object","properties":{}}"#,
    ),
    (
        "session_send",
        "Send a message to another agent session.",
        r#"{"type":"object","properties":{"session_id":{"type":"string"},"message":{"type":"string"}},"required":["session_id","message"]}"#,
    ),
    (
        "ota_check",
        "Check whether a firmware/agent update is available.",
        r#"{"type":"object","properties":{}}"#,
    ),
    (
        "ota_apply",
        "Download and apply an update.",
        r#"{"type":"object","properties":{"version":{"type":"string","description":"Version to apply"}},"required":["version"]}"#,
    ),
];

struct BridgeTool {
    name: &'static str,
    description: &'static str,
    schema: &'static str,
}

#[async_trait::async_trait]
impl Tool for BridgeTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn schema(&self) -> &'static str {
        self.schema
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        if !ctx.safety.allow_bridge_call(now_secs()) {
            return Err("Bridge rate limit reached (30 calls/minute); wait before retrying"
                .to_string());
        }
        crate::bridge::call_tool(ctx, self.name, input_raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::for_tests(dir.path().to_path_buf());
        (dir, ctx)
    }

    #[tokio::test]
    async fn kv_round_trip() {
        let (_dir, ctx) = ctx();
        KvSetTool
            .execute(r#"{"key": "note.1", "value": "hello"}"#, &ctx)
            .await
            .unwrap();
        let value = KvGetTool
            .execute(r#"{"key": "note.1"}"#, &ctx)
            .await
            .unwrap();
        assert_eq!(value, "hello");
        // The entry is a plain file under the store directory.
        assert!(ctx.kv_dir.join("note.1").is_file());
    }

    #[tokio::test]
    async fn kv_values_are_decoded_before_storage() {
        let (_dir, ctx) = ctx();
        KvSetTool
            .execute(r#"{"key": "esc", "value": "line\nbreak"}"#, &ctx)
            .await
            .unwrap();
        let stored = std::fs::read_to_string(ctx.kv_dir.join("esc")).unwrap();
        assert_eq!(stored, "line\nbreak");
    }

    #[tokio::test]
    async fn kv_rejects_bad_keys_before_touching_disk() {
        let (_dir, ctx) = ctx();
        for key in ["../escape", "a/b", "", "bad key"] {
            let input = format!(r#"{{"key": "{key}", "value": "x"}}"#);
            let err = KvSetTool.execute(&input, &ctx).await.unwrap_err();
            assert!(err.contains("Invalid key"), "{key}: {err}");
        }
        // Nothing was created on any rejected call.
        assert!(!ctx.kv_dir.exists());
    }

    #[tokio::test]
    async fn kv_get_missing_key() {
        let (_dir, ctx) = ctx();
        let err = KvGetTool
            .execute(r#"{"key": "absent"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn bridge_tools_fail_cleanly_without_bridge() {
        let (_dir, ctx) = ctx();
        let search = BridgeTool {
            name: "web_search",
            description: "",
            schema: "{}",
        };
        let err = search
            .execute(r#"{"query": "rust"}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("bridge"), "{err}");
    }
}
