//! Tool dispatch.
//!
//! The primary tool table is selected at build time (coding / iot /
//! robotics features); a table of shared tools is consulted first, and
//! names known to neither fall through to the external bridge. Tool
//! failures never abort the agent loop: they come back as
//! `ToolResult { is_error: true }` observations.
//!
//! Tool inputs are the verbatim `input_raw` object string from the model;
//! tools read their parameters with the byte-level codec, so no JSON
//! document tree is ever built for a call.

pub mod policy;
pub mod shared;

#[cfg(feature = "profile-coding")]
pub mod coding;
#[cfg(feature = "profile-iot")]
pub mod iot;
#[cfg(feature = "profile-robotics")]
pub mod robotics;

use std::path::PathBuf;

use crate::config::{Config, BRIDGE_SOCKET, KV_DIR};
use crate::json;
use crate::llm::types::ToolDef;
use crate::transport::{RemoteEndpoint, TransportKind};
use policy::{PathPolicy, SafetyState};

/// The outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Read a required string parameter from a tool input object.
pub(crate) fn require_str(input_raw: &str, key: &str) -> Result<String, String> {
    optional_str(input_raw, key).ok_or_else(|| format!("Missing '{key}' parameter"))
}

/// Read an optional string parameter, decoded for the handler.
pub(crate) fn optional_str(input_raw: &str, key: &str) -> Option<String> {
    json::extract_string(input_raw, key).map(json::unescape)
}

/// Every tool implements this.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to call the tool.
    fn name(&self) -> &str;

    /// Description advertised in the request tool table.
    fn description(&self) -> &str;

    /// Raw JSON Schema for the tool input, embedded at build time.
    fn schema(&self) -> &'static str;

    /// Run the tool against the verbatim input object string.
    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String>;
}

/// Long-lived state threaded through every tool call.
pub struct ToolContext {
    pub paths: PathPolicy,
    pub safety: SafetyState,
    pub kv_dir: PathBuf,
    pub bridge: Option<RemoteEndpoint>,
}

impl ToolContext {
    pub fn from_config(config: &Config) -> Self {
        let app_dir = config.app_dir();

        #[cfg(feature = "sandbox")]
        let (workspace, extra_roots) = {
            let sandbox = app_dir.join(crate::config::SANDBOX_DIR);
            let _ = std::fs::create_dir_all(&sandbox);
            (sandbox, Vec::new())
        };
        #[cfg(not(feature = "sandbox"))]
        let (workspace, extra_roots) = (
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            vec![std::env::temp_dir()],
        );

        // Non-HTTP carriers double as the bridge connection; on HTTP the
        // bridge is reachable only if its socket is present.
        let bridge_socket = app_dir.join(BRIDGE_SOCKET);
        let bridge = match config.transport {
            TransportKind::Serial => Some(RemoteEndpoint::Serial {
                port: config.serial_port.clone().unwrap_or_default(),
                baud: config.serial_baud,
            }),
            TransportKind::Ble => Some(RemoteEndpoint::Ble {
                socket_path: bridge_socket,
            }),
            TransportKind::Http if bridge_socket.exists() => Some(RemoteEndpoint::Ble {
                socket_path: bridge_socket,
            }),
            TransportKind::Http => None,
        };

        Self {
            paths: PathPolicy::new(workspace, extra_roots),
            safety: SafetyState::default(),
            kv_dir: app_dir.join(KV_DIR),
            bridge,
        }
    }

    #[cfg(test)]
    pub fn for_tests(workspace: PathBuf) -> Self {
        Self {
            kv_dir: workspace.join(crate::config::APP_DIR).join(KV_DIR),
            paths: PathPolicy::new(workspace, Vec::new()),
            safety: SafetyState::default(),
            bridge: None,
        }
    }
}

/// Looks tools up by name and runs them under the profile policy.
pub struct Dispatcher {
    shared: Vec<Box<dyn Tool>>,
    profile: Vec<Box<dyn Tool>>,
    ctx: ToolContext,
}

impl Dispatcher {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            shared: shared::tools(),
            profile: profile_tools(),
            ctx,
        }
    }

    /// Definitions sent with every model request: shared tools plus the
    /// built-in profile table.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.shared
            .iter()
            .chain(self.profile.iter())
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema().to_string(),
            })
            .collect()
    }

    /// Map one tool-use block to a result.
    pub async fn execute(&self, name: &str, input_raw: &str) -> ToolResult {
        if let Err(denied) = profile_policy_gate(name, &self.ctx) {
            return ToolResult::error(denied);
        }

        let input_raw = if input_raw.trim().is_empty() {
            "{}"
        } else {
            input_raw
        };

        let tool = self
            .shared
            .iter()
            .chain(self.profile.iter())
            .find(|t| t.name() == name);
        match tool {
            Some(tool) => match tool.execute(input_raw, &self.ctx).await {
                Ok(output) => ToolResult::ok(output),
                Err(error) => ToolResult::error(error),
            },
            // Unknown tools fall through to the external bridge.
            None => match crate::bridge::call_tool(&self.ctx, name, input_raw).await {
                Ok(output) => ToolResult::ok(output),
                Err(error) => ToolResult::error(error),
            },
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }
}

#[cfg(feature = "profile-coding")]
fn profile_tools() -> Vec<Box<dyn Tool>> {
    coding::tools()
}

#[cfg(all(feature = "profile-iot", not(feature = "profile-coding")))]
fn profile_tools() -> Vec<Box<dyn Tool>> {
    iot::tools()
}

#[cfg(all(
    feature = "profile-robotics",
    not(any(feature = "profile-coding", feature = "profile-iot"))
))]
fn profile_tools() -> Vec<Box<dyn Tool>> {
    robotics::tools()
}

#[cfg(not(any(
    feature = "profile-coding",
    feature = "profile-iot",
    feature = "profile-robotics"
)))]
fn profile_tools() -> Vec<Box<dyn Tool>> {
    Vec::new()
}

#[cfg(feature = "profile-coding")]
fn profile_policy_gate(_name: &str, _ctx: &ToolContext) -> Result<(), String> {
    Ok(())
}

#[cfg(all(feature = "profile-iot", not(feature = "profile-coding")))]
fn profile_policy_gate(name: &str, _ctx: &ToolContext) -> Result<(), String> {
    iot::policy_gate(name)
}

#[cfg(all(
    feature = "profile-robotics",
    not(any(feature = "profile-coding", feature = "profile-iot"))
))]
fn profile_policy_gate(name: &str, ctx: &ToolContext) -> Result<(), String> {
    robotics::policy_gate(name, ctx)
}

#[cfg(not(any(
    feature = "profile-coding",
    feature = "profile-iot",
    feature = "profile-robotics"
)))]
fn profile_policy_gate(_name: &str, _ctx: &ToolContext) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_without_bridge_is_an_error_observation() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(ToolContext::for_tests(dir.path().to_path_buf()));
        let result = dispatcher.execute("no_such_tool", "{}").await;
        assert!(result.is_error);
        assert!(result.output.contains("bridge"));
    }

    #[tokio::test]
    async fn missing_parameters_are_error_observations() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(ToolContext::for_tests(dir.path().to_path_buf()));
        let result = dispatcher.execute("kv_get", "{}").await;
        assert!(result.is_error);
        assert!(result.output.contains("Missing 'key'"));
        // Garbage input reads as an object with no recognisable keys.
        let result = dispatcher.execute("kv_get", "{not json").await;
        assert!(result.is_error);
        assert!(result.output.contains("Missing 'key'"));
    }

    #[tokio::test]
    async fn shared_table_is_consulted_first() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(ToolContext::for_tests(dir.path().to_path_buf()));
        let result = dispatcher.execute("time", "{}").await;
        assert!(!result.is_error, "{}", result.output);
        let defs = dispatcher.definitions();
        assert!(defs.iter().any(|d| d.name == "time"));
        assert!(defs.iter().any(|d| d.name == "kv_set"));
    }

    #[test]
    fn parameter_helpers_decode_escapes() {
        assert_eq!(
            require_str(r#"{"command":"echo \"hi\""}"#, "command").unwrap(),
            r#"echo "hi""#
        );
        assert!(require_str("{}", "command").is_err());
        assert_eq!(
            optional_str(r#"{"path":"a\nb"}"#, "path"),
            Some("a\nb".to_string())
        );
        assert_eq!(optional_str("{}", "path"), None);
    }
}
