//! Robotics profile: bounded motion commands behind an estop latch.
//!
//! Bounds are validated locally, the 10-per-second ring is consulted, and
//! only then does the command go to the bridge, which owns the actuators.
//! Once `estop` fires, every robot command is refused until an explicit
//! reset.

use crate::json;

use super::policy::now_secs;
use super::{require_str, Tool, ToolContext};

pub const MAX_POSE: f64 = 1000.0;
pub const MAX_VELOCITY: f64 = 500.0;

pub fn tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(RobotCmdTool),
        Box::new(EstopTool),
        Box::new(TelemetryTool),
    ]
}

pub fn policy_gate(name: &str, ctx: &ToolContext) -> Result<(), String> {
    if name == "robot_cmd" && ctx.safety.estop_active() {
        return Err("Emergency stop is active; reset with the estop tool first".to_string());
    }
    Ok(())
}

fn check_axes(input_raw: &str, bound: f64, what: &str) -> Result<(), String> {
    for axis in ["x", "y", "z"] {
        if let Some(v) = json::extract_f64(input_raw, axis) {
            if !v.is_finite() || v.abs() > bound {
                return Err(format!("{what} {axis}={v} out of range (|{axis}| <= {bound})"));
            }
        }
    }
    Ok(())
}

struct RobotCmdTool;

#[async_trait::async_trait]
impl Tool for RobotCmdTool {
    fn name(&self) -> &str {
        "robot_cmd"
    }

    fn description(&self) -> &str {
        "Send a bounded motion command: pose, velocity, or gripper."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"cmd_type":{"type":"string","enum":["pose","velocity","gripper"],"description":"Command kind"},"x":{"type":"number"},"y":{"type":"number"},"z":{"type":"number"},"grip":{"type":"number","description":"Gripper position in [0,1]"}},"required":["cmd_type"]}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let cmd_type = require_str(input_raw, "cmd_type")?;

        if ctx.safety.estop_active() {
            return Err("Emergency stop is active; reset with the estop tool first".to_string());
        }
        match cmd_type.as_str() {
            "pose" => check_axes(input_raw, MAX_POSE, "pose")?,
            "velocity" => check_axes(input_raw, MAX_VELOCITY, "velocity")?,
            "gripper" => {
                let grip = json::extract_f64(input_raw, "grip")
                    .ok_or_else(|| "gripper command requires 'grip'".to_string())?;
                if !grip.is_finite() || !(0.0..=1.0).contains(&grip) {
                    return Err(format!("grip={grip} out of range [0,1]"));
                }
            }
            other => return Err(format!("Unknown cmd_type: {other}")),
        }
        if !ctx.safety.allow_robot_command(now_secs()) {
            return Err("Robot command rate limit reached (10/s)".to_string());
        }
        crate::bridge::call_tool(ctx, "robot_cmd", input_raw).await
    }
}

struct EstopTool;

#[async_trait::async_trait]
impl Tool for EstopTool {
    fn name(&self) -> &str {
        "estop"
    }

    fn description(&self) -> &str {
        "Engage the emergency stop, or clear it with reset=true."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{"reset":{"type":"boolean","description":"Clear the latch instead of setting it"}}}"#
    }

    async fn execute(&self, input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        let reset = json::extract_bool(input_raw, "reset").unwrap_or(false);
        ctx.safety.set_estop(!reset);
        if reset {
            Ok("Emergency stop cleared".to_string())
        } else {
            // Best effort: tell the bridge to halt the hardware too. The
            // latch is already set either way.
            let _ = crate::bridge::call_tool(ctx, "estop", "{}").await;
            Ok("Emergency stop engaged; robot commands are blocked".to_string())
        }
    }
}

struct TelemetryTool;

#[async_trait::async_trait]
impl Tool for TelemetryTool {
    fn name(&self) -> &str {
        "telemetry_snapshot"
    }

    fn description(&self) -> &str {
        "Fetch the current robot telemetry snapshot."
    }

    fn schema(&self) -> &'static str {
        r#"{"type":"object","properties":{}}"#
    }

    async fn execute(&self, _input_raw: &str, ctx: &ToolContext) -> Result<String, String> {
        crate::bridge::call_tool(ctx, "telemetry_snapshot", "{}").await
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
    async fn bounds_are_enforced_before_the_bridge() {
        let (_dir, ctx) = ctx();
        let err = RobotCmdTool
            .execute(r#"{"cmd_type": "pose", "x": 1500.0}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("out of range"), "{err}");
        let err = RobotCmdTool
            .execute(r#"{"cmd_type": "velocity", "y": -501.0}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("out of range"));
        let err = RobotCmdTool
            .execute(r#"{"cmd_type": "gripper", "grip": 1.5}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("out of range"));
        // In-bounds commands reach the bridge check (and fail there,
        // since no bridge is connected in tests).
        let err = RobotCmdTool
            .execute(
                r#"{"cmd_type": "pose", "x": 10.0, "y": 0.0, "z": -999.9}"#,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.contains("bridge"), "{err}");
    }

    #[tokio::test]
    async fn estop_latches_until_reset() {
        let (_dir, ctx) = ctx();
        EstopTool.execute("{}", &ctx).await.unwrap();
        for _ in 0..3 {
            let err = RobotCmdTool
                .execute(r#"{"cmd_type": "pose", "x": 1.0}"#, &ctx)
                .await
                .unwrap_err();
            assert!(err.contains("Emergency stop"), "{err}");
        }
        assert!(policy_gate("robot_cmd", &ctx).is_err());
        EstopTool
            .execute(r#"{"reset": true}"#, &ctx)
            .await
            .unwrap();
        assert!(policy_gate("robot_cmd", &ctx).is_ok());
        // Commands run again (up to the missing bridge).
        let err = RobotCmdTool
            .execute(r#"{"cmd_type": "pose", "x": 1.0}"#, &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("bridge"));
    }

    #[tokio::test]
    async fn command_rate_is_capped() {
        let (_dir, ctx) = ctx();
        let now = now_secs();
        let mut allowed = 0;
        for _ in 0..12 {
            if ctx.safety.allow_robot_command(now) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
