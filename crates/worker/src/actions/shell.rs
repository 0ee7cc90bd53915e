//! Shell and python actions.
//!
//! Shell: `{command, args?, env?}` or `{script}` run through `sh -c`.
//! Python: `{script}` run through `python3 -c`. Both capture stdout and
//! stderr; a non-zero exit is a logical action error. Stdout that parses
//! as JSON is surfaced under `data` so scripts can return structured
//! results.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use playmill_core::{ActionKind, ErrorObject};

use super::{Action, ActionInvocation};

pub struct ShellAction;

#[async_trait]
impl Action for ShellAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Shell
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        let mut command = if let Some(program) = invocation.config_str("command") {
            let mut command = Command::new(program);
            if let Some(Value::Array(args)) = invocation.config.get("args") {
                for arg in args {
                    command.arg(match arg {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
            }
            command
        } else if let Some(script) = invocation.config_str("script") {
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            command
        } else {
            return Err(
                ErrorObject::validation("shell action requires `command` or `script`")
                    .with_retryable(false),
            );
        };

        if let Some(Value::Object(env)) = invocation.config.get("env") {
            for (name, value) in env {
                if let Some(value) = value.as_str() {
                    command.env(name, value);
                }
            }
        }

        run_process(command).await
    }
}

pub struct PythonAction;

#[async_trait]
impl Action for PythonAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Python
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        let script = invocation.config_str("script").ok_or_else(|| {
            ErrorObject::validation("python action requires `script`").with_retryable(false)
        })?;

        let mut command = Command::new("python3");
        command.arg("-c").arg(script);
        if let Some(Value::Object(env)) = invocation.config.get("env") {
            for (name, value) in env {
                if let Some(value) = value.as_str() {
                    command.env(name, value);
                }
            }
        }
        run_process(command).await
    }
}

async fn run_process(mut command: Command) -> Result<Value, ErrorObject> {
    command.kill_on_drop(true);
    let output = command.output().await.map_err(|e| {
        ErrorObject::transport(format!("failed to spawn process: {e}")).with_source("shell")
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
        return Err(
            ErrorObject::action(format!("process exited with {exit_code}: {tail}"))
                .with_source("shell"),
        );
    }

    let data = serde_json::from_str::<Value>(stdout.trim()).unwrap_or(Value::Null);
    Ok(json!({
        "exit_code": exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "data": data,
    }))
}
