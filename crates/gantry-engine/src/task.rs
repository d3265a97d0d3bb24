use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use gantry_core::error::{GantryError, Result};
use gantry_core::Context;
use gantry_graph::TaskBody;

use crate::run_log::RunLog;

/// Captured result of one task-body invocation.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// Process exit code (-1 when terminated by signal).
    pub exit_code: i32,
    /// Full stdout, newline-joined.
    pub stdout: String,
    /// Combined stdout+stderr lines in arrival order.
    pub lines: Vec<String>,
}

impl TaskOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last combined-output line parseable as a JSON object, scanning
    /// backward. Task bodies use this as a context patch channel in
    /// addition to any declared output variable.
    pub fn last_json_object(&self) -> Option<serde_json::Value> {
        self.lines.iter().rev().find_map(|line| {
            serde_json::from_str::<serde_json::Value>(line.trim())
                .ok()
                .filter(|v| v.is_object())
        })
    }
}

/// Run a task body as a child process.
///
/// The entire context is exported as `VAR_<key>` environment variables.
/// Combined output is pumped into the run log line-by-line as it arrives.
/// A script path is preferred over a raw command; commands run via `sh -c`.
pub async fn run_task(
    node_id: &str,
    task: &TaskBody,
    ctx: &Context,
    log: &RunLog,
    timeout_secs: Option<u64>,
) -> Result<TaskOutput> {
    let mut cmd = if let Some(script) = task.script.as_deref().filter(|s| !s.is_empty()) {
        debug!(node = node_id, script, "Spawning task script");
        Command::new(script)
    } else if let Some(command) = task.command.as_deref().filter(|s| !s.is_empty()) {
        debug!(node = node_id, command, "Spawning task command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    } else {
        return Err(node_error(node_id, "task body has no script or command"));
    };

    cmd.envs(ctx.env_vars())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| node_error(node_id, &format!("failed to spawn task: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| node_error(node_id, "child stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| node_error(node_id, "child stderr unavailable"))?;

    let (status, stdout_buf, lines) = match timeout_secs {
        Some(secs) => {
            let pumped =
                tokio::time::timeout(Duration::from_secs(secs), pump(&mut child, stdout, stderr, log))
                    .await;
            match pumped {
                Ok(result) => {
                    result.map_err(|e| node_error(node_id, &format!("task I/O failed: {}", e)))?
                }
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(GantryError::TaskTimeout {
                        node: node_id.to_string(),
                        timeout_secs: secs,
                    });
                }
            }
        }
        None => pump(&mut child, stdout, stderr, log)
            .await
            .map_err(|e| node_error(node_id, &format!("task I/O failed: {}", e)))?,
    };

    Ok(TaskOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_buf,
        lines,
    })
}

/// Consume both output streams line-by-line until EOF, then reap the child.
async fn pump(
    child: &mut Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    log: &RunLog,
) -> std::io::Result<(std::process::ExitStatus, String, Vec<String>)> {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut stdout_buf = String::new();
    let mut combined = Vec::new();
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line? {
                Some(line) => {
                    log.info(&line);
                    stdout_buf.push_str(&line);
                    stdout_buf.push('\n');
                    combined.push(line);
                }
                None => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line? {
                Some(line) => {
                    log.info(&line);
                    combined.push(line);
                }
                None => err_done = true,
            },
        }
    }

    let status = child.wait().await?;
    Ok((status, stdout_buf, combined))
}

fn node_error(node_id: &str, message: &str) -> GantryError {
    GantryError::Node {
        node: node_id.to_string(),
        message: message.to_string(),
    }
}
