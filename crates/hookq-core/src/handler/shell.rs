//! Handlers backed by external commands.
//!
//! # Protocol
//! - stdin: `{"action_id", "hook", "args", "attempt", "group"}` as JSON.
//! - env: `HOOKQ_ROOT`, `HOOKQ_ACTION_ID`, `HOOKQ_HOOK`; cwd is the root.
//! - exit 0 is success; stdout is the result (JSON if it parses, otherwise
//!   the trimmed text, `null` when empty).
//! - any other exit is a handler failure carrying an output excerpt.
//!
//! The child is killed when the runner raises the cancel flag.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Handler, HandlerContext, HandlerError, HandlerFuture};
use crate::error::{HookqError, Result};

/// Longest output excerpt carried in a failure message.
const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ShellHandler {
    program: PathBuf,
    args: Vec<String>,
    root: PathBuf,
}

impl ShellHandler {
    /// Resolve `command` now so a missing binary fails at registration.
    /// Commands containing a path separator resolve against `root`; bare
    /// names are looked up on `PATH`.
    pub fn new(command: &str, args: Vec<String>, root: &Path) -> Result<Self> {
        let command = command.trim();
        let program = if command.contains(std::path::MAIN_SEPARATOR) || command.contains('/') {
            let candidate = root.join(command);
            if !candidate.is_file() {
                return Err(HookqError::CommandNotFound(command.to_string()));
            }
            candidate
        } else {
            which::which(command).map_err(|_| HookqError::CommandNotFound(command.to_string()))?
        };
        Ok(Self {
            program,
            args,
            root: root.to_path_buf(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Handler for ShellHandler {
    fn call(&self, ctx: HandlerContext) -> HandlerFuture {
        let program = self.program.clone();
        let args = self.args.clone();
        let root = self.root.clone();
        Box::pin(async move { run_command(&program, &args, &root, ctx).await })
    }
}

async fn run_command(
    program: &Path,
    args: &[String],
    root: &Path,
    ctx: HandlerContext,
) -> std::result::Result<Value, HandlerError> {
    let payload = serde_json::to_vec(&json!({
        "action_id": ctx.action_id,
        "hook": ctx.hook,
        "args": ctx.args,
        "attempt": ctx.attempt,
        "group": ctx.group,
    }))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(root)
        .env("HOOKQ_ROOT", root)
        .env("HOOKQ_ACTION_ID", ctx.action_id.to_string())
        .env("HOOKQ_HOOK", &ctx.hook)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HandlerError::new(format!("failed to spawn {}: {e}", program.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        // a command that ignores stdin may exit before reading it
        if let Err(e) = stdin.write_all(&payload).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(HandlerError::new(format!("failed to write stdin: {e}")));
            }
        }
    }

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = ctx.cancel.cancelled() => {
            return Err(HandlerError::new(format!(
                "{} killed after exceeding its execution budget",
                program.display()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let source = if stderr.trim().is_empty() { &stdout } else { &stderr };
        let excerpt: String = source.trim().chars().take(EXCERPT_CHARS).collect();
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(HandlerError::new(format!("exit {code}: {excerpt}")));
    }

    let text = stdout.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
