use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::{Result, SupervisorError};

// ─── CommandSpec ──────────────────────────────────────────────────────────

/// One invocation of an external collaborator program.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Build from an argv list; the first element is the program.
    pub fn from_argv(argv: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::Config("empty command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            cwd: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

// ─── run ──────────────────────────────────────────────────────────────────

/// Run a command to completion under its timeout.
///
/// Stdout is collected in full. Stderr is drained by a background task and
/// surfaced in the error when the process exits non-zero. On timeout the
/// child is killed.
pub async fn run(spec: &CommandSpec) -> Result<CommandOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| SupervisorError::CommandFailed {
        program: spec.program.clone(),
        message: "stdout not captured".into(),
    })?;
    let stdout_task = tokio::spawn(async move {
        let mut out = String::new();
        BufReader::new(stdout).read_to_string(&mut out).await.map(|_| out)
    });

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_task = child.stderr.take().map(|stderr| {
        let buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Ok(mut b) = buf.lock() {
                    if !b.is_empty() {
                        b.push('\n');
                    }
                    b.push_str(&line);
                }
            }
        })
    });

    let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(SupervisorError::Timeout {
                what: format!("'{}'", spec.program),
                after: spec.timeout,
            });
        }
    };

    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();

    if !status.success() {
        let head = match status.code() {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        };
        let message = if stderr.is_empty() {
            head
        } else {
            format!("{head}\nstderr: {stderr}")
        };
        return Err(SupervisorError::CommandFailed {
            program: spec.program.clone(),
            message,
        });
    }

    let stdout = stdout_task
        .await
        .map_err(|e| SupervisorError::CommandFailed {
            program: spec.program.clone(),
            message: format!("stdout reader failed: {e}"),
        })??;

    Ok(CommandOutput { stdout, stderr })
}

// ─── Tests ────────────────────────────────────────────────────────────────
