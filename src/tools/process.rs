//! Long-lived child processes that outlive a single tool call.
//!
//! [`ProcessManager`] owns every child it starts and hands out opaque ids.
//! Each process keeps a bounded tail of its stdout and stderr, filled by a
//! reader task, so a later `poll` can report recent output without blocking.
//! [`process_tool`] exposes the manager to the model as one tool.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::tool::{AgentTool, Tool};
use super::types::AgentToolParameters;
use crate::error::TillerError;
use crate::types::ToolResult;

const OUTPUT_TAIL_BYTES: usize = 16_384;
const TOOL_NAME: &str = "process";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited { code: Option<i32> },
}

/// Snapshot of a managed process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub id: String,
    pub command: String,
    #[serde(flatten)]
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    /// Most recent stdout, capped at a fixed number of bytes.
    pub stdout: String,
    pub stderr: String,
}

type OutputTail = Arc<Mutex<String>>;

struct ManagedProcess {
    command: String,
    child: Child,
    started_at: DateTime<Utc>,
    stdout: OutputTail,
    stderr: OutputTail,
}

impl ManagedProcess {
    fn snapshot(&self, id: &str, state: ProcessState) -> ProcessStatus {
        ProcessStatus {
            id: id.to_string(),
            command: self.command.clone(),
            state,
            started_at: self.started_at,
            stdout: read_tail(&self.stdout),
            stderr: read_tail(&self.stderr),
        }
    }
}

/// Arena of child processes keyed by id.
#[derive(Default)]
pub struct ProcessManager {
    processes: tokio::sync::Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` through `sh -c` and return its id.
    pub async fn start(&self, command: &str, cwd: Option<&Path>) -> Result<String, TillerError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TillerError::tool(TOOL_NAME, format!("failed to start '{command}': {e}")))?;

        let stdout = OutputTail::default();
        let stderr = OutputTail::default();
        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(pump(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(pump(pipe, stderr.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        info!(process_id = %id, pid = ?child.id(), command, "process started");
        self.processes.lock().await.insert(
            id.clone(),
            ManagedProcess {
                command: command.to_string(),
                child,
                started_at: Utc::now(),
                stdout,
                stderr,
            },
        );
        Ok(id)
    }

    /// Current state and output tail, without waiting.
    pub async fn poll(&self, id: &str) -> Result<ProcessStatus, TillerError> {
        let mut processes = self.processes.lock().await;
        let process = processes.get_mut(id).ok_or_else(|| unknown_process(id))?;
        let state = match process.child.try_wait() {
            Ok(Some(status)) => ProcessState::Exited {
                code: status.code(),
            },
            Ok(None) => ProcessState::Running,
            Err(e) => return Err(TillerError::tool(TOOL_NAME, e.to_string())),
        };
        Ok(process.snapshot(id, state))
    }

    /// Kill the process if still running, reap it and forget its id.
    pub async fn terminate(&self, id: &str) -> Result<ProcessStatus, TillerError> {
        let mut process = self
            .processes
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| unknown_process(id))?;

        if let Err(e) = process.child.start_kill() {
            debug!(process_id = %id, error = %e, "kill skipped");
        }
        let status = process
            .child
            .wait()
            .await
            .map_err(|e| TillerError::tool(TOOL_NAME, e.to_string()))?;
        info!(process_id = %id, code = ?status.code(), "process terminated");
        Ok(process.snapshot(id, ProcessState::Exited {
            code: status.code(),
        }))
    }

    /// Ids of every process not yet terminated.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager").finish_non_exhaustive()
    }
}

fn unknown_process(id: &str) -> TillerError {
    TillerError::tool(TOOL_NAME, format!("unknown process id: {id}"))
}

async fn pump<R: AsyncRead + Unpin>(mut pipe: R, tail: OutputTail) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                tail.push_str(&chunk);
                keep_last(&mut tail, OUTPUT_TAIL_BYTES);
            }
        }
    }
}

fn read_tail(tail: &OutputTail) -> String {
    tail.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Drop leading bytes so at most `max_bytes` remain, on a char boundary.
fn keep_last(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = s.len() - max_bytes;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
}

/// Tool exposing `start`, `poll` and `terminate` on `manager`.
pub fn process_tool(manager: Arc<ProcessManager>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        TOOL_NAME,
        "Manage background shell processes: start a command, poll its output, or terminate it",
        AgentToolParameters::object()
            .string_enum(
                "action",
                "What to do",
                &["start", "poll", "terminate"],
                true,
            )
            .string("command", "Shell command to run (start)", false)
            .string("cwd", "Working directory (start)", false)
            .string("id", "Process id returned by start (poll, terminate)", false)
            .build(),
        move |args, _ctx| {
            let manager = manager.clone();
            async move {
                let status = match args.get_str("action")? {
                    "start" => {
                        let command = args.get_str("command")?;
                        let id = manager
                            .start(command, args.get_str_opt("cwd").map(Path::new))
                            .await?;
                        manager.poll(&id).await?
                    }
                    "poll" => manager.poll(args.get_str("id")?).await?,
                    "terminate" => manager.terminate(args.get_str("id")?).await?,
                    other => {
                        return Err(TillerError::InvalidArgument(format!(
                            "unsupported action: {other}"
                        )))
                    }
                };
                Ok(ToolResult::ok(serde_json::to_string(&status)?))
            }
        },
    ))
}
