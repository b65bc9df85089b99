//! Stdio transport: a spawned child process speaking line-delimited
//! JSON-RPC on stdin/stdout.
//!
//! A single reader task owns the child's stdout.  Responses are correlated
//! back to callers by request id through a map of oneshot channels, so any
//! number of calls may be in flight concurrently; stdin writes are
//! serialized behind a mutex (the open-question resolution for concurrent
//! calls against one stdio server).  Server-originated frames are handled
//! on the reader task via the shared dispatch helpers, which is exactly why
//! callback routing lives in a process-scoped table rather than task-local
//! storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use crate::error::{McpError, Result};
use crate::protocol::{
    self, PROTOCOL_VERSION, RpcError, ServerFrame, notification_frame, request_frame,
    response_frame,
};
use crate::routing::CallbackRouter;
use crate::transport::{Transport, answer_server_request, dispatch_notification};

type PendingMap = Arc<DashMap<u64, oneshot::Sender<std::result::Result<Value, RpcError>>>>;

/// JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    server: String,
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process and start the reader task.
    ///
    /// `env` values must already have their `${VAR}` references resolved;
    /// the caller skips the server entirely when resolution fails.
    pub async fn spawn(
        server: impl Into<String>,
        command: &[String],
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        router: CallbackRouter,
    ) -> Result<Self> {
        let server = server.into();
        let Some((program, args)) = command.split_first() else {
            return Err(McpError::Spawn {
                server,
                reason: "empty command".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            if !cwd.exists() {
                return Err(McpError::Spawn {
                    server,
                    reason: format!("working directory does not exist: {}", cwd.display()),
                });
            }
            cmd.current_dir(cwd);
        }
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            server: server.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            server: server.clone(),
            reason: "child stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            server: server.clone(),
            reason: "child stdout unavailable".into(),
        })?;

        // Surface child stderr at debug level; stdio servers log freely there.
        if let Some(stderr) = child.stderr.take() {
            let server_name = server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server_name, "[stderr] {line}");
                }
            });
        }

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(DashMap::new());

        let reader = tokio::spawn(reader_loop(
            server.clone(),
            stdout,
            Arc::clone(&stdin),
            Arc::clone(&pending),
            router,
        ));

        tracing::info!(server = %server, program = %program, "stdio server spawned");

        Ok(Self {
            server,
            child: Mutex::new(child),
            stdin,
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"elicitation": {}, "sampling": {}},
                "clientInfo": {"name": "parley", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        write_frame(
            &self.server,
            &self.stdin,
            &notification_frame("notifications/initialized", json!({})),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = request_frame(id, method, params);
        if let Err(e) = write_frame(&self.server, &self.stdin, &frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(McpError::Rpc {
                server: self.server.clone(),
                code: err.code,
                message: err.message,
            }),
            // Sender dropped: the reader task ended (child exited or EOF).
            Err(_) => Err(McpError::Transport {
                server: self.server.clone(),
                reason: "connection closed before response".into(),
            }),
        }
    }

    async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(server = %self.server, "child already gone: {e}");
        }
        tracing::info!(server = %self.server, "stdio server shut down");
    }
}

/// Serialize one frame as a line on the child's stdin.
async fn write_frame(
    server: &str,
    stdin: &Arc<Mutex<ChildStdin>>,
    frame: &Value,
) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| McpError::Transport {
            server: server.to_owned(),
            reason: format!("stdin write failed: {e}"),
        })?;
    stdin.flush().await.map_err(|e| McpError::Transport {
        server: server.to_owned(),
        reason: format!("stdin flush failed: {e}"),
    })
}

/// Owns the child's stdout: correlates responses, dispatches notifications,
/// and answers server-initiated requests.
async fn reader_loop(
    server: String,
    stdout: tokio::process::ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    router: CallbackRouter,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, "stdout read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match protocol::parse_frame(&server, &line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(server = %server, "skipping unparseable frame: {e}");
                continue;
            }
        };

        match frame {
            ServerFrame::Response { id, result } => {
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        tracing::warn!(server = %server, id, "response for unknown request id");
                    }
                }
            }

            ServerFrame::Notification { method, params } => {
                dispatch_notification(&server, &router, &method, params).await;
            }

            ServerFrame::Request { id, method, params } => {
                // Answering may block on the user (elicitation), so it runs
                // off the reader task to keep the channel draining.
                let server = server.clone();
                let stdin = Arc::clone(&stdin);
                let router = router.clone();
                tokio::spawn(async move {
                    let result = answer_server_request(&server, &router, &method, params).await;
                    let frame = response_frame(&id, result);
                    if let Err(e) = write_frame(&server, &stdin, &frame).await {
                        tracing::warn!(server = %server, "failed to answer server request: {e}");
                    }
                });
            }
        }
    }

    // The channel is gone; dropping the pending senders fails outstanding
    // requests with a transport error on the caller side.
    pending.clear();
    tracing::info!(server = %server, "stdio reader finished");
}
