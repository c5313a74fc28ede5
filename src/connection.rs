//! One spawned tool-server process and its line-delimited JSON-RPC channel.
//!
//! A `Connection` owns the child process, a writer over its stdin, and a
//! table of outstanding requests keyed by a per-connection monotonically
//! increasing id. Inbound lines are parsed independently, so one corrupt
//! line never blocks or misattributes later responses. Every pending entry
//! is removed exactly once: by a matching response, or by the caller's
//! deadline expiring, whichever comes first.

use crate::config::ServerConfig;
use crate::protocol::{self, ToolDescriptor};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("tool server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("tool server '{server}' did not answer '{method}' before the deadline")]
    Timeout { server: String, method: String },
    #[error("tool server '{server}' terminated unexpectedly")]
    Closed { server: String },
}

/// Deadlines applied to the two request classes. The handshake deadline is
/// deliberately generous; slow servers index large tool catalogues on start.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    pub call: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            call: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    server: ServerConfig,
    timeouts: Timeouts,
    state: AsyncMutex<Option<RunningState>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ConnectionError>>>>,
    id_counter: AtomicU64,
    instructions: AsyncMutex<Option<String>>,
    tools: AsyncMutex<Vec<ToolDescriptor>>,
}

struct RunningState {
    child: Child,
}

impl Connection {
    /// Spawn the configured server and run the full handshake: `initialize`,
    /// `notifications/initialized`, then `tools/list`. A connection is never
    /// returned partially initialised; any handshake failure tears the
    /// process down and surfaces the error.
    pub async fn start(server: ServerConfig, timeouts: Timeouts) -> Result<Self, ConnectionError> {
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                server,
                timeouts,
                state: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
                instructions: AsyncMutex::new(None),
                tools: AsyncMutex::new(Vec::new()),
            }),
        };
        connection.inner.spawn_process().await?;
        match connection.inner.initialize_sequence().await {
            Ok(()) => Ok(connection),
            Err(err) => {
                connection.inner.reset().await;
                Err(err)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.server.name
    }

    pub async fn alive(&self) -> bool {
        self.inner.state.lock().await.is_some()
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.lock().await.clone()
    }

    pub async fn instructions(&self) -> Option<String> {
        self.inner.instructions.lock().await.clone()
    }

    /// Forward a `tools/call` and return its raw result value.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, ConnectionError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.send_request("tools/call", params, deadline).await
    }

    /// Graceful teardown: kill and reap the child, fail all pending requests.
    pub async fn shutdown(&self) {
        self.inner.reset().await;
    }
}

impl ConnectionInner {
    async fn spawn_process(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut command = Command::new(&self.server.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.server.workdir {
            command.current_dir(dir);
        }
        if !self.server.args.is_empty() {
            command.args(&self.server.args);
        }
        for (key, value) in &self.server.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ConnectionError::Spawn {
            server: self.server.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdout"))?;

        {
            let mut writer = self.writer.lock().await;
            *writer = Some(BufWriter::new(stdin));
        }
        {
            let mut state = self.state.lock().await;
            *state = Some(RunningState { child });
        }

        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.reader_loop(stdout).await;
        });
        Ok(())
    }

    async fn initialize_sequence(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let deadline = self.timeouts.handshake;
        let params = json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let init_result = self.send_request("initialize", params, deadline).await?;
        if let Some(text) = init_result.get("instructions").and_then(Value::as_str) {
            let mut instructions = self.instructions.lock().await;
            *instructions = Some(text.to_string());
        }
        self.send_notification("notifications/initialized", json!({}))
            .await?;

        self.refresh_tools(deadline).await?;
        Ok(())
    }

    async fn refresh_tools(&self, deadline: Duration) -> Result<(), ConnectionError> {
        let result = self.send_request("tools/list", json!({}), deadline).await?;
        let catalog = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| serde_json::from_value(tool.clone()).ok())
                    .collect::<Vec<ToolDescriptor>>()
            })
            .unwrap_or_default();
        let mut tools = self.tools.lock().await;
        *tools = catalog;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => self.process_inbound_message(value).await,
                        Err(source) => {
                            // One bad line must not affect the rest of the
                            // stream; drop it and keep reading.
                            warn!(
                                server = %self.server.name,
                                line = raw,
                                %source,
                                "dropping invalid JSON line from tool server"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        self.reset().await;
    }

    async fn process_inbound_message(self: &Arc<Self>, value: Value) {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await;
            } else {
                self.handle_response(id, value).await;
            }
        } else if value.get("method").is_some() {
            self.handle_notification(value).await;
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match response_key(&id) {
            Some(key) => key,
            None => return,
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        let Some(sender) = responder else {
            // Already resolved or timed out; a late arrival is a no-op.
            debug!(
                server = %self.server.name,
                response_id = key,
                "received response for unknown or expired request"
            );
            return;
        };

        if value.get("error").is_some() {
            let error = value
                .get("error")
                .and_then(Value::as_object)
                .map(|err| {
                    (
                        err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                        err.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    )
                });
            let rpc_error = match error {
                Some((code, message)) => ConnectionError::Rpc {
                    server: self.server.name.clone(),
                    code,
                    message,
                },
                None => self.transport_error("missing error payload in response"),
            };
            let _ = sender.send(Err(rpc_error));
        } else {
            let _ = sender.send(Ok(value));
        }
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = match method {
            "ping" => {
                self.write_message(&protocol::response(id, json!({ "ok": true })))
                    .await
            }
            other => {
                warn!(
                    server = %self.server.name,
                    method = other,
                    "server sent unsupported request"
                );
                let message = format!("client does not implement method '{other}'");
                self.write_message(&protocol::error_response(id, -32601, &message))
                    .await
            }
        };
        if let Err(err) = outcome {
            warn!(server = %self.server.name, %err, "failed to answer server request");
        }
    }

    async fn handle_notification(self: &Arc<Self>, value: Value) {
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(
                server = %self.server.name,
                method,
                "received notification from server"
            );
            if method == "notifications/tools/list_changed" {
                // Refresh out of band: the reader loop must keep consuming
                // lines, including the tools/list response itself.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.refresh_tools(inner.timeouts.call).await {
                        warn!(
                            server = %inner.server.name,
                            %err,
                            "failed to refresh tool catalogue"
                        );
                    }
                });
            }
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ConnectionError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let payload = protocol::request(id, method, params);
        if let Err(err) = self.write_message(&payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        match time::timeout(deadline, rx).await {
            Ok(Ok(Ok(value))) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(ConnectionError::Closed {
                server: self.server.name.clone(),
            }),
            Err(_) => {
                // Deadline fired first: abandon locally. If the response
                // races in before this remove, the reader already resolved
                // the entry and the remove is a no-op.
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                Err(ConnectionError::Timeout {
                    server: self.server.name.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ConnectionError> {
        self.write_message(&protocol::notification(method, params))
            .await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ConnectionError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| ConnectionError::InvalidJson {
                server: self.server.name.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        Ok(())
    }

    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let mut state = self.state.lock().await;
        if let Some(mut running) = state.take() {
            if let Err(err) = running.child.kill().await {
                debug!(
                    server = %self.server.name,
                    %err,
                    "failed to kill tool server process (may have already exited)"
                );
            }
            let _ = running.child.wait().await;
        }
        drop(state);

        self.fail_all_pending().await;
        self.tools.lock().await.clear();
        self.instructions.lock().await.take();
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ConnectionError::Closed {
                server: self.server.name.clone(),
            }));
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Transport {
            server: self.server.name.clone(),
            message: message.into(),
        }
    }
}

fn response_key(id: &Value) -> Option<u64> {
    match id {
        Value::Number(num) => num.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
