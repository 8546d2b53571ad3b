//! JSON-RPC transports.
//!
//! One [`Transport`] contract, three wire kinds:
//! - [`PipeTransport`]: line-delimited JSON over a child process's stdio
//! - [`HttpTransport`]: one POST per request
//! - [`SocketTransport`]: one JSON message per WebSocket text frame
//!
//! The pipe and socket transports are persistent and shared by concurrent
//! callers. Each owns a writer task (the only code that touches the write
//! half) and a reader task that hands responses to waiting callers through a
//! pending-call table keyed by request id. A caller that times out only
//! abandons its table entry; it never interrupts a half-written frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::errors::TransportError;
use super::types::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Launch,
    ServerDescriptor, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Outgoing frames buffered per connection before callers wait.
const OUTGOING_BUFFER: usize = 64;

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connect timeout for network transports.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Contract ────────────────────────────────────────────────────────────────

/// A connection to one server.
///
/// Every request is bounded by the timeout it is given. Implementations
/// report failures only through [`TransportError`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the server on the other end.
    fn server(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its result (the `result` member of the
    /// response, or `RemoteError` for an `error` member).
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    /// Send a notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError>;

    /// Release the connection. Best-effort, never fails.
    async fn close(&self);
}

/// Opens connections for server descriptors.
///
/// The registry only ever talks to this trait, which keeps transport
/// selection inside this module.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connector that launches processes and dials network addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = match descriptor.transport {
            TransportKind::Stdio => Arc::new(PipeTransport::spawn(descriptor)?),
            TransportKind::Http => Arc::new(HttpTransport::new(descriptor)?),
            TransportKind::Websocket => Arc::new(SocketTransport::connect(descriptor).await?),
        };
        tracing::debug!(
            server = %descriptor.name,
            transport = %descriptor.transport,
            "connection opened"
        );
        Ok(transport)
    }
}

// ─── Pending Calls ───────────────────────────────────────────────────────────

/// Callers waiting for a response, keyed by request id.
struct PendingCalls {
    server: String,
    state: Mutex<PendingState>,
}

struct PendingState {
    waiting: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    /// Set once the connection is gone; later registrations fail fast.
    closed: Option<String>,
}

impl PendingCalls {
    fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            state: Mutex::new(PendingState {
                waiting: HashMap::new(),
                closed: None,
            }),
        }
    }

    async fn register(&self, id: u64) -> Result<oneshot::Receiver<JsonRpcResponse>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(TransportError::ConnectionLost {
                server: self.server.clone(),
                reason: reason.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiting.insert(id, tx);
        Ok(rx)
    }

    async fn forget(&self, id: u64) {
        self.state.lock().await.waiting.remove(&id);
    }

    /// Hand an inbound message to the caller waiting on its id.
    async fn dispatch(&self, message: JsonRpcResponse) {
        let Some(id) = message.response_id() else {
            tracing::trace!(
                server = %self.server,
                method = ?message.method,
                "ignoring server-initiated message"
            );
            return;
        };
        let waiter = self.state.lock().await.waiting.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have timed out between lookup and send.
                let _ = tx.send(message);
            }
            None => tracing::debug!(
                server = %self.server,
                id,
                "discarding response with no waiting caller"
            ),
        }
    }

    /// Fail every waiting caller and refuse new ones.
    async fn close(&self, reason: String) {
        let mut state = self.state.lock().await;
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        // Dropping the senders wakes each receiver with an error.
        state.waiting.clear();
    }

    async fn lost(&self) -> TransportError {
        let reason = self
            .state
            .lock()
            .await
            .closed
            .clone()
            .unwrap_or_else(|| "connection closed before response".into());
        TransportError::ConnectionLost {
            server: self.server.clone(),
            reason,
        }
    }

    #[cfg(test)]
    async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiting.len()
    }
}

// ─── Multiplexer ─────────────────────────────────────────────────────────────

/// Request/response pairing over a persistent, frame-oriented connection.
struct Multiplexer {
    server: String,
    outgoing: mpsc::Sender<String>,
    pending: Arc<PendingCalls>,
}

impl Multiplexer {
    fn new(server: &str) -> (Self, mpsc::Receiver<String>) {
        let (outgoing, rx) = mpsc::channel(OUTGOING_BUFFER);
        let mux = Self {
            server: server.to_string(),
            outgoing,
            pending: Arc::new(PendingCalls::new(server)),
        };
        (mux, rx)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let frame = encode(&self.server, &JsonRpcRequest::new(id, method, params))?;
        let rx = self.pending.register(id).await?;

        let exchange = async {
            if self.outgoing.send(frame).await.is_err() {
                return Err(self.pending.lost().await);
            }
            match rx.await {
                Ok(response) => Ok(response),
                Err(_) => Err(self.pending.lost().await),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => extract_result(&self.server, response),
            Ok(Err(e)) => {
                self.pending.forget(id).await;
                Err(e)
            }
            Err(_) => {
                self.pending.forget(id).await;
                Err(TransportError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let frame = encode(&self.server, &JsonRpcNotification::new(method, params))?;
        if self.outgoing.send(frame).await.is_err() {
            return Err(self.pending.lost().await);
        }
        Ok(())
    }
}

fn encode<T: serde::Serialize>(server: &str, message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::ProtocolViolation {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })
}

// ─── Pipe Transport ──────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct PipeTransport {
    mux: Multiplexer,
    child: Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipeTransport {
    /// Launch the server process and wire its stdio.
    pub fn spawn(descriptor: &ServerDescriptor) -> Result<Self, TransportError> {
        let name = descriptor.name.as_str();
        let Launch::Command { program, args, cwd } = &descriptor.launch else {
            return Err(TransportError::ConnectionLost {
                server: name.to_string(),
                reason: "stdio transport needs a launch command".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| TransportError::ConnectionLost {
            server: name.to_string(),
            reason: format!("failed to spawn '{program}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::ConnectionLost {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::ConnectionLost {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let mut transport = Self::from_streams(name, stdout, stdin);
        if let Some(stderr) = child.stderr.take() {
            transport.tasks.push(tokio::spawn(drain_stderr(name.to_string(), stderr)));
        }
        transport.child = Mutex::new(Some(child));

        tracing::info!(server = name, program = %program, "server process launched");
        Ok(transport)
    }

    /// Build a transport over arbitrary byte streams.
    ///
    /// `reader` carries the server's output, `writer` its input.
    pub fn from_streams<R, W>(server: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, outgoing) = Multiplexer::new(server);
        let reader_task = tokio::spawn(read_lines(
            server.to_string(),
            reader,
            Arc::clone(&mux.pending),
        ));
        let writer_task = tokio::spawn(write_lines(writer, outgoing, Arc::clone(&mux.pending)));

        Self {
            mux,
            child: Mutex::new(None),
            tasks: vec![reader_task, writer_task],
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn server(&self) -> &str {
        &self.mux.server
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        self.mux.request(method, params, timeout).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        self.mux.notify(method, params).await
    }

    async fn close(&self) {
        // Ask politely first; the writer task flushes it before we wait.
        let _ = self.mux.notify("shutdown", None).await;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.mux.server, %status, "server exited");
                }
                _ => {
                    tracing::warn!(server = %self.mux.server, "server ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.mux.pending.close("transport closed".into()).await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Reader task: route each response line to its caller.
async fn read_lines<R>(server: String, reader: R, pending: Arc<PendingCalls>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(message) => pending.dispatch(message).await,
                    // Server log output on stdout is tolerated.
                    Err(_) => tracing::trace!(server = %server, line = trimmed, "non-JSON-RPC output"),
                }
            }
            Ok(None) => break "server stdout closed (process may have exited)".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };
    tracing::debug!(server = %server, reason = %reason, "pipe reader stopped");
    pending.close(reason).await;
}

/// Writer task: the only owner of the write half.
async fn write_lines<W>(mut writer: W, mut outgoing: mpsc::Receiver<String>, pending: Arc<PendingCalls>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut frame) = outgoing.recv().await {
        frame.push('\n');
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            pending.close(format!("failed to write to stdin: {e}")).await;
            return;
        }
    }
}

async fn drain_stderr(server: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, stderr = %line, "server stderr");
    }
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// JSON-RPC over HTTP: one POST per request.
pub struct HttpTransport {
    server: String,
    url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self, TransportError> {
        let Launch::Address { url } = &descriptor.launch else {
            return Err(TransportError::ConnectionLost {
                server: descriptor.name.clone(),
                reason: "http transport needs a url".into(),
            });
        };
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::ConnectionLost {
                server: descriptor.name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            server: descriptor.name.clone(),
            url: url.clone(),
            http,
        })
    }

    fn map_reqwest(&self, method: &str, timeout: Duration, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                server: self.server.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            TransportError::ProtocolViolation {
                server: self.server.clone(),
                reason: format!("invalid response body: {e}"),
            }
        } else {
            TransportError::ConnectionLost {
                server: self.server.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn post(
        &self,
        method: &str,
        body: String,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.map_reqwest(method, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RemoteError {
                code: i64::from(status.as_u16()),
                message: format!("HTTP {status}: {body}"),
                data: None,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn server(&self) -> &str {
        &self.server
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let body = encode(&self.server, &JsonRpcRequest::new(id, method, params))?;

        let exchange = async {
            let response = self.post(method, body, timeout).await?;
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| self.map_reqwest(method, timeout, e))
        };

        let message = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                server: self.server.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        if message.response_id() != Some(id) {
            return Err(TransportError::ProtocolViolation {
                server: self.server.clone(),
                reason: format!("expected response id {id}, got {:?}", message.id),
            });
        }
        extract_result(&self.server, message)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let body = encode(&self.server, &JsonRpcNotification::new(method, params))?;
        self.post(method, body, CONNECT_TIMEOUT).await.map(|_| ())
    }

    async fn close(&self) {}
}

// ─── Socket Transport ────────────────────────────────────────────────────────

/// JSON-RPC over a persistent WebSocket.
pub struct SocketTransport {
    mux: Multiplexer,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketTransport {
    pub async fn connect(descriptor: &ServerDescriptor) -> Result<Self, TransportError> {
        let name = descriptor.name.as_str();
        let Launch::Address { url } = &descriptor.launch else {
            return Err(TransportError::ConnectionLost {
                server: name.to_string(),
                reason: "websocket transport needs a url".into(),
            });
        };

        let (stream, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            server: name.to_string(),
            method: "connect".into(),
            timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
        })?
        .map_err(|e| TransportError::ConnectionLost {
            server: name.to_string(),
            reason: format!("failed to connect to {url}: {e}"),
        })?;

        let (mut sink, mut source) = stream.split();
        let (mux, mut outgoing) = Multiplexer::new(name);

        let pending = Arc::clone(&mux.pending);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    pending.close(format!("failed to send frame: {e}")).await;
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let pending = Arc::clone(&mux.pending);
        let server = name.to_string();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(message) => pending.dispatch(message).await,
                        Err(e) => tracing::debug!(server = %server, error = %e, "unparseable frame"),
                    },
                    Some(Ok(Message::Binary(bytes))) => match serde_json::from_slice(&bytes) {
                        Ok(message) => pending.dispatch(message).await,
                        Err(e) => tracing::debug!(server = %server, error = %e, "unparseable frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "socket closed by peer".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("socket read failed: {e}"),
                }
            };
            tracing::debug!(server = %server, reason = %reason, "socket reader stopped");
            pending.close(reason).await;
        });

        Ok(Self {
            mux,
            tasks: vec![reader_task, writer_task],
        })
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn server(&self) -> &str {
        &self.mux.server
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        self.mux.request(method, params, timeout).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        self.mux.notify(method, params).await
    }

    async fn close(&self) {
        self.mux.pending.close("transport closed".into()).await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `TransportError`.
pub fn extract_result(
    server: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| TransportError::ProtocolViolation {
        server: server.to_string(),
        reason: "response missing both result and error".into(),
    })
}

/// Unwrap the payload of a `tools/call` result.
///
/// Prefers `structuredContent`, then the first text item of `content`
/// (decoded as JSON when it is JSON), then the raw result. A result flagged
/// `isError` becomes a `RemoteError`.
pub fn unwrap_tool_output(result: serde_json::Value) -> Result<serde_json::Value, TransportError> {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let first_text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
        })
        .and_then(|item| item.get("text"))
        .and_then(|t| t.as_str());

    let payload = if let Some(structured) = result.get("structuredContent") {
        structured.clone()
    } else if let Some(text) = first_text {
        serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
    } else {
        result.clone()
    };

    if is_error {
        let message = match &payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(TransportError::RemoteError {
            code: error_codes::TOOL_ERROR,
            message,
            data: Some(result),
        });
    }

    Ok(payload)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
