//! MCP transport layer.
//!
//! Each MCP server communicates over a transport. Currently supported:
//! - **Stdio**: spawn a child process, send JSON-RPC over stdin/stdout.
//! - **Http**: JSON-RPC over HTTP, auto-detecting the server's dialect.
//! - **Sse**: always-streaming HTTP transport for servers that only speak
//!   `text/event-stream`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::protocol::{self, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use jarvis_domain::config::McpServerConfig;

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Shut down the transport gracefully.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("transport not supported: {0}")]
    Unsupported(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line.
/// The `request_lock` serializes entire request/response cycles to prevent
/// response mismatching when multiple callers use the same server.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    /// Serializes full request/response cycles to prevent response mismatching.
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn a child process from the given server config.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read a line of JSON from stdout, skipping any empty or non-JSON lines.
    ///
    /// Gives up after [`MAX_SKIP_LINES`] non-JSON lines to prevent spinning
    /// on a misconfigured server that writes logging to stdout.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "MCP server produced too many non-JSON lines on stdout",
                )));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending MCP request");
        self.write_line(&json).await?;

        let timeout = tokio::time::Duration::from_secs(30);
        let result = tokio::time::timeout(timeout, async {
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(
                        expected_id = id,
                        got_id = resp.id,
                        "received response for different request, continuing"
                    );
                }
                tracing::debug!(line = %line, "skipping non-matching message from MCP server");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }
        let timeout =
            tokio::time::timeout(tokio::time::Duration::from_secs(5), child.wait()).await;
        match timeout {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for MCP server process");
            }
            Err(_) => {
                tracing::warn!("MCP server process did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport — auto-detects simple JSON-RPC / streamable-HTTP
// (stateless) / streamable-HTTP (session) on first contact.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpDialect {
    JsonRpc,
    StreamStateless,
    StreamSession,
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    dialect: Mutex<Option<HttpDialect>>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            dialect: Mutex::new(None),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post(
        &self,
        req: &JsonRpcRequest,
        session_id: Option<&str>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(req);
        if let Some(sid) = session_id {
            builder = builder.header(MCP_SESSION_HEADER, sid);
        }
        builder.send().await.map_err(TransportError::from)
    }

    /// Perform the `initialize` handshake needed to acquire a session id,
    /// returning the id from the response header or a freshly generated one
    /// if the server doesn't supply one.
    async fn acquire_session(&self) -> Result<String, TransportError> {
        let init_id = self.next_request_id();
        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(TransportError::Json)?;
        let req = JsonRpcRequest::new(init_id, "initialize", Some(params));
        let resp = self.post(&req, None).await?;
        let header_id = resp
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(header_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }

    async fn parse_response_body(
        &self,
        resp: reqwest::Response,
    ) -> Result<JsonRpcResponse, TransportError> {
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let status = resp.status();
        let body = resp.text().await.map_err(TransportError::from)?;

        if content_type.contains("text/event-stream") {
            let data = sse_last_data_line(&body).ok_or_else(|| {
                TransportError::InvalidResponse("empty SSE stream".into())
            })?;
            unwrap_mcp_content(serde_json::from_str(&data)?)
        } else if status.is_success() {
            unwrap_mcp_content(serde_json::from_str(&body)?)
        } else {
            Err(TransportError::InvalidResponse(format!(
                "HTTP {status}: {body}"
            )))
        }
    }

    async fn send_inner(
        &self,
        req: &JsonRpcRequest,
        attempt: u32,
    ) -> Result<JsonRpcResponse, TransportError> {
        let dialect = *self.dialect.lock().await;
        let session = self.session_id.lock().await.clone();

        let resp = self.post(req, session.as_deref()).await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if status == reqwest::StatusCode::BAD_REQUEST && dialect != Some(HttpDialect::StreamSession)
        {
            let body = resp.text().await.unwrap_or_default();
            if body.to_lowercase().contains("session") {
                if attempt > 0 {
                    return Err(TransportError::InvalidResponse(
                        "session reinitialization failed".into(),
                    ));
                }
                let sid = self.acquire_session().await?;
                *self.session_id.lock().await = Some(sid);
                *self.dialect.lock().await = Some(HttpDialect::StreamSession);
                return Box::pin(self.send_inner(req, attempt + 1)).await;
            }
            return Err(TransportError::InvalidResponse(format!(
                "HTTP 400: {body}"
            )));
        }

        if dialect.is_none() {
            let detected = if content_type.contains("text/event-stream")
                || status == reqwest::StatusCode::NOT_ACCEPTABLE
            {
                HttpDialect::StreamStateless
            } else {
                HttpDialect::JsonRpc
            };
            *self.dialect.lock().await = Some(detected);
        }

        self.parse_response_body(resp).await
    }
}

/// Extract the last complete `data:` payload from an SSE response body.
fn sse_last_data_line(body: &str) -> Option<String> {
    let mut last = None;
    for line in body.lines() {
        if let Some(data) = line.trim().strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                last = Some(data.to_string());
            }
        }
    }
    last
}

/// If the `result` is in the MCP `{content: [{type:"text", text:"..."}]}`
/// shape, unwrap and JSON-parse the inner text; otherwise pass through.
fn unwrap_mcp_content(mut resp: JsonRpcResponse) -> Result<JsonRpcResponse, TransportError> {
    if let Some(result) = resp.result.take() {
        let unwrapped = if let Some(text) = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|items| items.first())
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
            .and_then(|item| item.get("text"))
            .and_then(|t| t.as_str())
        {
            serde_json::from_str(text).unwrap_or(result)
        } else {
            result
        };
        resp.result = Some(unwrapped);
    }
    Ok(resp)
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        self.send_inner(&req, 0).await
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let session = self.session_id.lock().await.clone();
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&notif);
        if let Some(sid) = session {
            builder = builder.header(MCP_SESSION_HEADER, sid);
        }
        builder.send().await.map_err(TransportError::from)?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport — always-streaming variant for servers that never
// answer with plain `application/json`.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SseTransport {
    inner: HttpTransport,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: HttpTransport::new(url),
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.inner.send_request(method, params).await
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        self.inner.send_notification(method).await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_last_data_line_picks_final_event() {
        let body = "event: ping\ndata: {\"a\":1}\n\ndata: {\"a\":2}\n\n";
        assert_eq!(sse_last_data_line(body), Some("{\"a\":2}".into()));
    }

    #[test]
    fn sse_last_data_line_none_when_absent() {
        assert_eq!(sse_last_data_line("event: ping\n\n"), None);
    }

    #[test]
    fn unwrap_mcp_content_unwraps_text_json() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({
                "content": [{"type": "text", "text": "{\"ok\":true}"}]
            })),
            error: None,
        };
        let unwrapped = unwrap_mcp_content(resp).unwrap();
        assert_eq!(unwrapped.result.unwrap()["ok"], serde_json::json!(true));
    }

    #[test]
    fn unwrap_mcp_content_passes_through_plain_result() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"tools": []})),
            error: None,
        };
        let unwrapped = unwrap_mcp_content(resp).unwrap();
        assert!(unwrapped.result.unwrap().get("tools").is_some());
    }
}
