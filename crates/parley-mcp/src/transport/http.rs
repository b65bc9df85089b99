//! Streamable HTTP / SSE transport.
//!
//! Each request is a POST of one JSON-RPC frame.  Servers either answer
//! with a plain JSON body or upgrade the response to `text/event-stream`,
//! in which case notifications (progress, logs) and server-initiated
//! requests arrive as SSE `data:` events interleaved before the final
//! response frame.  Replies to server-initiated requests are POSTed back to
//! the same endpoint, as the streamable protocol expects.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};

use crate::error::{McpError, Result};
use crate::protocol::{
    self, PROTOCOL_VERSION, ServerFrame, notification_frame, request_frame, response_frame,
};
use crate::routing::CallbackRouter;
use crate::transport::{Transport, answer_server_request, dispatch_notification};

/// How the transport authenticates against the server.
#[derive(Debug, Clone, Default)]
pub enum HttpAuth {
    #[default]
    None,
    /// `Authorization: Bearer <token>` (bearer, jwt, and oauth tokens).
    Bearer(String),
    /// Token in a custom header, e.g. `X-API-Key`.
    Header { name: String, value: String },
}

/// JSON-RPC over streamable HTTP.
pub struct HttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    auth: HttpAuth,
    /// SSE endpoints want the event-stream accept header up front.
    prefer_sse: bool,
    next_id: AtomicU64,
    router: CallbackRouter,
    session_id: std::sync::Mutex<Option<String>>,
}

impl HttpTransport {
    /// Create a transport for a streamable HTTP endpoint.
    pub fn new(
        server: impl Into<String>,
        url: impl Into<String>,
        auth: HttpAuth,
        router: CallbackRouter,
    ) -> Result<Self> {
        Self::build(server.into(), url.into(), auth, router, false)
    }

    /// Create a transport for an SSE endpoint.
    pub fn new_sse(
        server: impl Into<String>,
        url: impl Into<String>,
        auth: HttpAuth,
        router: CallbackRouter,
    ) -> Result<Self> {
        Self::build(server.into(), url.into(), auth, router, true)
    }

    fn build(
        server: String,
        url: String,
        auth: HttpAuth,
        router: CallbackRouter,
        prefer_sse: bool,
    ) -> Result<Self> {
        url::Url::parse(&url).map_err(|e| McpError::Transport {
            server: server.clone(),
            reason: format!("invalid endpoint URL `{url}`: {e}"),
        })?;

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| McpError::Transport {
                server: server.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server,
            url,
            client,
            auth,
            prefer_sse,
            next_id: AtomicU64::new(1),
            router,
            session_id: std::sync::Mutex::new(None),
        })
    }

    /// Perform the `initialize` handshake and capture the session id.
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
        // Best-effort: servers commonly answer 202 with no body here.
        let _ = self
            .post_frame(&notification_frame("notifications/initialized", json!({})))
            .await;
        Ok(())
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder = builder
            .header(CONTENT_TYPE, "application/json")
            .header(
                ACCEPT,
                if self.prefer_sse {
                    "text/event-stream"
                } else {
                    "application/json, text/event-stream"
                },
            );
        if let Some(session) = self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            builder = builder.header("Mcp-Session-Id", session);
        }
        match &self.auth {
            HttpAuth::None => builder,
            HttpAuth::Bearer(token) => builder.bearer_auth(token),
            HttpAuth::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        }
    }

    async fn post_frame(&self, frame: &Value) -> Result<reqwest::Response> {
        let resp = self
            .apply_headers(self.client.post(&self.url))
            .json(frame)
            .send()
            .await
            .map_err(|e| McpError::Transport {
                server: self.server.clone(),
                reason: format!("request failed: {e}"),
            })?;

        if let Some(session) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(session.to_owned());
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport {
                server: self.server.clone(),
                reason: format!("server returned {status}: {body}"),
            });
        }
        Ok(resp)
    }

    /// Drain an SSE response body until our response frame shows up.
    async fn consume_event_stream(&self, resp: reqwest::Response, id: u64) -> Result<Value> {
        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::Transport {
                server: self.server.clone(),
                reason: format!("stream read failed: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end().to_owned();
                buffer.drain(..=newline);

                // SSE framing: only data lines carry frames; comments,
                // event names and blank separators are skipped.
                let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
                else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }

                match protocol::parse_frame(&self.server, data)? {
                    ServerFrame::Response {
                        id: frame_id,
                        result,
                    } if frame_id == id => {
                        return result.map_err(|err| McpError::Rpc {
                            server: self.server.clone(),
                            code: err.code,
                            message: err.message,
                        });
                    }
                    ServerFrame::Response { id: other, .. } => {
                        tracing::warn!(server = %self.server, id = other, "response for unexpected id in stream");
                    }
                    ServerFrame::Notification { method, params } => {
                        dispatch_notification(&self.server, &self.router, &method, params).await;
                    }
                    ServerFrame::Request {
                        id: req_id,
                        method,
                        params,
                    } => {
                        // Answering can block on the user; run it aside and
                        // POST the reply back, keeping this stream draining.
                        self.spawn_request_answer(req_id, method, params);
                    }
                }
            }
        }

        Err(McpError::Transport {
            server: self.server.clone(),
            reason: "event stream ended before response".into(),
        })
    }

    fn spawn_request_answer(&self, id: Value, method: String, params: Value) {
        let server = self.server.clone();
        let router = self.router.clone();
        let client = self.client.clone();
        let url = self.url.clone();
        let auth = self.auth.clone();
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        tokio::spawn(async move {
            let result = answer_server_request(&server, &router, &method, params).await;
            let frame = response_frame(&id, result);

            let mut builder = client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json");
            if let Some(session) = session {
                builder = builder.header("Mcp-Session-Id", session);
            }
            builder = match &auth {
                HttpAuth::None => builder,
                HttpAuth::Bearer(token) => builder.bearer_auth(token),
                HttpAuth::Header { name, value } => builder.header(name.as_str(), value.as_str()),
            };

            if let Err(e) = builder.json(&frame).send().await {
                tracing::warn!(server = %server, "failed to answer server request: {e}");
            }
        });
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request_frame(id, method, params);
        let resp = self.post_frame(&frame).await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        if content_type.starts_with("text/event-stream") {
            return self.consume_event_stream(resp, id).await;
        }

        let body = resp.text().await.map_err(|e| McpError::Transport {
            server: self.server.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;
        match protocol::parse_frame(&self.server, &body)? {
            ServerFrame::Response { result, .. } => result.map_err(|err| McpError::Rpc {
                server: self.server.clone(),
                code: err.code,
                message: err.message,
            }),
            _ => Err(McpError::Transport {
                server: self.server.clone(),
                reason: "expected a response frame".into(),
            }),
        }
    }

    async fn shutdown(&self) {
        // Stateless per-request transport; dropping the session id is all
        // the teardown there is.
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::debug!(server = %self.server, "http transport shut down");
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("server", &self.server)
            .field("url", &self.url)
            .field("prefer_sse", &self.prefer_sse)
            .finish()
    }
}
