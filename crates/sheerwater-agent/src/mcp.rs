//! MCP tool gateway over the SSE transport.
//!
//! The server keeps one long-lived `text/event-stream` open. Its first event
//! (`endpoint`) names the URL to POST JSON-RPC requests to; responses come back
//! as `message` events on the stream and are matched to waiting callers by id.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Url;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::{Value, json};
use sheerwater_ai::Tool;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::tool::{ToolFailure, ToolGateway};

const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, McpError>>>>>;

/// Connection settings for the tool server
#[derive(Debug, Clone)]
pub struct McpConfig {
    /// SSE endpoint, e.g. `http://localhost:8000/sse`
    pub url: String,
    /// Bound on waiting for any single JSON-RPC response
    pub request_timeout: Duration,
    /// Bound on waiting for the server's `endpoint` event
    pub connect_timeout: Duration,
}

impl McpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport-level errors, folded into [`ToolFailure`] at the gateway boundary
#[derive(Debug, Clone, thiserror::Error)]
enum McpError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl McpError {
    /// Whether a fresh connection might fix it
    fn is_connection(&self) -> bool {
        matches!(self, McpError::ConnectionClosed | McpError::Transport(_))
    }

    fn into_failure(self) -> ToolFailure {
        match self {
            McpError::ConnectionClosed | McpError::Transport(_) => ToolFailure::Unavailable,
            McpError::Timeout => ToolFailure::Timeout,
            McpError::Server(msg) | McpError::Protocol(msg) => ToolFailure::Failed(msg),
        }
    }
}

/// The POST side of one SSE connection
struct Channel {
    http: reqwest::Client,
    endpoint: Url,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
}

impl Channel {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // Unregisters on every exit, including the caller dropping us
        let _registered = PendingGuard {
            pending: &self.pending,
            id,
        };

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.post(&body).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => Err(McpError::Timeout),
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        self.post(&json!({ "jsonrpc": "2.0", "method": method })).await
    }

    async fn post(&self, body: &Value) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(McpError::Transport(format!("HTTP error: {}", response.status())));
        }
        Ok(())
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An initialized connection and the tools it advertised
struct Session {
    channel: Channel,
    tools: Vec<Tool>,
}

/// MCP client with lazy connect and a single reconnect per failed call
pub struct McpClient {
    config: McpConfig,
    http: reqwest::Client,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl McpClient {
    pub fn new(config: McpConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Connect eagerly, retrying while the server comes up.
    /// Returns the number of tools advertised.
    pub async fn connect_with_retry(&self, attempts: u32, delay: Duration) -> Result<usize, ToolFailure> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            tracing::info!(
                "Connecting to MCP server at {} (attempt {}/{})",
                self.config.url,
                attempt,
                attempts
            );
            match self.session().await {
                Ok(session) => return Ok(session.tools.len()),
                Err(e) if attempt < attempts => {
                    tracing::warn!("MCP server not ready, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to connect to MCP server after {} attempts: {}",
                        attempts,
                        e
                    );
                    return Err(e.into_failure());
                }
            }
        }
        Err(ToolFailure::Unavailable)
    }

    /// Current live session, connecting if there is none
    async fn session(&self) -> Result<Arc<Session>, McpError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.channel.alive.load(Ordering::SeqCst) {
                return Ok(Arc::clone(session));
            }
        }
        *guard = None;

        let session = Arc::new(self.connect().await?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Forget `stale` if it is still the current session
    async fn invalidate(&self, stale: &Arc<Session>) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            *guard = None;
        }
        stale.channel.shutdown.cancel();
    }

    async fn connect(&self) -> Result<Session, McpError> {
        let base = Url::parse(&self.config.url)
            .map_err(|e| McpError::Transport(format!("invalid server URL: {}", e)))?;
        let source = EventSource::new(self.http.get(base.clone()))
            .map_err(|e| McpError::Transport(format!("failed to open event stream: {}", e)))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        tokio::spawn(read_events(
            source,
            base,
            Arc::clone(&pending),
            Arc::clone(&alive),
            shutdown.clone(),
            endpoint_tx,
        ));

        // Stops the reader if we bail out before the channel owns it.
        let reader_guard = shutdown.clone().drop_guard();
        let endpoint = match tokio::time::timeout(self.config.connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint?,
            Ok(Err(_)) => return Err(McpError::ConnectionClosed),
            Err(_) => {
                return Err(McpError::Transport(
                    "timed out waiting for endpoint event".to_string(),
                ));
            }
        };
        tracing::debug!("MCP message endpoint: {}", endpoint);

        reader_guard.disarm();
        let channel = Channel {
            http: self.http.clone(),
            endpoint,
            pending,
            alive,
            next_id: AtomicI64::new(1),
            shutdown,
        };

        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "sheerwater-chat",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        channel
            .request("initialize", init_params, self.config.request_timeout)
            .await?;
        channel.notify("notifications/initialized").await?;

        let listed = channel
            .request("tools/list", json!({}), self.config.request_timeout)
            .await?;
        let tools = parse_tools(listed)?;
        tracing::info!("Connected to MCP server, found {} tools", tools.len());

        Ok(Session { channel, tools })
    }
}

#[async_trait]
impl ToolGateway for McpClient {
    async fn catalog(&self) -> Result<Vec<Tool>, ToolFailure> {
        self.session()
            .await
            .map(|s| s.tools.clone())
            .map_err(McpError::into_failure)
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolFailure> {
        let params = json!({ "name": name, "arguments": arguments });
        let mut reconnected = false;

        loop {
            let attempt = match self.session().await {
                Ok(session) => {
                    let result = session
                        .channel
                        .request("tools/call", params.clone(), self.config.request_timeout)
                        .await;
                    result.map_err(|e| (Some(session), e))
                }
                Err(e) => Err((None, e)),
            };

            match attempt {
                Ok(result) => {
                    tracing::info!("Tool {} returned successfully", name);
                    return decode_call_result(result);
                }
                Err((session, e)) if e.is_connection() && !reconnected => {
                    tracing::warn!(
                        "MCP connection error during tool call '{}': {}. Reconnecting...",
                        name,
                        e
                    );
                    if let Some(session) = session {
                        self.invalidate(&session).await;
                    }
                    reconnected = true;
                }
                Err((_, e)) => {
                    tracing::error!("Tool {} failed: {}", name, e);
                    return Err(e.into_failure());
                }
            }
        }
    }
}

/// Drive one SSE connection until it ends or is shut down
async fn read_events(
    mut source: EventSource,
    base: Url,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    endpoint_tx: oneshot::Sender<Result<Url, McpError>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = source.next() => event,
        };

        match event {
            None => break,
            Some(Ok(Event::Open)) => tracing::debug!("MCP event stream opened"),
            Some(Ok(Event::Message(message))) => match message.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(resolve_endpoint(&base, &message.data));
                    }
                }
                "message" => dispatch_message(&pending, &message.data),
                other => tracing::debug!("Ignoring MCP event '{}'", other),
            },
            Some(Err(e)) => {
                tracing::warn!("MCP event stream ended: {}", e);
                break;
            }
        }
    }

    source.close();
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller with ConnectionClosed.
    pending.lock().clear();
}

fn resolve_endpoint(base: &Url, data: &str) -> Result<Url, McpError> {
    base.join(data.trim())
        .map_err(|e| McpError::Protocol(format!("invalid endpoint '{}': {}", data.trim(), e)))
}

/// Route a JSON-RPC response to its waiting caller
fn dispatch_message(pending: &PendingMap, data: &str) {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to parse MCP message: {} - {}", e, data.trim());
            return;
        }
    };

    let Some(id) = value.get("id").and_then(|id| id.as_i64()) else {
        tracing::debug!("Ignoring MCP notification: {}", data.trim());
        return;
    };

    let result = if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        Err(McpError::Server(message.to_string()))
    } else if let Some(result) = value.get("result") {
        Ok(result.clone())
    } else {
        // A request from the server; this client offers no capabilities.
        return;
    };

    if let Some(tx) = pending.lock().remove(&id) {
        let _ = tx.send(result);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpToolDefinition {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

fn parse_tools(result: Value) -> Result<Vec<Tool>, McpError> {
    let listed: ListToolsResult = serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {}", e)))?;
    Ok(listed
        .tools
        .into_iter()
        .map(|t| {
            Tool::new(
                t.name,
                t.description.unwrap_or_default(),
                t.input_schema.unwrap_or_else(|| json!({ "type": "object" })),
            )
        })
        .collect())
}

/// A `tools/call` result with `isError: true` is a tool failure
fn decode_call_result(result: Value) -> Result<Value, ToolFailure> {
    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(ToolFailure::Failed(text));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_resolve_endpoint_relative_and_absolute() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages/?session_id=abc\n").unwrap().as_str(),
            "http://localhost:8000/messages/?session_id=abc"
        );
        assert_eq!(
            resolve_endpoint(&base, "http://other:9000/m").unwrap().as_str(),
            "http://other:9000/m"
        );
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.lock().insert(1, tx1);
        pending.lock().insert(2, tx2);

        dispatch_message(&pending, r#"{"jsonrpc":"2.0","id":2,"result":{"ok":true}}"#);
        dispatch_message(&pending, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        dispatch_message(&pending, "not json");

        assert_eq!(rx2.try_recv().unwrap().unwrap(), json!({"ok": true}));
        assert!(rx1.try_recv().is_err());
        assert_eq!(pending.lock().len(), 1);

        dispatch_message(
            &pending,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"bad params"}}"#,
        );
        match rx1.try_recv().unwrap() {
            Err(McpError::Server(msg)) => assert_eq!(msg, "bad params"),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tools_defaults() {
        let tools = parse_tools(json!({
            "tools": [
                {"name": "lookup", "description": "Look up", "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}},
                {"name": "bare"}
            ]
        }))
        .unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].parameters["properties"]["q"]["type"], "string");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].parameters, json!({"type": "object"}));

        assert!(parse_tools(json!({"nope": []})).is_err());
    }

    #[test]
    fn test_decode_call_result() {
        let ok = json!({"content": [{"type": "text", "text": "fine"}], "isError": false});
        assert_eq!(decode_call_result(ok.clone()).unwrap(), ok);

        let failed = json!({"content": [{"type": "text", "text": "metric not found"}], "isError": true});
        assert_eq!(
            decode_call_result(failed).unwrap_err(),
            ToolFailure::Failed("metric not found".into())
        );

        let bare = json!({"content": [], "isError": true});
        assert_eq!(
            decode_call_result(bare).unwrap_err(),
            ToolFailure::Failed("Unknown error".into())
        );
    }

    #[test]
    fn test_error_mapping() {
        assert!(McpError::ConnectionClosed.is_connection());
        assert!(McpError::Transport("x".into()).is_connection());
        assert!(!McpError::Timeout.is_connection());
        assert_eq!(McpError::Timeout.into_failure(), ToolFailure::Timeout);
        assert_eq!(McpError::ConnectionClosed.into_failure(), ToolFailure::Unavailable);
    }

    // ===== In-process SSE tool server =====

    enum SseCommand {
        Message(Value),
        Close,
    }

    #[derive(Default)]
    struct ServerState {
        sse: Mutex<Option<mpsc::UnboundedSender<SseCommand>>>,
        sse_connections: AtomicUsize,
        flaky_calls: AtomicUsize,
    }

    struct FakeMcpServer {
        url: String,
        state: Arc<ServerState>,
    }

    impl FakeMcpServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/sse", listener.local_addr().unwrap());
            let state = Arc::new(ServerState::default());
            let accept_state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
                }
            });
            Self { url, state }
        }

        fn client(&self, request_timeout: Duration) -> McpClient {
            McpClient::new(McpConfig {
                url: self.url.clone(),
                request_timeout,
                connect_timeout: Duration::from_secs(5),
            })
        }
    }

    async fn handle_connection(stream: tokio::net::TcpStream, state: Arc<ServerState>) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                return;
            }
            let mut content_length = 0usize;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                    return;
                }
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }

            if request_line.starts_with("GET") {
                serve_sse(write, state).await;
                return;
            }

            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
            let response = "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n";
            if write.write_all(response.as_bytes()).await.is_err() {
                return;
            }
            let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            handle_rpc(&state, request);
        }
    }

    async fn serve_sse(mut write: tokio::net::tcp::OwnedWriteHalf, state: Arc<ServerState>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *state.sse.lock() = Some(tx);
        let n = state.sse_connections.fetch_add(1, Ordering::SeqCst) + 1;

        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\nevent: endpoint\ndata: /messages/?session_id={}\n\n",
            n
        );
        if write.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        while let Some(command) = rx.recv().await {
            match command {
                SseCommand::Message(value) => {
                    let frame = format!("event: message\ndata: {}\n\n", value);
                    if write.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                }
                SseCommand::Close => {
                    let _ = write.shutdown().await;
                    return;
                }
            }
        }
    }

    fn handle_rpc(state: &ServerState, request: Value) {
        let Some(id) = request.get("id").cloned() else {
            return;
        };
        let method = request["method"].as_str().unwrap_or_default();
        let result = match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0"}
            }),
            "tools/list" => json!({
                "tools": [{
                    "name": "lookup",
                    "description": "Look up a value",
                    "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
                }]
            }),
            "tools/call" => match request["params"]["name"].as_str().unwrap_or_default() {
                "lookup" => json!({"content": [{"type": "text", "text": "{\"value\":\"42\"}"}], "isError": false}),
                "broken" => json!({"content": [{"type": "text", "text": "metric not found"}], "isError": true}),
                "slow" => return,
                "flaky" => {
                    if state.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        send(state, SseCommand::Close);
                        return;
                    }
                    json!({"content": [{"type": "text", "text": "recovered"}], "isError": false})
                }
                "dead" => {
                    send(state, SseCommand::Close);
                    return;
                }
                _ => json!({"content": [], "isError": true}),
            },
            _ => return,
        };
        send(
            state,
            SseCommand::Message(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        );
    }

    fn send(state: &ServerState, command: SseCommand) {
        if let Some(tx) = state.sse.lock().as_ref() {
            let _ = tx.send(command);
        }
    }

    #[tokio::test]
    async fn test_catalog_and_invoke_over_sse() {
        let server = FakeMcpServer::start().await;
        let client = server.client(Duration::from_secs(5));

        let tools = client.catalog().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");

        let result = client.invoke("lookup", json!({"q": "x"})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "{\"value\":\"42\"}");

        let err = client.invoke("broken", json!({})).await.unwrap_err();
        assert_eq!(err, ToolFailure::Failed("metric not found".into()));
        assert_eq!(server.state.sse_connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let server = FakeMcpServer::start().await;
        let client = server.client(Duration::from_millis(200));

        let err = client.invoke("slow", json!({})).await.unwrap_err();
        assert_eq!(err, ToolFailure::Timeout);
    }

    #[tokio::test]
    async fn test_abandoned_call_is_unregistered() {
        let server = FakeMcpServer::start().await;
        let client = server.client(Duration::from_secs(30));

        // The caller gives up long before the request timeout
        let abandoned =
            tokio::time::timeout(Duration::from_millis(200), client.invoke("slow", json!({}))).await;
        assert!(abandoned.is_err());

        let session = client.session().await.unwrap();
        assert!(session.channel.pending.lock().is_empty());

        // The connection is still usable afterwards
        let result = client.invoke("lookup", json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "{\"value\":\"42\"}");
    }

    #[tokio::test]
    async fn test_dropped_connection_reconnects_once() {
        let server = FakeMcpServer::start().await;
        let client = server.client(Duration::from_secs(5));

        let result = client.invoke("flaky", json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "recovered");
        assert_eq!(server.state.sse_connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_drop_reports_unavailable() {
        let server = FakeMcpServer::start().await;
        let client = server.client(Duration::from_secs(5));

        let err = client.invoke("dead", json!({})).await.unwrap_err();
        assert_eq!(err, ToolFailure::Unavailable);
        assert_eq!(server.state.sse_connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = McpClient::new(McpConfig {
            url: format!("http://{}/sse", addr),
            request_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        });
        assert_eq!(
            client.invoke("lookup", json!({})).await.unwrap_err(),
            ToolFailure::Unavailable
        );
        assert_eq!(
            client.connect_with_retry(2, Duration::from_millis(10)).await.unwrap_err(),
            ToolFailure::Unavailable
        );
    }
}
