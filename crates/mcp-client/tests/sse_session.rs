//! SSE transport against an in-process MCP server.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use tm_domain::config::{McpConfig, McpServerConfig};
use tm_domain::context::{BotSummary, RequestContext, UserSummary};
use tm_mcp_client::{McpClient, UserClientManager, USER_ID_HEADER};
use tm_providers::network::{guarded_client, AllowedHosts};
use tm_tools::ToolStore;

#[derive(Clone)]
struct ServerState {
    outbox: mpsc::UnboundedSender<String>,
    inbox: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    seen_user_ids: Arc<Mutex<Vec<String>>>,
    streams_opened: Arc<AtomicUsize>,
}

async fn open_stream(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    if let Some(user) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        state.seen_user_ids.lock().await.push(user.to_string());
    }
    state.streams_opened.fetch_add(1, Ordering::SeqCst);
    let rx = state.inbox.lock().await.take();
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("endpoint").data("/messages?session=1"));
        if let Some(mut rx) = rx {
            while let Some(msg) = rx.recv().await {
                yield Ok(Event::default().event("message").data(msg));
            }
        }
    };
    Sse::new(stream)
}

async fn receive(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> StatusCode {
    if let Some(user) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        state.seen_user_ids.lock().await.push(user.to_string());
    }
    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    let result = match msg["method"].as_str().unwrap_or("") {
        "initialize" => json!({"protocolVersion": "2024-11-05", "capabilities": {"tools": {}}}),
        "tools/list" => json!({"tools": [{
            "name": "echo",
            "description": "Echo the text back",
            "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}
        }]}),
        "tools/call" => {
            let text = msg["params"]["arguments"]["text"].as_str().unwrap_or("").to_string();
            json!({"content": [{"type": "text", "text": text}, {"type": "text", "text": "done"}]})
        }
        _ => Value::Null,
    };
    let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
    let _ = state.outbox.send(reply.to_string());
    StatusCode::ACCEPTED
}

async fn start_server() -> (String, ServerState) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = ServerState {
        outbox: tx,
        inbox: Arc::new(Mutex::new(Some(rx))),
        seen_user_ids: Arc::new(Mutex::new(Vec::new())),
        streams_opened: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(receive))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/sse"), state)
}

fn server_config(url: &str) -> McpServerConfig {
    McpServerConfig {
        id: "local".into(),
        url: url.to_string(),
        headers: Default::default(),
    }
}

#[tokio::test]
async fn handshake_list_and_call() {
    let (url, state) = start_server().await;
    let allowed = Arc::new(AllowedHosts::new(["127.0.0.1"]));
    let http = guarded_client(allowed.clone()).unwrap();

    let client = McpClient::connect(&server_config(&url), "user-1", http, allowed, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.tools.len(), 1);
    assert_eq!(client.tools[0].name, "echo");

    let out = client.call_tool("echo", json!({"text": "hello"})).await.unwrap();
    assert_eq!(out, "hello\ndone");

    let seen = state.seen_user_ids.lock().await.clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|u| u == "user-1"));
    client.shutdown().await;
    assert!(!client.is_alive());
}

#[tokio::test]
async fn manager_registers_remote_tools() {
    let (url, _state) = start_server().await;
    let config = McpConfig {
        enabled: true,
        servers: vec![server_config(&url)],
        ..Default::default()
    };
    let manager = UserClientManager::new(config, Arc::new(AllowedHosts::new(["127.0.0.1"]))).unwrap();

    let store = ToolStore::new();
    manager.register_tools(&store, "user-1").await;
    assert_eq!(store.names(), vec!["echo"]);
    assert_eq!(manager.user_count(), 1);

    let ctx = RequestContext::new(UserSummary::default(), BotSummary::default());
    let out = store.resolve_tool("echo", json!({"text": "hi"}), &ctx).await.unwrap();
    assert_eq!(out, "hi\ndone");
    manager.shutdown().await;
}

#[tokio::test]
async fn blocked_server_is_skipped() {
    let (url, state) = start_server().await;
    let config = McpConfig {
        enabled: true,
        servers: vec![server_config(&url)],
        ..Default::default()
    };
    let manager = UserClientManager::new(config, Arc::new(AllowedHosts::new(["tools.example.com"]))).unwrap();

    assert!(manager.tools_for_user("user-1").await.is_empty());
    assert!(state.seen_user_ids.lock().await.is_empty());
    assert_eq!(manager.user_count(), 0, "a failed connect must not be cached");
}

#[tokio::test]
async fn concurrent_first_use_opens_one_session() {
    let (url, state) = start_server().await;
    let config = McpConfig {
        enabled: true,
        servers: vec![server_config(&url)],
        ..Default::default()
    };
    let manager = UserClientManager::new(config, Arc::new(AllowedHosts::new(["127.0.0.1"]))).unwrap();

    let (first, second) = tokio::join!(manager.tools_for_user("user-1"), manager.tools_for_user("user-1"));
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(state.streams_opened.load(Ordering::SeqCst), 1);
    assert_eq!(manager.user_count(), 1);

    let ctx = RequestContext::new(UserSummary::default(), BotSummary::default());
    for tools in [first, second] {
        let store = ToolStore::new();
        store.add_tools(tools);
        let out = store.resolve_tool("echo", json!({"text": "hi"}), &ctx).await.unwrap();
        assert_eq!(out, "hi\ndone");
    }
    manager.shutdown().await;
}
