//! Proxy gateway tests against a stub CDP backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use wallcrawler_agent::proxy::{ProxyState, serve};
use wallcrawler_protocol::{ConnectClaims, ProjectId, Scope, SessionId, SigningKey, now_ts};

/// Minimal CDP stand-in: answers every command frame with
/// `{"id": .., "result": {"echoed": "<method>"}}`.
async fn start_stub_cdp() -> SocketAddr {
	async fn ws_echo(ws: WebSocketUpgrade) -> Response {
		ws.on_upgrade(|mut socket| async move {
			while let Some(Ok(message)) = socket.recv().await {
				if let WsMessage::Text(text) = message {
					let value: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
					let reply = json!({
						"id": value.get("id").cloned().unwrap_or(Value::Null),
						"result": { "echoed": value.get("method").and_then(Value::as_str).unwrap_or("") }
					});
					if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
						break;
					}
				}
			}
		})
	}

	let app = Router::new()
		.route("/devtools/browser", get(ws_echo))
		.route("/devtools/page/{id}", get(ws_echo))
		.route("/json/version", get(|| async { axum::Json(json!({ "Browser": "Stub/1.0", "Protocol-Version": "1.3" })) }))
		.route(
			"/json",
			get(|| async {
				axum::Json(json!([{
					"id": "page-1",
					"type": "page",
					"webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/page-1",
					"devtoolsFrontendUrl": "/devtools/inspector.html"
				}]))
			}),
		);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = axum::serve(listener, app.into_make_service()).await;
	});
	addr
}

struct Harness {
	addr: SocketAddr,
	state: Arc<ProxyState>,
	session_id: SessionId,
	project_id: ProjectId,
	key: SigningKey,
	_shutdown: watch::Sender<bool>,
}

impl Harness {
	fn token(&self, scope: Scope) -> String {
		ConnectClaims::new(&self.session_id, &self.project_id, scope, 300, now_ts()).sign(&self.key).unwrap()
	}

	fn ws_url(&self, token: &str) -> String {
		format!("ws://{}/devtools/browser?token={token}", self.addr)
	}
}

async fn start_proxy(connection_cap: usize) -> Harness {
	let cdp = start_stub_cdp().await;
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let session_id = SessionId::new("sess-under-test");
	let project_id = ProjectId::new("p1");
	let key = SigningKey::generate();
	let state = ProxyState::with_limits(session_id.clone(), key.clone(), cdp.port(), addr.port(), connection_cap);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	{
		let state = state.clone();
		tokio::spawn(async move {
			let _ = serve(state, listener, shutdown_rx).await;
		});
	}

	Harness {
		addr,
		state,
		session_id,
		project_id,
		key,
		_shutdown: shutdown_tx,
	}
}

async fn expect_close_code(url: &str) -> u16 {
	let (mut stream, _) = connect_async(url).await.expect("upgrade succeeds before the close frame");
	loop {
		match stream.next().await {
			Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
			Some(Ok(Message::Close(None))) => return 1005,
			Some(Ok(_)) => continue,
			Some(Err(err)) => panic!("socket error instead of close frame: {err}"),
			None => panic!("socket ended without a close frame"),
		}
	}
}

#[tokio::test]
async fn valid_token_bridges_cdp_round_trip() {
	let harness = start_proxy(4).await;
	let token = harness.token(Scope::CdpDirect);

	let (mut stream, _) = connect_async(harness.ws_url(&token)).await.unwrap();
	stream
		.send(Message::Text(json!({"id": 1, "method": "Browser.getVersion"}).to_string()))
		.await
		.unwrap();

	let reply = loop {
		match stream.next().await.unwrap().unwrap() {
			Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
			_ => continue,
		}
	};
	assert_eq!(reply["id"], 1);
	assert_eq!(reply["result"]["echoed"], "Browser.getVersion");
}

#[tokio::test]
async fn missing_or_garbage_token_closes_4001() {
	let harness = start_proxy(4).await;
	assert_eq!(expect_close_code(&format!("ws://{}/devtools/browser", harness.addr)).await, 4001);
	assert_eq!(expect_close_code(&harness.ws_url("garbage.token")).await, 4001);
}

#[tokio::test]
async fn expired_token_closes_4002() {
	let harness = start_proxy(4).await;
	let expired = ConnectClaims::new(&harness.session_id, &harness.project_id, Scope::CdpDirect, 1, now_ts() - 120)
		.sign(&harness.key)
		.unwrap();
	assert_eq!(expect_close_code(&harness.ws_url(&expired)).await, 4002);
}

#[tokio::test]
async fn foreign_session_token_closes_4001() {
	let harness = start_proxy(4).await;
	let foreign_key = SigningKey::generate();
	let foreign = ConnectClaims::new(&SessionId::new("other"), &harness.project_id, Scope::CdpDirect, 300, now_ts())
		.sign(&foreign_key)
		.unwrap();
	assert_eq!(expect_close_code(&harness.ws_url(&foreign)).await, 4001);
}

#[tokio::test]
async fn ip_bound_token_from_wrong_peer_closes_4004() {
	let harness = start_proxy(4).await;
	let bound = ConnectClaims::new(&harness.session_id, &harness.project_id, Scope::CdpDirect, 300, now_ts())
		.with_client_ip("203.0.113.9")
		.sign(&harness.key)
		.unwrap();
	assert_eq!(expect_close_code(&harness.ws_url(&bound)).await, 4004);
}

#[tokio::test]
async fn screencast_scope_filters_mutating_methods() {
	let harness = start_proxy(4).await;
	let token = harness.token(Scope::Screencast);

	let (mut stream, _) = connect_async(harness.ws_url(&token)).await.unwrap();

	// Denied method is answered by the proxy, never forwarded.
	stream
		.send(Message::Text(json!({"id": 5, "method": "DOM.setAttributeValue", "params": {}}).to_string()))
		.await
		.unwrap();
	let denial = loop {
		match stream.next().await.unwrap().unwrap() {
			Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
			_ => continue,
		}
	};
	assert_eq!(denial["id"], 5);
	assert!(denial["error"]["message"].as_str().unwrap().contains("DOM.setAttributeValue"));

	// Screencast traffic still flows.
	stream
		.send(Message::Text(json!({"id": 6, "method": "Page.startScreencast"}).to_string()))
		.await
		.unwrap();
	let allowed = loop {
		match stream.next().await.unwrap().unwrap() {
			Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
			_ => continue,
		}
	};
	assert_eq!(allowed["result"]["echoed"], "Page.startScreencast");
}

#[tokio::test]
async fn connection_cap_closes_4005() {
	let harness = start_proxy(1).await;
	let token = harness.token(Scope::CdpDirect);

	let (_held, _) = connect_async(harness.ws_url(&token)).await.unwrap();
	// Give the first upgrade time to take the only slot.
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(expect_close_code(&harness.ws_url(&token)).await, 4005);
}

#[tokio::test]
async fn draining_proxy_closes_4006() {
	let harness = start_proxy(4).await;
	harness.state.begin_drain();
	let token = harness.token(Scope::CdpDirect);
	assert_eq!(expect_close_code(&harness.ws_url(&token)).await, 4006);
}

#[tokio::test]
async fn drain_completes_once_connections_finish() {
	let harness = start_proxy(4).await;
	let token = harness.token(Scope::CdpDirect);

	let (mut stream, _) = connect_async(harness.ws_url(&token)).await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	harness.state.begin_drain();

	let state = harness.state.clone();
	let waiter = tokio::spawn(async move { state.wait_drained(Duration::from_secs(5)).await });

	stream.close(None).await.unwrap();
	assert!(waiter.await.unwrap(), "drain should finish when the last connection closes");
}

#[tokio::test]
async fn http_discovery_requires_debug_scope() {
	let harness = start_proxy(4).await;

	let unauthorized = reqwest::get(format!("http://{}/json/version", harness.addr)).await.unwrap();
	assert_eq!(unauthorized.status(), 401);

	let wrong_scope = reqwest::get(format!("http://{}/json/version?token={}", harness.addr, harness.token(Scope::CdpDirect)))
		.await
		.unwrap();
	assert_eq!(wrong_scope.status(), 403);

	let ok = reqwest::get(format!("http://{}/json/version?token={}", harness.addr, harness.token(Scope::Debug)))
		.await
		.unwrap();
	assert_eq!(ok.status(), 200);
	let body: Value = ok.json().await.unwrap();
	assert_eq!(body["Browser"], "Stub/1.0");
	let ws_url = body["webSocketDebuggerUrl"].as_str().unwrap();
	assert!(ws_url.contains(&harness.addr.to_string()), "rewritten to the proxy authority: {ws_url}");
	assert!(ws_url.contains("token="));
}

#[tokio::test]
async fn target_list_rewrites_page_urls() {
	let harness = start_proxy(4).await;
	let token = harness.token(Scope::Debug);

	let response = reqwest::get(format!("http://{}/json?token={token}", harness.addr)).await.unwrap();
	assert_eq!(response.status(), 200);
	let body: Value = response.json().await.unwrap();
	let entry = &body.as_array().unwrap()[0];

	let ws_url = entry["webSocketDebuggerUrl"].as_str().unwrap();
	assert!(ws_url.contains("/devtools/page/page-1"), "{ws_url}");
	assert!(ws_url.contains(&format!("token={token}")));
	assert!(entry.get("devtoolsFrontendUrl").is_none());
}
