//! Authenticated CDP proxy: the only externally reachable surface of a
//! browser container.
//!
//! Every WebSocket upgrade and discovery request must present a token
//! signed with this session's key. Failures close the socket with a
//! distinct code (4001 invalid, 4002 expired, 4003 scope, 4004 address,
//! 4005 connection cap, 4006 draining) so clients can tell refusals apart.
//! Accepted connections are bridged frame-by-frame to Chrome's loopback
//! CDP port, with screencast-scoped tokens restricted to the page, target,
//! and input domains.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};
use wallcrawler_protocol::{ConnectClaims, Scope, SessionId, SigningKey, TokenError, now_ts, verify};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

const CLOSE_CONNECTION_CAP: u16 = 4005;
const CLOSE_DRAINING: u16 = 4006;
const CLOSE_UPSTREAM_GONE: u16 = 1011;

pub struct ProxyState {
	session_id: SessionId,
	signing_key: SigningKey,
	cdp_port: u16,
	proxy_port: u16,
	connection_cap: usize,
	active: AtomicUsize,
	draining: AtomicBool,
	drained: Notify,
	http: reqwest::Client,
}

impl ProxyState {
	pub fn new(config: &AgentConfig) -> Arc<Self> {
		Self::with_limits(config.session_id.clone(), config.signing_key.clone(), config.cdp_port, config.proxy_port, config.connection_cap as usize)
	}

	pub fn with_limits(session_id: SessionId, signing_key: SigningKey, cdp_port: u16, proxy_port: u16, connection_cap: usize) -> Arc<Self> {
		Arc::new(Self {
			session_id,
			signing_key,
			cdp_port,
			proxy_port,
			connection_cap,
			active: AtomicUsize::new(0),
			draining: AtomicBool::new(false),
			drained: Notify::new(),
			http: reqwest::Client::new(),
		})
	}

	pub fn active_connections(&self) -> usize {
		self.active.load(Ordering::SeqCst)
	}

	/// Stops admitting connections; in-flight ones keep running.
	pub fn begin_drain(&self) {
		self.draining.store(true, Ordering::SeqCst);
		self.drained.notify_waiters();
	}

	/// Waits until every connection finished or the deadline lapsed.
	/// Returns whether the proxy fully drained.
	pub async fn wait_drained(&self, deadline: Duration) -> bool {
		let until = tokio::time::Instant::now() + deadline;
		loop {
			if self.active.load(Ordering::SeqCst) == 0 {
				return true;
			}
			let remaining = until.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return false;
			}
			let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
		}
	}

	fn try_acquire(self: &Arc<Self>) -> Option<ConnectionPermit> {
		let mut current = self.active.load(Ordering::SeqCst);
		loop {
			if current >= self.connection_cap {
				return None;
			}
			match self.active.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
				Ok(_) => return Some(ConnectionPermit { state: self.clone() }),
				Err(observed) => current = observed,
			}
		}
	}

	fn authorize(&self, token: Option<&str>, peer: SocketAddr) -> std::result::Result<ConnectClaims, TokenError> {
		let token = token.ok_or(TokenError::Malformed)?;
		let claims = verify(token, &self.signing_key, now_ts())?;
		if claims.sid != self.session_id.as_str() {
			return Err(TokenError::Malformed);
		}
		claims.check_client_ip(&peer.ip().to_string())?;
		Ok(claims)
	}
}

/// Active-connection guard; releases the slot and wakes the drain waiter.
struct ConnectionPermit {
	state: Arc<ProxyState>,
}

impl Drop for ConnectionPermit {
	fn drop(&mut self) {
		self.state.active.fetch_sub(1, Ordering::SeqCst);
		self.state.drained.notify_waiters();
	}
}

enum CdpTarget {
	Browser,
	Page(String),
}

impl CdpTarget {
	fn upstream_url(&self, cdp_port: u16) -> String {
		match self {
			CdpTarget::Browser => format!("ws://127.0.0.1:{cdp_port}/devtools/browser"),
			CdpTarget::Page(id) => format!("ws://127.0.0.1:{cdp_port}/devtools/page/{id}"),
		}
	}
}

pub fn router(state: Arc<ProxyState>) -> Router {
	Router::new()
		.route("/json", get(json_list))
		.route("/json/version", get(json_version))
		.route("/devtools/browser", get(ws_browser))
		.route("/devtools/page/{id}", get(ws_page))
		.with_state(state)
}

/// Serves the proxy until the shutdown signal flips.
pub async fn serve(state: Arc<ProxyState>, listener: tokio::net::TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
	let app = router(state);
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(async move {
			let _ = shutdown.changed().await;
		})
		.await
		.map_err(|err| AgentError::Proxy(err.to_string()))
}

async fn ws_browser(
	State(state): State<Arc<ProxyState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Query(params): Query<HashMap<String, String>>,
	ws: WebSocketUpgrade,
) -> Response {
	handle_ws(state, peer, params, ws, CdpTarget::Browser)
}

async fn ws_page(
	Path(id): Path<String>,
	State(state): State<Arc<ProxyState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Query(params): Query<HashMap<String, String>>,
	ws: WebSocketUpgrade,
) -> Response {
	handle_ws(state, peer, params, ws, CdpTarget::Page(id))
}

fn handle_ws(state: Arc<ProxyState>, peer: SocketAddr, params: HashMap<String, String>, ws: WebSocketUpgrade, target: CdpTarget) -> Response {
	let claims = match state.authorize(params.get("token").map(String::as_str), peer) {
		Ok(claims) => claims,
		Err(err) => {
			debug!(target = "wc.proxy", peer = %peer, error = %err, "rejecting connection");
			return ws.on_upgrade(move |socket| reject(socket, err.close_code(), err.to_string()));
		}
	};

	if state.draining.load(Ordering::SeqCst) {
		return ws.on_upgrade(move |socket| reject(socket, CLOSE_DRAINING, "session draining".to_string()));
	}
	let Some(permit) = state.try_acquire() else {
		debug!(target = "wc.proxy", peer = %peer, "connection cap reached");
		return ws.on_upgrade(move |socket| reject(socket, CLOSE_CONNECTION_CAP, "connection cap reached".to_string()));
	};

	info!(target = "wc.proxy", peer = %peer, scope = %claims.scope, "client connected");
	ws.on_upgrade(move |socket| bridge(state, socket, claims.scope, target, permit))
}

async fn reject(mut socket: WebSocket, code: u16, reason: String) {
	let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

/// Pumps frames between the client and Chrome, filtering client commands
/// against the token's scope.
async fn bridge(state: Arc<ProxyState>, client: WebSocket, scope: Scope, target: CdpTarget, permit: ConnectionPermit) {
	let upstream_url = target.upstream_url(state.cdp_port);
	let upstream = match connect_async(&upstream_url).await {
		Ok((stream, _)) => stream,
		Err(err) => {
			warn!(target = "wc.proxy", error = %err, url = %upstream_url, "upstream CDP connect failed");
			reject(client, CLOSE_UPSTREAM_GONE, "browser unavailable".to_string()).await;
			drop(permit);
			return;
		}
	};

	let (mut upstream_tx, mut upstream_rx) = upstream.split();
	let (mut client_tx, mut client_rx) = client.split();

	loop {
		tokio::select! {
			inbound = client_rx.next() => {
				match inbound {
					Some(Ok(Message::Text(text))) => {
						match screen_frame(scope, text.as_str()) {
							FrameVerdict::Forward => {
								if upstream_tx.send(UpstreamMessage::Text(text.as_str().to_owned())).await.is_err() {
									break;
								}
							}
							FrameVerdict::Deny(reply) => {
								debug!(target = "wc.proxy", "frame denied by scope");
								if client_tx.send(Message::Text(reply.to_string().into())).await.is_err() {
									break;
								}
							}
						}
					}
					Some(Ok(Message::Binary(data))) => {
						if upstream_tx.send(UpstreamMessage::Binary(data.to_vec())).await.is_err() {
							break;
						}
					}
					// Ping/pong is answered by the websocket layer itself.
					Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Err(err)) => {
						debug!(target = "wc.proxy", error = %err, "client socket error");
						break;
					}
				}
			}
			outbound = upstream_rx.next() => {
				match outbound {
					Some(Ok(UpstreamMessage::Text(text))) => {
						if client_tx.send(Message::Text(text.into())).await.is_err() {
							break;
						}
					}
					Some(Ok(UpstreamMessage::Binary(data))) => {
						if client_tx.send(Message::Binary(data.into())).await.is_err() {
							break;
						}
					}
					Some(Ok(UpstreamMessage::Ping(_))) | Some(Ok(UpstreamMessage::Pong(_))) => {}
					Some(Ok(UpstreamMessage::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						debug!(target = "wc.proxy", error = %err, "upstream socket error");
						break;
					}
				}
			}
		}
	}

	let _ = client_tx.send(Message::Close(None)).await;
	let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
	drop(permit);
	info!(target = "wc.proxy", "client disconnected");
}

enum FrameVerdict {
	Forward,
	Deny(Value),
}

/// Scope gate for one client frame. Commands outside the scope are answered
/// with a JSON-RPC error instead of reaching Chrome.
fn screen_frame(scope: Scope, raw: &str) -> FrameVerdict {
	let Ok(value) = serde_json::from_str::<Value>(raw) else {
		return FrameVerdict::Forward;
	};
	let Some(method) = value.get("method").and_then(Value::as_str) else {
		return FrameVerdict::Forward;
	};
	if scope.allows_method(method) {
		return FrameVerdict::Forward;
	}
	let id = value.get("id").cloned().unwrap_or(Value::Null);
	FrameVerdict::Deny(json!({
		"id": id,
		"error": { "code": -32601, "message": format!("method {method} not permitted for scope {scope}") }
	}))
}

async fn json_version(
	State(state): State<Arc<ProxyState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Query(params): Query<HashMap<String, String>>,
) -> Response {
	let token = params.get("token").map(String::as_str);
	let _claims = match authorize_http(&state, token, peer) {
		Ok(claims) => claims,
		Err(response) => return response,
	};

	match state.http.get(format!("http://127.0.0.1:{}/json/version", state.cdp_port)).send().await {
		Ok(response) => match response.json::<Value>().await {
			Ok(mut body) => {
				let authority = public_authority(&headers, state.proxy_port);
				if let Some(obj) = body.as_object_mut() {
					obj.insert(
						"webSocketDebuggerUrl".to_string(),
						Value::String(format!("ws://{authority}/devtools/browser?token={}", token.unwrap_or_default())),
					);
				}
				axum::Json(body).into_response()
			}
			Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
		},
		Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
	}
}

async fn json_list(
	State(state): State<Arc<ProxyState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Query(params): Query<HashMap<String, String>>,
) -> Response {
	let token = params.get("token").map(String::as_str);
	let _claims = match authorize_http(&state, token, peer) {
		Ok(claims) => claims,
		Err(response) => return response,
	};

	match state.http.get(format!("http://127.0.0.1:{}/json", state.cdp_port)).send().await {
		Ok(response) => match response.json::<Value>().await {
			Ok(mut body) => {
				let authority = public_authority(&headers, state.proxy_port);
				if let Some(targets) = body.as_array_mut() {
					for entry in targets {
						rewrite_target(entry, &authority, token.unwrap_or_default());
					}
				}
				axum::Json(body).into_response()
			}
			Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
		},
		Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
	}
}

/// Discovery requires the `debug` scope on top of a valid token.
fn authorize_http(state: &ProxyState, token: Option<&str>, peer: SocketAddr) -> std::result::Result<ConnectClaims, Response> {
	let claims = state.authorize(token, peer).map_err(http_reject)?;
	if !claims.scope.allows_http_discovery() {
		return Err(http_reject(TokenError::ScopeMismatch));
	}
	Ok(claims)
}

fn http_reject(err: TokenError) -> Response {
	let status = match err {
		TokenError::ScopeMismatch | TokenError::IpMismatch => StatusCode::FORBIDDEN,
		_ => StatusCode::UNAUTHORIZED,
	};
	(status, err.to_string()).into_response()
}

/// Chrome advertises loopback ws URLs; clients must get the proxy's
/// authority with their token re-attached.
fn rewrite_target(entry: &mut Value, authority: &str, token: &str) {
	let Some(obj) = entry.as_object_mut() else { return };
	let id = obj.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
	obj.insert("webSocketDebuggerUrl".to_string(), Value::String(format!("ws://{authority}/devtools/page/{id}?token={token}")));
	obj.remove("devtoolsFrontendUrl");
}

fn public_authority(headers: &HeaderMap, proxy_port: u16) -> String {
	headers
		.get(header::HOST)
		.and_then(|value| value.to_str().ok())
		.map(str::to_string)
		.unwrap_or_else(|| format!("127.0.0.1:{proxy_port}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn screencast_frames_are_screened_by_method() {
		let verdict = screen_frame(Scope::Screencast, r#"{"id":7,"method":"DOM.setAttributeValue","params":{}}"#);
		let FrameVerdict::Deny(reply) = verdict else { panic!("mutating call must be denied") };
		assert_eq!(reply["id"], 7);
		assert_eq!(reply["error"]["code"], -32601);

		assert!(matches!(screen_frame(Scope::Screencast, r#"{"id":8,"method":"Page.startScreencast"}"#), FrameVerdict::Forward));
		assert!(matches!(screen_frame(Scope::CdpDirect, r#"{"id":9,"method":"DOM.setAttributeValue"}"#), FrameVerdict::Forward));
	}

	#[test]
	fn non_command_frames_pass_through() {
		assert!(matches!(screen_frame(Scope::Screencast, "not json"), FrameVerdict::Forward));
		assert!(matches!(screen_frame(Scope::Screencast, r#"{"id":1,"result":{}}"#), FrameVerdict::Forward));
	}

	#[test]
	fn target_rewrite_points_at_proxy_with_token() {
		let mut entry = json!({
			"id": "page-1",
			"webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/page-1",
			"devtoolsFrontendUrl": "/devtools/inspector.html?ws=127.0.0.1:9222"
		});
		rewrite_target(&mut entry, "203.0.113.5:9223", "tok.sig");
		assert_eq!(entry["webSocketDebuggerUrl"], "ws://203.0.113.5:9223/devtools/page/page-1?token=tok.sig");
		assert!(entry.get("devtoolsFrontendUrl").is_none());
	}
}
