use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};

use crate::DAEMON_TCP_PORT;
use crate::rpc::OrchestratorRpcClient as _;

const DAEMON_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn daemon_endpoint_url() -> String {
	format!("http://127.0.0.1:{DAEMON_TCP_PORT}")
}

pub fn connect_client() -> Result<HttpClient> {
	build_client(None)
}

pub fn connect_probe_client() -> Result<HttpClient> {
	build_client(Some(DAEMON_PROBE_TIMEOUT))
}

/// Probes the daemon; `None` when it is simply not running.
pub async fn try_connect() -> Option<HttpClient> {
	let probe = connect_probe_client().ok()?;
	match probe.ping().await {
		Ok(true) => connect_client().ok(),
		Ok(false) => None,
		Err(err) if is_not_running_error(&err) => None,
		Err(_) => None,
	}
}

fn build_client(request_timeout: Option<Duration>) -> Result<HttpClient> {
	let mut builder = HttpClientBuilder::default();
	if let Some(timeout) = request_timeout {
		builder = builder.request_timeout(timeout);
	}
	builder.build(daemon_endpoint_url()).context("Failed to create daemon RPC client")
}

pub fn is_not_running_error(err: &ClientError) -> bool {
	if matches!(err, ClientError::RestartNeeded(_) | ClientError::RequestTimeout | ClientError::ParseError(_)) {
		return true;
	}

	if let ClientError::Transport(transport_err) = err {
		if let Some(io_err) = transport_err.downcast_ref::<std::io::Error>() {
			if matches!(
				io_err.kind(),
				ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::NotConnected | ErrorKind::TimedOut
			) {
				return true;
			}
		}
	}

	let msg = err.to_string().to_ascii_lowercase();
	msg.contains("connection refused")
		|| msg.contains("connection reset")
		|| msg.contains("error trying to connect")
		|| msg.contains("dns error")
		|| msg.contains("tcp connect error")
		|| msg.contains("request timeout")
		|| msg.contains("connection closed before message completed")
}
