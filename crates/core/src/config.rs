//! Orchestrator configuration, injected at component construction.

use std::time::Duration;

use wallcrawler_protocol::MAX_TOKEN_TTL_SECS;

/// Tunables for the whole orchestrator. One value is built at startup and
/// cloned into each component; there is no process-wide configuration state.
#[derive(Debug, Clone)]
pub struct Config {
	/// Upper bound on a session's requested lifetime, seconds.
	pub max_session_timeout: u64,
	/// Launch attempts before a create is failed terminally.
	pub provisioner_max_attempts: u32,
	/// First retry delay; doubles per attempt.
	pub provisioner_backoff_base: Duration,
	/// How long a create-and-wait caller blocks for readiness.
	pub readiness_wait_timeout: Duration,
	/// Lifetime of minted connection tokens, seconds (clamped to the
	/// protocol maximum).
	pub token_ttl_secs: u64,
	/// Concurrent proxy connections allowed per session.
	pub proxy_connection_cap: u32,
	/// How long a draining agent waits for in-flight connections.
	pub drain_deadline: Duration,
	/// Bind façade-minted tokens to the requesting client IP.
	pub bind_token_to_client_ip: bool,
	/// Cap applied when a project record does not carry its own.
	pub default_project_concurrency: u32,
	/// Bound on each outbound store/bus/platform call.
	pub call_timeout: Duration,
	/// Period of the expiry sweeper.
	pub sweep_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_session_timeout: 3600,
			provisioner_max_attempts: 3,
			provisioner_backoff_base: Duration::from_millis(500),
			readiness_wait_timeout: Duration::from_secs(60),
			token_ttl_secs: 300,
			proxy_connection_cap: 4,
			drain_deadline: Duration::from_secs(10),
			bind_token_to_client_ip: false,
			default_project_concurrency: 5,
			call_timeout: Duration::from_secs(5),
			sweep_interval: Duration::from_secs(30),
		}
	}
}

impl Config {
	pub fn token_ttl(&self) -> u64 {
		self.token_ttl_secs.min(MAX_TOKEN_TTL_SECS)
	}
}
