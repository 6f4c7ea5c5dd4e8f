//! Agent configuration from the launch environment.

use std::path::PathBuf;
use std::time::Duration;

use wallcrawler_protocol::{ContextRef, ProjectId, SessionId, SigningKey};

use crate::error::{AgentError, Result};

const DEFAULT_CDP_PORT: u16 = 9222;
const DEFAULT_PROXY_PORT: u16 = 9223;
const DEFAULT_CONNECTION_CAP: u32 = 4;
const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub session_id: SessionId,
	pub project_id: ProjectId,
	pub signing_key: SigningKey,
	pub cdp_port: u16,
	pub proxy_port: u16,
	pub context: Option<ContextRef>,
	pub profile_download_url: Option<String>,
	pub profile_upload_url: Option<String>,
	pub control_url: Option<String>,
	pub connection_cap: u32,
	pub drain_deadline: Duration,
	/// Explicit Chrome binary; otherwise well-known names are probed.
	pub chrome_bin: Option<PathBuf>,
	pub user_data_dir: PathBuf,
}

impl AgentConfig {
	/// Reads the `WALLCRAWLER_*` contract from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		let session_id = SessionId::new(require(&lookup, "WALLCRAWLER_SESSION_ID")?);
		let project_id = ProjectId::new(require(&lookup, "WALLCRAWLER_PROJECT_ID")?);
		let signing_key = SigningKey::from_string(require(&lookup, "WALLCRAWLER_SIGNING_KEY")?);

		let cdp_port = parse_or(&lookup, "WALLCRAWLER_CDP_PORT", DEFAULT_CDP_PORT)?;
		let proxy_port = parse_or(&lookup, "WALLCRAWLER_PROXY_PORT", DEFAULT_PROXY_PORT)?;
		let connection_cap = parse_or(&lookup, "WALLCRAWLER_CONNECTION_CAP", DEFAULT_CONNECTION_CAP)?;
		let drain_secs = parse_or(&lookup, "WALLCRAWLER_DRAIN_DEADLINE_SECS", DEFAULT_DRAIN_DEADLINE_SECS)?;

		let context = lookup("WALLCRAWLER_CONTEXT_ID").map(|id| ContextRef {
			id,
			persist: lookup("WALLCRAWLER_CONTEXT_PERSIST").is_some_and(|v| v == "true"),
		});

		let user_data_dir = match lookup("WALLCRAWLER_USER_DATA_DIR") {
			Some(dir) => PathBuf::from(dir),
			None => std::env::temp_dir().join(format!("wallcrawler-profile-{session_id}")),
		};

		Ok(Self {
			session_id,
			project_id,
			signing_key,
			cdp_port,
			proxy_port,
			context,
			profile_download_url: lookup("WALLCRAWLER_PROFILE_DOWNLOAD_URL"),
			profile_upload_url: lookup("WALLCRAWLER_PROFILE_UPLOAD_URL"),
			control_url: lookup("WALLCRAWLER_CONTROL_URL"),
			connection_cap,
			drain_deadline: Duration::from_secs(drain_secs),
			chrome_bin: lookup("WALLCRAWLER_CHROME_BIN").map(PathBuf::from),
			user_data_dir,
		})
	}

	/// Whether termination should snapshot the profile back to the store.
	pub fn persist_on_exit(&self) -> bool {
		self.context.as_ref().is_some_and(|c| c.persist) && self.profile_upload_url.is_some()
	}
}

fn require(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<String> {
	lookup(key).filter(|v| !v.is_empty()).ok_or(AgentError::MissingEnv(key))
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T> {
	match lookup(key) {
		None => Ok(default),
		Some(raw) => raw.parse().map_err(|_| AgentError::InvalidEnv { key, value: raw }),
	}
}
