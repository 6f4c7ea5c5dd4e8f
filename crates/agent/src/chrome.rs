//! Headless Chrome process management: launch, CDP readiness probing, and
//! graceful shutdown.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

const BOOT_DEADLINE: Duration = Duration::from_secs(30);
const PROBE_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const CHROME_CANDIDATES: &[&str] = &["chromium", "chromium-browser", "google-chrome", "google-chrome-stable", "chrome"];

/// Version details reported by Chrome's `/json/version` endpoint.
#[derive(Debug, Clone)]
pub struct ChromeVersion {
	pub browser: String,
	pub protocol_version: String,
}

pub struct ChromeProcess {
	child: Child,
	cdp_port: u16,
}

impl ChromeProcess {
	/// Spawns Chrome with CDP bound to loopback only; the proxy is the sole
	/// externally reachable surface.
	pub fn launch(config: &AgentConfig) -> Result<Self> {
		let binary = resolve_binary(config.chrome_bin.clone())?;
		std::fs::create_dir_all(&config.user_data_dir)?;

		let mut command = Command::new(&binary);
		command
			.arg("--headless=new")
			.arg("--remote-debugging-address=127.0.0.1")
			.arg(format!("--remote-debugging-port={}", config.cdp_port))
			.arg(format!("--user-data-dir={}", config.user_data_dir.display()))
			.arg("--no-first-run")
			.arg("--no-default-browser-check")
			.arg("--disable-gpu")
			.arg("--disable-dev-shm-usage")
			.arg("--no-sandbox")
			.stdin(std::process::Stdio::null())
			.kill_on_drop(true);

		let child = command.spawn().map_err(|err| AgentError::ChromeLaunch(format!("{}: {err}", binary.display())))?;
		info!(target = "wc.agent", binary = %binary.display(), cdp_port = config.cdp_port, "chrome spawned");
		Ok(Self { child, cdp_port: config.cdp_port })
	}

	/// Polls the version endpoint until CDP answers or the deadline lapses.
	pub async fn wait_ready(&mut self) -> Result<ChromeVersion> {
		let url = format!("http://127.0.0.1:{}/json/version", self.cdp_port);
		let client = reqwest::Client::new();
		let deadline = tokio::time::Instant::now() + BOOT_DEADLINE;

		loop {
			if let Ok(Some(status)) = self.child.try_wait() {
				return Err(AgentError::ChromeLaunch(format!("chrome exited during boot: {status}")));
			}
			match client.get(&url).send().await {
				Ok(response) if response.status().is_success() => {
					let body: Value = response.json().await?;
					let version = ChromeVersion {
						browser: body.get("Browser").and_then(Value::as_str).unwrap_or("unknown").to_string(),
						protocol_version: body.get("Protocol-Version").and_then(Value::as_str).unwrap_or("1.3").to_string(),
					};
					info!(target = "wc.agent", browser = %version.browser, "chrome CDP ready");
					return Ok(version);
				}
				Ok(response) => {
					debug!(target = "wc.agent", status = %response.status(), "CDP probe not ready");
				}
				Err(err) => {
					debug!(target = "wc.agent", error = %err, "CDP probe failed");
				}
			}
			if tokio::time::Instant::now() >= deadline {
				return Err(AgentError::ChromeBootTimeout(BOOT_DEADLINE));
			}
			tokio::time::sleep(PROBE_INTERVAL).await;
		}
	}

	/// Graceful signal first; force-kill once the grace period lapses.
	pub async fn shutdown(mut self) {
		#[cfg(unix)]
		if let Some(pid) = self.child.id() {
			unsafe {
				libc::kill(pid as i32, libc::SIGTERM);
			}
			match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
				Ok(_) => {
					debug!(target = "wc.agent", "chrome exited on SIGTERM");
					return;
				}
				Err(_) => warn!(target = "wc.agent", "chrome ignored SIGTERM; killing"),
			}
		}
		if let Err(err) = self.child.start_kill() {
			warn!(target = "wc.agent", error = %err, "chrome kill failed");
		}
		let _ = self.child.wait().await;
	}
}

fn resolve_binary(configured: Option<PathBuf>) -> Result<PathBuf> {
	if let Some(path) = configured {
		return Ok(path);
	}
	for candidate in CHROME_CANDIDATES {
		if let Ok(path) = which::which(candidate) {
			return Ok(path);
		}
	}
	Err(AgentError::ChromeNotFound)
}
