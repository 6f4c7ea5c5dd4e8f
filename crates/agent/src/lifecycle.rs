//! Agent-local state machine: `Boot -> ChromeStarting -> ChromeReady ->
//! Serving -> Draining -> Exited`.
//!
//! `Serving` is the steady state; the proxy admits connections and the
//! agent sits on its command queue. Termination drains the proxy under the
//! configured deadline, persists the profile when the session asked for
//! it, stops Chrome, and publishes the cleanup notice as the final act.

use std::fmt;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use wallcrawler_protocol::{AgentCommand, LifecycleEvent, SessionStatus, now_ts};

use crate::chrome::ChromeProcess;
use crate::config::AgentConfig;
use crate::control::EventSink;
use crate::error::Result;
use crate::profile;
use crate::proxy::{self, ProxyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
	Boot,
	ChromeStarting,
	ChromeReady,
	Serving,
	Draining,
	Exited,
}

impl fmt::Display for AgentPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			AgentPhase::Boot => "boot",
			AgentPhase::ChromeStarting => "chrome-starting",
			AgentPhase::ChromeReady => "chrome-ready",
			AgentPhase::Serving => "serving",
			AgentPhase::Draining => "draining",
			AgentPhase::Exited => "exited",
		};
		f.write_str(name)
	}
}

pub struct Agent {
	config: AgentConfig,
	phase_tx: watch::Sender<AgentPhase>,
}

impl Agent {
	pub fn new(config: AgentConfig) -> Self {
		let (phase_tx, _) = watch::channel(AgentPhase::Boot);
		Self { config, phase_tx }
	}

	/// Observe phase changes; used by tests and health probes.
	pub fn phases(&self) -> watch::Receiver<AgentPhase> {
		self.phase_tx.subscribe()
	}

	fn set_phase(&self, phase: AgentPhase) {
		info!(target = "wc.agent", session = %self.config.session_id, %phase, "phase");
		let _ = self.phase_tx.send(phase);
	}

	pub async fn run(self, mut commands: mpsc::UnboundedReceiver<AgentCommand>, events: EventSink) -> Result<()> {
		self.set_phase(AgentPhase::Boot);
		if self.config.context.is_some() {
			if let Some(url) = &self.config.profile_download_url {
				profile::hydrate(url, &self.config.user_data_dir).await?;
			}
		}

		self.set_phase(AgentPhase::ChromeStarting);
		let mut launched = ChromeProcess::launch(&self.config)?;
		launched.wait_ready().await?;
		let mut chrome = Some(launched);
		self.set_phase(AgentPhase::ChromeReady);

		let proxy_state = ProxyState::new(&self.config);
		let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.proxy_port)).await?;
		let (proxy_shutdown_tx, proxy_shutdown_rx) = watch::channel(false);
		let server = tokio::spawn(proxy::serve(proxy_state.clone(), listener, proxy_shutdown_rx));
		self.set_phase(AgentPhase::Serving);

		let terminate_reason = loop {
			match commands.recv().await {
				Some(AgentCommand::Terminate { reason }) => break reason,
				Some(AgentCommand::PersistProfile) => {
					if let Some(url) = &self.config.profile_upload_url {
						if let Err(err) = profile::persist(url, &self.config.user_data_dir).await {
							warn!(target = "wc.agent", error = %err, "on-demand profile persist failed");
						}
					} else {
						warn!(target = "wc.agent", "persist requested but no upload url attached");
					}
				}
				Some(AgentCommand::ReloadContext { context }) => {
					info!(target = "wc.agent", context = %context.id, "reloading context");
					if let Some(process) = chrome.take() {
						process.shutdown().await;
					}
					if let Some(url) = &self.config.profile_download_url {
						if let Err(err) = profile::hydrate(url, &self.config.user_data_dir).await {
							warn!(target = "wc.agent", error = %err, "context hydrate failed; continuing with prior profile");
						}
					}
					let mut relaunched = ChromeProcess::launch(&self.config)?;
					relaunched.wait_ready().await?;
					chrome = Some(relaunched);
				}
				// Queue closed: every command source is gone, shut down.
				None => break Some("command channel closed".to_string()),
			}
		};

		self.set_phase(AgentPhase::Draining);
		info!(target = "wc.agent", reason = terminate_reason.as_deref().unwrap_or("unspecified"), "terminating");
		proxy_state.begin_drain();
		if !proxy_state.wait_drained(self.config.drain_deadline).await {
			warn!(
				target = "wc.agent",
				open = proxy_state.active_connections(),
				"drain deadline lapsed with connections open"
			);
		}

		if self.config.persist_on_exit() {
			if let Some(url) = &self.config.profile_upload_url {
				if let Err(err) = profile::persist(url, &self.config.user_data_dir).await {
					warn!(target = "wc.agent", error = %err, "final profile persist failed");
				}
			}
		}

		if let Some(process) = chrome.take() {
			process.shutdown().await;
		}
		let _ = proxy_shutdown_tx.send(true);
		let _ = server.await;

		events.publish(LifecycleEvent::SessionCleanupCompleted {
			session_id: self.config.session_id.clone(),
			project_id: self.config.project_id.clone(),
			final_status: SessionStatus::Stopped,
			at: now_ts(),
		});
		self.set_phase(AgentPhase::Exited);
		Ok(())
	}
}
