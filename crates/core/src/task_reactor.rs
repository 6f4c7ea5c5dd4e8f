//! Task-state reactor: consumes container-runtime status changes and drives
//! sessions to `READY` or `FAILED`.
//!
//! Idempotent by construction: late events for terminal sessions are
//! discarded, and a promotion that loses its compare-and-set to a terminate
//! is dropped rather than re-applied.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wallcrawler_protocol::{
	ConnectClaims, EventSource, FailureReason, LifecycleEvent, Scope, SessionId, SessionRecord, SessionStatus, SessionView, TaskHandle, connect_url, now_ts,
	topics,
};
use wallcrawler_runtime::{
	ContainerPlatform, EventBus, ReadinessNotifier, ReadyOutcome, SessionStore, StoreError, TaskBinding, TaskNetwork, TaskState, TaskStateEvent,
	WorkflowCallback,
};

use crate::calls::bounded;
use crate::config::Config;
use crate::error::{LifecycleError, Result};

const CAS_ATTEMPTS: u32 = 5;
const RESOLVE_ATTEMPTS: u32 = 3;

pub struct TaskStateReactor {
	config: Config,
	store: Arc<dyn SessionStore>,
	bus: Arc<dyn EventBus>,
	platform: Arc<dyn ContainerPlatform>,
	notifier: Arc<dyn ReadinessNotifier>,
	callback: Arc<dyn WorkflowCallback>,
}

impl TaskStateReactor {
	pub fn new(
		config: Config,
		store: Arc<dyn SessionStore>,
		bus: Arc<dyn EventBus>,
		platform: Arc<dyn ContainerPlatform>,
		notifier: Arc<dyn ReadinessNotifier>,
		callback: Arc<dyn WorkflowCallback>,
	) -> Self {
		Self {
			config,
			store,
			bus,
			platform,
			notifier,
			callback,
		}
	}

	pub fn spawn(self: Arc<Self>, mut events: tokio::sync::mpsc::UnboundedReceiver<TaskStateEvent>) -> JoinHandle<()> {
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				let reactor = self.clone();
				tokio::spawn(async move {
					let task = event.task.clone();
					if let Err(err) = reactor.handle(event).await {
						warn!(target = "wc.tasks", task = %task, error = %err, "task-state handling failed");
					}
				});
			}
		})
	}

	async fn handle(&self, event: TaskStateEvent) -> Result<()> {
		let Some(session_id) = self.correlate(&event).await? else {
			debug!(target = "wc.tasks", task = %event.task, "task-state event with no session binding; dropping");
			return Ok(());
		};

		match event.state.clone() {
			TaskState::Running { network } => self.handle_running(&session_id, &event, network).await,
			TaskState::Stopped { reason } => self.handle_stopped(&session_id, &event, &reason).await,
		}
	}

	/// Session id from the task environment when present, else the reverse
	/// index repopulated by the provisioner at launch.
	async fn correlate(&self, event: &TaskStateEvent) -> Result<Option<SessionId>> {
		if let Some(id) = &event.session_id {
			return Ok(Some(id.clone()));
		}
		let binding = bounded(self.config.call_timeout, "binding lookup", self.store.task_binding(&event.task)).await?;
		Ok(binding.map(|b| b.session_id))
	}

	async fn handle_running(&self, session_id: &SessionId, event: &TaskStateEvent, network: Option<TaskNetwork>) -> Result<()> {
		let versioned = match bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await {
			Ok(versioned) => versioned,
			Err(LifecycleError::NotFound) => return Ok(()),
			Err(err) => return Err(err),
		};
		if !matches!(versioned.record.status, SessionStatus::Provisioning | SessionStatus::Starting) {
			debug!(target = "wc.tasks", session = %session_id, status = %versioned.record.status, "RUNNING for non-promotable session; dropping");
			return Ok(());
		}

		let endpoint = match self.resolve_network(network).await {
			Ok(endpoint) => endpoint,
			Err(err) => {
				warn!(target = "wc.tasks", session = %session_id, error = %err, "endpoint resolution exhausted");
				self.fail_session(session_id, FailureReason::EndpointUnresolved, "network attachment unresolved").await?;
				return Ok(());
			}
		};

		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			match record.status {
				SessionStatus::Provisioning | SessionStatus::Starting => {
					// The ECS-style runtime can report RUNNING before the
					// launch call returned; bind the task on the way through.
					if record.task_handle.is_none() {
						record.task_handle = Some(event.task.clone());
					}
					let claims = ConnectClaims::new(&record.id, &record.project_id, Scope::CdpDirect, self.config.token_ttl(), now_ts());
					let token = claims.sign(&record.signing_key).map_err(|err| LifecycleError::Internal(err.to_string()))?;
					if record.status == SessionStatus::Provisioning {
						record.apply_transition(SessionStatus::Starting, EventSource::TaskReactor, None)?;
					}
					record.public_endpoint = Some(endpoint.to_string());
					record.apply_transition(SessionStatus::Ready, EventSource::TaskReactor, Some(json!({ "endpoint": endpoint.to_string() })))?;
					record.connect_url = Some(connect_url(&endpoint.ip().to_string(), endpoint.port(), &token));

					match self.store.update(record, versioned.version).await {
						Ok(committed) => {
							let view = committed.record.view();
							info!(target = "wc.tasks", session = %session_id, endpoint = %endpoint, "session ready");

							self.notifier.notify(session_id, ReadyOutcome::Ready(view.clone())).await;

							let event_out = LifecycleEvent::SessionReady {
								session_id: session_id.clone(),
								project_id: committed.record.project_id.clone(),
								connect_url: committed.record.connect_url.clone().unwrap_or_default(),
								at: now_ts(),
							};
							let _ = bounded(self.config.call_timeout, "ready publish", self.bus.publish(topics::LIFECYCLE, event_out)).await;

							self.deliver_workflow_callback(&event.task, &view).await;
							return Ok(());
						}
						Err(StoreError::VersionConflict) => continue,
						Err(err) => return Err(err.into()),
					}
				}
				// Terminate won the race, or the event is a late duplicate.
				// The committed TERMINATING/terminal state stands.
				status => {
					debug!(target = "wc.tasks", session = %session_id, %status, "promotion superseded; dropping");
					return Ok(());
				}
			}
		}
		Ok(())
	}

	async fn handle_stopped(&self, session_id: &SessionId, event: &TaskStateEvent, reason: &str) -> Result<()> {
		let versioned = match bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await {
			Ok(versioned) => versioned,
			Err(LifecycleError::NotFound) => return Ok(()),
			Err(err) => return Err(err),
		};
		if versioned.record.status.is_terminal() {
			let _ = self.store.unbind_task(&event.task).await;
			return Ok(());
		}

		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			match record.status {
				status if status.is_terminal() => break,
				// Expected exit: the provisioner asked the workload to stop.
				SessionStatus::Terminating => {
					record.apply_transition(SessionStatus::Stopped, EventSource::TaskReactor, Some(json!({ "reason": reason })))?;
					match self.store.update(record, versioned.version).await {
						Ok(committed) => {
							self.publish_cleanup(&committed.record).await;
							self.notifier.notify(session_id, ReadyOutcome::Terminated).await;
							break;
						}
						Err(StoreError::VersionConflict) => continue,
						Err(err) => return Err(err.into()),
					}
				}
				// The container died underneath a live session.
				_ => {
					record.apply_transition(SessionStatus::Failed, EventSource::TaskReactor, Some(json!({ "reason": reason })))?;
					record.failure_reason = Some(FailureReason::TaskExited);
					match self.store.update(record, versioned.version).await {
						Ok(committed) => {
							warn!(target = "wc.tasks", session = %session_id, reason, "task exited from below; session failed");
							self.publish_cleanup(&committed.record).await;
							self.notifier.notify(session_id, ReadyOutcome::Failed { reason: FailureReason::TaskExited }).await;
							break;
						}
						Err(StoreError::VersionConflict) => continue,
						Err(err) => return Err(err.into()),
					}
				}
			}
		}

		let _ = self.store.unbind_task(&event.task).await;
		Ok(())
	}

	async fn resolve_network(&self, network: Option<TaskNetwork>) -> Result<std::net::SocketAddr> {
		match network {
			Some(TaskNetwork::Address(addr)) => Ok(addr),
			Some(TaskNetwork::Attachment(attachment)) => {
				let mut last = LifecycleError::Internal("no resolution attempted".to_string());
				for attempt in 1..=RESOLVE_ATTEMPTS {
					match bounded(self.config.call_timeout, "endpoint resolve", self.platform.resolve_endpoint(&attachment)).await {
						Ok(addr) => return Ok(addr),
						Err(err) => {
							debug!(target = "wc.tasks", attachment = attachment.as_str(), attempt, error = %err, "endpoint resolution failed");
							last = err;
							if attempt < RESOLVE_ATTEMPTS {
								tokio::time::sleep(self.config.provisioner_backoff_base).await;
							}
						}
					}
				}
				Err(last)
			}
			None => Err(LifecycleError::Internal("RUNNING event without network attachment".to_string())),
		}
	}

	/// Signals an external workflow blocked on readiness, then drops the
	/// callback token so redeliveries cannot signal twice. The task binding
	/// itself stays for stop-event correlation.
	async fn deliver_workflow_callback(&self, task: &TaskHandle, view: &SessionView) {
		let Ok(Some(binding)) = self.store.task_binding(task).await else { return };
		let Some(token) = binding.callback_token.clone() else { return };

		if let Err(err) = self.callback.deliver(&token, view).await {
			warn!(target = "wc.tasks", task = %task, error = %err, "workflow callback delivery failed");
			return;
		}
		let _ = self
			.store
			.bind_task(task, TaskBinding { session_id: binding.session_id, callback_token: None })
			.await;
	}

	async fn publish_cleanup(&self, record: &SessionRecord) {
		let event = LifecycleEvent::SessionCleanupCompleted {
			session_id: record.id.clone(),
			project_id: record.project_id.clone(),
			final_status: record.status,
			at: now_ts(),
		};
		let _ = bounded(self.config.call_timeout, "cleanup publish", self.bus.publish(topics::LIFECYCLE, event)).await;
	}

	async fn fail_session(&self, session_id: &SessionId, reason: FailureReason, detail: &str) -> Result<()> {
		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			if record.status.is_terminal() {
				return Ok(());
			}
			record.apply_transition(SessionStatus::Failed, EventSource::TaskReactor, Some(json!({ "reason": detail })))?;
			record.failure_reason = Some(reason);
			match self.store.update(record, versioned.version).await {
				Ok(_) => {
					self.notifier.notify(session_id, ReadyOutcome::Failed { reason }).await;
					return Ok(());
				}
				Err(StoreError::VersionConflict) => continue,
				Err(err) => return Err(err.into()),
			}
		}
		Ok(())
	}
}
