//! Provisioner reactor: turns create requests into launched container
//! workloads and termination requests into stopped ones.
//!
//! Retry state is explicit (attempt counters, not recursion), so a reactor
//! restart re-processes a redelivered event idempotently: the first
//! compare-and-set decides whether the session still wants provisioning.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wallcrawler_protocol::{EventSource, FailureReason, LifecycleEvent, SessionEvent, SessionId, SessionRecord, SessionStatus, TaskHandle, now_ts, topics};
use wallcrawler_runtime::{ContainerPlatform, EventBus, LaunchSpec, PlatformError, ReadinessNotifier, ReadyOutcome, SessionStore, StoreError, TaskBinding};

use crate::calls::bounded;
use crate::config::Config;
use crate::error::{LifecycleError, Result};

const CAS_ATTEMPTS: u32 = 5;

pub struct ProvisionerReactor {
	config: Config,
	store: Arc<dyn SessionStore>,
	bus: Arc<dyn EventBus>,
	platform: Arc<dyn ContainerPlatform>,
	notifier: Arc<dyn ReadinessNotifier>,
}

impl ProvisionerReactor {
	pub fn new(
		config: Config,
		store: Arc<dyn SessionStore>,
		bus: Arc<dyn EventBus>,
		platform: Arc<dyn ContainerPlatform>,
		notifier: Arc<dyn ReadinessNotifier>,
	) -> Self {
		Self {
			config,
			store,
			bus,
			platform,
			notifier,
		}
	}

	/// Consumes the lifecycle topic. Each event is handled on its own task;
	/// per-session serialization comes from the store's compare-and-set.
	pub fn spawn(self: Arc<Self>, mut events: tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>) -> JoinHandle<()> {
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				match event {
					LifecycleEvent::SessionCreateRequested { session_id, .. } => {
						let reactor = self.clone();
						tokio::spawn(async move {
							if let Err(err) = reactor.handle_create(&session_id).await {
								warn!(target = "wc.provisioner", session = %session_id, error = %err, "create handling failed");
							}
						});
					}
					LifecycleEvent::SessionTerminationRequested { session_id, task_handle, .. } => {
						let reactor = self.clone();
						tokio::spawn(async move {
							if let Err(err) = reactor.handle_termination(&session_id, task_handle.as_ref()).await {
								warn!(target = "wc.provisioner", session = %session_id, error = %err, "termination handling failed");
							}
						});
					}
					_ => {}
				}
			}
		})
	}

	async fn handle_create(&self, session_id: &SessionId) -> Result<()> {
		let Some(record) = self.claim_for_provisioning(session_id).await? else {
			return Ok(());
		};

		match self.launch_with_retries(&record).await {
			Ok(task) => self.commit_launched(session_id, task).await,
			Err(err) => {
				warn!(target = "wc.provisioner", session = %session_id, error = %err, "launch attempts exhausted");
				self.fail_session(session_id, FailureReason::LaunchFailed).await?;
				let event = LifecycleEvent::SessionCreateFailed {
					session_id: session_id.clone(),
					project_id: record.project_id.clone(),
					reason: FailureReason::LaunchFailed,
					at: now_ts(),
				};
				let _ = bounded(self.config.call_timeout, "create-failed publish", self.bus.publish(topics::LIFECYCLE, event)).await;
				Ok(())
			}
		}
	}

	/// CAS `CREATING -> PROVISIONING`. Returns `None` when the session no
	/// longer wants provisioning (redelivery, raced terminate).
	async fn claim_for_provisioning(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
		for _ in 0..CAS_ATTEMPTS {
			let versioned = match bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await {
				Ok(versioned) => versioned,
				Err(LifecycleError::NotFound) => {
					debug!(target = "wc.provisioner", session = %session_id, "create request for unknown session; dropping");
					return Ok(None);
				}
				Err(err) => return Err(err),
			};
			let mut record = versioned.record;
			if record.status != SessionStatus::Creating {
				debug!(target = "wc.provisioner", session = %session_id, status = %record.status, "not in CREATING; dropping create request");
				return Ok(None);
			}
			record.apply_transition(SessionStatus::Provisioning, EventSource::Provisioner, None)?;
			match self.store.update(record, versioned.version).await {
				Ok(committed) => return Ok(Some(committed.record)),
				Err(StoreError::VersionConflict) => continue,
				Err(err) => return Err(err.into()),
			}
		}
		Ok(None)
	}

	async fn launch_with_retries(&self, record: &SessionRecord) -> Result<TaskHandle> {
		let spec = LaunchSpec::new(record.id.clone(), record.project_id.clone(), record.signing_key.clone()).with_context(record.context_ref.clone());

		let mut last_err = LifecycleError::Internal("no launch attempted".to_string());
		for attempt in 1..=self.config.provisioner_max_attempts {
			match bounded(self.config.call_timeout, "workload launch", self.platform.launch(&spec)).await {
				Ok(task) => {
					info!(target = "wc.provisioner", session = %record.id, task = %task, attempt, "workload launched");
					return Ok(task);
				}
				Err(err) => {
					warn!(target = "wc.provisioner", session = %record.id, attempt, error = %err, "launch attempt failed");
					last_err = err;
					if attempt < self.config.provisioner_max_attempts {
						let backoff = self.config.provisioner_backoff_base * 2u32.pow(attempt - 1);
						tokio::time::sleep(backoff).await;
					}
				}
			}
		}
		Err(last_err)
	}

	/// Binds the task and commits `PROVISIONING -> STARTING`. When a
	/// terminate won the race meanwhile, the fresh task is stopped instead
	/// of leaking.
	async fn commit_launched(&self, session_id: &SessionId, task: TaskHandle) -> Result<()> {
		self.store
			.bind_task(&task, TaskBinding { session_id: session_id.clone(), callback_token: None })
			.await?;

		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			match record.status {
				SessionStatus::Provisioning => {
					record.task_handle = Some(task.clone());
					record.apply_transition(SessionStatus::Starting, EventSource::Provisioner, Some(json!({ "taskHandle": task.as_str() })))?;
					match self.store.update(record, versioned.version).await {
						Ok(_) => return Ok(()),
						Err(StoreError::VersionConflict) => continue,
						Err(err) => return Err(err.into()),
					}
				}
				SessionStatus::Terminating => {
					debug!(target = "wc.provisioner", session = %session_id, "terminate raced launch; stopping fresh workload");
					self.stop_workload(&task).await;
					record.task_handle = Some(task.clone());
					record.apply_transition(SessionStatus::Stopped, EventSource::Provisioner, Some(json!({ "reason": "terminated during launch" })))?;
					match self.store.update(record, versioned.version).await {
						Ok(committed) => {
							self.finish_cleanup(&committed.record, &task).await;
							return Ok(());
						}
						Err(StoreError::VersionConflict) => continue,
						Err(err) => return Err(err.into()),
					}
				}
				status if status.is_terminal() => {
					// Redelivered event after the session already settled.
					self.stop_workload(&task).await;
					let _ = self.store.unbind_task(&task).await;
					return Ok(());
				}
				status => {
					debug!(target = "wc.provisioner", session = %session_id, %status, "unexpected status after launch; dropping");
					return Ok(());
				}
			}
		}
		Ok(())
	}

	async fn handle_termination(&self, session_id: &SessionId, event_task: Option<&TaskHandle>) -> Result<()> {
		let versioned = match bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await {
			Ok(versioned) => versioned,
			Err(LifecycleError::NotFound) => return Ok(()),
			Err(err) => return Err(err),
		};
		let record = versioned.record;
		if record.status.is_terminal() {
			return Ok(());
		}

		let task = event_task.cloned().or_else(|| record.task_handle.clone());
		if let Some(task) = &task {
			if !self.stop_workload(task).await {
				// The workload may outlive us; record it and finish cleanup
				// anyway rather than wedging the session in TERMINATING.
				let _ = self
					.store
					.append_event(session_id, SessionEvent::new("task.orphaned", EventSource::Provisioner, Some(json!({ "taskHandle": task.as_str() }))))
					.await;
			}
			let _ = self.store.unbind_task(task).await;
		}

		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			if record.status.is_terminal() {
				return Ok(());
			}
			record.apply_transition(SessionStatus::Stopped, EventSource::Provisioner, None)?;
			match self.store.update(record, versioned.version).await {
				Ok(committed) => {
					if let Some(task) = &task {
						self.finish_cleanup(&committed.record, task).await;
					} else {
						self.publish_cleanup(&committed.record).await;
						self.notifier.notify(session_id, ReadyOutcome::Terminated).await;
					}
					return Ok(());
				}
				Err(StoreError::VersionConflict) => continue,
				Err(err) => return Err(err.into()),
			}
		}
		Ok(())
	}

	/// Best-effort stop; an already-gone task counts as stopped. Returns
	/// whether the workload is known to be down.
	async fn stop_workload(&self, task: &TaskHandle) -> bool {
		for attempt in 0..2 {
			match bounded(self.config.call_timeout, "workload stop", self.platform.stop(task)).await {
				Ok(()) => return true,
				Err(LifecycleError::Platform(PlatformError::TaskNotFound)) => return true,
				Err(err) if attempt == 0 => {
					warn!(target = "wc.provisioner", task = %task, error = %err, "stop failed; retrying once");
				}
				Err(err) => {
					warn!(target = "wc.provisioner", task = %task, error = %err, "stop failed after retry");
				}
			}
		}
		false
	}

	async fn finish_cleanup(&self, record: &SessionRecord, task: &TaskHandle) {
		let _ = self.store.unbind_task(task).await;
		self.publish_cleanup(record).await;
		self.notifier.notify(&record.id, ReadyOutcome::Terminated).await;
		info!(target = "wc.provisioner", session = %record.id, task = %task, "cleanup completed");
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

	/// CAS any non-terminal status to `FAILED` with the given reason.
	async fn fail_session(&self, session_id: &SessionId, reason: FailureReason) -> Result<()> {
		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(session_id)).await?;
			let mut record = versioned.record;
			if record.status.is_terminal() {
				return Ok(());
			}
			record.apply_transition(SessionStatus::Failed, EventSource::Provisioner, Some(json!({ "reason": reason.to_string() })))?;
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
