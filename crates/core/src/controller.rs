//! Lifecycle controller: the synchronous authority for creating and
//! terminating sessions.
//!
//! The controller never talks to the container platform. It validates,
//! writes the session record under the store's conditional-write guarantee,
//! and publishes lifecycle events for the reactors to act on. Termination
//! always wins races against in-flight promotion: committing `TERMINATING`
//! bumps the record version, so a late promotion loses its compare-and-set.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use wallcrawler_protocol::{
	ConnectClaims, ContextRef, EventSource, FailureReason, LifecycleEvent, ProjectId, Scope, SessionId, SessionRecord, SessionStatus, SessionView, now_ts,
	topics,
};
use wallcrawler_runtime::{EventBus, ProjectDirectory, ProjectStatus, ReadinessNotifier, ReadyOutcome, SessionStore};

use crate::calls::bounded;
use crate::config::Config;
use crate::error::{LifecycleError, Result};

const CAS_ATTEMPTS: u32 = 5;

/// Who asked for an operation; drives authorization and audit attribution.
#[derive(Debug, Clone)]
pub enum Actor {
	/// An API client acting within one project.
	Client { project: ProjectId },
	/// Operator tooling with cross-project access.
	Operator,
	/// The expiry sweeper.
	Sweeper,
}

impl Actor {
	fn source(&self) -> EventSource {
		match self {
			Actor::Sweeper => EventSource::Sweeper,
			_ => EventSource::Controller,
		}
	}

	fn reason(&self) -> &'static str {
		match self {
			Actor::Client { .. } => "client request",
			Actor::Operator => "operator request",
			Actor::Sweeper => "session expired",
		}
	}

	fn may_access(&self, record: &SessionRecord) -> bool {
		match self {
			Actor::Client { project } => record.project_id == *project,
			Actor::Operator | Actor::Sweeper => true,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
	pub project_id: ProjectId,
	/// Requested lifetime in seconds; `None` takes the configured maximum.
	pub timeout_secs: Option<u64>,
	pub context_ref: Option<ContextRef>,
	pub user_metadata: Option<serde_json::Value>,
}

impl CreateSessionRequest {
	pub fn new(project_id: ProjectId) -> Self {
		Self {
			project_id,
			timeout_secs: None,
			context_ref: None,
			user_metadata: None,
		}
	}

	pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
		self.timeout_secs = Some(timeout_secs);
		self
	}

	pub fn with_context(mut self, context_ref: ContextRef) -> Self {
		self.context_ref = Some(context_ref);
		self
	}
}

pub struct LifecycleController {
	config: Config,
	store: Arc<dyn SessionStore>,
	bus: Arc<dyn EventBus>,
	projects: Arc<dyn ProjectDirectory>,
	notifier: Arc<dyn ReadinessNotifier>,
}

impl LifecycleController {
	pub fn new(
		config: Config,
		store: Arc<dyn SessionStore>,
		bus: Arc<dyn EventBus>,
		projects: Arc<dyn ProjectDirectory>,
		notifier: Arc<dyn ReadinessNotifier>,
	) -> Self {
		Self {
			config,
			store,
			bus,
			projects,
			notifier,
		}
	}

	/// Creates a session in `CREATING` and requests provisioning.
	///
	/// The returned record is the only response that ever carries the raw
	/// signing key; callers exposing sessions outward use
	/// [`SessionRecord::view`].
	pub async fn create(&self, request: CreateSessionRequest) -> Result<SessionRecord> {
		let timeout_secs = self.effective_timeout(request.timeout_secs)?;

		let project = bounded(self.config.call_timeout, "project lookup", self.projects.get(&request.project_id))
			.await?
			.ok_or_else(|| LifecycleError::InvalidProject(request.project_id.clone()))?;
		if project.status != ProjectStatus::Active {
			return Err(LifecycleError::InvalidProject(request.project_id.clone()));
		}
		let cap = if project.concurrency > 0 { project.concurrency } else { self.config.default_project_concurrency };

		let record = SessionRecord::new(request.project_id.clone(), timeout_secs, request.context_ref.clone(), request.user_metadata.clone());
		let versioned = bounded(self.config.call_timeout, "session insert", self.store.insert(record, cap)).await?;
		let record = versioned.record;

		info!(target = "wc.controller", session = %record.id, project = %record.project_id, timeout_secs, "session created");

		let event = LifecycleEvent::SessionCreateRequested {
			session_id: record.id.clone(),
			project_id: record.project_id.clone(),
			context_ref: record.context_ref.clone(),
			at: now_ts(),
		};
		if let Err(err) = bounded(self.config.call_timeout, "create publish", self.bus.publish(topics::LIFECYCLE, event)).await {
			warn!(target = "wc.controller", session = %record.id, error = %err, "create request publish failed; failing session");
			self.fail_unprovisioned(&record, FailureReason::PublishFailed).await;
			return Err(err);
		}

		Ok(record)
	}

	/// Creates a session and blocks until it is ready, failed, or the
	/// readiness window lapses.
	pub async fn create_and_wait(&self, request: CreateSessionRequest) -> Result<SessionView> {
		let record = self.create(request).await?;
		match self.notifier.wait(&record.id, self.config.readiness_wait_timeout).await {
			Some(ReadyOutcome::Ready(view)) => Ok(view),
			Some(ReadyOutcome::Failed { reason }) => Err(LifecycleError::ProvisioningFailed(reason)),
			Some(ReadyOutcome::Terminated) => Err(LifecycleError::TerminatedBeforeReady),
			None => Err(LifecycleError::ReadinessTimeout),
		}
	}

	/// Pure read with project-scope authorization.
	pub async fn get(&self, id: &SessionId, actor: &Actor) -> Result<SessionRecord> {
		let versioned = bounded(self.config.call_timeout, "session read", self.store.get(id)).await?;
		if !actor.may_access(&versioned.record) {
			return Err(LifecycleError::Unauthorized);
		}
		Ok(versioned.record)
	}

	/// Blocks until the session reaches `READY` (or a terminal outcome),
	/// converging on the same observation as [`Self::create_and_wait`].
	pub async fn wait_for_ready(&self, id: &SessionId, timeout: Duration) -> Result<SessionView> {
		// A session that is already ready must not depend on a fresh signal.
		let current = bounded(self.config.call_timeout, "session read", self.store.get(id)).await?;
		match current.record.status {
			SessionStatus::Ready => return Ok(current.record.view()),
			SessionStatus::Failed => {
				return Err(LifecycleError::ProvisioningFailed(current.record.failure_reason.unwrap_or(FailureReason::LaunchFailed)));
			}
			SessionStatus::Stopped | SessionStatus::Terminating => return Err(LifecycleError::TerminatedBeforeReady),
			_ => {}
		}
		match self.notifier.wait(id, timeout).await {
			Some(ReadyOutcome::Ready(view)) => Ok(view),
			Some(ReadyOutcome::Failed { reason }) => Err(LifecycleError::ProvisioningFailed(reason)),
			Some(ReadyOutcome::Terminated) => Err(LifecycleError::TerminatedBeforeReady),
			None => Err(LifecycleError::ReadinessTimeout),
		}
	}

	/// Idempotent termination. Terminal sessions are returned unchanged;
	/// everything else commits `TERMINATING` (or `STOPPED` directly when no
	/// workload was ever launched) and requests cleanup.
	pub async fn terminate(&self, id: &SessionId, actor: &Actor) -> Result<SessionRecord> {
		for _ in 0..CAS_ATTEMPTS {
			let versioned = bounded(self.config.call_timeout, "session read", self.store.get(id)).await?;
			let mut record = versioned.record;

			if !actor.may_access(&record) {
				return Err(LifecycleError::Unauthorized);
			}
			if record.status.is_terminal() {
				debug!(target = "wc.controller", session = %id, status = %record.status, "terminate on terminal session is a no-op");
				return Ok(record);
			}
			if record.status == SessionStatus::Terminating {
				return Ok(record);
			}

			// Nothing launched yet: stop without a cleanup round trip.
			if record.status == SessionStatus::Creating && record.task_handle.is_none() {
				record.apply_transition(SessionStatus::Stopped, actor.source(), Some(json!({ "reason": actor.reason() })))?;
				match self.store.update(record, versioned.version).await {
					Ok(committed) => {
						let event = LifecycleEvent::SessionCleanupCompleted {
							session_id: committed.record.id.clone(),
							project_id: committed.record.project_id.clone(),
							final_status: SessionStatus::Stopped,
							at: now_ts(),
						};
						let _ = bounded(self.config.call_timeout, "cleanup publish", self.bus.publish(topics::LIFECYCLE, event)).await;
						self.notifier.notify(id, ReadyOutcome::Terminated).await;
						return Ok(committed.record);
					}
					Err(wallcrawler_runtime::StoreError::VersionConflict) => continue,
					Err(err) => return Err(err.into()),
				}
			}

			record.apply_transition(SessionStatus::Terminating, actor.source(), Some(json!({ "reason": actor.reason() })))?;
			match self.store.update(record, versioned.version).await {
				Ok(committed) => {
					let event = LifecycleEvent::SessionTerminationRequested {
						session_id: committed.record.id.clone(),
						project_id: committed.record.project_id.clone(),
						task_handle: committed.record.task_handle.clone(),
						reason: actor.reason().to_string(),
						at: now_ts(),
					};
					bounded(self.config.call_timeout, "termination publish", self.bus.publish(topics::LIFECYCLE, event)).await?;
					info!(target = "wc.controller", session = %id, "termination requested");
					return Ok(committed.record);
				}
				Err(wallcrawler_runtime::StoreError::VersionConflict) => continue,
				Err(err) => return Err(err.into()),
			}
		}
		Err(LifecycleError::StoreUnavailable("terminate lost every compare-and-set attempt".to_string()))
	}

	/// Mints a short-lived connection token for a ready session.
	pub async fn mint_token(&self, id: &SessionId, scope: Scope, actor: &Actor, client_ip: Option<String>) -> Result<String> {
		let record = self.get(id, actor).await?;
		if record.status != SessionStatus::Ready {
			return Err(LifecycleError::NotReady);
		}
		let mut claims = ConnectClaims::new(&record.id, &record.project_id, scope, self.config.token_ttl(), now_ts());
		if self.config.bind_token_to_client_ip {
			if let Some(ip) = client_ip {
				claims = claims.with_client_ip(ip);
			}
		}
		claims.sign(&record.signing_key).map_err(|err| LifecycleError::Internal(err.to_string()))
	}

	/// Marks a session that never reached the provisioner as failed.
	/// Best-effort: the create call already failed, this records why.
	async fn fail_unprovisioned(&self, record: &SessionRecord, reason: FailureReason) {
		for _ in 0..CAS_ATTEMPTS {
			let Ok(versioned) = self.store.get(&record.id).await else { return };
			let mut current = versioned.record;
			if current.status.is_terminal() {
				return;
			}
			if current.apply_transition(SessionStatus::Failed, EventSource::Controller, Some(json!({ "reason": reason.to_string() }))).is_err() {
				return;
			}
			current.failure_reason = Some(reason);
			match self.store.update(current, versioned.version).await {
				Ok(_) => {
					self.notifier.notify(&record.id, ReadyOutcome::Failed { reason }).await;
					return;
				}
				Err(wallcrawler_runtime::StoreError::VersionConflict) => continue,
				Err(_) => return,
			}
		}
	}

	fn effective_timeout(&self, requested: Option<u64>) -> Result<u64> {
		match requested {
			None => Ok(self.config.max_session_timeout),
			Some(0) => Err(LifecycleError::InvalidTimeout),
			Some(secs) => Ok(secs.min(self.config.max_session_timeout)),
		}
	}
}
