//! The session record and its lifecycle status graph.
//!
//! A [`SessionRecord`] is the canonical, store-backed description of one
//! remote browser session. Status changes go through
//! [`SessionRecord::apply_transition`], which enforces the legal transition
//! graph and appends the matching audit entry to `event_history` in the same
//! mutation, so a record's history is always causally consistent with its
//! status.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque unique session identifier, generated at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	pub fn generate() -> Self {
		Self(Uuid::new_v4().to_string())
	}

	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Tenant scope a session belongs to. Exactly one per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ProjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Opaque identifier of the container workload bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
	pub fn new(handle: impl Into<String>) -> Self {
		Self(handle.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TaskHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
	Creating,
	Provisioning,
	Starting,
	Ready,
	Terminating,
	Stopped,
	Failed,
}

impl SessionStatus {
	/// Terminal statuses admit no further transitions; the record becomes
	/// immutable apart from audit appends.
	pub fn is_terminal(self) -> bool {
		matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
	}

	/// Statuses that count against a project's concurrency cap.
	pub fn holds_capacity(self) -> bool {
		matches!(
			self,
			SessionStatus::Creating | SessionStatus::Provisioning | SessionStatus::Starting | SessionStatus::Ready
		)
	}

	/// Whether `self -> next` is a legal edge of the lifecycle graph.
	///
	/// `Failed` is reachable from every non-terminal status (unrecoverable
	/// reactor errors). `Creating -> Stopped` is the fast edge taken when
	/// termination arrives before any workload was launched.
	pub fn may_transition(self, next: SessionStatus) -> bool {
		use SessionStatus::*;
		match (self, next) {
			(Creating, Provisioning) | (Creating, Stopped) => true,
			(Provisioning, Starting) | (Provisioning, Terminating) => true,
			(Starting, Ready) | (Starting, Terminating) => true,
			(Ready, Terminating) | (Ready, Stopped) => true,
			(Terminating, Stopped) => true,
			(from, Failed) if !from.is_terminal() => true,
			_ => false,
		}
	}
}

impl fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SessionStatus::Creating => "CREATING",
			SessionStatus::Provisioning => "PROVISIONING",
			SessionStatus::Starting => "STARTING",
			SessionStatus::Ready => "READY",
			SessionStatus::Terminating => "TERMINATING",
			SessionStatus::Stopped => "STOPPED",
			SessionStatus::Failed => "FAILED",
		};
		f.write_str(name)
	}
}

/// Per-session secret used to MAC connection tokens.
///
/// Generated once at session creation and never handed to clients after the
/// first create response. `Debug` output is redacted so the key cannot leak
/// through logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKey(String);

impl SigningKey {
	const KEY_BYTES: usize = 32;

	pub fn generate() -> Self {
		let mut bytes = [0u8; Self::KEY_BYTES];
		rand::thread_rng().fill_bytes(&mut bytes);
		Self(URL_SAFE_NO_PAD.encode(bytes))
	}

	pub fn from_string(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SigningKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SigningKey(..)")
	}
}

/// Reference to a browser-profile snapshot held by the external object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRef {
	pub id: String,
	/// Whether the profile should be snapshotted back on termination.
	#[serde(default)]
	pub persist: bool,
}

/// Which component recorded a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
	Controller,
	Provisioner,
	TaskReactor,
	Sweeper,
	Agent,
}

/// One entry of a session's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
	#[serde(rename = "type")]
	pub event_type: String,
	pub source: EventSource,
	pub at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<serde_json::Value>,
}

impl SessionEvent {
	pub fn new(event_type: impl Into<String>, source: EventSource, detail: Option<serde_json::Value>) -> Self {
		Self {
			event_type: event_type.into(),
			source,
			at: now_ts(),
			detail,
		}
	}
}

/// Machine-readable cause recorded when a session reaches `FAILED`, or noted
/// in the audit trail for orderly shutdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
	LaunchFailed,
	TaskExited,
	EndpointUnresolved,
	PublishFailed,
	StoreUnavailable,
	Expired,
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			FailureReason::LaunchFailed => "LaunchFailed",
			FailureReason::TaskExited => "TaskExited",
			FailureReason::EndpointUnresolved => "EndpointUnresolved",
			FailureReason::PublishFailed => "PublishFailed",
			FailureReason::StoreUnavailable => "StoreUnavailable",
			FailureReason::Expired => "Expired",
		};
		f.write_str(name)
	}
}

/// Attempted status change that is not an edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition: {from} -> {to}")]
pub struct IllegalTransition {
	pub from: SessionStatus,
	pub to: SessionStatus,
}

/// Canonical session record as held by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
	pub id: SessionId,
	pub project_id: ProjectId,
	pub status: SessionStatus,
	pub created_at: u64,
	pub updated_at: u64,
	pub expires_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub task_handle: Option<TaskHandle>,
	/// Externally reachable `host:port` of the session's CDP proxy.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub public_endpoint: Option<String>,
	pub signing_key: SigningKey,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub connect_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context_ref: Option<ContextRef>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_metadata: Option<serde_json::Value>,
	#[serde(default)]
	pub event_history: Vec<SessionEvent>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failure_reason: Option<FailureReason>,
}

impl SessionRecord {
	/// Builds a fresh `CREATING` record with a generated id and signing key.
	pub fn new(project_id: ProjectId, timeout_secs: u64, context_ref: Option<ContextRef>, user_metadata: Option<serde_json::Value>) -> Self {
		let now = now_ts();
		let mut record = Self {
			id: SessionId::generate(),
			project_id,
			status: SessionStatus::Creating,
			created_at: now,
			updated_at: now,
			expires_at: now + timeout_secs,
			task_handle: None,
			public_endpoint: None,
			signing_key: SigningKey::generate(),
			connect_url: None,
			context_ref,
			user_metadata,
			event_history: Vec::new(),
			failure_reason: None,
		};
		record.push_event(SessionEvent::new("session.created", EventSource::Controller, None));
		record
	}

	/// Applies a status transition, rejecting edges outside the graph.
	///
	/// On success the record's `updated_at` moves forward and a
	/// `status.<name>` audit entry is appended.
	pub fn apply_transition(&mut self, next: SessionStatus, source: EventSource, detail: Option<serde_json::Value>) -> Result<(), IllegalTransition> {
		if !self.status.may_transition(next) {
			return Err(IllegalTransition { from: self.status, to: next });
		}
		self.status = next;
		if next != SessionStatus::Ready {
			self.connect_url = None;
		}
		self.push_event(SessionEvent::new(format!("status.{}", next.to_string().to_ascii_lowercase()), source, detail));
		Ok(())
	}

	/// Appends an audit entry. Permitted on terminal records.
	pub fn push_event(&mut self, event: SessionEvent) {
		self.updated_at = now_ts().max(self.updated_at);
		self.event_history.push(event);
	}

	/// Extends `expires_at`, never decreasing it.
	pub fn extend_expiry(&mut self, expires_at: u64) {
		if expires_at > self.expires_at {
			self.expires_at = expires_at;
		}
	}

	pub fn is_expired(&self, now: u64) -> bool {
		!self.status.is_terminal() && now >= self.expires_at
	}

	/// Client-facing projection without the raw signing key.
	pub fn view(&self) -> SessionView {
		SessionView {
			id: self.id.clone(),
			project_id: self.project_id.clone(),
			status: self.status,
			created_at: self.created_at,
			updated_at: self.updated_at,
			expires_at: self.expires_at,
			public_endpoint: self.public_endpoint.clone(),
			connect_url: self.connect_url.clone(),
			context_ref: self.context_ref.clone(),
			failure_reason: self.failure_reason,
		}
	}

	/// Diagnostic check of the record-level invariants. Used by tests and the
	/// store's debug assertions.
	pub fn validate(&self) -> Result<(), String> {
		if self.expires_at <= self.created_at {
			return Err(format!("expires_at {} not after created_at {}", self.expires_at, self.created_at));
		}
		let needs_task = matches!(
			self.status,
			SessionStatus::Provisioning | SessionStatus::Starting | SessionStatus::Ready | SessionStatus::Terminating
		);
		if needs_task && self.task_handle.is_none() {
			return Err(format!("status {} requires a bound task handle", self.status));
		}
		if (self.status == SessionStatus::Ready) != self.connect_url.is_some() {
			return Err(format!("connect_url present: {}, status: {}", self.connect_url.is_some(), self.status));
		}
		if self.status == SessionStatus::Failed && self.failure_reason.is_none() {
			return Err("FAILED without a failure reason".to_string());
		}
		Ok(())
	}
}

/// What the REST façade and CLI hand to clients: everything except the
/// signing key and the raw audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
	pub id: SessionId,
	pub project_id: ProjectId,
	pub status: SessionStatus,
	pub created_at: u64,
	pub updated_at: u64,
	pub expires_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub public_endpoint: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub connect_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context_ref: Option<ContextRef>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failure_reason: Option<FailureReason>,
}

/// Current unix timestamp in seconds.
pub fn now_ts() -> u64 {
	std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}
