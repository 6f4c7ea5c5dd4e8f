//! Session store: the only shared mutable state across orchestrator
//! components, written exclusively through conditional updates.
//!
//! Per-session linearizability comes from compare-and-set on the record
//! version; readers get whatever the last committed write was. The store
//! also holds the task-to-session reverse index used to correlate container
//! runtime events back to sessions.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use wallcrawler_protocol::{ProjectId, SessionEvent, SessionId, SessionRecord, SessionStatus, TaskHandle};

pub use memory::MemoryStore;

/// A record plus the version that must be presented to update it.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
	pub version: u64,
	pub record: T,
}

/// Reverse index entry: which session a container workload belongs to, and
/// an optional external-workflow token to signal when the session is ready.
#[derive(Debug, Clone)]
pub struct TaskBinding {
	pub session_id: SessionId,
	pub callback_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("session not found")]
	NotFound,
	#[error("version conflict")]
	VersionConflict,
	#[error("project concurrency cap reached")]
	CapacityExceeded,
	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Durable record of session state, history, and bindings.
#[async_trait]
pub trait SessionStore: Send + Sync {
	async fn get(&self, id: &SessionId) -> Result<Versioned<SessionRecord>, StoreError>;

	/// Inserts a fresh record, atomically enforcing the project's concurrency
	/// cap over sessions whose status holds capacity.
	async fn insert(&self, record: SessionRecord, project_cap: u32) -> Result<Versioned<SessionRecord>, StoreError>;

	/// Conditional write: commits only when `expected_version` still matches.
	async fn update(&self, record: SessionRecord, expected_version: u64) -> Result<Versioned<SessionRecord>, StoreError>;

	/// Audit append. The one write allowed on terminal records.
	async fn append_event(&self, id: &SessionId, event: SessionEvent) -> Result<(), StoreError>;

	async fn query(&self, project: &ProjectId, statuses: &[SessionStatus]) -> Result<Vec<SessionRecord>, StoreError>;

	/// Non-terminal sessions whose `expires_at` has passed.
	async fn scan_expiring(&self, now: u64) -> Result<Vec<SessionRecord>, StoreError>;

	async fn bind_task(&self, task: &TaskHandle, binding: TaskBinding) -> Result<(), StoreError>;

	async fn task_binding(&self, task: &TaskHandle) -> Result<Option<TaskBinding>, StoreError>;

	async fn unbind_task(&self, task: &TaskHandle) -> Result<(), StoreError>;
}
