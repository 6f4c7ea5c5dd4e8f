//! Lifecycle events published on the shared bus.
//!
//! Every event carries the session and project identifiers plus a unix
//! timestamp; the variant name doubles as the wire `type` tag. Reactors
//! partition work by `session_id`, so per-session ordering is whatever the
//! bus guarantees for a single partition key.

use serde::{Deserialize, Serialize};

use crate::session::{ContextRef, FailureReason, ProjectId, SessionId, SessionStatus, TaskHandle};

/// Bus topics used by the orchestrator.
pub mod topics {
	/// All session lifecycle events; partition key is the session id.
	pub const LIFECYCLE: &str = "session.lifecycle";
}

/// A state-transition notification on the lifecycle topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
	/// A session record was inserted; the provisioner should launch a workload.
	SessionCreateRequested {
		session_id: SessionId,
		project_id: ProjectId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		context_ref: Option<ContextRef>,
		at: u64,
	},
	/// Provisioning gave up after retry exhaustion.
	SessionCreateFailed {
		session_id: SessionId,
		project_id: ProjectId,
		reason: FailureReason,
		at: u64,
	},
	/// The session reached `READY` and accepts CDP connections.
	SessionReady {
		session_id: SessionId,
		project_id: ProjectId,
		connect_url: String,
		at: u64,
	},
	/// Termination was requested; the bound workload should be stopped.
	SessionTerminationRequested {
		session_id: SessionId,
		project_id: ProjectId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		task_handle: Option<TaskHandle>,
		reason: String,
		at: u64,
	},
	/// Cleanup finished and the record reached its terminal status.
	SessionCleanupCompleted {
		session_id: SessionId,
		project_id: ProjectId,
		final_status: SessionStatus,
		at: u64,
	},
}

impl LifecycleEvent {
	/// The partition key: which session this event belongs to.
	pub fn session_id(&self) -> &SessionId {
		match self {
			LifecycleEvent::SessionCreateRequested { session_id, .. }
			| LifecycleEvent::SessionCreateFailed { session_id, .. }
			| LifecycleEvent::SessionReady { session_id, .. }
			| LifecycleEvent::SessionTerminationRequested { session_id, .. }
			| LifecycleEvent::SessionCleanupCompleted { session_id, .. } => session_id,
		}
	}

	pub fn project_id(&self) -> &ProjectId {
		match self {
			LifecycleEvent::SessionCreateRequested { project_id, .. }
			| LifecycleEvent::SessionCreateFailed { project_id, .. }
			| LifecycleEvent::SessionReady { project_id, .. }
			| LifecycleEvent::SessionTerminationRequested { project_id, .. }
			| LifecycleEvent::SessionCleanupCompleted { project_id, .. } => project_id,
		}
	}

	pub fn at(&self) -> u64 {
		match self {
			LifecycleEvent::SessionCreateRequested { at, .. }
			| LifecycleEvent::SessionCreateFailed { at, .. }
			| LifecycleEvent::SessionReady { at, .. }
			| LifecycleEvent::SessionTerminationRequested { at, .. }
			| LifecycleEvent::SessionCleanupCompleted { at, .. } => *at,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::now_ts;

	#[test]
	fn events_tag_with_their_variant_name() {
		let event = LifecycleEvent::SessionCreateRequested {
			session_id: SessionId::new("s1"),
			project_id: ProjectId::new("p1"),
			context_ref: None,
			at: now_ts(),
		};
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["type"], "SessionCreateRequested");
		assert_eq!(json["sessionId"], "s1");
		assert_eq!(json["projectId"], "p1");
		assert!(json.get("contextRef").is_none());
	}

	#[test]
	fn termination_event_round_trips_with_task_handle() {
		let event = LifecycleEvent::SessionTerminationRequested {
			session_id: SessionId::new("s1"),
			project_id: ProjectId::new("p1"),
			task_handle: Some(TaskHandle::new("task-9")),
			reason: "client request".into(),
			at: 1712,
		};
		let json = serde_json::to_string(&event).unwrap();
		let back: LifecycleEvent = serde_json::from_str(&json).unwrap();
		match back {
			LifecycleEvent::SessionTerminationRequested { task_handle, reason, .. } => {
				assert_eq!(task_handle, Some(TaskHandle::new("task-9")));
				assert_eq!(reason, "client request");
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn cleanup_event_carries_terminal_status() {
		let event = LifecycleEvent::SessionCleanupCompleted {
			session_id: SessionId::new("s1"),
			project_id: ProjectId::new("p1"),
			final_status: SessionStatus::Stopped,
			at: 1712,
		};
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["finalStatus"], "STOPPED");
	}
}
