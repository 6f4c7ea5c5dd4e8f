//! Per-session command channel between the orchestrator and the in-task
//! agent.
//!
//! Commands flow over whatever transport the deployment wires up (the local
//! daemon uses process signals plus a WebSocket control channel); the wire
//! form is always one JSON object per command, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::session::ContextRef;

/// A command addressed to one session's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentCommand {
	/// Drain connections, optionally persist the profile, stop Chrome, exit.
	Terminate {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	/// Snapshot the Chrome profile and upload it without terminating.
	PersistProfile,
	/// Replace the hydrated profile with another context snapshot.
	ReloadContext { context: ContextRef },
}
