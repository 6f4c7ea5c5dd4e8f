//! Wire types shared by the Wallcrawler orchestrator, the in-task agent, and
//! the CDP proxy: the session record and its status graph, lifecycle bus
//! events, signed connection tokens, and the per-session command channel.
//!
//! This crate is I/O-free. Everything here serializes with serde and is safe
//! to ship across the event bus or embed in launch environments.

pub mod command;
pub mod events;
pub mod session;
pub mod token;

pub use command::AgentCommand;
pub use events::{LifecycleEvent, topics};
pub use session::{
	ContextRef, EventSource, FailureReason, IllegalTransition, ProjectId, SessionEvent, SessionId, SessionRecord, SessionStatus, SessionView, SigningKey,
	TaskHandle, now_ts,
};
pub use token::{ConnectClaims, MAX_TOKEN_TTL_SECS, Scope, TokenError, connect_url, mint, verify};
