//! Container control plane: launch and stop one workload per session, and
//! observe task-state changes as a stream.

mod fake;
mod local;

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use wallcrawler_protocol::{ContextRef, ProjectId, SessionId, SigningKey, TaskHandle};

pub use fake::FakePlatform;
pub use local::LocalProcessPlatform;

/// Everything a workload needs to serve one session, expressed as the env
/// contract the in-task agent reads at boot.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub session_id: SessionId,
	pub project_id: ProjectId,
	pub signing_key: SigningKey,
	pub context_ref: Option<ContextRef>,
	/// Signed URL the agent downloads the profile snapshot from.
	pub profile_download_url: Option<String>,
	/// Signed URL the agent uploads the snapshot to on persist.
	pub profile_upload_url: Option<String>,
	/// WebSocket endpoint for the per-session command channel.
	pub control_url: Option<String>,
	pub cdp_port: u16,
	pub proxy_port: u16,
}

impl LaunchSpec {
	pub fn new(session_id: SessionId, project_id: ProjectId, signing_key: SigningKey) -> Self {
		Self {
			session_id,
			project_id,
			signing_key,
			context_ref: None,
			profile_download_url: None,
			profile_upload_url: None,
			control_url: None,
			cdp_port: 9222,
			proxy_port: 9223,
		}
	}

	pub fn with_context(mut self, context_ref: Option<ContextRef>) -> Self {
		self.context_ref = context_ref;
		self
	}

	pub fn with_control_url(mut self, url: impl Into<String>) -> Self {
		self.control_url = Some(url.into());
		self
	}

	pub fn with_ports(mut self, cdp_port: u16, proxy_port: u16) -> Self {
		self.cdp_port = cdp_port;
		self.proxy_port = proxy_port;
		self
	}

	/// The `WALLCRAWLER_*` environment the agent boots from.
	pub fn env(&self) -> Vec<(String, String)> {
		let mut env = vec![
			("WALLCRAWLER_SESSION_ID".to_string(), self.session_id.to_string()),
			("WALLCRAWLER_PROJECT_ID".to_string(), self.project_id.to_string()),
			("WALLCRAWLER_SIGNING_KEY".to_string(), self.signing_key.as_str().to_string()),
			("WALLCRAWLER_CDP_PORT".to_string(), self.cdp_port.to_string()),
			("WALLCRAWLER_PROXY_PORT".to_string(), self.proxy_port.to_string()),
		];
		if let Some(context) = &self.context_ref {
			env.push(("WALLCRAWLER_CONTEXT_ID".to_string(), context.id.clone()));
			env.push(("WALLCRAWLER_CONTEXT_PERSIST".to_string(), context.persist.to_string()));
		}
		if let Some(url) = &self.profile_download_url {
			env.push(("WALLCRAWLER_PROFILE_DOWNLOAD_URL".to_string(), url.clone()));
		}
		if let Some(url) = &self.profile_upload_url {
			env.push(("WALLCRAWLER_PROFILE_UPLOAD_URL".to_string(), url.clone()));
		}
		if let Some(url) = &self.control_url {
			env.push(("WALLCRAWLER_CONTROL_URL".to_string(), url.clone()));
		}
		env
	}
}

/// Identifier of a task's network attachment, resolvable to an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentId(String);

impl AttachmentId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

/// How a running task advertises its endpoint. Platforms that already know
/// the routable address skip the attachment lookup.
#[derive(Debug, Clone)]
pub enum TaskNetwork {
	Attachment(AttachmentId),
	Address(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum TaskState {
	Running { network: Option<TaskNetwork> },
	Stopped { reason: String },
}

/// One task-state change observed from the container runtime.
#[derive(Debug, Clone)]
pub struct TaskStateEvent {
	pub task: TaskHandle,
	/// Session id recovered from the task environment, when the runtime
	/// surfaces it; otherwise the reverse index resolves it.
	pub session_id: Option<SessionId>,
	pub state: TaskState,
	pub at: u64,
}

#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("launch rejected: {0}")]
	LaunchRejected(String),
	#[error("task not found")]
	TaskNotFound,
	#[error("network attachment unresolved: {0}")]
	NetworkUnresolved(String),
	#[error("platform unavailable: {0}")]
	Unavailable(String),
}

/// Control plane for one-container-per-session workloads.
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
	async fn launch(&self, spec: &LaunchSpec) -> Result<TaskHandle, PlatformError>;

	/// Best-effort stop. Implementations report an already-gone task as
	/// [`PlatformError::TaskNotFound`]; callers treat that as success.
	async fn stop(&self, handle: &TaskHandle) -> Result<(), PlatformError>;

	async fn resolve_endpoint(&self, attachment: &AttachmentId) -> Result<SocketAddr, PlatformError>;

	/// The task-state change stream. Yields `None` once taken.
	fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskStateEvent>>;
}
