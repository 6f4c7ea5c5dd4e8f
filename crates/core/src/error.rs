//! Error taxonomy for the orchestrator's synchronous surface.

use thiserror::Error;
use wallcrawler_protocol::{FailureReason, IllegalTransition, ProjectId};
use wallcrawler_runtime::{BusError, PlatformError, ProjectDirectoryError, StoreError};

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
	/// The project does not exist or is not active.
	#[error("invalid project: {0}")]
	InvalidProject(ProjectId),

	#[error("project concurrency cap exceeded")]
	ConcurrencyExceeded,

	#[error("invalid session timeout")]
	InvalidTimeout,

	#[error("session not found")]
	NotFound,

	/// Acting project does not own the session.
	#[error("session belongs to another project")]
	Unauthorized,

	#[error("session store unavailable: {0}")]
	StoreUnavailable(String),

	#[error(transparent)]
	Bus(#[from] BusError),

	#[error(transparent)]
	Directory(#[from] ProjectDirectoryError),

	#[error(transparent)]
	Platform(#[from] PlatformError),

	/// Create-and-wait saw the session fail before it became ready.
	#[error("provisioning failed: {0}")]
	ProvisioningFailed(FailureReason),

	/// Create-and-wait saw the session terminated before it became ready.
	#[error("session terminated before ready")]
	TerminatedBeforeReady,

	/// The operation requires a `READY` session.
	#[error("session is not ready")]
	NotReady,

	#[error("timed out waiting for readiness")]
	ReadinessTimeout,

	/// An outbound capability call exceeded its deadline.
	#[error("{0} call timed out")]
	CallTimeout(&'static str),

	#[error("internal: {0}")]
	Internal(String),
}

impl From<StoreError> for LifecycleError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::NotFound => LifecycleError::NotFound,
			StoreError::CapacityExceeded => LifecycleError::ConcurrencyExceeded,
			StoreError::VersionConflict => LifecycleError::StoreUnavailable("version conflict after retries".to_string()),
			StoreError::Unavailable(msg) => LifecycleError::StoreUnavailable(msg),
		}
	}
}

impl From<IllegalTransition> for LifecycleError {
	fn from(err: IllegalTransition) -> Self {
		LifecycleError::Internal(err.to_string())
	}
}
