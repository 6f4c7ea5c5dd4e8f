//! Readiness signal for external workflows.
//!
//! A create path driven by an external workflow engine leaves a callback
//! token in the task binding; when the session becomes ready the task
//! reactor delivers the session payload through this capability and deletes
//! the binding.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use wallcrawler_protocol::SessionView;

#[derive(Debug, Error)]
pub enum CallbackError {
	#[error("workflow callback failed: {0}")]
	Unavailable(String),
}

#[async_trait]
pub trait WorkflowCallback: Send + Sync {
	async fn deliver(&self, token: &str, session: &SessionView) -> Result<(), CallbackError>;
}

/// Test double that records every delivery.
#[derive(Default)]
pub struct RecordingCallback {
	delivered: Mutex<Vec<(String, SessionView)>>,
}

impl RecordingCallback {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn delivered(&self) -> Vec<(String, SessionView)> {
		self.delivered.lock().clone()
	}
}

#[async_trait]
impl WorkflowCallback for RecordingCallback {
	async fn deliver(&self, token: &str, session: &SessionView) -> Result<(), CallbackError> {
		self.delivered.lock().push((token.to_string(), session.clone()));
		Ok(())
	}
}
