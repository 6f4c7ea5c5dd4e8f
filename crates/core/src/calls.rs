//! Deadline wrapper for outbound capability calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{LifecycleError, Result};

/// Bounds a capability call; an elapsed deadline surfaces as a transient
/// [`LifecycleError::CallTimeout`] the caller may retry.
pub(crate) async fn bounded<T, E, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
	F: Future<Output = std::result::Result<T, E>>,
	LifecycleError: From<E>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(result) => result.map_err(LifecycleError::from),
		Err(_) => Err(LifecycleError::CallTimeout(what)),
	}
}
