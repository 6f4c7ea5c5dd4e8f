//! Ephemeral per-session readiness notifications.
//!
//! A caller blocked in create-and-wait subscribes here instead of polling
//! the store. Outcomes are latched: notify-then-wait and wait-then-notify
//! both observe the same result.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use wallcrawler_protocol::{FailureReason, SessionId, SessionView};

/// How a wait for readiness resolved.
#[derive(Debug, Clone)]
pub enum ReadyOutcome {
	/// The session reached `READY`; the view carries the connect URL.
	Ready(SessionView),
	/// Provisioning failed terminally.
	Failed { reason: FailureReason },
	/// The session was terminated before it became ready.
	Terminated,
}

#[async_trait]
pub trait ReadinessNotifier: Send + Sync {
	async fn notify(&self, id: &SessionId, outcome: ReadyOutcome);

	/// Blocks until an outcome is published for `id` or the timeout lapses.
	async fn wait(&self, id: &SessionId, timeout: Duration) -> Option<ReadyOutcome>;
}

/// In-process notifier keyed by session id, one latched watch channel each.
#[derive(Default)]
pub struct MemoryNotifier {
	channels: DashMap<SessionId, watch::Sender<Option<ReadyOutcome>>>,
}

impl MemoryNotifier {
	pub fn new() -> Self {
		Self::default()
	}

	fn channel(&self, id: &SessionId) -> watch::Sender<Option<ReadyOutcome>> {
		self.channels
			.entry(id.clone())
			.or_insert_with(|| watch::channel(None).0)
			.value()
			.clone()
	}
}

#[async_trait]
impl ReadinessNotifier for MemoryNotifier {
	async fn notify(&self, id: &SessionId, outcome: ReadyOutcome) {
		let _ = self.channel(id).send(Some(outcome));
	}

	async fn wait(&self, id: &SessionId, timeout: Duration) -> Option<ReadyOutcome> {
		let mut rx = self.channel(id).subscribe();
		let result = tokio::time::timeout(timeout, async {
			loop {
				if let Some(outcome) = rx.borrow_and_update().clone() {
					return outcome;
				}
				if rx.changed().await.is_err() {
					std::future::pending::<()>().await;
				}
			}
		})
		.await;
		result.ok()
	}
}
