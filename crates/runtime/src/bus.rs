//! Event bus: at-least-once delivery of lifecycle events to consumer
//! groups, FIFO per subscriber.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use wallcrawler_protocol::LifecycleEvent;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("bus unavailable: {0}")]
	Unavailable(String),
}

/// Publish/subscribe capability over named topics.
///
/// Every consumer group receives its own copy of each published event; the
/// session id is the implied partition key, so a single consumer per group
/// observes per-session order.
#[async_trait]
pub trait EventBus: Send + Sync {
	async fn publish(&self, topic: &str, event: LifecycleEvent) -> Result<(), BusError>;

	/// Attaches (or replaces) the consumer for `group` on `topic`.
	fn subscribe(&self, topic: &str, group: &str) -> mpsc::UnboundedReceiver<LifecycleEvent>;
}

/// In-process [`EventBus`] backed by unbounded channels.
#[derive(Default)]
pub struct MemoryBus {
	groups: DashMap<(String, String), mpsc::UnboundedSender<LifecycleEvent>>,
}

impl MemoryBus {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl EventBus for MemoryBus {
	async fn publish(&self, topic: &str, event: LifecycleEvent) -> Result<(), BusError> {
		let mut stale = Vec::new();
		for entry in self.groups.iter() {
			let (entry_topic, group) = entry.key();
			if entry_topic != topic {
				continue;
			}
			if entry.value().send(event.clone()).is_err() {
				stale.push((entry_topic.clone(), group.clone()));
			}
		}
		for key in stale {
			debug!(target = "wc.bus", topic = %key.0, group = %key.1, "dropping closed subscriber");
			self.groups.remove(&key);
		}
		Ok(())
	}

	fn subscribe(&self, topic: &str, group: &str) -> mpsc::UnboundedReceiver<LifecycleEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.groups.insert((topic.to_string(), group.to_string()), tx);
		rx
	}
}

#[cfg(test)]
mod tests {
	use wallcrawler_protocol::{ProjectId, SessionId, now_ts, topics};

	use super::*;

	fn event(session: &str) -> LifecycleEvent {
		LifecycleEvent::SessionCreateRequested {
			session_id: SessionId::new(session),
			project_id: ProjectId::new("p1"),
			context_ref: None,
			at: now_ts(),
		}
	}

	#[tokio::test]
	async fn each_group_receives_its_own_copy() {
		let bus = MemoryBus::new();
		let mut provisioner = bus.subscribe(topics::LIFECYCLE, "provisioner");
		let mut audit = bus.subscribe(topics::LIFECYCLE, "audit");

		bus.publish(topics::LIFECYCLE, event("s1")).await.unwrap();

		assert_eq!(provisioner.recv().await.unwrap().session_id().as_str(), "s1");
		assert_eq!(audit.recv().await.unwrap().session_id().as_str(), "s1");
	}

	#[tokio::test]
	async fn per_subscriber_order_is_fifo() {
		let bus = MemoryBus::new();
		let mut rx = bus.subscribe(topics::LIFECYCLE, "provisioner");
		for i in 0..5 {
			bus.publish(topics::LIFECYCLE, event(&format!("s{i}"))).await.unwrap();
		}
		for i in 0..5 {
			assert_eq!(rx.recv().await.unwrap().session_id().as_str(), format!("s{i}"));
		}
	}

	#[tokio::test]
	async fn publishing_to_a_topic_without_subscribers_succeeds() {
		let bus = MemoryBus::new();
		bus.publish("other.topic", event("s1")).await.unwrap();
	}
}
