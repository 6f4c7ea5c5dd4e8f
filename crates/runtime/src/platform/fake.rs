use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use wallcrawler_protocol::{SessionId, TaskHandle, now_ts};

use super::{AttachmentId, ContainerPlatform, LaunchSpec, PlatformError, TaskNetwork, TaskState, TaskStateEvent};

/// Scripted control plane for tests.
///
/// Defaults to launching successfully and immediately emitting a RUNNING
/// event with an address attachment. Tests script failures, withhold the
/// auto event to inject races by hand, and inspect recorded launch/stop
/// calls afterwards.
pub struct FakePlatform {
	endpoint: Mutex<SocketAddr>,
	launch_failures: AtomicU64,
	auto_running: Mutex<bool>,
	emit_attachments: Mutex<bool>,
	launches: Mutex<Vec<LaunchSpec>>,
	stop_calls: Mutex<Vec<TaskHandle>>,
	live_tasks: DashMap<TaskHandle, SessionId>,
	attachments: DashMap<AttachmentId, SocketAddr>,
	next_task: AtomicU64,
	events_tx: mpsc::UnboundedSender<TaskStateEvent>,
	events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskStateEvent>>>,
}

impl FakePlatform {
	pub fn new() -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Self {
			endpoint: Mutex::new(SocketAddr::from(([1, 2, 3, 4], 9223))),
			launch_failures: AtomicU64::new(0),
			auto_running: Mutex::new(true),
			emit_attachments: Mutex::new(false),
			launches: Mutex::new(Vec::new()),
			stop_calls: Mutex::new(Vec::new()),
			live_tasks: DashMap::new(),
			attachments: DashMap::new(),
			next_task: AtomicU64::new(1),
			events_tx,
			events_rx: Mutex::new(Some(events_rx)),
		}
	}

	/// Scripts the next `count` launches to fail.
	pub fn fail_next_launches(&self, count: u64) {
		self.launch_failures.store(count, Ordering::SeqCst);
	}

	/// Endpoint advertised by subsequently launched tasks.
	pub fn set_endpoint(&self, addr: SocketAddr) {
		*self.endpoint.lock() = addr;
	}

	/// Disables the automatic RUNNING event; tests emit by hand instead.
	pub fn hold_running_events(&self) {
		*self.auto_running.lock() = false;
	}

	/// Emits RUNNING events carrying attachment ids (requiring the lookup
	/// path) instead of resolved addresses.
	pub fn emit_attachments(&self) {
		*self.emit_attachments.lock() = true;
	}

	pub fn launch_count(&self) -> usize {
		self.launches.lock().len()
	}

	pub fn last_launch(&self) -> Option<LaunchSpec> {
		self.launches.lock().last().cloned()
	}

	pub fn stop_calls(&self) -> Vec<TaskHandle> {
		self.stop_calls.lock().clone()
	}

	/// Injects a RUNNING event for an already-launched task.
	pub fn emit_running(&self, task: &TaskHandle) {
		let session_id = self.live_tasks.get(task).map(|entry| entry.value().clone());
		let network = self.network_for(task);
		let _ = self.events_tx.send(TaskStateEvent {
			task: task.clone(),
			session_id,
			state: TaskState::Running { network: Some(network) },
			at: now_ts(),
		});
	}

	/// Injects a task-exit event, as if the container crashed or stopped.
	pub fn emit_stopped(&self, task: &TaskHandle, reason: &str) {
		let session_id = self.live_tasks.get(task).map(|entry| entry.value().clone());
		let _ = self.events_tx.send(TaskStateEvent {
			task: task.clone(),
			session_id,
			state: TaskState::Stopped { reason: reason.to_string() },
			at: now_ts(),
		});
	}

	fn network_for(&self, task: &TaskHandle) -> TaskNetwork {
		let addr = *self.endpoint.lock();
		if *self.emit_attachments.lock() {
			let attachment = AttachmentId::new(format!("eni-{}", task.as_str()));
			self.attachments.insert(attachment.clone(), addr);
			TaskNetwork::Attachment(attachment)
		} else {
			TaskNetwork::Address(addr)
		}
	}
}

impl Default for FakePlatform {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ContainerPlatform for FakePlatform {
	async fn launch(&self, spec: &LaunchSpec) -> Result<TaskHandle, PlatformError> {
		self.launches.lock().push(spec.clone());

		let remaining = self.launch_failures.load(Ordering::SeqCst);
		if remaining > 0 {
			self.launch_failures.store(remaining - 1, Ordering::SeqCst);
			return Err(PlatformError::LaunchRejected("scripted launch failure".to_string()));
		}

		let task = TaskHandle::new(format!("task-{}", self.next_task.fetch_add(1, Ordering::SeqCst)));
		self.live_tasks.insert(task.clone(), spec.session_id.clone());

		if *self.auto_running.lock() {
			self.emit_running(&task);
		}
		Ok(task)
	}

	async fn stop(&self, handle: &TaskHandle) -> Result<(), PlatformError> {
		self.stop_calls.lock().push(handle.clone());
		match self.live_tasks.remove(handle) {
			Some(_) => Ok(()),
			None => Err(PlatformError::TaskNotFound),
		}
	}

	async fn resolve_endpoint(&self, attachment: &AttachmentId) -> Result<SocketAddr, PlatformError> {
		self.attachments
			.get(attachment)
			.map(|entry| *entry.value())
			.ok_or_else(|| PlatformError::NetworkUnresolved(attachment.as_str().to_string()))
	}

	fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskStateEvent>> {
		self.events_rx.lock().take()
	}
}

#[cfg(test)]
mod tests {
	use wallcrawler_protocol::{ProjectId, SigningKey};

	use super::*;

	fn spec() -> LaunchSpec {
		LaunchSpec::new(SessionId::new("s1"), ProjectId::new("p1"), SigningKey::from_string("k"))
	}

	#[tokio::test]
	async fn default_launch_emits_running_with_address() {
		let platform = FakePlatform::new();
		let mut events = platform.take_events().unwrap();
		let task = platform.launch(&spec()).await.unwrap();

		let event = events.recv().await.unwrap();
		assert_eq!(event.task, task);
		assert_eq!(event.session_id, Some(SessionId::new("s1")));
		match event.state {
			TaskState::Running { network: Some(TaskNetwork::Address(addr)) } => {
				assert_eq!(addr, "1.2.3.4:9223".parse().unwrap());
			}
			other => panic!("unexpected state: {other:?}"),
		}
	}

	#[tokio::test]
	async fn scripted_failures_then_success() {
		let platform = FakePlatform::new();
		platform.fail_next_launches(2);
		assert!(platform.launch(&spec()).await.is_err());
		assert!(platform.launch(&spec()).await.is_err());
		assert!(platform.launch(&spec()).await.is_ok());
		assert_eq!(platform.launch_count(), 3);
	}

	#[tokio::test]
	async fn attachment_mode_requires_resolution() {
		let platform = FakePlatform::new();
		platform.emit_attachments();
		let mut events = platform.take_events().unwrap();
		platform.launch(&spec()).await.unwrap();

		let event = events.recv().await.unwrap();
		let TaskState::Running { network: Some(TaskNetwork::Attachment(attachment)) } = event.state else {
			panic!("expected attachment network");
		};
		let addr = platform.resolve_endpoint(&attachment).await.unwrap();
		assert_eq!(addr, "1.2.3.4:9223".parse().unwrap());
	}

	#[tokio::test]
	async fn second_stop_reports_task_not_found() {
		let platform = FakePlatform::new();
		let task = platform.launch(&spec()).await.unwrap();
		platform.stop(&task).await.unwrap();
		assert!(matches!(platform.stop(&task).await, Err(PlatformError::TaskNotFound)));
		assert_eq!(platform.stop_calls().len(), 2);
	}
}
