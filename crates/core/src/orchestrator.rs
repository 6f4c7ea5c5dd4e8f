//! Wires the controller, reactors, and sweeper over a set of capabilities.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use wallcrawler_protocol::topics;
use wallcrawler_runtime::{ContainerPlatform, EventBus, ProjectDirectory, ReadinessNotifier, SessionStore, WorkflowCallback};

use crate::config::Config;
use crate::controller::LifecycleController;
use crate::error::{LifecycleError, Result};
use crate::provisioner::ProvisionerReactor;
use crate::sweeper::ExpirySweeper;
use crate::task_reactor::TaskStateReactor;

/// The collaborators an orchestrator runs against. In-memory fakes in
/// tests, real infrastructure adapters in deployments.
pub struct Capabilities {
	pub store: Arc<dyn SessionStore>,
	pub bus: Arc<dyn EventBus>,
	pub notifier: Arc<dyn ReadinessNotifier>,
	pub platform: Arc<dyn ContainerPlatform>,
	pub projects: Arc<dyn ProjectDirectory>,
	pub callback: Arc<dyn WorkflowCallback>,
}

/// A running orchestrator: controller plus background reactor tasks.
pub struct Orchestrator {
	controller: Arc<LifecycleController>,
	shutdown_tx: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
	/// Subscribes the reactors and starts the sweeper. The platform's event
	/// stream is claimed here; starting twice over one platform fails.
	pub fn start(config: Config, caps: Capabilities) -> Result<Self> {
		let controller = Arc::new(LifecycleController::new(
			config.clone(),
			caps.store.clone(),
			caps.bus.clone(),
			caps.projects.clone(),
			caps.notifier.clone(),
		));

		let provisioner = Arc::new(ProvisionerReactor::new(
			config.clone(),
			caps.store.clone(),
			caps.bus.clone(),
			caps.platform.clone(),
			caps.notifier.clone(),
		));
		let provisioner_events = caps.bus.subscribe(topics::LIFECYCLE, "provisioner");

		let task_reactor = Arc::new(TaskStateReactor::new(
			config.clone(),
			caps.store.clone(),
			caps.bus.clone(),
			caps.platform.clone(),
			caps.notifier.clone(),
			caps.callback.clone(),
		));
		let task_events = caps
			.platform
			.take_events()
			.ok_or_else(|| LifecycleError::Internal("platform event stream already claimed".to_string()))?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let sweeper = Arc::new(ExpirySweeper::new(config, caps.store.clone(), controller.clone()));

		let tasks = vec![provisioner.spawn(provisioner_events), task_reactor.spawn(task_events), sweeper.spawn(shutdown_rx)];

		info!(target = "wc.controller", "orchestrator started");
		Ok(Self {
			controller,
			shutdown_tx,
			tasks,
		})
	}

	pub fn controller(&self) -> Arc<LifecycleController> {
		self.controller.clone()
	}

	/// Stops the background tasks. Sessions in flight keep their stored
	/// state; a restarted orchestrator picks them up from redeliveries.
	pub async fn shutdown(self) {
		let _ = self.shutdown_tx.send(true);
		for task in self.tasks {
			task.abort();
		}
	}
}
