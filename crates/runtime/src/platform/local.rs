use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wallcrawler_protocol::{TaskHandle, now_ts};

use super::{AttachmentId, ContainerPlatform, LaunchSpec, PlatformError, TaskNetwork, TaskState, TaskStateEvent};

const PORT_RANGE_START: u16 = 9300;
const PORT_RANGE_END: u16 = 9899;
const READINESS_POLL: Duration = Duration::from_millis(200);

/// Control plane that runs each session's agent as a local child process.
///
/// Stands in for a container runtime during development and end-to-end
/// testing: `launch` spawns the agent binary with the launch-spec env,
/// RUNNING is emitted once the agent's proxy port accepts connections, and
/// `stop` delivers SIGTERM with a bounded grace period before killing.
pub struct LocalProcessPlatform {
	inner: Arc<LocalInner>,
}

struct LocalInner {
	agent_bin: PathBuf,
	advertise_host: String,
	boot_deadline: Duration,
	stop_grace: Duration,
	next_task: AtomicU64,
	tasks: DashMap<TaskHandle, mpsc::Sender<()>>,
	events_tx: mpsc::UnboundedSender<TaskStateEvent>,
	events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TaskStateEvent>>>,
}

impl LocalProcessPlatform {
	pub fn new(agent_bin: PathBuf) -> Self {
		Self::with_timing(agent_bin, Duration::from_secs(30), Duration::from_secs(10))
	}

	/// Overrides the boot and stop-grace deadlines; tests shorten both.
	pub fn with_timing(agent_bin: PathBuf, boot_deadline: Duration, stop_grace: Duration) -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Self {
			inner: Arc::new(LocalInner {
				agent_bin,
				advertise_host: "127.0.0.1".to_string(),
				boot_deadline,
				stop_grace,
				next_task: AtomicU64::new(1),
				tasks: DashMap::new(),
				events_tx,
				events_rx: parking_lot::Mutex::new(Some(events_rx)),
			}),
		}
	}

	fn allocate_port_pair(&self) -> Result<(u16, u16), PlatformError> {
		let mut found = Vec::with_capacity(2);
		for port in PORT_RANGE_START..=PORT_RANGE_END {
			if port_available(port) {
				found.push(port);
				if found.len() == 2 {
					return Ok((found[0], found[1]));
				}
			}
		}
		Err(PlatformError::LaunchRejected("no free local ports".to_string()))
	}
}

#[async_trait]
impl ContainerPlatform for LocalProcessPlatform {
	async fn launch(&self, spec: &LaunchSpec) -> Result<TaskHandle, PlatformError> {
		let (cdp_port, proxy_port) = self.allocate_port_pair()?;
		let spec = spec.clone().with_ports(cdp_port, proxy_port);

		let mut command = Command::new(&self.inner.agent_bin);
		command.envs(spec.env()).stdin(std::process::Stdio::null()).kill_on_drop(true);

		let child = command
			.spawn()
			.map_err(|err| PlatformError::LaunchRejected(format!("spawn {}: {err}", self.inner.agent_bin.display())))?;

		let task = TaskHandle::new(format!("local-{}", self.inner.next_task.fetch_add(1, Ordering::SeqCst)));
		let (stop_tx, stop_rx) = mpsc::channel(1);
		self.inner.tasks.insert(task.clone(), stop_tx);

		let addr: SocketAddr = format!("{}:{}", self.inner.advertise_host, proxy_port)
			.parse()
			.map_err(|err| PlatformError::LaunchRejected(format!("advertise address: {err}")))?;

		debug!(target = "wc.platform", task = %task, session = %spec.session_id, proxy_port, "spawned local agent");
		tokio::spawn(monitor(self.inner.clone(), child, task.clone(), spec, addr, stop_rx));
		Ok(task)
	}

	async fn stop(&self, handle: &TaskHandle) -> Result<(), PlatformError> {
		match self.inner.tasks.get(handle) {
			Some(entry) => {
				let _ = entry.value().send(()).await;
				Ok(())
			}
			None => Err(PlatformError::TaskNotFound),
		}
	}

	async fn resolve_endpoint(&self, attachment: &AttachmentId) -> Result<SocketAddr, PlatformError> {
		Err(PlatformError::NetworkUnresolved(format!(
			"local platform publishes addresses directly, no attachment {}",
			attachment.as_str()
		)))
	}

	fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskStateEvent>> {
		self.inner.events_rx.lock().take()
	}
}

async fn monitor(inner: Arc<LocalInner>, mut child: Child, task: TaskHandle, spec: LaunchSpec, addr: SocketAddr, mut stop_rx: mpsc::Receiver<()>) {
	let session_id = spec.session_id.clone();
	let emit = |state: TaskState| {
		let _ = inner.events_tx.send(TaskStateEvent {
			task: task.clone(),
			session_id: Some(session_id.clone()),
			state,
			at: now_ts(),
		});
	};

	// Boot phase: the agent is up once its proxy port accepts.
	tokio::select! {
		ready = wait_for_port(addr, inner.boot_deadline) => {
			if !ready {
				warn!(target = "wc.platform", task = %task, "agent did not open its proxy port; killing");
				terminate_child(&mut child, inner.stop_grace).await;
				inner.tasks.remove(&task);
				emit(TaskState::Stopped { reason: "boot timeout".to_string() });
				return;
			}
			emit(TaskState::Running { network: Some(TaskNetwork::Address(addr)) });
		}
		status = child.wait() => {
			inner.tasks.remove(&task);
			emit(TaskState::Stopped { reason: exit_reason(status) });
			return;
		}
		_ = stop_rx.recv() => {
			terminate_child(&mut child, inner.stop_grace).await;
			inner.tasks.remove(&task);
			emit(TaskState::Stopped { reason: "stopped before boot".to_string() });
			return;
		}
	}

	// Serving phase: wait for a stop request or the process exiting on its own.
	tokio::select! {
		status = child.wait() => {
			inner.tasks.remove(&task);
			emit(TaskState::Stopped { reason: exit_reason(status) });
		}
		_ = stop_rx.recv() => {
			terminate_child(&mut child, inner.stop_grace).await;
			inner.tasks.remove(&task);
			emit(TaskState::Stopped { reason: "terminated".to_string() });
		}
	}
}

async fn wait_for_port(addr: SocketAddr, deadline: Duration) -> bool {
	let until = tokio::time::Instant::now() + deadline;
	loop {
		if TcpStream::connect(addr).await.is_ok() {
			return true;
		}
		if tokio::time::Instant::now() >= until {
			return false;
		}
		tokio::time::sleep(READINESS_POLL).await;
	}
}

/// SIGTERM first, SIGKILL after the grace period.
async fn terminate_child(child: &mut Child, grace: Duration) {
	#[cfg(unix)]
	if let Some(pid) = child.id() {
		unsafe {
			libc::kill(pid as i32, libc::SIGTERM);
		}
		if tokio::time::timeout(grace, child.wait()).await.is_ok() {
			return;
		}
	}
	#[cfg(not(unix))]
	let _ = grace;
	let _ = child.start_kill();
	let _ = child.wait().await;
}

fn exit_reason(status: std::io::Result<std::process::ExitStatus>) -> String {
	match status {
		Ok(status) if status.success() => "exited cleanly".to_string(),
		Ok(status) => format!("exited with {status}"),
		Err(err) => format!("wait failed: {err}"),
	}
}

fn port_available(port: u16) -> bool {
	StdTcpListener::bind(("127.0.0.1", port)).is_ok()
}
