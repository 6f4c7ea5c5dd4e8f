//! End-to-end orchestrator tests over in-memory capabilities and the
//! scripted fake platform.

use std::sync::Arc;
use std::time::Duration;

use wallcrawler::{Actor, Capabilities, Config, CreateSessionRequest, LifecycleController, LifecycleError, Orchestrator};
use wallcrawler_protocol::{FailureReason, ProjectId, SessionId, SessionRecord, SessionStatus, TaskHandle, verify};
use wallcrawler_runtime::{
	FakePlatform, MemoryBus, MemoryNotifier, MemoryProjectDirectory, MemoryStore, ProjectRecord, ProjectStatus, RecordingCallback, SessionStore,
	TaskBinding,
};

struct Harness {
	_orchestrator: Orchestrator,
	controller: Arc<LifecycleController>,
	store: Arc<MemoryStore>,
	platform: Arc<FakePlatform>,
	callback: Arc<RecordingCallback>,
}

fn fast_config() -> Config {
	Config {
		provisioner_backoff_base: Duration::from_millis(10),
		readiness_wait_timeout: Duration::from_secs(5),
		call_timeout: Duration::from_secs(1),
		sweep_interval: Duration::from_millis(100),
		..Config::default()
	}
}

fn project(id: &str, concurrency: u32) -> ProjectRecord {
	ProjectRecord {
		id: ProjectId::new(id),
		status: ProjectStatus::Active,
		concurrency,
	}
}

fn start(projects: Vec<ProjectRecord>) -> Harness {
	start_with(fast_config(), projects)
}

fn start_with(config: Config, projects: Vec<ProjectRecord>) -> Harness {
	let store = Arc::new(MemoryStore::new());
	let bus = Arc::new(MemoryBus::new());
	let notifier = Arc::new(MemoryNotifier::new());
	let platform = Arc::new(FakePlatform::new());
	let callback = Arc::new(RecordingCallback::new());
	let directory = Arc::new(MemoryProjectDirectory::with_projects(projects));

	let orchestrator = Orchestrator::start(
		config,
		Capabilities {
			store: store.clone(),
			bus: bus.clone(),
			notifier: notifier.clone(),
			platform: platform.clone(),
			projects: directory,
			callback: callback.clone(),
		},
	)
	.expect("orchestrator start");

	Harness {
		controller: orchestrator.controller(),
		_orchestrator: orchestrator,
		store,
		platform,
		callback,
	}
}

async fn wait_for_status(store: &MemoryStore, id: &SessionId, status: SessionStatus) -> SessionRecord {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let record = store.get(id).await.expect("session exists").record;
		if record.status == status {
			return record;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"session {id} stuck in {} waiting for {status}",
			record.status
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

/// Asserts the recorded status history walks only legal edges.
fn assert_history_legal(record: &SessionRecord) {
	let mut current = SessionStatus::Creating;
	for event in &record.event_history {
		let Some(name) = event.event_type.strip_prefix("status.") else { continue };
		let next = match name {
			"creating" => continue,
			"provisioning" => SessionStatus::Provisioning,
			"starting" => SessionStatus::Starting,
			"ready" => SessionStatus::Ready,
			"terminating" => SessionStatus::Terminating,
			"stopped" => SessionStatus::Stopped,
			"failed" => SessionStatus::Failed,
			other => panic!("unknown status event {other}"),
		};
		assert!(current.may_transition(next), "illegal recorded edge {current} -> {next} in {:#?}", record.event_history);
		current = next;
	}
	assert_eq!(current, record.status);
}

#[tokio::test]
async fn happy_path_create_ready_connect_terminate() {
	let harness = start(vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };

	let created = harness
		.controller
		.create(CreateSessionRequest::new(ProjectId::new("p1")).with_timeout(600))
		.await
		.unwrap();
	assert_eq!(created.status, SessionStatus::Creating);
	assert!(created.connect_url.is_none());

	let ready = harness.controller.wait_for_ready(&created.id, Duration::from_secs(5)).await.unwrap();
	assert_eq!(ready.status, SessionStatus::Ready);
	let connect_url = ready.connect_url.expect("ready session has a connect url");
	assert!(connect_url.starts_with("ws://1.2.3.4:9223/devtools/browser?token="), "unexpected url {connect_url}");

	// The embedded token verifies against the session's own signing key.
	let token = connect_url.split("token=").nth(1).unwrap();
	let stored = harness.store.get(&created.id).await.unwrap().record;
	let claims = verify(token, &stored.signing_key, wallcrawler_protocol::now_ts()).unwrap();
	assert_eq!(claims.sid, created.id.as_str());

	harness.controller.terminate(&created.id, &actor).await.unwrap();
	let stopped = wait_for_status(&harness.store, &created.id, SessionStatus::Stopped).await;
	assert!(stopped.connect_url.is_none());
	assert_eq!(harness.platform.stop_calls().len(), 1);
	assert_history_legal(&stopped);

	// Cleanup released the reverse index.
	let task = stopped.task_handle.clone().expect("task stays recorded for audit");
	assert!(harness.store.task_binding(&task).await.unwrap().is_none());
}

#[tokio::test]
async fn create_rejects_when_project_cap_reached() {
	let harness = start(vec![project("p1", 1)]);

	let first = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	assert_eq!(first.status, SessionStatus::Ready);

	let err = harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap_err();
	assert!(matches!(err, LifecycleError::ConcurrencyExceeded));

	// No second record was inserted.
	let all = harness
		.store
		.query(
			&ProjectId::new("p1"),
			&[
				SessionStatus::Creating,
				SessionStatus::Provisioning,
				SessionStatus::Starting,
				SessionStatus::Ready,
				SessionStatus::Terminating,
				SessionStatus::Stopped,
				SessionStatus::Failed,
			],
		)
		.await
		.unwrap();
	assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn capacity_frees_after_terminal_state() {
	let harness = start(vec![project("p1", 1)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };

	let first = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	harness.controller.terminate(&first.id, &actor).await.unwrap();
	wait_for_status(&harness.store, &first.id, SessionStatus::Stopped).await;

	harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
}

#[tokio::test]
async fn launch_retries_exhaust_to_failed() {
	let harness = start(vec![project("p1", 5)]);
	harness.platform.fail_next_launches(3);

	let err = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap_err();
	assert!(matches!(err, LifecycleError::ProvisioningFailed(FailureReason::LaunchFailed)), "got {err}");

	assert_eq!(harness.platform.launch_count(), 3);

	let record = harness
		.store
		.query(&ProjectId::new("p1"), &[SessionStatus::Failed])
		.await
		.unwrap()
		.pop()
		.expect("failed record");
	assert_eq!(record.failure_reason, Some(FailureReason::LaunchFailed));
	assert!(record.connect_url.is_none());
	assert_history_legal(&record);
}

#[tokio::test]
async fn launch_failure_then_success_recovers() {
	let harness = start(vec![project("p1", 5)]);
	harness.platform.fail_next_launches(2);

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	assert_eq!(ready.status, SessionStatus::Ready);
	assert_eq!(harness.platform.launch_count(), 3);
}

#[tokio::test]
async fn terminate_wins_race_against_promotion() {
	let harness = start(vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };
	harness.platform.hold_running_events();

	let created = harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let starting = wait_for_status(&harness.store, &created.id, SessionStatus::Starting).await;
	let task = starting.task_handle.clone().unwrap();

	// Terminate commits first; the late RUNNING event must not overwrite it.
	harness.controller.terminate(&created.id, &actor).await.unwrap();
	harness.platform.emit_running(&task);

	let stopped = wait_for_status(&harness.store, &created.id, SessionStatus::Stopped).await;
	assert!(stopped.connect_url.is_none(), "terminated session must never expose a connect url");
	assert_history_legal(&stopped);
}

#[tokio::test]
async fn terminate_before_launch_stops_without_workload() {
	let harness = start(vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };
	// Make the first launch hang in backoff so the session sits pre-task.
	harness.platform.fail_next_launches(2);

	let created = harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let record = harness.controller.terminate(&created.id, &actor).await.unwrap();
	assert!(matches!(record.status, SessionStatus::Stopped | SessionStatus::Terminating));

	let stopped = wait_for_status(&harness.store, &created.id, SessionStatus::Stopped).await;
	assert_history_legal(&stopped);
}

#[tokio::test]
async fn terminate_is_idempotent_with_at_most_one_stop() {
	let harness = start(vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();

	for _ in 0..3 {
		harness.controller.terminate(&ready.id, &actor).await.unwrap();
	}
	let stopped = wait_for_status(&harness.store, &ready.id, SessionStatus::Stopped).await;

	for _ in 0..2 {
		let again = harness.controller.terminate(&ready.id, &actor).await.unwrap();
		assert_eq!(again.status, SessionStatus::Stopped);
	}
	assert_eq!(harness.platform.stop_calls().len(), 1, "exactly one workload stop for one task");
	assert_history_legal(&stopped);
}

#[tokio::test]
async fn task_exit_from_below_fails_the_session() {
	let harness = start(vec![project("p1", 5)]);

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let record = harness.store.get(&ready.id).await.unwrap().record;
	let task = record.task_handle.clone().unwrap();

	harness.platform.emit_stopped(&task, "container exited with 137");

	let failed = wait_for_status(&harness.store, &ready.id, SessionStatus::Failed).await;
	assert_eq!(failed.failure_reason, Some(FailureReason::TaskExited));
	assert_history_legal(&failed);
}

#[tokio::test]
async fn late_events_for_terminal_sessions_are_discarded() {
	let harness = start(vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let task = harness.store.get(&ready.id).await.unwrap().record.task_handle.clone().unwrap();

	harness.controller.terminate(&ready.id, &actor).await.unwrap();
	let stopped = wait_for_status(&harness.store, &ready.id, SessionStatus::Stopped).await;

	harness.platform.emit_running(&task);
	harness.platform.emit_stopped(&task, "late duplicate");
	tokio::time::sleep(Duration::from_millis(50)).await;

	let after = harness.store.get(&ready.id).await.unwrap().record;
	assert_eq!(after.status, SessionStatus::Stopped);
	assert_eq!(after.event_history.len(), stopped.event_history.len(), "late events must not append state changes");
}

#[tokio::test]
async fn attachment_resolution_promotes_to_ready() {
	let harness = start(vec![project("p1", 5)]);
	harness.platform.emit_attachments();

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	assert_eq!(ready.public_endpoint.as_deref(), Some("1.2.3.4:9223"));
}

#[tokio::test]
async fn workflow_callback_delivered_once_on_ready() {
	let harness = start(vec![project("p1", 5)]);
	harness.platform.hold_running_events();

	let created = harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let starting = wait_for_status(&harness.store, &created.id, SessionStatus::Starting).await;
	let task = starting.task_handle.clone().unwrap();

	// An external workflow left its callback token on the binding.
	harness
		.store
		.bind_task(&task, TaskBinding { session_id: created.id.clone(), callback_token: Some("wf-token-1".into()) })
		.await
		.unwrap();

	harness.platform.emit_running(&task);
	wait_for_status(&harness.store, &created.id, SessionStatus::Ready).await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	let delivered = harness.callback.delivered();
	assert_eq!(delivered.len(), 1);
	assert_eq!(delivered[0].0, "wf-token-1");
	assert_eq!(delivered[0].1.id, created.id);

	// Token consumed; correlation binding retained.
	let binding = harness.store.task_binding(&task).await.unwrap().unwrap();
	assert!(binding.callback_token.is_none());
}

#[tokio::test]
async fn expired_sessions_are_swept_through_termination() {
	let harness = start(vec![project("p1", 5)]);

	let ready = harness
		.controller
		.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1")).with_timeout(1))
		.await
		.unwrap();

	let stopped = wait_for_status(&harness.store, &ready.id, SessionStatus::Stopped).await;
	assert!(stopped.event_history.iter().any(|e| {
		e.detail
			.as_ref()
			.and_then(|d| d.get("reason"))
			.and_then(|r| r.as_str())
			.is_some_and(|r| r == "session expired")
	}));
	assert_eq!(harness.platform.stop_calls().len(), 1);
	assert_history_legal(&stopped);
}

#[tokio::test]
async fn create_validates_project_and_timeout() {
	let harness = start(vec![
		project("p1", 5),
		ProjectRecord {
			id: ProjectId::new("suspended"),
			status: ProjectStatus::Suspended,
			concurrency: 5,
		},
	]);

	let err = harness.controller.create(CreateSessionRequest::new(ProjectId::new("missing"))).await.unwrap_err();
	assert!(matches!(err, LifecycleError::InvalidProject(_)));

	let err = harness.controller.create(CreateSessionRequest::new(ProjectId::new("suspended"))).await.unwrap_err();
	assert!(matches!(err, LifecycleError::InvalidProject(_)));

	let err = harness
		.controller
		.create(CreateSessionRequest::new(ProjectId::new("p1")).with_timeout(0))
		.await
		.unwrap_err();
	assert!(matches!(err, LifecycleError::InvalidTimeout));

	// Oversized timeouts clamp instead of failing.
	let record = harness
		.controller
		.create(CreateSessionRequest::new(ProjectId::new("p1")).with_timeout(1_000_000))
		.await
		.unwrap();
	assert_eq!(record.expires_at - record.created_at, fast_config().max_session_timeout);
}

#[tokio::test]
async fn cross_project_access_is_unauthorized() {
	let harness = start(vec![project("p1", 5), project("p2", 5)]);
	let intruder = Actor::Client { project: ProjectId::new("p2") };

	let created = harness.controller.create(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();

	assert!(matches!(harness.controller.get(&created.id, &intruder).await.unwrap_err(), LifecycleError::Unauthorized));
	assert!(matches!(
		harness.controller.terminate(&created.id, &intruder).await.unwrap_err(),
		LifecycleError::Unauthorized
	));

	// The session is untouched by the rejected calls.
	let record = harness.store.get(&created.id).await.unwrap().record;
	assert!(!record.status.is_terminal());
}

#[tokio::test]
async fn minted_tokens_bind_ip_only_when_configured() {
	let config = Config { bind_token_to_client_ip: true, ..fast_config() };
	let harness = start_with(config, vec![project("p1", 5)]);
	let actor = Actor::Client { project: ProjectId::new("p1") };

	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();
	let token = harness
		.controller
		.mint_token(&ready.id, wallcrawler_protocol::Scope::Debug, &actor, Some("203.0.113.9".into()))
		.await
		.unwrap();

	let record = harness.store.get(&ready.id).await.unwrap().record;
	let claims = verify(&token, &record.signing_key, wallcrawler_protocol::now_ts()).unwrap();
	assert_eq!(claims.ip.as_deref(), Some("203.0.113.9"));
	assert_eq!(claims.scope, wallcrawler_protocol::Scope::Debug);
}

#[tokio::test]
async fn single_task_binding_for_bound_states() {
	let harness = start(vec![project("p1", 5)]);
	let ready = harness.controller.create_and_wait(CreateSessionRequest::new(ProjectId::new("p1"))).await.unwrap();

	let record = harness.store.get(&ready.id).await.unwrap().record;
	let task: Option<&TaskHandle> = record.task_handle.as_ref();
	assert!(task.is_some(), "READY requires a bound task");
	assert!(record.validate().is_ok(), "{:?}", record.validate());
}
