use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use jsonrpsee::core::{RpcResult, async_trait};
use jsonrpsee::server::ServerBuilder;
use jsonrpsee::types::error::ErrorObjectOwned;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use wallcrawler::{Actor, Capabilities, Config, CreateSessionRequest, LifecycleController, LifecycleError, Orchestrator};
use wallcrawler_protocol::{ContextRef, ProjectId, Scope, SessionId, SessionView};
use wallcrawler_runtime::{
	LocalProcessPlatform, MemoryBus, MemoryNotifier, MemoryProjectDirectory, MemoryStore, ProjectRecord, ProjectStatus, RecordingCallback,
};

use crate::DAEMON_TCP_PORT;
use crate::cli::ServeArgs;
use crate::rpc::{CreateSessionParams, OrchestratorRpcServer};

const RPC_CREATE_FAILED: i32 = -32060;
const RPC_GET_FAILED: i32 = -32061;
const RPC_TERMINATE_FAILED: i32 = -32062;
const RPC_TOKEN_FAILED: i32 = -32063;

struct RpcHandler {
	controller: Arc<LifecycleController>,
	shutdown_tx: watch::Sender<bool>,
}

impl RpcHandler {
	fn actor(project_id: Option<String>) -> Actor {
		match project_id {
			Some(project) => Actor::Client { project: ProjectId::new(project) },
			None => Actor::Operator,
		}
	}
}

#[async_trait]
impl OrchestratorRpcServer for RpcHandler {
	async fn ping(&self) -> RpcResult<bool> {
		Ok(true)
	}

	async fn create_session(&self, params: CreateSessionParams) -> RpcResult<SessionView> {
		let mut request = CreateSessionRequest::new(ProjectId::new(&params.project_id));
		if let Some(timeout) = params.timeout_secs {
			request = request.with_timeout(timeout);
		}
		if let Some(context_id) = params.context_id {
			request = request.with_context(ContextRef {
				id: context_id,
				persist: params.persist,
			});
		}

		if params.wait {
			self.controller.create_and_wait(request).await.map_err(|err| rpc_error("create_failed", RPC_CREATE_FAILED, err))
		} else {
			self.controller
				.create(request)
				.await
				.map(|record| record.view())
				.map_err(|err| rpc_error("create_failed", RPC_CREATE_FAILED, err))
		}
	}

	async fn get_session(&self, session_id: String, project_id: Option<String>) -> RpcResult<SessionView> {
		self.controller
			.get(&SessionId::new(session_id), &Self::actor(project_id))
			.await
			.map(|record| record.view())
			.map_err(|err| rpc_error("get_failed", RPC_GET_FAILED, err))
	}

	async fn terminate_session(&self, session_id: String, project_id: Option<String>) -> RpcResult<SessionView> {
		self.controller
			.terminate(&SessionId::new(session_id), &Self::actor(project_id))
			.await
			.map(|record| record.view())
			.map_err(|err| rpc_error("terminate_failed", RPC_TERMINATE_FAILED, err))
	}

	async fn mint_token(&self, session_id: String, scope: String, client_ip: Option<String>) -> RpcResult<String> {
		let scope: Scope = scope
			.parse()
			.map_err(|_| rpc_error("token_failed", RPC_TOKEN_FAILED, LifecycleError::Internal(format!("unknown scope: {scope}"))))?;
		self.controller
			.mint_token(&SessionId::new(session_id), scope, &Actor::Operator, client_ip)
			.await
			.map_err(|err| rpc_error("token_failed", RPC_TOKEN_FAILED, err))
	}

	async fn shutdown(&self) -> RpcResult<()> {
		let _ = self.shutdown_tx.send(true);
		Ok(())
	}
}

pub struct Daemon {
	orchestrator: Orchestrator,
	controller: Arc<LifecycleController>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
	/// Builds a full orchestrator over in-memory infrastructure and the
	/// local process platform.
	pub async fn start(args: ServeArgs) -> Result<Self> {
		let agent_bin = resolve_agent_bin(args.agent_bin)?;
		info!(target = "wc.daemon", agent = %agent_bin.display(), "using agent binary");

		let mut projects = args.projects;
		if projects.is_empty() {
			projects.push(crate::cli::ProjectSpec { id: "default".to_string(), concurrency: None });
		}
		let directory = MemoryProjectDirectory::with_projects(projects.into_iter().map(|spec| ProjectRecord {
			id: ProjectId::new(spec.id),
			status: ProjectStatus::Active,
			concurrency: spec.concurrency.unwrap_or(args.default_concurrency),
		}));

		let config = Config {
			default_project_concurrency: args.default_concurrency,
			..Config::default()
		};

		let orchestrator = Orchestrator::start(
			config,
			Capabilities {
				store: Arc::new(MemoryStore::new()),
				bus: Arc::new(MemoryBus::new()),
				notifier: Arc::new(MemoryNotifier::new()),
				platform: Arc::new(LocalProcessPlatform::new(agent_bin)),
				projects: Arc::new(directory),
				callback: Arc::new(RecordingCallback::new()),
			},
		)
		.map_err(|err| anyhow!("orchestrator start failed: {err}"))?;

		let controller = orchestrator.controller();
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Ok(Self {
			orchestrator,
			controller,
			shutdown_tx,
			shutdown_rx,
		})
	}

	pub async fn run(mut self) -> Result<()> {
		let addr = format!("127.0.0.1:{DAEMON_TCP_PORT}");
		let server = ServerBuilder::default()
			.build(&addr)
			.await
			.with_context(|| format!("Failed to bind daemon RPC server: {addr}"))?;

		let rpc = RpcHandler {
			controller: self.controller.clone(),
			shutdown_tx: self.shutdown_tx.clone(),
		};
		let handle = server.start(rpc.into_rpc());
		info!(target = "wc.daemon", addr, "daemon listening");

		#[cfg(unix)]
		{
			use tokio::signal::unix::{SignalKind, signal};

			let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
			let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

			loop {
				tokio::select! {
					_ = self.shutdown_rx.changed() => {
						if *self.shutdown_rx.borrow() {
							info!(target = "wc.daemon", "shutdown requested via RPC");
							break;
						}
					}
					_ = sigterm.recv() => {
						info!(target = "wc.daemon", "received SIGTERM, shutting down");
						break;
					}
					_ = sigint.recv() => {
						info!(target = "wc.daemon", "received SIGINT, shutting down");
						break;
					}
				}
			}
		}

		#[cfg(windows)]
		{
			loop {
				tokio::select! {
					_ = self.shutdown_rx.changed() => {
						if *self.shutdown_rx.borrow() {
							info!(target = "wc.daemon", "shutdown requested via RPC");
							break;
						}
					}
					_ = tokio::signal::ctrl_c() => {
						info!(target = "wc.daemon", "received Ctrl+C, shutting down");
						break;
					}
				}
			}
		}

		self.orchestrator.shutdown().await;
		let _ = handle.stop();
		handle.stopped().await;
		Ok(())
	}
}

/// Explicit path, then a sibling of this binary, then PATH.
fn resolve_agent_bin(configured: Option<PathBuf>) -> Result<PathBuf> {
	if let Some(path) = configured {
		if !path.exists() {
			return Err(anyhow!("agent binary not found at {}", path.display()));
		}
		return Ok(path);
	}

	if let Ok(mut path) = std::env::current_exe() {
		path.pop();
		path.push("wallcrawler-agent");
		if path.exists() {
			return Ok(path);
		}
	}

	which::which("wallcrawler-agent").context("wallcrawler-agent not found next to this binary or on PATH")
}

fn rpc_error(code: &str, rpc_code: i32, err: LifecycleError) -> ErrorObjectOwned {
	ErrorObjectOwned::owned(rpc_code, err.to_string(), Some(json!({ "code": code })))
}
