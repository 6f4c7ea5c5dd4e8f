use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};
use wallcrawler_protocol::SessionView;

/// Create-session parameters as accepted over daemon RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionParams {
	pub project_id: String,
	#[serde(default)]
	pub timeout_secs: Option<u64>,
	#[serde(default)]
	pub context_id: Option<String>,
	#[serde(default)]
	pub persist: bool,
	/// Block until the session is ready (or failed) before returning.
	#[serde(default)]
	pub wait: bool,
}

#[rpc(client, server)]
pub trait OrchestratorRpc {
	#[method(name = "wc_ping")]
	async fn ping(&self) -> RpcResult<bool>;

	#[method(name = "wc_create_session")]
	async fn create_session(&self, params: CreateSessionParams) -> RpcResult<SessionView>;

	#[method(name = "wc_get_session")]
	async fn get_session(&self, session_id: String, project_id: Option<String>) -> RpcResult<SessionView>;

	#[method(name = "wc_terminate_session")]
	async fn terminate_session(&self, session_id: String, project_id: Option<String>) -> RpcResult<SessionView>;

	#[method(name = "wc_mint_token")]
	async fn mint_token(&self, session_id: String, scope: String, client_ip: Option<String>) -> RpcResult<String>;

	#[method(name = "wc_shutdown")]
	async fn shutdown(&self) -> RpcResult<()>;
}
