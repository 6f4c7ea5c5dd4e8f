use anyhow::{Result, bail};
use serde_json::json;

use crate::cli::{Cli, Command, SessionCommand, TokenArgs};
use crate::client;
use crate::rpc::{CreateSessionParams, OrchestratorRpcClient as _};
use crate::server::Daemon;

pub async fn dispatch(cli: Cli) -> Result<()> {
	match cli.command {
		Command::Serve(args) => Daemon::start(args).await?.run().await,
		Command::Session(command) => session(command).await,
		Command::Token(args) => token(args).await,
		Command::Ping => ping().await,
		Command::Shutdown => shutdown().await,
	}
}

async fn session(command: SessionCommand) -> Result<()> {
	let client = require_daemon().await?;
	let view = match command {
		SessionCommand::Create {
			project,
			timeout,
			context,
			persist,
			wait,
		} => {
			client
				.create_session(CreateSessionParams {
					project_id: project,
					timeout_secs: timeout,
					context_id: context,
					persist,
					wait,
				})
				.await?
		}
		SessionCommand::Get { id, project } => client.get_session(id, project).await?,
		SessionCommand::Terminate { id, project } => client.terminate_session(id, project).await?,
	};
	println!("{}", serde_json::to_string_pretty(&view)?);
	Ok(())
}

async fn token(args: TokenArgs) -> Result<()> {
	let client = require_daemon().await?;
	let token = client.mint_token(args.id, args.scope, args.ip).await?;
	println!("{token}");
	Ok(())
}

async fn ping() -> Result<()> {
	let running = client::try_connect().await.is_some();
	println!("{}", json!({ "running": running }));
	if !running {
		std::process::exit(1);
	}
	Ok(())
}

async fn shutdown() -> Result<()> {
	match client::try_connect().await {
		Some(client) => {
			client.shutdown().await?;
			println!("{}", json!({ "stopped": true }));
			Ok(())
		}
		None => {
			println!("{}", json!({ "stopped": false, "reason": "daemon not running" }));
			Ok(())
		}
	}
}

async fn require_daemon() -> Result<jsonrpsee::http_client::HttpClient> {
	match client::try_connect().await {
		Some(client) => Ok(client),
		None => bail!("daemon not running; start it with `wallcrawler serve`"),
	}
}
