use anyhow::Context;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use wallcrawler_agent::config::AgentConfig;
use wallcrawler_agent::control::{self, EventSink};
use wallcrawler_agent::lifecycle::Agent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_logging();

	let config = AgentConfig::from_env().context("reading agent environment")?;

	let (commands_tx, commands_rx) = control::command_channel();
	control::spawn_signal_commands(commands_tx.clone());

	let events = match &config.control_url {
		Some(url) => match control::connect_control(url, commands_tx.clone()).await {
			Ok(sink) => sink,
			Err(err) => {
				warn!(target = "wc.agent", error = %err, "control channel unavailable; falling back to signals only");
				EventSink::Log
			}
		},
		None => EventSink::Log,
	};

	Agent::new(config).run(commands_rx, events).await.context("agent run")?;
	Ok(())
}

fn init_logging() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
