//! Command intake and event publication.
//!
//! Terminate can arrive two ways: a process signal from the container
//! runtime, or an [`AgentCommand`] on the WebSocket control channel named
//! by `WALLCRAWLER_CONTROL_URL`. Both feed one command queue. Outbound
//! lifecycle events go back over the control channel when it exists,
//! otherwise they are logged for the platform to scrape.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wallcrawler_protocol::{AgentCommand, LifecycleEvent};

use crate::error::{AgentError, Result};

pub fn command_channel() -> (mpsc::UnboundedSender<AgentCommand>, mpsc::UnboundedReceiver<AgentCommand>) {
	mpsc::unbounded_channel()
}

/// Translates process signals into terminate commands.
pub fn spawn_signal_commands(commands: mpsc::UnboundedSender<AgentCommand>) {
	tokio::spawn(async move {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{SignalKind, signal};

			let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
			let Ok(mut sigint) = signal(SignalKind::interrupt()) else { return };
			tokio::select! {
				_ = sigterm.recv() => {
					info!(target = "wc.agent", "received SIGTERM");
					let _ = commands.send(AgentCommand::Terminate { reason: Some("SIGTERM".to_string()) });
				}
				_ = sigint.recv() => {
					info!(target = "wc.agent", "received SIGINT");
					let _ = commands.send(AgentCommand::Terminate { reason: Some("SIGINT".to_string()) });
				}
			}
		}

		#[cfg(windows)]
		{
			if tokio::signal::ctrl_c().await.is_ok() {
				info!(target = "wc.agent", "received Ctrl+C");
				let _ = commands.send(AgentCommand::Terminate { reason: Some("ctrl-c".to_string()) });
			}
		}
	});
}

/// Where cleanup notifications go.
pub enum EventSink {
	/// No control channel: events are logged only.
	Log,
	/// Events are written to the control channel writer task.
	Control(mpsc::UnboundedSender<LifecycleEvent>),
}

impl EventSink {
	pub fn publish(&self, event: LifecycleEvent) {
		match self {
			EventSink::Log => {
				info!(target = "wc.agent", event = ?event, "lifecycle event (no control channel)");
			}
			EventSink::Control(tx) => {
				if tx.send(event).is_err() {
					warn!(target = "wc.agent", "control channel writer gone; event dropped");
				}
			}
		}
	}
}

/// Connects the WebSocket control channel: inbound frames become commands,
/// and the returned sink writes lifecycle events back on the same socket.
pub async fn connect_control(url: &str, commands: mpsc::UnboundedSender<AgentCommand>) -> Result<EventSink> {
	let (stream, _) = connect_async(url).await.map_err(|err| AgentError::Proxy(format!("control connect {url}: {err}")))?;
	info!(target = "wc.agent", url, "control channel connected");

	let (mut writer, mut reader) = stream.split();
	let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LifecycleEvent>();

	tokio::spawn(async move {
		while let Some(event) = event_rx.recv().await {
			let Ok(payload) = serde_json::to_string(&event) else { continue };
			if writer.send(Message::Text(payload)).await.is_err() {
				warn!(target = "wc.agent", "control channel write failed");
				break;
			}
		}
	});

	tokio::spawn(async move {
		while let Some(frame) = reader.next().await {
			match frame {
				Ok(Message::Text(text)) => match serde_json::from_str::<AgentCommand>(&text) {
					Ok(command) => {
						debug!(target = "wc.agent", command = ?command, "control command received");
						if commands.send(command).is_err() {
							break;
						}
					}
					Err(err) => warn!(target = "wc.agent", error = %err, "undecodable control frame"),
				},
				Ok(Message::Close(_)) => break,
				Ok(_) => {}
				Err(err) => {
					warn!(target = "wc.agent", error = %err, "control channel read failed");
					break;
				}
			}
		}
		debug!(target = "wc.agent", "control channel closed");
	});

	Ok(EventSink::Control(event_tx))
}
