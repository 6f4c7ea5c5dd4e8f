//! Expiry sweeper: routes sessions past `expires_at` through the normal
//! termination path.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wallcrawler_protocol::now_ts;
use wallcrawler_runtime::SessionStore;

use crate::config::Config;
use crate::controller::{Actor, LifecycleController};

pub struct ExpirySweeper {
	config: Config,
	store: Arc<dyn SessionStore>,
	controller: Arc<LifecycleController>,
}

impl ExpirySweeper {
	pub fn new(config: Config, store: Arc<dyn SessionStore>, controller: Arc<LifecycleController>) -> Self {
		Self { config, store, controller }
	}

	pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.config.sweep_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => self.sweep().await,
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							debug!(target = "wc.sweeper", "sweeper shutting down");
							break;
						}
					}
				}
			}
		})
	}

	async fn sweep(&self) {
		let expired = match self.store.scan_expiring(now_ts()).await {
			Ok(expired) => expired,
			Err(err) => {
				warn!(target = "wc.sweeper", error = %err, "expiry scan failed");
				return;
			}
		};
		for record in expired {
			info!(target = "wc.sweeper", session = %record.id, "session expired; terminating");
			if let Err(err) = self.controller.terminate(&record.id, &Actor::Sweeper).await {
				warn!(target = "wc.sweeper", session = %record.id, error = %err, "expiry termination failed");
			}
		}
	}
}
