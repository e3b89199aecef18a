//! Unused proxy sweeping
//!
//! Periodically asks the mesh base to cease communications on every proxy
//! that no longer carries a replica in its direction.

use std::{sync::Weak, time::Duration};

use tokio::{sync::watch, time::interval};
use tracing::{debug, info};

use crate::meshbase::MeshBase;

pub struct ProxySweeper {
    base: Weak<MeshBase>,
    interval: Duration,
}

impl ProxySweeper {
    pub fn new(base: Weak<MeshBase>, interval: Duration) -> Self {
        Self { base, interval }
    }

    /// Runs until `shutdown_rx` changes or the mesh base goes away
    pub async fn start_sweep_task(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.interval);
        // the first tick completes immediately
        interval_timer.tick().await;
        info!(interval = ?self.interval, "Starting proxy sweep task");

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let Some(base) = self.base.upgrade() else {
                        break;
                    };
                    let ceased = base.cease_unused_proxies().await;
                    if ceased > 0 {
                        debug!(base = %base.identifier(), ceased, "Swept unused proxies");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Proxy sweep task received shutdown signal");
                    break;
                }
            }
        }

        info!("Proxy sweep task stopped");
    }
}
