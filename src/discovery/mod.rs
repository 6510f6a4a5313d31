//! Peer discovery
//!
//! Populates the peer table through one of two interchangeable strategies:
//! LAN broadcast announcements, or enumeration of an overlay agent. The
//! strategy is chosen once at startup and holds for the node's lifetime.

mod error;
mod lan;
mod overlay;
mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;

pub use error::DiscoveryError;
pub use lan::{local_ip, Announcement};
pub use table::{PeerRecord, PeerTable};

/// Which discovery strategy the node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// UDP broadcast announcements with timeout-based aging
    Lan,
    /// Overlay agent enumeration with immediate removal
    Overlay,
}

/// Running discovery engine
pub struct Discovery {
    strategy: Strategy,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Probe the overlay agent, pick a strategy, and start its loops
    pub async fn start(config: &Config, username: &str, table: Arc<PeerTable>) -> Self {
        let strategy = if overlay::agent_reachable().await {
            Strategy::Overlay
        } else {
            Strategy::Lan
        };
        info!("Discovery strategy: {:?}", strategy);

        let running = Arc::new(AtomicBool::new(true));
        let tasks = match strategy {
            Strategy::Lan => lan::spawn(config, username, table, running.clone()),
            Strategy::Overlay => overlay::spawn(config, table, running.clone()),
        };

        Self {
            strategy,
            running,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Stop all discovery loops. Calling it again is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Discovery stopped");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}
