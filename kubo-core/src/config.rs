//! Session options: where the repository lives, which features are on, and the
//! timing of pubsub delivery.

use std::path::PathBuf;
use std::time::Duration;

/// Default wait between two "try next message" polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default window a callback worker waits for one message before re-checking its stop signal.
pub const DEFAULT_CALLBACK_WINDOW: Duration = Duration::from_millis(500);

/// Default bounded join when stopping a callback worker.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for [`crate::NodeSession::open`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Repository location. `None` creates a temporary repository removed on close.
    pub repo_path: Option<PathBuf>,
    /// Connect to the network. Offline sessions reject all networked operations.
    pub online: bool,
    /// Enable pubsub (only takes effect when online).
    pub enable_pubsub: bool,
    pub poll_interval: Duration,
    pub callback_window: Duration,
    pub join_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            repo_path: None,
            online: true,
            enable_pubsub: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            callback_window: DEFAULT_CALLBACK_WINDOW,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl NodeOptions {
    /// Temporary repository with the given feature flags.
    pub fn ephemeral(online: bool, enable_pubsub: bool) -> Self {
        Self {
            online,
            enable_pubsub,
            ..Self::default()
        }
    }

    pub fn with_repo(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(path.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}
