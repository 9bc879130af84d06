//! State shared by the node session and its subsystems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::Engine;

/// What every subsystem needs to act: the engine, the repository it is bound to,
/// and the session's feature flags.
pub(crate) struct NodeContext {
    pub engine: Arc<dyn Engine>,
    pub repo: String,
    pub online: bool,
    pub pubsub: bool,
    pub poll_interval: Duration,
    pub callback_window: Duration,
    pub join_timeout: Duration,
    closed: AtomicBool,
}

impl NodeContext {
    pub fn new(
        engine: Arc<dyn Engine>,
        repo: String,
        online: bool,
        pubsub: bool,
        options: &crate::config::NodeOptions,
    ) -> Self {
        Self {
            engine,
            repo,
            online,
            pubsub,
            poll_interval: options.poll_interval,
            callback_window: options.callback_window,
            join_timeout: options.join_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed. Returns true only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn require_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::precondition("node session is closed"));
        }
        Ok(())
    }

    /// Open and online.
    pub fn require_online(&self, what: &str) -> Result<()> {
        self.require_open()?;
        if !self.online {
            return Err(Error::precondition(format!("cannot {what} in offline mode")));
        }
        Ok(())
    }

    /// Open, online and pubsub enabled.
    pub fn require_pubsub(&self, what: &str) -> Result<()> {
        self.require_online(what)?;
        if !self.pubsub {
            return Err(Error::precondition("pubsub is not enabled for this node"));
        }
        Ok(())
    }
}
