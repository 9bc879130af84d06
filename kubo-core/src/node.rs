//! The node session: one running engine instance bound to one repository, and the
//! subsystems that act on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::NodeOptions;
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::files::Files;
use crate::gateway::{check_positive, check_status, Engine};
use crate::p2p::StreamMount;
use crate::peers::Peers;
use crate::pubsub::PubSub;

/// A running node. Closing (explicitly or on drop) releases every subscription, the
/// engine instance and any temporary repository.
pub struct NodeSession {
    ctx: Arc<NodeContext>,
    repo_path: PathBuf,
    temp_dir: Mutex<Option<TempDir>>,
    peer_id: Mutex<Option<String>>,
    pubsub: PubSub,
    p2p: StreamMount,
    files: Files,
    peers: Peers,
}

impl NodeSession {
    /// Open a session: initialize the repository if it has no config yet, start the
    /// node, and enable pubsub when requested on an online node.
    pub fn open(engine: Arc<dyn Engine>, options: NodeOptions) -> Result<Self> {
        let (repo_path, temp_dir) = match &options.repo_path {
            Some(path) => (path.clone(), None),
            None => {
                let dir = tempfile::Builder::new().prefix("kubo-repo-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        let repo = repo_path
            .to_str()
            .ok_or_else(|| {
                Error::Resource(format!(
                    "repository path is not valid UTF-8: {}",
                    repo_path.display()
                ))
            })?
            .to_string();

        if !repo_path.join("config").exists() {
            // 1 = created, 0 = already initialized.
            check_status("CreateRepo", engine.create_repo(&repo)?)?;
            info!(repo = %repo, "initialized repository");
        }
        check_positive("RunNode", engine.run_node(&repo)?)?;

        let pubsub_on = options.online && options.enable_pubsub;
        let ctx = Arc::new(NodeContext::new(
            engine,
            repo,
            options.online,
            pubsub_on,
            &options,
        ));
        let session = Self {
            pubsub: PubSub::new(ctx.clone()),
            p2p: StreamMount::new(ctx.clone()),
            files: Files::new(ctx.clone()),
            peers: Peers::new(ctx.clone()),
            ctx,
            repo_path,
            temp_dir: Mutex::new(temp_dir),
            peer_id: Mutex::new(None),
        };
        // From here on a failure drops `session`, which stops the node again.
        if pubsub_on {
            let code = session.ctx.engine.pubsub_enable(&session.ctx.repo)?;
            check_status("PubSubEnable", code)?;
        }
        info!(
            repo = %session.ctx.repo,
            online = options.online,
            pubsub = pubsub_on,
            temporary = session.temp_dir.lock().is_some(),
            "node session running"
        );
        Ok(session)
    }

    /// Session on a temporary repository that is removed on close.
    pub fn ephemeral(engine: Arc<dyn Engine>, online: bool, enable_pubsub: bool) -> Result<Self> {
        Self::open(engine, NodeOptions::ephemeral(online, enable_pubsub))
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn is_online(&self) -> bool {
        self.ctx.online
    }

    pub fn pubsub_enabled(&self) -> bool {
        self.ctx.pubsub
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// This node's peer id, looked up on first use. `None` for offline sessions or when
    /// the engine cannot report one yet.
    pub fn peer_id(&self) -> Result<Option<String>> {
        self.ctx.require_open()?;
        let mut cached = self.peer_id.lock();
        if cached.is_none() && self.ctx.online {
            *cached = self
                .ctx
                .engine
                .node_id(&self.ctx.repo)?
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
        }
        Ok(cached.clone())
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn p2p(&self) -> &StreamMount {
        &self.p2p
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Tear the session down. Idempotent; every step runs even if an earlier one failed,
    /// and failures are logged rather than returned.
    pub fn close(&self) {
        if !self.ctx.mark_closed() {
            return;
        }
        let failed = self.pubsub.close_all();
        if failed > 0 {
            warn!(failed, "some subscriptions did not close cleanly");
        }

        match self
            .ctx
            .engine
            .cleanup_node(&self.ctx.repo)
            .and_then(|code| check_status("CleanupNode", code))
        {
            Ok(_) => debug!(repo = %self.ctx.repo, "node cleaned up"),
            Err(e) => warn!(repo = %self.ctx.repo, error = %e, "error cleaning up node"),
        }

        if let Some(dir) = self.temp_dir.lock().take() {
            if let Err(e) = dir.close() {
                warn!(repo = %self.ctx.repo, error = %e, "could not remove temporary repository");
            }
        }
        info!(repo = %self.ctx.repo, "node session closed");
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("repo", &self.ctx.repo)
            .field("online", &self.ctx.online)
            .field("pubsub", &self.ctx.pubsub)
            .field("closed", &self.ctx.is_closed())
            .finish()
    }
}
