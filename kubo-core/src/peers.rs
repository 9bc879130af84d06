//! Swarm peering: connect, list connected peers, look peers up in the routing table.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::context::NodeContext;
use crate::error::Result;
use crate::gateway::check_zero;
use crate::wire::decode_string_list;

/// Default bound on a peer lookup.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// The engine takes lookup timeouts in whole seconds; partial seconds round up.
fn whole_seconds(timeout: Duration) -> i32 {
    let secs = timeout
        .as_secs()
        .saturating_add(u64::from(timeout.subsec_nanos() > 0));
    i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
}

pub struct Peers {
    ctx: Arc<NodeContext>,
}

impl Peers {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Dial a peer by multiaddress (ending in `/p2p/<peer id>`).
    pub fn connect(&self, addr: &str) -> Result<()> {
        self.ctx.require_online("connect to peers")?;
        let code = self.ctx.engine.connect_to_peer(&self.ctx.repo, addr)?;
        check_zero("ConnectToPeer", code)?;
        info!(peer = addr, "connected");
        Ok(())
    }

    /// Connected peers as `<multiaddress>/<peer id>` strings.
    pub fn list(&self) -> Result<Vec<String>> {
        self.ctx.require_online("list peers")?;
        let json = self.ctx.engine.list_peers(&self.ctx.repo)?;
        Ok(json.map(|j| decode_string_list(&j)).unwrap_or_default())
    }

    /// Known multiaddresses of `peer_id`. `None` uses [`DEFAULT_FIND_TIMEOUT`]; the
    /// timeout is rounded up to whole seconds.
    pub fn find(&self, peer_id: &str, timeout: Option<Duration>) -> Result<Vec<String>> {
        self.ctx.require_online("find peers")?;
        let secs = whole_seconds(timeout.unwrap_or(DEFAULT_FIND_TIMEOUT));
        let json = self.ctx.engine.find_peer(&self.ctx.repo, peer_id, secs)?;
        let addrs = json.map(|j| decode_string_list(&j)).unwrap_or_default();
        debug!(peer = peer_id, found = addrs.len(), "peer lookup");
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeOptions;
    use crate::gateway::Engine;
    use crate::mock::MockEngine;

    fn peers_on(engine: &Arc<MockEngine>, repo: &std::path::Path, online: bool) -> Peers {
        let repo = repo.to_string_lossy().into_owned();
        engine.create_repo(&repo).unwrap();
        engine.run_node(&repo).unwrap();
        let ctx = Arc::new(NodeContext::new(
            engine.clone(),
            repo,
            online,
            false,
            &NodeOptions::default(),
        ));
        Peers::new(ctx)
    }

    #[test]
    fn connect_list_and_find() {
        let engine = Arc::new(MockEngine::new());
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = peers_on(&engine, a_dir.path(), true);
        let _b = peers_on(&engine, b_dir.path(), true);
        let b_id = engine
            .node_id(&b_dir.path().to_string_lossy())
            .unwrap()
            .unwrap();

        assert!(a.list().unwrap().is_empty());
        a.connect(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{b_id}")).unwrap();
        let listed = a.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with(&b_id));

        assert_eq!(a.find(&b_id, None).unwrap().len(), 1);
        assert!(a
            .find("12D3KooWNobody", Some(Duration::from_millis(10)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn connect_failure_raises() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let p = peers_on(&engine, dir.path(), true);
        assert!(p.connect("/p2p/12D3KooWNobody").is_err());
    }

    #[test]
    fn offline_rejects_without_engine_calls() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let p = peers_on(&engine, dir.path(), false);
        let before = engine.call_count();
        assert!(p.connect("/p2p/x").unwrap_err().is_precondition());
        assert!(p.list().unwrap_err().is_precondition());
        assert!(p.find("x", None).unwrap_err().is_precondition());
        assert_eq!(engine.call_count(), before);
    }

    #[test]
    fn lookup_timeout_rounds_up_to_seconds() {
        assert_eq!(whole_seconds(Duration::from_millis(1900)), 2);
        assert_eq!(whole_seconds(Duration::from_secs(10)), 10);
        assert_eq!(whole_seconds(Duration::ZERO), 1);
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
