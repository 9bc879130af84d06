//! Stream mounting: TCP services exposed over libp2p protocols and the reverse.
//!
//! All mapping state lives in the engine. This type only formats addresses, checks
//! session preconditions and translates the engine's results.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::error::Result;
use crate::gateway::{check_status, CloseArgs};
use crate::wire::{decode_listing, Connections};

/// A local endpoint: a bare port on the loopback interface, or a full multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Port(u16),
    Multiaddr(String),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Port(port) => write!(f, "/ip4/127.0.0.1/tcp/{port}"),
            Addr::Multiaddr(addr) => f.write_str(addr),
        }
    }
}

impl From<u16> for Addr {
    fn from(port: u16) -> Self {
        Addr::Port(port)
    }
}

impl From<&str> for Addr {
    fn from(addr: &str) -> Self {
        Addr::Multiaddr(addr.to_string())
    }
}

impl From<String> for Addr {
    fn from(addr: String) -> Self {
        Addr::Multiaddr(addr)
    }
}

fn peer_target(peer_id: &str) -> String {
    if peer_id.starts_with("/p2p/") {
        peer_id.to_string()
    } else {
        format!("/p2p/{peer_id}")
    }
}

/// Filter for [`StreamMount::close`]. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct CloseFilter {
    name: Option<String>,
    listen: Option<Addr>,
    target: Option<Addr>,
    match_all: bool,
    include_listeners: bool,
    include_senders: bool,
}

impl Default for CloseFilter {
    fn default() -> Self {
        Self {
            name: None,
            listen: None,
            target: None,
            match_all: false,
            include_listeners: true,
            include_senders: true,
        }
    }
}

impl CloseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match every entry, ignoring the field filters.
    pub fn all() -> Self {
        Self {
            match_all: true,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listen(mut self, addr: impl Into<Addr>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    pub fn target(mut self, addr: impl Into<Addr>) -> Self {
        self.target = Some(addr.into());
        self
    }

    pub fn match_all(mut self, on: bool) -> Self {
        self.match_all = on;
        self
    }

    pub fn include_listeners(mut self, on: bool) -> Self {
        self.include_listeners = on;
        self
    }

    pub fn include_senders(mut self, on: bool) -> Self {
        self.include_senders = on;
        self
    }

    fn to_args(&self) -> CloseArgs {
        CloseArgs {
            protocol: self.name.clone().unwrap_or_default(),
            listen_addr: self.listen.as_ref().map(Addr::to_string).unwrap_or_default(),
            target_addr: self.target.as_ref().map(Addr::to_string).unwrap_or_default(),
            match_all: self.match_all,
            listeners: self.include_listeners,
            forwarders: self.include_senders,
        }
    }
}

/// Stream-mount capability of a node session.
pub struct StreamMount {
    ctx: Arc<NodeContext>,
}

impl StreamMount {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Enabling is idempotent in the engine; a failure here is left for the following
    /// open call to report.
    fn enable(&self) -> Result<()> {
        let code = self.ctx.engine.p2p_enable(&self.ctx.repo)?;
        if code <= 0 {
            warn!(code, "could not enable p2p stream mounting");
        }
        Ok(())
    }

    /// Expose the local TCP service at `target` under protocol `name`.
    ///
    /// Returns `Ok(false)` when the engine refuses the mapping.
    pub fn open_listener(&self, name: &str, target: impl Into<Addr>) -> Result<bool> {
        self.ctx.require_online("open p2p listeners")?;
        self.enable()?;
        let target = target.into().to_string();
        let code = self.ctx.engine.p2p_listen(&self.ctx.repo, name, &target)?;
        debug!(protocol = name, target = %target, code, "p2p listen");
        Ok(code > 0)
    }

    /// Accept local TCP connections on `listen` and forward them to `peer_id` over `name`.
    ///
    /// Returns `Ok(false)` when the engine refuses the mapping.
    pub fn open_sender(&self, name: &str, listen: impl Into<Addr>, peer_id: &str) -> Result<bool> {
        self.ctx.require_online("open p2p senders")?;
        self.enable()?;
        let listen = listen.into().to_string();
        let code = self
            .ctx
            .engine
            .p2p_forward(&self.ctx.repo, name, &listen, peer_id)?;
        debug!(protocol = name, listen = %listen, peer = peer_id, code, "p2p forward");
        Ok(code > 0)
    }

    /// Close every mapping matching `filter`. Returns the number closed.
    pub fn close(&self, filter: &CloseFilter) -> Result<u32> {
        self.ctx.require_open()?;
        let args = filter.to_args();
        let code = self.ctx.engine.p2p_close(&self.ctx.repo, &args)?;
        let closed = check_status("P2PClose", code)?;
        debug!(?args, closed, "p2p close");
        Ok(closed as u32)
    }

    /// Close senders, optionally narrowed by protocol, local port/address and peer.
    pub fn close_sender(
        &self,
        name: Option<&str>,
        listen: Option<Addr>,
        peer_id: Option<&str>,
    ) -> Result<u32> {
        let mut filter = CloseFilter::new().include_listeners(false);
        if let Some(name) = name {
            filter = filter.name(name);
        }
        if let Some(listen) = listen {
            filter = filter.listen(listen);
        }
        if let Some(peer) = peer_id {
            filter = filter.target(peer_target(peer));
        }
        self.close(&filter)
    }

    /// Close listeners, optionally narrowed by protocol and target port/address.
    pub fn close_listener(&self, name: Option<&str>, target: Option<Addr>) -> Result<u32> {
        let mut filter = CloseFilter::new().include_senders(false);
        if let Some(name) = name {
            filter = filter.name(name);
        }
        if let Some(target) = target {
            filter = filter.target(target);
        }
        self.close(&filter)
    }

    pub fn close_all_listeners(&self) -> Result<u32> {
        self.close(&CloseFilter::all().include_senders(false))
    }

    pub fn close_all_senders(&self) -> Result<u32> {
        self.close(&CloseFilter::all().include_listeners(false))
    }

    pub fn close_all(&self) -> Result<u32> {
        self.close(&CloseFilter::all())
    }

    /// Snapshot of listeners, forwarders and active streams.
    pub fn list_connections(&self) -> Result<Connections> {
        self.ctx.require_open()?;
        let json = self.ctx.engine.p2p_list(&self.ctx.repo)?;
        Ok(json.map(|j| decode_listing(&j)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeOptions;
    use crate::gateway::Engine;
    use crate::mock::MockEngine;

    const PEER: &str = "12D3KooWRemote";

    struct Fixture {
        engine: Arc<MockEngine>,
        mount: StreamMount,
        _dir: tempfile::TempDir,
    }

    fn fixture(online: bool) -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().to_string_lossy().into_owned();
        engine.create_repo(&repo).unwrap();
        engine.run_node(&repo).unwrap();
        let ctx = Arc::new(NodeContext::new(
            engine.clone(),
            repo,
            online,
            false,
            &NodeOptions::default(),
        ));
        Fixture {
            engine,
            mount: StreamMount::new(ctx),
            _dir: dir,
        }
    }

    #[test]
    fn addr_formatting() {
        assert_eq!(Addr::from(9000u16).to_string(), "/ip4/127.0.0.1/tcp/9000");
        assert_eq!(
            Addr::from("/ip4/10.0.0.1/tcp/80").to_string(),
            "/ip4/10.0.0.1/tcp/80"
        );
    }

    #[test]
    fn listener_is_listed_once() {
        let f = fixture(true);
        assert!(f.mount.open_listener("echo", 9000u16).unwrap());
        let c = f.mount.list_connections().unwrap();
        assert_eq!(c.listeners.len(), 1);
        assert_eq!(c.listeners[0].service_name(), "echo");
        assert_eq!(c.listeners[0].target_address, "/ip4/127.0.0.1/tcp/9000");
        assert!(c.forwarders.is_empty());
        assert_eq!(f.engine.count_of("P2PEnable"), 1);
    }

    #[test]
    fn refused_open_returns_false() {
        let f = fixture(true);
        assert!(f.mount.open_listener("echo", 9000u16).unwrap());
        assert!(!f.mount.open_listener("echo", 9001u16).unwrap());
        assert!(f.mount.open_sender("web", 8080u16, PEER).unwrap());
        assert!(!f.mount.open_sender("web2", 8080u16, PEER).unwrap());
    }

    #[test]
    fn failed_enable_lets_open_fail() {
        let f = fixture(true);
        f.engine.fail("P2PEnable");
        assert!(!f.mount.open_listener("echo", 9000u16).unwrap());
        assert_eq!(f.engine.count_of("P2PListen"), 1);
    }

    #[test]
    fn second_close_returns_zero() {
        let f = fixture(true);
        f.mount.open_listener("echo", 9000u16).unwrap();
        let filter = CloseFilter::new().name("echo");
        assert_eq!(f.mount.close(&filter).unwrap(), 1);
        assert_eq!(f.mount.close(&filter).unwrap(), 0);
    }

    #[test]
    fn match_all_is_scoped_by_kind() {
        let f = fixture(true);
        f.mount.open_listener("a", 9000u16).unwrap();
        f.mount.open_listener("b", 9001u16).unwrap();
        f.mount.open_sender("c", 8080u16, PEER).unwrap();
        f.mount.open_sender("d", 8081u16, PEER).unwrap();
        f.mount.open_sender("e", 8082u16, PEER).unwrap();

        let senders = CloseFilter::all().include_listeners(false);
        assert_eq!(f.mount.close(&senders).unwrap(), 3);
        let c = f.mount.list_connections().unwrap();
        assert_eq!(c.listeners.len(), 2);
        assert!(c.forwarders.is_empty());

        assert_eq!(f.mount.close_all_listeners().unwrap(), 2);
        assert!(f.mount.list_connections().unwrap().is_empty());
    }

    #[test]
    fn field_filters_narrow_the_close() {
        let f = fixture(true);
        f.mount.open_sender("web", 8080u16, PEER).unwrap();
        f.mount.open_sender("web", 8081u16, "12D3KooWOther").unwrap();
        f.mount.open_listener("web", 9000u16).unwrap();

        assert_eq!(f.mount.close_sender(None, None, Some(PEER)).unwrap(), 1);
        assert_eq!(
            f.mount.close_sender(Some("web"), Some(Addr::Port(8081)), None).unwrap(),
            1
        );
        assert_eq!(f.mount.close_listener(Some("web"), Some(Addr::Port(9001))).unwrap(), 0);
        assert_eq!(f.mount.close_listener(Some("/x/web"), None).unwrap(), 1);
        assert_eq!(f.mount.close_all().unwrap(), 0);
    }

    #[test]
    fn close_all_counts_both_kinds() {
        let f = fixture(true);
        f.mount.open_listener("a", 9000u16).unwrap();
        f.mount.open_sender("b", 8080u16, PEER).unwrap();
        assert_eq!(f.mount.close_all_senders().unwrap(), 1);
        f.mount.open_sender("b", 8080u16, PEER).unwrap();
        assert_eq!(f.mount.close_all().unwrap(), 2);
    }

    #[test]
    fn offline_open_issues_no_engine_call() {
        let f = fixture(false);
        let before = f.engine.call_count();
        assert!(f.mount.open_listener("echo", 9000u16).unwrap_err().is_precondition());
        assert!(f
            .mount
            .open_sender("echo", 8080u16, PEER)
            .unwrap_err()
            .is_precondition());
        assert_eq!(f.engine.call_count(), before);
        assert!(f.mount.list_connections().unwrap().is_empty());
    }

    #[test]
    fn engine_close_failure_raises() {
        let f = fixture(true);
        let ctx = Arc::new(NodeContext::new(
            f.engine.clone(),
            "/nonexistent/repo".to_string(),
            true,
            false,
            &NodeOptions::default(),
        ));
        let mount = StreamMount::new(ctx);
        assert!(mount.close_all().is_err());
        assert!(mount.list_connections().unwrap().is_empty());
    }
}
