//! In-memory engine for tests.
//!
//! Simulates what the session layer can observe of libkubo: repositories and running
//! nodes, a content store with pins, peer connections, per-subscription message queues
//! fed by publishes on connected repositories, and the stream-mount tables with the
//! engine's compound close filter. Every call is recorded.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::Result;
use crate::gateway::{CloseArgs, Engine};
use crate::wire::PROTOCOL_PREFIX;

#[derive(Debug, Clone)]
struct Entry {
    protocol: String,
    listen: String,
    target: String,
}

#[derive(Debug, Default)]
struct Repo {
    node_id: String,
    running: bool,
    pubsub: bool,
    p2p: bool,
    connected: HashSet<String>,
    listens: Vec<Entry>,
    forwards: Vec<Entry>,
    pins: Vec<String>,
}

struct Sub {
    repo: String,
    topic: String,
    queue: VecDeque<String>,
}

#[derive(Default)]
struct State {
    repos: HashMap<String, Repo>,
    blocks: HashMap<String, Vec<u8>>,
    subs: HashMap<i64, Sub>,
    next_sub: i64,
    seqno: u64,
    failing: HashSet<&'static str>,
    calls: Vec<&'static str>,
}

/// Shared in-memory engine. One instance can host several repositories, which lets
/// sessions connect to and publish to each other.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<State>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call of `op` (engine export name) report failure.
    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn count_of(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Queue a raw envelope on a subscription, bypassing publish.
    pub fn inject_raw(&self, sub_id: i64, json: &str) {
        if let Some(sub) = self.state.lock().subs.get_mut(&sub_id) {
            sub.queue.push_back(json.to_string());
        }
    }

    pub fn is_running(&self, repo: &str) -> bool {
        self.state
            .lock()
            .repos
            .get(repo)
            .map(|r| r.running)
            .unwrap_or(false)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subs.len()
    }

    /// Record the call and lock the state for it.
    fn enter(&self, op: &'static str) -> parking_lot::MutexGuard<'_, State> {
        let mut st = self.state.lock();
        st.calls.push(op);
        st
    }
}

fn failing(st: &State, op: &'static str) -> bool {
    st.failing.contains(op)
}

fn content_id(bytes: &[u8]) -> String {
    let mut h = DefaultHasher::new();
    bytes.hash(&mut h);
    format!("Qm{:016x}", h.finish())
}

fn normalize_protocol(p: &str) -> String {
    if p.starts_with(PROTOCOL_PREFIX) {
        p.to_string()
    } else {
        format!("{PROTOCOL_PREFIX}{p}")
    }
}

fn collect_dir(path: &Path, out: &mut Vec<u8>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for e in entries {
        out.extend_from_slice(e.file_name().to_string_lossy().as_bytes());
        let p = e.path();
        if p.is_dir() {
            collect_dir(&p, out)?;
        } else {
            out.extend_from_slice(&std::fs::read(&p)?);
        }
    }
    Ok(())
}

impl Engine for MockEngine {
    fn create_repo(&self, repo: &str) -> Result<i32> {
        let mut st = self.enter("CreateRepo");
        if failing(&st, "CreateRepo") {
            return Ok(-1);
        }
        let config = Path::new(repo).join("config");
        if config.exists() {
            return Ok(0);
        }
        std::fs::create_dir_all(repo)?;
        std::fs::write(config, b"{}")?;
        let n = st.repos.len();
        st.repos.entry(repo.to_string()).or_insert_with(|| Repo {
            node_id: format!("12D3KooWMock{n}"),
            ..Repo::default()
        });
        Ok(1)
    }

    fn run_node(&self, repo: &str) -> Result<i32> {
        let mut st = self.enter("RunNode");
        if failing(&st, "RunNode") {
            return Ok(0);
        }
        if !Path::new(repo).join("config").exists() {
            return Ok(0);
        }
        let n = st.repos.len();
        let r = st.repos.entry(repo.to_string()).or_insert_with(|| Repo {
            node_id: format!("12D3KooWMock{n}"),
            ..Repo::default()
        });
        r.running = true;
        Ok(1)
    }

    fn cleanup_node(&self, repo: &str) -> Result<i32> {
        let mut st = self.enter("CleanupNode");
        if failing(&st, "CleanupNode") {
            return Ok(-1);
        }
        let Some(r) = st.repos.get_mut(repo) else {
            return Ok(-1);
        };
        if !r.running {
            return Ok(-1);
        }
        r.running = false;
        r.listens.clear();
        r.forwards.clear();
        st.subs.retain(|_, s| s.repo != repo);
        Ok(0)
    }

    fn node_id(&self, repo: &str) -> Result<Option<String>> {
        let st = self.enter("GetNodeID");
        Ok(Some(
            st.repos
                .get(repo)
                .filter(|r| r.running)
                .map(|r| r.node_id.clone())
                .unwrap_or_default(),
        ))
    }

    fn add_file(&self, repo: &str, path: &str, only_hash: bool) -> Result<Option<String>> {
        let mut st = self.enter("AddFile");
        if failing(&st, "AddFile") || !st.repos.contains_key(repo) {
            return Ok(None);
        }
        let p = Path::new(path);
        let mut bytes = Vec::new();
        if p.is_dir() {
            collect_dir(p, &mut bytes)?;
        } else {
            match std::fs::read(p) {
                Ok(b) => bytes = b,
                Err(_) => return Ok(None),
            }
        }
        let cid = content_id(&bytes);
        if !only_hash {
            st.blocks.insert(cid.clone(), bytes);
            if let Some(r) = st.repos.get_mut(repo) {
                if !r.pins.contains(&cid) {
                    r.pins.push(cid.clone());
                }
            }
        }
        Ok(Some(cid))
    }

    fn download(&self, _repo: &str, cid: &str, dest: &str) -> Result<i32> {
        let st = self.enter("Download");
        match st.blocks.get(cid) {
            Some(bytes) if !failing(&st, "Download") => {
                std::fs::write(dest, bytes)?;
                Ok(0)
            }
            _ => Ok(-1),
        }
    }

    fn pin(&self, repo: &str, cid: &str) -> Result<i32> {
        let mut st = self.enter("PinCID");
        if !st.blocks.contains_key(cid) {
            return Ok(-1);
        }
        match st.repos.get_mut(repo) {
            Some(r) => {
                if !r.pins.iter().any(|p| p == cid) {
                    r.pins.push(cid.to_string());
                }
                Ok(0)
            }
            None => Ok(-1),
        }
    }

    fn unpin(&self, repo: &str, cid: &str) -> Result<i32> {
        let mut st = self.enter("UnpinCID");
        let Some(r) = st.repos.get_mut(repo) else {
            return Ok(-1);
        };
        let before = r.pins.len();
        r.pins.retain(|p| p != cid);
        Ok(if r.pins.len() < before { 0 } else { -1 })
    }

    fn list_pins(&self, repo: &str) -> Result<Option<String>> {
        let st = self.enter("ListPins");
        Ok(st
            .repos
            .get(repo)
            .map(|r| json!(r.pins).to_string()))
    }

    fn connect_to_peer(&self, repo: &str, addr: &str) -> Result<i32> {
        let mut st = self.enter("ConnectToPeer");
        let peer_id = addr.rsplit("/p2p/").next().unwrap_or(addr).to_string();
        let Some(other) = st
            .repos
            .iter()
            .find(|(_, r)| r.running && r.node_id == peer_id)
            .map(|(path, _)| path.clone())
        else {
            return Ok(-1);
        };
        let Some(own_id) = st.repos.get(repo).map(|r| r.node_id.clone()) else {
            return Ok(-1);
        };
        if let Some(r) = st.repos.get_mut(repo) {
            r.connected.insert(peer_id);
        }
        if let Some(r) = st.repos.get_mut(&other) {
            r.connected.insert(own_id);
        }
        Ok(0)
    }

    fn list_peers(&self, repo: &str) -> Result<Option<String>> {
        let st = self.enter("ListPeers");
        let mut peers: Vec<String> = st
            .repos
            .get(repo)
            .map(|r| {
                r.connected
                    .iter()
                    .map(|id| format!("/ip4/127.0.0.1/tcp/4001/{id}"))
                    .collect()
            })
            .unwrap_or_default();
        peers.sort();
        Ok(Some(json!(peers).to_string()))
    }

    fn find_peer(&self, _repo: &str, peer_id: &str, _timeout_secs: i32) -> Result<Option<String>> {
        let st = self.enter("FindPeer");
        let known = st.repos.values().any(|r| r.running && r.node_id == peer_id);
        let addrs: Vec<&str> = if known {
            vec!["/ip4/127.0.0.1/tcp/4001"]
        } else {
            vec![]
        };
        Ok(Some(json!(addrs).to_string()))
    }

    fn pubsub_enable(&self, repo: &str) -> Result<i32> {
        let mut st = self.enter("PubSubEnable");
        if failing(&st, "PubSubEnable") {
            return Ok(-1);
        }
        match st.repos.get_mut(repo) {
            Some(r) => {
                r.pubsub = true;
                Ok(0)
            }
            None => Ok(-1),
        }
    }

    fn pubsub_subscribe(&self, repo: &str, topic: &str) -> Result<i64> {
        let mut st = self.enter("PubSubSubscribe");
        if failing(&st, "PubSubSubscribe") {
            return Ok(-2);
        }
        if !st.repos.get(repo).map(|r| r.running && r.pubsub).unwrap_or(false) {
            return Ok(-1);
        }
        st.next_sub += 1;
        let id = st.next_sub;
        st.subs.insert(
            id,
            Sub {
                repo: repo.to_string(),
                topic: topic.to_string(),
                queue: VecDeque::new(),
            },
        );
        Ok(id)
    }

    fn pubsub_next_message(&self, sub_id: i64) -> Result<Option<String>> {
        let mut st = self.enter("PubSubNextMessage");
        Ok(st.subs.get_mut(&sub_id).and_then(|s| s.queue.pop_front()))
    }

    fn pubsub_unsubscribe(&self, sub_id: i64) -> Result<i32> {
        let mut st = self.enter("PubSubUnsubscribe");
        if failing(&st, "PubSubUnsubscribe") {
            return Ok(-1);
        }
        Ok(if st.subs.remove(&sub_id).is_some() { 0 } else { -1 })
    }

    fn pubsub_publish(&self, repo: &str, topic: &str, data: &[u8]) -> Result<i32> {
        let mut st = self.enter("PubSubPublish");
        if failing(&st, "PubSubPublish") {
            return Ok(-2);
        }
        let Some(sender) = st.repos.get(repo).filter(|r| r.running && r.pubsub) else {
            return Ok(-1);
        };
        let from = sender.node_id.clone();
        let mut reach: HashSet<String> = HashSet::new();
        reach.insert(repo.to_string());
        for (path, r) in &st.repos {
            if r.connected.contains(&from) {
                reach.insert(path.clone());
            }
        }
        st.seqno += 1;
        let envelope = json!({
            "from": from,
            "data": STANDARD.encode(data),
            "seqno": STANDARD.encode(st.seqno.to_be_bytes()),
            "topicID": topic,
        })
        .to_string();
        let mut ids: Vec<i64> = st
            .subs
            .iter()
            .filter(|(_, s)| s.topic == topic && reach.contains(&s.repo))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for id in ids {
            if let Some(s) = st.subs.get_mut(&id) {
                s.queue.push_back(envelope.clone());
            }
        }
        Ok(0)
    }

    fn pubsub_peers(&self, repo: &str, topic: &str) -> Result<Option<String>> {
        let st = self.enter("PubSubPeers");
        let Some(r) = st.repos.get(repo) else {
            return Ok(Some("[]".to_string()));
        };
        let mut peers: Vec<String> = st
            .repos
            .iter()
            .filter(|(_, o)| r.connected.contains(&o.node_id))
            .filter(|(path, _)| {
                st.subs
                    .values()
                    .any(|s| &s.repo == *path && (topic.is_empty() || s.topic == topic))
            })
            .map(|(_, o)| o.node_id.clone())
            .collect();
        peers.sort();
        Ok(Some(json!(peers).to_string()))
    }

    fn pubsub_list_topics(&self, repo: &str) -> Result<Option<String>> {
        let st = self.enter("PubSubListTopics");
        let mut topics: Vec<&str> = st
            .subs
            .values()
            .filter(|s| s.repo == repo)
            .map(|s| s.topic.as_str())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(Some(json!(topics).to_string()))
    }

    fn p2p_enable(&self, repo: &str) -> Result<i32> {
        let mut st = self.enter("P2PEnable");
        if failing(&st, "P2PEnable") {
            return Ok(-1);
        }
        match st.repos.get_mut(repo).filter(|r| r.running) {
            Some(r) => {
                r.p2p = true;
                Ok(1)
            }
            None => Ok(-1),
        }
    }

    fn p2p_forward(
        &self,
        repo: &str,
        protocol: &str,
        listen_addr: &str,
        peer_id: &str,
    ) -> Result<i32> {
        let mut st = self.enter("P2PForward");
        let Some(r) = st.repos.get_mut(repo).filter(|r| r.running && r.p2p) else {
            return Ok(-1);
        };
        if r.forwards.iter().any(|f| f.listen == listen_addr) {
            return Ok(-2);
        }
        let target = if peer_id.starts_with("/p2p/") {
            peer_id.to_string()
        } else {
            format!("/p2p/{peer_id}")
        };
        r.forwards.push(Entry {
            protocol: normalize_protocol(protocol),
            listen: listen_addr.to_string(),
            target,
        });
        Ok(1)
    }

    fn p2p_listen(&self, repo: &str, protocol: &str, target_addr: &str) -> Result<i32> {
        let mut st = self.enter("P2PListen");
        let Some(r) = st.repos.get_mut(repo).filter(|r| r.running && r.p2p) else {
            return Ok(-1);
        };
        let protocol = normalize_protocol(protocol);
        if r.listens.iter().any(|l| l.protocol == protocol) {
            return Ok(-2);
        }
        let listen = format!("/p2p/{}", r.node_id);
        r.listens.push(Entry {
            protocol,
            listen,
            target: target_addr.to_string(),
        });
        Ok(1)
    }

    fn p2p_close(&self, repo: &str, args: &CloseArgs) -> Result<i32> {
        let mut st = self.enter("P2PClose");
        let Some(r) = st.repos.get_mut(repo) else {
            return Ok(-1);
        };
        let protocol = if args.protocol.is_empty() {
            String::new()
        } else {
            normalize_protocol(&args.protocol)
        };
        let matches = |e: &Entry| {
            if args.match_all {
                return true;
            }
            (protocol.is_empty() || e.protocol == protocol)
                && (args.listen_addr.is_empty() || e.listen == args.listen_addr)
                && (args.target_addr.is_empty() || e.target == args.target_addr)
        };
        let mut count = 0;
        if args.listeners {
            let before = r.listens.len();
            r.listens.retain(|e| !matches(e));
            count += before - r.listens.len();
        }
        if args.forwarders {
            let before = r.forwards.len();
            r.forwards.retain(|e| !matches(e));
            count += before - r.forwards.len();
        }
        Ok(count as i32)
    }

    fn p2p_list(&self, repo: &str) -> Result<Option<String>> {
        let st = self.enter("P2PListListeners");
        let Some(r) = st.repos.get(repo) else {
            return Ok(Some(String::new()));
        };
        let mapping = |e: &Entry| {
            json!({
                "Protocol": e.protocol,
                "ListenAddress": e.listen,
                "TargetAddress": e.target,
            })
        };
        let listing = json!({
            "Listens": r.listens.iter().map(mapping).collect::<Vec<_>>(),
            "Forwards": r.forwards.iter().map(mapping).collect::<Vec<_>>(),
            "Streams": [],
        });
        Ok(Some(listing.to_string()))
    }
}
