//! Foreign call gateway: the safe seam over the engine's exported function table.
//!
//! Every method mirrors one engine export. Strings cross as borrowed `&str` and are
//! encoded by the implementation for the duration of the call only; returned buffers
//! are copied into owned `String`s and released before the method returns, so callers
//! never see engine memory.

use crate::error::{Error, Result};

/// Arguments of the engine's compound close primitive (`P2PClose`).
///
/// Empty strings mean "match everything" for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseArgs {
    pub protocol: String,
    pub listen_addr: String,
    pub target_addr: String,
    pub match_all: bool,
    pub listeners: bool,
    pub forwarders: bool,
}

/// The engine's exported operations.
///
/// Integer results keep the engine's sentinel conventions; interpretation lives in the
/// subsystems (see [`check_status`], [`check_zero`], [`check_positive`]). `Err` is only
/// returned when the call could not be issued at all (e.g. an argument with an interior NUL).
pub trait Engine: Send + Sync {
    // Repository lifecycle.
    fn create_repo(&self, repo: &str) -> Result<i32>;
    fn run_node(&self, repo: &str) -> Result<i32>;
    fn cleanup_node(&self, repo: &str) -> Result<i32>;
    fn node_id(&self, repo: &str) -> Result<Option<String>>;

    // Content.
    fn add_file(&self, repo: &str, path: &str, only_hash: bool) -> Result<Option<String>>;
    fn download(&self, repo: &str, cid: &str, dest: &str) -> Result<i32>;
    fn pin(&self, repo: &str, cid: &str) -> Result<i32>;
    fn unpin(&self, repo: &str, cid: &str) -> Result<i32>;
    fn list_pins(&self, repo: &str) -> Result<Option<String>>;

    // Peering.
    fn connect_to_peer(&self, repo: &str, addr: &str) -> Result<i32>;
    fn list_peers(&self, repo: &str) -> Result<Option<String>>;
    fn find_peer(&self, repo: &str, peer_id: &str, timeout_secs: i32) -> Result<Option<String>>;

    // PubSub.
    fn pubsub_enable(&self, repo: &str) -> Result<i32>;
    fn pubsub_subscribe(&self, repo: &str, topic: &str) -> Result<i64>;
    fn pubsub_next_message(&self, sub_id: i64) -> Result<Option<String>>;
    fn pubsub_unsubscribe(&self, sub_id: i64) -> Result<i32>;
    fn pubsub_publish(&self, repo: &str, topic: &str, data: &[u8]) -> Result<i32>;
    fn pubsub_peers(&self, repo: &str, topic: &str) -> Result<Option<String>>;
    fn pubsub_list_topics(&self, repo: &str) -> Result<Option<String>>;

    // Stream mounting.
    fn p2p_enable(&self, repo: &str) -> Result<i32>;
    fn p2p_forward(&self, repo: &str, protocol: &str, listen_addr: &str, peer_id: &str)
        -> Result<i32>;
    fn p2p_listen(&self, repo: &str, protocol: &str, target_addr: &str) -> Result<i32>;
    fn p2p_close(&self, repo: &str, args: &CloseArgs) -> Result<i32>;
    fn p2p_list(&self, repo: &str) -> Result<Option<String>>;
}

/// Negative = failure. Returns the non-negative value on success.
pub fn check_status<T>(op: &'static str, code: T) -> Result<T>
where
    T: Copy + Into<i64>,
{
    let c: i64 = code.into();
    if c < 0 {
        return Err(Error::Engine { op, code: c });
    }
    Ok(code)
}

/// Zero = success; anything else is a failure.
pub fn check_zero(op: &'static str, code: i32) -> Result<()> {
    if code != 0 {
        return Err(Error::Engine {
            op,
            code: code as i64,
        });
    }
    Ok(())
}

/// Positive = success (stream mounting convention).
pub fn check_positive(op: &'static str, code: i32) -> Result<i32> {
    if code <= 0 {
        return Err(Error::Engine {
            op,
            code: code as i64,
        });
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_conventions() {
        assert_eq!(check_status("op", 3i32).unwrap(), 3);
        assert_eq!(check_status("op", 0i64).unwrap(), 0);
        assert!(matches!(
            check_status("subscribe", -2i64),
            Err(Error::Engine { op: "subscribe", code: -2 })
        ));
        assert!(check_zero("op", 0).is_ok());
        assert!(check_zero("op", 1).is_err());
        assert!(check_positive("op", 1).is_ok());
        assert!(check_positive("op", 0).is_err());
        assert!(check_positive("op", -3).is_err());
    }
}
