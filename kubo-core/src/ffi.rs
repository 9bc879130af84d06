//! C ABI of libkubo and the buffer discipline used to call it.
//!
//! Arguments: every string becomes a `CString` owned by the caller for the duration of
//! one call. Results: every returned `char*` is wrapped in an [`EngineString`] the moment
//! it crosses the boundary; the guard copies the bytes out and releases the buffer exactly
//! once, on drop. No other code in the crate touches engine pointers.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use crate::error::{Error, Result};

/// Release function for engine-allocated strings (`FreeString` in libkubo).
pub type ReleaseFn = unsafe extern "C" fn(*mut c_char);

/// Encode a string argument as a NUL-terminated buffer. Interior NUL bytes are rejected.
pub fn c_arg(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| {
        Error::Resource(format!(
            "argument contains NUL byte at position {}",
            e.nul_position()
        ))
    })
}

/// Owning guard over a string buffer returned by the engine.
///
/// Null means "no data". The buffer is released on drop, whether or not it was read.
pub struct EngineString {
    ptr: *mut c_char,
    release: ReleaseFn,
}

impl EngineString {
    /// # Safety
    /// `ptr` must be null or a NUL-terminated buffer allocated by the engine that nobody
    /// else will release, and `release` must be the engine's matching release function.
    pub unsafe fn from_raw(ptr: *mut c_char, release: ReleaseFn) -> Self {
        Self { ptr, release }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Copy the content into process memory and release the engine buffer.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn into_string(self) -> Option<String> {
        if self.ptr.is_null() {
            return None;
        }
        let s = unsafe { CStr::from_ptr(self.ptr) }
            .to_string_lossy()
            .into_owned();
        Some(s)
    }
}

impl Drop for EngineString {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.release)(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

#[cfg(feature = "libkubo")]
mod sys {
    use std::os::raw::{c_char, c_int, c_longlong, c_void};

    #[link(name = "kubo")]
    extern "C" {
        pub fn CreateRepo(repo_path: *const c_char) -> c_int;
        pub fn RunNode(repo_path: *const c_char) -> c_int;
        pub fn CleanupNode(repo_path: *const c_char) -> c_int;
        pub fn GetNodeID(repo_path: *const c_char) -> *mut c_char;

        pub fn AddFile(repo_path: *const c_char, file_path: *const c_char, only_hash: bool)
            -> *mut c_char;
        pub fn Download(repo_path: *const c_char, cid: *const c_char, dest: *const c_char)
            -> c_int;
        pub fn PinCID(repo_path: *const c_char, cid: *const c_char) -> c_int;
        pub fn UnpinCID(repo_path: *const c_char, cid: *const c_char) -> c_int;
        pub fn ListPins(repo_path: *const c_char) -> *mut c_char;

        pub fn ConnectToPeer(repo_path: *const c_char, peer_addr: *const c_char) -> c_int;
        pub fn ListPeers(repo_path: *const c_char) -> *mut c_char;
        pub fn FindPeer(repo_path: *const c_char, peer_id: *const c_char, timeout: c_int)
            -> *mut c_char;

        pub fn PubSubEnable(repo_path: *const c_char) -> c_int;
        pub fn PubSubSubscribe(repo_path: *const c_char, topic: *const c_char) -> c_longlong;
        pub fn PubSubNextMessage(sub_id: c_longlong) -> *mut c_char;
        pub fn PubSubUnsubscribe(sub_id: c_longlong) -> c_int;
        pub fn PubSubPublish(
            repo_path: *const c_char,
            topic: *const c_char,
            data: *const c_void,
            data_len: c_int,
        ) -> c_int;
        pub fn PubSubPeers(repo_path: *const c_char, topic: *const c_char) -> *mut c_char;
        pub fn PubSubListTopics(repo_path: *const c_char) -> *mut c_char;

        pub fn P2PEnable(repo_path: *const c_char) -> c_int;
        pub fn P2PForward(
            repo_path: *const c_char,
            proto: *const c_char,
            listen_addr: *const c_char,
            target_peer_id: *const c_char,
        ) -> c_int;
        pub fn P2PListen(
            repo_path: *const c_char,
            proto: *const c_char,
            target_addr: *const c_char,
        ) -> c_int;
        pub fn P2PClose(
            repo_path: *const c_char,
            proto: *const c_char,
            listen_addr: *const c_char,
            target_addr: *const c_char,
            all: bool,
            listeners: bool,
            forwarders: bool,
        ) -> c_int;
        pub fn P2PListListeners(repo_path: *const c_char) -> *mut c_char;

        pub fn FreeString(s: *mut c_char);
    }
}

#[cfg(feature = "libkubo")]
pub use linked::KuboLibrary;

#[cfg(feature = "libkubo")]
mod linked {
    use std::os::raw::{c_char, c_int, c_void};

    use tracing::debug;

    use super::{c_arg, sys, EngineString};
    use crate::error::{Error, Result};
    use crate::gateway::{CloseArgs, Engine};

    unsafe extern "C" fn release(ptr: *mut c_char) {
        sys::FreeString(ptr)
    }

    /// Take ownership of a returned buffer and copy it out.
    fn take(ptr: *mut c_char) -> Option<String> {
        unsafe { EngineString::from_raw(ptr, release) }.into_string()
    }

    /// The linked libkubo engine. Stateless; all node state lives in the engine.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct KuboLibrary;

    impl KuboLibrary {
        pub fn new() -> Self {
            KuboLibrary
        }
    }

    impl Engine for KuboLibrary {
        fn create_repo(&self, repo: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            Ok(unsafe { sys::CreateRepo(repo.as_ptr()) })
        }

        fn run_node(&self, repo: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            Ok(unsafe { sys::RunNode(repo.as_ptr()) })
        }

        fn cleanup_node(&self, repo: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            Ok(unsafe { sys::CleanupNode(repo.as_ptr()) })
        }

        fn node_id(&self, repo: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            Ok(take(unsafe { sys::GetNodeID(repo.as_ptr()) }))
        }

        fn add_file(&self, repo: &str, path: &str, only_hash: bool) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            let path = c_arg(path)?;
            Ok(take(unsafe {
                sys::AddFile(repo.as_ptr(), path.as_ptr(), only_hash)
            }))
        }

        fn download(&self, repo: &str, cid: &str, dest: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            let cid = c_arg(cid)?;
            let dest = c_arg(dest)?;
            Ok(unsafe { sys::Download(repo.as_ptr(), cid.as_ptr(), dest.as_ptr()) })
        }

        fn pin(&self, repo: &str, cid: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            let cid = c_arg(cid)?;
            Ok(unsafe { sys::PinCID(repo.as_ptr(), cid.as_ptr()) })
        }

        fn unpin(&self, repo: &str, cid: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            let cid = c_arg(cid)?;
            Ok(unsafe { sys::UnpinCID(repo.as_ptr(), cid.as_ptr()) })
        }

        fn list_pins(&self, repo: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            Ok(take(unsafe { sys::ListPins(repo.as_ptr()) }))
        }

        fn connect_to_peer(&self, repo: &str, addr: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            let addr = c_arg(addr)?;
            Ok(unsafe { sys::ConnectToPeer(repo.as_ptr(), addr.as_ptr()) })
        }

        fn list_peers(&self, repo: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            Ok(take(unsafe { sys::ListPeers(repo.as_ptr()) }))
        }

        fn find_peer(
            &self,
            repo: &str,
            peer_id: &str,
            timeout_secs: i32,
        ) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            let peer_id = c_arg(peer_id)?;
            Ok(take(unsafe {
                sys::FindPeer(repo.as_ptr(), peer_id.as_ptr(), timeout_secs as c_int)
            }))
        }

        fn pubsub_enable(&self, repo: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            Ok(unsafe { sys::PubSubEnable(repo.as_ptr()) })
        }

        fn pubsub_subscribe(&self, repo: &str, topic: &str) -> Result<i64> {
            let repo = c_arg(repo)?;
            let topic = c_arg(topic)?;
            Ok(unsafe { sys::PubSubSubscribe(repo.as_ptr(), topic.as_ptr()) })
        }

        fn pubsub_next_message(&self, sub_id: i64) -> Result<Option<String>> {
            Ok(take(unsafe { sys::PubSubNextMessage(sub_id) }))
        }

        fn pubsub_unsubscribe(&self, sub_id: i64) -> Result<i32> {
            Ok(unsafe { sys::PubSubUnsubscribe(sub_id) })
        }

        fn pubsub_publish(&self, repo: &str, topic: &str, data: &[u8]) -> Result<i32> {
            let len = c_int::try_from(data.len()).map_err(|_| {
                Error::Resource(format!("payload of {} bytes is too large", data.len()))
            })?;
            let repo = c_arg(repo)?;
            let topic = c_arg(topic)?;
            debug!(len, "PubSubPublish");
            Ok(unsafe {
                sys::PubSubPublish(
                    repo.as_ptr(),
                    topic.as_ptr(),
                    data.as_ptr() as *const c_void,
                    len,
                )
            })
        }

        fn pubsub_peers(&self, repo: &str, topic: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            let topic = c_arg(topic)?;
            Ok(take(unsafe { sys::PubSubPeers(repo.as_ptr(), topic.as_ptr()) }))
        }

        fn pubsub_list_topics(&self, repo: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            Ok(take(unsafe { sys::PubSubListTopics(repo.as_ptr()) }))
        }

        fn p2p_enable(&self, repo: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            Ok(unsafe { sys::P2PEnable(repo.as_ptr()) })
        }

        fn p2p_forward(
            &self,
            repo: &str,
            protocol: &str,
            listen_addr: &str,
            peer_id: &str,
        ) -> Result<i32> {
            let repo = c_arg(repo)?;
            let protocol = c_arg(protocol)?;
            let listen_addr = c_arg(listen_addr)?;
            let peer_id = c_arg(peer_id)?;
            Ok(unsafe {
                sys::P2PForward(
                    repo.as_ptr(),
                    protocol.as_ptr(),
                    listen_addr.as_ptr(),
                    peer_id.as_ptr(),
                )
            })
        }

        fn p2p_listen(&self, repo: &str, protocol: &str, target_addr: &str) -> Result<i32> {
            let repo = c_arg(repo)?;
            let protocol = c_arg(protocol)?;
            let target_addr = c_arg(target_addr)?;
            Ok(unsafe { sys::P2PListen(repo.as_ptr(), protocol.as_ptr(), target_addr.as_ptr()) })
        }

        fn p2p_close(&self, repo: &str, args: &CloseArgs) -> Result<i32> {
            let repo = c_arg(repo)?;
            let protocol = c_arg(&args.protocol)?;
            let listen_addr = c_arg(&args.listen_addr)?;
            let target_addr = c_arg(&args.target_addr)?;
            Ok(unsafe {
                sys::P2PClose(
                    repo.as_ptr(),
                    protocol.as_ptr(),
                    listen_addr.as_ptr(),
                    target_addr.as_ptr(),
                    args.match_all,
                    args.listeners,
                    args.forwarders,
                )
            })
        }

        fn p2p_list(&self, repo: &str) -> Result<Option<String>> {
            let repo = c_arg(repo)?;
            Ok(take(unsafe { sys::P2PListListeners(repo.as_ptr()) }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASED: AtomicUsize = AtomicUsize::new(0);
    static NULL_RELEASED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_release(ptr: *mut c_char) {
        RELEASED.fetch_add(1, Ordering::SeqCst);
        drop(CString::from_raw(ptr));
    }

    unsafe extern "C" fn null_release(_ptr: *mut c_char) {
        NULL_RELEASED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn engine_string_copies_then_releases_once() {
        let before = RELEASED.load(Ordering::SeqCst);
        let raw = CString::new("QmHash").unwrap().into_raw();
        let s = unsafe { EngineString::from_raw(raw, counting_release) };
        assert!(!s.is_null());
        assert_eq!(s.into_string().as_deref(), Some("QmHash"));
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);

        // Unread buffers are released too.
        let raw = CString::new("unused").unwrap().into_raw();
        drop(unsafe { EngineString::from_raw(raw, counting_release) });
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn null_is_no_data_and_not_released() {
        let s = unsafe { EngineString::from_raw(std::ptr::null_mut(), null_release) };
        assert!(s.is_null());
        assert_eq!(s.into_string(), None);
        assert_eq!(NULL_RELEASED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interior_nul_rejected() {
        assert!(c_arg("topic").is_ok());
        assert!(matches!(c_arg("to\0pic"), Err(Error::Resource(_))));
    }
}
