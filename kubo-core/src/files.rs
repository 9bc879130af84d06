//! Content operations on the session's repository: add, fetch and pin.
//!
//! These only touch the local repository, so they are available offline.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::gateway::check_zero;
use crate::wire::decode_string_list;

pub struct Files {
    ctx: Arc<NodeContext>,
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Resource(format!("path is not valid UTF-8: {}", path.display())))
}

impl Files {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    fn add_path(&self, path: &Path, only_hash: bool) -> Result<String> {
        self.ctx.require_open()?;
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let cid = self
            .ctx
            .engine
            .add_file(&self.ctx.repo, path_str(path)?, only_hash)?
            .filter(|c| !c.is_empty())
            .ok_or(Error::NoData { op: "AddFile" })?;
        debug!(path = %path.display(), %cid, only_hash, "added");
        Ok(cid)
    }

    /// Add a file (or directory) and return its content identifier.
    pub fn add_file(&self, path: impl AsRef<Path>) -> Result<String> {
        self.add_path(path.as_ref(), false)
    }

    pub fn add_directory(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::NotFound(format!("not a directory: {}", path.display())));
        }
        self.add_path(path, false)
    }

    /// Content identifier `path` would get, without storing or pinning it.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> Result<String> {
        self.add_path(path.as_ref(), true)
    }

    /// Add raw bytes through a scratch file. `suffix` becomes the scratch file's extension-like
    /// suffix, which some content importers use for type detection.
    pub fn add_bytes(&self, data: &[u8], suffix: Option<&str>) -> Result<String> {
        self.ctx.require_open()?;
        let mut file = tempfile::Builder::new()
            .prefix("kubo-add-")
            .suffix(suffix.unwrap_or(""))
            .tempfile()?;
        file.write_all(data)?;
        file.flush()?;
        self.add_path(file.path(), false)
    }

    pub fn add_str(&self, text: &str, suffix: Option<&str>) -> Result<String> {
        self.add_bytes(text.as_bytes(), suffix)
    }

    /// Fetch `cid` into `dest`.
    pub fn get_file(&self, cid: &str, dest: impl AsRef<Path>) -> Result<()> {
        self.ctx.require_open()?;
        let dest = dest.as_ref();
        let code = self
            .ctx
            .engine
            .download(&self.ctx.repo, cid, path_str(dest)?)?;
        check_zero("Download", code)?;
        debug!(%cid, dest = %dest.display(), "fetched");
        Ok(())
    }

    pub fn get_bytes(&self, cid: &str) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()?;
        let dest = scratch.path().join("content");
        self.get_file(cid, &dest)?;
        Ok(std::fs::read(&dest)?)
    }

    /// Fetch `cid` as text. Invalid UTF-8 is replaced.
    pub fn get_str(&self, cid: &str) -> Result<String> {
        let bytes = self.get_bytes(cid)?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    pub fn pin(&self, cid: &str) -> Result<()> {
        self.ctx.require_open()?;
        check_zero("PinCID", self.ctx.engine.pin(&self.ctx.repo, cid)?)
    }

    pub fn unpin(&self, cid: &str) -> Result<()> {
        self.ctx.require_open()?;
        check_zero("UnpinCID", self.ctx.engine.unpin(&self.ctx.repo, cid)?)
    }

    /// Pinned content identifiers. Degrades to empty.
    pub fn list_pins(&self) -> Result<Vec<String>> {
        self.ctx.require_open()?;
        let json = self.ctx.engine.list_pins(&self.ctx.repo)?;
        Ok(json.map(|j| decode_string_list(&j)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeOptions;
    use crate::gateway::Engine;
    use crate::mock::MockEngine;

    struct Fixture {
        engine: Arc<MockEngine>,
        files: Files,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        let repo = repo.to_string_lossy().into_owned();
        engine.create_repo(&repo).unwrap();
        engine.run_node(&repo).unwrap();
        // Content operations are local; an offline session is enough.
        let ctx = Arc::new(NodeContext::new(
            engine.clone(),
            repo,
            false,
            false,
            &NodeOptions::default(),
        ));
        Fixture {
            engine,
            files: Files::new(ctx),
            dir,
        }
    }

    #[test]
    fn add_and_fetch_roundtrip() {
        let f = fixture();
        let cid = f.files.add_str("hello kubo", Some(".txt")).unwrap();
        assert_eq!(f.files.get_str(&cid).unwrap(), "hello kubo");

        let dest = f.dir.path().join("out.bin");
        f.files.get_file(&cid, &dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"hello kubo");
    }

    #[test]
    fn hash_only_does_not_store() {
        let f = fixture();
        let path = f.dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        let hashed = f.files.hash_file(&path).unwrap();
        assert!(f.files.get_bytes(&hashed).is_err());
        assert!(f.files.list_pins().unwrap().is_empty());

        let added = f.files.add_file(&path).unwrap();
        assert_eq!(hashed, added);
        assert_eq!(f.files.list_pins().unwrap(), vec![added]);
    }

    #[test]
    fn missing_paths_fail_before_engine() {
        let f = fixture();
        let before = f.engine.call_count();
        let missing = f.dir.path().join("nope");
        assert!(matches!(f.files.add_file(&missing), Err(Error::NotFound(_))));
        assert!(matches!(f.files.hash_file(&missing), Err(Error::NotFound(_))));

        let file = f.dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(f.files.add_directory(&file), Err(Error::NotFound(_))));
        assert_eq!(f.engine.call_count(), before);
    }

    #[test]
    fn add_directory() {
        let f = fixture();
        let d = f.dir.path().join("site");
        std::fs::create_dir(&d).unwrap();
        std::fs::write(d.join("index.html"), b"<h1>hi</h1>").unwrap();
        let cid = f.files.add_directory(&d).unwrap();
        assert!(cid.starts_with("Qm"));
    }

    #[test]
    fn pin_lifecycle() {
        let f = fixture();
        let cid = f.files.add_bytes(&[1, 2, 3], None).unwrap();
        f.files.unpin(&cid).unwrap();
        assert!(f.files.list_pins().unwrap().is_empty());
        assert!(f.files.unpin(&cid).is_err());
        f.files.pin(&cid).unwrap();
        assert_eq!(f.files.list_pins().unwrap(), vec![cid]);
        assert!(f.files.pin("QmUnknown").is_err());
    }

    #[test]
    fn engine_failures_raise() {
        let f = fixture();
        assert!(matches!(
            f.files.get_file("QmUnknown", f.dir.path().join("x")),
            Err(Error::Engine { op: "Download", .. })
        ));
        f.engine.fail("AddFile");
        assert!(matches!(
            f.files.add_str("x", None),
            Err(Error::NoData { op: "AddFile" })
        ));
    }

    #[test]
    fn lossy_text() {
        let f = fixture();
        let cid = f.files.add_bytes(&[b'o', b'k', 0xff], None).unwrap();
        assert_eq!(f.files.get_str(&cid).unwrap(), "ok\u{fffd}");
    }
}
