//! File transfer engine
//!
//! Uploads copy [`LocalFs`] → remote, downloads copy remote → [`LocalFs`]; both
//! go through [`copy_path`], which handles single files and directory trees.
//!
//! The copy runs on a blocking worker while the caller waits on the deadline.
//! When the deadline passes the shared [`CancelFlag`] is raised and the caller
//! returns a `Timeout` error right away; the worker notices the flag at its
//! next filesystem call or between chunks and stops. A chunk already handed to
//! the remote side is not rolled back.

pub mod fs;

use crate::config::OverwritePolicy;
use crate::error::{ErrorKind, GossError, Result};
use crate::retry::{run_with_retry, RetryConfig};
use crate::transport::Connection;
use fs::{CancelFlag, FileSystem, LocalFs};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn operation(&self) -> &'static str {
        match self {
            Direction::Upload => "file_upload",
            Direction::Download => "file_download",
        }
    }
}

/// One transfer between the local machine and a connected host
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local: String,
    pub remote: String,
    pub policy: OverwritePolicy,
}

impl TransferRequest {
    fn source_and_destination(&self) -> (&str, &str) {
        match self.direction {
            Direction::Upload => (&self.local, &self.remote),
            Direction::Download => (&self.remote, &self.local),
        }
    }

    fn target(&self) -> String {
        let (src, dst) = self.source_and_destination();
        format!("{} -> {}", src, dst)
    }
}

/// Mode for a created parent directory: source bits, execute wherever read is
/// set, and always owner rwx so the copy can proceed.
fn dir_mode(file_mode: u32) -> u32 {
    let mode = file_mode & 0o777;
    mode | ((mode & 0o444) >> 2) | 0o700
}

/// scp-like destination: existing directories and trailing `/` receive the
/// source's base name.
fn resolve_destination(dst_fs: &dyn FileSystem, src: &Path, dst: &str) -> io::Result<PathBuf> {
    let dst_path = PathBuf::from(dst);
    let into_dir = dst.ends_with('/') || matches!(dst_fs.stat(&dst_path), Ok(meta) if meta.is_dir);
    if !into_dir {
        return Ok(dst_path);
    }
    let name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("source '{}' has no file name", src.display()),
        )
    })?;
    Ok(dst_path.join(name))
}

fn copy_file(
    src_fs: &dyn FileSystem,
    dst_fs: &dyn FileSystem,
    src: &Path,
    dst: &Path,
    mode: u32,
    policy: OverwritePolicy,
    cancel: &CancelFlag,
) -> io::Result<u64> {
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        dst_fs.mkdir_all(parent, dir_mode(mode))?;
    }

    let mut reader = src_fs.open_reader(src)?;
    let mut writer = dst_fs.open_writer(dst, policy, mode & 0o777)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && !cancel.is_cancelled() => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        written += n as u64;
    }
    writer.flush()?;
    Ok(written)
}

/// Copy a file or directory tree from `src_fs` to `dst_fs`
///
/// Returns the number of bytes written.
pub fn copy_path(
    src_fs: &dyn FileSystem,
    dst_fs: &dyn FileSystem,
    src: &Path,
    dst: &str,
    policy: OverwritePolicy,
    cancel: &CancelFlag,
) -> io::Result<u64> {
    let src_meta = src_fs.stat(src)?;
    let dst_root = resolve_destination(dst_fs, src, dst)?;

    if !src_meta.is_dir {
        return copy_file(src_fs, dst_fs, src, &dst_root, src_meta.mode, policy, cancel);
    }

    dst_fs.mkdir_all(&dst_root, src_meta.mode | 0o700)?;
    let mut total = 0u64;
    for entry in src_fs.walk(src)? {
        let target = dst_root.join(&entry.relative);
        if entry.meta.is_dir {
            dst_fs.mkdir_all(&target, entry.meta.mode | 0o700)?;
        } else {
            total += copy_file(src_fs, dst_fs, &entry.path, &target, entry.meta.mode, policy, cancel)?;
        }
    }
    Ok(total)
}

fn map_copy_error(req: &TransferRequest, err: io::Error, cancel: &CancelFlag) -> GossError {
    let operation = req.direction.operation();
    let target = req.target();
    match err.kind() {
        io::ErrorKind::Interrupted if cancel.is_cancelled() => GossError::timeout(operation, target),
        io::ErrorKind::PermissionDenied => {
            GossError::permission(operation, target, "permission denied").with_source(err)
        }
        io::ErrorKind::AlreadyExists => {
            GossError::new(ErrorKind::Validation, operation, target, "destination already exists")
                .with_detail("overwrite_policy", req.policy.to_string())
                .with_source(err)
        }
        _ => GossError::resource(operation, target, "copy failed").with_source(err),
    }
}

/// Run one transfer attempt bounded by `timeout`
pub async fn transfer_once(conn: &dyn Connection, req: &TransferRequest, timeout: Duration) -> Result<u64> {
    let cancel = CancelFlag::new();
    let remote = conn.remote_fs(cancel.clone()).await?;
    let local: Box<dyn FileSystem> = Box::new(LocalFs::new(cancel.clone()));

    let (src_fs, dst_fs) = match req.direction {
        Direction::Upload => (local, remote),
        Direction::Download => (remote, local),
    };
    let (src, dst) = req.source_and_destination();
    let (src, dst) = (PathBuf::from(src), dst.to_string());
    let policy = req.policy;
    let worker_cancel = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || {
        copy_path(src_fs.as_ref(), dst_fs.as_ref(), &src, &dst, policy, &worker_cancel)
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(bytes))) => {
            debug!("{} wrote {} bytes", req.target(), bytes);
            Ok(bytes)
        }
        Ok(Ok(Err(e))) => Err(map_copy_error(req, e, &cancel)),
        Ok(Err(join_err)) => Err(GossError::execution(
            req.direction.operation(),
            req.target(),
            "transfer worker failed",
        )
        .with_source(join_err)),
        Err(_) => {
            cancel.cancel();
            Err(GossError::timeout(req.direction.operation(), req.target())
                .with_detail("timeout_secs", timeout.as_secs()))
        }
    }
}

/// Transfer with retries; each attempt gets a fresh deadline and remote handle
pub async fn transfer(
    conn: &dyn Connection,
    req: &TransferRequest,
    timeout: Duration,
    retry: &RetryConfig,
) -> Result<u64> {
    let target = req.target();
    let bytes = run_with_retry(retry, req.direction.operation(), &target, |_| {
        transfer_once(conn, req, timeout)
    })
    .await?;
    info!("{} completed ({} bytes)", target, bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    fn local() -> LocalFs {
        LocalFs::new(CancelFlag::new())
    }

    #[test]
    fn test_dir_mode_adds_execute() {
        assert_eq!(dir_mode(0o644), 0o755);
        assert_eq!(dir_mode(0o640), 0o750);
        assert_eq!(dir_mode(0o400), 0o700);
    }

    #[test]
    fn test_copy_file_into_existing_dir() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("app.conf");
        stdfs::write(&src, "key=value\n").unwrap();

        let fs = local();
        let dst = dst_dir.path().to_str().unwrap();
        let bytes = copy_path(&fs, &fs, &src, dst, OverwritePolicy::Always, &CancelFlag::new()).unwrap();

        assert_eq!(bytes, 10);
        assert_eq!(
            stdfs::read_to_string(dst_dir.path().join("app.conf")).unwrap(),
            "key=value\n"
        );
    }

    #[test]
    fn test_trailing_slash_creates_directory() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.log");
        stdfs::write(&src, "log").unwrap();

        let dst = format!("{}/logs/10.0.0.1/", dst_dir.path().display());
        let fs = local();
        copy_path(&fs, &fs, &src, &dst, OverwritePolicy::Always, &CancelFlag::new()).unwrap();

        assert!(dst_dir.path().join("logs/10.0.0.1/a.log").is_file());
    }

    #[test]
    fn test_exact_destination_path() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.txt");
        stdfs::write(&src, "abc").unwrap();

        let dst = dst_dir.path().join("nested/renamed.txt");
        let fs = local();
        copy_path(&fs, &fs, &src, dst.to_str().unwrap(), OverwritePolicy::Always, &CancelFlag::new()).unwrap();
        assert_eq!(stdfs::read_to_string(dst).unwrap(), "abc");
    }

    #[test]
    fn test_directory_tree_copy_keeps_structure() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let tree = src_dir.path().join("site");
        stdfs::create_dir_all(tree.join("css")).unwrap();
        stdfs::create_dir_all(tree.join("empty")).unwrap();
        stdfs::write(tree.join("index.html"), "<html/>").unwrap();
        stdfs::write(tree.join("css/main.css"), "body{}").unwrap();

        let fs = local();
        let bytes = copy_path(
            &fs,
            &fs,
            &tree,
            dst_dir.path().to_str().unwrap(),
            OverwritePolicy::Always,
            &CancelFlag::new(),
        )
        .unwrap();

        let out = dst_dir.path().join("site");
        assert_eq!(bytes, 13);
        assert_eq!(stdfs::read_to_string(out.join("index.html")).unwrap(), "<html/>");
        assert_eq!(stdfs::read_to_string(out.join("css/main.css")).unwrap(), "body{}");
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn test_never_policy_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("new.txt");
        let dst = dir.path().join("old.txt");
        stdfs::write(&src, "new").unwrap();
        stdfs::write(&dst, "old").unwrap();

        let fs = local();
        let err = copy_path(&fs, &fs, &src, dst.to_str().unwrap(), OverwritePolicy::Never, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(stdfs::read_to_string(&dst).unwrap(), "old");
    }

    #[test]
    fn test_cancelled_copy_stops() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        stdfs::write(&src, vec![7u8; CHUNK_SIZE * 4]).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let fs = LocalFs::new(cancel.clone());
        let err = copy_path(
            &fs,
            &fs,
            &src,
            dir.path().join("copy.bin").to_str().unwrap(),
            OverwritePolicy::Always,
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(!dir.path().join("copy.bin").exists());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let fs = local();
        let err = copy_path(
            &fs,
            &fs,
            &dir.path().join("absent"),
            dir.path().to_str().unwrap(),
            OverwritePolicy::Always,
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_error_mapping() {
        let req = TransferRequest {
            direction: Direction::Upload,
            local: "a".to_string(),
            remote: "/tmp/a".to_string(),
            policy: OverwritePolicy::Never,
        };
        let cancel = CancelFlag::new();

        let exists = map_copy_error(&req, io::Error::from(io::ErrorKind::AlreadyExists), &cancel);
        assert!(exists.is_kind(ErrorKind::Validation));

        let denied = map_copy_error(&req, io::Error::from(io::ErrorKind::PermissionDenied), &cancel);
        assert!(denied.is_kind(ErrorKind::Permission));

        cancel.cancel();
        let timed_out = map_copy_error(&req, io::Error::from(io::ErrorKind::Interrupted), &cancel);
        assert!(timed_out.is_kind(ErrorKind::Timeout));
        assert_eq!(timed_out.operation, "file_upload");
    }
}
