//! Filesystem abstraction shared by uploads and downloads
//!
//! [`LocalFs`] and [`SftpFs`] implement the same [`FileSystem`] trait so the
//! copy algorithm in the parent module is written once. Every operation checks
//! the [`CancelFlag`] before touching storage.

use crate::config::OverwritePolicy;
use ssh2::{OpenFlags, OpenType, Sftp};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between a transfer and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Interrupted` error once cancelled
    pub fn check(&self) -> io::Result<()> {
        if self.is_cancelled() {
            Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub is_dir: bool,
    /// Permission bits (`0o7777` mask)
    pub mode: u32,
}

/// One entry below a walked root
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Path relative to the walk root
    pub relative: PathBuf,
    pub meta: FileMeta,
}

pub trait FileSystem: Send {
    fn stat(&self, path: &Path) -> io::Result<FileMeta>;

    /// Create `path` and any missing parents with `mode`
    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn open_reader(&self, path: &Path) -> io::Result<Box<dyn Read + '_>>;

    /// Open for writing; `Never` fails with `AlreadyExists` if `path` exists
    fn open_writer(&self, path: &Path, policy: OverwritePolicy, mode: u32) -> io::Result<Box<dyn Write + '_>>;

    /// Every entry below `root` (not `root` itself), parents before children
    fn walk(&self, root: &Path) -> io::Result<Vec<WalkEntry>>;
}

/// Local disk
pub struct LocalFs {
    cancel: CancelFlag,
}

impl LocalFs {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

fn local_meta(meta: &fs::Metadata) -> FileMeta {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = if meta.is_dir() { 0o755 } else { 0o644 };

    FileMeta {
        is_dir: meta.is_dir(),
        mode,
    }
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileMeta> {
        self.cancel.check()?;
        fs::metadata(path).map(|m| local_meta(&m))
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.cancel.check()?;
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path)
    }

    fn open_reader(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        self.cancel.check()?;
        Ok(Box::new(fs::File::open(path)?))
    }

    fn open_writer(&self, path: &Path, policy: OverwritePolicy, mode: u32) -> io::Result<Box<dyn Write + '_>> {
        self.cancel.check()?;
        let mut options = fs::OpenOptions::new();
        options.write(true);
        match policy {
            OverwritePolicy::Always => options.create(true).truncate(true),
            OverwritePolicy::Never => options.create_new(true),
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(Box::new(options.open(path)?))
    }

    fn walk(&self, root: &Path) -> io::Result<Vec<WalkEntry>> {
        self.cancel.check()?;
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(true) {
            self.cancel.check()?;
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .to_path_buf();
            let meta = entry.metadata().map_err(io::Error::from)?;
            entries.push(WalkEntry {
                path: entry.path().to_path_buf(),
                relative,
                meta: local_meta(&meta),
            });
        }
        Ok(entries)
    }
}

/// Remote host through the SFTP subsystem
pub struct SftpFs {
    sftp: Sftp,
    cancel: CancelFlag,
}

impl SftpFs {
    pub fn new(sftp: Sftp, cancel: CancelFlag) -> Self {
        Self { sftp, cancel }
    }

    fn walk_into(&self, root: &Path, dir: &Path, out: &mut Vec<WalkEntry>) -> io::Result<()> {
        self.cancel.check()?;
        let mut children = self.sftp.readdir(dir).map_err(sftp_error)?;
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (path, stat) in children {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .to_path_buf();
            let meta = sftp_meta(&stat);
            out.push(WalkEntry {
                path: path.clone(),
                relative,
                meta,
            });
            if meta.is_dir {
                self.walk_into(root, &path, out)?;
            }
        }
        Ok(())
    }
}

fn sftp_meta(stat: &ssh2::FileStat) -> FileMeta {
    FileMeta {
        is_dir: stat.is_dir(),
        mode: stat.perm.unwrap_or(0o644) & 0o7777,
    }
}

/// Map SFTP status codes onto io kinds the transfer engine understands
fn sftp_error(err: ssh2::Error) -> io::Error {
    let kind = match err.code() {
        ssh2::ErrorCode::SFTP(2) | ssh2::ErrorCode::SFTP(10) => io::ErrorKind::NotFound,
        ssh2::ErrorCode::SFTP(3) => io::ErrorKind::PermissionDenied,
        ssh2::ErrorCode::SFTP(11) => io::ErrorKind::AlreadyExists,
        _ => return io::Error::from(err),
    };
    io::Error::new(kind, err.to_string())
}

impl FileSystem for SftpFs {
    fn stat(&self, path: &Path) -> io::Result<FileMeta> {
        self.cancel.check()?;
        self.sftp.stat(path).map(|s| sftp_meta(&s)).map_err(sftp_error)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.cancel.check()?;
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            match self.sftp.stat(&current) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", current.display()),
                    ))
                }
                Err(_) => {}
            }
            if let Err(e) = self.sftp.mkdir(&current, mode as i32) {
                // Lost a race with another creator
                if !matches!(self.sftp.stat(&current), Ok(stat) if stat.is_dir()) {
                    return Err(sftp_error(e));
                }
            }
        }
        Ok(())
    }

    fn open_reader(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        self.cancel.check()?;
        Ok(Box::new(self.sftp.open(path).map_err(sftp_error)?))
    }

    fn open_writer(&self, path: &Path, policy: OverwritePolicy, mode: u32) -> io::Result<Box<dyn Write + '_>> {
        self.cancel.check()?;
        let flags = match policy {
            OverwritePolicy::Always => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            OverwritePolicy::Never => {
                // Many servers report a generic failure for O_EXCL conflicts
                if self.sftp.stat(path).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} already exists", path.display()),
                    ));
                }
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE
            }
        };
        let file = self
            .sftp
            .open_mode(path, flags, mode as i32, OpenType::File)
            .map_err(sftp_error)?;
        Ok(Box::new(file))
    }

    fn walk(&self, root: &Path) -> io::Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        self.walk_into(root, root, &mut entries)?;
        Ok(entries)
    }
}
