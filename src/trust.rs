//! Host key trust store
//!
//! Validates the key a host presents during the handshake against an
//! OpenSSH-format `known_hosts` file, under one of three [`SecurityMode`]s:
//!
//! - **permissive**: every key is accepted, the file is never touched
//! - **strict**: only a key already recorded for the host is accepted; the
//!   file is only read
//! - **interactive**: a recorded key is accepted silently; an unknown or
//!   changed key is shown to the operator, and on confirmation the stale
//!   entries for the host are replaced with the new one
//!
//! A key listed under `@revoked` is rejected in every mode but permissive.
//!
//! Host loops validate concurrently, so interactive decisions hold a
//! store-wide lock from the read through the prompt to the rewrite. Rewrites
//! go to a sibling temp file which is then renamed over the original.

use crate::config::SecurityMode;
use crate::error::{GossError, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const OPERATION: &str = "verify_host_key";
const HASHED_PREFIX: &str = "|1|";

/// Public host key: algorithm name plus the raw wire-format blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub blob: Vec<u8>,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            blob,
        }
    }

    /// Build from a raw key blob, reading the algorithm name embedded in it
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let name = blob.get(4..4usize.checked_add(len)?)?;
        let key_type = std::str::from_utf8(name).ok()?;
        Some(Self::new(key_type, blob.to_vec()))
    }

    /// `SHA256:<base64 without padding>`, as printed by `ssh-keygen -l`
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    fn to_base64(&self) -> String {
        STANDARD.encode(&self.blob)
    }
}

/// Name a host is recorded under: `host` on port 22, `[host]:port` otherwise
pub fn host_identity(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Operator decision for an unknown or changed key
#[cfg_attr(test, mockall::automock)]
pub trait HostKeyPrompt: Send + Sync {
    /// Return `true` to trust `fingerprint` for `identity`. `known` lists the
    /// fingerprints currently recorded for the host (empty if unknown).
    fn confirm(&self, identity: &str, fingerprint: &str, known: &[String]) -> bool;
}

/// Asks on the terminal; anything but `y`/`yes` rejects
pub struct StdinPrompt;

impl HostKeyPrompt for StdinPrompt {
    fn confirm(&self, identity: &str, fingerprint: &str, known: &[String]) -> bool {
        let mut stderr = io::stderr().lock();
        let _ = if known.is_empty() {
            writeln!(
                stderr,
                "The authenticity of host '{}' can't be established.\nKey fingerprint is {}.",
                identity, fingerprint
            )
        } else {
            writeln!(
                stderr,
                "WARNING: the host key for '{}' has changed!\nRecorded: {}\nPresented: {}",
                identity,
                known.join(", "),
                fingerprint
            )
        };
        let _ = write!(stderr, "Are you sure you want to continue connecting (yes/no)? ");
        let _ = stderr.flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_affirmative(&answer)
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Revoked,
    CertAuthority,
}

#[derive(Debug)]
struct KnownHostEntry {
    marker: Option<Marker>,
    patterns: String,
    key: HostKey,
}

/// One line of the file; unparsable lines are kept verbatim
#[derive(Debug)]
enum Line {
    Entry(KnownHostEntry, String),
    Other(String),
}

fn parse_line(raw: &str) -> Option<KnownHostEntry> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let mut first = fields.next()?;
    let marker = match first {
        "@revoked" => Some(Marker::Revoked),
        "@cert-authority" => Some(Marker::CertAuthority),
        m if m.starts_with('@') => return None,
        _ => None,
    };
    if marker.is_some() {
        first = fields.next()?;
    }
    let key_type = fields.next()?;
    let blob = STANDARD.decode(fields.next()?).ok()?;

    Some(KnownHostEntry {
        marker,
        patterns: first.to_string(),
        key: HostKey::new(key_type, blob),
    })
}

fn parse_file(content: &str, path: &Path) -> Vec<Line> {
    content
        .lines()
        .enumerate()
        .map(|(idx, raw)| match parse_line(raw) {
            Some(entry) => Line::Entry(entry, raw.to_string()),
            None => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    warn!("Skipping malformed line {} in {}", idx + 1, path.display());
                }
                Line::Other(raw.to_string())
            }
        })
        .collect()
}

/// Glob match supporting `*` and `?`, case-insensitive
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match a comma-separated pattern list; any negated hit vetoes the line
fn patterns_match(patterns: &str, identity: &str) -> bool {
    let mut matched = false;
    for pattern in patterns.split(',') {
        if pattern.starts_with(HASHED_PREFIX) {
            continue;
        }
        match pattern.strip_prefix('!') {
            Some(negated) => {
                if glob_match(negated, identity) {
                    return false;
                }
            }
            None => {
                if glob_match(pattern, identity) {
                    matched = true;
                }
            }
        }
    }
    matched
}

#[derive(Debug, PartialEq)]
enum Lookup {
    Match,
    Mismatch(Vec<HostKey>),
    NotFound,
    Revoked,
}

fn lookup(lines: &[Line], identity: &str, key: &HostKey) -> Lookup {
    let entries: Vec<&KnownHostEntry> = lines
        .iter()
        .filter_map(|line| match line {
            Line::Entry(entry, _) => Some(entry),
            Line::Other(_) => None,
        })
        .collect();

    if entries
        .iter()
        .any(|e| e.marker == Some(Marker::Revoked) && e.key == *key)
    {
        return Lookup::Revoked;
    }

    let mut recorded = Vec::new();
    for entry in entries.iter().filter(|e| e.marker.is_none()) {
        if !patterns_match(&entry.patterns, identity) {
            continue;
        }
        if entry.key == *key {
            return Lookup::Match;
        }
        recorded.push(entry.key.clone());
    }

    if recorded.is_empty() {
        Lookup::NotFound
    } else {
        Lookup::Mismatch(recorded)
    }
}

/// Persisted host key store
pub struct TrustStore {
    path: PathBuf,
    prompt: Arc<dyn HostKeyPrompt>,
    lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>, prompt: Arc<dyn HostKeyPrompt>) -> Self {
        Self {
            path: path.into(),
            prompt,
            lock: Mutex::new(()),
        }
    }

    /// Store at `~/.ssh/known_hosts`
    pub fn open_default(prompt: Arc<dyn HostKeyPrompt>) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            GossError::configuration("cannot determine home directory for known_hosts")
        })?;
        Ok(Self::new(home.join(".ssh").join("known_hosts"), prompt))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept or reject `key` for `identity` under `mode`
    ///
    /// # Errors
    ///
    /// `Permission` when the key is revoked, unknown (strict), changed
    /// (strict) or declined by the operator; `Resource` when the file
    /// cannot be read or rewritten.
    pub fn validate(&self, identity: &str, key: &HostKey, mode: SecurityMode) -> Result<()> {
        match mode {
            SecurityMode::Permissive => {
                debug!("Accepting host key for {} without verification", identity);
                Ok(())
            }
            SecurityMode::Strict => self.validate_strict(identity, key),
            SecurityMode::Interactive => self.validate_interactive(identity, key),
        }
    }

    fn validate_strict(&self, identity: &str, key: &HostKey) -> Result<()> {
        let lines = self.read_lines()?;
        match lookup(&lines, identity, key) {
            Lookup::Match => Ok(()),
            Lookup::Revoked => Err(revoked(identity, key)),
            Lookup::Mismatch(recorded) => Err(GossError::permission(
                OPERATION,
                identity,
                "host key does not match the recorded key",
            )
            .with_detail("fingerprint", key.fingerprint())
            .with_detail("expected", fingerprints(&recorded))),
            Lookup::NotFound => Err(GossError::permission(
                OPERATION,
                identity,
                "host is not present in known_hosts (strict mode)",
            )
            .with_detail("fingerprint", key.fingerprint())
            .with_detail("known_hosts", self.path.display().to_string())),
        }
    }

    fn validate_interactive(&self, identity: &str, key: &HostKey) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.ensure_file()?;
        let lines = self.read_lines()?;
        let known = match lookup(&lines, identity, key) {
            Lookup::Match => return Ok(()),
            Lookup::Revoked => return Err(revoked(identity, key)),
            Lookup::Mismatch(recorded) => {
                let expected = fingerprints(&recorded);
                warn!(
                    "Host key for {} has changed: presented {}, recorded {}",
                    identity,
                    key.fingerprint(),
                    expected.join(", ")
                );
                expected
            }
            Lookup::NotFound => Vec::new(),
        };

        let fingerprint = key.fingerprint();
        if !self.prompt.confirm(identity, &fingerprint, &known) {
            return Err(
                GossError::permission(OPERATION, identity, "host key rejected by user")
                    .with_detail("fingerprint", fingerprint),
            );
        }

        self.replace_entries(lines, identity, key)?;
        info!("Trusted host key {} for {}", fingerprint, identity);
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<Line>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_file(&content, &self.path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error("cannot read known_hosts", e)),
        }
    }

    fn ensure_file(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                create_private_dir(dir).map_err(|e| self.io_error("cannot create known_hosts directory", e))?;
            }
        }
        if !self.path.exists() {
            write_private_file(&self.path, b"")
                .map_err(|e| self.io_error("cannot create known_hosts", e))?;
        }
        Ok(())
    }

    /// Drop `identity` from every plain entry, then append the new key
    fn replace_entries(&self, lines: Vec<Line>, identity: &str, key: &HostKey) -> Result<()> {
        let mut out = String::new();
        for line in lines {
            match line {
                Line::Entry(entry, raw) if entry.marker.is_none() => {
                    let kept: Vec<&str> = entry
                        .patterns
                        .split(',')
                        .filter(|p| !p.eq_ignore_ascii_case(identity))
                        .collect();
                    if kept.is_empty() {
                        continue;
                    }
                    if kept.len() == entry.patterns.split(',').count() {
                        out.push_str(&raw);
                    } else {
                        out.push_str(&format!(
                            "{} {} {}",
                            kept.join(","),
                            entry.key.key_type,
                            entry.key.to_base64()
                        ));
                    }
                }
                Line::Entry(_, raw) | Line::Other(raw) => out.push_str(&raw),
            }
            out.push('\n');
        }
        out.push_str(&format!("{} {} {}\n", identity, key.key_type, key.to_base64()));

        let tmp = self.path.with_extension(format!("goss-{}.tmp", std::process::id()));
        write_private_file(&tmp, out.as_bytes())
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                self.io_error("cannot update known_hosts", e)
            })
    }

    fn io_error(&self, message: &str, err: io::Error) -> GossError {
        GossError::resource(OPERATION, self.path.display().to_string(), message).with_source(err)
    }
}

fn revoked(identity: &str, key: &HostKey) -> GossError {
    GossError::permission(OPERATION, identity, "host key has been revoked")
        .with_detail("fingerprint", key.fingerprint())
}

fn fingerprints(keys: &[HostKey]) -> Vec<String> {
    keys.iter().map(HostKey::fingerprint).collect()
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

fn write_private_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
