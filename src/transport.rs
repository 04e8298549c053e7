//! Connections to hosts
//!
//! [`Connector`] establishes one authenticated [`Connection`] per host. The
//! dispatcher only talks to these traits; [`SshConnector`] is the real
//! implementation on top of ssh2.
//!
//! Establishing a connection:
//!
//! 1. TCP connect bounded by the connect timeout
//! 2. SSH handshake
//! 3. Host key check through the [`TrustStore`]
//! 4. Password authentication, falling back to keyboard-interactive where
//!    every prompt mentioning "password" is answered with the login password
//!
//! Any failure is reported as a `Connection` error carrying the port and
//! timeout.
//!
//! A command worker that outlives its deadline by more than the backstop
//! still owns the session, so the connection is marked abandoned. Every later
//! call on it fails with a `Connection` error without touching the session.

use crate::config::SecurityMode;
use crate::error::{GossError, Result};
use crate::executors::ssh::{run_plain, run_privileged, session_timeout_ms, TERMINATION_GRACE};
use crate::executors::CommandOutput;
use crate::models::Host;
use crate::transfer::fs::{CancelFlag, FileSystem, SftpFs};
use crate::trust::{host_identity, HostKey, TrustStore};
use async_trait::async_trait;
use ssh2::{KeyboardInteractivePrompt, Prompt, Session};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slack on top of deadline + grace before a blocking worker is given up on
const BACKSTOP_SLACK: Duration = Duration::from_secs(2);

/// Opens connections to hosts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>>;
}

/// An authenticated channel to exactly one host
///
/// Owned by that host's task loop; tasks use it one at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `command`, capturing combined output, within `timeout`
    async fn execute(&self, command: &str, timeout: Duration) -> CommandOutput;

    /// Run `command` as root, answering the password prompt with `sudo_password`
    async fn execute_privileged(&self, command: &str, sudo_password: &str, timeout: Duration) -> CommandOutput;

    /// Filesystem view of the host for one transfer attempt
    async fn remote_fs(&self, cancel: CancelFlag) -> Result<Box<dyn FileSystem>>;

    async fn close(&self);
}

/// Answers keyboard-interactive password prompts
struct PasswordResponder<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordResponder<'_> {
    fn prompt<'b>(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt<'b>]) -> Vec<String> {
        prompts
            .iter()
            .map(|p| {
                if p.text.to_lowercase().contains("password") {
                    self.password.to_string()
                } else {
                    String::new()
                }
            })
            .collect()
    }
}

/// Connector over ssh2
pub struct SshConnector {
    trust: Arc<TrustStore>,
    mode: SecurityMode,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(trust: Arc<TrustStore>, mode: SecurityMode, connect_timeout: Duration) -> Self {
        Self {
            trust,
            mode,
            connect_timeout,
        }
    }
}

fn connect_error(host: &Host, timeout: Duration, message: &str) -> GossError {
    GossError::new(
        crate::error::ErrorKind::Connection,
        "ssh_connect",
        host.address(),
        message.to_string(),
    )
    .with_detail("port", host.port)
    .with_detail("timeout_secs", timeout.as_secs())
    .with_detail("attempts", 1)
}

/// Blocking connection setup
fn establish(host: &Host, trust: &TrustStore, mode: SecurityMode, timeout: Duration) -> Result<Session> {
    let fail = |message: &str| connect_error(host, timeout, message);

    let addr = (host.ip.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| fail("cannot resolve host").with_source(e))?
        .next()
        .ok_or_else(|| fail("host resolved to no address"))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| fail("TCP connect failed").with_source(e))?;

    let mut session = Session::new().map_err(|e| fail("cannot create SSH session").with_source(e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(session_timeout_ms(timeout));
    session
        .handshake()
        .map_err(|e| fail("SSH handshake failed").with_source(e))?;

    let identity = host_identity(&host.ip, host.port);
    match session.host_key().and_then(|(blob, _)| HostKey::from_blob(blob)) {
        Some(key) => trust
            .validate(&identity, &key, mode)
            .map_err(|e| fail("host key verification failed").with_source(e))?,
        None if mode == SecurityMode::Permissive => {
            warn!("{} presented no usable host key", identity);
        }
        None => return Err(fail("host presented no usable host key")),
    }

    if let Err(e) = session.userauth_password(&host.user, &host.password) {
        debug!("Password auth for {}@{} failed ({}), trying keyboard-interactive", host.user, identity, e);
    }
    if !session.authenticated() {
        let mut responder = PasswordResponder {
            password: &host.password,
        };
        if let Err(e) = session.userauth_keyboard_interactive(&host.user, &mut responder) {
            return Err(fail("authentication failed").with_source(e));
        }
    }
    if !session.authenticated() {
        return Err(fail("authentication failed"));
    }

    // Deadlines are enforced per operation from here on
    session.set_timeout(0);
    Ok(session)
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>> {
        let started = Instant::now();
        let worker_host = host.clone();
        let trust = self.trust.clone();
        let mode = self.mode;
        let timeout = self.connect_timeout;

        let session = tokio::task::spawn_blocking(move || establish(&worker_host, &trust, mode, timeout))
            .await
            .map_err(|e| connect_error(host, timeout, "connection worker failed").with_source(e))??;

        info!(
            "SSH session established to {} in {:?}",
            host.address(),
            started.elapsed()
        );
        Ok(Box::new(SshConnection::new(session, host.address())))
    }
}

/// Live ssh2 session
pub struct SshConnection {
    session: Session,
    target: String,
    abandoned: Arc<AtomicBool>,
}

impl SshConnection {
    fn new(session: Session, target: String) -> Self {
        Self {
            session,
            target,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_usable(&self, operation: &str) -> Result<()> {
        if self.abandoned.load(Ordering::SeqCst) {
            return Err(GossError::new(
                crate::error::ErrorKind::Connection,
                operation,
                self.target.as_str(),
                "session abandoned after a command overran its deadline",
            ));
        }
        Ok(())
    }
}

/// How long to wait for a command worker with deadline `timeout`
fn backstop(timeout: Duration) -> Duration {
    timeout + TERMINATION_GRACE + BACKSTOP_SLACK
}

/// Wait up to `limit` for a blocking command worker
///
/// A worker still running at `limit` keeps the session busy; `abandoned` is
/// raised so nothing else uses it.
async fn await_worker(
    handle: JoinHandle<CommandOutput>,
    limit: Duration,
    abandoned: &AtomicBool,
    operation: &str,
    target: &str,
) -> CommandOutput {
    let started = Instant::now();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => CommandOutput::failure(
            String::new(),
            GossError::execution(operation, target, "execution worker failed").with_source(e),
            started.elapsed(),
        ),
        Err(_) => {
            abandoned.store(true, Ordering::SeqCst);
            warn!("{} on {} did not return within {:?}, abandoning the session", operation, target, limit);
            CommandOutput::failure(
                String::new(),
                GossError::timeout(operation, target)
                    .with_detail("timeout_secs", limit.as_secs())
                    .with_detail("session_abandoned", true),
                started.elapsed(),
            )
        }
    }
}

fn unusable(err: GossError) -> CommandOutput {
    CommandOutput::failure(String::new(), err, Duration::ZERO)
}

#[async_trait]
impl Connection for SshConnection {
    async fn execute(&self, command: &str, timeout: Duration) -> CommandOutput {
        if let Err(e) = self.ensure_usable("execute_command") {
            return unusable(e);
        }
        let session = self.session.clone();
        let command = command.to_string();
        let target = self.target.clone();
        let handle = tokio::task::spawn_blocking(move || run_plain(&session, &command, &target, timeout));
        await_worker(handle, backstop(timeout), &self.abandoned, "execute_command", &self.target).await
    }

    async fn execute_privileged(&self, command: &str, sudo_password: &str, timeout: Duration) -> CommandOutput {
        if let Err(e) = self.ensure_usable("execute_privileged") {
            return unusable(e);
        }
        let session = self.session.clone();
        let command = command.to_string();
        let password = sudo_password.to_string();
        let target = self.target.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_privileged(&session, &command, &password, &target, timeout)
        });
        await_worker(handle, backstop(timeout), &self.abandoned, "execute_privileged", &self.target).await
    }

    async fn remote_fs(&self, cancel: CancelFlag) -> Result<Box<dyn FileSystem>> {
        self.ensure_usable("open_sftp")?;
        let session = self.session.clone();
        let sftp = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            session.sftp()
        })
        .await
        .map_err(|e| GossError::execution("open_sftp", self.target.as_str(), "sftp worker failed").with_source(e))?
        .map_err(|e| {
            GossError::resource("open_sftp", self.target.as_str(), "cannot start SFTP subsystem").with_source(e)
        })?;
        Ok(Box::new(SftpFs::new(sftp, cancel)))
    }

    async fn close(&self) {
        if self.ensure_usable("close").is_err() {
            warn!("Dropping abandoned session to {} without a disconnect", self.target);
            return;
        }
        let session = self.session.clone();
        let target = self.target.clone();
        let _ = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            if let Err(e) = session.disconnect(None, "goss run finished", None) {
                debug!("Disconnect from {} failed: {}", target, e);
            }
        })
        .await;
    }
}
