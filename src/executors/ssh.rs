//! Remote execution engine over ssh2
//!
//! Commands run on an exec channel of an already authenticated [`Session`].
//! The session is switched to non-blocking mode while the command runs so the
//! worker can poll output, watch the deadline and react to prompts from a
//! single loop.
//!
//! # Privileged execution
//!
//! Privileged commands run as `env LANG=C su - root -c '<cmd>'` on a pty with
//! local echo disabled. The output is watched for a password prompt
//! (`Password`, or the localized `密码`); on first sight the privileged
//! password is written to the channel exactly once. Prompt lines are removed
//! from the returned output.
//!
//! The watcher assumes the prompt is the first output containing the needle.
//! A command that prints "Password" before `su` asks for one gets the password
//! injected into its own input instead.
//!
//! # Deadlines
//!
//! When the deadline passes the command is interrupted (Ctrl-C through the pty
//! for privileged runs, EOF and close otherwise), output is drained for a short
//! grace period and a `Timeout` error is returned with whatever was captured.

use crate::error::GossError;
use crate::executors::{truncate_output_bytes, CommandOutput};
use crate::models::MAX_OUTPUT_SIZE;
use ssh2::{Channel, PtyModeOpcode, PtyModes, Session, Stream};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sleep between polls when the channel has nothing to read
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Time granted to an interrupted command to flush its output
pub const TERMINATION_GRACE: Duration = Duration::from_millis(100);

/// Upper bound for collecting the exit status after EOF
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const PROMPT_NEEDLES: [&str; 2] = ["Password", "密码"];
const CTRL_C: &[u8] = &[0x03];

/// Minimal view of a running command's channel
pub(crate) trait ExecChannel {
    /// Read merged stdout/stderr. `Ok(0)` means EOF; `WouldBlock` means no
    /// data right now.
    fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_input(&mut self, data: &[u8]) -> io::Result<()>;

    /// Best-effort request to stop the command
    fn interrupt(&mut self);

    /// Wait for the channel to close and return the exit status
    fn finish(&mut self, limit: Duration) -> io::Result<i32>;

    /// Tear the channel down without waiting
    fn abort(&mut self);
}

#[derive(Debug)]
pub(crate) enum RunStatus {
    Exited(i32),
    TimedOut,
    Failed(io::Error),
}

#[derive(Debug)]
pub(crate) struct ChannelRun {
    pub output: Vec<u8>,
    pub truncated: bool,
    pub status: RunStatus,
}

struct Capture {
    data: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_SIZE.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Search for a prompt needle, starting a little before `from` so a needle
/// split across two reads is still found.
fn contains_prompt(data: &[u8], from: usize) -> bool {
    PROMPT_NEEDLES.iter().any(|needle| {
        let start = from.saturating_sub(needle.len());
        find_subslice(&data[start..], needle.as_bytes())
    })
}

/// Run a started command to completion or deadline
///
/// With `password` set, the first prompt seen in the output is answered with
/// it once.
pub(crate) fn drive_channel(
    channel: &mut dyn ExecChannel,
    timeout: Duration,
    password: Option<&str>,
) -> ChannelRun {
    let started = Instant::now();
    let mut capture = Capture::new();
    let mut buf = [0u8; 8192];
    let mut scanned = 0usize;
    let mut injected = password.is_none();

    loop {
        if started.elapsed() >= timeout {
            channel.interrupt();
            drain(channel, &mut capture, &mut buf, TERMINATION_GRACE);
            channel.abort();
            return ChannelRun {
                output: capture.data,
                truncated: capture.truncated,
                status: RunStatus::TimedOut,
            };
        }

        match channel.read_output(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                capture.push(&buf[..n]);
                if !injected && contains_prompt(&capture.data, scanned) {
                    debug!("Password prompt detected, sending credentials");
                    let mut answer = password.unwrap_or_default().as_bytes().to_vec();
                    answer.push(b'\n');
                    if let Err(e) = channel.write_input(&answer) {
                        channel.abort();
                        return ChannelRun {
                            output: capture.data,
                            truncated: capture.truncated,
                            status: RunStatus::Failed(e),
                        };
                    }
                    injected = true;
                }
                scanned = capture.data.len();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                channel.abort();
                return ChannelRun {
                    output: capture.data,
                    truncated: capture.truncated,
                    status: RunStatus::Failed(e),
                };
            }
        }
    }

    let status = match channel.finish(CLOSE_TIMEOUT) {
        Ok(code) => RunStatus::Exited(code),
        Err(e) => RunStatus::Failed(e),
    };
    ChannelRun {
        output: capture.data,
        truncated: capture.truncated,
        status,
    }
}

fn drain(channel: &mut dyn ExecChannel, capture: &mut Capture, buf: &mut [u8], grace: Duration) {
    let until = Instant::now() + grace;
    while Instant::now() < until {
        match channel.read_output(buf) {
            Ok(0) => return,
            Ok(n) => capture.push(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

/// Remove every line that carries a password prompt
pub fn strip_password_prompts(output: &str) -> String {
    output
        .split_inclusive('\n')
        .filter(|line| !PROMPT_NEEDLES.iter().any(|needle| line.contains(needle)))
        .collect()
}

/// Wrap `command` for execution as root through `su`
pub fn privileged_wrapper(command: &str) -> String {
    format!("env LANG=C su - root -c '{}'", command.replace('\'', "'\\''"))
}

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(-37))
}

/// `LIBSSH2_ERROR_TIMEOUT`, raised when a blocking call outlives the session timeout
pub(crate) fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(-9))
}

/// Session timeout in milliseconds for a deadline; never 0, which libssh2
/// reads as "wait forever"
pub(crate) fn session_timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().clamp(1, u32::MAX as u128) as u32
}

/// ssh2 exec channel adapter
struct SshChannel {
    channel: Channel,
    stderr: Stream,
    pty: bool,
}

impl ExecChannel for SshChannel {
    fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.channel.read(buf) {
            Ok(n) if n > 0 => return Ok(n),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        match self.stderr.read(buf) {
            Ok(n) if n > 0 => return Ok(n),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        if self.channel.eof() {
            Ok(0)
        } else {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    fn write_input(&mut self, data: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + CLOSE_TIMEOUT;
        let mut written = 0;
        while written < data.len() {
            match self.channel.write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL)
                }
                Err(e) => return Err(e),
            }
        }
        let _ = self.channel.flush();
        Ok(())
    }

    fn interrupt(&mut self) {
        if self.pty {
            let _ = self.channel.write(CTRL_C);
        } else {
            let _ = self.channel.send_eof();
            let _ = self.channel.close();
        }
    }

    fn finish(&mut self, limit: Duration) -> io::Result<i32> {
        let deadline = Instant::now() + limit;
        loop {
            match self.channel.wait_close() {
                Ok(()) => break,
                Err(e) if would_block(&e) && Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL)
                }
                // Exit status may already be known even if close did not complete
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.channel.exit_status().map_err(io::Error::from)
    }

    fn abort(&mut self) {
        let _ = self.channel.close();
    }
}

fn open_channel(session: &Session, command: &str, pty: bool) -> Result<Channel, ssh2::Error> {
    let mut channel = session.channel_session()?;
    if pty {
        let mut modes = PtyModes::new();
        modes.set_boolean(PtyModeOpcode::ECHO, false);
        modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, 14400);
        modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, 14400);
        channel.request_pty("linux", Some(modes), Some((80, 24, 0, 0)))?;
        // Servers commonly refuse setenv; the wrapper sets LANG itself.
        if let Err(e) = channel.setenv("LANG", "C") {
            debug!("setenv LANG refused: {}", e);
        }
    }
    channel.exec(command)?;
    Ok(channel)
}

fn run(
    session: &Session,
    command: &str,
    target: &str,
    timeout: Duration,
    password: Option<&str>,
) -> CommandOutput {
    let started = Instant::now();
    let privileged = password.is_some();
    let operation = if privileged {
        "execute_privileged"
    } else {
        "execute_command"
    };
    let remote_command = if privileged {
        privileged_wrapper(command)
    } else {
        command.to_string()
    };

    // Opening the channel blocks, so it is bounded by the same deadline
    session.set_blocking(true);
    session.set_timeout(session_timeout_ms(timeout));
    let opened = open_channel(session, &remote_command, privileged);
    session.set_timeout(0);
    let channel = match opened {
        Ok(channel) => channel,
        Err(e) if is_timeout(&e) => {
            return CommandOutput::failure(
                String::new(),
                GossError::timeout(operation, target)
                    .with_detail("timeout_secs", timeout.as_secs())
                    .with_detail("stage", "open_channel")
                    .with_source(e),
                started.elapsed(),
            )
        }
        Err(e) => {
            return CommandOutput::failure(
                String::new(),
                GossError::execution(operation, target, "failed to start command on session")
                    .with_source(e),
                started.elapsed(),
            )
        }
    };

    let stderr = channel.stderr();
    let mut exec = SshChannel {
        channel,
        stderr,
        pty: privileged,
    };
    session.set_blocking(false);
    let run = drive_channel(&mut exec, timeout.saturating_sub(started.elapsed()), password);
    drop(exec);
    session.set_blocking(true);

    let (mut output, cut) = truncate_output_bytes(&run.output);
    if run.truncated || cut {
        warn!(
            "Output of '{}' on {} truncated to {} bytes",
            command, target, MAX_OUTPUT_SIZE
        );
    }
    if privileged {
        output = strip_password_prompts(&output);
    }
    let duration = started.elapsed();

    match run.status {
        RunStatus::Exited(0) => CommandOutput::success(output, duration),
        RunStatus::Exited(code) => CommandOutput::failure(
            output,
            GossError::execution(operation, target, format!("command exited with status {}", code))
                .with_detail("exit_code", code)
                .with_detail("command", command),
            duration,
        ),
        RunStatus::TimedOut => CommandOutput::failure(
            output,
            GossError::timeout(operation, target)
                .with_detail("timeout_secs", timeout.as_secs())
                .with_detail("command", command),
            duration,
        ),
        RunStatus::Failed(e) => CommandOutput::failure(
            output,
            GossError::execution(operation, target, "command execution failed").with_source(e),
            duration,
        ),
    }
}

/// Run `command` and capture combined stdout/stderr (blocking)
pub fn run_plain(session: &Session, command: &str, target: &str, timeout: Duration) -> CommandOutput {
    debug!("Executing on {}: {}", target, command);
    run(session, command, target, timeout, None)
}

/// Run `command` as root, answering the password prompt (blocking)
pub fn run_privileged(
    session: &Session,
    command: &str,
    sudo_password: &str,
    target: &str,
    timeout: Duration,
) -> CommandOutput {
    debug!("Executing privileged on {}: {}", target, command);
    run(session, command, target, timeout, Some(sudo_password))
}
