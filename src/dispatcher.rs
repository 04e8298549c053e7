//! Fan-out of tasks across hosts
//!
//! One host loop per host, admitted through a semaphore sized to
//! `execution.max_workers`. Inside a loop the tasks run strictly in order over
//! a single [`Connection`]. Finished [`HostTaskSet`]s go through a channel
//! sized to the host count and are sorted by submission index once every loop
//! is done.
//!
//! A panic inside a host loop is caught; the tasks of that host that have no
//! result yet are recorded as failed and every other host carries on. The
//! connection is closed either way.
//!
//! A task failing with a `Connection` error means the session is gone. The
//! host's later tasks then fail without touching the connection again.

use crate::config::{GossConfig, OverwritePolicy};
use crate::error::{ErrorKind, GossError, Result};
use crate::executors::CommandOutput;
use crate::metrics::RunMetrics;
use crate::models::{Host, HostTaskSet, RunReport, RunSummary, Task, TaskKind, TaskResult, TaskStatus};
use crate::path_template;
use crate::transfer::{transfer, transfer_once, Direction, TransferRequest};
use crate::transport::{Connection, Connector};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Message recorded for every task of a host that could not be reached
pub const CANNOT_PROCEED: &str =
    "the task cannot proceed due to the inability to establish an SSH connection";

/// Message recorded for the tasks left after a host's session went away
pub const SESSION_LOST: &str = "the task cannot proceed because the SSH session to the host was lost";

/// Consumer of a finished run (table, JSON, spreadsheet...)
pub trait ResultSink {
    fn render(&self, report: &RunReport) -> Result<()>;
}

/// Run-wide outcome counters, shared by all host loops
#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl Counters {
    fn record(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Success => &self.succeeded,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    config: Arc<GossConfig>,
    metrics: RunMetrics,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn Connector>, config: GossConfig, metrics: RunMetrics) -> Self {
        Self {
            connector,
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Run every task on every host and collect the results
    pub async fn run(&self, hosts: Vec<Host>, tasks: Vec<Task>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let max_workers = self.config.execution.max_workers.max(1);

        info!(
            "Starting run {}: {} hosts x {} tasks = {} task executions (max_workers={}, stop_on_error={})",
            run_id,
            hosts.len(),
            tasks.len(),
            hosts.len() * tasks.len(),
            max_workers,
            self.config.execution.stop_on_error
        );

        let gate = Arc::new(Semaphore::new(max_workers));
        let (tx, mut rx) = mpsc::channel::<HostTaskSet>(hosts.len().max(1));
        let counters = Arc::new(Counters::default());
        let tasks = Arc::new(tasks);
        let mut handles = Vec::with_capacity(hosts.len());

        for (index, host) in hosts.into_iter().enumerate() {
            // Blocks here until a slot frees
            let permit = match gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Admission gate closed: {}", e);
                    break;
                }
            };

            let worker = HostWorker {
                index,
                connector: self.connector.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                counters: counters.clone(),
                tasks: tasks.clone(),
            };
            let tx = tx.clone();
            let span = info_span!("host", worker = index, addr = %host.address());

            handles.push(tokio::spawn(async move {
                let set = worker.run(host).instrument(span).await;
                drop(permit);
                if tx.send(set).await.is_err() {
                    error!("Result channel closed before host {} reported", index);
                }
            }));
        }
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("Host loop aborted: {}", e);
            }
        }

        let mut sets = Vec::new();
        while let Some(set) = rx.recv().await {
            sets.push(set);
        }
        sets.sort_by_key(|set| set.index);

        let summary = RunSummary::compute(
            started.elapsed(),
            counters.succeeded.load(Ordering::Relaxed),
            counters.failed.load(Ordering::Relaxed),
            counters.skipped.load(Ordering::Relaxed),
        );
        info!(
            "Run {} finished in {:?}: {} total, {} succeeded, {} failed, {} skipped ({:.2} tasks/s, avg {:?}/task)",
            run_id,
            summary.elapsed,
            summary.total,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.throughput,
            summary.average_latency
        );

        RunReport {
            run_id,
            started_at,
            hosts: sets,
            summary,
        }
    }

    /// [`run`](Self::run), then hand the report to `sink`
    pub async fn run_and_render(
        &self,
        hosts: Vec<Host>,
        tasks: Vec<Task>,
        sink: &dyn ResultSink,
    ) -> Result<RunReport> {
        let report = self.run(hosts, tasks).await;
        sink.render(&report)?;
        Ok(report)
    }
}

/// Everything one host loop needs, owned so it can be spawned
struct HostWorker {
    index: usize,
    connector: Arc<dyn Connector>,
    config: Arc<GossConfig>,
    metrics: RunMetrics,
    counters: Arc<Counters>,
    tasks: Arc<Vec<Task>>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn from_command(task: Task, out: CommandOutput) -> TaskResult {
    match out.error {
        None => TaskResult::succeeded(task, out.output, out.duration),
        Some(err) => TaskResult::failed(task, out.output, err, out.duration),
    }
}

/// Failed result standing in for a task that never got a usable session
fn lost_connection(task: &Task, host: &Host, message: &str, cause: &GossError) -> TaskResult {
    let mut err = GossError::new(ErrorKind::Connection, "run_task", host.address(), message);
    err.details = cause.details.clone();
    let err = err.with_source(cause.detached());
    TaskResult::failed(task.clone(), String::new(), err, Duration::ZERO)
}

impl HostWorker {
    async fn run(self, host: Host) -> HostTaskSet {
        self.metrics.inc_active_hosts();
        let mut results = Vec::with_capacity(self.tasks.len());
        // Lives outside the unwinding future so it is closed on every path
        let mut conn: Option<Box<dyn Connection>> = None;

        let outcome = AssertUnwindSafe(self.run_tasks(&host, &mut conn, &mut results))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            error!(
                "Host loop {} for {} panicked: {}",
                self.index,
                host.address(),
                message
            );
            for task in self.tasks.iter().skip(results.len()) {
                let err = GossError::execution(
                    "host_worker",
                    host.address(),
                    format!("host worker panicked: {}", message),
                );
                let result = TaskResult::failed(task.clone(), String::new(), err, Duration::ZERO);
                self.record(&host, &mut results, result);
            }
        }

        if let Some(conn) = conn {
            conn.close().await;
        }

        self.metrics.dec_active_hosts();
        HostTaskSet {
            index: self.index,
            host,
            results,
        }
    }

    async fn run_tasks(
        &self,
        host: &Host,
        slot: &mut Option<Box<dyn Connection>>,
        results: &mut Vec<TaskResult>,
    ) {
        let conn: &dyn Connection = match self.connector.connect(host).await {
            Ok(conn) => {
                self.metrics.record_connection(true);
                &**slot.insert(conn)
            }
            Err(err) => {
                self.metrics.record_connection(false);
                error!(
                    "Worker {}: cannot connect to {}: {} {:?}",
                    self.index,
                    host.address(),
                    err,
                    err.details
                );
                for task in self.tasks.iter() {
                    let result = lost_connection(task, host, CANNOT_PROCEED, &err);
                    self.record(host, results, result);
                }
                return;
            }
        };

        let mut failed = false;
        let mut lost: Option<GossError> = None;
        for task in self.tasks.iter() {
            if failed && self.config.execution.stop_on_error {
                self.record(host, results, TaskResult::skipped(task.clone()));
                continue;
            }
            if let Some(err) = &lost {
                self.record(host, results, lost_connection(task, host, SESSION_LOST, err));
                continue;
            }
            let result = self.run_task(conn, host, task).await;
            failed |= result.status == TaskStatus::Failed;
            if let Some(err) = result.error.as_ref().filter(|e| e.is_kind(ErrorKind::Connection)) {
                warn!(
                    "Worker {}: session to {} lost, failing its remaining tasks",
                    self.index,
                    host.address()
                );
                lost = Some(err.detached());
            }
            self.record(host, results, result);
        }
    }

    async fn run_task(&self, conn: &dyn Connection, host: &Host, task: &Task) -> TaskResult {
        let started = Instant::now();
        let target = host.address();
        let fail = |err: GossError| TaskResult::failed(task.clone(), String::new(), err, started.elapsed());

        let sudo_password = if task.requires_sudo() {
            match host.sudo_password.as_deref() {
                Some(password) => Some(password),
                None => {
                    return fail(GossError::new(
                        ErrorKind::Validation,
                        "execute_privileged",
                        target,
                        "task requires sudo but the host has no privileged password",
                    ))
                }
            }
        } else {
            None
        };

        match &task.kind {
            TaskKind::Command { cmd, .. } => {
                let timeout = self.config.task_timeout();
                from_command(task.clone(), execute(conn, cmd, sudo_password, timeout).await)
            }
            TaskKind::Script {
                cmd, local, remote, ..
            } => {
                let req = match transfer_request(Direction::Upload, local, remote, OverwritePolicy::Always, &host.ip) {
                    Ok(req) => req,
                    Err(e) => return fail(e),
                };
                let budget = self.config.task_timeout();
                if let Err(e) = transfer_once(conn, &req, budget).await {
                    return fail(e);
                }
                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return fail(
                        GossError::timeout("execute_script", target)
                            .with_detail("timeout_secs", budget.as_secs()),
                    );
                }
                let mut out = execute(conn, cmd, sudo_password, remaining).await;
                out.duration = started.elapsed();
                from_command(task.clone(), out)
            }
            TaskKind::Upload { local, remote } => {
                self.run_transfer(conn, task, Direction::Upload, local, remote, &host.ip, started)
                    .await
            }
            TaskKind::Download { remote, local } => {
                self.run_transfer(conn, task, Direction::Download, local, remote, &host.ip, started)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        conn: &dyn Connection,
        task: &Task,
        direction: Direction,
        local: &str,
        remote: &str,
        ip: &str,
        started: Instant,
    ) -> TaskResult {
        let policy = self.config.file_transfer.overwrite_policy;
        let outcome = match transfer_request(direction, local, remote, policy, ip) {
            Ok(req) => {
                transfer(conn, &req, self.config.transfer_timeout(), &self.config.retry_config()).await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(_) => {
                let message = match direction {
                    Direction::Upload => "Upload successful",
                    Direction::Download => "Download successful",
                };
                TaskResult::succeeded(task.clone(), message.to_string(), started.elapsed())
            }
            Err(e) => TaskResult::failed(task.clone(), String::new(), e, started.elapsed()),
        }
    }

    fn record(&self, host: &Host, results: &mut Vec<TaskResult>, result: TaskResult) {
        self.counters.record(result.status);
        self.metrics.record_task(
            &result.task.task_type().to_string(),
            result.status,
            result.duration.as_secs_f64(),
        );

        let position = results.len() + 1;
        match (&result.status, &result.error) {
            (TaskStatus::Success, _) => info!(
                "Worker {}: task {} '{}' on {} completed in {:?}",
                self.index,
                position,
                result.task.description,
                host.address(),
                result.duration
            ),
            (TaskStatus::Skipped, _) => warn!(
                "Worker {}: task {} '{}' on {} skipped after an earlier failure",
                self.index,
                position,
                result.task.description,
                host.address()
            ),
            (TaskStatus::Failed, Some(err)) => error!(
                kind = %err.kind,
                details = ?err.details,
                "Worker {}: task {} '{}' on {} failed after {:?}: {}",
                self.index,
                position,
                result.task.description,
                host.address(),
                result.duration,
                err
            ),
            (TaskStatus::Failed, None) => error!(
                "Worker {}: task {} '{}' on {} failed",
                self.index,
                position,
                result.task.description,
                host.address()
            ),
        }
        results.push(result);
    }
}

async fn execute(
    conn: &dyn Connection,
    cmd: &str,
    sudo_password: Option<&str>,
    timeout: Duration,
) -> CommandOutput {
    match sudo_password {
        Some(password) => conn.execute_privileged(cmd, password, timeout).await,
        None => conn.execute(cmd, timeout).await,
    }
}

/// Render `local`/`remote` templates for this host
fn transfer_request(
    direction: Direction,
    local: &str,
    remote: &str,
    policy: OverwritePolicy,
    ip: &str,
) -> Result<TransferRequest> {
    Ok(TransferRequest {
        direction,
        local: path_template::render(local, ip)?,
        remote: path_template::render(remote, ip)?,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::fs::{CancelFlag, FileSystem};
    use crate::transport::{MockConnection, MockConnector};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn host(ip: &str, sudo: Option<&str>) -> Host {
        Host {
            ip: ip.to_string(),
            port: 22,
            user: "root".to_string(),
            password: "pw".to_string(),
            sudo_password: sudo.map(|s| s.to_string()),
        }
    }

    fn cmd(description: &str, cmd: &str, require_sudo: bool) -> Task {
        Task {
            description: description.to_string(),
            kind: TaskKind::Command {
                cmd: cmd.to_string(),
                require_sudo,
            },
        }
    }

    fn config(stop_on_error: bool, max_workers: usize) -> GossConfig {
        let mut config = GossConfig::default();
        config.execution.stop_on_error = stop_on_error;
        config.execution.max_workers = max_workers;
        config
    }

    fn dispatcher(connector: impl Connector + 'static, config: GossConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(connector), config, RunMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(|_| {
            let mut conn = MockConnection::new();
            conn.expect_execute()
                .times(2)
                .returning(|cmd, _| CommandOutput::success(format!("ran {}", cmd), Duration::from_millis(1)));
            conn.expect_close().times(1).returning(|| ());
            Ok(Box::new(conn))
        });

        let d = dispatcher(connector, config(false, 1));
        let report = d
            .run(
                vec![host("10.0.0.1", None)],
                vec![cmd("first", "uptime", false), cmd("second", "hostname", false)],
            )
            .await;

        assert_eq!(report.hosts.len(), 1);
        let results = &report.hosts[0].results;
        assert_eq!(results[0].output, "ran uptime");
        assert_eq!(results[1].output, "ran hostname");
        assert_eq!(report.summary.succeeded, 2);
        assert!(!report.has_failures());
        assert_eq!(d.metrics().tasks_with_status(TaskStatus::Success), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_every_task() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|h| {
            Err(GossError::connection("ssh_connect", h.address(), "refused").with_detail("port", 22))
        });

        let d = dispatcher(connector, config(false, 1));
        let report = d
            .run(
                vec![host("10.0.0.1", None)],
                vec![cmd("a", "true", false), cmd("b", "true", false)],
            )
            .await;

        let results = &report.hosts[0].results;
        assert_eq!(results.len(), 2);
        for result in results {
            assert_eq!(result.status, TaskStatus::Failed);
            let err = result.error.as_ref().unwrap();
            assert!(err.is_kind(ErrorKind::Connection));
            assert_eq!(err.message, CANNOT_PROCEED);
            assert_eq!(err.details["port"], serde_json::json!(22));
        }
        assert_eq!(report.summary.failed, 2);
        assert_eq!(d.metrics().connections_with_outcome(false), 1);
    }

    #[tokio::test]
    async fn test_stop_on_error_skips_rest() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|h| {
            let target = h.address();
            let mut conn = MockConnection::new();
            conn.expect_execute().times(1).returning(move |_, _| {
                CommandOutput::failure(
                    "boom".to_string(),
                    GossError::execution("execute_command", target.clone(), "command exited with status 1"),
                    Duration::from_millis(1),
                )
            });
            conn.expect_close().returning(|| ());
            Ok(Box::new(conn))
        });

        let d = dispatcher(connector, config(true, 1));
        let report = d
            .run(
                vec![host("10.0.0.1", None)],
                vec![cmd("a", "false", false), cmd("b", "true", false), cmd("c", "true", false)],
            )
            .await;

        let statuses: Vec<_> = report.hosts[0].results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Failed, TaskStatus::Skipped, TaskStatus::Skipped]);
        assert_eq!(report.hosts[0].results[0].output, "boom");
        assert_eq!(report.summary.skipped, 2);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_failure_without_stop_on_error_continues() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut conn = MockConnection::new();
            let mut calls = 0;
            conn.expect_execute().times(2).returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    CommandOutput::failure(
                        String::new(),
                        GossError::timeout("execute_command", "10.0.0.1:22"),
                        Duration::from_millis(1),
                    )
                } else {
                    CommandOutput::success("ok".to_string(), Duration::from_millis(1))
                }
            });
            conn.expect_close().returning(|| ());
            Ok(Box::new(conn))
        });

        let d = dispatcher(connector, config(false, 1));
        let report = d
            .run(
                vec![host("10.0.0.1", None)],
                vec![cmd("a", "sleep 999", false), cmd("b", "true", false)],
            )
            .await;

        let results = &report.hosts[0].results;
        assert!(results[0].error.as_ref().unwrap().is_kind(ErrorKind::Timeout));
        assert_eq!(results[1].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_sudo_routing_and_missing_password() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            let mut conn = MockConnection::new();
            conn.expect_execute().never();
            conn.expect_execute_privileged()
                .withf(|cmd, password, _| cmd.to_string() == "whoami" && password.to_string() == "rootpw")
                .returning(|_, _, _| CommandOutput::success("root".to_string(), Duration::from_millis(1)));
            conn.expect_close().returning(|| ());
            Ok(Box::new(conn))
        });

        let d = dispatcher(connector, config(false, 2));
        let report = d
            .run(
                vec![host("10.0.0.1", Some("rootpw")), host("10.0.0.2", None)],
                vec![cmd("who", "whoami", true)],
            )
            .await;

        assert_eq!(report.hosts[0].results[0].output, "root");
        let err = report.hosts[1].results[0].error.as_ref().unwrap();
        assert!(err.is_kind(ErrorKind::Validation));
    }

    /// Connection that sleeps per host so completion order differs from
    /// submission order, and panics on the command "panic".
    struct SlowConnection {
        delay: Duration,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for SlowConnection {
        async fn execute(&self, command: &str, _timeout: Duration) -> CommandOutput {
            tokio::time::sleep(self.delay).await;
            if command == "panic" {
                panic!("executor blew up");
            }
            CommandOutput::success(command.to_string(), self.delay)
        }

        async fn execute_privileged(&self, command: &str, _password: &str, timeout: Duration) -> CommandOutput {
            self.execute(command, timeout).await
        }

        async fn remote_fs(&self, _cancel: CancelFlag) -> Result<Box<dyn FileSystem>> {
            Err(GossError::resource("open_sftp", "", "no filesystem"))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SlowConnector {
        seen: Mutex<Vec<String>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>> {
            self.seen.lock().unwrap().push(host.ip.clone());
            let last_octet: u64 = host.ip.rsplit('.').next().unwrap().parse().unwrap();
            Ok(Box::new(SlowConnection {
                delay: Duration::from_millis(50 / last_octet),
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_results_sorted_by_submission_index() {
        let connector = SlowConnector::default();
        let d = dispatcher(connector, config(false, 4));
        let hosts = vec![
            host("10.0.0.1", None),
            host("10.0.0.2", None),
            host("10.0.0.5", None),
            host("10.0.0.10", None),
        ];
        let report = d.run(hosts, vec![cmd("echo", "hi", false)]).await;

        let ips: Vec<_> = report.hosts.iter().map(|s| s.host.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.5", "10.0.0.10"]);
        let indexes: Vec<_> = report.hosts.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_panic_is_contained_to_one_host() {
        let connector = SlowConnector::default();
        let closed = connector.closed.clone();
        let d = dispatcher(connector, config(false, 2));
        let tasks = vec![
            cmd("fine", "ok", false),
            cmd("explode", "panic", false),
            cmd("never reached", "ok", false),
        ];
        let report = d
            .run(vec![host("10.0.0.1", None), host("10.0.0.2", None)], tasks)
            .await;

        assert_eq!(report.hosts.len(), 2);
        for set in &report.hosts {
            assert_eq!(set.results.len(), 3);
            assert_eq!(set.results[0].status, TaskStatus::Success);
            for result in &set.results[1..] {
                let err = result.error.as_ref().unwrap();
                assert_eq!(err.operation, "host_worker");
                assert!(err.message.contains("executor blew up"));
            }
        }
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 4);
        assert_eq!(d.metrics().active_hosts(), 0);
        // Sessions of panicked loops are still closed
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lost_session_fails_remaining_tasks() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|h| {
            let target = h.address();
            let mut conn = MockConnection::new();
            conn.expect_execute().times(1).returning(move |_, _| {
                CommandOutput::failure(
                    String::new(),
                    GossError::new(ErrorKind::Connection, "execute_command", target.clone(), "session abandoned")
                        .with_detail("port", 22),
                    Duration::from_millis(1),
                )
            });
            conn.expect_remote_fs().never();
            conn.expect_close().times(1).returning(|| ());
            Ok(Box::new(conn))
        });

        let upload = Task {
            description: "push".to_string(),
            kind: TaskKind::Upload {
                local: "/tmp/a".to_string(),
                remote: "/tmp/".to_string(),
            },
        };
        let d = dispatcher(connector, config(false, 1));
        let report = d
            .run(
                vec![host("10.0.0.1", None)],
                vec![cmd("a", "uptime", false), cmd("b", "true", false), upload],
            )
            .await;

        let results = &report.hosts[0].results;
        assert_eq!(results.len(), 3);
        for result in &results[1..] {
            assert_eq!(result.status, TaskStatus::Failed);
            let err = result.error.as_ref().unwrap();
            assert!(err.is_kind(ErrorKind::Connection));
            assert_eq!(err.message, SESSION_LOST);
            assert_eq!(err.details["port"], serde_json::json!(22));
        }
        assert_eq!(report.summary.failed, 3);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let connector = MockConnector::new();
        let d = dispatcher(connector, config(false, 1));
        let report = d.run(Vec::new(), Vec::new()).await;
        assert!(report.hosts.is_empty());
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.throughput, 0.0);
    }

    struct CountingSink {
        rendered: Mutex<usize>,
    }

    impl ResultSink for CountingSink {
        fn render(&self, report: &RunReport) -> Result<()> {
            *self.rendered.lock().unwrap() += report.hosts.len();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_and_render() {
        let connector = SlowConnector::default();
        let d = dispatcher(connector, config(false, 1));
        let sink = CountingSink {
            rendered: Mutex::new(0),
        };
        let report = d
            .run_and_render(
                vec![host("10.0.0.1", None), host("10.0.0.2", None)],
                vec![cmd("echo", "hi", false)],
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(report.summary.total, 2);
        assert_eq!(*sink.rendered.lock().unwrap(), 2);
    }
}
