//! Core data models for goss

use crate::error::GossError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// Input/output limits
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB
pub const MAX_HOST_FILE_SIZE: usize = 10_485_760; // 10 MB
pub const MAX_TASK_FILE_SIZE: usize = 1_048_576; // 1 MB

/// One remote target with its credentials
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub ip: String,
    pub port: u16,
    pub user: String,
    #[serde(skip)]
    pub password: String,
    #[serde(skip)]
    pub sudo_password: Option<String>,
}

impl Host {
    /// `ip:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field(
                "sudo_password",
                &self.sudo_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Task type tag as it appears in task files and on the command line
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Cmd,
    Script,
    Upload,
    Download,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Cmd => write!(f, "cmd"),
            TaskType::Script => write!(f, "script"),
            TaskType::Upload => write!(f, "upload"),
            TaskType::Download => write!(f, "download"),
        }
    }
}

impl FromStr for TaskType {
    type Err = GossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" => Ok(TaskType::Cmd),
            "script" => Ok(TaskType::Script),
            "upload" => Ok(TaskType::Upload),
            "download" => Ok(TaskType::Download),
            other => Err(GossError::validation(format!(
                "unknown task type '{}' (expected cmd, script, upload or download)",
                other
            ))),
        }
    }
}

/// Variant-specific task payload
///
/// `local`/`remote` may still contain path template placeholders; they are
/// rendered per host when the task runs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    #[serde(rename = "cmd")]
    Command { cmd: String, require_sudo: bool },
    /// Upload `local` to `remote`, then run `cmd`
    Script {
        cmd: String,
        local: String,
        remote: String,
        require_sudo: bool,
    },
    Upload { local: String, remote: String },
    Download { remote: String, local: String },
}

/// A validated unit of work, applied to every host
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Task {
    pub description: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self.kind {
            TaskKind::Command { .. } => TaskType::Cmd,
            TaskKind::Script { .. } => TaskType::Script,
            TaskKind::Upload { .. } => TaskType::Upload,
            TaskKind::Download { .. } => TaskType::Download,
        }
    }

    pub fn requires_sudo(&self) -> bool {
        match &self.kind {
            TaskKind::Command { require_sudo, .. } | TaskKind::Script { require_sudo, .. } => {
                *require_sudo
            }
            _ => false,
        }
    }

    /// Short human summary of what the task does
    pub fn info(&self) -> String {
        match &self.kind {
            TaskKind::Command { cmd, .. } => cmd.clone(),
            TaskKind::Script {
                cmd, local, remote, ..
            } => format!("{} -> {}; {}", local, remote, cmd),
            TaskKind::Upload { local, remote } => format!("{} -> {}", local, remote),
            TaskKind::Download { remote, local } => format!("{} <- {}", local, remote),
        }
    }
}

/// Terminal state of one (host, task) pair
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

fn serialize_duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of one task on one host
///
/// A failed result may still carry partial output captured before the error.
#[derive(Debug, Serialize)]
pub struct TaskResult {
    pub task: Task,
    pub status: TaskStatus,
    pub output: String,
    pub error: Option<GossError>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

impl TaskResult {
    pub fn succeeded(task: Task, output: String, duration: Duration) -> Self {
        Self {
            task,
            status: TaskStatus::Success,
            output,
            error: None,
            duration,
        }
    }

    pub fn failed(task: Task, output: String, error: GossError, duration: Duration) -> Self {
        Self {
            task,
            status: TaskStatus::Failed,
            output,
            error: Some(error),
            duration,
        }
    }

    pub fn skipped(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Skipped,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// All results for one host plus its submission index
#[derive(Debug, Serialize)]
pub struct HostTaskSet {
    pub index: usize,
    pub host: Host,
    pub results: Vec<TaskResult>,
}

impl HostTaskSet {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Aggregate statistics, computed once after all hosts finished
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_duration_ms")]
    pub elapsed: Duration,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tasks completed per second
    pub throughput: f64,
    #[serde(rename = "average_latency_ms", serialize_with = "serialize_duration_ms")]
    pub average_latency: Duration,
}

impl RunSummary {
    pub fn compute(elapsed: Duration, succeeded: usize, failed: usize, skipped: usize) -> Self {
        let total = succeeded + failed + skipped;
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { total as f64 / secs } else { 0.0 };
        let average_latency = if total > 0 {
            elapsed / total as u32
        } else {
            Duration::ZERO
        };

        Self {
            elapsed,
            total,
            succeeded,
            failed,
            skipped,
            throughput,
            average_latency,
        }
    }
}

/// Everything a run produced, ordered by host submission index
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub hosts: Vec<HostTaskSet>,
    pub summary: RunSummary,
}

impl RunReport {
    /// True when any task failed or was skipped
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0 || self.summary.skipped > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host {
            ip: "192.168.1.10".to_string(),
            port: 22,
            user: "root".to_string(),
            password: "hunter2".to_string(),
            sudo_password: Some("s3cret".to_string()),
        }
    }

    #[test]
    fn test_host_debug_redacts_passwords() {
        let debug = format!("{:?}", host());
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("192.168.1.10"));
    }

    #[test]
    fn test_host_address() {
        assert_eq!(host().address(), "192.168.1.10:22");
        let v6 = Host {
            ip: "fe80::1".to_string(),
            port: 2222,
            ..host()
        };
        assert_eq!(v6.address(), "[fe80::1]:2222");
    }

    #[test]
    fn test_host_serialize_skips_credentials() {
        let json = serde_json::to_string(&host()).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_task_type_from_str() {
        assert_eq!("cmd".parse::<TaskType>().unwrap(), TaskType::Cmd);
        assert_eq!("download".parse::<TaskType>().unwrap(), TaskType::Download);
        assert!("shell".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_task_serialize_tagged() {
        let task = Task {
            description: "uptime".to_string(),
            kind: TaskKind::Command {
                cmd: "uptime".to_string(),
                require_sudo: false,
            },
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "cmd");
        assert_eq!(value["description"], "uptime");
        assert_eq!(value["cmd"], "uptime");
    }

    #[test]
    fn test_requires_sudo_only_for_commands() {
        let upload = Task {
            description: "push".to_string(),
            kind: TaskKind::Upload {
                local: "a".to_string(),
                remote: "/tmp".to_string(),
            },
        };
        assert!(!upload.requires_sudo());
        assert_eq!(upload.task_type(), TaskType::Upload);
    }

    #[test]
    fn test_summary_handles_zero_tasks() {
        let summary = RunSummary::compute(Duration::ZERO, 0, 0, 0);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.throughput, 0.0);
        assert_eq!(summary.average_latency, Duration::ZERO);
    }

    #[test]
    fn test_summary_rates() {
        let summary = RunSummary::compute(Duration::from_secs(2), 3, 1, 0);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.throughput, 2.0);
        assert_eq!(summary.average_latency, Duration::from_millis(500));
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Success.to_string(), "success");
        assert_eq!(TaskStatus::Skipped.to_string(), "skipped");
    }
}
