//! Parsers for the host list and the task list
//!
//! Both inputs are fully validated up front: a single malformed record fails
//! the whole parse, and the error names the offending line (hosts) or task
//! (tasks) so nothing is contacted on a half-valid inventory.

use crate::config::FileTransferConfig;
use crate::error::{GossError, Result};
use crate::models::*;
use crate::path_template;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Parse a host list file.
///
/// One record per line, four comma-separated fields:
/// `host[:port],user,password,sudo_password`. The last field may be empty.
/// Blank lines and lines starting with `#` are ignored.
///
/// # Arguments
///
/// * `path` - Path to the host list (usually `hosts.ini`)
/// * `default_port` - Port used when a record does not name one
///
/// # Errors
///
/// * `Resource` - If the file cannot be read
/// * `Validation` - If any record is malformed; the message carries the line number
///
/// # Example
///
/// ```no_run
/// use goss::parser::parse_hosts_file;
///
/// let hosts = parse_hosts_file("hosts.ini", 22)?;
/// println!("{} hosts", hosts.len());
/// # Ok::<(), goss::error::GossError>(())
/// ```
pub fn parse_hosts_file<P: AsRef<Path>>(path: P, default_port: u16) -> Result<Vec<Host>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        GossError::resource("parse_hosts", path.display().to_string(), "cannot read host list")
            .with_source(e)
    })?;
    parse_hosts(&content, default_port)
}

/// Parse host records from a string. See [`parse_hosts_file`].
pub fn parse_hosts(content: &str, default_port: u16) -> Result<Vec<Host>> {
    if content.len() > MAX_HOST_FILE_SIZE {
        return Err(GossError::validation(format!(
            "host list exceeds {} bytes",
            MAX_HOST_FILE_SIZE
        )));
    }

    let mut hosts = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        hosts.push(parse_host_line(line, line_no, default_port)?);
    }
    Ok(hosts)
}

fn parse_host_line(line: &str, line_no: usize, default_port: u16) -> Result<Host> {
    let bad = |reason: &str| {
        GossError::validation(format!("invalid host record at line {}: {}", line_no, reason))
            .with_detail("line", line_no)
    };

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(bad(&format!("expected 4 fields, found {}", fields.len())));
    }

    let (ip, port) = split_host_port(fields[0], default_port).map_err(|reason| bad(&reason))?;
    if ip.is_empty() {
        return Err(bad("host is empty"));
    }
    if fields[1].is_empty() {
        return Err(bad("user is empty"));
    }

    Ok(Host {
        ip,
        port,
        user: fields[1].to_string(),
        password: fields[2].to_string(),
        sudo_password: match fields[3] {
            "" => None,
            pw => Some(pw.to_string()),
        },
    })
}

/// Split `host`, `host:port` or `[v6addr]:port`; a bare IPv6 literal keeps the
/// default port.
fn split_host_port(field: &str, default_port: u16) -> std::result::Result<(String, u16), String> {
    let parse_port = |s: &str| match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}'", s)),
        Ok(p) => Ok(p),
    };

    if let Some(rest) = field.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated '[' in host".to_string())?;
        let port = match tail {
            "" => default_port,
            t => parse_port(
                t.strip_prefix(':')
                    .ok_or_else(|| format!("unexpected '{}' after ']'", t))?,
            )?,
        };
        return Ok((addr.to_string(), port));
    }

    match field.matches(':').count() {
        0 => Ok((field.to_string(), default_port)),
        1 => {
            let (addr, port) = field.split_once(':').unwrap_or((field, ""));
            Ok((addr.to_string(), parse_port(port)?))
        }
        _ => Ok((field.to_string(), default_port)),
    }
}

/// Raw task record as written in a task file, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub require_sudo: bool,
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// Parse and validate a task file (`tasks:` sequence).
///
/// # Errors
///
/// * `Resource` - If the file cannot be read
/// * `Configuration` - If the YAML is malformed
/// * `Validation` - If a task is missing a field its type requires
pub fn parse_tasks_file<P: AsRef<Path>>(path: P, transfer: &FileTransferConfig) -> Result<Vec<Task>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        GossError::resource("parse_tasks", path.display().to_string(), "cannot read task list")
            .with_source(e)
    })?;
    parse_tasks_yaml(&content, transfer)
}

/// Parse and validate tasks from a YAML string. See [`parse_tasks_file`].
///
/// # Example
///
/// ```
/// use goss::config::FileTransferConfig;
/// use goss::parser::parse_tasks_yaml;
///
/// let yaml = r#"
/// tasks:
///   - type: cmd
///     description: kernel version
///     cmd: uname -r
/// "#;
///
/// let tasks = parse_tasks_yaml(yaml, &FileTransferConfig::default())?;
/// assert_eq!(tasks.len(), 1);
/// # Ok::<(), goss::error::GossError>(())
/// ```
pub fn parse_tasks_yaml(content: &str, transfer: &FileTransferConfig) -> Result<Vec<Task>> {
    if content.len() > MAX_TASK_FILE_SIZE {
        return Err(GossError::validation(format!(
            "task file exceeds {} bytes",
            MAX_TASK_FILE_SIZE
        )));
    }

    let file: TaskFile = serde_yaml::from_str(content)?;
    file.tasks
        .into_iter()
        .enumerate()
        .map(|(i, spec)| validate_task_spec(i + 1, spec, transfer))
        .collect()
}

/// Turn one raw record into a [`Task`], filling documented defaults.
///
/// `index` is 1-based and only used in error messages.
pub fn validate_task_spec(index: usize, spec: TaskSpec, transfer: &FileTransferConfig) -> Result<Task> {
    let bad = |msg: String| {
        GossError::validation(format!("{} (task {})", msg, index)).with_detail("index", index)
    };

    for path in [&spec.local, &spec.remote] {
        if !path.is_empty() {
            path_template::render(path, "127.0.0.1")
                .map_err(|e| bad(format!("template rendering failed for '{}': {}", path, e.message)))?;
        }
    }

    if spec.description.trim().is_empty() {
        return Err(bad("the task description is mandatory".to_string()));
    }

    let task_type: TaskType = spec
        .task_type
        .parse()
        .map_err(|e: GossError| bad(e.message))?;

    if spec.require_sudo && matches!(task_type, TaskType::Upload | TaskType::Download) {
        warn!(
            "require_sudo has no effect on {} task {} ('{}')",
            task_type, index, spec.description
        );
    }

    let kind = match task_type {
        TaskType::Cmd => {
            if spec.cmd.trim().is_empty() {
                return Err(bad("'cmd' is required for a cmd task".to_string()));
            }
            TaskKind::Command {
                cmd: spec.cmd,
                require_sudo: spec.require_sudo,
            }
        }
        TaskType::Script => {
            if spec.cmd.trim().is_empty() {
                return Err(bad("'cmd' is required for a script task".to_string()));
            }
            if spec.local.is_empty() {
                return Err(bad("'local' is required for a script task".to_string()));
            }
            TaskKind::Script {
                cmd: spec.cmd,
                local: spec.local,
                remote: or_default(spec.remote, "remote", &transfer.default_upload_dir, index),
                require_sudo: spec.require_sudo,
            }
        }
        TaskType::Upload => {
            if spec.local.is_empty() {
                return Err(bad("'local' is required for an upload task".to_string()));
            }
            TaskKind::Upload {
                local: spec.local,
                remote: or_default(spec.remote, "remote", &transfer.default_upload_dir, index),
            }
        }
        TaskType::Download => {
            if spec.remote.is_empty() {
                return Err(bad("'remote' is required for a download task".to_string()));
            }
            TaskKind::Download {
                remote: spec.remote,
                local: or_default(spec.local, "local", &transfer.default_download_dir, index),
            }
        }
    };

    Ok(Task {
        description: spec.description,
        kind,
    })
}

fn or_default(value: String, field: &str, default: &str, index: usize) -> String {
    if value.is_empty() {
        warn!("'{}' of task {} is empty, using default {}", field, index, default);
        default.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn transfer() -> FileTransferConfig {
        FileTransferConfig::default()
    }

    #[test]
    fn test_parse_hosts_basic() {
        let content = "\
# web tier
192.168.1.10,root,pass1,sudo1

192.168.1.11:2222,admin,pass2,
[fe80::1]:2200,ops,pass3,
web01.example.com , deploy , pw ,
";
        let hosts = parse_hosts(content, 22).unwrap();
        assert_eq!(hosts.len(), 4);

        assert_eq!(hosts[0].ip, "192.168.1.10");
        assert_eq!(hosts[0].port, 22);
        assert_eq!(hosts[0].user, "root");
        assert_eq!(hosts[0].password, "pass1");
        assert_eq!(hosts[0].sudo_password.as_deref(), Some("sudo1"));

        assert_eq!(hosts[1].ip, "192.168.1.11");
        assert_eq!(hosts[1].port, 2222);
        assert_eq!(hosts[1].sudo_password, None);

        assert_eq!(hosts[2].ip, "fe80::1");
        assert_eq!(hosts[2].port, 2200);

        assert_eq!(hosts[3].ip, "web01.example.com");
        assert_eq!(hosts[3].user, "deploy");
    }

    #[test]
    fn test_parse_hosts_default_port() {
        let hosts = parse_hosts("10.0.0.1,root,pw,", 2022).unwrap();
        assert_eq!(hosts[0].port, 2022);
    }

    #[test]
    fn test_parse_hosts_wrong_field_count_names_line() {
        let content = "10.0.0.1,root,pw,\n\n10.0.0.2,root,pw\n";
        let err = parse_hosts(content, 22).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("line 3"));
        assert_eq!(err.details["line"], serde_json::json!(3));
    }

    #[test]
    fn test_parse_hosts_bad_port() {
        assert!(parse_hosts("10.0.0.1:abc,root,pw,", 22).is_err());
        assert!(parse_hosts("10.0.0.1:0,root,pw,", 22).is_err());
        assert!(parse_hosts("10.0.0.1:70000,root,pw,", 22).is_err());
    }

    #[test]
    fn test_parse_hosts_empty_user() {
        let result = parse_hosts("10.0.0.1,,pw,", 22);
        assert!(matches!(result, Err(ref e) if e.message.contains("user is empty")));
    }

    #[test]
    fn test_parse_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.ini");
        std::fs::write(&path, "10.0.0.1,root,pw,\n10.0.0.2,root,pw,\n").unwrap();
        assert_eq!(parse_hosts_file(&path, 22).unwrap().len(), 2);

        let missing = parse_hosts_file(dir.path().join("nope.ini"), 22);
        assert!(matches!(missing, Err(ref e) if e.is_kind(ErrorKind::Resource)));
    }

    #[test]
    fn test_parse_tasks_all_types() {
        let yaml = r#"
tasks:
  - type: cmd
    description: disk usage
    cmd: df -h
    require_sudo: true
  - type: script
    description: run installer
    cmd: bash /tmp/install.sh
    local: ./install.sh
  - type: upload
    description: push config
    local: ./app.conf
  - type: download
    description: fetch logs
    remote: /var/log/app.log
"#;
        let tasks = parse_tasks_yaml(yaml, &transfer()).unwrap();
        assert_eq!(tasks.len(), 4);

        assert_eq!(
            tasks[0].kind,
            TaskKind::Command {
                cmd: "df -h".to_string(),
                require_sudo: true
            }
        );
        assert!(matches!(&tasks[1].kind, TaskKind::Script { remote, .. } if remote == "/tmp"));
        assert!(matches!(&tasks[2].kind, TaskKind::Upload { remote, .. } if remote == "/tmp"));
        assert!(matches!(&tasks[3].kind, TaskKind::Download { local, .. } if local == "./downloads/"));
    }

    #[test]
    fn test_parse_tasks_uses_configured_defaults() {
        let mut cfg = transfer();
        cfg.default_upload_dir = "/opt/drop".to_string();
        let yaml = "tasks:\n  - type: upload\n    description: x\n    local: a.txt\n";
        let tasks = parse_tasks_yaml(yaml, &cfg).unwrap();
        assert!(matches!(&tasks[0].kind, TaskKind::Upload { remote, .. } if remote == "/opt/drop"));
    }

    #[test]
    fn test_missing_required_fields() {
        let cases = [
            "tasks:\n  - type: cmd\n    description: x\n",
            "tasks:\n  - type: script\n    description: x\n    cmd: ls\n",
            "tasks:\n  - type: upload\n    description: x\n",
            "tasks:\n  - type: download\n    description: x\n",
            "tasks:\n  - type: cmd\n    cmd: ls\n",
        ];
        for yaml in cases {
            let result = parse_tasks_yaml(yaml, &transfer());
            assert!(
                matches!(result, Err(ref e) if e.is_kind(ErrorKind::Validation)),
                "expected validation error for {:?}",
                yaml
            );
        }
    }

    #[test]
    fn test_error_names_task_index() {
        let yaml = r#"
tasks:
  - type: cmd
    description: ok
    cmd: ls
  - type: shell
    description: nope
    cmd: ls
"#;
        let err = parse_tasks_yaml(yaml, &transfer()).unwrap_err();
        assert!(err.message.contains("task 2"));
        assert!(err.message.contains("unknown task type"));
    }

    #[test]
    fn test_bad_template_rejected() {
        let yaml = "tasks:\n  - type: download\n    description: x\n    remote: /var/{{ .NOPE }}\n";
        let err = parse_tasks_yaml(yaml, &transfer()).unwrap_err();
        assert!(err.message.contains("template"));
    }

    #[test]
    fn test_templates_kept_unrendered() {
        let yaml = "tasks:\n  - type: download\n    description: x\n    remote: /var/log/a.log\n    local: ./logs/{{ .IP }}/\n";
        let tasks = parse_tasks_yaml(yaml, &transfer()).unwrap();
        assert!(matches!(&tasks[0].kind, TaskKind::Download { local, .. } if local == "./logs/{{ .IP }}/"));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = parse_tasks_yaml("tasks: [unclosed", &transfer());
        assert!(matches!(result, Err(ref e) if e.is_kind(ErrorKind::Configuration)));
    }
}
