//! Starter files written by `goss init`.

/// One starter file.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// File name inside the generated play directory.
    pub name: &'static str,
    /// Short description shown after generation.
    pub description: &'static str,
}

/// Returns metadata for every starter file.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "hosts.ini",
            description: "Host list: host[:port], user, password, sudo password",
        },
        TemplateInfo {
            name: "tasks.yml",
            description: "Task list covering cmd, script, upload and download",
        },
        TemplateInfo {
            name: "goss_config.yaml",
            description: "Run configuration with every default spelled out",
        },
    ]
}

/// Returns the content of a starter file by name.
pub fn get_template(name: &str) -> Option<&'static str> {
    match name {
        "hosts.ini" => Some(TEMPLATE_HOSTS),
        "tasks.yml" => Some(TEMPLATE_TASKS),
        "goss_config.yaml" => Some(TEMPLATE_CONFIG),
        _ => None,
    }
}

const TEMPLATE_HOSTS: &str = r#"# goss host list
# host[:port], user, password, sudo password (may be empty)
# IPv6 with a port: [fd00::10]:2222
192.168.1.10, root, changeme,
192.168.1.11:2222, deploy, changeme, rootpass
"#;

const TEMPLATE_TASKS: &str = r#"# goss task list
# local/remote paths accept {{ .IP }} (target host) and {{ .TIME }} (YYYYMMDD_HHMMSS)
tasks:
  - type: cmd
    description: "Show uptime"
    cmd: "uptime"

  - type: cmd
    description: "Check disk usage as root"
    cmd: "df -h /"
    require_sudo: true

  - type: script
    description: "Run the bootstrap script"
    local: "./scripts/bootstrap.sh"
    remote: "/tmp/bootstrap.sh"
    cmd: "sh /tmp/bootstrap.sh"

  - type: upload
    description: "Push application config"
    local: "./files/app.conf"
    remote: "/etc/app/"

  - type: download
    description: "Collect syslog"
    remote: "/var/log/syslog"
    local: "./downloads/{{ .IP }}/syslog-{{ .TIME }}"
"#;

const TEMPLATE_CONFIG: &str = r#"# goss run configuration
# Any key can be overridden from the environment, e.g. GOSS_EXECUTION__MAX_WORKERS=8
connection:
  default_port: 22
  connect_timeout: 3        # seconds
  security_mode: interactive  # permissive | interactive | strict

execution:
  max_workers: 1
  task_timeout: 120         # seconds
  stop_on_error: false

file_transfer:
  default_upload_dir: "/tmp"
  default_download_dir: "./downloads/"
  overwrite_policy: always  # always | never
  transfer_timeout: 1800    # seconds, per attempt
  retries: 3
  retry_backoff_ms: 500
"#;
