//! CLI interface for goss

use crate::config::{load_config, GossConfig};
use crate::dispatcher::Dispatcher;
use crate::error::GossError;
use crate::logging::{init_logging, LogConfig};
use crate::metrics::RunMetrics;
use crate::models::{Host, Task};
use crate::parser::{parse_hosts_file, parse_tasks_file, validate_task_spec, TaskSpec};
use crate::path_template::TIME_FORMAT;
use crate::printer::{OutputFormat, Printer};
use crate::templates;
use crate::transport::SshConnector;
use crate::trust::{StdinPrompt, TrustStore};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// goss - run commands and move files across a fleet of hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "goss")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run commands and transfer files on many hosts over SSH", long_about = None)]
pub struct Cli {
    /// Run configuration file (missing file means defaults)
    #[arg(short, long, default_value = "goss_config.yaml", global = true)]
    pub config: PathBuf,

    /// Host list
    #[arg(short = 'i', long, default_value = "hosts.ini", global = true)]
    pub hosts: PathBuf,

    /// Result format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub save: OutputFormat,

    /// Directory for json/excel/csv result files
    #[arg(long, default_value = ".", global = true)]
    pub output_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Write Prometheus metrics here after the run
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every task of a task file on every host
    Apply {
        /// Path to the task YAML file
        #[arg(short, long, default_value = "tasks.yml")]
        file: PathBuf,
    },

    /// Run a single ad-hoc task on every host
    Exec {
        #[arg(short = 't', long = "type", value_enum, default_value = "cmd")]
        task_type: ExecType,

        /// Command for cmd/script tasks
        #[arg(long)]
        cmd: Option<String>,

        /// Local path for script/upload/download tasks
        #[arg(long)]
        local: Option<String>,

        /// Remote path for script/upload/download tasks
        #[arg(long)]
        remote: Option<String>,

        /// Run the command as root through su
        #[arg(long)]
        sudo: bool,
    },

    /// Check configuration, host list and task file without contacting hosts
    Validate {
        /// Path to the task YAML file
        #[arg(short, long, default_value = "tasks.yml")]
        file: PathBuf,
    },

    /// Write starter hosts.ini, tasks.yml and goss_config.yaml
    Init {
        /// Parent directory for the generated play-<timestamp> directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecType {
    Cmd,
    Script,
    Upload,
    Download,
}

impl ExecType {
    fn as_str(&self) -> &'static str {
        match self {
            ExecType::Cmd => "cmd",
            ExecType::Script => "script",
            ExecType::Upload => "upload",
            ExecType::Download => "download",
        }
    }
}

/// Build the single task of `goss exec`
pub fn build_exec_task(
    task_type: ExecType,
    cmd: Option<&str>,
    local: Option<&str>,
    remote: Option<&str>,
    sudo: bool,
    config: &GossConfig,
) -> crate::error::Result<Task> {
    let spec = TaskSpec {
        task_type: task_type.as_str().to_string(),
        description: format!("ad-hoc {}", task_type.as_str()),
        cmd: cmd.unwrap_or_default().to_string(),
        local: local.unwrap_or_default().to_string(),
        remote: remote.unwrap_or_default().to_string(),
        require_sudo: sudo,
    };
    validate_task_spec(1, spec, &config.file_transfer)
}

/// Create `<dir>/play-<timestamp>/` holding every starter file
pub fn write_starter_files(dir: &Path) -> anyhow::Result<PathBuf> {
    use std::fs::OpenOptions;
    use std::io::Write as _;

    let play_dir = dir.join(format!("play-{}", chrono::Local::now().format(TIME_FORMAT)));
    std::fs::create_dir_all(dir)?;
    std::fs::create_dir(&play_dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            anyhow::anyhow!("Directory '{}' already exists", play_dir.display())
        } else {
            e.into()
        }
    })?;

    for info in templates::list_templates() {
        let content = templates::get_template(info.name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template: {}", info.name))?;
        let path = play_dir.join(info.name);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(content.as_bytes())?;
    }
    Ok(play_dir)
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig::new(&self.log_level, &self.log_format))
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Apply { file } => {
                let config = self.load_config()?;
                let tasks = parse_tasks_file(file, &config.file_transfer)?;
                self.run_tasks(config, tasks).await?;
            }
            Commands::Exec {
                task_type,
                cmd,
                local,
                remote,
                sudo,
            } => {
                let config = self.load_config()?;
                let task = build_exec_task(
                    *task_type,
                    cmd.as_deref(),
                    local.as_deref(),
                    remote.as_deref(),
                    *sudo,
                    &config,
                )?;
                self.run_tasks(config, vec![task]).await?;
            }
            Commands::Validate { file } => {
                self.validate(file)?;
            }
            Commands::Init { dir } => {
                let play_dir = write_starter_files(dir)?;
                println!("Starter files written to {}", play_dir.display());
                for info in templates::list_templates() {
                    println!("  {:<18} {}", info.name, info.description);
                }
            }
        }
        Ok(())
    }

    fn load_config(&self) -> anyhow::Result<GossConfig> {
        info!("Loading configuration from {:?}", self.config);
        Ok(load_config(Some(self.config.as_path()))?)
    }

    fn load_hosts(&self, config: &GossConfig) -> anyhow::Result<Vec<Host>> {
        let hosts = parse_hosts_file(&self.hosts, config.connection.default_port)?;
        if hosts.is_empty() {
            return Err(GossError::configuration(format!(
                "host list '{}' contains no hosts",
                self.hosts.display()
            ))
            .into());
        }
        Ok(hosts)
    }

    async fn run_tasks(&self, config: GossConfig, tasks: Vec<Task>) -> anyhow::Result<()> {
        if tasks.is_empty() {
            return Err(GossError::configuration("no tasks to run").into());
        }
        let hosts = self.load_hosts(&config)?;

        let trust = Arc::new(TrustStore::open_default(Arc::new(StdinPrompt))?);
        let connector = Arc::new(SshConnector::new(
            trust,
            config.connection.security_mode,
            config.connect_timeout(),
        ));
        let dispatcher = Dispatcher::new(connector, config, RunMetrics::new()?);
        let printer = Printer::new(self.save, &self.output_dir);

        let report = dispatcher.run_and_render(hosts, tasks, &printer).await?;

        if let Some(path) = &self.metrics_file {
            dispatcher.metrics().write_to_file(path)?;
        }

        if report.has_failures() {
            error!(
                "Run {} finished with {} failed and {} skipped tasks",
                report.run_id, report.summary.failed, report.summary.skipped
            );
            std::process::exit(1);
        }
        info!("Run {} completed successfully", report.run_id);
        Ok(())
    }

    /// Parse and validate everything a run would need
    fn validate(&self, file: &Path) -> anyhow::Result<()> {
        let config = self.load_config()?;
        let hosts = self.load_hosts(&config)?;
        let tasks = parse_tasks_file(file, &config.file_transfer)?;
        if tasks.is_empty() {
            return Err(GossError::configuration(format!("task file '{}' contains no tasks", file.display())).into());
        }

        println!("Configuration is valid");
        println!(
            "Hosts: {} (max_workers={}, security_mode={})",
            hosts.len(),
            config.execution.max_workers,
            config.connection.security_mode
        );
        println!("Tasks: {}", tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            println!("  {:<3} {:<9} {} ({})", i + 1, task.task_type(), task.description, task.info());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;

    #[test]
    fn test_cli_apply_defaults() {
        let cli = Cli::parse_from(["goss", "apply"]);
        assert_eq!(cli.hosts, PathBuf::from("hosts.ini"));
        assert_eq!(cli.config, PathBuf::from("goss_config.yaml"));
        assert_eq!(cli.save, OutputFormat::Table);
        match cli.command {
            Commands::Apply { file } => assert_eq!(file, PathBuf::from("tasks.yml")),
            other => panic!("Expected Apply command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "goss",
            "exec",
            "--cmd",
            "uptime",
            "--save",
            "json",
            "--hosts",
            "prod.ini",
            "--metrics-file",
            "run.prom",
        ]);
        assert_eq!(cli.save, OutputFormat::Json);
        assert_eq!(cli.hosts, PathBuf::from("prod.ini"));
        assert_eq!(cli.metrics_file, Some(PathBuf::from("run.prom")));
        assert!(matches!(
            cli.command,
            Commands::Exec {
                task_type: ExecType::Cmd,
                sudo: false,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_exec_upload() {
        let cli = Cli::parse_from([
            "goss", "exec", "-t", "upload", "--local", "app.tar", "--remote", "/opt/",
        ]);
        if let Commands::Exec {
            task_type,
            local,
            remote,
            ..
        } = &cli.command
        {
            assert_eq!(*task_type, ExecType::Upload);
            assert_eq!(local.as_deref(), Some("app.tar"));
            assert_eq!(remote.as_deref(), Some("/opt/"));
        } else {
            panic!("Expected Exec command");
        }
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["goss", "--save", "xml", "apply"]).is_err());
    }

    #[test]
    fn test_build_exec_task() {
        let config = GossConfig::default();
        let task = build_exec_task(ExecType::Cmd, Some("id"), None, None, true, &config).unwrap();
        assert_eq!(
            task.kind,
            TaskKind::Command {
                cmd: "id".to_string(),
                require_sudo: true
            }
        );

        let task = build_exec_task(ExecType::Download, None, None, Some("/var/log/messages"), false, &config).unwrap();
        assert_eq!(
            task.kind,
            TaskKind::Download {
                remote: "/var/log/messages".to_string(),
                local: "./downloads/".to_string()
            }
        );

        let err = build_exec_task(ExecType::Cmd, None, None, None, false, &config).unwrap_err();
        assert!(err.message.contains("'cmd' is required"));
    }

    #[test]
    fn test_write_starter_files() {
        let dir = tempfile::tempdir().unwrap();
        let play = write_starter_files(dir.path()).unwrap();
        assert!(play.file_name().unwrap().to_str().unwrap().starts_with("play-"));
        for name in ["hosts.ini", "tasks.yml", "goss_config.yaml"] {
            assert!(play.join(name).is_file(), "{} missing", name);
        }
    }

    #[test]
    fn test_validate_command() {
        let dir = tempfile::tempdir().unwrap();
        let play = write_starter_files(dir.path()).unwrap();
        let cli = Cli::parse_from([
            "goss".to_string(),
            "--config".to_string(),
            play.join("goss_config.yaml").display().to_string(),
            "--hosts".to_string(),
            play.join("hosts.ini").display().to_string(),
            "validate".to_string(),
            "-f".to_string(),
            play.join("tasks.yml").display().to_string(),
        ]);
        if let Commands::Validate { file } = &cli.command {
            cli.validate(file).unwrap();
        } else {
            panic!("Expected Validate command");
        }
    }

    #[test]
    fn test_validate_rejects_empty_host_list() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts.ini");
        std::fs::write(&hosts, "# nobody here\n").unwrap();
        let tasks = dir.path().join("tasks.yml");
        std::fs::write(&tasks, "tasks:\n  - type: cmd\n    description: x\n    cmd: id\n").unwrap();

        let cli = Cli::parse_from([
            "goss".to_string(),
            "--config".to_string(),
            dir.path().join("missing.yaml").display().to_string(),
            "--hosts".to_string(),
            hosts.display().to_string(),
            "validate".to_string(),
        ]);
        let err = cli.validate(&tasks).unwrap_err();
        assert!(err.to_string().contains("contains no hosts"));
    }
}
