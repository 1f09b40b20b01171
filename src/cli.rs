use clap::{ArgAction, Parser, Subcommand};
use renderferry::config::Config;
use renderferry::observability::LogSettings;
use renderferry::orchestrator::Mode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "renderferry")]
#[command(about = "Fetches finished render output to this machine", version, long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level, overriding -v
    #[arg(
        long,
        global = true,
        value_name = "LEVEL",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    pub log_level: Option<String>,

    /// Also append logs to renderferry.log in this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            verbosity: self.verbose,
            level: self.log_level.clone(),
            dir: self.log_dir.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the download daemon until interrupted
    Download(DownloadArgs),

    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file (default: $RENDERFERRY_CONFIG or config/renderferry.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Default)]
pub struct DownloadArgs {
    /// Number of concurrent transfer workers
    #[arg(long, value_name = "N")]
    pub thread_count: Option<usize>,

    /// Write files here instead of each job's output directory
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub account: Option<String>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long)]
    pub location: Option<String>,

    /// Run a single worker
    #[arg(long, conflicts_with = "thread_count")]
    pub single: bool,

    /// Seconds between history table renderings
    #[arg(long, value_name = "SECS")]
    pub summary_interval: Option<u64>,

    /// Download every file of these jobs, then exit
    #[arg(long = "job-id", value_name = "ID", num_args = 1..)]
    pub job_ids: Vec<String>,

    /// Narrow --job-id to one task
    #[arg(long, value_name = "TASK", requires = "job_ids")]
    pub task_id: Option<String>,

    /// Configuration file (default: $RENDERFERRY_CONFIG or config/renderferry.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl DownloadArgs {
    /// Flags win over file and environment settings
    pub fn apply(&self, config: &mut Config) {
        if let Some(count) = self.thread_count {
            config.worker.thread_count = count;
        }
        if self.single {
            config.worker.thread_count = 1;
        }
        if let Some(output) = &self.output {
            config.worker.output_dir = Some(output.clone());
        }
        if let Some(account) = &self.account {
            config.filters.account = Some(account.clone());
        }
        if let Some(project) = &self.project {
            config.filters.project = Some(project.clone());
        }
        if let Some(location) = &self.location {
            config.filters.location = Some(location.clone());
        }
        if let Some(secs) = self.summary_interval {
            config.history.interval_secs = secs;
        }
    }

    pub fn mode(&self) -> Mode {
        if self.job_ids.is_empty() {
            Mode::Daemon
        } else {
            Mode::Jobs {
                job_ids: self.job_ids.clone(),
                task_id: self.task_id.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> DownloadArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Download(args) => args,
            Commands::Config(_) => panic!("expected download command"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "renderferry",
            "download",
            "--thread-count",
            "8",
            "--output",
            "/mnt/renders",
            "--project",
            "cental",
            "--summary-interval",
            "30",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.worker.thread_count, 8);
        assert_eq!(config.worker.output_dir, Some(PathBuf::from("/mnt/renders")));
        assert_eq!(config.filters.project.as_deref(), Some("cental"));
        assert_eq!(config.filters.account, None);
        assert_eq!(config.history.interval_secs, 30);
        assert_eq!(args.mode(), Mode::Daemon);
    }

    #[test]
    fn test_single_forces_one_worker() {
        let args = parse(&["renderferry", "download", "--single"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.worker.thread_count, 1);
    }

    #[test]
    fn test_job_mode() {
        let args = parse(&[
            "renderferry",
            "download",
            "--job-id",
            "00208",
            "00209",
            "--task-id",
            "010",
        ]);
        assert_eq!(
            args.mode(),
            Mode::Jobs {
                job_ids: vec!["00208".to_string(), "00209".to_string()],
                task_id: Some("010".to_string()),
            }
        );
    }

    #[test]
    fn test_task_requires_job() {
        assert!(Cli::try_parse_from(["renderferry", "download", "--task-id", "010"]).is_err());
    }

    #[test]
    fn test_log_flags() {
        let cli = Cli::try_parse_from([
            "renderferry",
            "download",
            "--log-dir",
            "/var/log/renderferry",
            "--log-level",
            "warn",
        ])
        .unwrap();
        let settings = cli.log_settings();
        assert_eq!(settings.dir, Some(PathBuf::from("/var/log/renderferry")));
        assert_eq!(settings.directive(), "warn");

        assert!(Cli::try_parse_from(["renderferry", "download", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn test_verbosity_is_global() {
        let cli = Cli::try_parse_from(["renderferry", "download", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
