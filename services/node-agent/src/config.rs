//! Command line and environment configuration for the node agent.
//!
//! Every option can also be given through a `FLEET_*` environment variable.
//! The parsed [`Cli`] is converted into plain config structs before anything
//! else sees it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

/// Fleet node agent - hosts Lua scripts and keeps them in sync with the
/// fleet server.
#[derive(Debug, Parser)]
#[command(name = "fleet-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding scripts, apps and the node identity.
    #[arg(long, global = true, env = "FLEET_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Fleet server URL.
    ///
    /// In agent mode this is the script endpoint itself; in run mode it is
    /// the server root.
    #[arg(long, global = true, env = "FLEET_SERVER_URL")]
    pub server_url: Option<String>,

    /// Seconds between update checks.
    #[arg(
        long,
        global = true,
        env = "FLEET_SCRIPT_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub script_interval: u64,

    /// Apps directory, relative to the working directory.
    #[arg(long, global = true, env = "FLEET_RELATIVE_APPS_DIR", default_value = "apps")]
    pub rel_apps_dir: String,

    /// File name of the accepted manifest inside the apps directory.
    #[arg(long, global = true, env = "FLEET_APPCONFIGS_FILENAME", default_value = "config.json")]
    pub appconfigs_filename: String,

    /// Agent-mode script file name inside the working directory.
    #[arg(long, global = true, env = "FLEET_SCRIPT_FILE_NAME", default_value = "agent.lua")]
    pub script_file_name: String,

    /// Release channel reported to the server.
    #[arg(long, global = true, env = "FLEET_CHANNEL")]
    pub channel: Option<String>,

    /// Seconds between metrics pushes.
    #[arg(
        long,
        global = true,
        env = "FLEET_METRICS_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub metrics_interval: u64,

    /// Seconds any single script call may run, including `stop`.
    #[arg(long, global = true, env = "FLEET_STOP_GRACE_SECS", default_value_t = 10)]
    pub stop_grace: u64,

    /// Append JSON logs to this file instead of stdout.
    #[arg(long, global = true, env = "FLEET_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, global = true, env = "FLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reconcile the node's applications against the server's manifest.
    Run,

    /// Supervise a single top-level script.
    Agent,

    /// Run a local script for a fixed time, then stop it.
    Test {
        /// Script to run.
        #[arg(long)]
        path: PathBuf,

        /// Seconds to run before stopping.
        #[arg(long, default_value_t = 10)]
        time: u64,
    },

    /// Show version.
    Version,
}

/// Agent mode settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub working_dir: PathBuf,
    pub server_url: String,
    pub script_path: PathBuf,
    pub check_interval: Duration,
    pub stop_grace: Duration,
    pub channel: Option<String>,
}

/// Run mode settings.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub working_dir: PathBuf,
    pub server_url: String,
    pub apps_dir: PathBuf,
    pub appconfigs_filename: String,
    pub check_interval: Duration,
    pub metrics_interval: Duration,
    pub stop_grace: Duration,
    pub channel: Option<String>,
}

/// Test mode settings.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub working_dir: PathBuf,
    pub script_path: PathBuf,
    pub run_for: Duration,
    pub stop_grace: Duration,
}

impl Cli {
    fn working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.clone()),
            _ => bail!("--working-dir (FLEET_WORKING_DIR) is required"),
        }
    }

    fn server_url(&self) -> Result<String> {
        match self.server_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => bail!("--server-url (FLEET_SERVER_URL) is required"),
        }
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace)
    }

    pub fn agent_config(&self) -> Result<AgentConfig> {
        let working_dir = self.working_dir()?;
        Ok(AgentConfig {
            script_path: working_dir.join(&self.script_file_name),
            working_dir,
            server_url: self.server_url()?,
            check_interval: Duration::from_secs(self.script_interval),
            stop_grace: self.stop_grace(),
            channel: self.channel.clone(),
        })
    }

    pub fn fleet_config(&self) -> Result<FleetConfig> {
        let working_dir = self.working_dir()?;
        Ok(FleetConfig {
            apps_dir: working_dir.join(&self.rel_apps_dir),
            working_dir,
            server_url: self.server_url()?,
            appconfigs_filename: self.appconfigs_filename.clone(),
            check_interval: Duration::from_secs(self.script_interval),
            metrics_interval: Duration::from_secs(self.metrics_interval),
            stop_grace: self.stop_grace(),
            channel: self.channel.clone(),
        })
    }

    /// Test mode falls back to the script's directory when no working
    /// directory is configured.
    pub fn test_config(&self) -> Result<TestConfig> {
        let Command::Test { path, time } = &self.command else {
            bail!("not a test command");
        };

        let working_dir = match self.working_dir() {
            Ok(dir) => dir,
            Err(_) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        Ok(TestConfig {
            working_dir,
            script_path: path.clone(),
            run_for: Duration::from_secs(*time),
            stop_grace: self.stop_grace(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fleet-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_fleet_config_joins_apps_dir() {
        let cli = parse(&[
            "run",
            "--working-dir",
            "/var/lib/fleet",
            "--server-url",
            "http://fleet.local",
        ]);
        let config = cli.fleet_config().unwrap();

        assert_eq!(config.apps_dir, PathBuf::from("/var/lib/fleet/apps"));
        assert_eq!(config.appconfigs_filename, "config.json");
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_agent_config_requires_server_url() {
        let cli = Cli::try_parse_from([
            "fleet-agent",
            "agent",
            "--working-dir",
            "/tmp/w",
            "--server-url",
            " ",
        ])
        .unwrap();
        assert!(cli.agent_config().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Cli::try_parse_from(["fleet-agent", "run", "--script-interval", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_test_mode_defaults_working_dir_to_script_dir() {
        let cli = Cli::try_parse_from([
            "fleet-agent",
            "test",
            "--path",
            "/opt/scripts/probe.lua",
            "--time",
            "3",
            "--working-dir",
            "",
        ])
        .unwrap();
        let config = cli.test_config().unwrap();

        assert_eq!(config.working_dir, PathBuf::from("/opt/scripts"));
        assert_eq!(config.run_for, Duration::from_secs(3));
    }
}
