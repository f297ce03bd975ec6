use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// JSON fleet file with scripts, apps and selection rules.
    pub fleet_file: PathBuf,
    pub log_level: String,
    /// Agents and controllers idle for longer than this are dropped.
    pub offline_after: Duration,
    pub sweep_interval: Duration,
    pub token_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("FLEET_LISTEN_ADDR is not a socket address")?;

        let fleet_file = std::env::var("FLEET_CONFIG_FILE")
            .unwrap_or_else(|_| "fleet.json".to_string())
            .into();

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            fleet_file,
            log_level,
            offline_after: secs_from_env("FLEET_OFFLINE_SECS", 120)?,
            sweep_interval: secs_from_env("FLEET_SWEEP_SECS", 10)?,
            token_ttl: secs_from_env("FLEET_TOKEN_TTL_SECS", 86_400)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            fleet_file: PathBuf::from("fleet.json"),
            log_level: "info".to_string(),
            offline_after: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
            token_ttl: Duration::from_secs(86_400),
        }
    }
}

fn secs_from_env(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => parse_secs(name, &raw),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a whole number of seconds, got '{raw}'"))?;
    if secs == 0 {
        anyhow::bail!("{name} must be at least 1 second");
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs("X", " 30 ").unwrap(), Duration::from_secs(30));
        assert!(parse_secs("X", "0").is_err());
        assert!(parse_secs("X", "soon").is_err());
    }
}
