use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_reconcile::{DEFAULT_MAX_CREATE_PER_PASS, DEFAULT_MAX_DELETE_PER_PASS, DEFAULT_RESYNC_INTERVAL};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Host port range handed out to instances.
    pub min_port: u16,
    pub max_port: u16,

    /// Count only nodes labelled as game-server nodes toward port capacity.
    pub game_server_nodes_only: bool,

    pub max_create_per_pass: usize,
    pub max_delete_per_pass: usize,

    pub allocation_attempts: usize,
    pub allocation_timeout: Duration,

    pub reconcile_workers: usize,
    pub pass_timeout: Duration,
    pub resync_interval: Duration,

    /// Nodes registered in the in-process store at startup.
    pub dev_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            log_level: "info".to_string(),
            min_port: 10000,
            max_port: 12000,
            game_server_nodes_only: false,
            max_create_per_pass: DEFAULT_MAX_CREATE_PER_PASS,
            max_delete_per_pass: DEFAULT_MAX_DELETE_PER_PASS,
            allocation_attempts: 3,
            allocation_timeout: Duration::from_secs(5),
            reconcile_workers: 4,
            pass_timeout: Duration::from_secs(10),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            dev_nodes: 1,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Result<Duration> {
    let ms = env_or(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = env_or("FLEET_LISTEN_ADDR", defaults.listen_addr)?;
        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let game_server_nodes_only = std::env::var("FLEET_GAME_SERVER_NODES_ONLY")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let config = Self {
            listen_addr,
            log_level,
            min_port: env_or("FLEET_MIN_PORT", defaults.min_port)?,
            max_port: env_or("FLEET_MAX_PORT", defaults.max_port)?,
            game_server_nodes_only,
            max_create_per_pass: env_or("FLEET_MAX_CREATE_PER_PASS", defaults.max_create_per_pass)?,
            max_delete_per_pass: env_or("FLEET_MAX_DELETE_PER_PASS", defaults.max_delete_per_pass)?,
            allocation_attempts: env_or("FLEET_ALLOCATION_ATTEMPTS", defaults.allocation_attempts)?,
            allocation_timeout: env_duration_ms("FLEET_ALLOCATION_TIMEOUT_MS", defaults.allocation_timeout)?,
            reconcile_workers: env_or("FLEET_RECONCILE_WORKERS", defaults.reconcile_workers)?,
            pass_timeout: env_duration_ms("FLEET_PASS_TIMEOUT_MS", defaults.pass_timeout)?,
            resync_interval: env_duration_ms("FLEET_RESYNC_INTERVAL_MS", defaults.resync_interval)?,
            dev_nodes: env_or("FLEET_DEV_NODES", defaults.dev_nodes)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the operator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            bail!(
                "FLEET_MIN_PORT ({}) must not exceed FLEET_MAX_PORT ({})",
                self.min_port,
                self.max_port
            );
        }
        if self.allocation_attempts == 0 {
            bail!("FLEET_ALLOCATION_ATTEMPTS must be at least 1");
        }
        if self.reconcile_workers == 0 {
            bail!("FLEET_RECONCILE_WORKERS must be at least 1");
        }
        if self.max_create_per_pass == 0 || self.max_delete_per_pass == 0 {
            bail!("per-pass create and delete limits must be at least 1");
        }
        Ok(())
    }
}
