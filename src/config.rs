//! Application configuration: a TOML file plus `--section.key` overrides.

use crate::services::database::{PgCredentials, PoolConfig};
use crate::services::ssh::{SshAuthMethod, SystemSsh, TunnelSpec, split_host_port};
use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command line. Every config key can be overridden as `--section.key`.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "pgtunnel", version)]
#[command(
    about = "Open an SSH tunnel to Postgres, run one statement, print the first column",
    long_about = None
)]
pub struct CliArgs {
    /// TOML config file [default: ./config.toml]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// SSH login
    #[arg(long = "ssh.user", value_name = "USER")]
    pub ssh_user: Option<String>,

    /// SSH server as host[:port]
    #[arg(long = "ssh.address", value_name = "HOST:PORT")]
    pub ssh_address: Option<String>,

    /// SSH password, delivered through askpass
    #[arg(long = "ssh.password", value_name = "PASSWORD")]
    pub ssh_password: Option<String>,

    /// Private key used instead of ssh-agent
    #[arg(long = "ssh.identity_file", value_name = "PATH")]
    pub ssh_identity_file: Option<String>,

    /// Passphrase for the private key
    #[arg(long = "ssh.passphrase", value_name = "PASSPHRASE")]
    pub ssh_passphrase: Option<String>,

    #[arg(long = "ssh.open_timeout_ms", value_name = "MS")]
    pub ssh_open_timeout_ms: Option<u64>,

    /// Extra ssh arguments, whitespace separated
    #[arg(long = "ssh.extra_args", value_name = "ARGS", allow_hyphen_values = true)]
    pub ssh_extra_args: Option<String>,

    /// Postgres address as seen from the SSH server
    #[arg(long = "tunnel.remote_address", value_name = "HOST:PORT")]
    pub tunnel_remote_address: Option<String>,

    /// Local forward address; port 0 picks a free port
    #[arg(long = "tunnel.local_address", value_name = "HOST:PORT")]
    pub tunnel_local_address: Option<String>,

    #[arg(long = "tunnel.close_timeout_ms", value_name = "MS")]
    pub tunnel_close_timeout_ms: Option<u64>,

    /// Postgres login
    #[arg(long = "pg.user", value_name = "USER")]
    pub pg_user: Option<String>,

    #[arg(long = "pg.password", value_name = "PASSWORD")]
    pub pg_password: Option<String>,

    #[arg(long = "pg.database", value_name = "NAME")]
    pub pg_database: Option<String>,

    /// disable, allow, prefer, require, verify-ca or verify-full
    #[arg(long = "pg.ssl_mode", value_name = "MODE")]
    pub pg_ssl_mode: Option<String>,

    #[arg(long = "pg.max_idle", value_name = "N")]
    pub pg_max_idle: Option<u32>,

    #[arg(long = "pg.max_open", value_name = "N")]
    pub pg_max_open: Option<u32>,

    /// Statements slower than this are logged
    #[arg(long = "pg.slow_query_ms", value_name = "MS")]
    pub pg_slow_query_ms: Option<u64>,

    #[arg(long = "pg.idle_timeout_ms", value_name = "MS")]
    pub pg_idle_timeout_ms: Option<u64>,

    #[arg(long = "pg.acquire_timeout_ms", value_name = "MS")]
    pub pg_acquire_timeout_ms: Option<u64>,

    /// Statement to run
    #[arg(long = "pg.statement", value_name = "SQL")]
    pub pg_statement: Option<String>,
}

impl CliArgs {
    /// Overrides given on the command line, as dotted keys with TOML values.
    pub fn overrides(&self) -> Vec<(&'static str, toml::Value)> {
        let text = [
            ("ssh.user", &self.ssh_user),
            ("ssh.address", &self.ssh_address),
            ("ssh.password", &self.ssh_password),
            ("ssh.identity_file", &self.ssh_identity_file),
            ("ssh.passphrase", &self.ssh_passphrase),
            ("tunnel.remote_address", &self.tunnel_remote_address),
            ("tunnel.local_address", &self.tunnel_local_address),
            ("pg.user", &self.pg_user),
            ("pg.password", &self.pg_password),
            ("pg.database", &self.pg_database),
            ("pg.ssl_mode", &self.pg_ssl_mode),
            ("pg.statement", &self.pg_statement),
        ];
        let integers = [
            ("ssh.open_timeout_ms", self.ssh_open_timeout_ms),
            ("tunnel.close_timeout_ms", self.tunnel_close_timeout_ms),
            ("pg.max_idle", self.pg_max_idle.map(u64::from)),
            ("pg.max_open", self.pg_max_open.map(u64::from)),
            ("pg.slow_query_ms", self.pg_slow_query_ms),
            ("pg.idle_timeout_ms", self.pg_idle_timeout_ms),
            ("pg.acquire_timeout_ms", self.pg_acquire_timeout_ms),
        ];

        let mut overrides: Vec<_> = text
            .into_iter()
            .filter_map(|(key, value)| Some((key, toml::Value::String(value.clone()?))))
            .collect();
        overrides.extend(integers.into_iter().filter_map(|(key, value)| {
            Some((key, toml::Value::Integer(i64::try_from(value?).unwrap_or(i64::MAX))))
        }));
        if let Some(args) = &self.ssh_extra_args {
            let args = args
                .split_whitespace()
                .map(|arg| toml::Value::String(arg.to_string()))
                .collect();
            overrides.push(("ssh.extra_args", toml::Value::Array(args)));
        }
        overrides
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub user: String,
    /// `host[:port]`, port defaults to 22
    pub address: String,
    pub password: Option<String>,
    pub identity_file: Option<String>,
    pub passphrase: Option<String>,
    pub open_timeout_ms: u64,
    pub extra_args: Vec<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: String::new(),
            address: String::new(),
            password: None,
            identity_file: None,
            passphrase: None,
            open_timeout_ms: 15_000,
            extra_args: Vec::new(),
        }
    }
}

impl fmt::Debug for SshSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSection")
            .field("user", &self.user)
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("open_timeout_ms", &self.open_timeout_ms)
            .field("extra_args", &self.extra_args)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    pub remote_address: String,
    pub local_address: String,
    pub close_timeout_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            remote_address: "127.0.0.1:5432".to_string(),
            local_address: "127.0.0.1:25432".to_string(),
            close_timeout_ms: 3_000,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PgSection {
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub ssl_mode: String,
    pub max_idle: u32,
    pub max_open: u32,
    pub slow_query_ms: u64,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: Option<u64>,
    pub statement: String,
}

impl Default for PgSection {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            database: "mno_production".to_string(),
            ssl_mode: "disable".to_string(),
            max_idle: 1,
            max_open: 2,
            slow_query_ms: 20,
            idle_timeout_ms: 60_000,
            acquire_timeout_ms: None,
            statement: "select count(*) from users".to_string(),
        }
    }
}

impl fmt::Debug for PgSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSection")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_idle", &self.max_idle)
            .field("max_open", &self.max_open)
            .field("slow_query_ms", &self.slow_query_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("statement", &self.statement)
            .finish()
    }
}

/// Complete configuration, built once at startup and passed by value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub ssh: SshSection,
    pub tunnel: TunnelSection,
    pub pg: PgSection,
}

/// Load the config file (if any), apply overrides in order, and validate.
///
/// A missing default file is treated as empty; a missing explicit path is
/// an error.
pub fn load(
    path: Option<&Path>,
    overrides: &[(&str, toml::Value)],
) -> Result<AppConfig, ConfigError> {
    let mut table = match path {
        Some(path) => read_table(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => read_table(Path::new(DEFAULT_CONFIG_PATH))?,
        None => {
            tracing::debug!("No {} found, using defaults and overrides", DEFAULT_CONFIG_PATH);
            toml::Table::new()
        }
    };

    for (key, value) in overrides {
        apply_override(&mut table, key, value.clone())?;
    }

    let config: AppConfig = toml::Value::Table(table).try_into()?;
    config.validate()?;
    Ok(config)
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(content.parse::<toml::Table>()?)
}

fn apply_override(table: &mut toml::Table, key: &str, value: toml::Value) -> Result<(), ConfigError> {
    let Some((section, field)) = key.split_once('.') else {
        return Err(ConfigError::Invalid(format!("'{}' is not a section.key", key)));
    };
    match table
        .entry(section)
        .or_insert(toml::Value::Table(toml::Table::new()))
    {
        toml::Value::Table(section_table) => {
            section_table.insert(field.to_string(), value);
            Ok(())
        }
        _ => Err(ConfigError::Invalid(format!("'{}' must be a table", section))),
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("ssh.user", &self.ssh.user),
            ("ssh.address", &self.ssh.address),
            ("pg.user", &self.pg.user),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} is required", key)));
            }
        }

        for (key, address, default_port) in [
            ("ssh.address", &self.ssh.address, 22),
            ("tunnel.remote_address", &self.tunnel.remote_address, 5432),
            ("tunnel.local_address", &self.tunnel.local_address, 0),
        ] {
            split_host_port(address, default_port)
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))?;
        }

        if self.pg.max_open == 0 {
            return Err(ConfigError::Invalid("pg.max_open must be at least 1".into()));
        }

        Ok(())
    }

    /// Password first, then identity file, otherwise ssh-agent.
    pub fn auth_method(&self) -> SshAuthMethod {
        if let Some(password) = self.ssh.password.clone().filter(|p| !p.is_empty()) {
            return SshAuthMethod::Password(password);
        }
        match &self.ssh.identity_file {
            Some(path) if !path.is_empty() => SshAuthMethod::PublicKey {
                private_key_path: path.clone(),
                passphrase: self.ssh.passphrase.clone().filter(|p| !p.is_empty()),
            },
            _ => SshAuthMethod::Agent,
        }
    }

    pub fn tunnel_spec(&self) -> Result<TunnelSpec, ConfigError> {
        let invalid = |key: &str, e: String| ConfigError::Invalid(format!("{}: {}", key, e));

        let (ssh_host, ssh_port) =
            split_host_port(&self.ssh.address, 22).map_err(|e| invalid("ssh.address", e))?;
        let (remote_host, remote_port) = split_host_port(&self.tunnel.remote_address, 5432)
            .map_err(|e| invalid("tunnel.remote_address", e))?;
        let (local_host, local_port) = split_host_port(&self.tunnel.local_address, 0)
            .map_err(|e| invalid("tunnel.local_address", e))?;

        Ok(
            TunnelSpec::with_agent(ssh_host, ssh_port, &self.ssh.user, remote_host, remote_port)
                .with_auth(self.auth_method())
                .with_local_endpoint(local_host, local_port)
                .with_extra_args(self.ssh.extra_args.clone()),
        )
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle: self.pg.max_idle,
            max_open: self.pg.max_open,
            slow_query_threshold: Duration::from_millis(self.pg.slow_query_ms),
            idle_timeout: Duration::from_millis(self.pg.idle_timeout_ms),
            acquire_timeout: self.pg.acquire_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn pg_credentials(&self) -> PgCredentials {
        PgCredentials {
            user: self.pg.user.clone(),
            password: self.pg.password.clone().unwrap_or_default(),
            database: self.pg.database.clone(),
            ssl_mode: self.pg.ssl_mode.clone(),
        }
    }

    pub fn transport(&self) -> SystemSsh {
        SystemSsh::new().with_open_timeout(Duration::from_millis(self.ssh.open_timeout_ms))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.close_timeout_ms)
    }
}
