use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    Upcloud,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Command line; every flag falls back to an environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "vmctl-controller", version, about = "Reconciles VM records against UpCloud")]
pub struct Args {
    /// Address for probes, admin status and the record API.
    #[arg(long = "http-addr", alias = "metrics-addr", env = "VMCTL_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    #[arg(long, env = "VMCTL_LEADER_ELECTION", default_value_t = false)]
    pub enable_leader_election: bool,

    #[arg(long, env = "VMCTL_LEADER_ELECTION_ID", default_value = "vm-controller")]
    pub leader_election_id: String,

    #[arg(long, value_enum, env = "VMCTL_STORE", default_value = "postgres")]
    pub store: StoreKind,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Optional command channel (CMD:RECONCILE / CMD:RESYNC).
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, value_enum, env = "PROVIDER", default_value = "upcloud")]
    pub provider: ProviderKind,

    #[arg(long, env = "UPCLOUD_API_URL", default_value = "https://api.upcloud.com/1.3")]
    pub upcloud_api_url: String,

    #[arg(long, env = "UPCLOUD_USERNAME")]
    pub upcloud_username: Option<String>,

    #[arg(long, env = "UPCLOUD_PASSWORD", hide_env_values = true)]
    pub upcloud_password: Option<String>,

    #[arg(long, env = "VMCTL_WORKERS", default_value_t = 2)]
    pub workers: usize,

    #[arg(long, env = "VMCTL_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Upper bound for waiting on a VM to reach `started`.
    #[arg(long, env = "VMCTL_WAIT_TIMEOUT_SECS", default_value_t = 600)]
    pub wait_timeout_secs: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, env = "VMCTL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid configuration: {}", .0.join("; "))]
pub struct ConfigError(pub Vec<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Memory,
    Postgres { database_url: String },
}

#[derive(Clone, PartialEq, Eq)]
pub enum ProviderSettings {
    Mock,
    UpCloud {
        api_url: String,
        username: String,
        password: String,
    },
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSettings::Mock => f.write_str("Mock"),
            ProviderSettings::UpCloud {
                api_url, username, ..
            } => f
                .debug_struct("UpCloud")
                .field("api_url", api_url)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_addr: SocketAddr,
    /// Election id when leader election is on.
    pub leader_election_id: Option<String>,
    pub store: StoreSettings,
    pub redis_url: Option<String>,
    pub provider: ProviderSettings,
    pub workers: usize,
    pub resync_interval: Duration,
    pub wait_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        if args.workers == 0 {
            problems.push("--workers must be at least 1".to_string());
        }
        if args.resync_interval_secs == 0 {
            problems.push("--resync-interval-secs must be positive".to_string());
        }
        if args.wait_timeout_secs == 0 {
            problems.push("--wait-timeout-secs must be positive".to_string());
        }

        let store = match args.store {
            StoreKind::Memory => StoreSettings::Memory,
            StoreKind::Postgres => match non_empty(args.database_url) {
                Some(database_url) => StoreSettings::Postgres { database_url },
                None => {
                    problems.push("DATABASE_URL is required for the postgres store".to_string());
                    StoreSettings::Memory
                }
            },
        };

        let provider = match args.provider {
            ProviderKind::Mock => ProviderSettings::Mock,
            ProviderKind::Upcloud => {
                let username = non_empty(args.upcloud_username);
                let password = non_empty(args.upcloud_password);
                if username.is_none() {
                    problems.push("UPCLOUD_USERNAME must be specified".to_string());
                }
                if password.is_none() {
                    problems.push("UPCLOUD_PASSWORD must be specified".to_string());
                }
                ProviderSettings::UpCloud {
                    api_url: args.upcloud_api_url.trim().to_string(),
                    username: username.unwrap_or_default(),
                    password: password.unwrap_or_default(),
                }
            }
        };

        if !problems.is_empty() {
            return Err(ConfigError(problems));
        }

        Ok(Settings {
            http_addr: args.http_addr,
            leader_election_id: args
                .enable_leader_election
                .then(|| args.leader_election_id.trim().to_string())
                .filter(|id| !id.is_empty()),
            store,
            redis_url: non_empty(args.redis_url),
            provider,
            workers: args.workers,
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            wait_timeout: Duration::from_secs(args.wait_timeout_secs),
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }
}
