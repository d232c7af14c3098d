//! Configuration manager for accounts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::account::repository::DEFAULT_LIMIT;
use crate::auth_method::AuthMethod;
use crate::authorization::Grant;
use crate::database::retry::RetryPolicy;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "ACCOUNTS_CONFIG";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Listening port.
    pub port: u16,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
    #[serde(skip_deserializing)]
    pub version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration. Accounts are kept in memory
    /// without it.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Auth methods loaded into the memory store at start.
    #[serde(skip_serializing)]
    pub auth_methods: Vec<AuthMethod>,
    #[serde(skip_serializing)]
    pub repository: Repository,
    #[serde(skip_serializing)]
    pub retry: Retry,
    /// Related to JsonWebToken configuration.
    #[serde(skip_serializing)]
    pub token: Option<Token>,
    #[serde(skip_serializing)]
    pub authorization: Authorization,
    #[serde(skip_serializing)]
    pub telemetry: Telemetry,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").to_owned(),
            port: 8080,
            timeout_secs: 10,
            version: VERSION.to_owned(),
            path: PathBuf::new(),
            postgres: None,
            auth_methods: Vec::new(),
            repository: Repository::default(),
            retry: Retry::default(),
            token: None,
            authorization: Authorization::default(),
            telemetry: Telemetry::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    /// List bound when the caller gives none.
    pub default_limit: usize,
}

impl Default for Repository {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
        }
    }
}

/// Transaction retry on store conflicts.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Retry {
    /// Total attempts, first one included.
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 10,
            max_delay_ms: 1000,
        }
    }
}

impl Retry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)),
        }
    }
}

/// Json Web Token configuration.
///
/// `public_key_pem` (ES256) wins over `secret` (HS256).
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Token {
    pub secret: Option<String>,
    pub public_key_pem: Option<String>,
    /// Required token audience.
    pub audience: Option<String>,
}

#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Authorization {
    pub grants: Vec<Grant>,
}

#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// OTLP collector receiving spans and logs.
    pub otlp_endpoint: Option<String>,
    /// Expose `GET /metrics`.
    pub prometheus: bool,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Path given by [`CONFIG_PATH_ENV`], if any.
    pub fn from_env(self) -> Self {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => self.path(PathBuf::from(path)),
            Err(_) => self,
        }
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Arc<Self> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(mut config) => {
                    config.version = VERSION.to_owned();
                    config.path = file_path;
                    Arc::new(config)
                },
                Err(err) => Arc::new(self.error(err)),
            },
            Err(err) => Arc::new(self.error(err)),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "cannot read `config.yaml`, using defaults");
        Self {
            path: self.path.clone(),
            ..Default::default()
        }
    }
}
