//! Configuration Management
//!
//! Loads the connection, pool and security policy configuration.
//!
//! # Configuration Location
//! - Explicit path (`--config`), highest priority
//! - Global: `~/.config/sqlwarden/config.json`
//!
//! # Environment
//! - `password_env` names a variable holding the password, so the file never
//!   needs to contain it
//! - `SQLWARDEN_TABLE_WHITELIST`, `SQLWARDEN_MAX_ROWS`, `SQLWARDEN_DEFAULT_LIMIT`,
//!   `SQLWARDEN_CLOB_MAX_CHARS` and `SQLWARDEN_BLOB_MAX_BYTES` override the
//!   security policy
//!
//! # Example
//! ```json
//! {
//!   "connection": {
//!     "host": "db.internal",
//!     "port": 5432,
//!     "service_name": "appdb",
//!     "user": "agent_ro",
//!     "password_env": "SQLWARDEN_PASSWORD"
//!   },
//!   "pool": { "min": 1, "max": 4 },
//!   "security": { "table_whitelist": ["EMPLOYEES", "DEPARTMENTS"], "max_rows": 500 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClassifiedError, ErrorKind, Result};
use crate::policy::{parse_whitelist, SecurityPolicy};
use crate::pool::PoolOptions;

pub const ENV_TABLE_WHITELIST: &str = "SQLWARDEN_TABLE_WHITELIST";
pub const ENV_MAX_ROWS: &str = "SQLWARDEN_MAX_ROWS";
pub const ENV_DEFAULT_LIMIT: &str = "SQLWARDEN_DEFAULT_LIMIT";
pub const ENV_CLOB_MAX_CHARS: &str = "SQLWARDEN_CLOB_MAX_CHARS";
pub const ENV_BLOB_MAX_BYTES: &str = "SQLWARDEN_BLOB_MAX_BYTES";

/// Database connection parameters
///
/// Immutable once a pool has been created from it. The password is never
/// serialized and is redacted from `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Service (or database) name
    pub service_name: String,

    pub user: String,

    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable name for the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

const fn default_port() -> u16 {
    5432
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        service_name: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            service_name: service_name.into(),
            user: user.into(),
            password: Some(password.into()),
            password_env: None,
        }
    }

    /// `host:port/service`, safe to log
    #[must_use]
    pub fn descriptor(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.service_name)
    }

    /// Resolve `password_env` and check required fields
    pub fn resolve(mut self, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(var) = &self.password_env {
            match env(var) {
                Some(password) => self.password = Some(password),
                None => {
                    return Err(ClassifiedError::config(
                        ErrorKind::ConfigMissingField,
                        format!("Environment variable {var} not found for password"),
                    ));
                }
            }
        }

        for (field, value) in
            [("host", &self.host), ("service_name", &self.service_name), ("user", &self.user)]
        {
            if value.trim().is_empty() {
                return Err(ClassifiedError::config(
                    ErrorKind::ConfigMissingField,
                    format!("connection.{field} is required"),
                ));
            }
        }

        if self.password.is_none() {
            return Err(ClassifiedError::config(
                ErrorKind::ConfigMissingField,
                "connection.password or connection.password_env is required",
            ));
        }

        Ok(self)
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service_name", &self.service_name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .finish()
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub pool: PoolOptions,

    #[serde(default)]
    pub security: SecurityPolicy,
}

impl EngineConfig {
    /// Parse configuration JSON without resolving the environment
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| {
            let kind = if e.to_string().starts_with("missing field") {
                ErrorKind::ConfigMissingField
            } else {
                ErrorKind::ConfigParseError
            };
            ClassifiedError::config(kind, format!("Invalid config file format: {e}"))
        })
    }

    /// Apply environment lookups and validate the result
    pub fn resolve(mut self, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        self.connection = self.connection.resolve(&env)?;
        apply_policy_overrides(&mut self.security, &env)?;
        validate_policy(&self.security)?;
        self.pool.validate()?;
        Ok(self)
    }
}

/// Get path to the global config file (`~/.config/sqlwarden/config.json`)
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ClassifiedError::config(ErrorKind::ConfigFileNotFound, "Could not determine user config directory")
    })?;

    Ok(config_dir.join("sqlwarden").join("config.json"))
}

/// Load and resolve configuration from a file and the process environment
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        return Err(ClassifiedError::config(
            ErrorKind::ConfigFileNotFound,
            format!("Config file not found: {}", path.display()),
        )
        .with_suggestion("Pass --config <path> or create the default config file"));
    }

    let contents = fs::read_to_string(&path).map_err(|e| {
        ClassifiedError::config(ErrorKind::ConfigParseError, format!("Could not read config file: {e}"))
    })?;

    EngineConfig::from_json(&contents)?.resolve(|key| std::env::var(key).ok())
}

/// Apply the `SQLWARDEN_*` policy overrides found through `env`
pub fn apply_policy_overrides(policy: &mut SecurityPolicy, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(raw) = env(ENV_TABLE_WHITELIST) {
        policy.table_whitelist = parse_whitelist(&raw);
    }

    let numeric = |var: &str| -> Result<Option<usize>> {
        env(var)
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|_| {
                    ClassifiedError::config(
                        ErrorKind::ConfigInvalidValue,
                        format!("{var} must be a non-negative integer, got '{raw}'"),
                    )
                })
            })
            .transpose()
    };

    if let Some(n) = numeric(ENV_MAX_ROWS)? {
        policy.max_rows = n;
    }
    if let Some(n) = numeric(ENV_DEFAULT_LIMIT)? {
        policy.default_limit = n;
    }
    if let Some(n) = numeric(ENV_CLOB_MAX_CHARS)? {
        policy.clob_max_chars = n;
    }
    if let Some(n) = numeric(ENV_BLOB_MAX_BYTES)? {
        policy.blob_max_bytes = n;
    }

    Ok(())
}

fn validate_policy(policy: &SecurityPolicy) -> Result<()> {
    for (field, value) in [
        ("max_rows", policy.max_rows),
        ("default_limit", policy.default_limit),
        ("clob_max_chars", policy.clob_max_chars),
        ("blob_max_bytes", policy.blob_max_bytes),
    ] {
        if value == 0 {
            return Err(ClassifiedError::config(
                ErrorKind::ConfigInvalidValue,
                format!("security.{field} must be greater than zero"),
            ));
        }
    }
    Ok(())
}
