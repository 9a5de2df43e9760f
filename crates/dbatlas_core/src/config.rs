use crate::handle::PoolSettings;
use crate::params::{ConnectionParams, Dialect};
use crate::DbError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Limits and timeouts for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Ceiling on registered connections, the default one included.
    pub max_connections: usize,

    /// Non-default connections idle for longer are closed by the sweeper.
    pub idle_ttl_secs: u64,

    /// Connections per pooled handle.
    pub pool_max_size: u32,

    pub acquire_timeout_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_ttl_secs: 30 * 60,
            pool_max_size: 5,
            acquire_timeout_secs: 10,
        }
    }
}

impl ManagerSettings {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_max_size.max(1),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AtlasConfig {
    #[serde(default)]
    pub manager: ManagerSettings,

    /// Connection installed as the process default at startup.
    #[serde(default)]
    pub default_connection: Option<ConnectionParams>,
}

impl AtlasConfig {
    /// Overlays `DBATLAS_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), DbError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlays `DBATLAS_*` variables read through `lookup`.
    ///
    /// `DBATLAS_DB_DIALECT`, `DBATLAS_DB_HOST` and `DBATLAS_DB_USER` together
    /// replace the default connection; the other `DBATLAS_DB_*` variables
    /// fill in its optional fields.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), DbError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = var("DBATLAS_MAX_CONNECTIONS") {
            self.manager.max_connections = parse_number("DBATLAS_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = var("DBATLAS_IDLE_TTL_SECS") {
            self.manager.idle_ttl_secs = parse_number("DBATLAS_IDLE_TTL_SECS", &raw)?;
        }

        let (Some(dialect), Some(host), Some(user)) = (
            var("DBATLAS_DB_DIALECT"),
            var("DBATLAS_DB_HOST"),
            var("DBATLAS_DB_USER"),
        ) else {
            return Ok(());
        };

        let dialect: Dialect = dialect.parse()?;
        let mut params =
            ConnectionParams::new(dialect, host, user, var("DBATLAS_DB_NAME").unwrap_or_default());

        if let Some(port) = var("DBATLAS_DB_PORT") {
            params = params.with_port(parse_number("DBATLAS_DB_PORT", &port)?);
        }
        if let Some(password) = lookup("DBATLAS_DB_PASSWORD") {
            params = params.with_password(password);
        }
        if let Some(service) = var("DBATLAS_DB_SERVICE") {
            params = params.with_service_name(service);
        }
        if let Some(charset) = var("DBATLAS_DB_CHARSET") {
            params = params.with_legacy_charset(charset);
        }

        log::info!(
            "[CONFIG] Default connection from environment: {}",
            params.display_target_masked()
        );
        self.default_connection = Some(params);
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, DbError> {
    raw.trim()
        .parse()
        .map_err(|_| DbError::invalid_params(format!("{} must be a number, got '{}'", key, raw)))
}

pub struct AtlasConfigStore {
    path: PathBuf,
}

impl AtlasConfigStore {
    pub fn new() -> Result<Self, DbError> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            DbError::IoError(std::io::Error::other("Could not find config directory"))
        })?;

        let app_dir = config_dir.join("dbatlas");
        fs::create_dir_all(&app_dir).map_err(DbError::IoError)?;

        Ok(Self {
            path: app_dir.join("config.json"),
        })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the file, or returns defaults when it does not exist.
    pub fn load(&self) -> Result<AtlasConfig, DbError> {
        if !self.path.exists() {
            return Ok(AtlasConfig::default());
        }

        let content = fs::read_to_string(&self.path).map_err(DbError::IoError)?;
        let config: AtlasConfig =
            serde_json::from_str(&content).map_err(|e| DbError::InvalidParams(e.to_string()))?;

        if let Some(params) = &config.default_connection {
            params.validate()?;
        }

        Ok(config)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
