use crate::binding::PlaceholderStyle;
use crate::error_formatter::mask_host;
use crate::DbError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Supported relational engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Mysql,
    Oracle,
}

/// How a dialect's catalog views spell unquoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    Lower,
    Upper,
}

impl IdentifierCase {
    pub fn apply(&self, ident: &str) -> String {
        match self {
            IdentifierCase::Lower => ident.to_lowercase(),
            IdentifierCase::Upper => ident.to_uppercase(),
        }
    }

    pub fn opposite(&self) -> IdentifierCase {
        match self {
            IdentifierCase::Lower => IdentifierCase::Upper,
            IdentifierCase::Upper => IdentifierCase::Lower,
        }
    }
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::Postgres, Dialect::Mysql, Dialect::Oracle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Oracle => "oracle",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "PostgreSQL",
            Dialect::Mysql => "MySQL",
            Dialect::Oracle => "Oracle",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::Mysql => 3306,
            Dialect::Oracle => 1521,
        }
    }

    pub fn identifier_case(&self) -> IdentifierCase {
        match self {
            Dialect::Postgres | Dialect::Mysql => IdentifierCase::Lower,
            Dialect::Oracle => IdentifierCase::Upper,
        }
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            Dialect::Postgres => PlaceholderStyle::Dollar,
            Dialect::Mysql => PlaceholderStyle::QuestionMark,
            Dialect::Oracle => PlaceholderStyle::Named,
        }
    }

    /// Quote an identifier (schema/table name).
    ///
    /// - PostgreSQL/Oracle: `"name"`
    /// - MySQL: `` `name` ``
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::Oracle => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "oracle" => Ok(Dialect::Oracle),
            other => Err(DbError::invalid_params(format!(
                "unsupported dialect '{}'",
                other
            ))),
        }
    }
}

/// Everything needed to open a pooled handle to one tenant database.
///
/// The password never leaves this struct in printable form: `Debug` redacts
/// it, there is no `Serialize`, and the display helpers only use the
/// identity fields.
#[derive(Debug, Deserialize)]
pub struct ConnectionParams {
    pub dialect: Dialect,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub user: String,
    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    #[serde(default)]
    pub database: String,
    /// Oracle service name; used instead of `database` when present.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Encoding label of text stored under a single-byte server charset.
    #[serde(default)]
    pub legacy_charset: Option<String>,
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

impl Clone for ConnectionParams {
    fn clone(&self) -> Self {
        Self {
            dialect: self.dialect,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: SecretString::from(self.password.expose_secret().to_owned()),
            database: self.database.clone(),
            service_name: self.service_name.clone(),
            legacy_charset: self.legacy_charset.clone(),
        }
    }
}

impl ConnectionParams {
    pub fn new(
        dialect: Dialect,
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            dialect,
            host: host.into(),
            port: dialect.default_port(),
            user: user.into(),
            password: empty_secret(),
            database: database.into(),
            service_name: None,
            legacy_charset: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = SecretString::from(password.into());
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_legacy_charset(mut self, charset: impl Into<String>) -> Self {
        self.legacy_charset = Some(charset.into());
        self
    }

    /// Port with the dialect default substituted for 0.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.dialect.default_port()
        } else {
            self.port
        }
    }

    /// Database name, falling back to the Oracle service name.
    pub fn database_or_service(&self) -> &str {
        if self.database.is_empty() {
            self.service_name.as_deref().unwrap_or_default()
        } else {
            &self.database
        }
    }

    /// Rejects parameters that can never produce a connection.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.host.trim().is_empty() {
            return Err(DbError::invalid_params("host is required"));
        }

        if self.user.trim().is_empty() {
            return Err(DbError::invalid_params("user is required"));
        }

        match self.dialect {
            Dialect::Postgres if self.database.trim().is_empty() => Err(
                DbError::invalid_params("database is required for PostgreSQL"),
            ),
            Dialect::Oracle if self.database_or_service().trim().is_empty() => Err(
                DbError::invalid_params("database or service name is required for Oracle"),
            ),
            _ => Ok(()),
        }
    }

    /// `dialect://user@host:port/database`, without credentials.
    pub fn display_target(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.dialect,
            self.user,
            self.host,
            self.effective_port(),
            self.database_or_service()
        )
    }

    /// Same as `display_target` with the host masked for external logs.
    pub fn display_target_masked(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.dialect,
            self.user,
            mask_host(&self.host),
            self.effective_port(),
            self.database_or_service()
        )
    }
}

/// Deterministic identity of a connection target.
///
/// Derived from dialect, host, port, database and user. The password is not
/// part of the identity, so re-registering with a corrected password reuses
/// the existing entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

const DEFAULT_CONNECTION_ID: &str = "default";

impl ConnectionId {
    pub fn from_params(params: &ConnectionParams) -> Self {
        let identity = format!(
            "{}|{}|{}|{}|{}",
            params.dialect,
            params.host.trim().to_lowercase(),
            params.effective_port(),
            params.database_or_service(),
            params.user
        );

        let digest = Sha256::digest(identity.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(16);
        Self(id)
    }

    /// The reserved identity of the configuration-sourced connection.
    pub fn default_id() -> Self {
        Self(DEFAULT_CONNECTION_ID.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_CONNECTION_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
