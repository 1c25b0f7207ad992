//! Store connection parameters.

use serde::{Deserialize, Serialize};
use std::fmt;

use hm_common::DatabaseKind;

use crate::error::ConfigError;
use crate::validate::{into_result, ValidationError};

pub const ENV_HOST: &str = "POSTGRES_HOST";
pub const ENV_PORT: &str = "POSTGRES_PORT";
pub const ENV_USER: &str = "POSTGRES_USER";
pub const ENV_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const ENV_DATABASE: &str = "HM_DATABASE";

/// Connection settings (`[store]` table of the config file).
///
/// When `database` is unset the instrument's kind (`tem`/`sem`) names it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub application_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: None,
            application_name: "HealthMonitor".to_string(),
        }
    }
}

impl StoreConfig {
    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (testable form of `apply_env`).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port.trim().parse().map_err(|_| {
                ConfigError::Invalid(vec![ValidationError::new(
                    ENV_PORT,
                    format!("not a port number: {port}"),
                )])
            })?;
        }
        if let Some(user) = lookup(ENV_USER) {
            self.user = user;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = Some(password);
        }
        if let Some(database) = lookup(ENV_DATABASE) {
            self.database = Some(database);
        }
        Ok(())
    }

    /// Password, required before any connection attempt.
    pub fn password(&self) -> crate::Result<&str> {
        self.password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPassword)
    }

    /// Database to connect to for an instrument of the given kind.
    pub fn database_for(&self, kind: DatabaseKind) -> String {
        self.database
            .clone()
            .unwrap_or_else(|| kind.as_str().to_string())
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.host.trim().is_empty() {
            errors.push(ValidationError::new("store.host", "must not be empty"));
        }
        if self.port == 0 {
            errors.push(ValidationError::new("store.port", "must not be 0"));
        }
        if self.user.trim().is_empty() {
            errors.push(ValidationError::new("store.user", "must not be empty"));
        }
        errors
    }

    pub fn validate(&self) -> crate::Result<()> {
        into_result(self.validation_errors())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .finish()
    }
}
