//! Read-only view of a platform workload, as reported by the workload directory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::BackupError;

/// Release environment key naming the database app attached to a workload.
/// Workloads without it (or with it empty) are not backed up.
pub const DATABASE_MARKER: &str = "FLYNN_POSTGRES";

/// A deployed application and the environment of its current release.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    /// Opaque application identifier.
    pub app_id: String,

    /// Human readable application name.
    pub name: String,

    /// Environment of the current release.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parameters needed to run a dump against a workload's database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConnection {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub port: Option<String>,
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl DatabaseConnection {
    /// Environment variables understood by `pg_dump` and libpq.
    pub fn env_vars(&self) -> Vec<(&'static str, &str)> {
        let mut vars = vec![
            ("PGHOST", self.host.as_str()),
            ("PGUSER", self.user.as_str()),
            ("PGPASSWORD", self.password.as_str()),
            ("PGDATABASE", self.database.as_str()),
        ];
        if let Some(port) = &self.port {
            vars.push(("PGPORT", port.as_str()));
        }
        vars
    }
}

impl Workload {
    /// True when the release carries a non-empty database marker.
    pub fn has_database(&self) -> bool {
        self.env
            .get(DATABASE_MARKER)
            .is_some_and(|value| !value.is_empty())
    }

    /// Resolve database connection parameters from the release environment.
    ///
    /// Every one of `PGHOST`, `PGUSER`, `PGPASSWORD` and `PGDATABASE` must be
    /// present and non-empty; `PGPORT` is optional.
    pub fn connection(&self) -> Result<DatabaseConnection, BackupError> {
        Ok(DatabaseConnection {
            host: self.required("PGHOST")?,
            user: self.required("PGUSER")?,
            password: self.required("PGPASSWORD")?,
            database: self.required("PGDATABASE")?,
            port: self.env.get("PGPORT").filter(|v| !v.is_empty()).cloned(),
        })
    }

    fn required(&self, key: &str) -> Result<String, BackupError> {
        self.env
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                BackupError::Configuration(format!(
                    "missing {key} in environment of app `{}`",
                    self.name
                ))
            })
    }
}
