//! Redis implementation of the backend and migration engine.
//!
//! Migrations are `*.lua` files, run with `EVAL` in file-name order. Each
//! successfully applied script is recorded in the state hash, which is what
//! `to_apply` consults on the next run.

mod state;

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use log::{info, warn};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::backend::{ConnectionTarget, DatabaseBackend};
use crate::engine::{MigrationEngine, MigrationReport, MigrationScript, discover_scripts};
use crate::errors::{BackendError, MigrateError, MigrateResult};

pub use state::{AppliedMigration, MIGRATION_STATE_KEY, MigrationState};

/// Extension of migration script files.
pub const SCRIPT_EXTENSION: &str = "lua";

/// Opens `ConnectionManager`s. Connection refusals, I/O errors, timeouts and a
/// server still loading its dataset are transient; a malformed URL is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisBackend;

impl DatabaseBackend for RedisBackend {
    type Handle = ConnectionManager;

    async fn open(&self, target: &ConnectionTarget) -> Result<ConnectionManager, BackendError> {
        let client = redis::Client::open(target.as_str()).map_err(|err| BackendError::fatal(err.to_string()))?;
        // Retries belong to the ConnectionOpener policy, not to the manager.
        let config = ConnectionManagerConfig::new().set_number_of_retries(0);
        let mut conn = ConnectionManager::new_with_config(client, config).await?;
        // A server that is still loading accepts TCP but answers `-LOADING`.
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }
}

/// Whether a script has been applied, as reported by `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStatus {
    pub script: MigrationScript,
    pub applied: Option<AppliedMigration>,
}

impl ScriptStatus {
    /// Applied, but the file changed since.
    pub fn is_modified(&self) -> bool {
        self.applied
            .as_ref()
            .map(|record| record.checksum != self.script.checksum)
            .unwrap_or(false)
    }
}

/// Lua-script migration engine with state kept in a Redis hash.
#[derive(Debug, Clone)]
pub struct RedisMigrationEngine {
    state_key: String,
}

impl Default for RedisMigrationEngine {
    fn default() -> Self {
        Self::new(MIGRATION_STATE_KEY)
    }
}

impl RedisMigrationEngine {
    pub fn new(state_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
        }
    }

    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Pair every script with its applied record, if any. Read-only.
    pub async fn status(&self, conn: &mut ConnectionManager, scripts: Vec<MigrationScript>) -> MigrateResult<Vec<ScriptStatus>> {
        let mut applied: HashMap<String, AppliedMigration> = MigrationState::new(conn, &self.state_key)
            .list_applied()
            .await?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        Ok(scripts
            .into_iter()
            .map(|script| ScriptStatus {
                applied: applied.remove(&script.id),
                script,
            })
            .collect())
    }
}

impl MigrationEngine<ConnectionManager> for RedisMigrationEngine {
    fn read_migrations(&self, source: &Path) -> MigrateResult<Vec<MigrationScript>> {
        discover_scripts(source, SCRIPT_EXTENSION)
    }

    async fn to_apply(&self, conn: &mut ConnectionManager, scripts: Vec<MigrationScript>) -> MigrateResult<Vec<MigrationScript>> {
        let statuses = self.status(conn, scripts).await?;
        let mut pending = Vec::new();

        for status in statuses {
            if status.is_modified() {
                warn!(
                    "migration '{}' changed after it was applied; it will not be re-run",
                    status.script.id
                );
            }
            if status.applied.is_none() {
                pending.push(status.script);
            }
        }

        Ok(pending)
    }

    async fn apply(&self, conn: &mut ConnectionManager, pending: Vec<MigrationScript>) -> MigrateResult<MigrationReport> {
        let started = Instant::now();
        let mut report = MigrationReport::default();

        for script in pending {
            let script_started = Instant::now();
            info!("applying {}", script.id);

            let _: redis::Value = redis::Script::new(&script.body)
                .invoke_async(conn)
                .await
                .map_err(|err| MigrateError::MigrationApply {
                    id: script.id.clone(),
                    message: err.to_string(),
                })?;

            let record = AppliedMigration {
                id: script.id.clone(),
                applied_at: Utc::now(),
                checksum: script.checksum.clone(),
                execution_time_ms: script_started.elapsed().as_millis() as u64,
            };
            MigrationState::new(conn, &self.state_key)
                .record_applied(&record)
                .await
                .map_err(|err| unrecorded(&script.id, err))?;

            info!("applied {} in {}ms", script.id, record.execution_time_ms);
            report.applied.push(script.id);
        }

        report.total_time_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

/// A script ran but its record was not written; the next run would apply it again.
fn unrecorded(id: &str, err: MigrateError) -> MigrateError {
    MigrateError::MigrationApply {
        id: id.to_string(),
        message: format!("applied but not recorded: {err}"),
    }
}
