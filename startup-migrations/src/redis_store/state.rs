//! Applied-migration bookkeeping in Redis.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionLike;
use serde::{Deserialize, Serialize};

use crate::errors::{BackendError, MigrateError, MigrateResult};

/// Hash holding one field per applied migration id.
pub const MIGRATION_STATE_KEY: &str = "_startup_migrations:applied";

/// Applied migration record, stored as JSON in the state hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Migration id (e.g., "0001_create_users")
    pub id: String,
    pub applied_at: DateTime<Utc>,
    /// Script checksum at the time it was applied
    pub checksum: String,
    pub execution_time_ms: u64,
}

/// Reads and writes the applied-migration records.
pub struct MigrationState<'a, C> {
    conn: &'a mut C,
    key: &'a str,
}

impl<'a, C> MigrationState<'a, C>
where
    C: ConnectionLike + Send + Sync,
{
    pub fn new(conn: &'a mut C, key: &'a str) -> Self {
        Self { conn, key }
    }

    /// All applied migrations, ordered by id.
    pub async fn list_applied(&mut self) -> MigrateResult<Vec<AppliedMigration>> {
        let raw: HashMap<String, String> = self.conn.hgetall(self.key).await.map_err(backend_error)?;

        let mut applied = raw
            .into_iter()
            .map(|(id, json)| {
                serde_json::from_str::<AppliedMigration>(&json).map_err(|err| {
                    MigrateError::Backend(BackendError::fatal(format!("corrupt state record for '{id}': {err}")))
                })
            })
            .collect::<MigrateResult<Vec<_>>>()?;
        applied.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(applied)
    }

    pub async fn record_applied(&mut self, migration: &AppliedMigration) -> MigrateResult<()> {
        let json = serde_json::to_string(migration)
            .map_err(|err| MigrateError::Backend(BackendError::fatal(format!("failed to serialize record: {err}"))))?;

        let _: () = self.conn.hset(self.key, &migration.id, json).await.map_err(backend_error)?;
        Ok(())
    }
}

fn backend_error(err: redis::RedisError) -> MigrateError {
    MigrateError::Backend(err.into())
}
