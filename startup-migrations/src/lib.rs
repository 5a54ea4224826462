//! Startup migrations for worker pools.
//!
//! Workers forked from one parent usually all call `migrate` as they boot. This
//! crate makes exactly one of them apply the pending migrations while the rest
//! block until it is done, using an advisory lock file named after the parent
//! process id. Connecting tolerates a database that is still starting up.
//!
//! ```no_run
//! # async fn boot() -> Result<(), startup_migrations::MigrateError> {
//! startup_migrations::migrate("redis://127.0.0.1/", "migrations").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod redis_store;
pub mod retry;

use std::path::Path;

pub use backend::{ConnectionOpener, ConnectionTarget, DatabaseBackend};
pub use config::MigrateConfig;
pub use coordinator::{Outcome, SingleRunnerCoordinator};
pub use engine::{MigrationEngine, MigrationReport, MigrationScript};
pub use errors::{BackendError, MigrateError, MigrateResult};
pub use lock::{FixedLockName, LockFile, LockGuard, LockNaming, ParentProcessLockName};
pub use redis_store::{RedisBackend, RedisMigrationEngine};
pub use retry::RetryPolicy;

/// Apply the Lua migrations in `migrations_dir` to the Redis database at `target`,
/// coordinating with sibling worker processes. Uses the default retry policy and
/// waits for a running sibling for as long as it takes.
pub async fn migrate(target: impl Into<ConnectionTarget>, migrations_dir: impl AsRef<Path>) -> MigrateResult<Outcome> {
    SingleRunnerCoordinator::new(RedisBackend, RedisMigrationEngine::default())
        .migrate(&target.into(), migrations_dir.as_ref())
        .await
}

/// Same as [`migrate`], with every knob taken from `config`.
pub async fn migrate_with_config(config: &MigrateConfig) -> MigrateResult<Outcome> {
    let target = config.database_target()?;

    coordinator_from_config(config)
        .migrate(&target, &config.migrations.dir)
        .await
}

/// Redis coordinator configured from `config`.
pub fn coordinator_from_config(
    config: &MigrateConfig,
) -> SingleRunnerCoordinator<RedisBackend, RedisMigrationEngine, ParentProcessLockName> {
    SingleRunnerCoordinator::new(RedisBackend, RedisMigrationEngine::default())
        .with_naming(config.lock_naming())
        .with_retry(config.retry_policy())
        .with_poll_interval(config.poll_interval())
        .with_wait_timeout(config.wait_timeout())
}
