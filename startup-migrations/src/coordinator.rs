//! Single-runner coordination across sibling worker processes.
//!
//! Every sibling calls [`SingleRunnerCoordinator::migrate`] at startup. The first
//! one to take the host lock becomes the runner: it connects, computes the pending
//! set and applies it, then releases the lock. Everyone else becomes a waiter: it
//! polls the lock until the runner lets go and then returns without touching the
//! database, trusting the runner to have done the work.
//!
//! A waiter cannot tell whether the runner succeeded. If the runner's apply
//! failed, only the runner's caller sees the error.

use std::path::Path;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::Instant;

use crate::backend::{ConnectionOpener, ConnectionTarget, DatabaseBackend};
use crate::engine::{MigrationEngine, MigrationReport};
use crate::errors::{MigrateError, MigrateResult};
use crate::lock::{LockFile, LockGuard, LockNaming, ParentProcessLockName};
use crate::retry::RetryPolicy;

/// Default interval between two lock polls while waiting on the runner.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a `migrate` call ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// This process held the lock and ran the migrations.
    Ran(MigrationReport),
    /// Another process was running; this one waited for it to release the lock.
    Waited { polls: u32, waited: Duration },
}

impl Outcome {
    pub fn is_runner(&self) -> bool {
        matches!(self, Outcome::Ran(_))
    }
}

enum Role<'a> {
    Runner(LockGuard<'a>),
    Waiter,
}

pub struct SingleRunnerCoordinator<B, E, N = ParentProcessLockName> {
    backend: B,
    engine: E,
    naming: N,
    retry: RetryPolicy,
    poll_interval: Duration,
    wait_timeout: Option<Duration>,
}

impl<B, E> SingleRunnerCoordinator<B, E, ParentProcessLockName>
where
    B: DatabaseBackend,
    E: MigrationEngine<B::Handle>,
{
    pub fn new(backend: B, engine: E) -> Self {
        Self {
            backend,
            engine,
            naming: ParentProcessLockName::new(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: None,
        }
    }
}

impl<B, E, N> SingleRunnerCoordinator<B, E, N>
where
    B: DatabaseBackend,
    E: MigrationEngine<B::Handle>,
    N: LockNaming,
{
    /// Swap the lock naming strategy.
    pub fn with_naming<M: LockNaming>(self, naming: M) -> SingleRunnerCoordinator<B, E, M> {
        SingleRunnerCoordinator {
            backend: self.backend,
            engine: self.engine,
            naming,
            retry: self.retry,
            poll_interval: self.poll_interval,
            wait_timeout: self.wait_timeout,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bound the waiter's wait. `None` waits for as long as the runner takes.
    pub fn with_wait_timeout(mut self, wait_timeout: Option<Duration>) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the migrations from `source` against `target`, unless a sibling
    /// process is already doing it, in which case wait for it to finish.
    pub async fn migrate(&self, target: &ConnectionTarget, source: &Path) -> MigrateResult<Outcome> {
        let lock = LockFile::open(self.naming.lock_path())?;

        match Self::elect(&lock)? {
            Role::Runner(guard) => {
                info!("acquired {}, running migrations from {}", guard.path().display(), source.display());
                let result = self.run(target, source).await;
                let released = guard.release();

                let report = match result {
                    Ok(report) => report,
                    Err(err) => {
                        if let Err(release_err) = released {
                            error!("failed to release migration lock after failed run: {release_err}");
                        }
                        return Err(err);
                    }
                };
                released?;

                info!(
                    "applied {} migration(s), {} already applied, in {}ms",
                    report.applied.len(),
                    report.skipped,
                    report.total_time_ms
                );
                Ok(Outcome::Ran(report))
            }
            Role::Waiter => {
                info!("another process holds {}, waiting for it to finish", lock.path().display());
                self.wait(&lock).await
            }
        }
    }

    fn elect(lock: &LockFile) -> MigrateResult<Role<'_>> {
        Ok(match lock.try_acquire()? {
            Some(guard) => Role::Runner(guard),
            None => Role::Waiter,
        })
    }

    async fn run(&self, target: &ConnectionTarget, source: &Path) -> MigrateResult<MigrationReport> {
        let mut handle = ConnectionOpener::new(&self.backend, self.retry).open(target).await?;

        let scripts = self.engine.read_migrations(source)?;
        let found = scripts.len();
        debug!("found {found} migration script(s)");

        let pending = self.engine.to_apply(&mut handle, scripts).await?;
        let skipped = found.saturating_sub(pending.len());
        debug!("{} migration(s) pending", pending.len());

        let mut report = self.engine.apply(&mut handle, pending).await?;
        report.skipped = skipped;
        Ok(report)
    }

    /// Poll until the runner releases the lock. The lock is never held between polls.
    async fn wait(&self, lock: &LockFile) -> MigrateResult<Outcome> {
        let started = Instant::now();
        let mut polls = 0;

        loop {
            if let Some(timeout) = self.wait_timeout
                && started.elapsed() >= timeout
            {
                return Err(MigrateError::WaitTimeout {
                    waited: started.elapsed(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
            polls += 1;

            if let Some(guard) = lock.try_acquire()? {
                guard.release()?;
                let waited = started.elapsed();
                info!("runner released {} after {waited:?}, continuing", lock.path().display());
                return Ok(Outcome::Waited { polls, waited });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MigrationScript;
    use crate::errors::BackendError;
    use crate::lock::FixedLockName;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingBackend {
        opens: AtomicU32,
        unreachable: bool,
    }

    impl DatabaseBackend for CountingBackend {
        type Handle = ();

        async fn open(&self, _target: &ConnectionTarget) -> Result<(), BackendError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                Err(BackendError::transient("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    /// Engine over a fixed script list that remembers what it applied.
    #[derive(Default)]
    struct MemoryEngine {
        scripts: Vec<&'static str>,
        applied: Mutex<Vec<String>>,
        apply_calls: Mutex<Vec<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl MemoryEngine {
        fn with_scripts(scripts: &[&'static str]) -> Self {
            Self {
                scripts: scripts.to_vec(),
                ..Default::default()
            }
        }
    }

    impl MigrationEngine<()> for MemoryEngine {
        fn read_migrations(&self, source: &Path) -> MigrateResult<Vec<MigrationScript>> {
            Ok(self
                .scripts
                .iter()
                .map(|id| MigrationScript::new(*id, source.join(id), format!("-- {id}")))
                .collect())
        }

        async fn to_apply(&self, _handle: &mut (), scripts: Vec<MigrationScript>) -> MigrateResult<Vec<MigrationScript>> {
            let applied = self.applied.lock().unwrap().clone();
            Ok(scripts.into_iter().filter(|s| !applied.contains(&s.id)).collect())
        }

        async fn apply(&self, _handle: &mut (), pending: Vec<MigrationScript>) -> MigrateResult<MigrationReport> {
            let ids: Vec<String> = pending.iter().map(|s| s.id.clone()).collect();
            self.apply_calls.lock().unwrap().push(ids.clone());

            for id in &ids {
                if self.fail_on == Some(id.as_str()) {
                    return Err(MigrateError::MigrationApply {
                        id: id.clone(),
                        message: "syntax error".to_string(),
                    });
                }
                self.applied.lock().unwrap().push(id.clone());
            }

            Ok(MigrationReport {
                applied: ids,
                ..Default::default()
            })
        }
    }

    fn coordinator(
        dir: &TempDir,
        backend: CountingBackend,
        engine: MemoryEngine,
    ) -> SingleRunnerCoordinator<CountingBackend, MemoryEngine, FixedLockName> {
        SingleRunnerCoordinator::new(backend, engine)
            .with_naming(FixedLockName(dir.path().join("migrations.lock.test")))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_lone_process_runs_and_releases() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, CountingBackend::default(), MemoryEngine::with_scripts(&["0001", "0002"]));

        let outcome = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap();

        match outcome {
            Outcome::Ran(report) => assert_eq!(report.applied, ["0001", "0002"]),
            other => panic!("expected runner outcome, got {other:?}"),
        }
        assert_eq!(coordinator.backend().opens.load(Ordering::SeqCst), 1);

        let lock = LockFile::open(dir.path().join("migrations.lock.test")).unwrap();
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_run_applies_empty_pending_set() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, CountingBackend::default(), MemoryEngine::with_scripts(&["0001"]));
        let target = ConnectionTarget::new("redis://db");

        coordinator.migrate(&target, dir.path()).await.unwrap();
        let second = coordinator.migrate(&target, dir.path()).await.unwrap();

        assert_eq!(
            second,
            Outcome::Ran(MigrationReport {
                applied: Vec::new(),
                skipped: 1,
                total_time_ms: 0,
            })
        );
        let calls = coordinator.engine().apply_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![vec!["0001".to_string()], Vec::new()]);
    }

    #[tokio::test]
    async fn test_skipped_ignores_records_without_a_script() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::with_scripts(&["0002", "0003"]);
        engine.applied.lock().unwrap().extend(["0001".to_string(), "0002".to_string()]);
        let coordinator = coordinator(&dir, CountingBackend::default(), engine);

        let outcome = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap();

        match outcome {
            Outcome::Ran(report) => {
                assert_eq!(report.applied, ["0003"]);
                assert_eq!(report.skipped, 1);
            }
            other => panic!("expected runner outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_failure_propagates_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine {
            fail_on: Some("0002"),
            ..MemoryEngine::with_scripts(&["0001", "0002"])
        };
        let coordinator = coordinator(&dir, CountingBackend::default(), engine);

        let err = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap_err();

        assert!(matches!(err, MigrateError::MigrationApply { ref id, .. } if id == "0002"));
        let lock = LockFile::open(dir.path().join("migrations.lock.test")).unwrap();
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_database_exhausts_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let backend = CountingBackend {
            unreachable: true,
            ..Default::default()
        };
        let coordinator = coordinator(&dir, backend, MemoryEngine::with_scripts(&["0001"]));

        let err = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap_err();

        assert!(matches!(err, MigrateError::ConnectionExhausted { attempts: 10, .. }));
        assert_eq!(coordinator.backend().opens.load(Ordering::SeqCst), 10);
        assert!(coordinator.engine().apply_calls.lock().unwrap().is_empty());
        let lock = LockFile::open(dir.path().join("migrations.lock.test")).unwrap();
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_returns_only_after_release_without_migrating() {
        let dir = TempDir::new().unwrap();
        let holder = LockFile::open(dir.path().join("migrations.lock.test")).unwrap();
        let guard = holder.try_acquire().unwrap().expect("holder acquires");

        let coordinator = coordinator(&dir, CountingBackend::default(), MemoryEngine::with_scripts(&["0001"]));
        let target = ConnectionTarget::new("redis://db");
        let waiting = coordinator.migrate(&target, dir.path());
        tokio::pin!(waiting);

        tokio::select! {
            _ = &mut waiting => panic!("waiter finished while the lock was held"),
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        guard.release().unwrap();
        let outcome = waiting.await.unwrap();

        assert!(matches!(outcome, Outcome::Waited { polls, .. } if polls > 1));
        assert_eq!(coordinator.backend().opens.load(Ordering::SeqCst), 0);
        assert!(coordinator.engine().apply_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out_when_runner_never_finishes() {
        let dir = TempDir::new().unwrap();
        let holder = LockFile::open(dir.path().join("migrations.lock.test")).unwrap();
        let _guard = holder.try_acquire().unwrap().expect("holder acquires");

        let coordinator = coordinator(&dir, CountingBackend::default(), MemoryEngine::with_scripts(&["0001"]))
            .with_wait_timeout(Some(Duration::from_secs(2)));

        let err = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap_err();

        assert!(matches!(err, MigrateError::WaitTimeout { waited } if waited >= Duration::from_secs(2)));
        assert_eq!(coordinator.backend().opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unusable_lock_location_is_fatal() {
        let dir = TempDir::new().unwrap();
        let coordinator = SingleRunnerCoordinator::new(CountingBackend::default(), MemoryEngine::default())
            .with_naming(FixedLockName(dir.path().join("missing").join("migrations.lock")));

        let err = coordinator.migrate(&"redis://db".into(), dir.path()).await.unwrap_err();

        assert!(matches!(err, MigrateError::LockUnavailable { .. }));
        assert_eq!(coordinator.backend().opens.load(Ordering::SeqCst), 0);
    }
}
