//! Database connection seam and the retrying connection opener.

use std::fmt;
use std::future::Future;

use log::{debug, warn};
use url::Url;

use crate::errors::{BackendError, MigrateError, MigrateResult};
use crate::retry::{RetryError, RetryPolicy};

/// Opaque, immutable connection descriptor supplied by the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget(String);

impl ConnectionTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form of the target that is safe to log: any password is masked.
    pub fn redacted(&self) -> String {
        match Url::parse(&self.0) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.0.clone(),
        }
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionTarget").field(&self.redacted()).finish()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl From<&str> for ConnectionTarget {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionTarget {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Something that can open a connection to the database being migrated.
pub trait DatabaseBackend {
    type Handle;

    /// Open a connection. Failures the server may recover from on its own
    /// (not listening yet, refusing connections) must be reported as transient.
    fn open(&self, target: &ConnectionTarget) -> impl Future<Output = Result<Self::Handle, BackendError>> + Send;
}

/// Opens a backend connection, absorbing transient failures up to the retry budget.
pub struct ConnectionOpener<'a, B> {
    backend: &'a B,
    policy: RetryPolicy,
}

impl<'a, B> ConnectionOpener<'a, B>
where
    B: DatabaseBackend,
{
    pub fn new(backend: &'a B, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub async fn open(&self, target: &ConnectionTarget) -> MigrateResult<B::Handle> {
        if target.as_str().trim().is_empty() {
            return Err(MigrateError::InvalidTarget {
                message: "connection target is empty".to_string(),
            });
        }

        let max_attempts = self.policy.max_attempts;
        let result = self
            .policy
            .run(
                |attempt| async move {
                    debug!("opening connection to {target} (attempt {attempt}/{max_attempts})");
                    let opened = self.backend.open(target).await;
                    if let Err(err) = &opened
                        && err.is_transient()
                    {
                        warn!("database not reachable yet (attempt {attempt}/{max_attempts}): {err}");
                    }
                    opened
                },
                BackendError::is_transient,
            )
            .await;

        match result {
            Ok(handle) => Ok(handle),
            Err(RetryError::Aborted(err)) => Err(MigrateError::Backend(err)),
            Err(RetryError::Exhausted { attempts, last }) => Err(MigrateError::ConnectionExhausted {
                attempts,
                last_error: last,
            }),
        }
    }
}
