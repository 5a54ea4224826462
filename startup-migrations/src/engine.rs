//! Migration engine seam and script discovery.

use std::future::Future;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{MigrateError, MigrateResult};

/// A single versioned migration script read from the migrations source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// File stem, e.g. "0001_create_users". Scripts run in id order.
    pub id: String,
    pub path: PathBuf,
    pub body: String,
    pub checksum: String,
}

impl MigrationScript {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            id: id.into(),
            path: path.into(),
            checksum: calculate_checksum(&body),
            body,
        }
    }
}

/// Summary of one `apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ids applied by this call, in order.
    pub applied: Vec<String>,
    /// Scripts found in the source that were already applied. Filled in by
    /// the coordinator, which sees both the scripts and the pending subset.
    pub skipped: usize,
    pub total_time_ms: u64,
}

/// Reads migration scripts, works out which are pending and applies them.
///
/// `H` is the connection handle produced by the matching
/// [`DatabaseBackend`](crate::backend::DatabaseBackend).
pub trait MigrationEngine<H> {
    /// Ordered scripts found in `source`.
    fn read_migrations(&self, source: &Path) -> MigrateResult<Vec<MigrationScript>>;

    /// Ordered subset of `scripts` not yet recorded as applied.
    fn to_apply(
        &self,
        handle: &mut H,
        scripts: Vec<MigrationScript>,
    ) -> impl Future<Output = MigrateResult<Vec<MigrationScript>>> + Send;

    /// Apply `pending` in order. Called even when `pending` is empty.
    fn apply(&self, handle: &mut H, pending: Vec<MigrationScript>) -> impl Future<Output = MigrateResult<MigrationReport>> + Send;
}

/// Collect `*.<extension>` files from `dir`, sorted by file name.
///
/// A missing directory yields no scripts.
pub fn discover_scripts(dir: &Path, extension: &str) -> MigrateResult<Vec<MigrationScript>> {
    let mut scripts = Vec::new();

    if !dir.exists() {
        return Ok(scripts);
    }

    let discovery_error = |source| MigrateError::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    for entry in std::fs::read_dir(dir).map_err(discovery_error)? {
        let path = entry.map_err(discovery_error)?.path();

        if !path.is_file() || path.extension().map(|e| e != extension).unwrap_or(true) {
            continue;
        }

        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if id.starts_with('.') {
            continue;
        }

        let body = std::fs::read_to_string(&path).map_err(|source| MigrateError::Discovery {
            path: path.clone(),
            source,
        })?;

        scripts.push(MigrationScript::new(id, path.clone(), body));
    }

    scripts.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(scripts)
}

/// Hex SHA-256 of a script body.
pub fn calculate_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_calculate_checksum() {
        let checksum1 = calculate_checksum("return 1");
        let checksum2 = calculate_checksum("return 1");
        let checksum3 = calculate_checksum("return 2");

        assert_eq!(checksum1, checksum2);
        assert_ne!(checksum1, checksum3);
        assert_eq!(checksum1.len(), 64);
    }

    #[test]
    fn test_calculate_checksum_whitespace_matters() {
        assert_ne!(calculate_checksum("test"), calculate_checksum("test "));
    }

    #[test]
    fn test_discover_scripts_sorted_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        std::fs::write(dir.join("0003_add_z.lua"), "-- 3").unwrap();
        std::fs::write(dir.join("0001_add_a.lua"), "-- 1").unwrap();
        std::fs::write(dir.join("0002_add_b.lua"), "-- 2").unwrap();

        let scripts = discover_scripts(dir, "lua").unwrap();

        let ids: Vec<_> = scripts.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["0001_add_a", "0002_add_b", "0003_add_z"]);
        assert_eq!(scripts[0].body, "-- 1");
    }

    #[test]
    fn test_discover_scripts_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        std::fs::write(dir.join("0001_init.lua"), "-- lua").unwrap();
        std::fs::write(dir.join("README.md"), "# readme").unwrap();
        std::fs::write(dir.join("notes.txt"), "notes").unwrap();
        std::fs::write(dir.join(".hidden.lua"), "-- hidden").unwrap();
        std::fs::create_dir(dir.join("nested.lua")).unwrap();

        let scripts = discover_scripts(dir, "lua").unwrap();

        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, "0001_init");
    }

    #[test]
    fn test_discover_scripts_missing_directory() {
        let temp_dir = TempDir::new().unwrap();

        let scripts = discover_scripts(&temp_dir.path().join("nope"), "lua").unwrap();
        assert!(scripts.is_empty());
    }
}
