pub mod run;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use startup_migrations::MigrateConfig;

/// Where to find the database, the scripts and the optional config file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// TOML config file; flags below override its values
    #[arg(short, long, env = "STARTUP_MIGRATIONS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory holding the *.lua migration scripts
    #[arg(short, long)]
    pub migrations_dir: Option<PathBuf>,
}

impl ConnectionArgs {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn resolve(&self) -> Result<MigrateConfig> {
        let mut config = match &self.config {
            Some(path) => MigrateConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
            None => MigrateConfig::default(),
        };

        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }

        Ok(config)
    }
}
