use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Table};
use serde::Serialize;
use startup_migrations::{LockNaming, MigrateError, Outcome, coordinator_from_config};

use super::ConnectionArgs;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, TableDisplay};
use crate::theme::ICONS;

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Worker Startup",
        commands: &[
            "startup-migrations run                               # Uses DATABASE_URL and ./migrations",
            "startup-migrations run -m db/migrations              # Custom script directory",
            "startup-migrations run --config migrations.toml      # Settings from a TOML file",
        ],
    },
    ExampleGroup {
        title: "Bounded Waiting",
        commands: &["startup-migrations run --wait-timeout 600   # Give up if the runner takes over 10 minutes"],
    },
];

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Directory for the lock file (defaults to the system temp dir)
    #[arg(long)]
    pub lock_dir: Option<PathBuf>,

    /// Stop waiting for a sibling's run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub wait_timeout: Option<u64>,

    /// Connection attempts before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

/// Result of `run`, for table/JSON/compact output.
#[derive(Debug, Serialize)]
struct RunSummary {
    role: &'static str,
    applied: Vec<String>,
    already_applied: usize,
    elapsed_ms: u64,
}

impl From<&Outcome> for RunSummary {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Ran(report) => Self {
                role: "runner",
                applied: report.applied.clone(),
                already_applied: report.skipped,
                elapsed_ms: report.total_time_ms,
            },
            Outcome::Waited { waited, .. } => Self {
                role: "waiter",
                applied: Vec::new(),
                already_applied: 0,
                elapsed_ms: waited.as_millis() as u64,
            },
        }
    }
}

impl TableDisplay for RunSummary {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table(&["Role", "Applied", "Already applied", "Elapsed"]);
        let applied = if self.applied.is_empty() {
            "-".to_string()
        } else {
            self.applied.join("\n")
        };
        table.add_row(vec![
            Cell::new(self.role),
            Cell::new(applied),
            Cell::new(self.already_applied),
            Cell::new(format!("{}ms", self.elapsed_ms)),
        ]);
        table
    }

    fn to_compact(&self) -> String {
        format!(
            "role={} applied={} already_applied={} elapsed_ms={}",
            self.role,
            self.applied.len(),
            self.already_applied,
            self.elapsed_ms
        )
    }
}

/// Huge values clamp to `u64::MAX` ms rather than wrapping.
fn secs_to_millis(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

pub async fn handle_run(args: RunArgs, output: &OutputManager) -> Result<()> {
    let mut config = args.connection.resolve()?;
    if let Some(dir) = args.lock_dir {
        config.lock.dir = Some(dir);
    }
    if let Some(secs) = args.wait_timeout {
        config.lock.wait_timeout_ms = Some(secs_to_millis(secs));
    }
    if let Some(attempts) = args.max_attempts {
        config.retry.max_attempts = attempts;
    }

    let target = config.database_target()?;

    output.heading("Run Migrations");
    output.key_value("Database", &target.redacted());
    output.key_value("Migrations", &config.migrations.dir.display().to_string());
    output.status(ICONS.lock, &format!("Lock: {}", config.lock_naming().lock_path().display()));

    let coordinator = coordinator_from_config(&config);
    match coordinator.migrate(&target, &config.migrations.dir).await {
        Ok(outcome) => {
            match &outcome {
                Outcome::Ran(report) if report.applied.is_empty() => {
                    output.success("All migrations are up to date");
                }
                Outcome::Ran(report) => {
                    for id in &report.applied {
                        output.bullet(id);
                    }
                    output.success(&format!(
                        "{} migration(s) applied in {}ms",
                        report.applied.len(),
                        report.total_time_ms
                    ));
                }
                Outcome::Waited { waited, .. } => {
                    output.status(ICONS.clock, &format!("Another worker ran the migrations; waited {waited:?}"));
                }
            }
            output.display(&RunSummary::from(&outcome))
        }
        Err(err) => {
            if let MigrateError::ConnectionExhausted { .. } = err {
                output.error("Database never became reachable");
            }
            Err(err.into())
        }
    }
}
