use anyhow::{Context, Result};
use comfy_table::{Cell, Color as TableColor, Table};
use serde::Serialize;
use startup_migrations::redis_store::ScriptStatus;
use startup_migrations::{ConnectionOpener, MigrationEngine, RedisBackend, RedisMigrationEngine};

use super::ConnectionArgs;
use crate::examples::ExampleGroup;
use crate::output::{OutputManager, TableDisplay};

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Inspect",
    commands: &[
        "startup-migrations status                     # Applied and pending scripts",
        "startup-migrations --output json status       # Same, as JSON",
    ],
}];

#[derive(Debug, Serialize)]
struct StatusRow {
    id: String,
    state: &'static str,
    applied_at: Option<String>,
    checksum: String,
}

impl From<ScriptStatus> for StatusRow {
    fn from(status: ScriptStatus) -> Self {
        let state = match (&status.applied, status.is_modified()) {
            (None, _) => "pending",
            (Some(_), true) => "modified",
            (Some(_), false) => "applied",
        };
        Self {
            state,
            applied_at: status
                .applied
                .as_ref()
                .map(|record| record.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
            checksum: status.script.checksum.chars().take(12).collect(),
            id: status.script.id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct StatusReport(Vec<StatusRow>);

impl StatusReport {
    fn pending(&self) -> usize {
        self.0.iter().filter(|row| row.state == "pending").count()
    }
}

impl TableDisplay for StatusReport {
    fn to_table(&self, output: &OutputManager) -> Table {
        let mut table = output.create_table(&["Migration", "State", "Applied at", "Checksum"]);
        for row in &self.0 {
            let state = Cell::new(row.state);
            let state = if output.options.no_color {
                state
            } else {
                match row.state {
                    "pending" => state.fg(TableColor::Yellow),
                    "modified" => state.fg(TableColor::Red),
                    _ => state.fg(TableColor::Green),
                }
            };
            table.add_row(vec![
                Cell::new(&row.id),
                state,
                Cell::new(row.applied_at.as_deref().unwrap_or("-")),
                Cell::new(&row.checksum),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        format!("total={} pending={}", self.0.len(), self.pending())
    }
}

pub async fn handle_status(args: ConnectionArgs, output: &OutputManager) -> Result<()> {
    let config = args.resolve()?;
    let target = config.database_target()?;
    let engine = RedisMigrationEngine::default();

    output.heading("Migration Status");
    output.key_value("Database", &target.redacted());
    output.key_value("Migrations", &config.migrations.dir.display().to_string());

    let scripts = engine.read_migrations(&config.migrations.dir)?;
    if scripts.is_empty() {
        output.warning("No migrations found");
        return Ok(());
    }

    let mut conn = ConnectionOpener::new(&RedisBackend, config.retry_policy())
        .open(&target)
        .await
        .context("Failed to connect to the database")?;

    let report = StatusReport(
        engine
            .status(&mut conn, scripts)
            .await?
            .into_iter()
            .map(StatusRow::from)
            .collect(),
    );

    output.display(&report)?;

    match report.pending() {
        0 => output.success("All migrations are up to date"),
        pending => output.info(&format!("{pending} migration(s) pending")),
    }

    Ok(())
}
