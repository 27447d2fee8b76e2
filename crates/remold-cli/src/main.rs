//! remold CLI - apply, inspect and revert schema migrations

mod config;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use remold::{
    BatchResult, Error, MigrationOutcome, MigrationRunner, MigrationStatus, PlannedMigration,
    RevertBatch,
};
use tokio_postgres::{Client, NoTls};
use tracing_subscriber::EnvFilter;

use crate::config::DatabaseArgs;

/// Idempotent schema migrations for Postgres
#[derive(Debug, Parser)]
#[command(name = "remold", version, about)]
struct Cli {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Migrate,
    /// Show applied and pending migrations
    Status,
    /// Show what `migrate` would do, without changing anything
    Plan,
    /// Revert the most recently applied migrations
    Revert {
        /// Number of migrations to revert
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Before parsing, so `.env` values feed the env fallbacks.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remold=info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> remold::Result<ExitCode> {
    let migrations = remold::registered();
    let mut client = connect(&cli.database).await?;
    let mut runner = MigrationRunner::with_config(&mut client, cli.database.runner_config());

    match cli.command {
        Commands::Migrate => {
            let batch = runner.run_all(&migrations).await?;
            Ok(print_batch(&batch))
        }
        Commands::Status => {
            let statuses = runner.status(&migrations).await?;
            print_status(&statuses);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan => {
            let planned = runner.plan(&migrations).await?;
            print_plan(&planned);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Revert { steps } => {
            let batch = runner.revert_last(&migrations, steps).await?;
            Ok(print_reverts(&batch))
        }
    }
}

async fn connect(database: &DatabaseArgs) -> remold::Result<Client> {
    tracing::info!(database = %database.display_target(), "connecting");
    let (client, connection) = tokio_postgres::connect(&database.connection_string(), NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "connection error");
        }
    });
    Ok(client)
}

fn print_batch(batch: &BatchResult) -> ExitCode {
    for report in &batch.reports {
        let ms = report.duration.as_millis();
        match &report.outcome {
            MigrationOutcome::Applied {
                state,
                operations_run,
                operations_skipped,
            } => println!(
                "  {} {} {} ({} ops, {} skipped, {}ms)",
                "✓".green(),
                report.name,
                state.cyan(),
                operations_run,
                operations_skipped,
                ms
            ),
            MigrationOutcome::SkippedAlreadyInTargetShape { state } => println!(
                "  {} {} {}",
                "=".dimmed(),
                report.name,
                format!("already in target shape ({state})").dimmed()
            ),
            MigrationOutcome::SkippedAlreadyApplied => {
                println!("  {} {}", "=".dimmed(), report.name.dimmed())
            }
            MigrationOutcome::Failed(err) => print_failure(&report.name, err),
        }
    }

    if batch.is_success() {
        println!("{} migration(s) applied", batch.applied());
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_status(statuses: &[MigrationStatus]) {
    if statuses.is_empty() {
        println!("No migrations registered.");
        return;
    }
    for status in statuses {
        match status.applied_at {
            Some(at) if status.known => println!(
                "  {} {} {}",
                "applied".green(),
                at.format("%Y-%m-%d %H:%M:%S").dimmed(),
                status.name
            ),
            Some(at) => println!(
                "  {} {} {}",
                "orphan ".yellow(),
                at.format("%Y-%m-%d %H:%M:%S").dimmed(),
                status.name
            ),
            None => println!("  {} {:19} {}", "pending".cyan(), "", status.name),
        }
    }
}

fn print_plan(planned: &[PlannedMigration]) {
    if planned.is_empty() {
        println!("Nothing to do.");
        return;
    }
    for migration in planned {
        println!("{} [{}]", migration.name.bold(), migration.state.cyan());
        if migration.operations.is_empty() {
            println!("    {}", "(already in target shape)".dimmed());
        }
        for op in &migration.operations {
            println!("    {}", op);
        }
    }
}

fn print_reverts(batch: &RevertBatch) -> ExitCode {
    if batch.reverted.is_empty() && batch.failed.is_none() {
        println!("Nothing to revert.");
        return ExitCode::SUCCESS;
    }
    for report in &batch.reverted {
        println!(
            "  {} {} {} ({} ops)",
            "↩".yellow(),
            report.migration,
            report.state.cyan(),
            report.operations_run.len()
        );
        for lossy in report.lossy.iter().filter(|l| l.unresolved_rows > 0) {
            println!(
                "    {} {}.{}: {} row(s) could not be restored and were left NULL",
                "⚠".yellow(),
                lossy.table,
                lossy.column,
                lossy.unresolved_rows
            );
        }
    }

    match &batch.failed {
        Some((name, err)) => {
            print_failure(name, err);
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

fn print_failure(name: &str, err: &Error) {
    eprintln!("  {} {}", "✗".red().bold(), name.red());
    if let Some((state, operation)) = err.operation_context() {
        eprintln!("    state:     {}", state.yellow());
        eprintln!("    operation: {}", operation);
    }
    eprintln!("    error:     {}", err.root());
    if err.is_transient() {
        eprintln!("    {}", "transient failure; rerunning is safe".dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_revert_steps() {
        let cli = Cli::try_parse_from(["remold", "revert", "--steps", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Revert { steps: 3 }));

        let cli = Cli::try_parse_from(["remold", "revert"]).unwrap();
        assert!(matches!(cli.command, Commands::Revert { steps: 1 }));
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["remold", "generate"]).is_err());
    }

    #[test]
    fn test_partial_revert_exits_with_failure() {
        let batch = RevertBatch {
            reverted: Vec::new(),
            failed: Some((
                "1735000000000-Gone".to_string(),
                Error::UnknownMigration("1735000000000-Gone".to_string()),
            )),
        };
        assert_eq!(print_reverts(&batch), ExitCode::FAILURE);
        assert_eq!(print_reverts(&RevertBatch::default()), ExitCode::SUCCESS);
    }

    #[test]
    fn test_registered_migrations_are_linked() {
        let migrations: Vec<Box<dyn remold::Migration>> = remold::registered();
        assert_eq!(migrations.len(), 5);
    }
}
