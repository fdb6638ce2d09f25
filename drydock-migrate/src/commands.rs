//! Subcommand handlers
//!
//! Each handler makes exactly one orchestrator call and prints the result.

use crate::cli::{parse_category, parse_optional_category, Commands};
use colored::Colorize;
use drydock::backend::CheckOutcome;
use drydock::migration::{
    ExecutionRecord, MigrationError, MigrationState, Migrator, Outcome, StatusReport,
    VerificationResult,
};
use thiserror::Error;

/// Failures that belong to the command line rather than the orchestrator
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(
        "`migrate backup` is not available in this tool\n\
         Take backups with the database platform's own tooling (e.g. pg_dump)"
    )]
    BackupUnavailable,
}

impl CommandError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::BackupUnavailable => 1,
        }
    }
}

/// Dispatch one subcommand
///
/// # Errors
///
/// Returns the orchestrator error of the failed operation.
pub fn dispatch(command: &Commands, migrator: &Migrator) -> Result<(), MigrationError> {
    match command {
        Commands::List { category } => handle_list(migrator, category.as_deref()),
        Commands::Run { name, category } => handle_run(migrator, name, category, false),
        Commands::DryRun { name, category } => handle_run(migrator, name, category, true),
        Commands::RunAll { category, dry_run } => {
            handle_run_all(migrator, category.as_deref(), *dry_run)
        }
        Commands::Status => handle_status(migrator),
        Commands::Rollback { name, category } => handle_rollback(migrator, name, category),
        Commands::Verify { name, category } => handle_verify(migrator, name, category),
        Commands::History {
            category,
            name,
            limit,
        } => handle_history(migrator, category.as_deref(), name.as_deref(), *limit),
        Commands::Backup => Err(MigrationError::Argument(
            CommandError::BackupUnavailable.to_string(),
        )),
    }
}

fn handle_list(migrator: &Migrator, category: Option<&str>) -> Result<(), MigrationError> {
    let migrations = migrator.registry().list_named(category)?;

    if migrations.is_empty() {
        println!(
            "No migrations found under {}",
            migrator.registry().root().display()
        );
        return Ok(());
    }

    let mut current = None;
    for migration in &migrations {
        if current != Some(migration.category()) {
            current = Some(migration.category());
            println!(
                "\n📂 {} ({})",
                migration.category().as_str().bold(),
                migration.backend
            );
        }
        let rollback = if migration.has_rollback() { "" } else { " (no rollback)" };
        println!(
            "  • {} - {} step(s){}",
            migration.name(),
            migration.up.len(),
            rollback.dimmed()
        );
    }
    println!("\n{} migration(s)", migrations.len());

    Ok(())
}

fn handle_run(
    migrator: &Migrator,
    name: &str,
    category: &str,
    dry_run: bool,
) -> Result<(), MigrationError> {
    let category = parse_category(category)?;
    let record = migrator.run(category, name, dry_run)?;

    if dry_run {
        println!("🔍 Dry run of {}/{} passed", category, name);
        print_output(&record);
        println!("Nothing was changed.");
    } else {
        println!(
            "✅ Applied {}/{} in {}",
            category,
            name,
            duration(&record)
        );
        print_output(&record);
    }
    Ok(())
}

fn handle_run_all(
    migrator: &Migrator,
    category: Option<&str>,
    dry_run: bool,
) -> Result<(), MigrationError> {
    let category = parse_optional_category(category)?;
    let summary = migrator.run_all(category, dry_run)?;

    for record in &summary.applied {
        let verb = if dry_run { "validated" } else { "applied" };
        println!(
            "  {} {}/{} {} ({})",
            "✓".green(),
            record.category,
            record.name,
            verb,
            duration(record)
        );
    }

    let done = if dry_run { "validated" } else { "applied" };
    println!(
        "\n📈 Summary: {} {}, {} already applied",
        summary.applied.len(),
        done,
        summary.skipped.len()
    );

    match summary.failure {
        None => Ok(()),
        Some((id, err)) => {
            eprintln!("  {} {} failed; later migrations were not attempted", "✗".red(), id);
            Err(err)
        }
    }
}

fn handle_status(migrator: &Migrator) -> Result<(), MigrationError> {
    let report = migrator.status()?;
    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("\n📊 Migration Status\n");

    if report.entries.is_empty() {
        println!("No migrations found");
    }

    for entry in &report.entries {
        let state = match entry.state {
            MigrationState::Applied => entry.state.to_string().green(),
            MigrationState::Pending | MigrationState::RolledBack => entry.state.to_string().yellow(),
            MigrationState::InFlight => entry.state.to_string().cyan(),
            MigrationState::Failed | MigrationState::Interrupted => entry.state.to_string().red(),
        };
        let when = entry
            .applied_at
            .map(|t| format!(" since {}", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        let drift = if entry.drifted {
            " (files changed since applied)".red().to_string()
        } else {
            String::new()
        };
        println!("  {:<48} {}{}{}", entry.id.to_string(), state, when, drift);
    }

    if !report.orphaned.is_empty() {
        println!("\n⚠️  History for migrations no longer on disk:");
        for id in &report.orphaned {
            println!("  {}", id);
        }
    }

    println!(
        "\n📈 Summary: {} total, {} applied, {} pending, {} need attention",
        report.total, report.applied_count, report.pending_count, report.attention_count
    );
}

fn handle_rollback(migrator: &Migrator, name: &str, category: &str) -> Result<(), MigrationError> {
    let category = parse_category(category)?;
    let record = migrator.rollback(category, name)?;

    println!(
        "↩️  Rolled back {}/{} in {}",
        category,
        name,
        duration(&record)
    );
    print_output(&record);
    Ok(())
}

fn handle_verify(migrator: &Migrator, name: &str, category: &str) -> Result<(), MigrationError> {
    let category = parse_category(category)?;
    let result = migrator.verify(category, name)?;
    print_verification(&result);

    if result.holds() {
        Ok(())
    } else {
        Err(MigrationError::VerificationFailed {
            id: result.id.clone(),
            reason: result.problems().join("; "),
        })
    }
}

fn print_verification(result: &VerificationResult) {
    println!("\n🔎 Verification of {}\n", result.id);

    let mark = |ok: bool| if ok { "✓".green() } else { "✗".red() };
    println!("  {} applied", mark(result.applied));

    match result.checksum_matches {
        Some(matches) => println!("  {} step files unchanged since apply", mark(matches)),
        None => println!("  - checksum not compared (not applied)"),
    }

    match &result.check {
        CheckOutcome::Passed => println!("  {} verify check passed", mark(true)),
        CheckOutcome::Failed(reason) => println!("  {} verify check: {}", mark(false), reason),
        CheckOutcome::NotDefined => println!("  - no verify check defined"),
        CheckOutcome::Skipped => println!("  - verify check skipped"),
    }
}

fn handle_history(
    migrator: &Migrator,
    category: Option<&str>,
    name: Option<&str>,
    limit: Option<usize>,
) -> Result<(), MigrationError> {
    let category = parse_optional_category(category)?;
    let records = migrator.history(category, name, limit)?;

    if records.is_empty() {
        println!("No recorded attempts");
        return Ok(());
    }

    for record in &records {
        let outcome = match record.outcome {
            Outcome::Success => "success".green(),
            Outcome::DryRun => "dry_run".cyan(),
            Outcome::Started => "started".yellow(),
            Outcome::Failed => "failed".red(),
            Outcome::Interrupted => "interrupted".red(),
        };
        println!(
            "{}  {:<8} {:<40} {:<12} {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", record.operation).to_lowercase(),
            format!("{}/{}", record.category, record.name),
            outcome,
            record.attempt_id
        );
        if let Some(error) = &record.error {
            println!("    {}", error.lines().next().unwrap_or_default().dimmed());
        }
    }

    Ok(())
}

fn print_output(record: &ExecutionRecord) {
    if let Some(output) = record.output.as_deref().filter(|o| !o.trim().is_empty()) {
        for line in output.lines() {
            println!("   {}", line.dimmed());
        }
    }
}

fn duration(record: &ExecutionRecord) -> String {
    record
        .execution_time_ms
        .map_or_else(|| "N/A".to_string(), |ms| format!("{}ms", ms))
}
