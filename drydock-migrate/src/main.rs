//! Drydock migration CLI
//!
//! `migrate <subcommand>`: the dispatcher behind the operations scripts.
//! Exit codes are stable so wrapper scripts can branch on them:
//! 0 success, 1 argument error or missing tool, 2 connection error,
//! 3 execution failed, 4 lock contention, 5 operator error,
//! 6 configuration or state error, 7 verification did not hold.

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;
use drydock::config::OrchestratorConfig;
use drydock::migration::{MigrationError, Migrator};
use drydock_migrate::commands::{dispatch, CommandError};
use drydock_migrate::{Cli, Commands};
use std::process;

fn main() {
    // A missing .env is normal
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    match run(&cli) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            process::exit(exit_code(&e));
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    if cli.command == Commands::Backup {
        return Err(CommandError::BackupUnavailable.into());
    }

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let env_url = std::env::var("DATABASE_URL").ok();
    let config = cli.apply_overrides(config, env_url);

    if config.database_url.is_none() {
        log::warn!(
            "DATABASE_URL is not set; SQL migrations will fail to connect (set it or pass --database-url)"
        );
    }

    let migrator = Migrator::from_config(&config)?;
    dispatch(&cli.command, &migrator)?;
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<MigrationError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<CommandError>() {
        e.exit_code()
    } else {
        1
    }
}
