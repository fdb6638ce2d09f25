//! Tests for argument parsing and configuration overrides

use clap::Parser;
use drydock::config::OrchestratorConfig;
use drydock::migration::Category;
use drydock_migrate::cli::{parse_category, parse_optional_category};
use drydock_migrate::{Cli, Commands};
use std::path::PathBuf;

#[test]
fn test_run_takes_name_then_category() {
    let cli = Cli::try_parse_from(["migrate", "run", "create_marketplace_unified", "backend"]).unwrap();
    assert_eq!(
        cli.command,
        Commands::Run {
            name: "create_marketplace_unified".to_string(),
            category: "backend".to_string(),
        }
    );
}

#[test]
fn test_missing_arguments_are_rejected() {
    assert!(Cli::try_parse_from(["migrate", "run", "only_name"]).is_err());
    assert!(Cli::try_parse_from(["migrate", "rollback"]).is_err());
    assert!(Cli::try_parse_from(["migrate", "verify", "a", "b", "c"]).is_err());
    assert!(Cli::try_parse_from(["migrate", "frobnicate"]).is_err());
    assert!(Cli::try_parse_from(["migrate"]).is_err());
}

#[test]
fn test_run_all_and_history_options() {
    let cli = Cli::try_parse_from(["migrate", "run-all"]).unwrap();
    assert_eq!(
        cli.command,
        Commands::RunAll {
            category: None,
            dry_run: false
        }
    );

    let cli = Cli::try_parse_from(["migrate", "run-all", "supabase", "--dry-run"]).unwrap();
    assert_eq!(
        cli.command,
        Commands::RunAll {
            category: Some("supabase".to_string()),
            dry_run: true
        }
    );

    let cli = Cli::try_parse_from([
        "migrate", "history", "--category", "backend", "--limit", "5",
    ])
    .unwrap();
    assert_eq!(
        cli.command,
        Commands::History {
            category: Some("backend".to_string()),
            name: None,
            limit: Some(5)
        }
    );
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "migrate",
        "status",
        "--migrations-dir",
        "db/migrations",
        "-v",
    ])
    .unwrap();
    assert_eq!(cli.command, Commands::Status);
    assert_eq!(cli.migrations_dir, Some(PathBuf::from("db/migrations")));
    assert_eq!(cli.log_filter(), "debug");

    assert!(Cli::try_parse_from(["migrate", "status", "-v", "-q"]).is_err());
    let quiet = Cli::try_parse_from(["migrate", "-q", "list"]).unwrap();
    assert_eq!(quiet.log_filter(), "error");
}

#[test]
fn test_overrides_take_precedence() {
    let cli = Cli::try_parse_from([
        "migrate",
        "--state-dir",
        "/tmp/state",
        "--database-url",
        "postgres://cli:x@h/db",
        "status",
    ])
    .unwrap();

    let config = OrchestratorConfig {
        database_url: Some("postgres://file:x@h/db".to_string()),
        ..OrchestratorConfig::default()
    };
    let config = cli.apply_overrides(config, Some("postgres://env:x@h/db".to_string()));
    assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
    assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
    assert_eq!(config.database_url.as_deref(), Some("postgres://cli:x@h/db"));

    let plain = Cli::try_parse_from(["migrate", "status"]).unwrap();
    let config = plain.apply_overrides(OrchestratorConfig::default(), Some("postgres://env:x@h/db".into()));
    assert_eq!(config.database_url.as_deref(), Some("postgres://env:x@h/db"));

    let config = plain.apply_overrides(OrchestratorConfig::default(), Some(String::new()));
    assert!(config.database_url.is_none());
}

#[test]
fn test_category_arguments() {
    assert_eq!(parse_category("Backend").unwrap(), Category::Backend);
    assert_eq!(parse_optional_category(None).unwrap(), None);

    let err = parse_category("frontend").unwrap_err();
    assert_eq!(err.exit_code(), 5);
    assert!(err.to_string().contains("maintenance"));
}
