//! Script backend: steps run by an interpreter chosen from the file extension

use crate::backend::{CheckOutcome, MigrationBackend};
use crate::migration::{BackendKind, Direction, Migration, MigrationError, Step};
use std::env;
use std::path::PathBuf;
use std::process::{Command, Output};

/// Lines of stderr kept in failure messages
const ERROR_TAIL_LINES: usize = 20;

/// Interpreter for a step file extension
///
/// # Example
/// - `sh` → `sh`
/// - `py` → `python3`
#[must_use]
pub fn interpreter_for(ext: &str) -> Option<&'static str> {
    match ext {
        "sh" => Some("sh"),
        "bash" => Some("bash"),
        "py" => Some("python3"),
        "js" => Some("node"),
        _ => None,
    }
}

fn install_hint(tool: &str) -> String {
    match tool {
        "python3" => "Install Python 3 (e.g. `apt-get install python3`)".to_string(),
        "node" => "Install Node.js (https://nodejs.org) and make sure `node` is on PATH".to_string(),
        other => format!("Install `{other}` and make sure it is on PATH"),
    }
}

/// Locate an executable on `PATH`
#[must_use]
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Runs each step as `<interpreter> <step file>` inside the migration directory
///
/// Scripts receive `DATABASE_URL` (when configured), `DRYDOCK_CATEGORY` and
/// `DRYDOCK_MIGRATION` in their environment.
#[derive(Debug, Clone, Default)]
pub struct ScriptBackend {
    database_url: Option<String>,
}

impl ScriptBackend {
    pub fn new(database_url: Option<String>) -> Self {
        Self { database_url }
    }

    fn interpreter(&self, migration: &Migration, step: &Step) -> Result<&'static str, MigrationError> {
        let ext = step.extension();
        interpreter_for(&ext).ok_or_else(|| {
            MigrationError::InvalidFormat(format!(
                "No interpreter for step {} of '{}'",
                step.file_name(),
                migration.id
            ))
        })
    }

    fn spawn(&self, migration: &Migration, step: &Step) -> Result<Output, MigrationError> {
        let interpreter = self.interpreter(migration, step)?;

        let mut command = Command::new(interpreter);
        command
            .arg(step.file_name())
            .current_dir(migration.dir())
            .env("DRYDOCK_CATEGORY", migration.category().as_str())
            .env("DRYDOCK_MIGRATION", migration.name());
        if let Some(url) = &self.database_url {
            command.env("DATABASE_URL", url);
        }

        log::debug!("Running {} {} in {}", interpreter, step.file_name(), migration.dir().display());
        command.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MigrationError::DependencyMissing {
                    tool: interpreter.to_string(),
                    hint: install_hint(interpreter),
                }
            } else {
                MigrationError::ExecutionFailed {
                    id: migration.id.clone(),
                    step: step.file_name(),
                    error: format!("failed to start {interpreter}: {e}"),
                }
            }
        })
    }
}

impl MigrationBackend for ScriptBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Script
    }

    fn preflight(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> Result<Vec<String>, MigrationError> {
        let mut notes = Vec::new();

        for step in migration.steps(direction).iter().chain(migration.verify.iter()) {
            std::fs::metadata(&step.path).map_err(|e| {
                MigrationError::InvalidFormat(format!(
                    "Cannot read step {} of '{}': {}",
                    step.file_name(),
                    migration.id,
                    e
                ))
            })?;

            let interpreter = self.interpreter(migration, step)?;
            let found = find_on_path(interpreter).ok_or_else(|| MigrationError::DependencyMissing {
                tool: interpreter.to_string(),
                hint: install_hint(interpreter),
            })?;
            notes.push(format!(
                "{} runs with {}",
                step.file_name(),
                found.display()
            ));
        }

        if self.database_url.is_none() {
            notes.push("DATABASE_URL not set; scripts run without it".to_string());
        }

        Ok(notes)
    }

    fn apply_step(&self, migration: &Migration, step: &Step) -> Result<String, MigrationError> {
        let output = self.spawn(migration, step)?;
        let captured = combined_output(&output);

        match output.status.code() {
            Some(0) => Ok(captured),
            Some(code) => Err(MigrationError::ExecutionFailed {
                id: migration.id.clone(),
                step: step.file_name(),
                error: format!("exit status {}\n{}", code, tail(&captured)),
            }),
            // No exit code: terminated by a signal
            None => Err(MigrationError::Interrupted {
                id: migration.id.clone(),
                step: step.file_name(),
                reason: format!("terminated by signal\n{}", tail(&captured)),
            }),
        }
    }

    fn check(&self, migration: &Migration, step: &Step) -> Result<CheckOutcome, MigrationError> {
        let output = self.spawn(migration, step)?;
        if output.status.success() {
            return Ok(CheckOutcome::Passed);
        }

        let captured = combined_output(&output);
        let status = output
            .status
            .code()
            .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"));
        Ok(CheckOutcome::Failed(format!(
            "{} {}\n{}",
            step.file_name(),
            status,
            tail(&captured)
        )))
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.into_owned(),
        (true, false) => stderr.into_owned(),
        (false, false) => format!("{stdout}{stderr}"),
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}
