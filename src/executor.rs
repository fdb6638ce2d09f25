//! `SqlExecutor` - database execution seam used by the SQL backend and the
//! Postgres state store.
//!
//! The trait keeps driver rows out of its signatures so that backends and
//! tests can substitute their own executors.

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError};
use std::fmt;
use std::time::Instant;

/// `SqlExecutor` error type
#[derive(Debug)]
pub enum ExecError {
    /// `PostgreSQL` error from `may_postgres`
    PostgresError(PostgresError),
    /// Query execution error
    QueryError(String),
    /// Row parsing/conversion error
    ParseError(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::PostgresError(e) => write!(f, "PostgreSQL error: {e}"),
            ExecError::QueryError(s) => write!(f, "Query error: {s}"),
            ExecError::ParseError(s) => write!(f, "Parse error: {s}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<PostgresError> for ExecError {
    fn from(err: PostgresError) -> Self {
        ExecError::PostgresError(err)
    }
}

/// Trait for executing database operations
pub trait SqlExecutor {
    /// Execute one statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if the statement fails.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, ExecError>;

    /// Execute a script of one or more statements without parameters
    ///
    /// Statements in the script run in one implicit transaction unless the
    /// script manages transactions itself.
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if any statement fails.
    fn batch_execute(&self, script: &str) -> Result<(), ExecError>;

    /// Run a query whose columns are all text (cast in SQL with `::text`)
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if the query fails or a column is not text.
    fn query_text(
        &self,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Vec<Option<String>>>, ExecError>;

    /// Run a query and read the boolean in the first column of the first row
    ///
    /// Returns `Ok(None)` when the query yields no rows.
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if the query fails or the column is not boolean.
    fn query_flag(&self, query: &str) -> Result<Option<bool>, ExecError>;

    /// Check that the connection is alive
    ///
    /// # Errors
    ///
    /// Returns `ExecError` if `SELECT 1` fails.
    fn ping(&self) -> Result<(), ExecError> {
        self.execute("SELECT 1", &[]).map(|_| ())
    }
}

/// Implementation of `SqlExecutor` for `may_postgres::Client`
pub struct PostgresExecutor {
    client: Client,
}

impl PostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SqlExecutor for PostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, ExecError> {
        let start = Instant::now();
        let result = self.client.execute(query, params).map_err(ExecError::PostgresError);
        log::trace!("execute took {:?}", start.elapsed());
        result
    }

    fn batch_execute(&self, script: &str) -> Result<(), ExecError> {
        let start = Instant::now();
        let result = self.client.batch_execute(script).map_err(ExecError::PostgresError);
        log::debug!("batch of {} bytes took {:?}", script.len(), start.elapsed());
        result
    }

    fn query_text(
        &self,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Vec<Option<String>>>, ExecError> {
        let rows = self.client.query(query, params)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for index in 0..row.len() {
                let value: Option<String> = row
                    .try_get(index)
                    .map_err(|e| ExecError::ParseError(format!("column {index}: {e}")))?;
                values.push(value);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn query_flag(&self, query: &str) -> Result<Option<bool>, ExecError> {
        let rows = self.client.query(query, &[])?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        if row.is_empty() {
            return Err(ExecError::QueryError(
                "verification query returned no columns".to_string(),
            ));
        }
        let flag: bool = row
            .try_get(0)
            .map_err(|e| ExecError::ParseError(format!("expected a boolean column: {e}")))?;
        Ok(Some(flag))
    }
}
