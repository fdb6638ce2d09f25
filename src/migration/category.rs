//! Migration categories and their execution backends

use crate::migration::MigrationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace grouping migrations that share an execution backend
///
/// Declaration order is the order `list` and `run-all` walk categories in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Backend,
    Supabase,
    Prisma,
    Deployment,
    Maintenance,
}

impl Category {
    /// All categories in registry order
    pub const ALL: [Category; 5] = [
        Category::Backend,
        Category::Supabase,
        Category::Prisma,
        Category::Deployment,
        Category::Maintenance,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Backend => "backend",
            Category::Supabase => "supabase",
            Category::Prisma => "prisma",
            Category::Deployment => "deployment",
            Category::Maintenance => "maintenance",
        }
    }

    /// Backend used when the configuration does not override it
    ///
    /// `backend` and `supabase` hold SQL applied to Postgres; the rest shell out.
    #[must_use]
    pub fn default_backend(&self) -> BackendKind {
        match self {
            Category::Backend | Category::Supabase => BackendKind::Sql,
            Category::Prisma | Category::Deployment | Category::Maintenance => BackendKind::Script,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let known: Vec<&str> = Category::ALL.iter().map(Category::as_str).collect();
                MigrationError::NotFound(format!(
                    "unknown category '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

/// How the steps of a migration are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `.sql` files applied to the target database
    Sql,
    /// Executable scripts run by an interpreter picked from the file extension
    Script,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sql => f.write_str("sql"),
            BackendKind::Script => f.write_str("script"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_category_case_insensitive() {
        assert_eq!("backend".parse::<Category>().unwrap(), Category::Backend);
        assert_eq!("Supabase".parse::<Category>().unwrap(), Category::Supabase);
        assert_eq!(" maintenance ".parse::<Category>().unwrap(), Category::Maintenance);
    }

    #[test]
    fn test_unknown_category_is_not_found() {
        let err = "frontend".parse::<Category>().unwrap_err();
        assert!(matches!(err, MigrationError::NotFound(_)));
        assert!(err.to_string().contains("backend, supabase, prisma, deployment, maintenance"));
    }

    #[test]
    fn test_default_backends() {
        assert_eq!(Category::Backend.default_backend(), BackendKind::Sql);
        assert_eq!(Category::Supabase.default_backend(), BackendKind::Sql);
        assert_eq!(Category::Prisma.default_backend(), BackendKind::Script);
        assert_eq!(Category::Deployment.default_backend(), BackendKind::Script);
    }

    #[test]
    fn test_all_is_sorted_in_declaration_order() {
        let mut sorted = Category::ALL;
        sorted.sort();
        assert_eq!(sorted, Category::ALL);
    }
}
