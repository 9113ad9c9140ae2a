//! Domain table identity and the static parent-reference hierarchy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown table: \"{0}\"")]
    UnknownTable(String),
}

/// The domain tables this service synchronizes. A static, closed set --
/// new tables require a code change and a deploy, matching the teacher's
/// schema-light, non-reflective approach (spec.md design note: "ORM-entity
/// coupling -> schema-light records").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Projects,
    Tasks,
    Comments,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Users, Table::Projects, Table::Tasks, Table::Comments];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Projects => "projects",
            Table::Tasks => "tasks",
            Table::Comments => "comments",
        }
    }

    /// Tables this table's rows reference ("parents" in the hierarchy DAG).
    /// `users` and `projects` are roots; `tasks` reference `projects`;
    /// `comments` reference `tasks`.
    pub fn parents(&self) -> &'static [Table] {
        match self {
            Table::Users => &[],
            Table::Projects => &[],
            Table::Tasks => &[Table::Projects],
            Table::Comments => &[Table::Tasks],
        }
    }

    /// The JSON field in a row's data that carries its parent's id, for
    /// tables that have one. Used by the submission path (C10) to extract
    /// a foreign key into the mirrored table's `parent_id` column.
    pub fn parent_id_field(&self) -> Option<&'static str> {
        match self {
            Table::Users | Table::Projects => None,
            Table::Tasks => Some("projectId"),
            Table::Comments => Some("taskId"),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Table::Users),
            "projects" => Ok(Table::Projects),
            "tasks" => Ok(Table::Tasks),
            "comments" => Ok(Table::Comments),
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
    }

    #[test]
    fn unknown_table_errors() {
        assert!("widgets".parse::<Table>().is_err());
    }
}
