//! Schema migrations.
//!
//! A migration describes how to bring a database from one schema version to
//! the next. Backends interpret the steps in their own terms: the relational
//! backend as DDL, the document store as table bookkeeping.

use crate::{error::Result, ColumnDef, Error, SchemaVersion, TableName, TableSchema};
use serde::{Deserialize, Serialize};

/// One step inside a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MigrationStep {
    CreateTable(TableSchema),
    AddColumns {
        table: TableName,
        columns: Vec<ColumnDef>,
    },
}

/// A migration to a single schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    /// The schema version this migration produces.
    pub to_version: SchemaVersion,
    /// Steps applied in order.
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    /// Create a new migration.
    pub fn new(to_version: SchemaVersion, steps: Vec<MigrationStep>) -> Self {
        Self { to_version, steps }
    }
}

/// Select the migrations needed to go from `stored` to `target`.
///
/// The chain must cover every version in `(stored, target]` with no gaps,
/// otherwise the database cannot be upgraded in place.
pub fn migration_chain(
    migrations: &[Migration],
    stored: SchemaVersion,
    target: SchemaVersion,
) -> Result<Vec<&Migration>> {
    let mut chain: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.to_version > stored && m.to_version <= target)
        .collect();
    chain.sort_by_key(|m| m.to_version);

    let mut expected = stored + 1;
    for migration in &chain {
        if migration.to_version != expected {
            return Err(Error::MigrationGap {
                from: stored,
                to: target,
            });
        }
        expected += 1;
    }
    if expected != target + 1 {
        return Err(Error::MigrationGap {
            from: stored,
            to: target,
        });
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ColumnType;

    fn migration(to_version: SchemaVersion) -> Migration {
        Migration::new(
            to_version,
            vec![MigrationStep::AddColumns {
                table: "posts".into(),
                columns: vec![ColumnDef::optional("extra", ColumnType::String)],
            }],
        )
    }

    #[test]
    fn contiguous_chain() {
        let migrations = vec![migration(3), migration(2), migration(4)];
        let chain = migration_chain(&migrations, 1, 4).unwrap();
        let versions: Vec<_> = chain.iter().map(|m| m.to_version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn empty_chain_when_up_to_date() {
        let migrations = vec![migration(2)];
        let chain = migration_chain(&migrations, 2, 2).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn gap_detected() {
        let migrations = vec![migration(2), migration(4)];
        let result = migration_chain(&migrations, 1, 4);
        assert!(matches!(result, Err(Error::MigrationGap { from: 1, to: 4 })));
    }

    #[test]
    fn missing_tail_detected() {
        let migrations = vec![migration(2)];
        let result = migration_chain(&migrations, 1, 3);
        assert!(matches!(result, Err(Error::MigrationGap { .. })));
    }
}
