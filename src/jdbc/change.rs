// ============================================================================
// Row change log of a memory transaction
// ============================================================================
//
// Every mutation run inside a transaction records the rows it touched.
// Commit replays the log against the committed tables, so rows committed
// by other connections in the meantime survive.
//
// ============================================================================

use std::collections::HashMap;

use log::debug;

use crate::core::{OrmError, Result, Row};

use super::eval::{MemoryTable, Tables};

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InsertRow { table: String, row: Row },

    UpdateRow { table: String, old_row: Row, new_row: Row },

    DeleteRow { table: String, old_row: Row },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. } | Change::UpdateRow { table, .. } | Change::DeleteRow { table, .. } => {
                table
            }
        }
    }
}

/// Apply `changes` to `tables` all or nothing.
///
/// An update or delete whose old row is no longer present means another
/// transaction changed it first; the commit fails and `tables` is untouched.
pub fn replay(tables: &mut Tables, changes: &[Change]) -> Result<()> {
    let mut staged: HashMap<String, MemoryTable> = HashMap::new();
    for change in changes {
        let name = change.table_name();
        if !staged.contains_key(name) {
            let committed = tables
                .get(name)
                .ok_or_else(|| OrmError::Jdbc(format!("Table '{}' not found", name)))?;
            staged.insert(name.to_string(), committed.clone());
        }
        let Some(table) = staged.get_mut(name) else {
            continue;
        };
        match change {
            Change::InsertRow { row, .. } => table.rows.push(row.clone()),
            Change::UpdateRow { old_row, new_row, .. } => {
                let index = position(table, old_row, name)?;
                table.rows[index] = new_row.clone();
            }
            Change::DeleteRow { old_row, .. } => {
                let index = position(table, old_row, name)?;
                table.rows.remove(index);
            }
        }
    }
    debug!("memory: replayed {} change(s) on {} table(s)", changes.len(), staged.len());
    tables.extend(staged);
    Ok(())
}

fn position(table: &MemoryTable, row: &Row, name: &str) -> Result<usize> {
    table.rows.iter().position(|r| r == row).ok_or_else(|| {
        OrmError::Jdbc(format!(
            "Serialization failure: a row of '{}' was changed by a concurrent transaction",
            name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn orders(rows: Vec<Row>) -> Tables {
        let mut table = MemoryTable::new(vec!["id".into(), "status".into()]);
        table.rows = rows;
        let mut tables = Tables::new();
        tables.insert("orders".into(), table);
        tables
    }

    fn row(id: i64, status: &str) -> Row {
        vec![Value::Integer(id), Value::from(status)]
    }

    #[test]
    fn test_replay_keeps_concurrent_inserts_and_row_positions() {
        let mut tables = orders(vec![row(1, "NEW"), row(2, "NEW"), row(7, "OTHER")]);
        let changes = vec![
            Change::UpdateRow {
                table: "orders".into(),
                old_row: row(1, "NEW"),
                new_row: row(1, "PAID"),
            },
            Change::InsertRow {
                table: "orders".into(),
                row: row(3, "NEW"),
            },
            Change::DeleteRow {
                table: "orders".into(),
                old_row: row(2, "NEW"),
            },
        ];
        replay(&mut tables, &changes).unwrap();
        assert_eq!(tables["orders"].rows, vec![row(1, "PAID"), row(7, "OTHER"), row(3, "NEW")]);
    }

    #[test]
    fn test_replay_of_vanished_row_changes_nothing() {
        let mut tables = orders(vec![row(1, "SHIPPED")]);
        let changes = vec![
            Change::InsertRow {
                table: "orders".into(),
                row: row(4, "NEW"),
            },
            Change::UpdateRow {
                table: "orders".into(),
                old_row: row(1, "NEW"),
                new_row: row(1, "PAID"),
            },
        ];
        let err = replay(&mut tables, &changes).unwrap_err();
        assert!(matches!(err, OrmError::Jdbc(message) if message.starts_with("Serialization failure")));
        assert_eq!(tables["orders"].rows, vec![row(1, "SHIPPED")]);
    }
}
