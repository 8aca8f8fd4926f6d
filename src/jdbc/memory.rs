use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::core::{OrmError, Result, Row};
use crate::sql::Statement;

use super::change::{self, Change};
use super::eval::{execute_mutation, Evaluator, MemorySequence, MemoryTable, Sequences, Tables};
use super::{ConnectionProvider, JdbcConnection, PreparedStatement, ResultCursor, RoutineDefinition, RowsCursor};

#[derive(Default)]
struct MemoryStore {
    tables: Tables,
    sequences: Sequences,
    routines: HashMap<String, Arc<RoutineDefinition>>,
}

struct MemoryShared {
    store: Mutex<MemoryStore>,
    statements: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
}

/// In-memory database reachable through the JDBC traits
///
/// Tables carry no constraints and sequences are non-transactional. A
/// transaction works on a private copy of the tables and replays its row
/// changes on commit; a row changed by a concurrent commit fails it.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<MemoryShared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                store: Mutex::new(MemoryStore::default()),
                statements: Mutex::new(Vec::new()),
                latency: Mutex::new(None),
            }),
        }
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) -> Result<()> {
        let mut store = self.shared.store.lock()?;
        if store.tables.contains_key(name) {
            return Err(OrmError::Jdbc(format!("Table '{}' already exists", name)));
        }
        store.tables.insert(
            name.to_string(),
            MemoryTable::new(columns.iter().map(|c| c.to_string()).collect()),
        );
        Ok(())
    }

    pub fn insert_row(&self, table: &str, row: Row) -> Result<()> {
        let mut store = self.shared.store.lock()?;
        let target = store
            .tables
            .get_mut(table)
            .ok_or_else(|| OrmError::Jdbc(format!("Table '{}' not found", table)))?;
        if row.len() != target.columns.len() {
            return Err(OrmError::Jdbc(format!(
                "Table '{}' has {} columns, row has {}",
                table,
                target.columns.len(),
                row.len()
            )));
        }
        target.rows.push(row);
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let store = self.shared.store.lock()?;
        store
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| OrmError::Jdbc(format!("Table '{}' not found", table)))
    }

    pub fn create_sequence(&self, name: &str, start: i64, increment: i64) -> Result<()> {
        let mut store = self.shared.store.lock()?;
        store.sequences.insert(
            name.to_string(),
            MemorySequence {
                next: start,
                increment,
            },
        );
        Ok(())
    }

    pub fn routine_names(&self) -> Result<Vec<String>> {
        let store = self.shared.store.lock()?;
        let mut names: Vec<String> = store.routines.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Result<Vec<String>> {
        Ok(self.shared.statements.lock()?.clone())
    }

    /// Statements executed so far that start with `prefix` (case-insensitive).
    pub fn count_statements(&self, prefix: &str) -> Result<usize> {
        let prefix = prefix.to_ascii_lowercase();
        Ok(self
            .shared
            .statements
            .lock()?
            .iter()
            .filter(|sql| sql.to_ascii_lowercase().starts_with(&prefix))
            .count())
    }

    pub fn clear_statements(&self) -> Result<()> {
        self.shared.statements.lock()?.clear();
        Ok(())
    }

    /// Delay every statement by `latency`, failing those whose timeout is shorter.
    pub fn set_latency(&self, latency: Option<Duration>) -> Result<()> {
        *self.shared.latency.lock()? = latency;
        Ok(())
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            shared: self.shared.clone(),
            working: None,
            changes: Vec::new(),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionProvider for MemoryDatabase {
    fn get_connection(&self) -> Result<Box<dyn JdbcConnection>> {
        Ok(Box::new(self.connect()))
    }
}

pub struct MemoryConnection {
    shared: Arc<MemoryShared>,
    working: Option<Tables>,
    changes: Vec<Change>,
}

impl MemoryConnection {
    fn record(&self, sql: &str) -> Result<()> {
        trace!("memory: {}", sql);
        self.shared.statements.lock()?.push(sql.to_string());
        Ok(())
    }

    fn simulate_latency(&self, statement: &PreparedStatement) -> Result<()> {
        let latency = *self.shared.latency.lock()?;
        let Some(latency) = latency else {
            return Ok(());
        };
        match statement.timeout {
            Some(timeout) if latency > timeout => {
                thread::sleep(timeout);
                Err(OrmError::QueryTimeout(format!(
                    "statement exceeded {} ms",
                    timeout.as_millis()
                )))
            }
            _ => {
                thread::sleep(latency);
                Ok(())
            }
        }
    }

    /// Resolve a CALL into the routine body it stands for.
    fn resolve_body(store: &MemoryStore, statement: &Statement) -> Result<Arc<Statement>> {
        match statement {
            Statement::Call(call) => store
                .routines
                .get(&call.routine)
                .map(|routine| routine.body.clone())
                .ok_or_else(|| OrmError::Jdbc(format!("Routine '{}' does not exist", call.routine))),
            other => Ok(Arc::new(other.clone())),
        }
    }
}

impl JdbcConnection for MemoryConnection {
    fn execute_query(&mut self, statement: &PreparedStatement) -> Result<Box<dyn ResultCursor>> {
        self.record(statement.sql())?;
        self.simulate_latency(statement)?;

        let mut guard = self.shared.store.lock()?;
        let store = &mut *guard;
        let body = Self::resolve_body(store, statement.statement())?;
        let Statement::Select(spec) = body.as_ref() else {
            return Err(OrmError::Jdbc(format!(
                "executeQuery used for a {} statement",
                body.kind()
            )));
        };
        let tables = self.working.as_ref().unwrap_or(&store.tables);
        let rows = Evaluator::new(tables, &mut store.sequences, &statement.bindings).select(spec)?;
        debug!("memory: {} row(s) for [{}]", rows.len(), statement.sql());
        Ok(Box::new(RowsCursor::new(rows, spec.select.items.len())))
    }

    fn execute_update(&mut self, statement: &PreparedStatement) -> Result<usize> {
        self.record(statement.sql())?;
        self.simulate_latency(statement)?;

        let mut guard = self.shared.store.lock()?;
        let store = &mut *guard;
        let body = Self::resolve_body(store, statement.statement())?;
        match self.working.as_mut() {
            Some(working) => execute_mutation(
                &body,
                working,
                &mut store.sequences,
                &statement.bindings,
                &mut self.changes,
            ),
            None => execute_mutation(
                &body,
                &mut store.tables,
                &mut store.sequences,
                &statement.bindings,
                &mut Vec::new(),
            ),
        }
    }

    fn create_routine(&mut self, routine: &RoutineDefinition) -> Result<()> {
        self.record(&routine.ddl)?;
        let mut store = self.shared.store.lock()?;
        store
            .routines
            .insert(routine.signature.name.clone(), Arc::new(routine.clone()));
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.working.is_some() {
            return Err(OrmError::Jdbc("Transaction already in progress".into()));
        }
        let store = self.shared.store.lock()?;
        self.working = Some(store.tables.clone());
        self.changes.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.working
            .take()
            .ok_or_else(|| OrmError::Jdbc("No transaction in progress".into()))?;
        let changes = std::mem::take(&mut self.changes);
        let mut store = self.shared.store.lock()?;
        change::replay(&mut store.tables, &changes)
    }

    fn rollback(&mut self) -> Result<()> {
        self.working = None;
        self.changes.clear();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.working.is_some()
    }

    fn sequence_increment(&mut self, sequence: &str) -> Result<Option<i64>> {
        let store = self.shared.store.lock()?;
        Ok(store.sequences.get(sequence).map(|s| s.increment))
    }
}

/// Row helper for fixtures: `row![1, "NEW", Value::Null]`.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::core::Value::from($value)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SqlType, Value};
    use crate::sql::{
        dialect::AnsiDialect, Expr, FromClause, InsertStatement, ParameterBindings, QuerySpec,
        SqlAstRenderer, TableReference,
    };

    fn prepare(statement: Statement, values: Vec<Value>) -> PreparedStatement {
        let rendered = SqlAstRenderer::render(&statement, &AnsiDialect).unwrap();
        PreparedStatement::prepare(Arc::new(rendered), ParameterBindings::from_positional(values), None).unwrap()
    }

    fn insert_order(id: i64) -> PreparedStatement {
        prepare(
            Statement::Insert(InsertStatement {
                table: "orders".into(),
                columns: vec!["id".into()],
                values: vec![Expr::positional(0, SqlType::Integer)],
            }),
            vec![Value::Integer(id)],
        )
    }

    fn count_orders(conn: &mut dyn JdbcConnection) -> usize {
        let mut spec = QuerySpec::new(FromClause::new(TableReference::new("orders", "o")));
        spec.add_selection(Expr::column(Some("o"), "id"), None, SqlType::Integer);
        let mut cursor = conn.execute_query(&prepare(Statement::Select(spec), vec![])).unwrap();
        let mut count = 0;
        while cursor.next_row().unwrap() {
            count += 1;
        }
        count
    }

    #[test]
    fn test_transaction_isolation_and_rollback() {
        let db = MemoryDatabase::new();
        db.create_table("orders", &["id"]).unwrap();

        let mut writer = db.connect();
        let mut reader = db.connect();
        writer.begin().unwrap();
        writer.execute_update(&insert_order(1)).unwrap();
        assert_eq!(count_orders(&mut writer), 1);
        assert_eq!(count_orders(&mut reader), 0);
        writer.rollback().unwrap();
        assert_eq!(count_orders(&mut reader), 0);

        writer.begin().unwrap();
        writer.execute_update(&insert_order(2)).unwrap();
        writer.commit().unwrap();
        assert_eq!(count_orders(&mut reader), 1);
        assert_eq!(db.count_statements("insert").unwrap(), 2);
    }

    fn mark_order(id: i64, status: &str) -> PreparedStatement {
        prepare(
            Statement::Update(crate::sql::UpdateStatement {
                table: "orders".into(),
                assignments: vec![crate::sql::Assignment {
                    column: "status".into(),
                    value: Expr::Literal(status.into()),
                }],
                selection: Some(Expr::eq(Expr::column(None, "id"), Expr::positional(0, SqlType::Integer))),
            }),
            vec![Value::Integer(id)],
        )
    }

    #[test]
    fn test_overlapping_commits_keep_each_others_rows() {
        let db = MemoryDatabase::new();
        db.create_table("orders", &["id"]).unwrap();

        let mut first = db.connect();
        let mut second = db.connect();
        first.begin().unwrap();
        second.begin().unwrap();
        first.execute_update(&insert_order(1)).unwrap();
        second.execute_update(&insert_order(2)).unwrap();
        first.commit().unwrap();
        second.commit().unwrap();

        assert_eq!(db.rows("orders").unwrap(), vec![crate::row![1i64], crate::row![2i64]]);
    }

    #[test]
    fn test_second_writer_of_a_row_fails_to_commit() {
        let db = MemoryDatabase::new();
        db.create_table("orders", &["id", "status"]).unwrap();
        db.insert_row("orders", crate::row![1i64, "NEW"]).unwrap();

        let mut first = db.connect();
        let mut second = db.connect();
        first.begin().unwrap();
        second.begin().unwrap();
        assert_eq!(first.execute_update(&mark_order(1, "PAID")).unwrap(), 1);
        assert_eq!(second.execute_update(&mark_order(1, "CANCELLED")).unwrap(), 1);
        first.commit().unwrap();

        assert!(second.commit().is_err());
        assert!(!second.in_transaction());
        assert_eq!(db.rows("orders").unwrap(), vec![crate::row![1i64, "PAID"]]);
    }

    #[test]
    fn test_latency_beyond_timeout() {
        let db = MemoryDatabase::new();
        db.create_table("orders", &["id"]).unwrap();
        db.set_latency(Some(Duration::from_millis(50))).unwrap();
        let mut statement = insert_order(1);
        statement.timeout = Some(Duration::from_millis(5));
        let err = db.connect().execute_update(&statement).unwrap_err();
        assert!(matches!(err, OrmError::QueryTimeout(_)));
    }

    #[test]
    fn test_fixture_rows() {
        let db = MemoryDatabase::new();
        db.create_table("orders", &["id", "status"]).unwrap();
        db.insert_row("orders", crate::row![1i64, "NEW"]).unwrap();
        assert!(db.insert_row("orders", crate::row![1i64]).is_err());
        assert_eq!(db.rows("orders").unwrap()[0][1], Value::Text("NEW".into()));
    }
}
