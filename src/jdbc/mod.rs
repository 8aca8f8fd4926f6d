pub mod change;
pub mod eval;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use crate::core::{OrmError, Result, Row, SqlType, Value};
use crate::sql::{ParameterBindings, RenderedStatement, RoutineSignature, Statement};

pub use memory::{MemoryConnection, MemoryDatabase};

/// A statement ready for execution: SQL text, tree and bound values.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub rendered: Arc<RenderedStatement>,
    pub bindings: ParameterBindings,
    pub values: Vec<Value>,
    pub timeout: Option<Duration>,
}

impl PreparedStatement {
    pub fn prepare(
        rendered: Arc<RenderedStatement>,
        bindings: ParameterBindings,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let values = rendered.bind(&bindings)?;
        Ok(Self {
            rendered,
            bindings,
            values,
            timeout,
        })
    }

    pub fn sql(&self) -> &str {
        &self.rendered.sql
    }

    pub fn statement(&self) -> &Statement {
        &self.rendered.statement
    }
}

/// DDL plus executable body of a generated stored routine.
#[derive(Debug, Clone)]
pub struct RoutineDefinition {
    pub signature: RoutineSignature,
    pub ddl: String,
    pub body: Arc<Statement>,
}

/// Forward-only cursor over a result set.
pub trait ResultCursor {
    fn next_row(&mut self) -> Result<bool>;

    /// Read column `offset` of the current row as `sql_type`.
    fn get(&self, offset: usize, sql_type: SqlType) -> Result<Value>;

    fn column_count(&self) -> usize;
}

pub trait JdbcConnection: Send {
    fn execute_query(&mut self, statement: &PreparedStatement) -> Result<Box<dyn ResultCursor>>;

    /// Returns the affected row count.
    fn execute_update(&mut self, statement: &PreparedStatement) -> Result<usize>;

    fn create_routine(&mut self, routine: &RoutineDefinition) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    /// Increment the database declares for a sequence, when it can tell.
    fn sequence_increment(&mut self, sequence: &str) -> Result<Option<i64>>;
}

pub trait ConnectionProvider: Send + Sync {
    fn get_connection(&self) -> Result<Box<dyn JdbcConnection>>;
}

/// Cursor over fully materialized rows.
pub struct RowsCursor {
    rows: Vec<Row>,
    width: usize,
    position: Option<usize>,
}

impl RowsCursor {
    pub fn new(rows: Vec<Row>, width: usize) -> Self {
        Self {
            rows,
            width,
            position: None,
        }
    }
}

impl ResultCursor for RowsCursor {
    fn next_row(&mut self) -> Result<bool> {
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next);
        Ok(next < self.rows.len())
    }

    fn get(&self, offset: usize, sql_type: SqlType) -> Result<Value> {
        let row = self
            .position
            .and_then(|p| self.rows.get(p))
            .ok_or_else(|| OrmError::Jdbc("Cursor is not positioned on a row".into()))?;
        let value = row
            .get(offset)
            .cloned()
            .ok_or_else(|| OrmError::Jdbc(format!("Column offset {} out of range", offset)))?;
        value.coerce(sql_type)
    }

    fn column_count(&self) -> usize {
        self.width
    }
}

/// Adds statement context to backend failures.
pub trait SqlExceptionConverter: Send + Sync {
    fn convert(&self, error: OrmError, sql: &str) -> OrmError;
}

#[derive(Debug, Default)]
pub struct StandardSqlExceptionConverter;

impl SqlExceptionConverter for StandardSqlExceptionConverter {
    fn convert(&self, error: OrmError, sql: &str) -> OrmError {
        match error {
            OrmError::Jdbc(message) => OrmError::Jdbc(format!("{} [{}]", message, sql)),
            OrmError::QueryTimeout(message) => OrmError::QueryTimeout(format!("{} [{}]", message, sql)),
            other => other,
        }
    }
}
