use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::core::{OrmError, Result, SqlType, Value};
use crate::jdbc::{JdbcConnection, PreparedStatement};
use crate::sql::{
    ComparisonOperator, Dialect, Expr, FromClause, InsertStatement, ParameterBindings, PredicateBuilder, QuerySpec,
    RenderedStatement, SqlAstRenderer, Statement, TableReference, UpdateStatement, Assignment,
};

/// Database object that hands out raw identifier source values.
pub trait DatabaseStructure: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn initial_value(&self) -> i64;

    /// Step between two consecutive source values.
    fn increment_size(&self) -> i64;

    /// Fetch the next source value over `connection`.
    fn next_value(&self, connection: &mut dyn JdbcConnection) -> Result<i64>;

    fn times_accessed(&self) -> u64;

    fn is_physical_sequence(&self) -> bool;
}

/// Native database sequence.
#[derive(Debug)]
pub struct SequenceStructure {
    name: String,
    initial_value: i64,
    increment_size: i64,
    select: Arc<RenderedStatement>,
    accessed: AtomicU64,
}

impl SequenceStructure {
    pub fn new(dialect: &dyn Dialect, name: &str, initial_value: i64, increment_size: i64) -> Result<Self> {
        if !dialect.supports_sequences() {
            return Err(OrmError::Mapping(format!(
                "Dialect {} does not support sequences (sequence {})",
                dialect.name(),
                name
            )));
        }
        let mut spec = QuerySpec::default();
        spec.add_selection(
            Expr::NextValue {
                sequence: name.to_string(),
            },
            None,
            SqlType::Integer,
        );
        let select = SqlAstRenderer::render(&Statement::Select(spec), dialect)?;
        Ok(Self {
            name: name.to_string(),
            initial_value,
            increment_size,
            select: Arc::new(select),
            accessed: AtomicU64::new(0),
        })
    }
}

impl DatabaseStructure for SequenceStructure {
    fn name(&self) -> &str {
        &self.name
    }

    fn initial_value(&self) -> i64 {
        self.initial_value
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn next_value(&self, connection: &mut dyn JdbcConnection) -> Result<i64> {
        let statement = PreparedStatement::prepare(self.select.clone(), ParameterBindings::new(), None)?;
        let mut cursor = connection.execute_query(&statement)?;
        if !cursor.next_row()? {
            return Err(OrmError::Jdbc(format!("Sequence {} returned no value", self.name)));
        }
        let value = cursor
            .get(0, SqlType::Integer)?
            .as_i64()
            .ok_or_else(|| OrmError::Jdbc(format!("Sequence {} returned null", self.name)))?;
        self.accessed.fetch_add(1, Ordering::Relaxed);
        debug!("sequence {} value obtained: {}", self.name, value);
        Ok(value)
    }

    fn times_accessed(&self) -> u64 {
        self.accessed.load(Ordering::Relaxed)
    }

    fn is_physical_sequence(&self) -> bool {
        true
    }
}

/// One row of a generator table, advanced with optimistic updates.
#[derive(Debug)]
pub struct TableStructure {
    table: String,
    segment_value: String,
    initial_value: i64,
    increment_size: i64,
    select: Arc<RenderedStatement>,
    update: Arc<RenderedStatement>,
    insert: Arc<RenderedStatement>,
    accessed: AtomicU64,
}

/// Retries before giving up on a contended generator row
const MAX_UPDATE_ATTEMPTS: usize = 32;

impl TableStructure {
    pub fn new(
        dialect: &dyn Dialect,
        table: &str,
        segment_column: &str,
        segment_value: &str,
        value_column: &str,
        initial_value: i64,
        increment_size: i64,
    ) -> Result<Self> {
        let alias = "tbl";
        let mut spec = QuerySpec::new(FromClause::new(TableReference::new(table, alias)));
        spec.add_selection(Expr::column(Some(alias), value_column), None, SqlType::Integer);
        spec.restrict(Expr::eq(
            Expr::column(Some(alias), segment_column),
            Expr::positional(0, SqlType::Text),
        ));
        spec.for_update = true;
        let select = SqlAstRenderer::render(&Statement::Select(spec), dialect)?;

        let mut predicate = PredicateBuilder::conjunction();
        predicate.add(Expr::compare(
            Expr::column(None, value_column),
            ComparisonOperator::Equal,
            Expr::positional(1, SqlType::Integer),
        ));
        predicate.add(Expr::eq(Expr::column(None, segment_column), Expr::positional(2, SqlType::Text)));
        let (selection, _) = predicate.build();
        let update = SqlAstRenderer::render(
            &Statement::Update(UpdateStatement {
                table: table.to_string(),
                assignments: vec![Assignment {
                    column: value_column.to_string(),
                    value: Expr::positional(0, SqlType::Integer),
                }],
                selection,
            }),
            dialect,
        )?;

        let insert = SqlAstRenderer::render(
            &Statement::Insert(InsertStatement {
                table: table.to_string(),
                columns: vec![segment_column.to_string(), value_column.to_string()],
                values: vec![Expr::positional(0, SqlType::Text), Expr::positional(1, SqlType::Integer)],
            }),
            dialect,
        )?;

        Ok(Self {
            table: table.to_string(),
            segment_value: segment_value.to_string(),
            initial_value,
            increment_size,
            select: Arc::new(select),
            update: Arc::new(update),
            insert: Arc::new(insert),
            accessed: AtomicU64::new(0),
        })
    }

    fn read_current(&self, connection: &mut dyn JdbcConnection) -> Result<Option<i64>> {
        let bindings = ParameterBindings::from_positional(vec![Value::Text(self.segment_value.clone())]);
        let statement = PreparedStatement::prepare(self.select.clone(), bindings, None)?;
        let mut cursor = connection.execute_query(&statement)?;
        if !cursor.next_row()? {
            return Ok(None);
        }
        Ok(cursor.get(0, SqlType::Integer)?.as_i64())
    }
}

impl DatabaseStructure for TableStructure {
    fn name(&self) -> &str {
        &self.table
    }

    fn initial_value(&self) -> i64 {
        self.initial_value
    }

    fn increment_size(&self) -> i64 {
        self.increment_size
    }

    fn next_value(&self, connection: &mut dyn JdbcConnection) -> Result<i64> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.read_current(connection)? else {
                let bindings = ParameterBindings::from_positional(vec![
                    Value::Text(self.segment_value.clone()),
                    Value::Integer(self.initial_value),
                ]);
                connection.execute_update(&PreparedStatement::prepare(self.insert.clone(), bindings, None)?)?;
                debug!(
                    "initialized generator row {}/{} at {}",
                    self.table, self.segment_value, self.initial_value
                );
                continue;
            };

            let bindings = ParameterBindings::from_positional(vec![
                Value::Integer(current + self.increment_size),
                Value::Integer(current),
                Value::Text(self.segment_value.clone()),
            ]);
            let updated =
                connection.execute_update(&PreparedStatement::prepare(self.update.clone(), bindings, None)?)?;
            if updated == 1 {
                self.accessed.fetch_add(1, Ordering::Relaxed);
                return Ok(current);
            }
            debug!("generator row {}/{} changed concurrently, retrying", self.table, self.segment_value);
        }
        Err(OrmError::Jdbc(format!(
            "Could not advance generator row {}/{}",
            self.table, self.segment_value
        )))
    }

    fn times_accessed(&self) -> u64 {
        self.accessed.load(Ordering::Relaxed)
    }

    fn is_physical_sequence(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jdbc::MemoryDatabase;
    use crate::sql::AnsiDialect;

    #[test]
    fn test_sequence_structure() {
        let db = MemoryDatabase::new();
        db.create_sequence("order_seq", 1, 20).unwrap();
        let structure = SequenceStructure::new(&AnsiDialect, "order_seq", 1, 20).unwrap();
        let mut conn = db.connect();
        assert_eq!(structure.next_value(&mut conn).unwrap(), 1);
        assert_eq!(structure.next_value(&mut conn).unwrap(), 21);
        assert_eq!(structure.times_accessed(), 2);
        assert_eq!(db.statements().unwrap()[0], "select next value for order_seq");
    }

    #[test]
    fn test_table_structure_initializes_and_advances() {
        let db = MemoryDatabase::new();
        db.create_table("id_gen", &["sequence_name", "next_val"]).unwrap();
        let structure = TableStructure::new(&AnsiDialect, "id_gen", "sequence_name", "orders", "next_val", 1, 10).unwrap();
        let mut conn = db.connect();
        assert_eq!(structure.next_value(&mut conn).unwrap(), 1);
        assert_eq!(structure.next_value(&mut conn).unwrap(), 11);
        assert_eq!(
            db.rows("id_gen").unwrap(),
            vec![vec![Value::Text("orders".into()), Value::Integer(21)]]
        );
    }

    #[test]
    fn test_mysql_has_no_sequences() {
        let err = SequenceStructure::new(&crate::sql::MySqlDialect, "s", 1, 1).unwrap_err();
        assert!(err.is_configuration());
    }
}
