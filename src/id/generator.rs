use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::config::{SequenceMismatchStrategy, Settings};
use crate::core::{OrmError, Result, Value};
use crate::jdbc::{ConnectionProvider, JdbcConnection};
use crate::metadata::GeneratorMapping;
use crate::sql::Dialect;

use super::optimizer::{Optimizer, OptimizerDescriptor};
use super::structure::{DatabaseStructure, SequenceStructure, TableStructure};

/// How an entity obtains its identifier on persist.
#[derive(Debug)]
pub enum IdentifierGenerator {
    /// The application sets the identifier before persisting.
    Assigned,
    SequenceStyle(SequenceStyleGenerator),
}

impl IdentifierGenerator {
    pub fn from_mapping(entity: &str, mapping: &GeneratorMapping, dialect: &dyn Dialect, settings: &Settings) -> Result<Self> {
        let (structure, descriptor, increment_size, initial_value) = match mapping {
            GeneratorMapping::Assigned => return Ok(IdentifierGenerator::Assigned),
            GeneratorMapping::Sequence {
                sequence_name,
                initial_value,
                increment_size,
                optimizer,
            } => {
                let descriptor = resolve_optimizer(optimizer.as_deref(), *increment_size, settings)?;
                let source_increment = source_increment(descriptor, *increment_size);
                (
                    Box::new(SequenceStructure::new(dialect, sequence_name, *initial_value, source_increment)?)
                        as Box<dyn DatabaseStructure>,
                    descriptor,
                    *increment_size,
                    *initial_value,
                )
            }
            GeneratorMapping::Table {
                table,
                segment_column,
                segment_value,
                value_column,
                initial_value,
                increment_size,
                optimizer,
            } => {
                let descriptor = resolve_optimizer(optimizer.as_deref(), *increment_size, settings)?;
                let source_increment = source_increment(descriptor, *increment_size);
                (
                    Box::new(TableStructure::new(
                        dialect,
                        table,
                        segment_column,
                        segment_value,
                        value_column,
                        *initial_value,
                        source_increment,
                    )?) as Box<dyn DatabaseStructure>,
                    descriptor,
                    *increment_size,
                    *initial_value,
                )
            }
        };
        if increment_size < 1 {
            return Err(OrmError::Mapping(format!(
                "Identifier generator of {} has increment size {} (must be >= 1)",
                entity, increment_size
            )));
        }
        Ok(IdentifierGenerator::SequenceStyle(SequenceStyleGenerator {
            entity: entity.to_string(),
            structure,
            descriptor,
            increment_size,
            initial_value,
            mismatch: settings.sequence_mismatch_strategy,
            optimizer: Mutex::new(None),
        }))
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, IdentifierGenerator::Assigned)
    }

    /// Next identifier value, or `None` when the application assigns it.
    pub fn generate(&self, connections: &dyn ConnectionProvider) -> Result<Option<Value>> {
        match self {
            IdentifierGenerator::Assigned => Ok(None),
            IdentifierGenerator::SequenceStyle(generator) => generator.generate(connections).map(|v| Some(Value::Integer(v))),
        }
    }
}

fn resolve_optimizer(name: Option<&str>, increment_size: i64, settings: &Settings) -> Result<OptimizerDescriptor> {
    match name {
        Some(name) => OptimizerDescriptor::from_name(name),
        None => Ok(OptimizerDescriptor::default_for(increment_size, settings.prefer_pooled_values_lo)),
    }
}

fn source_increment(descriptor: OptimizerDescriptor, increment_size: i64) -> i64 {
    if descriptor.applies_increment_to_source() {
        increment_size
    } else {
        1
    }
}

/// Sequence or table backed generator with an optimizer in front.
///
/// The optimizer is built on first use, after the mapped increment has been
/// checked against the one the database declares.
pub struct SequenceStyleGenerator {
    entity: String,
    structure: Box<dyn DatabaseStructure>,
    descriptor: OptimizerDescriptor,
    increment_size: i64,
    initial_value: i64,
    mismatch: SequenceMismatchStrategy,
    optimizer: Mutex<Option<Arc<dyn Optimizer>>>,
}

impl fmt::Debug for SequenceStyleGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceStyleGenerator")
            .field("entity", &self.entity)
            .field("structure", &self.structure.name())
            .field("optimizer", &self.descriptor.name())
            .field("increment_size", &self.increment_size)
            .finish()
    }
}

impl SequenceStyleGenerator {
    pub fn structure(&self) -> &dyn DatabaseStructure {
        self.structure.as_ref()
    }

    pub fn descriptor(&self) -> OptimizerDescriptor {
        self.descriptor
    }

    /// Configured increment; may differ from the mapped one after a FIX.
    pub fn increment_size(&self) -> Result<i64> {
        Ok(match self.optimizer.lock()?.as_ref() {
            Some(optimizer) => optimizer.increment_size(),
            None => self.increment_size,
        })
    }

    pub fn generate(&self, connections: &dyn ConnectionProvider) -> Result<i64> {
        let optimizer = self.optimizer(connections)?;

        // Every source round trip runs on its own connection, outside the
        // caller's transaction.
        let structure = self.structure.as_ref();
        let mut connection: Option<Box<dyn JdbcConnection>> = None;
        let mut callback = || -> Result<i64> {
            if connection.is_none() {
                connection = Some(connections.get_connection()?);
            }
            let conn = connection
                .as_mut()
                .ok_or_else(|| OrmError::IllegalState("Generator connection unavailable".into()))?;
            structure.next_value(conn.as_mut())
        };
        optimizer.generate(&mut callback)
    }

    fn optimizer(&self, connections: &dyn ConnectionProvider) -> Result<Arc<dyn Optimizer>> {
        let mut slot = self.optimizer.lock()?;
        if let Some(optimizer) = slot.as_ref() {
            return Ok(optimizer.clone());
        }
        let increment_size = self.verified_increment(connections)?;
        let optimizer: Arc<dyn Optimizer> = Arc::from(self.descriptor.build(increment_size, self.initial_value)?);
        debug!(
            "{} identifiers use {} optimizer over {} (increment {})",
            self.entity,
            self.descriptor.name(),
            self.structure.name(),
            increment_size
        );
        *slot = Some(optimizer.clone());
        Ok(optimizer)
    }

    /// Compare the mapped increment with the database sequence definition.
    fn verified_increment(&self, connections: &dyn ConnectionProvider) -> Result<i64> {
        if !self.structure.is_physical_sequence()
            || !self.descriptor.applies_increment_to_source()
            || self.mismatch == SequenceMismatchStrategy::None
        {
            return Ok(self.increment_size);
        }
        let mut conn = connections.get_connection()?;
        let Some(declared) = conn.sequence_increment(self.structure.name())? else {
            return Ok(self.increment_size);
        };
        if declared == self.increment_size {
            return Ok(self.increment_size);
        }
        let message = format!(
            "Sequence {} defines an increment of {} but {} maps it with {}",
            self.structure.name(),
            declared,
            self.entity,
            self.increment_size
        );
        match self.mismatch {
            SequenceMismatchStrategy::Exception => Err(OrmError::SequenceMismatch(message)),
            SequenceMismatchStrategy::Log => {
                warn!("{}", message);
                Ok(self.increment_size)
            }
            SequenceMismatchStrategy::Fix => {
                warn!("{}; using the database increment", message);
                Ok(declared)
            }
            SequenceMismatchStrategy::None => Ok(self.increment_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jdbc::MemoryDatabase;
    use crate::sql::AnsiDialect;

    fn sequence(increment_size: i64, optimizer: Option<&str>) -> GeneratorMapping {
        GeneratorMapping::Sequence {
            sequence_name: "order_seq".into(),
            initial_value: 1,
            increment_size,
            optimizer: optimizer.map(str::to_string),
        }
    }

    #[test]
    fn test_assigned_generates_nothing() {
        let db = MemoryDatabase::new();
        let generator =
            IdentifierGenerator::from_mapping("Order", &GeneratorMapping::Assigned, &AnsiDialect, &Settings::default()).unwrap();
        assert!(generator.is_assigned());
        assert_eq!(generator.generate(&db).unwrap(), None);
    }

    #[test]
    fn test_pooled_sequence_batches_round_trips() {
        let db = MemoryDatabase::new();
        db.create_sequence("order_seq", 1, 20).unwrap();
        let generator =
            IdentifierGenerator::from_mapping("Order", &sequence(20, None), &AnsiDialect, &Settings::default()).unwrap();
        let ids: Vec<Value> = (0..21).map(|_| generator.generate(&db).unwrap().unwrap()).collect();
        assert_eq!(ids.first(), Some(&Value::Integer(1)));
        assert_eq!(ids.last(), Some(&Value::Integer(21)));
        assert_eq!(db.count_statements("select next value").unwrap(), 2);
        assert_eq!(generator.generate(&db).unwrap(), Some(Value::Integer(22)));
        assert_eq!(db.count_statements("select next value").unwrap(), 3);
    }

    #[test]
    fn test_mismatch_exception() {
        let db = MemoryDatabase::new();
        db.create_sequence("order_seq", 1, 50).unwrap();
        let generator =
            IdentifierGenerator::from_mapping("Order", &sequence(20, None), &AnsiDialect, &Settings::default()).unwrap();
        assert!(matches!(generator.generate(&db), Err(OrmError::SequenceMismatch(_))));
    }

    #[test]
    fn test_mismatch_fix_uses_database_increment() {
        let db = MemoryDatabase::new();
        db.create_sequence("order_seq", 1, 50).unwrap();
        let settings = Settings::default().sequence_mismatch_strategy(SequenceMismatchStrategy::Fix);
        let generator = IdentifierGenerator::from_mapping("Order", &sequence(20, None), &AnsiDialect, &settings).unwrap();
        generator.generate(&db).unwrap();
        let IdentifierGenerator::SequenceStyle(inner) = &generator else {
            panic!("expected a sequence generator");
        };
        assert_eq!(inner.increment_size().unwrap(), 50);
    }

    #[test]
    fn test_hilo_ignores_mismatch() {
        let db = MemoryDatabase::new();
        db.create_sequence("order_seq", 1, 1).unwrap();
        let generator =
            IdentifierGenerator::from_mapping("Order", &sequence(3, Some("hilo")), &AnsiDialect, &Settings::default()).unwrap();
        let ids: Vec<Value> = (0..4).map(|_| generator.generate(&db).unwrap().unwrap()).collect();
        assert_eq!(ids, vec![3.into(), 4.into(), 5.into(), 6.into()]);
    }

    #[test]
    fn test_table_generator() {
        let db = MemoryDatabase::new();
        db.create_table("id_gen", &["sequence_name", "next_val"]).unwrap();
        let mapping = GeneratorMapping::Table {
            table: "id_gen".into(),
            segment_column: "sequence_name".into(),
            segment_value: "orders".into(),
            value_column: "next_val".into(),
            initial_value: 1,
            increment_size: 5,
            optimizer: Some("pooled-lo".into()),
        };
        let generator = IdentifierGenerator::from_mapping("Order", &mapping, &AnsiDialect, &Settings::default()).unwrap();
        let ids: Vec<Value> = (0..6).map(|_| generator.generate(&db).unwrap().unwrap()).collect();
        assert_eq!(ids, vec![1.into(), 2.into(), 3.into(), 4.into(), 5.into(), 6.into()]);
    }
}
