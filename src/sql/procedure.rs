// ============================================================================
// Stored-procedure wrapping of rendered statements
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::core::{OrmError, Result, SqlType};
use crate::jdbc::RoutineDefinition;

use super::ast::{CallStatement, Expr, Statement};
use super::dialect::{Dialect, RoutineSignature};
use super::render::{RenderedStatement, SqlAstRenderer};

lazy_static::lazy_static! {
    static ref NON_IDENTIFIER: Regex = Regex::new("[^a-z0-9_]+").expect("static pattern");
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RoutineKey {
    sql: String,
    parameter_types: Vec<SqlType>,
}

/// A generated routine and the statement that invokes it.
#[derive(Debug, Clone)]
pub struct WrappedRoutine {
    pub definition: RoutineDefinition,
    pub call: Arc<RenderedStatement>,
}

impl WrappedRoutine {
    pub fn name(&self) -> &str {
        &self.definition.signature.name
    }
}

#[derive(Debug, Clone)]
pub struct WrapOutcome {
    pub routine: Arc<WrappedRoutine>,
    /// True only for the caller whose call created the routine.
    pub first_use: bool,
}

#[derive(Default)]
struct Reservations {
    by_key: HashMap<RoutineKey, Arc<WrappedRoutine>>,
    names: HashSet<String>,
}

/// Rewrites statements into calls of generated stored routines.
///
/// One routine per distinct (SQL text, parameter types); reserved names are
/// made unique with a numeric suffix.
pub struct ProcedureWrapper {
    dialect: Arc<dyn Dialect>,
    prefix: String,
    reservations: Mutex<Reservations>,
}

impl ProcedureWrapper {
    pub fn new(dialect: Arc<dyn Dialect>, prefix: impl Into<String>) -> Result<Self> {
        if !dialect.supports_stored_procedures() {
            return Err(OrmError::Configuration(format!(
                "Stored procedure wrapping is not supported by dialect {}",
                dialect.name()
            )));
        }
        Ok(Self {
            dialect,
            prefix: prefix.into(),
            reservations: Mutex::new(Reservations::default()),
        })
    }

    /// Reserve or reuse the routine for `rendered` without creating it.
    pub fn wrap(&self, rendered: &RenderedStatement) -> Result<WrapOutcome> {
        self.wrap_with(rendered, |_| Ok(()))
    }

    /// Like `wrap`, running `create` with a new routine's definition before
    /// the reservation becomes visible. Other callers of the same shape wait
    /// until it returns; on failure nothing stays reserved.
    pub fn wrap_with<F>(&self, rendered: &RenderedStatement, create: F) -> Result<WrapOutcome>
    where
        F: FnOnce(&RoutineDefinition) -> Result<()>,
    {
        if matches!(rendered.statement.as_ref(), Statement::Call(_)) {
            return Err(OrmError::IllegalState(format!(
                "Statement is already a routine call: {}",
                rendered.sql
            )));
        }

        let parameter_types = rendered.parameter_types();
        let placeholders = count_placeholders(&rendered.sql)?;
        if placeholders != parameter_types.len() {
            return Err(OrmError::Configuration(format!(
                "Declared parameter types ({}) do not match JDBC parameter count ({}) for [{}]",
                parameter_types.len(),
                placeholders,
                rendered.sql
            )));
        }

        let key = RoutineKey {
            sql: rendered.sql.clone(),
            parameter_types: parameter_types.clone(),
        };

        let mut reservations = self.reservations.lock()?;
        if let Some(existing) = reservations.by_key.get(&key) {
            debug!("Reusing routine {} for [{}]", existing.name(), rendered.sql);
            return Ok(WrapOutcome {
                routine: existing.clone(),
                first_use: false,
            });
        }

        let name = self.unique_name(&reservations.names, rendered.statement.as_ref());
        let result_types = match rendered.statement.as_ref() {
            Statement::Select(spec) => Some(spec.column_types()),
            _ => None,
        };
        let signature = RoutineSignature {
            name: name.clone(),
            parameter_types,
            result_types: result_types.clone(),
        };

        let body = SqlAstRenderer::render_routine_body(&rendered.statement, self.dialect.as_ref())?;
        let ddl = self.dialect.create_routine_ddl(&signature, &body)?;

        let call = Statement::Call(CallStatement {
            routine: name.clone(),
            arguments: rendered.parameters.iter().cloned().map(Expr::Parameter).collect(),
            returns_rows: result_types.is_some(),
            result_types: result_types.unwrap_or_default(),
        });
        let call = SqlAstRenderer::render(&call, self.dialect.as_ref())?;

        let routine = Arc::new(WrappedRoutine {
            definition: RoutineDefinition {
                signature,
                ddl,
                body: rendered.statement.clone(),
            },
            call: Arc::new(call),
        });

        create(&routine.definition)?;
        info!("Reserved routine {} for [{}]", name, rendered.sql);
        reservations.names.insert(name);
        reservations.by_key.insert(key, routine.clone());
        Ok(WrapOutcome {
            routine,
            first_use: true,
        })
    }

    pub fn reserved_count(&self) -> Result<usize> {
        Ok(self.reservations.lock()?.by_key.len())
    }

    fn unique_name(&self, taken: &HashSet<String>, statement: &Statement) -> String {
        let table = statement
            .affected_tables()
            .into_iter()
            .next()
            .unwrap_or_else(|| "stmt".to_string());
        let raw = format!("{}_{}_{}", self.prefix, table, statement.kind()).to_ascii_lowercase();
        let mut base = NON_IDENTIFIER.replace_all(&raw, "_").into_owned();
        // leave room for a numeric suffix
        let max = self.dialect.max_identifier_length().saturating_sub(6).max(1);
        base.truncate(max);

        if !taken.contains(&base) {
            return base;
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{}_{}", base, suffix);
            if !taken.contains(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

/// Count JDBC placeholders in SQL text, ignoring literals and comments.
pub fn count_placeholders(sql: &str) -> Result<usize> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| OrmError::Configuration(format!("Cannot tokenize [{}]: {}", sql, e)))?;
    Ok(tokens
        .iter()
        .filter(|token| matches!(token, Token::Placeholder(p) if p == "?"))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::{InsertStatement, JdbcParameter, ParameterMarker};
    use crate::sql::dialect::{AnsiDialect, PostgreSqlDialect};

    fn insert(table: &str, columns: &[&str]) -> RenderedStatement {
        let statement = Statement::Insert(InsertStatement {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values: (0..columns.len())
                .map(|i| Expr::positional(i, SqlType::Integer))
                .collect(),
        });
        SqlAstRenderer::render(&statement, &PostgreSqlDialect).unwrap()
    }

    fn wrapper() -> ProcedureWrapper {
        ProcedureWrapper::new(Arc::new(PostgreSqlDialect), "ormkit").unwrap()
    }

    #[test]
    fn test_unsupported_dialect_is_configuration_error() {
        let err = ProcedureWrapper::new(Arc::new(AnsiDialect), "ormkit").err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_wrapping_is_idempotent_per_shape() {
        let wrapper = wrapper();
        let first = wrapper.wrap(&insert("orders", &["id", "status"])).unwrap();
        let second = wrapper.wrap(&insert("orders", &["id", "status"])).unwrap();

        assert!(first.first_use);
        assert!(!second.first_use);
        assert_eq!(first.routine.name(), second.routine.name());
        assert_eq!(first.routine.name(), "ormkit_orders_insert");
        assert_eq!(wrapper.reserved_count().unwrap(), 1);
        assert_eq!(first.routine.call.sql, "select ormkit_orders_insert(?, ?)");
        assert_eq!(first.routine.call.parameters, insert("orders", &["id", "status"]).parameters);
    }

    #[test]
    fn test_name_collision_gets_suffix() {
        let wrapper = wrapper();
        let a = wrapper.wrap(&insert("orders", &["id"])).unwrap();
        let b = wrapper.wrap(&insert("orders", &["id", "status"])).unwrap();
        assert_eq!(a.routine.name(), "ormkit_orders_insert");
        assert_eq!(b.routine.name(), "ormkit_orders_insert_2");
    }

    #[test]
    fn test_failed_creation_reserves_nothing() {
        let wrapper = wrapper();
        let statement = insert("orders", &["id"]);
        let err = wrapper
            .wrap_with(&statement, |_| Err(OrmError::Jdbc("permission denied".into())))
            .unwrap_err();
        assert!(matches!(err, OrmError::Jdbc(_)));
        assert_eq!(wrapper.reserved_count().unwrap(), 0);

        let retried = wrapper.wrap_with(&statement, |_| Ok(())).unwrap();
        assert!(retried.first_use);
        assert_eq!(retried.routine.name(), "ormkit_orders_insert");
    }

    #[test]
    fn test_routine_exists_before_any_caller_sees_it() {
        let wrapper = Arc::new(wrapper());
        let created = Arc::new(Mutex::new(HashSet::new()));
        let callers: Vec<_> = (0..8)
            .map(|_| {
                let (wrapper, created) = (Arc::clone(&wrapper), Arc::clone(&created));
                std::thread::spawn(move || {
                    let outcome = wrapper
                        .wrap_with(&insert("orders", &["id", "status"]), |definition| {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            created.lock().unwrap().insert(definition.signature.name.clone());
                            Ok(())
                        })
                        .unwrap();
                    assert!(created.lock().unwrap().contains(outcome.routine.name()));
                    outcome.first_use
                })
            })
            .collect();
        let first_uses = callers
            .into_iter()
            .map(|caller| caller.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(first_uses, 1);
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parameter_count_mismatch_is_fatal() {
        let mut rendered = insert("orders", &["id", "status"]);
        rendered.parameters.push(JdbcParameter {
            marker: ParameterMarker::Positional(2),
            sql_type: SqlType::Text,
        });
        let err = wrapper().wrap(&rendered).unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
    }

    #[test]
    fn test_placeholders_inside_literals_are_ignored() {
        assert_eq!(count_placeholders("select '?' from t where a = ? and b = ?").unwrap(), 2);
    }
}
