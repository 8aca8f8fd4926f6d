use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{OrmError, Result, SqlType};

/// Shape of a generated stored routine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineSignature {
    pub name: String,
    pub parameter_types: Vec<SqlType>,
    /// Column types when the wrapped statement returns rows
    pub result_types: Option<Vec<SqlType>>,
}

/// Per-database rendering tables.
pub trait Dialect: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn open_quote(&self) -> char {
        '"'
    }

    fn close_quote(&self) -> char {
        '"'
    }

    /// Quote identifiers that are not plain lower-case words.
    fn quote_identifier(&self, identifier: &str) -> String {
        let plain = identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !identifier.starts_with(|c: char| c.is_ascii_digit());
        if plain {
            identifier.to_string()
        } else {
            format!("{}{}{}", self.open_quote(), identifier, self.close_quote())
        }
    }

    fn limit_clause(&self, limit: Option<usize>, offset: Option<usize>) -> String {
        let mut sql = String::new();
        if let Some(offset) = offset {
            sql.push_str(&format!(" offset {} rows", offset));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" fetch first {} rows only", limit));
        }
        sql
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn sequence_next_value(&self, sequence: &str) -> Result<String> {
        Ok(format!("next value for {}", self.quote_identifier(sequence)))
    }

    fn for_update_string(&self) -> &'static str {
        " for update"
    }

    fn max_identifier_length(&self) -> usize {
        128
    }

    fn supports_stored_procedures(&self) -> bool {
        false
    }

    /// How a routine body refers to its n-th (1-based) parameter.
    fn routine_parameter(&self, index: usize) -> String {
        format!("p{}", index)
    }

    fn create_routine_ddl(&self, signature: &RoutineSignature, _body: &str) -> Result<String> {
        Err(OrmError::Configuration(format!(
            "Dialect {} does not support stored procedure wrapping (routine {})",
            self.name(),
            signature.name
        )))
    }

    fn call_routine(&self, signature: &RoutineSignature) -> String {
        format!(
            "call {}({})",
            signature.name,
            placeholders(signature.parameter_types.len())
        )
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// ANSI / H2 style rendering, no routine support
#[derive(Debug, Default, Clone, Copy)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn name(&self) -> &'static str {
        "ansi"
    }

    fn max_identifier_length(&self) -> usize {
        256
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgreSqlDialect;

impl Dialect for PostgreSqlDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn limit_clause(&self, limit: Option<usize>, offset: Option<usize>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" limit {}", limit));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" offset {}", offset));
        }
        sql
    }

    fn sequence_next_value(&self, sequence: &str) -> Result<String> {
        Ok(format!("nextval('{}')", sequence))
    }

    fn max_identifier_length(&self) -> usize {
        63
    }

    fn supports_stored_procedures(&self) -> bool {
        true
    }

    fn routine_parameter(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn create_routine_ddl(&self, signature: &RoutineSignature, body: &str) -> Result<String> {
        let parameters = signature
            .parameter_types
            .iter()
            .enumerate()
            .map(|(i, t)| format!("p{} {}", i + 1, t.sql_name()))
            .collect::<Vec<_>>()
            .join(", ");
        let returns = match &signature.result_types {
            Some(columns) => format!(
                "table({})",
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, t)| format!("c{} {}", i, t.sql_name()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => "void".to_string(),
        };
        Ok(format!(
            "create or replace function {}({}) returns {} as $$ {} $$ language sql",
            signature.name, parameters, returns, body
        ))
    }

    fn call_routine(&self, signature: &RoutineSignature) -> String {
        let args = placeholders(signature.parameter_types.len());
        match signature.result_types {
            Some(_) => format!("select * from {}({})", signature.name, args),
            None => format!("select {}({})", signature.name, args),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn open_quote(&self) -> char {
        '`'
    }

    fn close_quote(&self) -> char {
        '`'
    }

    fn limit_clause(&self, limit: Option<usize>, offset: Option<usize>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" limit {}, {}", offset, limit),
            (Some(limit), None) => format!(" limit {}", limit),
            (None, Some(offset)) => format!(" limit {}, 18446744073709551615", offset),
            (None, None) => String::new(),
        }
    }

    fn supports_sequences(&self) -> bool {
        false
    }

    fn sequence_next_value(&self, sequence: &str) -> Result<String> {
        Err(OrmError::Configuration(format!(
            "Dialect mysql does not support sequences (requested {})",
            sequence
        )))
    }

    fn max_identifier_length(&self) -> usize {
        64
    }

    fn supports_stored_procedures(&self) -> bool {
        true
    }

    fn create_routine_ddl(&self, signature: &RoutineSignature, body: &str) -> Result<String> {
        let parameters = signature
            .parameter_types
            .iter()
            .enumerate()
            .map(|(i, t)| format!("in p{} {}", i + 1, t.sql_name()))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "create procedure {}({}) begin {}; end",
            signature.name, parameters, body
        ))
    }
}

/// Resolve a dialect by its configured name.
pub fn dialect_for_name(name: &str) -> Result<Arc<dyn Dialect>> {
    match name.to_ascii_lowercase().as_str() {
        "ansi" | "h2" => Ok(Arc::new(AnsiDialect)),
        "postgresql" | "postgres" | "pg" => Ok(Arc::new(PostgreSqlDialect)),
        "mysql" | "mariadb" => Ok(Arc::new(MySqlDialect)),
        other => Err(OrmError::Configuration(format!("Unknown dialect '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(result_types: Option<Vec<SqlType>>) -> RoutineSignature {
        RoutineSignature {
            name: "ormkit_orders_insert".into(),
            parameter_types: vec![SqlType::Integer, SqlType::Text],
            result_types,
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(AnsiDialect.quote_identifier("orders"), "orders");
        assert_eq!(AnsiDialect.quote_identifier("Order"), "\"Order\"");
        assert_eq!(MySqlDialect.quote_identifier("Order"), "`Order`");
    }

    #[test]
    fn test_limit_rendering() {
        assert_eq!(PostgreSqlDialect.limit_clause(Some(10), Some(5)), " limit 10 offset 5");
        assert_eq!(MySqlDialect.limit_clause(Some(10), Some(5)), " limit 5, 10");
        assert_eq!(
            AnsiDialect.limit_clause(Some(10), None),
            " fetch first 10 rows only"
        );
    }

    #[test]
    fn test_routine_ddl() {
        assert!(AnsiDialect.create_routine_ddl(&signature(None), "x").is_err());

        let ddl = PostgreSqlDialect
            .create_routine_ddl(&signature(None), "insert into orders (id, status) values ($1, $2)")
            .unwrap();
        assert!(ddl.starts_with("create or replace function ormkit_orders_insert(p1 bigint, p2 varchar(255)) returns void"));

        let call = PostgreSqlDialect.call_routine(&signature(Some(vec![SqlType::Integer])));
        assert_eq!(call, "select * from ormkit_orders_insert(?, ?)");
        assert_eq!(MySqlDialect.call_routine(&signature(None)), "call ormkit_orders_insert(?, ?)");
    }

    #[test]
    fn test_dialect_for_name() {
        assert_eq!(dialect_for_name("Postgres").unwrap().name(), "postgresql");
        assert!(dialect_for_name("oracle").is_err());
    }
}
