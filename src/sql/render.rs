use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{OrmError, Result, SqlType, Value};

use super::ast::*;
use super::dialect::{Dialect, RoutineSignature};

/// Values for the parameters of one statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBindings {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl ParameterBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: HashMap::new(),
        }
    }

    /// Append a positional value, returning its marker index.
    pub fn push(&mut self, value: Value) -> usize {
        self.positional.push(value);
        self.positional.len() - 1
    }

    pub fn set_named(&mut self, name: impl Into<String>, value: Value) {
        self.named.insert(name.into(), value);
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    pub fn resolve(&self, parameter: &JdbcParameter) -> Result<&Value> {
        match &parameter.marker {
            ParameterMarker::Positional(index) => self.positional.get(*index).ok_or_else(|| {
                OrmError::Jdbc(format!("No value bound for positional parameter {}", index + 1))
            }),
            ParameterMarker::Named(name) => self
                .named
                .get(name)
                .ok_or_else(|| OrmError::Jdbc(format!("No value bound for named parameter :{}", name))),
        }
    }
}

/// Output of rendering: SQL text plus parameters in text order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub sql: String,
    pub parameters: Vec<JdbcParameter>,
    pub statement: Arc<Statement>,
}

impl RenderedStatement {
    /// Bound values in placeholder order, type checked against each binder.
    pub fn bind(&self, bindings: &ParameterBindings) -> Result<Vec<Value>> {
        self.parameters
            .iter()
            .enumerate()
            .map(|(position, parameter)| {
                let value = bindings.resolve(parameter)?;
                if !parameter.sql_type.is_compatible(value) {
                    return Err(OrmError::Jdbc(format!(
                        "Parameter {} of [{}] expects {}, got {}",
                        position + 1,
                        self.sql,
                        parameter.sql_type,
                        value.type_name()
                    )));
                }
                Ok(value.clone())
            })
            .collect()
    }

    pub fn parameter_types(&self) -> Vec<SqlType> {
        self.parameters.iter().map(|p| p.sql_type).collect()
    }
}

enum ParameterStyle {
    Placeholder,
    RoutineBody,
}

/// Renders a statement tree into dialect-specific SQL text.
pub struct SqlAstRenderer<'a> {
    dialect: &'a dyn Dialect,
    style: ParameterStyle,
    sql: String,
    parameters: Vec<JdbcParameter>,
}

impl<'a> SqlAstRenderer<'a> {
    pub fn render(statement: &Statement, dialect: &'a dyn Dialect) -> Result<RenderedStatement> {
        let mut renderer = Self::new(dialect, ParameterStyle::Placeholder);
        renderer.visit_statement(statement)?;
        Ok(RenderedStatement {
            sql: renderer.sql,
            parameters: renderer.parameters,
            statement: Arc::new(statement.clone()),
        })
    }

    /// Render for use inside a routine body: parameters become routine arguments.
    pub fn render_routine_body(statement: &Statement, dialect: &'a dyn Dialect) -> Result<String> {
        let mut renderer = Self::new(dialect, ParameterStyle::RoutineBody);
        renderer.visit_statement(statement)?;
        Ok(renderer.sql)
    }

    fn new(dialect: &'a dyn Dialect, style: ParameterStyle) -> Self {
        Self {
            dialect,
            style,
            sql: String::new(),
            parameters: Vec::new(),
        }
    }

    fn visit_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Select(spec) => self.visit_query_spec(spec),
            Statement::Insert(insert) => {
                self.sql.push_str("insert into ");
                self.push_identifier(&insert.table);
                self.sql.push_str(" (");
                for (i, column) in insert.columns.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.push_identifier(column);
                }
                self.sql.push_str(") values (");
                self.visit_comma_separated(&insert.values)?;
                self.sql.push(')');
                Ok(())
            }
            Statement::Update(update) => {
                self.sql.push_str("update ");
                self.push_identifier(&update.table);
                self.sql.push_str(" set ");
                for (i, assignment) in update.assignments.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.push_identifier(&assignment.column);
                    self.sql.push_str("=");
                    self.visit_expr(&assignment.value)?;
                }
                self.visit_where(update.selection.as_ref())
            }
            Statement::Delete(delete) => {
                self.sql.push_str("delete from ");
                self.push_identifier(&delete.table);
                self.visit_where(delete.selection.as_ref())
            }
            Statement::Call(call) => {
                let signature = RoutineSignature {
                    name: call.routine.clone(),
                    parameter_types: call
                        .arguments
                        .iter()
                        .map(|arg| match arg {
                            Expr::Parameter(p) => Ok(p.sql_type),
                            other => Err(OrmError::IllegalState(format!(
                                "Routine arguments must be parameters, got {:?}",
                                other
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    result_types: call.returns_rows.then(|| call.result_types.clone()),
                };
                self.sql.push_str(&self.dialect.call_routine(&signature));
                for arg in &call.arguments {
                    if let Expr::Parameter(p) = arg {
                        self.parameters.push(p.clone());
                    }
                }
                Ok(())
            }
        }
    }

    fn visit_query_spec(&mut self, spec: &QuerySpec) -> Result<()> {
        self.sql.push_str("select ");
        if spec.select.distinct {
            self.sql.push_str("distinct ");
        }
        for (i, item) in spec.select.items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.visit_expr(&item.expr)?;
            if let Some(alias) = &item.alias {
                self.sql.push_str(" as ");
                self.sql.push_str(alias);
            }
        }

        if let Some(from) = &spec.from {
            self.sql.push_str(" from ");
            self.push_table(&from.root);
            for join in &from.joins {
                self.sql.push_str(match join.kind {
                    JoinKind::Inner => " inner join ",
                    JoinKind::LeftOuter => " left outer join ",
                });
                self.push_table(&join.table);
                self.sql.push_str(" on ");
                self.visit_expr(&join.predicate)?;
            }
        }

        self.visit_where(spec.selection.as_ref())?;

        if !spec.order_by.is_empty() {
            self.sql.push_str(" order by ");
            for (i, sort) in spec.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.visit_expr(&sort.expr)?;
                if sort.descending {
                    self.sql.push_str(" desc");
                }
            }
        }

        let limit = self.dialect.limit_clause(spec.limit, spec.offset);
        self.sql.push_str(&limit);

        if spec.for_update {
            self.sql.push_str(self.dialect.for_update_string());
        }
        Ok(())
    }

    fn visit_where(&mut self, selection: Option<&Expr>) -> Result<()> {
        if let Some(predicate) = selection {
            self.sql.push_str(" where ");
            self.visit_expr(predicate)?;
        }
        Ok(())
    }

    fn visit_comma_separated(&mut self, items: &[Expr]) -> Result<()> {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.visit_expr(item)?;
        }
        Ok(())
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Column(column) => {
                if let Some(qualifier) = &column.qualifier {
                    self.sql.push_str(qualifier);
                    self.sql.push('.');
                }
                self.push_identifier(&column.column);
            }
            Expr::Literal(value) => self.push_literal(value),
            Expr::Parameter(parameter) => {
                self.parameters.push(parameter.clone());
                match self.style {
                    ParameterStyle::Placeholder => self.sql.push('?'),
                    ParameterStyle::RoutineBody => {
                        let marker = self.dialect.routine_parameter(self.parameters.len());
                        self.sql.push_str(&marker);
                    }
                }
            }
            Expr::Comparison { left, op, right } => {
                self.visit_expr(left)?;
                self.sql.push_str(op.sql());
                self.visit_expr(right)?;
            }
            Expr::Junction { kind, items } => {
                if items.is_empty() {
                    // Empty AND is true, empty OR is false
                    self.sql.push_str(match kind {
                        JunctionKind::And => "1=1",
                        JunctionKind::Or => "1=0",
                    });
                    return Ok(());
                }
                let separator = match kind {
                    JunctionKind::And => " and ",
                    JunctionKind::Or => " or ",
                };
                self.sql.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(separator);
                    }
                    self.visit_expr(item)?;
                }
                self.sql.push(')');
            }
            Expr::Not(inner) => {
                self.sql.push_str("not (");
                self.visit_expr(inner)?;
                self.sql.push(')');
            }
            Expr::IsNull { expr, negated } => {
                self.visit_expr(expr)?;
                self.sql.push_str(if *negated { " is not null" } else { " is null" });
            }
            Expr::InList { expr, list, negated } => {
                self.visit_expr(expr)?;
                self.sql.push_str(if *negated { " not in (" } else { " in (" });
                self.visit_comma_separated(list)?;
                self.sql.push(')');
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                self.visit_expr(expr)?;
                self.sql.push_str(if *negated { " not in (" } else { " in (" });
                self.visit_query_spec(subquery)?;
                self.sql.push(')');
            }
            Expr::Tuple(items) => {
                self.sql.push('(');
                self.visit_comma_separated(items)?;
                self.sql.push(')');
            }
            Expr::NextValue { sequence } => {
                let next = self.dialect.sequence_next_value(sequence)?;
                self.sql.push_str(&next);
            }
        }
        Ok(())
    }

    fn push_table(&mut self, table: &TableReference) {
        self.push_identifier(&table.table);
        self.sql.push(' ');
        self.sql.push_str(&table.alias);
    }

    fn push_identifier(&mut self, identifier: &str) {
        let quoted = self.dialect.quote_identifier(identifier);
        self.sql.push_str(&quoted);
    }

    fn push_literal(&mut self, value: &Value) {
        match value {
            Value::Null => self.sql.push_str("null"),
            Value::Text(s) => {
                self.sql.push('\'');
                self.sql.push_str(&s.replace('\'', "''"));
                self.sql.push('\'');
            }
            other => self.sql.push_str(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::dialect::{AnsiDialect, PostgreSqlDialect};

    fn order_load() -> Statement {
        let mut from = FromClause::new(TableReference::new("orders", "orders0_"));
        from.joins.push(TableJoin {
            kind: JoinKind::LeftOuter,
            table: TableReference::new("payment", "payment1_"),
            predicate: Expr::eq(
                Expr::column(Some("orders0_"), "payment_id"),
                Expr::column(Some("payment1_"), "id"),
            ),
        });
        let mut spec = QuerySpec::new(from);
        spec.add_selection(Expr::column(Some("orders0_"), "id"), Some("id0_0_".into()), SqlType::Integer);
        spec.add_selection(Expr::column(Some("payment1_"), "id"), Some("id0_1_".into()), SqlType::Integer);
        spec.restrict(Expr::eq(
            Expr::column(Some("orders0_"), "id"),
            Expr::positional(0, SqlType::Integer),
        ));
        Statement::Select(spec)
    }

    #[test]
    fn test_render_select_with_join() {
        let rendered = SqlAstRenderer::render(&order_load(), &AnsiDialect).unwrap();
        assert_eq!(
            rendered.sql,
            "select orders0_.id as id0_0_, payment1_.id as id0_1_ from orders orders0_ \
             left outer join payment payment1_ on orders0_.payment_id=payment1_.id \
             where orders0_.id=?"
        );
        assert_eq!(rendered.parameters.len(), 1);
    }

    #[test]
    fn test_bind_checks_types() {
        let rendered = SqlAstRenderer::render(&order_load(), &AnsiDialect).unwrap();
        let ok = ParameterBindings::from_positional(vec![Value::Integer(7)]);
        assert_eq!(rendered.bind(&ok).unwrap(), vec![Value::Integer(7)]);

        let wrong = ParameterBindings::from_positional(vec![Value::Text("x".into())]);
        assert!(rendered.bind(&wrong).is_err());
        assert!(rendered.bind(&ParameterBindings::new()).is_err());
    }

    #[test]
    fn test_render_mutations_and_named_parameters() {
        let update = Statement::Update(UpdateStatement {
            table: "orders".into(),
            assignments: vec![Assignment {
                column: "status".into(),
                value: Expr::named("status", SqlType::Text),
            }],
            selection: Some(Expr::eq(Expr::column(None, "id"), Expr::named("id", SqlType::Integer))),
        });
        let rendered = SqlAstRenderer::render(&update, &AnsiDialect).unwrap();
        assert_eq!(rendered.sql, "update orders set status=? where id=?");

        let mut bindings = ParameterBindings::new();
        bindings.set_named("id", Value::Integer(1));
        bindings.set_named("status", Value::Text("NEW".into()));
        assert_eq!(
            rendered.bind(&bindings).unwrap(),
            vec![Value::Text("NEW".into()), Value::Integer(1)]
        );
    }

    #[test]
    fn test_routine_body_uses_dialect_markers() {
        let body = SqlAstRenderer::render_routine_body(&order_load(), &PostgreSqlDialect).unwrap();
        assert!(body.ends_with("where orders0_.id=$1"));
    }

    #[test]
    fn test_literal_escaping() {
        let delete = Statement::Delete(DeleteStatement {
            table: "orders".into(),
            selection: Some(Expr::eq(
                Expr::column(None, "status"),
                Expr::Literal(Value::Text("it's".into())),
            )),
        });
        let rendered = SqlAstRenderer::render(&delete, &AnsiDialect).unwrap();
        assert_eq!(rendered.sql, "delete from orders where status='it''s'");
    }
}
