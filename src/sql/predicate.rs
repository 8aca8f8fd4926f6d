use crate::core::{SqlType, Value};

use super::ast::{ComparisonOperator, Expr, JunctionKind};
use super::render::ParameterBindings;

/// Accumulates WHERE-clause conditions together with the values they bind.
#[derive(Debug, Clone)]
pub struct PredicateBuilder {
    kind: JunctionKind,
    items: Vec<Expr>,
    bindings: ParameterBindings,
}

impl PredicateBuilder {
    pub fn conjunction() -> Self {
        Self::with_bindings(JunctionKind::And, ParameterBindings::new())
    }

    pub fn disjunction() -> Self {
        Self::with_bindings(JunctionKind::Or, ParameterBindings::new())
    }

    /// Continue numbering positional parameters after existing bindings.
    pub fn with_bindings(kind: JunctionKind, bindings: ParameterBindings) -> Self {
        Self {
            kind,
            items: Vec::new(),
            bindings,
        }
    }

    /// `alias.column <op> ?`, binding the value positionally
    pub fn add_where_with_param(
        &mut self,
        alias: Option<&str>,
        column: &str,
        op: ComparisonOperator,
        value: Value,
        sql_type: SqlType,
    ) {
        let predicate = if value.is_null() {
            Expr::IsNull {
                expr: Box::new(Expr::column(alias, column)),
                negated: op == ComparisonOperator::NotEqual,
            }
        } else {
            let index = self.bindings.push(value);
            Expr::compare(Expr::column(alias, column), op, Expr::positional(index, sql_type))
        };
        self.items.push(predicate);
    }

    /// `alias.column <op> :name`; the value is bound later by name
    pub fn add_where_with_named_param(
        &mut self,
        alias: Option<&str>,
        column: &str,
        op: ComparisonOperator,
        name: &str,
        sql_type: SqlType,
    ) {
        self.items.push(Expr::compare(
            Expr::column(alias, column),
            op,
            Expr::named(name, sql_type),
        ));
    }

    /// `aliasA.columnA <op> aliasB.columnB`
    pub fn add_where_columns(
        &mut self,
        left_alias: Option<&str>,
        left_column: &str,
        op: ComparisonOperator,
        right_alias: Option<&str>,
        right_column: &str,
    ) {
        self.items.push(Expr::compare(
            Expr::column(left_alias, left_column),
            op,
            Expr::column(right_alias, right_column),
        ));
    }

    pub fn add(&mut self, predicate: Expr) {
        self.items.push(predicate);
    }

    /// Nested group sharing this builder's parameter numbering.
    pub fn add_sub_group<F>(&mut self, kind: JunctionKind, build: F)
    where
        F: FnOnce(&mut PredicateBuilder),
    {
        let mut sub = PredicateBuilder::with_bindings(kind, std::mem::take(&mut self.bindings));
        build(&mut sub);
        let (predicate, bindings) = sub.build();
        self.bindings = bindings;
        if let Some(predicate) = predicate {
            self.items.push(predicate);
        }
    }

    pub fn bindings_mut(&mut self) -> &mut ParameterBindings {
        &mut self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn build(self) -> (Option<Expr>, ParameterBindings) {
        let predicate = match self.items.len() {
            0 => None,
            _ => Some(match self.kind {
                JunctionKind::And => Expr::and(self.items),
                JunctionKind::Or => Expr::or(self.items),
            }),
        };
        (predicate, self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::{DeleteStatement, Statement};
    use crate::sql::dialect::AnsiDialect;
    use crate::sql::render::SqlAstRenderer;

    fn render(predicate: Expr) -> String {
        let statement = Statement::Delete(DeleteStatement {
            table: "t".into(),
            selection: Some(predicate),
        });
        SqlAstRenderer::render(&statement, &AnsiDialect).unwrap().sql
    }

    #[test]
    fn test_conjunction_with_positional_params() {
        let mut builder = PredicateBuilder::conjunction();
        builder.add_where_with_param(None, "a", ComparisonOperator::Equal, Value::Integer(1), SqlType::Integer);
        builder.add_where_with_param(None, "b", ComparisonOperator::Equal, Value::Null, SqlType::Text);
        let (predicate, bindings) = builder.build();
        assert_eq!(render(predicate.unwrap()), "delete from t where (a=? and b is null)");
        assert_eq!(bindings.positional_len(), 1);
    }

    #[test]
    fn test_sub_group_shares_numbering() {
        let mut builder = PredicateBuilder::conjunction();
        builder.add_where_with_param(None, "v", ComparisonOperator::Equal, Value::Integer(3), SqlType::Integer);
        builder.add_sub_group(JunctionKind::Or, |group| {
            group.add_where_with_param(None, "a", ComparisonOperator::NotEqual, Value::Integer(1), SqlType::Integer);
            group.add_where_with_param(None, "b", ComparisonOperator::NotEqual, Value::Integer(2), SqlType::Integer);
        });
        let (predicate, bindings) = builder.build();
        assert_eq!(render(predicate.unwrap()), "delete from t where (v=? and (a<>? or b<>?))");
        assert_eq!(bindings.positional_len(), 3);
    }
}
