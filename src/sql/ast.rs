use crate::core::{SqlType, Value};

/// Root statement type
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(QuerySpec),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Call(CallStatement),
}

impl Statement {
    pub fn is_query(&self) -> bool {
        match self {
            Statement::Select(_) => true,
            Statement::Call(call) => call.returns_rows,
            _ => false,
        }
    }

    /// Tables read or written by the statement.
    pub fn affected_tables(&self) -> Vec<String> {
        match self {
            Statement::Select(spec) => spec.table_names(),
            Statement::Insert(insert) => vec![insert.table.clone()],
            Statement::Update(update) => vec![update.table.clone()],
            Statement::Delete(delete) => vec![delete.table.clone()],
            Statement::Call(_) => Vec::new(),
        }
    }

    /// Short label used in logs and routine names.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "select",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
            Statement::Call(_) => "call",
        }
    }
}

/// SELECT query specification
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpec {
    pub select: SelectClause,
    pub from: Option<FromClause>,
    pub selection: Option<Expr>,
    pub order_by: Vec<SortSpecification>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub for_update: bool,
}

impl QuerySpec {
    pub fn new(from: FromClause) -> Self {
        Self {
            from: Some(from),
            ..Default::default()
        }
    }

    /// Append a selection and return its result-set offset.
    pub fn add_selection(&mut self, expr: Expr, alias: Option<String>, sql_type: SqlType) -> usize {
        self.select.items.push(SqlSelection {
            expr,
            alias,
            sql_type,
        });
        self.select.items.len() - 1
    }

    /// AND a predicate into the WHERE clause.
    pub fn restrict(&mut self, predicate: Expr) {
        self.selection = Some(match self.selection.take() {
            Some(existing) => Expr::and(vec![existing, predicate]),
            None => predicate,
        });
    }

    pub fn column_types(&self) -> Vec<SqlType> {
        self.select.items.iter().map(|item| item.sql_type).collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        match &self.from {
            Some(from) => from.tables().map(|t| t.table.clone()).collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectClause {
    pub distinct: bool,
    pub items: Vec<SqlSelection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlSelection {
    pub expr: Expr,
    pub alias: Option<String>,
    pub sql_type: SqlType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub root: TableReference,
    pub joins: Vec<TableJoin>,
}

impl FromClause {
    pub fn new(root: TableReference) -> Self {
        Self {
            root,
            joins: Vec::new(),
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableReference> {
        std::iter::once(&self.root).chain(self.joins.iter().map(|j| &j.table))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableReference {
    pub table: String,
    pub alias: String,
}

impl TableReference {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableJoin {
    pub kind: JoinKind,
    pub table: TableReference,
    pub predicate: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpecification {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub selection: Option<Expr>,
}

/// Invocation of a generated stored routine
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatement {
    pub routine: String,
    pub arguments: Vec<Expr>,
    pub returns_rows: bool,
    pub result_types: Vec<SqlType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnReference {
    pub qualifier: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterMarker {
    /// Index into the positional binding list
    Positional(usize),
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JdbcParameter {
    pub marker: ParameterMarker,
    pub sql_type: SqlType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl ComparisonOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
        }
    }

    pub fn negate(&self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::LessThan => Self::GreaterThanOrEqual,
            Self::LessThanOrEqual => Self::GreaterThan,
            Self::GreaterThan => Self::LessThanOrEqual,
            Self::GreaterThanOrEqual => Self::LessThan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionKind {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnReference),
    Literal(Value),
    Parameter(JdbcParameter),
    Comparison {
        left: Box<Expr>,
        op: ComparisonOperator,
        right: Box<Expr>,
    },
    Junction {
        kind: JunctionKind,
        items: Vec<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<QuerySpec>,
        negated: bool,
    },
    /// Row value constructor `(a, b)`
    Tuple(Vec<Expr>),
    NextValue {
        sequence: String,
    },
}

impl Expr {
    pub fn column(qualifier: Option<&str>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnReference {
            qualifier: qualifier.map(str::to_string),
            column: column.into(),
        })
    }

    pub fn positional(index: usize, sql_type: SqlType) -> Self {
        Expr::Parameter(JdbcParameter {
            marker: ParameterMarker::Positional(index),
            sql_type,
        })
    }

    pub fn named(name: impl Into<String>, sql_type: SqlType) -> Self {
        Expr::Parameter(JdbcParameter {
            marker: ParameterMarker::Named(name.into()),
            sql_type,
        })
    }

    pub fn compare(left: Expr, op: ComparisonOperator, right: Expr) -> Self {
        Expr::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(left, ComparisonOperator::Equal, right)
    }

    pub fn and(items: Vec<Expr>) -> Self {
        Self::junction(JunctionKind::And, items)
    }

    pub fn or(items: Vec<Expr>) -> Self {
        Self::junction(JunctionKind::Or, items)
    }

    fn junction(kind: JunctionKind, mut items: Vec<Expr>) -> Self {
        if items.len() == 1 {
            return items.remove(0);
        }
        Expr::Junction { kind, items }
    }

    /// Single expression or a row value constructor for several.
    pub fn tuple_or_single(mut items: Vec<Expr>) -> Self {
        if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        }
    }

    /// Visit every JDBC parameter in rendering order.
    pub fn visit_parameters<'a>(&'a self, out: &mut Vec<&'a JdbcParameter>) {
        match self {
            Expr::Parameter(p) => out.push(p),
            Expr::Comparison { left, right, .. } => {
                left.visit_parameters(out);
                right.visit_parameters(out);
            }
            Expr::Junction { items, .. } | Expr::Tuple(items) => {
                for item in items {
                    item.visit_parameters(out);
                }
            }
            Expr::Not(inner) | Expr::IsNull { expr: inner, .. } => inner.visit_parameters(out),
            Expr::InList { expr, list, .. } => {
                expr.visit_parameters(out);
                for item in list {
                    item.visit_parameters(out);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                expr.visit_parameters(out);
                if let Some(selection) = &subquery.selection {
                    selection.visit_parameters(out);
                }
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::NextValue { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_item_junction_collapses() {
        let eq = Expr::eq(Expr::column(Some("o"), "id"), Expr::positional(0, SqlType::Integer));
        assert_eq!(Expr::and(vec![eq.clone()]), eq);
        assert!(matches!(
            Expr::or(vec![eq.clone(), eq]),
            Expr::Junction {
                kind: JunctionKind::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_restrict_ands_predicates() {
        let mut spec = QuerySpec::new(FromClause::new(TableReference::new("orders", "o")));
        spec.restrict(Expr::eq(Expr::column(Some("o"), "id"), Expr::positional(0, SqlType::Integer)));
        spec.restrict(Expr::IsNull {
            expr: Box::new(Expr::column(Some("o"), "deleted")),
            negated: false,
        });
        let mut params = Vec::new();
        spec.selection.as_ref().unwrap().visit_parameters(&mut params);
        assert_eq!(params.len(), 1);
        assert!(matches!(
            spec.selection,
            Some(Expr::Junction {
                kind: JunctionKind::And,
                ..
            })
        ));
    }
}
