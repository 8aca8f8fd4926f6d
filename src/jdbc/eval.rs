// ============================================================================
// Statement evaluation for the in-memory backend
// ============================================================================

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::core::{OrmError, Result, Row, Value};

use super::change::Change;
use crate::sql::{
    ComparisonOperator, Expr, JoinKind, JunctionKind, ParameterBindings, QuerySpec, Statement,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySequence {
    pub next: i64,
    pub increment: i64,
}

pub type Tables = HashMap<String, MemoryTable>;
pub type Sequences = HashMap<String, MemorySequence>;

/// One joined row: a table binding per FROM item, `None` for an unmatched outer join.
#[derive(Clone)]
struct Scope<'a> {
    entries: Vec<(String, &'a MemoryTable, Option<&'a Row>)>,
}

impl<'a> Scope<'a> {
    fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    fn lookup(&self, qualifier: Option<&str>, column: &str) -> Result<Value> {
        for (alias, table, row) in &self.entries {
            if qualifier.is_some_and(|q| q != alias.as_str()) {
                continue;
            }
            if let Some(index) = table.column_index(column) {
                return Ok(row.map(|r| r[index].clone()).unwrap_or(Value::Null));
            }
        }
        Err(OrmError::Jdbc(format!(
            "Column '{}{}' not found",
            qualifier.map(|q| format!("{}.", q)).unwrap_or_default(),
            column
        )))
    }
}

/// Evaluates statement trees against a set of tables.
pub struct Evaluator<'a> {
    tables: &'a Tables,
    sequences: &'a mut Sequences,
    bindings: &'a ParameterBindings,
}

impl<'a> Evaluator<'a> {
    pub fn new(tables: &'a Tables, sequences: &'a mut Sequences, bindings: &'a ParameterBindings) -> Self {
        Self {
            tables,
            sequences,
            bindings,
        }
    }

    fn table(&self, name: &str) -> Result<&'a MemoryTable> {
        let tables: &'a Tables = self.tables;
        tables
            .get(name)
            .ok_or_else(|| OrmError::Jdbc(format!("Table '{}' not found", name)))
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    pub fn select(&mut self, spec: &QuerySpec) -> Result<Vec<Row>> {
        let scopes = self.joined_scopes(spec)?;

        let mut matched = Vec::new();
        for scope in scopes {
            let keep = match &spec.selection {
                Some(predicate) => self.eval(predicate, &scope)?.as_bool(),
                None => true,
            };
            if keep {
                matched.push(scope);
            }
        }

        let mut keyed = Vec::with_capacity(matched.len());
        for scope in &matched {
            let mut keys = Vec::with_capacity(spec.order_by.len());
            for sort in &spec.order_by {
                keys.push(self.eval(&sort.expr, scope)?);
            }
            let mut row = Vec::with_capacity(spec.select.items.len());
            for item in &spec.select.items {
                row.push(self.eval(&item.expr, scope)?);
            }
            keyed.push((keys, row));
        }

        if !spec.order_by.is_empty() {
            let mut failure = None;
            keyed.sort_by(|(a, _), (b, _)| {
                for (i, sort) in spec.order_by.iter().enumerate() {
                    let ordering = match a[i].compare(&b[i]) {
                        Ok(o) => o,
                        Err(e) => {
                            failure.get_or_insert(e);
                            Ordering::Equal
                        }
                    };
                    let ordering = if sort.descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let mut rows: Vec<Row> = keyed.into_iter().map(|(_, row)| row).collect();
        if spec.select.distinct {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(row.clone()));
        }

        let offset = spec.offset.unwrap_or(0);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(spec.limit.unwrap_or(usize::MAX))
            .collect())
    }

    fn joined_scopes(&mut self, spec: &QuerySpec) -> Result<Vec<Scope<'a>>> {
        let Some(from) = &spec.from else {
            return Ok(vec![Scope::empty()]);
        };

        let root = self.table(&from.root.table)?;
        let mut scopes: Vec<Scope<'a>> = root
            .rows
            .iter()
            .map(|row| Scope {
                entries: vec![(from.root.alias.clone(), root, Some(row))],
            })
            .collect();

        for join in &from.joins {
            let table = self.table(&join.table.table)?;
            let alias = &join.table.alias;
            let mut next = Vec::new();
            for scope in scopes {
                let mut any = false;
                for row in &table.rows {
                    let mut candidate = scope.clone();
                    candidate.entries.push((alias.clone(), table, Some(row)));
                    if self.eval(&join.predicate, &candidate)?.as_bool() {
                        any = true;
                        next.push(candidate);
                    }
                }
                if !any && join.kind == JoinKind::LeftOuter {
                    let mut candidate = scope;
                    candidate.entries.push((alias.clone(), table, None));
                    next.push(candidate);
                }
            }
            scopes = next;
        }
        Ok(scopes)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&mut self, expr: &Expr, scope: &Scope<'a>) -> Result<Value> {
        match expr {
            Expr::Column(column) => scope.lookup(column.qualifier.as_deref(), &column.column),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Parameter(parameter) => self.bindings.resolve(parameter).cloned(),
            Expr::Comparison { left, op, right } => {
                let left = self.eval_row(left, scope)?;
                let right = self.eval_row(right, scope)?;
                compare_rows(&left, *op, &right)
            }
            Expr::Junction { kind, items } => {
                let mut saw_null = false;
                for item in items {
                    match (kind, self.eval(item, scope)?) {
                        (_, Value::Null) => saw_null = true,
                        (JunctionKind::And, v) if !v.as_bool() => return Ok(Value::Boolean(false)),
                        (JunctionKind::Or, v) if v.as_bool() => return Ok(Value::Boolean(true)),
                        _ => {}
                    }
                }
                if saw_null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(*kind == JunctionKind::And))
                }
            }
            Expr::Not(inner) => match self.eval(inner, scope)? {
                Value::Null => Ok(Value::Null),
                v => Ok(Value::Boolean(!v.as_bool())),
            },
            Expr::IsNull { expr, negated } => {
                let is_null = self.eval_row(expr, scope)?.iter().all(Value::is_null);
                Ok(Value::Boolean(is_null != *negated))
            }
            Expr::InList { expr, list, negated } => {
                let needle = self.eval_row(expr, scope)?;
                let mut candidates = Vec::with_capacity(list.len());
                for item in list {
                    candidates.push(self.eval_row(item, scope)?);
                }
                Ok(negate_if(membership(&needle, &candidates)?, *negated))
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let needle = self.eval_row(expr, scope)?;
                let candidates = self.select(subquery)?;
                Ok(negate_if(membership(&needle, &candidates)?, *negated))
            }
            Expr::Tuple(_) => Err(OrmError::Jdbc(
                "Row value constructor used outside a comparison".into(),
            )),
            Expr::NextValue { sequence } => {
                let seq = self
                    .sequences
                    .get_mut(sequence)
                    .ok_or_else(|| OrmError::Jdbc(format!("Sequence '{}' not found", sequence)))?;
                let value = seq.next;
                seq.next += seq.increment;
                Ok(Value::Integer(value))
            }
        }
    }

    fn eval_row(&mut self, expr: &Expr, scope: &Scope<'a>) -> Result<Vec<Value>> {
        match expr {
            Expr::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(values)
            }
            other => Ok(vec![self.eval(other, scope)?]),
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Evaluate an INSERT into a new row laid out by the table's columns.
    pub fn insert_row(&mut self, table: &str, columns: &[String], values: &[Expr]) -> Result<Row> {
        let target = self.table(table)?;
        if columns.len() != values.len() {
            return Err(OrmError::Jdbc(format!(
                "Insert into '{}' has {} columns but {} values",
                table,
                columns.len(),
                values.len()
            )));
        }
        let mut row = vec![Value::Null; target.columns.len()];
        let scope = Scope::empty();
        for (column, expr) in columns.iter().zip(values) {
            let index = target
                .column_index(column)
                .ok_or_else(|| OrmError::Jdbc(format!("Column '{}' not found in '{}'", column, table)))?;
            row[index] = self.eval(expr, &scope)?;
        }
        Ok(row)
    }

    /// Row indexes matching a single-table predicate.
    pub fn matching_rows(&mut self, table: &str, selection: Option<&Expr>) -> Result<Vec<usize>> {
        let target = self.table(table)?;
        let mut matched = Vec::new();
        for (index, row) in target.rows.iter().enumerate() {
            let scope = Scope {
                entries: vec![(table.to_string(), target, Some(row))],
            };
            let keep = match selection {
                Some(predicate) => self.eval(predicate, &scope)?.as_bool(),
                None => true,
            };
            if keep {
                matched.push(index);
            }
        }
        Ok(matched)
    }

    /// New column values for one row under an UPDATE's assignments.
    pub fn assignments(
        &mut self,
        table: &str,
        row_index: usize,
        assignments: &[(String, Expr)],
    ) -> Result<Vec<(usize, Value)>> {
        let target = self.table(table)?;
        let scope = Scope {
            entries: vec![(table.to_string(), target, target.rows.get(row_index))],
        };
        let mut out = Vec::with_capacity(assignments.len());
        for (column, expr) in assignments {
            let index = target
                .column_index(column)
                .ok_or_else(|| OrmError::Jdbc(format!("Column '{}' not found in '{}'", column, table)))?;
            out.push((index, self.eval(expr, &scope)?));
        }
        Ok(out)
    }
}

/// Execute a mutation against `tables`, returning the affected row count.
/// Run an insert, update or delete, appending the touched rows to `changes`.
pub fn execute_mutation(
    statement: &Statement,
    tables: &mut Tables,
    sequences: &mut Sequences,
    bindings: &ParameterBindings,
    changes: &mut Vec<Change>,
) -> Result<usize> {
    match statement {
        Statement::Insert(insert) => {
            let row = Evaluator::new(tables, sequences, bindings).insert_row(
                &insert.table,
                &insert.columns,
                &insert.values,
            )?;
            table_mut(tables, &insert.table)?.rows.push(row.clone());
            changes.push(Change::InsertRow {
                table: insert.table.clone(),
                row,
            });
            Ok(1)
        }
        Statement::Update(update) => {
            let assignments: Vec<(String, Expr)> = update
                .assignments
                .iter()
                .map(|a| (a.column.clone(), a.value.clone()))
                .collect();
            let mut updates = Vec::new();
            {
                let mut evaluator = Evaluator::new(tables, sequences, bindings);
                for index in evaluator.matching_rows(&update.table, update.selection.as_ref())? {
                    updates.push((index, evaluator.assignments(&update.table, index, &assignments)?));
                }
            }
            let target = table_mut(tables, &update.table)?;
            for (index, values) in &updates {
                let old_row = target.rows[*index].clone();
                for (column, value) in values {
                    target.rows[*index][*column] = value.clone();
                }
                changes.push(Change::UpdateRow {
                    table: update.table.clone(),
                    old_row,
                    new_row: target.rows[*index].clone(),
                });
            }
            Ok(updates.len())
        }
        Statement::Delete(delete) => {
            let matched = Evaluator::new(tables, sequences, bindings)
                .matching_rows(&delete.table, delete.selection.as_ref())?;
            let doomed: HashSet<usize> = matched.iter().copied().collect();
            let target = table_mut(tables, &delete.table)?;
            let mut ordered: Vec<usize> = doomed.iter().copied().collect();
            ordered.sort_unstable();
            for index in ordered {
                changes.push(Change::DeleteRow {
                    table: delete.table.clone(),
                    old_row: target.rows[index].clone(),
                });
            }
            let mut index = 0;
            target.rows.retain(|_| {
                let keep = !doomed.contains(&index);
                index += 1;
                keep
            });
            Ok(doomed.len())
        }
        other => Err(OrmError::Jdbc(format!(
            "Statement kind '{}' is not an update",
            other.kind()
        ))),
    }
}

fn table_mut<'t>(tables: &'t mut Tables, name: &str) -> Result<&'t mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| OrmError::Jdbc(format!("Table '{}' not found", name)))
}

fn compare_rows(left: &[Value], op: ComparisonOperator, right: &[Value]) -> Result<Value> {
    if left.len() != right.len() {
        return Err(OrmError::Jdbc(format!(
            "Row value arity mismatch: {} vs {}",
            left.len(),
            right.len()
        )));
    }
    if left.len() > 1 && !matches!(op, ComparisonOperator::Equal | ComparisonOperator::NotEqual) {
        return Err(OrmError::Jdbc("Ordering comparison on row values".into()));
    }
    if left.iter().chain(right).any(Value::is_null) {
        return Ok(Value::Null);
    }
    if left.len() > 1 {
        let equal = left
            .iter()
            .zip(right)
            .all(|(l, r)| l.sql_eq(r) == Some(true));
        return Ok(Value::Boolean(equal == (op == ComparisonOperator::Equal)));
    }
    let ordering = left[0].compare(&right[0])?;
    Ok(Value::Boolean(match op {
        ComparisonOperator::Equal => ordering == Ordering::Equal,
        ComparisonOperator::NotEqual => ordering != Ordering::Equal,
        ComparisonOperator::LessThan => ordering == Ordering::Less,
        ComparisonOperator::LessThanOrEqual => ordering != Ordering::Greater,
        ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
        ComparisonOperator::GreaterThanOrEqual => ordering != Ordering::Less,
    }))
}

fn membership(needle: &[Value], candidates: &[Vec<Value>]) -> Result<Value> {
    let mut saw_null = false;
    for candidate in candidates {
        match compare_rows(needle, ComparisonOperator::Equal, candidate)? {
            Value::Boolean(true) => return Ok(Value::Boolean(true)),
            Value::Null => saw_null = true,
            _ => {}
        }
    }
    Ok(if saw_null { Value::Null } else { Value::Boolean(false) })
}

fn negate_if(value: Value, negated: bool) -> Value {
    match (value, negated) {
        (Value::Boolean(b), true) => Value::Boolean(!b),
        (v, _) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlType;
    use crate::sql::{FromClause, TableJoin, TableReference};

    fn fixture() -> (Tables, Sequences) {
        let mut tables = Tables::new();
        let mut orders = MemoryTable::new(vec!["id".into(), "status".into(), "payment_id".into()]);
        orders.rows.push(vec![Value::Integer(1), "NEW".into(), Value::Integer(10)]);
        orders.rows.push(vec![Value::Integer(2), "PAID".into(), Value::Null]);
        tables.insert("orders".into(), orders);
        let mut payment = MemoryTable::new(vec!["id".into(), "amount".into()]);
        payment.rows.push(vec![Value::Integer(10), Value::Float(9.5)]);
        tables.insert("payment".into(), payment);
        let mut sequences = Sequences::new();
        sequences.insert("seq".into(), MemorySequence { next: 1, increment: 20 });
        (tables, sequences)
    }

    #[test]
    fn test_left_join_keeps_unmatched_rows() {
        let (tables, mut sequences) = fixture();
        let mut from = FromClause::new(TableReference::new("orders", "o"));
        from.joins.push(TableJoin {
            kind: JoinKind::LeftOuter,
            table: TableReference::new("payment", "p"),
            predicate: Expr::eq(Expr::column(Some("o"), "payment_id"), Expr::column(Some("p"), "id")),
        });
        let mut spec = QuerySpec::new(from);
        spec.add_selection(Expr::column(Some("o"), "id"), None, SqlType::Integer);
        spec.add_selection(Expr::column(Some("p"), "amount"), None, SqlType::Float);
        spec.order_by.push(crate::sql::SortSpecification {
            expr: Expr::column(Some("o"), "id"),
            descending: true,
        });

        let bindings = ParameterBindings::new();
        let rows = Evaluator::new(&tables, &mut sequences, &bindings).select(&spec).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(2), Value::Null],
                vec![Value::Integer(1), Value::Float(9.5)]
            ]
        );
    }

    #[test]
    fn test_tuple_in_list_and_next_value() {
        let (tables, mut sequences) = fixture();
        let mut spec = QuerySpec::new(FromClause::new(TableReference::new("orders", "o")));
        spec.add_selection(Expr::column(Some("o"), "status"), None, SqlType::Text);
        spec.restrict(Expr::InList {
            expr: Box::new(Expr::Tuple(vec![Expr::column(Some("o"), "id"), Expr::column(Some("o"), "status")])),
            list: vec![Expr::Tuple(vec![Expr::positional(0, SqlType::Integer), Expr::positional(1, SqlType::Text)])],
            negated: false,
        });
        let bindings = ParameterBindings::from_positional(vec![Value::Integer(2), "PAID".into()]);
        let rows = Evaluator::new(&tables, &mut sequences, &bindings).select(&spec).unwrap();
        assert_eq!(rows, vec![vec![Value::Text("PAID".into())]]);

        let mut next = QuerySpec::default();
        next.add_selection(Expr::NextValue { sequence: "seq".into() }, None, SqlType::Integer);
        let empty = ParameterBindings::new();
        let mut evaluator = Evaluator::new(&tables, &mut sequences, &empty);
        assert_eq!(evaluator.select(&next).unwrap(), vec![vec![Value::Integer(1)]]);
        assert_eq!(evaluator.select(&next).unwrap(), vec![vec![Value::Integer(21)]]);
    }

    #[test]
    fn test_update_and_delete_counts() {
        let (mut tables, mut sequences) = fixture();
        let update = Statement::Update(crate::sql::UpdateStatement {
            table: "orders".into(),
            assignments: vec![crate::sql::Assignment {
                column: "status".into(),
                value: Expr::Literal("SHIPPED".into()),
            }],
            selection: Some(Expr::eq(Expr::column(None, "id"), Expr::positional(0, SqlType::Integer))),
        });
        let bindings = ParameterBindings::from_positional(vec![Value::Integer(1)]);
        let mut changes = Vec::new();
        assert_eq!(
            execute_mutation(&update, &mut tables, &mut sequences, &bindings, &mut changes).unwrap(),
            1
        );
        assert_eq!(tables["orders"].rows[0][1], Value::Text("SHIPPED".into()));

        let delete = Statement::Delete(crate::sql::DeleteStatement {
            table: "orders".into(),
            selection: Some(Expr::IsNull {
                expr: Box::new(Expr::column(None, "payment_id")),
                negated: false,
            }),
        });
        assert_eq!(
            execute_mutation(&delete, &mut tables, &mut sequences, &ParameterBindings::new(), &mut changes).unwrap(),
            1
        );
        assert_eq!(tables["orders"].rows.len(), 1);
        assert!(matches!(&changes[0], Change::UpdateRow { new_row, .. } if new_row[1] == Value::Text("SHIPPED".into())));
        assert!(matches!(&changes[1], Change::DeleteRow { .. }));
    }
}
