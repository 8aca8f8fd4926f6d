pub mod ast;
pub mod dialect;
pub mod load;
pub mod mutation;
pub mod predicate;
pub mod procedure;
pub mod render;

pub use ast::{
    Assignment, CallStatement, ColumnReference, ComparisonOperator, DeleteStatement, Expr,
    FromClause, InsertStatement, JdbcParameter, JoinKind, JunctionKind, ParameterMarker, QuerySpec,
    SelectClause, SortSpecification, SqlSelection, Statement, TableJoin, TableReference,
    UpdateStatement,
};
pub use dialect::{AnsiDialect, Dialect, MySqlDialect, PostgreSqlDialect, RoutineSignature, dialect_for_name};
pub use load::{
    AttributeLayout, CollectionSpaceLayout, ElementLayout, EntitySpaceLayout, KeyRestriction,
    LoadQuery, LoadQueryBuilder, SelectionLayout, key_subquery,
};
pub use mutation::{CollectionMutationSql, EntityMutationSql, MutationSqlBuilder};
pub use predicate::PredicateBuilder;
pub use procedure::{ProcedureWrapper, WrapOutcome, WrappedRoutine};
pub use render::{ParameterBindings, RenderedStatement, SqlAstRenderer};
