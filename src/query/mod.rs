//! Query rewriting pipeline.
//!
//! A query arrives as a [`tree::QueryModel`]: sources, body clauses, a
//! projection, result operators. The [`pipeline::QueryCompiler`] drives a
//! fixed sequence of passes over it:
//!
//! 1. captured queryables are inlined ([`params::inline_queryables`]),
//! 2. entity and collection equality is rewritten into key comparisons
//!    ([`equality`]),
//! 3. navigation member paths become joins or correlated subqueries
//!    ([`navigation`], [`collection`]),
//! 4. eligible collection subqueries are lifted into batched queries
//!    ([`correlation`]),
//! 5. the tree is structurally normalized ([`normalize`]),
//! 6. captured values become named parameters ([`params`]).
//!
//! Fatal conditions surface as [`errors::CompileError`]; semantic-risk
//! conditions surface as [`diagnostics::Diagnostic`] warnings without
//! failing the compilation.

pub mod binder;
pub mod collection;
pub mod correlation;
pub mod diagnostics;
pub mod equality;
pub mod errors;
pub mod expr;
pub mod navigation;
pub mod normalize;
pub mod params;
pub mod pipeline;
pub mod scope;
pub mod tree;
pub mod value;
pub mod visit;

pub use correlation::CorrelatedCollection;
pub use diagnostics::Diagnostic;
pub use errors::{CompileError, CompileResult};
pub use expr::{BinaryOp, CollectionKind, Expr, UnaryOp};
pub use params::{Parameter, ParameterBag, ParameterValue};
pub use pipeline::{CompiledQuery, QueryCompiler};
pub use tree::{
    BodyClause, FlattenClause, GroupJoinClause, JoinClause, Ordering, QueryModel, ResultOperator,
    SortDirection, SourceClause, SourceOrigin,
};
pub use value::{CapturedValue, ExternalValue, Value};
