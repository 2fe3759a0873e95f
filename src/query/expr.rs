//! Expression tree shared by every rewriting pass.
//!
//! The node set is a closed tagged-variant enumeration: adding a variant
//! forces every pass to be revisited, which is exactly the guarantee the
//! pipeline relies on. Pseudo-nodes that extend the base grammar
//! ([`Expr::NullConditional`], [`Expr::ReferenceEqual`], the shared-subquery
//! pair) are explicit variants carrying their guard/operands rather than
//! sentinel encodings.

use crate::query::tree::QueryModel;
use crate::query::value::{ExternalValue, Value};
use crate::types::SourceId;

/// Unary operators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    /// Equality.
    Eq,
    /// Inequality.
    NotEq,
    /// Less-than.
    Lt,
    /// Less-than-or-equal.
    LtEq,
    /// Greater-than.
    Gt,
    /// Greater-than-or-equal.
    GtEq,
    /// Logical conjunction.
    And,
    /// Logical disjunction.
    Or,
    /// Addition (also string concatenation).
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
}

impl BinaryOp {
    /// Returns true for `==` and `!=`.
    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::NotEq)
    }
}

/// Concrete collection shape requested by a materialization wrapper.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectionKind {
    /// Materialize into a list (the generic fallback shape).
    List,
    /// Materialize into an array.
    Array,
}

/// Expression node.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal value embedded in the tree.
    Constant(Value),
    /// Closed-over runtime value, opaque until parameter extraction.
    External(ExternalValue),
    /// Named placeholder produced by parameter extraction.
    Parameter(String),
    /// Reference to a query source clause in scope.
    Source(SourceId),
    /// Member access (`object.Name`).
    Property {
        /// Receiver of the access.
        object: Box<Expr>,
        /// Member name.
        name: String,
    },
    /// Indexer/function-style property access (`Property(object, "Name")`).
    ///
    /// Unlike [`Expr::Property`], a name that does not resolve against the
    /// receiver's entity type is a fatal configuration error.
    NamedProperty {
        /// Receiver of the access.
        object: Box<Expr>,
        /// Member name.
        name: String,
    },
    /// Type-downcast wrapper (`object as Entity`).
    Downcast {
        /// Receiver of the cast.
        object: Box<Expr>,
        /// Target entity type name.
        entity: String,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Ternary conditional.
    Conditional {
        /// Condition.
        test: Box<Expr>,
        /// Value when the condition holds.
        if_true: Box<Expr>,
        /// Value otherwise.
        if_false: Box<Expr>,
    },
    /// Null-coalescing operation.
    Coalesce {
        /// Preferred operand.
        left: Box<Expr>,
        /// Fallback when the preferred operand is null.
        right: Box<Expr>,
    },
    /// Null-conditional pseudo-node: evaluate `access` only when `guard`
    /// is non-null, otherwise yield null.
    NullConditional {
        /// Expression guarding the access.
        guard: Box<Expr>,
        /// The guarded operation.
        access: Box<Expr>,
    },
    /// Ordered tuple of key expressions; composite keys compare positionally.
    KeyTuple(Vec<Expr>),
    /// Length of an array-valued operand.
    ArrayLength(Box<Expr>),
    /// Nested query used in expression position.
    Subquery(Box<QueryModel>),
    /// Materialize-as-collection wrapper around a sequence-valued operand.
    Materialize {
        /// Requested collection shape.
        kind: CollectionKind,
        /// The wrapped sequence.
        source: Box<Expr>,
    },
    /// Placeholder left in a projection after a collection subquery was
    /// lifted into a correlated batch; `index` addresses the registration.
    CorrelatedCollection {
        /// Ordinal into the compilation's correlation registry.
        index: usize,
        /// Collection shape the materializer must produce.
        kind: CollectionKind,
    },
    /// Reference-identity comparison of two sequence operands.
    ReferenceEqual {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// First occurrence of a hoisted duplicate subexpression.
    Shared {
        /// Slot shared with the matching [`Expr::SharedRef`]s.
        slot: usize,
        /// The hoisted expression, evaluated once.
        expr: Box<Expr>,
    },
    /// Subsequent occurrence of a hoisted duplicate subexpression.
    SharedRef(usize),
}

impl Expr {
    /// Null constant.
    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    /// Boolean constant.
    pub fn bool(value: bool) -> Self {
        Expr::Constant(Value::Bool(value))
    }

    /// Literal constant from any [`Value`] convertible.
    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    /// Source reference.
    pub fn source(id: SourceId) -> Self {
        Expr::Source(id)
    }

    /// Member access.
    pub fn property(object: Expr, name: impl Into<String>) -> Self {
        Expr::Property {
            object: Box::new(object),
            name: name.into(),
        }
    }

    /// Indexer-style property access.
    pub fn named_property(object: Expr, name: impl Into<String>) -> Self {
        Expr::NamedProperty {
            object: Box::new(object),
            name: name.into(),
        }
    }

    /// Binary operation.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Equality comparison.
    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    /// Inequality comparison.
    pub fn not_eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::NotEq, left, right)
    }

    /// Conjunction.
    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::And, left, right)
    }

    /// Logical negation.
    pub fn not(operand: Expr) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    /// Null-conditional wrapper.
    pub fn null_conditional(guard: Expr, access: Expr) -> Self {
        Expr::NullConditional {
            guard: Box::new(guard),
            access: Box::new(access),
        }
    }

    /// Nested query in expression position.
    pub fn subquery(query: QueryModel) -> Self {
        Expr::Subquery(Box::new(query))
    }

    /// Materialize-as-collection wrapper.
    pub fn materialize(kind: CollectionKind, source: Expr) -> Self {
        Expr::Materialize {
            kind,
            source: Box::new(source),
        }
    }

    /// Returns true for the null constant.
    pub fn is_null_constant(&self) -> bool {
        matches!(self, Expr::Constant(Value::Null))
    }

    /// Folds a list of per-column comparisons into a single conjunction.
    ///
    /// Used when a composite-key tuple comparison has to be spelled out
    /// column by column (e.g. a foreign-key null test).
    pub fn all_of(mut comparisons: Vec<Expr>) -> Expr {
        match comparisons.len() {
            0 => Expr::bool(true),
            1 => comparisons.pop().unwrap_or_else(Expr::null),
            _ => {
                let mut iter = comparisons.into_iter();
                let first = iter.next().unwrap_or_else(Expr::null);
                iter.fold(first, Expr::and)
            }
        }
    }
}
