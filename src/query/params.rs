//! Parameter extraction.
//!
//! The last pipeline stage. Captured external values survive every
//! rewriting pass untouched; here each source-free subtree containing a
//! capture is evaluated down to a single value and replaced by a named
//! [`Expr::Parameter`], so the rewritten tree is closed over nothing but
//! sources and parameters. Two structurally equal captures of the same
//! label share one parameter.
//!
//! Captured queryables are different: they are whole query trees and must
//! be inlined *before* the rewriting passes run, so navigations inside
//! them get expanded like any other subquery. [`inline_queryables`] does
//! that inlining with fresh source ids.

use serde::{Deserialize, Serialize};

use crate::query::errors::{CompileError, CompileResult};
use crate::query::expr::{BinaryOp, Expr, UnaryOp};
use crate::query::tree::{QueryModel, ResultOperator};
use crate::query::value::{CapturedValue, ExternalValue, Value};
use crate::query::visit::{source_refs_expr, Rewriter};
use crate::types::SourceIdGen;
use std::collections::HashSet;

/// Extracted parameter payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum ParameterValue {
    /// Single scalar.
    Scalar(Value),
    /// Ordered sequence, e.g. the operand of a `Contains`.
    Sequence(Vec<Value>),
}

/// One named parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Placeholder name as it appears in the tree (`__{label}_{n}`).
    pub name: String,
    /// Label of the capture the value came from.
    pub label: String,
    /// Extracted payload.
    pub value: ParameterValue,
}

/// Ordered collection of extracted parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterBag {
    entries: Vec<Parameter>,
}

impl ParameterBag {
    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameters were extracted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks a parameter up by placeholder name.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Iterates the parameters in extraction order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }

    /// Records `value` under `label`, reusing the existing entry when an
    /// identical capture was already extracted.
    fn insert(&mut self, label: &str, value: ParameterValue) -> String {
        if let Some(existing) = self
            .entries
            .iter()
            .find(|p| p.label == label && p.value == value)
        {
            return existing.name.clone();
        }
        let name = format!("__{}_{}", label, self.entries.len());
        self.entries.push(Parameter {
            name: name.clone(),
            label: label.to_owned(),
            value,
        });
        name
    }
}

/// Replaces every source-free captured subtree with a named parameter.
pub fn extract(query: QueryModel) -> CompileResult<(QueryModel, ParameterBag)> {
    let mut bag = ParameterBag::default();
    let query = Extractor { bag: &mut bag }.rewrite_query(query)?;
    Ok((query, bag))
}

/// Extracts parameters from a lifted collection's batched query and its
/// paging window, sharing `bag` with the main query so identical captures
/// reuse one parameter.
pub(crate) fn extract_registration(
    query: QueryModel,
    window: Vec<ResultOperator>,
    bag: &mut ParameterBag,
) -> CompileResult<(QueryModel, Vec<ResultOperator>)> {
    let mut extractor = Extractor { bag };
    let query = extractor.rewrite_query(query)?;
    let window = window
        .into_iter()
        .map(|op| extractor.rewrite_operator(op))
        .collect::<CompileResult<Vec<_>>>()?;
    Ok((query, window))
}

/// Replaces captured queryables with inlined subqueries, remapping their
/// source ids so they cannot collide with ids already in the tree.
pub(crate) fn inline_queryables(
    query: QueryModel,
    ids: &mut SourceIdGen,
) -> CompileResult<QueryModel> {
    Inliner { ids }.rewrite_query(query)
}

struct Inliner<'a> {
    ids: &'a mut SourceIdGen,
}

impl Rewriter for Inliner<'_> {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        match expr {
            Expr::External(ExternalValue {
                value: CapturedValue::Queryable(captured),
                ..
            }) => {
                let (remapped, _) = captured.clone_remapped(self.ids);
                // The inlined tree may itself carry captures.
                self.rewrite_expr(Expr::subquery(remapped))
            }
            other => self.walk_expr(other),
        }
    }
}

struct Extractor<'a> {
    bag: &'a mut ParameterBag,
}

impl Rewriter for Extractor<'_> {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        if !is_extractable(&expr) {
            return self.walk_expr(expr);
        }
        // Direct captures keep their payload shape; anything larger is
        // evaluated down to one scalar.
        if let Expr::External(external) = &expr {
            let value = match &external.value {
                CapturedValue::Scalar(value) => ParameterValue::Scalar(value.clone()),
                CapturedValue::Sequence(values) => ParameterValue::Sequence(values.clone()),
                CapturedValue::Queryable(_) => {
                    return Err(CompileError::CaptureEvaluation {
                        label: external.label.clone(),
                        reason: "captured queryable reached parameter extraction".to_owned(),
                    })
                }
            };
            return Ok(Expr::Parameter(self.bag.insert(&external.label, value)));
        }
        let label = first_label(&expr).unwrap_or("p");
        let value = evaluate(&expr).map_err(|reason| CompileError::CaptureEvaluation {
            label: label.to_owned(),
            reason,
        })?;
        let label = label.to_owned();
        Ok(Expr::Parameter(
            self.bag.insert(&label, ParameterValue::Scalar(value)),
        ))
    }
}

/// A subtree becomes a parameter when it holds at least one capture and
/// references no query source.
fn is_extractable(expr: &Expr) -> bool {
    if !contains_capture(expr) {
        return false;
    }
    let mut refs = HashSet::new();
    source_refs_expr(expr, &mut refs);
    refs.is_empty()
}

fn contains_capture(expr: &Expr) -> bool {
    match expr {
        Expr::External(_) => true,
        Expr::Constant(_)
        | Expr::Parameter(_)
        | Expr::Source(_)
        | Expr::CorrelatedCollection { .. }
        | Expr::SharedRef(_)
        | Expr::Subquery(_) => false,
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => contains_capture(object),
        Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => contains_capture(operand),
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => {
            contains_capture(left) || contains_capture(right)
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => contains_capture(test) || contains_capture(if_true) || contains_capture(if_false),
        Expr::NullConditional { guard, access } => {
            contains_capture(guard) || contains_capture(access)
        }
        Expr::KeyTuple(items) => items.iter().any(contains_capture),
        Expr::Materialize { source, .. } => contains_capture(source),
        Expr::Shared { expr, .. } => contains_capture(expr),
    }
}

fn first_label(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::External(external) => Some(&external.label),
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => first_label(object),
        Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => first_label(operand),
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => first_label(left).or_else(|| first_label(right)),
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => first_label(test)
            .or_else(|| first_label(if_true))
            .or_else(|| first_label(if_false)),
        Expr::NullConditional { guard, access } => {
            first_label(guard).or_else(|| first_label(access))
        }
        Expr::KeyTuple(items) => items.iter().find_map(first_label),
        Expr::Materialize { source, .. } | Expr::Shared { expr: source, .. } => {
            first_label(source)
        }
        _ => None,
    }
}

/// Small interpreter for source-free subtrees.
///
/// Only shapes that can genuinely appear around a capture are supported;
/// anything else is an evaluation error surfaced as `CaptureEvaluation`.
fn evaluate(expr: &Expr) -> Result<Value, String> {
    match expr {
        Expr::Constant(value) => Ok(value.clone()),
        Expr::External(external) => match &external.value {
            CapturedValue::Scalar(value) => Ok(value.clone()),
            CapturedValue::Sequence(_) => Err(format!(
                "captured sequence '{}' cannot be folded into a scalar",
                external.label
            )),
            CapturedValue::Queryable(_) => Err(format!(
                "captured queryable '{}' cannot be folded into a scalar",
                external.label
            )),
        },
        Expr::Unary { op, operand } => {
            let operand = evaluate(operand)?;
            match (op, operand) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
                (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (op, operand) => Err(format!("cannot apply {op:?} to {operand:?}")),
            }
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left)?;
            let right = evaluate(right)?;
            apply_binary(*op, left, right)
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => match evaluate(test)? {
            Value::Bool(true) => evaluate(if_true),
            Value::Bool(false) => evaluate(if_false),
            other => Err(format!("conditional test evaluated to {other:?}")),
        },
        Expr::Coalesce { left, right } => {
            let left = evaluate(left)?;
            if left.is_null() {
                evaluate(right)
            } else {
                Ok(left)
            }
        }
        other => Err(format!("expression is not a compile-time value: {other:?}")),
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, String> {
    use Value::*;
    Ok(match (op, left, right) {
        (BinaryOp::Eq, l, r) => Bool(l == r),
        (BinaryOp::NotEq, l, r) => Bool(l != r),
        (BinaryOp::And, Bool(l), Bool(r)) => Bool(l && r),
        (BinaryOp::Or, Bool(l), Bool(r)) => Bool(l || r),
        (BinaryOp::Lt, Int(l), Int(r)) => Bool(l < r),
        (BinaryOp::LtEq, Int(l), Int(r)) => Bool(l <= r),
        (BinaryOp::Gt, Int(l), Int(r)) => Bool(l > r),
        (BinaryOp::GtEq, Int(l), Int(r)) => Bool(l >= r),
        (BinaryOp::Lt, Float(l), Float(r)) => Bool(l < r),
        (BinaryOp::LtEq, Float(l), Float(r)) => Bool(l <= r),
        (BinaryOp::Gt, Float(l), Float(r)) => Bool(l > r),
        (BinaryOp::GtEq, Float(l), Float(r)) => Bool(l >= r),
        (BinaryOp::Lt, String(l), String(r)) => Bool(l < r),
        (BinaryOp::Gt, String(l), String(r)) => Bool(l > r),
        (BinaryOp::Add, Int(l), Int(r)) => Int(l.wrapping_add(r)),
        (BinaryOp::Sub, Int(l), Int(r)) => Int(l.wrapping_sub(r)),
        (BinaryOp::Mul, Int(l), Int(r)) => Int(l.wrapping_mul(r)),
        (BinaryOp::Div, Int(_), Int(0)) => return Err("integer division by zero".to_owned()),
        (BinaryOp::Div, Int(l), Int(r)) => Int(l.wrapping_div(r)),
        (BinaryOp::Rem, Int(_), Int(0)) => return Err("integer division by zero".to_owned()),
        (BinaryOp::Rem, Int(l), Int(r)) => Int(l.wrapping_rem(r)),
        (BinaryOp::Add, Float(l), Float(r)) => Float(l + r),
        (BinaryOp::Sub, Float(l), Float(r)) => Float(l - r),
        (BinaryOp::Mul, Float(l), Float(r)) => Float(l * r),
        (BinaryOp::Div, Float(l), Float(r)) => Float(l / r),
        (BinaryOp::Rem, Float(l), Float(r)) => Float(l % r),
        (BinaryOp::Add, String(l), String(r)) => String(l + &r),
        (op, l, r) => return Err(format!("cannot apply {op:?} to {l:?} and {r:?}")),
    })
}
