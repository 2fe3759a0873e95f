//! Structural normalization passes.
//!
//! Five small tree-to-tree transforms run after the semantic rewriters:
//! hoisting duplicate subqueries in a projection into a shared slot,
//! collapsing trivial wrapping subqueries, turning single-value
//! quantifier patterns into `Contains`, turning the length of a
//! materialized subquery into `Count`, and folding conditional null-check
//! idioms into coalesce or null-conditional nodes.
//!
//! Each pass is idempotent and independent of the others; running the
//! whole set twice yields the same tree as running it once.

use crate::query::errors::CompileResult;
use crate::query::expr::{BinaryOp, Expr};
use crate::query::tree::{BodyClause, QueryModel, ResultOperator, SourceOrigin};
use crate::query::visit::Rewriter;

/// Runs every normalization pass, in a fixed (but arbitrary) order.
pub fn normalize(query: QueryModel) -> CompileResult<QueryModel> {
    let query = HoistDuplicateSubqueries::over(&query).rewrite_query(query)?;
    let query = FlattenTrivialSources.rewrite_query(query)?;
    let query = QuantifierToContains.rewrite_query(query)?;
    let query = ArrayLengthToCount.rewrite_query(query)?;
    let query = FoldNullChecks.rewrite_query(query)?;
    Ok(query)
}

/// Replaces repeated identical subqueries in a projection with one
/// [`Expr::Shared`] evaluation and [`Expr::SharedRef`] back-references.
struct HoistDuplicateSubqueries {
    next_slot: usize,
}

impl HoistDuplicateSubqueries {
    /// Slot numbering continues past any slots already present, so a
    /// rerun never collides with earlier hoists.
    fn over(query: &QueryModel) -> Self {
        let mut max = None;
        scan_slots(&query.projection, &mut max);
        Self {
            next_slot: max.map_or(0, |m| m + 1),
        }
    }

    fn hoist(&mut self, expr: Expr) -> Expr {
        let mut plan: Vec<Duplicate> = Vec::new();
        count_subqueries(&expr, &mut plan);
        plan.retain(|d| d.occurrences > 1);
        if plan.is_empty() {
            return expr;
        }
        self.replace(expr, &mut plan)
    }

    fn replace(&mut self, expr: Expr, plan: &mut Vec<Duplicate>) -> Expr {
        match expr {
            Expr::Subquery(query) => {
                let Some(dup) = plan.iter_mut().find(|d| d.query == *query) else {
                    return Expr::Subquery(query);
                };
                match dup.slot {
                    Some(slot) => Expr::SharedRef(slot),
                    None => {
                        let slot = self.next_slot;
                        self.next_slot += 1;
                        dup.slot = Some(slot);
                        Expr::Shared {
                            slot,
                            expr: Box::new(Expr::Subquery(query)),
                        }
                    }
                }
            }
            // Already-hoisted evaluations keep their slot.
            hoisted @ (Expr::Shared { .. } | Expr::SharedRef(_)) => hoisted,
            Expr::Property { object, name } => Expr::Property {
                object: Box::new(self.replace(*object, plan)),
                name,
            },
            Expr::NamedProperty { object, name } => Expr::NamedProperty {
                object: Box::new(self.replace(*object, plan)),
                name,
            },
            Expr::KeyTuple(items) => Expr::KeyTuple(
                items
                    .into_iter()
                    .map(|item| self.replace(item, plan))
                    .collect(),
            ),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test: Box::new(self.replace(*test, plan)),
                if_true: Box::new(self.replace(*if_true, plan)),
                if_false: Box::new(self.replace(*if_false, plan)),
            },
            Expr::Coalesce { left, right } => Expr::Coalesce {
                left: Box::new(self.replace(*left, plan)),
                right: Box::new(self.replace(*right, plan)),
            },
            Expr::NullConditional { guard, access } => Expr::NullConditional {
                guard,
                access: Box::new(self.replace(*access, plan)),
            },
            Expr::Materialize { kind, source } => Expr::Materialize {
                kind,
                source: Box::new(self.replace(*source, plan)),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(self.replace(*left, plan)),
                right: Box::new(self.replace(*right, plan)),
            },
            other => other,
        }
    }
}

struct Duplicate {
    query: QueryModel,
    occurrences: usize,
    slot: Option<usize>,
}

fn count_subqueries(expr: &Expr, out: &mut Vec<Duplicate>) {
    match expr {
        Expr::Subquery(query) => {
            if let Some(dup) = out.iter_mut().find(|d| d.query == **query) {
                dup.occurrences += 1;
            } else {
                out.push(Duplicate {
                    query: (**query).clone(),
                    occurrences: 1,
                    slot: None,
                });
            }
        }
        Expr::Shared { .. } | Expr::SharedRef(_) => {}
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => count_subqueries(object, out),
        Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => {
            count_subqueries(operand, out)
        }
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => {
            count_subqueries(left, out);
            count_subqueries(right, out);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            count_subqueries(test, out);
            count_subqueries(if_true, out);
            count_subqueries(if_false, out);
        }
        Expr::NullConditional { guard, access } => {
            count_subqueries(guard, out);
            count_subqueries(access, out);
        }
        Expr::KeyTuple(items) => {
            for item in items {
                count_subqueries(item, out);
            }
        }
        Expr::Materialize { source, .. } => count_subqueries(source, out),
        Expr::Constant(_)
        | Expr::External(_)
        | Expr::Parameter(_)
        | Expr::Source(_)
        | Expr::CorrelatedCollection { .. } => {}
    }
}

fn scan_slots(expr: &Expr, max: &mut Option<usize>) {
    if let Expr::Shared { slot, .. } | Expr::SharedRef(slot) = expr {
        *max = Some(max.map_or(*slot, |m| m.max(*slot)));
    }
    match expr {
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => scan_slots(object, max),
        Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => scan_slots(operand, max),
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => {
            scan_slots(left, max);
            scan_slots(right, max);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            scan_slots(test, max);
            scan_slots(if_true, max);
            scan_slots(if_false, max);
        }
        Expr::NullConditional { guard, access } => {
            scan_slots(guard, max);
            scan_slots(access, max);
        }
        Expr::KeyTuple(items) => {
            for item in items {
                scan_slots(item, max);
            }
        }
        Expr::Materialize { source, .. } | Expr::Shared { expr: source, .. } => {
            scan_slots(source, max)
        }
        _ => {}
    }
}

impl Rewriter for HoistDuplicateSubqueries {
    fn rewrite_query(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        let mut query = self.walk_query(query)?;
        query.projection = self.hoist(query.projection);
        Ok(query)
    }
}

/// Collapses `from q in (from r in X select r) ...` into `from q in X ...`.
struct FlattenTrivialSources;

fn trivially_wraps(query: &QueryModel) -> bool {
    query.body.is_empty()
        && query.operators.is_empty()
        && query.origin_navigation.is_none()
        && query.projection == Expr::Source(query.source.id)
}

fn collapse(origin: SourceOrigin) -> SourceOrigin {
    match origin {
        SourceOrigin::Query(inner) if trivially_wraps(&inner) => {
            let inner = *inner;
            collapse(inner.source.origin)
        }
        other => other,
    }
}

impl Rewriter for FlattenTrivialSources {
    fn rewrite_query(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        let mut query = self.walk_query(query)?;
        query.source.origin = collapse(query.source.origin);
        Ok(query)
    }
}

/// Rewrites `Any(x => x == v)` into `Contains(v)` and
/// `All(x => x != v)` into `!Contains(v)`, for a captured `v`.
struct QuantifierToContains;

fn is_captured(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::External(_) | Expr::Parameter(_) | Expr::Constant(_)
    )
}

/// Splits `elem <op> captured` into the captured side, requiring the
/// other side to be exactly the query's projected element.
fn captured_comparand<'e>(
    left: &'e Expr,
    right: &'e Expr,
    element: &Expr,
) -> Option<&'e Expr> {
    if left == element && is_captured(right) {
        Some(right)
    } else if right == element && is_captured(left) {
        Some(left)
    } else {
        None
    }
}

impl Rewriter for QuantifierToContains {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        let expr = self.walk_expr(expr)?;
        let Expr::Subquery(mut query) = expr else {
            return Ok(expr);
        };

        match query.operators.last() {
            Some(ResultOperator::Any) => {
                let Some(BodyClause::Where(Expr::Binary {
                    op: BinaryOp::Eq,
                    left,
                    right,
                })) = query.body.last()
                else {
                    return Ok(Expr::Subquery(query));
                };
                let Some(captured) = captured_comparand(left, right, &query.projection) else {
                    return Ok(Expr::Subquery(query));
                };
                let captured = captured.clone();
                query.body.pop();
                query.operators.pop();
                query.operators.push(ResultOperator::Contains(captured));
                Ok(Expr::Subquery(query))
            }
            Some(ResultOperator::All(Expr::Binary {
                op: BinaryOp::NotEq,
                left,
                right,
            })) => {
                let Some(captured) = captured_comparand(left, right, &query.projection) else {
                    return Ok(Expr::Subquery(query));
                };
                let captured = captured.clone();
                query.operators.pop();
                query.operators.push(ResultOperator::Contains(captured));
                Ok(Expr::not(Expr::Subquery(query)))
            }
            _ => Ok(Expr::Subquery(query)),
        }
    }
}

/// Rewrites the length of a materialized subquery into a `Count` result
/// operator on the subquery itself.
struct ArrayLengthToCount;

impl Rewriter for ArrayLengthToCount {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        let expr = self.walk_expr(expr)?;
        let Expr::ArrayLength(operand) = expr else {
            return Ok(expr);
        };
        Ok(match *operand {
            Expr::Subquery(query) => Expr::subquery(query.with_operator(ResultOperator::Count)),
            Expr::Materialize { source, .. } => match *source {
                Expr::Subquery(query) => {
                    Expr::subquery(query.with_operator(ResultOperator::Count))
                }
                source => Expr::ArrayLength(Box::new(source)),
            },
            operand => Expr::ArrayLength(Box::new(operand)),
        })
    }
}

/// Folds `x == null ? y : x` (and mirrors) into `Coalesce(x, y)`, and
/// `g != null ? f(g) : null` (and mirrors) into a null-conditional node.
struct FoldNullChecks;

/// Decomposes a null test, returning the probed operand and whether the
/// test asserts non-null.
fn null_test(test: &Expr) -> Option<(&Expr, bool)> {
    let Expr::Binary { op, left, right } = test else {
        return None;
    };
    if !op.is_equality() {
        return None;
    }
    let probed: &Expr = if right.is_null_constant() {
        left
    } else if left.is_null_constant() {
        right
    } else {
        return None;
    };
    Some((probed, *op == BinaryOp::NotEq))
}

impl Rewriter for FoldNullChecks {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        let expr = self.walk_expr(expr)?;
        let Expr::Conditional {
            test,
            if_true,
            if_false,
        } = expr
        else {
            return Ok(expr);
        };
        let Some((probed, non_null)) = null_test(&test) else {
            return Ok(Expr::Conditional {
                test,
                if_true,
                if_false,
            });
        };

        let (when_present, when_null) = if non_null {
            (&if_true, &if_false)
        } else {
            (&if_false, &if_true)
        };
        if **when_present == *probed {
            return Ok(Expr::Coalesce {
                left: Box::new(probed.clone()),
                right: Box::new((**when_null).clone()),
            });
        }
        if when_null.is_null_constant() {
            return Ok(Expr::null_conditional(
                probed.clone(),
                (**when_present).clone(),
            ));
        }
        Ok(Expr::Conditional {
            test,
            if_true,
            if_false,
        })
    }
}
