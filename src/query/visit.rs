//! Shared depth-first traversal for rewriting passes.
//!
//! Every pass implements [`Rewriter`], overriding [`Rewriter::rewrite_expr`]
//! (and sometimes [`Rewriter::rewrite_query`]) and falling back to the
//! default walk for the node kinds it does not care about. The walk owns
//! its input and rebuilds the tree, so passes never mutate shared state
//! through references.
//!
//! Captured external values are opaque to the default walk; only parameter
//! extraction looks inside them.

use std::collections::HashSet;

use crate::query::errors::CompileResult;
use crate::query::expr::Expr;
use crate::query::tree::{
    BodyClause, GroupJoinClause, JoinClause, Ordering, QueryModel, ResultOperator, SourceClause,
    SourceOrigin,
};
use crate::types::SourceId;

/// Depth-first tree rewriter.
pub trait Rewriter {
    /// Rewrites one expression node. Override and delegate to
    /// [`Rewriter::walk_expr`] for uninteresting nodes.
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        self.walk_expr(expr)
    }

    /// Rewrites one query model. Override to maintain per-scope state.
    fn rewrite_query(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        self.walk_query(query)
    }

    /// Default recursion over an expression's children.
    fn walk_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        Ok(match expr {
            Expr::Constant(_)
            | Expr::External(_)
            | Expr::Parameter(_)
            | Expr::Source(_)
            | Expr::CorrelatedCollection { .. }
            | Expr::SharedRef(_) => expr,
            Expr::Property { object, name } => Expr::Property {
                object: Box::new(self.rewrite_expr(*object)?),
                name,
            },
            Expr::NamedProperty { object, name } => Expr::NamedProperty {
                object: Box::new(self.rewrite_expr(*object)?),
                name,
            },
            Expr::Downcast { object, entity } => Expr::Downcast {
                object: Box::new(self.rewrite_expr(*object)?),
                entity,
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: Box::new(self.rewrite_expr(*operand)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(self.rewrite_expr(*left)?),
                right: Box::new(self.rewrite_expr(*right)?),
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test: Box::new(self.rewrite_expr(*test)?),
                if_true: Box::new(self.rewrite_expr(*if_true)?),
                if_false: Box::new(self.rewrite_expr(*if_false)?),
            },
            Expr::Coalesce { left, right } => Expr::Coalesce {
                left: Box::new(self.rewrite_expr(*left)?),
                right: Box::new(self.rewrite_expr(*right)?),
            },
            Expr::NullConditional { guard, access } => Expr::NullConditional {
                guard: Box::new(self.rewrite_expr(*guard)?),
                access: Box::new(self.rewrite_expr(*access)?),
            },
            Expr::KeyTuple(items) => Expr::KeyTuple(
                items
                    .into_iter()
                    .map(|item| self.rewrite_expr(item))
                    .collect::<CompileResult<Vec<_>>>()?,
            ),
            Expr::ArrayLength(operand) => {
                Expr::ArrayLength(Box::new(self.rewrite_expr(*operand)?))
            }
            Expr::Subquery(query) => Expr::Subquery(Box::new(self.rewrite_query(*query)?)),
            Expr::Materialize { kind, source } => Expr::Materialize {
                kind,
                source: Box::new(self.rewrite_expr(*source)?),
            },
            Expr::ReferenceEqual { left, right } => Expr::ReferenceEqual {
                left: Box::new(self.rewrite_expr(*left)?),
                right: Box::new(self.rewrite_expr(*right)?),
            },
            Expr::Shared { slot, expr } => Expr::Shared {
                slot,
                expr: Box::new(self.rewrite_expr(*expr)?),
            },
        })
    }

    /// Default recursion over a query model: source origin first, then body
    /// clauses in order, then the projection, then result operators.
    fn walk_query(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        let source = SourceClause {
            id: query.source.id,
            origin: self.rewrite_origin(query.source.origin)?,
        };
        let body = query
            .body
            .into_iter()
            .map(|clause| self.rewrite_body_clause(clause))
            .collect::<CompileResult<Vec<_>>>()?;
        let projection = self.rewrite_expr(query.projection)?;
        let operators = query
            .operators
            .into_iter()
            .map(|op| self.rewrite_operator(op))
            .collect::<CompileResult<Vec<_>>>()?;
        Ok(QueryModel {
            source,
            body,
            projection,
            operators,
            origin_navigation: query.origin_navigation,
        })
    }

    /// Recurses into a source origin.
    fn rewrite_origin(&mut self, origin: SourceOrigin) -> CompileResult<SourceOrigin> {
        Ok(match origin {
            SourceOrigin::EntitySet(entity) => SourceOrigin::EntitySet(entity),
            SourceOrigin::Query(inner) => {
                SourceOrigin::Query(Box::new(self.rewrite_query(*inner)?))
            }
        })
    }

    /// Recurses into one body clause.
    fn rewrite_body_clause(&mut self, clause: BodyClause) -> CompileResult<BodyClause> {
        Ok(match clause {
            BodyClause::Where(expr) => BodyClause::Where(self.rewrite_expr(expr)?),
            BodyClause::Join(join) => BodyClause::Join(self.rewrite_join(join)?),
            BodyClause::GroupJoin(group) => BodyClause::GroupJoin(GroupJoinClause {
                group_id: group.group_id,
                join: self.rewrite_join(group.join)?,
            }),
            BodyClause::Flatten(flatten) => BodyClause::Flatten(flatten),
            BodyClause::OrderBy(orderings) => BodyClause::OrderBy(
                orderings
                    .into_iter()
                    .map(|o| {
                        Ok(Ordering {
                            expr: self.rewrite_expr(o.expr)?,
                            direction: o.direction,
                        })
                    })
                    .collect::<CompileResult<Vec<_>>>()?,
            ),
        })
    }

    /// Recurses into a join clause.
    fn rewrite_join(&mut self, join: JoinClause) -> CompileResult<JoinClause> {
        Ok(JoinClause {
            id: join.id,
            inner: self.rewrite_origin(join.inner)?,
            outer_key: self.rewrite_expr(join.outer_key)?,
            inner_key: self.rewrite_expr(join.inner_key)?,
        })
    }

    /// Recurses into one result operator.
    fn rewrite_operator(&mut self, op: ResultOperator) -> CompileResult<ResultOperator> {
        Ok(match op {
            ResultOperator::Take(expr) => ResultOperator::Take(self.rewrite_expr(expr)?),
            ResultOperator::Skip(expr) => ResultOperator::Skip(self.rewrite_expr(expr)?),
            ResultOperator::All(expr) => ResultOperator::All(self.rewrite_expr(expr)?),
            ResultOperator::Contains(expr) => ResultOperator::Contains(self.rewrite_expr(expr)?),
            ResultOperator::Concat(other) => {
                ResultOperator::Concat(Box::new(self.rewrite_query(*other)?))
            }
            ResultOperator::Union(other) => {
                ResultOperator::Union(Box::new(self.rewrite_query(*other)?))
            }
            ResultOperator::Intersect(other) => {
                ResultOperator::Intersect(Box::new(self.rewrite_query(*other)?))
            }
            ResultOperator::Except(other) => {
                ResultOperator::Except(Box::new(self.rewrite_query(*other)?))
            }
            ResultOperator::GroupBy { key, element } => ResultOperator::GroupBy {
                key: self.rewrite_expr(key)?,
                element: self.rewrite_expr(element)?,
            },
            ResultOperator::First { .. }
            | ResultOperator::Single { .. }
            | ResultOperator::Last { .. }
            | ResultOperator::Any
            | ResultOperator::Count
            | ResultOperator::Distinct => op,
        })
    }
}

/// Collects every source *referenced* (not declared) inside an expression.
pub fn source_refs_expr(expr: &Expr, out: &mut HashSet<SourceId>) {
    match expr {
        Expr::Source(id) => {
            out.insert(*id);
        }
        Expr::Constant(_)
        | Expr::External(_)
        | Expr::Parameter(_)
        | Expr::CorrelatedCollection { .. }
        | Expr::SharedRef(_) => {}
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => source_refs_expr(object, out),
        Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => {
            source_refs_expr(operand, out)
        }
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => {
            source_refs_expr(left, out);
            source_refs_expr(right, out);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            source_refs_expr(test, out);
            source_refs_expr(if_true, out);
            source_refs_expr(if_false, out);
        }
        Expr::NullConditional { guard, access } => {
            source_refs_expr(guard, out);
            source_refs_expr(access, out);
        }
        Expr::KeyTuple(items) => {
            for item in items {
                source_refs_expr(item, out);
            }
        }
        Expr::Subquery(query) => source_refs_query(query, out),
        Expr::Materialize { source, .. } => source_refs_expr(source, out),
        Expr::Shared { expr, .. } => source_refs_expr(expr, out),
    }
}

/// Collects every source referenced anywhere inside a query model,
/// including its nested subqueries.
pub fn source_refs_query(query: &QueryModel, out: &mut HashSet<SourceId>) {
    if let SourceOrigin::Query(inner) = &query.source.origin {
        source_refs_query(inner, out);
    }
    for clause in &query.body {
        match clause {
            BodyClause::Where(expr) => source_refs_expr(expr, out),
            BodyClause::Join(join) => {
                if let SourceOrigin::Query(inner) = &join.inner {
                    source_refs_query(inner, out);
                }
                source_refs_expr(&join.outer_key, out);
                source_refs_expr(&join.inner_key, out);
            }
            BodyClause::GroupJoin(group) => {
                if let SourceOrigin::Query(inner) = &group.join.inner {
                    source_refs_query(inner, out);
                }
                source_refs_expr(&group.join.outer_key, out);
                source_refs_expr(&group.join.inner_key, out);
            }
            BodyClause::Flatten(flatten) => {
                out.insert(flatten.group);
            }
            BodyClause::OrderBy(orderings) => {
                for ordering in orderings {
                    source_refs_expr(&ordering.expr, out);
                }
            }
        }
    }
    source_refs_expr(&query.projection, out);
    for op in &query.operators {
        match op {
            ResultOperator::Take(expr)
            | ResultOperator::Skip(expr)
            | ResultOperator::All(expr)
            | ResultOperator::Contains(expr) => source_refs_expr(expr, out),
            ResultOperator::Concat(other)
            | ResultOperator::Union(other)
            | ResultOperator::Intersect(other)
            | ResultOperator::Except(other) => source_refs_query(other, out),
            ResultOperator::GroupBy { key, element } => {
                source_refs_expr(key, out);
                source_refs_expr(element, out);
            }
            ResultOperator::First { .. }
            | ResultOperator::Single { .. }
            | ResultOperator::Last { .. }
            | ResultOperator::Any
            | ResultOperator::Count
            | ResultOperator::Distinct => {}
        }
    }
}
