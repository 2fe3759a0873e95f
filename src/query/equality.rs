//! Entity Equality Rewriter: turns entity comparisons into key comparisons.
//!
//! `==`/`!=` between entity-valued operands has no column to compare, so
//! each comparison is rewritten in terms of keys before navigations are
//! expanded. Comparing against null becomes a key null test (using the
//! foreign key when the operand ends in a dependent-to-principal
//! navigation, so no join is ever needed); two operands of the same root
//! type compare their primary keys; operands of unrelated root types fold
//! to a compile-time boolean.
//!
//! Collection navigations get the historical special cases: compared to
//! null, the collection's owner is compared instead; compared to another
//! collection of the same navigation, the comparison keeps reference
//! identity. Both raise a diagnostic and compile with those literal
//! semantics.
//!
//! Runs on the raw tree, before the navigation rewriter; the key accesses
//! it plants are ordinary paths the later passes resolve and optimize.

use crate::model::Model;
use crate::query::binder::bind_path;
use crate::query::collection::{key_selector, null_key};
use crate::query::diagnostics::{Diagnostic, Diagnostics};
use crate::query::errors::CompileResult;
use crate::query::expr::{BinaryOp, Expr};
use crate::query::scope::ScopeMap;
use crate::query::visit::Rewriter;
use crate::types::{EntityId, NavigationId, SourceId};

/// The equality-rewriting pass over one query tree.
pub struct EqualityRewriter<'a> {
    model: &'a Model,
    scope: &'a ScopeMap,
    diagnostics: &'a mut Diagnostics,
}

/// How an equality operand resolves against the model.
enum Operand {
    /// Null literal.
    Null,
    /// Entity-valued path (bare source, downcast, or trailing
    /// single-valued navigation).
    Entity {
        entity: EntityId,
        /// Receiver and navigation when the path ends in a navigation.
        receiver: Option<(Expr, NavigationId)>,
    },
    /// Scalar entity produced by a subquery with a trailing choice
    /// operator and an entity-shaped projection.
    Choice { source: SourceId, entity: EntityId },
    /// Collection navigation access.
    Collection {
        navigation: NavigationId,
        owner: Option<Expr>,
    },
    /// Anything else; left untouched.
    Opaque,
}

impl<'a> EqualityRewriter<'a> {
    /// Creates the pass.
    pub fn new(model: &'a Model, scope: &'a ScopeMap, diagnostics: &'a mut Diagnostics) -> Self {
        Self {
            model,
            scope,
            diagnostics,
        }
    }

    fn classify(&self, expr: &Expr) -> CompileResult<Operand> {
        if expr.is_null_constant() {
            return Ok(Operand::Null);
        }
        if let Expr::Subquery(query) = expr {
            if let Expr::Source(id) = query.projection {
                if matches!(query.operators.last(), Some(op) if op.is_choice()) {
                    if let Some(entity) = self.scope.entity_of(id) {
                        return Ok(Operand::Choice { source: id, entity });
                    }
                }
            }
        }
        let Some(path) = bind_path(expr, self.model, self.scope)? else {
            return Ok(Operand::Opaque);
        };
        if let Some(nav_id) = path.trailing_navigation() {
            let nav = self.model.navigation(nav_id);
            if nav.collection {
                return Ok(Operand::Collection {
                    navigation: nav_id,
                    owner: receiver_of(expr),
                });
            }
            return Ok(Operand::Entity {
                entity: nav.target,
                receiver: receiver_of(expr).map(|owner| (owner, nav_id)),
            });
        }
        match path.terminal_entity(self.model) {
            Some(entity) => Ok(Operand::Entity {
                entity,
                receiver: None,
            }),
            None => Ok(Operand::Opaque),
        }
    }

    fn rewrite_comparison(&mut self, op: BinaryOp, left: Expr, right: Expr) -> CompileResult<Expr> {
        let lhs = self.classify(&left)?;
        let rhs = self.classify(&right)?;
        Ok(match (lhs, rhs) {
            (Operand::Null, Operand::Null) => Expr::binary(op, left, right),

            // A collection is "null" only if its owner is.
            (Operand::Collection { navigation, owner }, Operand::Null)
            | (Operand::Null, Operand::Collection { navigation, owner }) => {
                self.report_collection(navigation, |entity, nav| {
                    Diagnostic::CollectionNullComparison {
                        entity,
                        navigation: nav,
                    }
                });
                match owner {
                    Some(owner) => self.rewrite_comparison(op, owner, Expr::null())?,
                    None => Expr::binary(op, left, right),
                }
            }

            (
                Operand::Collection { navigation: a, .. },
                Operand::Collection { navigation: b, .. },
            ) if a == b => {
                self.report_collection(a, |entity, nav| {
                    Diagnostic::CollectionReferenceComparison {
                        entity,
                        navigation: nav,
                    }
                });
                let identity = Expr::ReferenceEqual {
                    left: Box::new(left),
                    right: Box::new(right),
                };
                if op == BinaryOp::NotEq {
                    Expr::not(identity)
                } else {
                    identity
                }
            }

            (Operand::Entity { entity, receiver }, Operand::Null)
            | (Operand::Null, Operand::Entity { entity, receiver }) => {
                let probed = if left.is_null_constant() { right } else { left };
                self.null_test(op, probed, entity, receiver)
            }
            (Operand::Choice { source, entity }, Operand::Null) => {
                let len = self.model.primary_key(entity).len();
                Expr::binary(op, self.keyed(left, source, entity), null_key(len))
            }
            (Operand::Null, Operand::Choice { source, entity }) => {
                let len = self.model.primary_key(entity).len();
                Expr::binary(op, null_key(len), self.keyed(right, source, entity))
            }

            (lhs @ (Operand::Entity { .. } | Operand::Choice { .. }),
             rhs @ (Operand::Entity { .. } | Operand::Choice { .. })) => {
                let (le, re) = (entity_of(&lhs), entity_of(&rhs));
                if le != re {
                    // Unrelated root types can never be the same row.
                    Expr::bool(op == BinaryOp::NotEq)
                } else {
                    let lk = self.key_of(left, &lhs);
                    let rk = self.key_of(right, &rhs);
                    Expr::binary(op, lk, rk)
                }
            }

            _ => Expr::binary(op, left, right),
        })
    }

    /// Primary-key null test, downgraded to a foreign-key null test when
    /// the operand ends in a dependent-to-principal navigation.
    fn null_test(
        &self,
        op: BinaryOp,
        expr: Expr,
        entity: EntityId,
        receiver: Option<(Expr, NavigationId)>,
    ) -> Expr {
        if let Some((owner, nav_id)) = receiver {
            let nav = self.model.navigation(nav_id);
            if nav.is_dependent_to_principal() {
                let fk = self.model.foreign_key(nav.foreign_key);
                let key = key_selector(self.model, fk.dependent, owner, &fk.dependent_props);
                return Expr::binary(op, key, null_key(fk.dependent_props.len()));
            }
        }
        let pk = self.model.primary_key(entity);
        let key = key_selector(self.model, entity, expr, pk);
        Expr::binary(op, key, null_key(pk.len()))
    }

    fn key_of(&self, expr: Expr, operand: &Operand) -> Expr {
        match operand {
            Operand::Entity { entity, .. } => {
                let pk = self.model.primary_key(*entity).to_vec();
                key_selector(self.model, *entity, expr, &pk)
            }
            Operand::Choice { source, entity } => self.keyed(expr, *source, *entity),
            _ => expr,
        }
    }

    /// Pushes the key access into a choice subquery's projection so the
    /// scalar it yields is the key, not the row.
    fn keyed(&self, expr: Expr, source: SourceId, entity: EntityId) -> Expr {
        let Expr::Subquery(mut query) = expr else {
            return expr;
        };
        let pk = self.model.primary_key(entity).to_vec();
        query.projection = key_selector(self.model, entity, Expr::Source(source), &pk);
        Expr::Subquery(query)
    }

    fn report_collection(
        &mut self,
        navigation: NavigationId,
        build: impl FnOnce(String, String) -> Diagnostic,
    ) {
        let nav = self.model.navigation(navigation);
        let entity = self.model.entity(nav.declaring).name.clone();
        self.diagnostics.report(build(entity, nav.name.clone()));
    }
}

impl Rewriter for EqualityRewriter<'_> {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        let expr = self.walk_expr(expr)?;
        let Expr::Binary { op, left, right } = expr else {
            return Ok(expr);
        };
        if !op.is_equality() {
            return Ok(Expr::Binary { op, left, right });
        }
        self.rewrite_comparison(op, *left, *right)
    }
}

fn entity_of(operand: &Operand) -> Option<EntityId> {
    match operand {
        Operand::Entity { entity, .. } | Operand::Choice { entity, .. } => Some(*entity),
        _ => None,
    }
}

/// Receiver of the outermost member access, when the expression is one.
fn receiver_of(expr: &Expr) -> Option<Expr> {
    match expr {
        Expr::Property { object, .. } | Expr::NamedProperty { object, .. } => {
            Some((**object).clone())
        }
        _ => None,
    }
}
