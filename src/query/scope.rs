//! Source-to-entity scope tracking.
//!
//! Every pass that resolves member names needs to know which entity type a
//! source clause yields. Source ids are unique within one compilation, so a
//! single flat map covers every scope, including nested subqueries. Sources
//! whose rows are not entity-shaped (projected tuples, groups of scalars)
//! simply have no entry.

use std::collections::HashMap;

use crate::model::Model;
use crate::query::tree::{BodyClause, QueryModel, ResultOperator, SourceOrigin};
use crate::query::expr::Expr;
use crate::types::{EntityId, SourceId};

/// Maps source ids to the entity type their rows carry.
#[derive(Clone, Debug, Default)]
pub struct ScopeMap {
    entities: HashMap<SourceId, EntityId>,
    /// Group sources (bound by group joins) mapped to their element entity.
    groups: HashMap<SourceId, EntityId>,
}

impl ScopeMap {
    /// Builds the map for an entire query tree.
    pub fn collect(query: &QueryModel, model: &Model) -> Self {
        let mut map = Self::default();
        map.collect_query(query, model);
        map
    }

    /// Returns the entity type of an entity-shaped source.
    pub fn entity_of(&self, source: SourceId) -> Option<EntityId> {
        self.entities.get(&source).copied()
    }

    /// Returns the element entity of a group source.
    pub fn group_element(&self, source: SourceId) -> Option<EntityId> {
        self.groups.get(&source).copied()
    }

    /// Registers an entity-shaped source added by a rewriting pass.
    pub fn bind_entity(&mut self, source: SourceId, entity: EntityId) {
        self.entities.insert(source, entity);
    }

    /// Registers a group source added by a rewriting pass.
    pub fn bind_group(&mut self, source: SourceId, element: EntityId) {
        self.groups.insert(source, element);
    }

    fn origin_entity(&mut self, origin: &SourceOrigin, model: &Model) -> Option<EntityId> {
        match origin {
            SourceOrigin::EntitySet(entity) => Some(*entity),
            SourceOrigin::Query(inner) => {
                self.collect_query(inner, model);
                self.projected_entity(inner)
            }
        }
    }

    /// Entity carried by a subquery's rows, when the projection is a bare
    /// source reference (possibly transitively).
    fn projected_entity(&self, query: &QueryModel) -> Option<EntityId> {
        match &query.projection {
            Expr::Source(id) => self.entity_of(*id),
            _ => None,
        }
    }

    fn collect_query(&mut self, query: &QueryModel, model: &Model) {
        if let Some(entity) = self.origin_entity(&query.source.origin, model) {
            self.entities.insert(query.source.id, entity);
        }
        for clause in &query.body {
            match clause {
                BodyClause::Where(expr) => self.collect_expr(expr, model),
                BodyClause::Join(join) => {
                    self.collect_expr(&join.outer_key, model);
                    self.collect_expr(&join.inner_key, model);
                    if let Some(entity) = self.origin_entity(&join.inner, model) {
                        self.entities.insert(join.id, entity);
                    }
                }
                BodyClause::GroupJoin(group) => {
                    self.collect_expr(&group.join.outer_key, model);
                    self.collect_expr(&group.join.inner_key, model);
                    if let Some(entity) = self.origin_entity(&group.join.inner, model) {
                        self.entities.insert(group.join.id, entity);
                        self.groups.insert(group.group_id, entity);
                    }
                }
                BodyClause::Flatten(flatten) => {
                    if let Some(entity) = self.group_element(flatten.group) {
                        self.entities.insert(flatten.id, entity);
                    }
                }
                BodyClause::OrderBy(orderings) => {
                    for ordering in orderings {
                        self.collect_expr(&ordering.expr, model);
                    }
                }
            }
        }
        self.collect_expr(&query.projection, model);
        for op in &query.operators {
            match op {
                ResultOperator::Take(expr)
                | ResultOperator::Skip(expr)
                | ResultOperator::All(expr)
                | ResultOperator::Contains(expr) => self.collect_expr(expr, model),
                ResultOperator::Concat(other)
                | ResultOperator::Union(other)
                | ResultOperator::Intersect(other)
                | ResultOperator::Except(other) => self.collect_query(other, model),
                ResultOperator::GroupBy { key, element } => {
                    self.collect_expr(key, model);
                    self.collect_expr(element, model);
                }
                _ => {}
            }
        }
    }

    fn collect_expr(&mut self, expr: &Expr, model: &Model) {
        match expr {
            Expr::Subquery(query) => self.collect_query(query, model),
            Expr::Property { object, .. }
            | Expr::NamedProperty { object, .. }
            | Expr::Downcast { object, .. } => self.collect_expr(object, model),
            Expr::Unary { operand, .. } | Expr::ArrayLength(operand) => {
                self.collect_expr(operand, model)
            }
            Expr::Binary { left, right, .. }
            | Expr::Coalesce { left, right }
            | Expr::ReferenceEqual { left, right } => {
                self.collect_expr(left, model);
                self.collect_expr(right, model);
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.collect_expr(test, model);
                self.collect_expr(if_true, model);
                self.collect_expr(if_false, model);
            }
            Expr::NullConditional { guard, access } => {
                self.collect_expr(guard, model);
                self.collect_expr(access, model);
            }
            Expr::KeyTuple(items) => {
                for item in items {
                    self.collect_expr(item, model);
                }
            }
            Expr::Materialize { source, .. } => self.collect_expr(source, model),
            Expr::Shared { expr, .. } => self.collect_expr(expr, model),
            Expr::Constant(_)
            | Expr::External(_)
            | Expr::Parameter(_)
            | Expr::Source(_)
            | Expr::CorrelatedCollection { .. }
            | Expr::SharedRef(_) => {}
        }
    }
}
