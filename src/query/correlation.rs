//! Correlated Collection Extractor: batches collection-navigation
//! subqueries projected from a query.
//!
//! A collection subquery left in a projection is evaluated once per parent
//! row. When the subquery is self-contained (only ordering and paging on
//! top of its correlation filter, no stray references into outer scopes)
//! it can instead run once for all parents: the parent query is cloned,
//! reduced to the owner rows, joined to the child rows, and ordered
//! parent-first so a materialization runtime can slice the flat result
//! back into per-parent collections. Each lifted subquery is registered
//! with a stable ordinal and replaced in the projection by a
//! [`Expr::CorrelatedCollection`] placeholder carrying that ordinal.
//!
//! A subquery that fails validation is left in place and keeps its per-row
//! streaming semantics; declining the optimization is never an error.

use std::collections::HashSet;

use tracing::debug;

use crate::model::{Model, NavigationDirection};
use crate::query::collection::key_selector;
use crate::query::errors::CompileResult;
use crate::query::expr::{BinaryOp, CollectionKind, Expr};
use crate::query::scope::ScopeMap;
use crate::query::tree::{
    BodyClause, JoinClause, Ordering, QueryModel, ResultOperator, SourceOrigin,
};
use crate::query::visit::{source_refs_expr, source_refs_query, Rewriter};
use crate::types::{EntityId, NavigationId, PropertyId, SourceId, SourceIdGen};

/// Registration record for one lifted collection, consumed by the
/// materialization runtime that reassembles parents with their children.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedCollection {
    /// Ordinal of this registration; matches the placeholder left in the
    /// parent projection.
    pub index: usize,
    /// Navigation the collection came from.
    pub navigation: NavigationId,
    /// Collection shape to materialize per parent.
    pub kind: CollectionKind,
    /// Source in the parent query owning the collection.
    pub parent_source: SourceId,
    /// Key selector over the parent scope used to slice child rows.
    pub parent_key: Expr,
    /// Whether materialized entities participate in change tracking.
    pub tracking: bool,
    /// The batched query: cloned parent joined to the child rows, ordered
    /// parent-first then child, projecting `(parent key, child row)`.
    pub query: QueryModel,
    /// Paging window applied per parent slice, not to the batched query.
    pub window: Vec<ResultOperator>,
}

enum Lifted {
    Done(Expr),
    Skipped(Box<QueryModel>),
}

/// The extraction pass over one compiled query's projection.
pub struct CorrelationExtractor<'a> {
    model: &'a Model,
    scope: &'a mut ScopeMap,
    ids: &'a mut SourceIdGen,
    tracking: bool,
}

impl<'a> CorrelationExtractor<'a> {
    /// Creates the pass. `tracking` is stamped onto every registration.
    pub fn new(
        model: &'a Model,
        scope: &'a mut ScopeMap,
        ids: &'a mut SourceIdGen,
        tracking: bool,
    ) -> Self {
        Self {
            model,
            scope,
            ids,
            tracking,
        }
    }

    /// Walks the query's projection, lifting every qualifying collection
    /// subquery. Returns the rewritten query plus the registrations.
    pub fn extract(
        &mut self,
        query: QueryModel,
    ) -> CompileResult<(QueryModel, Vec<CorrelatedCollection>)> {
        let QueryModel {
            source,
            body,
            projection,
            operators,
            origin_navigation,
        } = query;
        let mut shell = QueryModel {
            source,
            body,
            projection: Expr::null(),
            operators,
            origin_navigation,
        };
        let mut registry = Vec::new();
        let projection = self.visit(projection, &shell, &mut registry)?;
        shell.projection = projection;
        Ok((shell, registry))
    }

    fn visit(
        &mut self,
        expr: Expr,
        parent: &QueryModel,
        registry: &mut Vec<CorrelatedCollection>,
    ) -> CompileResult<Expr> {
        Ok(match expr {
            Expr::Materialize { kind, source } => match *source {
                Expr::Subquery(sub) if sub.origin_navigation.is_some() => {
                    match self.try_lift(sub, kind, parent, registry)? {
                        Lifted::Done(placeholder) => placeholder,
                        Lifted::Skipped(sub) => Expr::materialize(kind, Expr::Subquery(sub)),
                    }
                }
                source => Expr::materialize(kind, self.visit(source, parent, registry)?),
            },
            Expr::Subquery(sub) if sub.origin_navigation.is_some() => {
                match self.try_lift(sub, CollectionKind::List, parent, registry)? {
                    Lifted::Done(placeholder) => placeholder,
                    Lifted::Skipped(sub) => Expr::Subquery(sub),
                }
            }
            Expr::Property { object, name } => Expr::Property {
                object: Box::new(self.visit(*object, parent, registry)?),
                name,
            },
            Expr::NamedProperty { object, name } => Expr::NamedProperty {
                object: Box::new(self.visit(*object, parent, registry)?),
                name,
            },
            Expr::KeyTuple(items) => Expr::KeyTuple(
                items
                    .into_iter()
                    .map(|item| self.visit(item, parent, registry))
                    .collect::<CompileResult<Vec<_>>>()?,
            ),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test,
                if_true: Box::new(self.visit(*if_true, parent, registry)?),
                if_false: Box::new(self.visit(*if_false, parent, registry)?),
            },
            Expr::Coalesce { left, right } => Expr::Coalesce {
                left: Box::new(self.visit(*left, parent, registry)?),
                right: Box::new(self.visit(*right, parent, registry)?),
            },
            Expr::NullConditional { guard, access } => Expr::NullConditional {
                guard,
                access: Box::new(self.visit(*access, parent, registry)?),
            },
            other => other,
        })
    }

    /// Attempts the full lift of one candidate subquery. Any disqualifying
    /// shape hands the subquery back unchanged.
    fn try_lift(
        &mut self,
        child: Box<QueryModel>,
        kind: CollectionKind,
        parent: &QueryModel,
        registry: &mut Vec<CorrelatedCollection>,
    ) -> CompileResult<Lifted> {
        let Some(nav_id) = child.origin_navigation else {
            return Ok(Lifted::Skipped(child));
        };
        if !child.operators.iter().all(ResultOperator::is_paging) {
            debug!(navigation = nav_id.0, "collection keeps streaming: non-paging operator");
            return Ok(Lifted::Skipped(child));
        }

        let declared = child.declared_sources();
        let Some(correlation) = find_correlation(&child, &declared) else {
            return Ok(Lifted::Skipped(child));
        };
        if !parent.declared_sources().contains(&correlation.owner) {
            return Ok(Lifted::Skipped(child));
        }

        // Everything but the correlation predicate must stay inside the
        // subquery's own scope.
        let mut pruned = (*child).clone();
        pruned.body.remove(correlation.clause);
        let mut refs = HashSet::new();
        source_refs_query(&pruned, &mut refs);
        if !refs.is_subset(&declared) {
            debug!(navigation = nav_id.0, "collection keeps streaming: escapes its scope");
            return Ok(Lifted::Skipped(child));
        }

        let (mut parent_clone, map) = parent.clone_remapped(self.ids);
        let Some(owner_clone) = map.get(&correlation.owner).copied() else {
            return Ok(Lifted::Skipped(child));
        };
        drop(child);
        let mut child = pruned;

        let nav = self.model.navigation(nav_id).clone();
        let fk = self.model.foreign_key(nav.foreign_key).clone();
        let (owner_entity, owner_props, child_props) = match nav.direction {
            NavigationDirection::PrincipalToDependent => (
                fk.principal,
                fk.principal_props.clone(),
                fk.dependent_props.clone(),
            ),
            NavigationDirection::DependentToPrincipal => (
                fk.dependent,
                fk.dependent_props.clone(),
                fk.principal_props.clone(),
            ),
        };

        // Trailing choice operator becomes a one-row window; Last flips
        // the ordering it would have picked from.
        if matches!(child.operators.last(), Some(op) if op.is_choice()) {
            let last = matches!(child.operators.pop(), Some(ResultOperator::Last { .. }));
            if last {
                reverse_orderings(&mut child.body);
            }
            child.operators.push(ResultOperator::Take(Expr::constant(1i64)));
        }
        let window = std::mem::take(&mut child.operators);

        let child_root = child.source.id;
        let child_orderings = lift_orderings(&mut child.body, child_root)?;

        // The cloned parent is reduced to its owner rows; its own filters,
        // joins and paging keep constraining which parents contribute.
        parent_clone.projection = Expr::Source(owner_clone);
        let outer_id = self.ids.fresh();
        self.scope.bind_entity(outer_id, owner_entity);

        // A paged parent must keep its orderings in place so the page
        // stays the same rows; the batch repeats the keys on the outside.
        let parent_paged = parent_clone.operators.iter().any(ResultOperator::is_paging);
        let parent_orderings = if parent_paged {
            copy_orderings(&parent_clone.body, owner_clone)
        } else {
            lift_orderings(&mut parent_clone.body, owner_clone)?
        };

        let join_id = self.ids.fresh();
        self.scope.bind_entity(join_id, nav.target);
        let join = JoinClause {
            id: join_id,
            inner: SourceOrigin::Query(Box::new(child)),
            outer_key: key_selector(self.model, owner_entity, Expr::Source(outer_id), &owner_props),
            inner_key: key_selector(self.model, nav.target, Expr::Source(join_id), &child_props),
        };

        // Parent-first ordering: explicit parent orderings when they can
        // be expressed over the owner rows, otherwise the owner's primary
        // key, otherwise the owner-side correlation columns. Then the
        // child: correlation key, then explicit orderings.
        let mut orderings: Vec<Ordering> = Vec::new();
        if parent_orderings.is_empty() {
            let pk = self.model.primary_key(owner_entity);
            let keys = if pk.is_empty() { &owner_props[..] } else { pk };
            for prop in keys {
                orderings.push(Ordering::asc(property_access(
                    self.model,
                    owner_entity,
                    outer_id,
                    *prop,
                )));
            }
        } else {
            for ordering in parent_orderings {
                orderings.push(Ordering {
                    expr: substitute_source(ordering.expr, owner_clone, outer_id)?,
                    direction: ordering.direction,
                });
            }
        }
        for prop in &child_props {
            orderings.push(Ordering::asc(property_access(
                self.model,
                nav.target,
                join_id,
                *prop,
            )));
        }
        for ordering in child_orderings {
            orderings.push(Ordering {
                expr: substitute_source(ordering.expr, child_root, join_id)?,
                direction: ordering.direction,
            });
        }

        let batch_key = key_selector(self.model, owner_entity, Expr::Source(outer_id), &owner_props);
        let mut batched = QueryModel::from_query(outer_id, parent_clone);
        batched.body.push(BodyClause::Join(join));
        batched.body.push(BodyClause::OrderBy(orderings));
        batched.projection = Expr::KeyTuple(vec![batch_key, Expr::Source(join_id)]);

        let parent_key = key_selector(
            self.model,
            owner_entity,
            Expr::Source(correlation.owner),
            &owner_props,
        );
        let index = registry.len();
        debug!(navigation = nav_id.0, index, "lifted collection into correlated batch");
        registry.push(CorrelatedCollection {
            index,
            navigation: nav_id,
            kind,
            parent_source: correlation.owner,
            parent_key,
            tracking: self.tracking,
            query: batched,
            window,
        });
        Ok(Lifted::Done(Expr::CorrelatedCollection { index, kind }))
    }
}

struct Correlation {
    /// Body index of the correlation predicate.
    clause: usize,
    /// The single outer source the predicate reaches for.
    owner: SourceId,
}

/// Finds the correlation predicate the collection rewriter planted: an
/// equality whose one side lives in the subquery and whose other side
/// references exactly one outer source.
fn find_correlation(child: &QueryModel, declared: &HashSet<SourceId>) -> Option<Correlation> {
    for (i, clause) in child.body.iter().enumerate() {
        let BodyClause::Where(Expr::Binary {
            op: BinaryOp::Eq,
            left,
            right,
        }) = clause
        else {
            continue;
        };
        for (inner, outer) in [(left, right), (right, left)] {
            let mut inner_refs = HashSet::new();
            source_refs_expr(inner, &mut inner_refs);
            let mut outer_refs = HashSet::new();
            source_refs_expr(outer, &mut outer_refs);
            if !inner_refs.is_subset(declared) || inner_refs.is_empty() {
                continue;
            }
            let escaped: Vec<SourceId> = outer_refs.difference(declared).copied().collect();
            if let [owner] = escaped[..] {
                if outer_refs.len() == 1 {
                    return Some(Correlation { clause: i, owner });
                }
            }
        }
    }
    None
}

/// Removes every ordering clause whose keys are computed purely over
/// `allowed`, returning the orderings in declaration order. Orderings
/// reaching other sources stay where they are.
fn lift_orderings(body: &mut Vec<BodyClause>, allowed: SourceId) -> CompileResult<Vec<Ordering>> {
    let mut lifted = Vec::new();
    let mut kept = Vec::with_capacity(body.len());
    for clause in body.drain(..) {
        match clause {
            BodyClause::OrderBy(orderings)
                if orderings.iter().all(|o| {
                    let mut refs = HashSet::new();
                    source_refs_expr(&o.expr, &mut refs);
                    refs.iter().all(|r| *r == allowed)
                }) =>
            {
                lifted.extend(orderings);
            }
            other => kept.push(other),
        }
    }
    *body = kept;
    Ok(lifted)
}

/// Clones every ordering computed purely over `allowed`, leaving the
/// clauses where they are.
fn copy_orderings(body: &[BodyClause], allowed: SourceId) -> Vec<Ordering> {
    let mut copied = Vec::new();
    for clause in body {
        let BodyClause::OrderBy(orderings) = clause else {
            continue;
        };
        if orderings.iter().all(|o| {
            let mut refs = HashSet::new();
            source_refs_expr(&o.expr, &mut refs);
            refs.iter().all(|r| *r == allowed)
        }) {
            copied.extend(orderings.iter().cloned());
        }
    }
    copied
}

fn reverse_orderings(body: &mut [BodyClause]) {
    for clause in body {
        if let BodyClause::OrderBy(orderings) = clause {
            for ordering in orderings {
                ordering.direction = ordering.direction.reversed();
            }
        }
    }
}

fn property_access(model: &Model, entity: EntityId, source: SourceId, prop: PropertyId) -> Expr {
    let name = model
        .entity(entity)
        .property(prop)
        .map(|p| p.name.clone())
        .unwrap_or_default();
    Expr::property(Expr::Source(source), name)
}

struct SourceSub {
    from: SourceId,
    to: SourceId,
}

impl Rewriter for SourceSub {
    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        match expr {
            Expr::Source(id) if id == self.from => Ok(Expr::Source(self.to)),
            other => self.walk_expr(other),
        }
    }
}

fn substitute_source(expr: Expr, from: SourceId, to: SourceId) -> CompileResult<Expr> {
    SourceSub { from, to }.rewrite_expr(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::query::collection;
    use crate::query::tree::SortDirection;

    fn model() -> Model {
        Model::builder()
            .entity("Customer", |e| {
                e.property("Id").property("Name").primary_key(["Id"])
            })
            .entity("Order", |e| {
                e.property("Id")
                    .property("CustomerId")
                    .property("Date")
                    .primary_key(["Id"])
            })
            .relation("Order", "Customer", |r| {
                r.foreign_key(["CustomerId"])
                    .dependent_nav("Customer")
                    .principal_nav("Orders")
            })
            .build()
            .expect("model builds")
    }

    struct Fixture {
        model: Model,
        scope: ScopeMap,
        ids: SourceIdGen,
        root: SourceId,
    }

    fn fixture() -> Fixture {
        let model = model();
        let customers = model.entity_by_name("Customer").expect("Customer").id;
        let mut ids = SourceIdGen::new();
        let root = ids.fresh();
        let mut scope = ScopeMap::default();
        scope.bind_entity(root, customers);
        Fixture {
            model,
            scope,
            ids,
            root,
        }
    }

    /// Builds `customers.Select(c => c.Orders <extras>)` with the child
    /// already expanded the way the collection rewriter leaves it.
    fn orders_projection(fix: &mut Fixture, extend: impl FnOnce(QueryModel) -> QueryModel) -> QueryModel {
        let customers = fix.model.entity_by_name("Customer").expect("Customer").id;
        let nav = fix
            .model
            .navigation_by_name(customers, "Orders")
            .expect("Orders nav")
            .clone();
        let child = collection::expand(
            &fix.model,
            &mut fix.scope,
            &mut fix.ids,
            Expr::Source(fix.root),
            &nav,
        );
        let child = extend(child);
        QueryModel::from_entity(fix.root, customers).with_projection(Expr::materialize(
            CollectionKind::List,
            Expr::subquery(child),
        ))
    }

    fn extract(fix: &mut Fixture, query: QueryModel) -> (QueryModel, Vec<CorrelatedCollection>) {
        CorrelationExtractor::new(&fix.model, &mut fix.scope, &mut fix.ids, false)
            .extract(query)
            .expect("extraction succeeds")
    }

    #[test]
    fn lifts_ordered_take_into_batch() {
        let mut fix = fixture();
        let query = orders_projection(&mut fix, |child| {
            let root = child.source.id;
            child
                .with_order_by(vec![Ordering::asc(Expr::property(
                    Expr::Source(root),
                    "Date",
                ))])
                .with_operator(ResultOperator::Take(Expr::constant(2i64)))
        });
        let (rewritten, registry) = extract(&mut fix, query);

        assert_eq!(
            rewritten.projection,
            Expr::CorrelatedCollection {
                index: 0,
                kind: CollectionKind::List,
            }
        );
        let reg = &registry[0];
        assert_eq!(reg.parent_source, fix.root);
        assert_eq!(reg.window, vec![ResultOperator::Take(Expr::constant(2i64))]);
        assert_eq!(
            reg.parent_key,
            Expr::property(Expr::Source(fix.root), "Id")
        );

        // Batched shape: cloned parent as source, child joined, ordered
        // parent key then correlation key then the explicit Date key.
        assert!(matches!(reg.query.source.origin, SourceOrigin::Query(_)));
        let BodyClause::Join(join) = &reg.query.body[0] else {
            panic!("unexpected clause {:?}", reg.query.body[0]);
        };
        let SourceOrigin::Query(child) = &join.inner else {
            panic!("unexpected join inner {:?}", join.inner);
        };
        assert!(child.body.is_empty(), "correlation predicate removed");
        assert!(child.operators.is_empty(), "window moved to registration");
        let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
            panic!("unexpected clause {:?}", reg.query.body[1]);
        };
        assert_eq!(orderings.len(), 3);
        assert_eq!(
            orderings[0].expr,
            Expr::property(Expr::Source(reg.query.source.id), "Id")
        );
        assert_eq!(orderings[1].expr, Expr::property(Expr::Source(join.id), "CustomerId"));
        assert_eq!(orderings[2].expr, Expr::property(Expr::Source(join.id), "Date"));
    }

    #[test]
    fn non_paging_operator_keeps_streaming() {
        let mut fix = fixture();
        let query = orders_projection(&mut fix, |child| {
            child.with_operator(ResultOperator::Distinct)
        });
        let projection = query.projection.clone();
        let (rewritten, registry) = extract(&mut fix, query);
        assert!(registry.is_empty());
        assert_eq!(rewritten.projection, projection);
    }

    #[test]
    fn escaping_reference_keeps_streaming() {
        let mut fix = fixture();
        let stray = fix.ids.fresh();
        let query = orders_projection(&mut fix, |child| {
            let root = child.source.id;
            child.with_where(Expr::eq(
                Expr::property(Expr::Source(root), "Date"),
                Expr::property(Expr::Source(stray), "Date"),
            ))
        });
        let (_, registry) = extract(&mut fix, query);
        assert!(registry.is_empty());
    }

    #[test]
    fn last_reverses_ordering_and_takes_one() {
        let mut fix = fixture();
        let query = orders_projection(&mut fix, |child| {
            let root = child.source.id;
            child
                .with_order_by(vec![Ordering::asc(Expr::property(
                    Expr::Source(root),
                    "Date",
                ))])
                .with_operator(ResultOperator::Last {
                    return_default: true,
                })
        });
        let (_, registry) = extract(&mut fix, query);
        let reg = &registry[0];
        assert_eq!(reg.window, vec![ResultOperator::Take(Expr::constant(1i64))]);
        let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
            panic!("unexpected clause {:?}", reg.query.body[1]);
        };
        let date = orderings
            .iter()
            .find(|o| matches!(&o.expr, Expr::Property { name, .. } if name == "Date"))
            .expect("date ordering present");
        assert_eq!(date.direction, SortDirection::Descending);
    }

    #[test]
    fn explicit_parent_ordering_wins_over_primary_key() {
        let mut fix = fixture();
        let customers = fix.model.entity_by_name("Customer").expect("Customer").id;
        let nav = fix
            .model
            .navigation_by_name(customers, "Orders")
            .expect("Orders nav")
            .clone();
        let child = collection::expand(
            &fix.model,
            &mut fix.scope,
            &mut fix.ids,
            Expr::Source(fix.root),
            &nav,
        );
        let query = QueryModel::from_entity(fix.root, customers)
            .with_order_by(vec![Ordering::desc(Expr::property(
                Expr::Source(fix.root),
                "Name",
            ))])
            .with_projection(Expr::materialize(CollectionKind::List, Expr::subquery(child)));
        let (_, registry) = extract(&mut fix, query);
        let reg = &registry[0];
        let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
            panic!("unexpected clause {:?}", reg.query.body[1]);
        };
        assert_eq!(
            orderings[0].expr,
            Expr::property(Expr::Source(reg.query.source.id), "Name")
        );
        assert_eq!(orderings[0].direction, SortDirection::Descending);
    }

    #[test]
    fn paged_parent_keeps_its_ordering_in_place() {
        let mut fix = fixture();
        let customers = fix.model.entity_by_name("Customer").expect("Customer").id;
        let nav = fix
            .model
            .navigation_by_name(customers, "Orders")
            .expect("Orders nav")
            .clone();
        let child = collection::expand(
            &fix.model,
            &mut fix.scope,
            &mut fix.ids,
            Expr::Source(fix.root),
            &nav,
        );
        let query = QueryModel::from_entity(fix.root, customers)
            .with_order_by(vec![Ordering::desc(Expr::property(
                Expr::Source(fix.root),
                "Name",
            ))])
            .with_projection(Expr::materialize(CollectionKind::List, Expr::subquery(child)))
            .with_operator(ResultOperator::Take(Expr::constant(5i64)));
        let (_, registry) = extract(&mut fix, query);
        let reg = &registry[0];

        // The cloned parent still pages the same five rows.
        let SourceOrigin::Query(parent) = &reg.query.source.origin else {
            panic!("unexpected source {:?}", reg.query.source.origin);
        };
        assert_eq!(
            parent.operators,
            vec![ResultOperator::Take(Expr::constant(5i64))]
        );
        assert!(
            parent.body.iter().any(|c| matches!(c, BodyClause::OrderBy(_))),
            "paged parent lost its ordering: {:?}",
            parent.body
        );

        // The batch still repeats the parent key on the outside.
        let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
            panic!("unexpected clause {:?}", reg.query.body[1]);
        };
        assert_eq!(
            orderings[0].expr,
            Expr::property(Expr::Source(reg.query.source.id), "Name")
        );
        assert_eq!(orderings[0].direction, SortDirection::Descending);
    }
}
