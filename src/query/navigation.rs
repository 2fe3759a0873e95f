//! Navigation Rewriter: turns model navigation traversals into joins.
//!
//! A single-valued navigation access such as `order.Customer.Name` has no
//! relational meaning on its own. This pass materializes each traversed
//! navigation as a join against the target entity set and rewrites the
//! access to read from the joined rows. Required navigations produce inner
//! joins; optional navigations (and everything downstream of one) produce
//! a group join flattened with default-if-empty, with member accesses
//! wrapped in a null-conditional guard.
//!
//! Joins are deduplicated through a per-scope table keyed by owning source
//! and navigation, so ten accesses to `order.Customer` share one join.
//! Entries whose last reference disappears before the scope closes are
//! dropped instead of installed. Two accesses avoid a join entirely:
//! comparing a dependent-to-principal navigation against null collapses to
//! a null test on the foreign-key properties, and reading a referenced
//! principal key through such a navigation reads the foreign-key property
//! already present on the dependent row.
//!
//! Collection navigations reached as the final path step are handed to the
//! collection rewriter; a collection in the middle of a path is a fatal
//! compilation error.

use std::collections::{HashMap, HashSet};

use crate::model::{ForeignKey, Model, Navigation, NavigationDirection};
use crate::query::binder::{bind_path, BoundPath, PathStep};
use crate::query::collection;
use crate::query::errors::{CompileError, CompileResult};
use crate::query::expr::Expr;
use crate::query::scope::ScopeMap;
use crate::query::tree::{
    BodyClause, FlattenClause, GroupJoinClause, JoinClause, QueryModel, SourceClause, SourceOrigin,
};
use crate::query::visit::{source_refs_expr, source_refs_query, Rewriter};
use crate::types::{EntityId, NavigationId, SourceId, SourceIdGen};

/// Join-producing rewriting pass over one query tree.
pub struct NavigationRewriter<'a> {
    model: &'a Model,
    scope: &'a mut ScopeMap,
    ids: &'a mut SourceIdGen,
}

impl<'a> NavigationRewriter<'a> {
    /// Creates the pass over `model`, extending `scope` with the sources it
    /// introduces.
    pub fn new(model: &'a Model, scope: &'a mut ScopeMap, ids: &'a mut SourceIdGen) -> Self {
        Self { model, scope, ids }
    }

    /// Rewrites the whole tree, subqueries included.
    pub fn rewrite(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        self.rewrite_model(query)
    }

    /// Rewrites one query model with its own join table. Nested models get
    /// fresh tables; a subquery never installs joins into its parent.
    fn rewrite_model(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        let source = SourceClause {
            id: query.source.id,
            origin: match query.source.origin {
                SourceOrigin::Query(inner) => {
                    SourceOrigin::Query(Box::new(self.rewrite_model(*inner)?))
                }
                origin => origin,
            },
        };

        let mut scoped = Scoped {
            pass: self,
            joins: NavigationJoins::default(),
        };
        let body = query
            .body
            .into_iter()
            .map(|clause| scoped.rewrite_body_clause(clause))
            .collect::<CompileResult<Vec<_>>>()?;
        let projection = scoped.rewrite_expr(query.projection)?;
        let operators = query
            .operators
            .into_iter()
            .map(|op| scoped.rewrite_operator(op))
            .collect::<CompileResult<Vec<_>>>()?;
        let Scoped { joins, .. } = scoped;

        let mut query = QueryModel {
            source,
            body,
            projection,
            operators,
            origin_navigation: query.origin_navigation,
        };
        joins.install(&mut query);
        Ok(query)
    }
}

/// One query-model scope of the pass: the shared rewriter plus the join
/// table owned by this scope.
struct Scoped<'p, 'a> {
    pass: &'p mut NavigationRewriter<'a>,
    joins: NavigationJoins,
}

impl Rewriter for Scoped<'_, '_> {
    fn rewrite_query(&mut self, query: QueryModel) -> CompileResult<QueryModel> {
        self.pass.rewrite_model(query)
    }

    fn rewrite_expr(&mut self, expr: Expr) -> CompileResult<Expr> {
        if let Some(collapsed) = self.try_null_comparison(&expr)? {
            return Ok(collapsed);
        }
        if let Some(path) = bind_path(&expr, self.pass.model, self.pass.scope)? {
            if path.navigations().next().is_some() {
                return self.expand_path(&path);
            }
            // Plain property access; nothing to materialize.
            return Ok(expr);
        }
        self.walk_expr(expr)
    }
}

impl Scoped<'_, '_> {
    /// Collapses `path.Nav == null` (or `!=`) into a null test on the
    /// foreign-key properties when `Nav` sits on the dependent side, so no
    /// join is needed to decide whether the principal exists.
    fn try_null_comparison(&mut self, expr: &Expr) -> CompileResult<Option<Expr>> {
        let Expr::Binary { op, left, right } = expr else {
            return Ok(None);
        };
        if !op.is_equality() {
            return Ok(None);
        }
        let probed = if right.is_null_constant() {
            left
        } else if left.is_null_constant() {
            right
        } else {
            return Ok(None);
        };
        let Some(path) = bind_path(probed, self.pass.model, self.pass.scope)? else {
            return Ok(None);
        };
        let Some(nav_id) = path.trailing_navigation() else {
            return Ok(None);
        };
        let nav = self.pass.model.navigation(nav_id).clone();
        if !nav.is_dependent_to_principal() {
            return Ok(None);
        }
        let fk = self.pass.model.foreign_key(nav.foreign_key).clone();

        let (src, entity, optional) = self.expand_prefix(&path)?;
        let key = collection::key_selector(
            self.pass.model,
            entity,
            Expr::Source(src),
            &fk.dependent_props,
        );
        let key = guarded(optional, src, key);
        Ok(Some(Expr::Binary {
            op: *op,
            left: Box::new(key),
            right: Box::new(collection::null_key(fk.dependent_props.len())),
        }))
    }

    /// Expands every navigation step of a bound path, returning the
    /// rewritten access expression.
    fn expand_path(&mut self, path: &BoundPath) -> CompileResult<Expr> {
        let mut src = path.source;
        let mut entity = path.root_entity;
        let mut optional = false;
        let steps = &path.steps;

        let mut i = 0;
        while i < steps.len() {
            match steps[i] {
                PathStep::Property(prop) => {
                    let name = self.property_name(entity, prop);
                    let access = Expr::property(Expr::Source(src), name);
                    return Ok(guarded(optional, src, access));
                }
                PathStep::Navigation(nav_id) => {
                    let nav = self.pass.model.navigation(nav_id).clone();
                    let fk = self.pass.model.foreign_key(nav.foreign_key).clone();

                    if nav.collection {
                        if i + 1 == steps.len() {
                            let subquery = collection::expand(
                                self.pass.model,
                                self.pass.scope,
                                self.pass.ids,
                                Expr::Source(src),
                                &nav,
                            );
                            return Ok(Expr::subquery(subquery));
                        }
                        return Err(CompileError::CollectionTraversal {
                            entity: self.pass.model.entity(nav.declaring).name.clone(),
                            navigation: nav.name,
                        });
                    }

                    // Reading a referenced principal key through the
                    // navigation reads the foreign key on the dependent
                    // row; the join would add nothing.
                    if nav.is_dependent_to_principal() && i + 2 == steps.len() {
                        if let PathStep::Property(prop) = steps[i + 1] {
                            if let Some(pos) =
                                fk.principal_props.iter().position(|id| *id == prop)
                            {
                                let name = self.property_name(entity, fk.dependent_props[pos]);
                                let access = Expr::property(Expr::Source(src), name);
                                return Ok(guarded(optional, src, access));
                            }
                        }
                    }

                    optional |= step_optional(&nav, &fk);
                    src = self.ensure_join(src, &nav, &fk, optional);
                    entity = nav.target;
                }
            }
            i += 1;
        }
        // The path yields the joined entity rows themselves.
        Ok(Expr::Source(src))
    }

    /// Expands the navigation prefix of a path (all steps but the last),
    /// returning the source and entity the final step resolves against.
    fn expand_prefix(&mut self, path: &BoundPath) -> CompileResult<(SourceId, EntityId, bool)> {
        let mut src = path.source;
        let mut entity = path.root_entity;
        let mut optional = false;
        for step in &path.steps[..path.steps.len().saturating_sub(1)] {
            let PathStep::Navigation(nav_id) = step else {
                // A scalar prefix step cannot occur in a bound path.
                break;
            };
            let nav = self.pass.model.navigation(*nav_id).clone();
            let fk = self.pass.model.foreign_key(nav.foreign_key).clone();
            if nav.collection {
                return Err(CompileError::CollectionTraversal {
                    entity: self.pass.model.entity(nav.declaring).name.clone(),
                    navigation: nav.name,
                });
            }
            optional |= step_optional(&nav, &fk);
            src = self.ensure_join(src, &nav, &fk, optional);
            entity = nav.target;
        }
        Ok((src, entity, optional))
    }

    /// Returns the source bound to `nav`'s target rows for `owner`,
    /// creating the join on first use and reusing it afterwards.
    fn ensure_join(&mut self, owner: SourceId, nav: &Navigation, fk: &ForeignKey, optional: bool) -> SourceId {
        if let Some(target) = self.joins.reuse(owner, nav.id) {
            return target;
        }
        let (owner_entity, owner_props, target_props) = match nav.direction {
            NavigationDirection::DependentToPrincipal => {
                (fk.dependent, &fk.dependent_props, &fk.principal_props)
            }
            NavigationDirection::PrincipalToDependent => {
                (fk.principal, &fk.principal_props, &fk.dependent_props)
            }
        };

        let join_id = self.pass.ids.fresh();
        let outer_key = collection::key_selector(
            self.pass.model,
            owner_entity,
            Expr::Source(owner),
            owner_props,
        );
        let inner_key = collection::key_selector(
            self.pass.model,
            nav.target,
            Expr::Source(join_id),
            target_props,
        );
        let join = JoinClause {
            id: join_id,
            inner: SourceOrigin::EntitySet(nav.target),
            outer_key,
            inner_key,
        };
        self.pass.scope.bind_entity(join_id, nav.target);

        let (target, clauses) = if optional {
            let group_id = self.pass.ids.fresh();
            let flatten_id = self.pass.ids.fresh();
            self.pass.scope.bind_group(group_id, nav.target);
            self.pass.scope.bind_entity(flatten_id, nav.target);
            (
                flatten_id,
                vec![
                    BodyClause::GroupJoin(GroupJoinClause { group_id, join }),
                    BodyClause::Flatten(FlattenClause {
                        id: flatten_id,
                        group: group_id,
                        default_if_empty: true,
                    }),
                ],
            )
        } else {
            (join_id, vec![BodyClause::Join(join)])
        };
        self.joins.record(owner, nav.id, target, clauses);
        target
    }

    fn property_name(&self, entity: EntityId, prop: crate::types::PropertyId) -> String {
        self.pass
            .model
            .entity(entity)
            .property(prop)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }
}

/// Whether traversing `nav` can yield no row for an existing owner row.
fn step_optional(nav: &Navigation, fk: &ForeignKey) -> bool {
    match nav.direction {
        NavigationDirection::DependentToPrincipal => !fk.required,
        // The dependent row may simply not exist.
        NavigationDirection::PrincipalToDependent => true,
    }
}

fn guarded(optional: bool, src: SourceId, access: Expr) -> Expr {
    if optional {
        Expr::null_conditional(Expr::Source(src), access)
    } else {
        access
    }
}

/// Per-scope table of navigation joins, keyed by owning source and
/// navigation. Reference counted: reuse bumps the count, and entries no
/// longer referenced anywhere when the scope closes are discarded instead
/// of installed.
#[derive(Default)]
struct NavigationJoins {
    entries: Vec<JoinEntry>,
    index: HashMap<(SourceId, NavigationId), usize>,
}

struct JoinEntry {
    owner: SourceId,
    target: SourceId,
    refs: usize,
    clauses: Vec<BodyClause>,
}

impl NavigationJoins {
    fn reuse(&mut self, owner: SourceId, nav: NavigationId) -> Option<SourceId> {
        let slot = *self.index.get(&(owner, nav))?;
        let entry = &mut self.entries[slot];
        entry.refs += 1;
        Some(entry.target)
    }

    fn record(&mut self, owner: SourceId, nav: NavigationId, target: SourceId, clauses: Vec<BodyClause>) {
        self.index.insert((owner, nav), self.entries.len());
        self.entries.push(JoinEntry {
            owner,
            target,
            refs: 1,
            clauses,
        });
    }

    /// Installs surviving join clauses into the query body, each right
    /// after the clause binding its owner (or at the front for joins
    /// hanging off the main source).
    fn install(self, query: &mut QueryModel) {
        let mut refs = HashSet::new();
        source_refs_query(query, &mut refs);

        // Later entries chain off earlier ones, so walking backwards sees
        // a dependent's keep decision before its anchor's.
        let mut keep = vec![false; self.entries.len()];
        for i in (0..self.entries.len()).rev() {
            let entry = &self.entries[i];
            if !refs.contains(&entry.target) {
                tracing::debug!(
                    target = entry.target.0,
                    refs = entry.refs,
                    "dropping unreferenced navigation join"
                );
                continue;
            }
            keep[i] = true;
            for clause in &entry.clauses {
                match clause {
                    BodyClause::Join(join) | BodyClause::GroupJoin(GroupJoinClause { join, .. }) => {
                        source_refs_expr(&join.outer_key, &mut refs);
                    }
                    _ => {}
                }
            }
        }

        let mut front = 0usize;
        for (i, entry) in self.entries.into_iter().enumerate() {
            if !keep[i] {
                continue;
            }
            let at = if entry.owner == query.source.id {
                let at = front;
                front += entry.clauses.len();
                at
            } else {
                match query.body.iter().position(|c| binds(c, entry.owner)) {
                    Some(pos) => pos + 1,
                    None => {
                        let at = front;
                        front += entry.clauses.len();
                        at
                    }
                }
            };
            query.body.splice(at..at, entry.clauses);
        }
    }
}

/// Whether `clause` binds the source id `id`.
fn binds(clause: &BodyClause, id: SourceId) -> bool {
    match clause {
        BodyClause::Join(join) => join.id == id,
        BodyClause::GroupJoin(group) => group.join.id == id || group.group_id == id,
        BodyClause::Flatten(flatten) => flatten.id == id,
        BodyClause::Where(_) | BodyClause::OrderBy(_) => false,
    }
}
