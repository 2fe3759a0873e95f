//! Collection Navigation Rewriter.
//!
//! A collection-valued navigation cannot be represented as a scalar join:
//! `owner.Items` becomes an independent query over the target entity set,
//! filtered by the foreign key back to the owner. The outer key access is
//! wrapped in a null-conditional guard so a null owner yields an empty
//! collection instead of faulting.
//!
//! The produced subquery is stamped with the originating navigation so the
//! correlated collection extractor can later recognize and batch it; until
//! then it is evaluated per owner row (streaming).

use crate::model::{Model, Navigation, NavigationDirection};
use crate::query::expr::Expr;
use crate::query::scope::ScopeMap;
use crate::query::tree::QueryModel;
use crate::types::{EntityId, PropertyId, SourceIdGen};

/// Builds the key selector for `props` of `entity`, accessed on `object`.
///
/// Single-property keys stay bare; composite keys become an ordered tuple.
pub(crate) fn key_selector(
    model: &Model,
    entity: EntityId,
    object: Expr,
    props: &[PropertyId],
) -> Expr {
    let entity = model.entity(entity);
    let access = |prop: PropertyId, object: Expr| {
        let name = entity
            .property(prop)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        Expr::property(object, name)
    };
    match props {
        [single] => access(*single, object),
        many => Expr::KeyTuple(
            many.iter()
                .map(|prop| access(*prop, object.clone()))
                .collect(),
        ),
    }
}

/// Builds the all-null comparand matching a key of `len` columns.
pub(crate) fn null_key(len: usize) -> Expr {
    if len <= 1 {
        Expr::null()
    } else {
        Expr::KeyTuple(vec![Expr::null(); len])
    }
}

/// Expands a collection navigation reached as the final step of a path.
///
/// `owner` is the (already rewritten) expression yielding the navigation's
/// owner row; `owner_entity` its entity type. Returns the correlated
/// filtered subquery over the navigation's target entity set.
pub fn expand(
    model: &Model,
    scope: &mut ScopeMap,
    ids: &mut SourceIdGen,
    owner: Expr,
    nav: &Navigation,
) -> QueryModel {
    debug_assert!(nav.collection);
    let fk = model.foreign_key(nav.foreign_key);

    // A collection navigation lives on the principal; its elements are the
    // dependents holding the foreign key.
    let (owner_entity, inner_props, owner_props) = match nav.direction {
        NavigationDirection::PrincipalToDependent => (
            fk.principal,
            fk.dependent_props.as_slice(),
            fk.principal_props.as_slice(),
        ),
        NavigationDirection::DependentToPrincipal => (
            fk.dependent,
            fk.principal_props.as_slice(),
            fk.dependent_props.as_slice(),
        ),
    };

    let inner_id = ids.fresh();
    scope.bind_entity(inner_id, nav.target);

    let inner_key = key_selector(model, nav.target, Expr::Source(inner_id), inner_props);
    let outer_key = Expr::null_conditional(
        owner.clone(),
        key_selector(model, owner_entity, owner, owner_props),
    );

    let mut query =
        QueryModel::from_entity(inner_id, nav.target).with_where(Expr::eq(inner_key, outer_key));
    query.origin_navigation = Some(nav.id);
    query
}
