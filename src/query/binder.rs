//! Path Binder: resolves member-access chains against the domain model.
//!
//! Given an expression, the binder either produces an ordered list of
//! property-or-navigation steps anchored to exactly one source reference,
//! or decides the expression is not a model path at all (a constant, an
//! opaque computation, a projected tuple). It sees through type downcasts,
//! plain member accesses, indexer-style property calls, and
//! null-conditional wrappers.
//!
//! The binder is a pure function over immutable inputs; callers may invoke
//! it repeatedly on the same expression.

use smallvec::SmallVec;

use crate::model::Model;
use crate::query::errors::{CompileError, CompileResult};
use crate::query::expr::Expr;
use crate::query::scope::ScopeMap;
use crate::types::{EntityId, NavigationId, PropertyId, SourceId};

/// One step of a bound path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathStep {
    /// Scalar property access; always terminal.
    Property(PropertyId),
    /// Navigation traversal.
    Navigation(NavigationId),
}

/// A member-access chain resolved against the model.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundPath {
    /// The source reference anchoring the path.
    pub source: SourceId,
    /// Entity type of the anchoring source.
    pub root_entity: EntityId,
    /// Ordered steps; all but the last are navigations.
    pub steps: SmallVec<[PathStep; 4]>,
}

impl BoundPath {
    /// The trailing scalar property, when the path ends in one.
    pub fn trailing_property(&self) -> Option<PropertyId> {
        match self.steps.last() {
            Some(PathStep::Property(id)) => Some(*id),
            _ => None,
        }
    }

    /// The trailing navigation, when the path ends in one.
    pub fn trailing_navigation(&self) -> Option<NavigationId> {
        match self.steps.last() {
            Some(PathStep::Navigation(id)) => Some(*id),
            _ => None,
        }
    }

    /// The navigation prefix of the path (every step but a trailing
    /// property).
    pub fn navigations(&self) -> impl Iterator<Item = NavigationId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            PathStep::Navigation(id) => Some(*id),
            PathStep::Property(_) => None,
        })
    }

    /// True when the path is a bare source reference with no steps.
    pub fn is_bare_source(&self) -> bool {
        self.steps.is_empty()
    }

    /// Entity type the path yields, walking navigations from the root.
    /// `None` when the path ends in a scalar property.
    pub fn terminal_entity(&self, model: &Model) -> Option<EntityId> {
        let mut current = self.root_entity;
        for step in &self.steps {
            match step {
                PathStep::Navigation(id) => current = model.navigation(*id).target,
                PathStep::Property(_) => return None,
            }
        }
        Some(current)
    }
}

/// Binds `expr` to a model path, or returns `Ok(None)` when the expression
/// does not denote a property path rooted at a known source.
///
/// An indexer-style access ([`Expr::NamedProperty`]) naming a member absent
/// from the resolved entity type is a fatal configuration error; a plain
/// member access to an unmapped name simply fails to bind.
pub fn bind_path(expr: &Expr, model: &Model, scope: &ScopeMap) -> CompileResult<Option<BoundPath>> {
    let Some(binding) = bind_inner(expr, model, scope)? else {
        return Ok(None);
    };
    Ok(Some(binding.path))
}

struct Binding {
    path: BoundPath,
    /// Entity the next member resolves against; `None` after a scalar step.
    current: Option<EntityId>,
}

fn bind_inner(expr: &Expr, model: &Model, scope: &ScopeMap) -> CompileResult<Option<Binding>> {
    match expr {
        Expr::Source(id) => Ok(scope.entity_of(*id).map(|entity| Binding {
            path: BoundPath {
                source: *id,
                root_entity: entity,
                steps: SmallVec::new(),
            },
            current: Some(entity),
        })),
        Expr::Downcast { object, entity } => {
            let Some(mut binding) = bind_inner(object, model, scope)? else {
                return Ok(None);
            };
            let target = model
                .entity_by_name(entity)
                .ok_or_else(|| CompileError::UnknownEntity {
                    entity: entity.clone(),
                })?;
            binding.current = Some(target.id);
            Ok(Some(binding))
        }
        Expr::NullConditional { access, .. } => bind_inner(access, model, scope),
        Expr::Property { object, name } => bind_member(object, name, false, model, scope),
        Expr::NamedProperty { object, name } => bind_member(object, name, true, model, scope),
        _ => Ok(None),
    }
}

fn bind_member(
    object: &Expr,
    name: &str,
    named_access: bool,
    model: &Model,
    scope: &ScopeMap,
) -> CompileResult<Option<Binding>> {
    let Some(mut binding) = bind_inner(object, model, scope)? else {
        return Ok(None);
    };
    let Some(entity_id) = binding.current else {
        // A scalar step cannot be dereferenced further.
        return Ok(None);
    };
    let entity = model.entity(entity_id);

    if let Some(nav) = model.navigation_by_name(entity_id, name) {
        binding.path.steps.push(PathStep::Navigation(nav.id));
        binding.current = Some(nav.target);
        return Ok(Some(binding));
    }
    if let Some(prop) = entity.property_by_name(name) {
        binding.path.steps.push(PathStep::Property(prop.id));
        binding.current = None;
        return Ok(Some(binding));
    }
    if named_access {
        return Err(CompileError::UnknownProperty {
            entity: entity.name.clone(),
            property: name.to_owned(),
        });
    }
    Ok(None)
}
