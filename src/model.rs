//! Read-only domain model consumed by the rewriting pipeline.
//!
//! The model is the oracle every pass consults: entities with scalar
//! properties, navigations (relationship references) backed by foreign
//! keys, and primary keys. It is constructed once through [`ModelBuilder`],
//! validated, and then only queried by name or identifier. Nothing in the
//! pipeline ever mutates it.

use std::collections::HashMap;

use crate::error::{ReliqError, Result};
use crate::types::{EntityId, ForeignKeyId, NavigationId, PropertyId};

/// Direction of a navigation relative to its foreign key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NavigationDirection {
    /// Navigation declared on the dependent, pointing at the principal
    /// (the side holding the foreign key; always single-valued).
    DependentToPrincipal,
    /// Navigation declared on the principal, pointing at its dependents
    /// (the "many" side for one-to-many relationships).
    PrincipalToDependent,
}

/// Scalar property of an entity.
#[derive(Clone, Debug)]
pub struct Property {
    /// Model-wide identifier.
    pub id: PropertyId,
    /// Property name as declared.
    pub name: String,
    /// Whether the column may hold nulls.
    pub nullable: bool,
}

/// Foreign-key definition linking a dependent entity to a principal.
#[derive(Clone, Debug)]
pub struct ForeignKey {
    /// Model-wide identifier.
    pub id: ForeignKeyId,
    /// Entity holding the foreign-key properties.
    pub dependent: EntityId,
    /// Entity whose key is referenced.
    pub principal: EntityId,
    /// Ordered foreign-key properties on the dependent.
    pub dependent_props: Vec<PropertyId>,
    /// Ordered referenced key properties on the principal.
    pub principal_props: Vec<PropertyId>,
    /// Whether the relationship is required (no orphaned dependents).
    pub required: bool,
}

/// Modeled relationship reference from one entity to another.
#[derive(Clone, Debug)]
pub struct Navigation {
    /// Model-wide identifier.
    pub id: NavigationId,
    /// Navigation name as declared on the entity.
    pub name: String,
    /// Entity declaring the navigation.
    pub declaring: EntityId,
    /// Entity the navigation points at.
    pub target: EntityId,
    /// Whether the navigation yields a collection of targets.
    pub collection: bool,
    /// Which side of the foreign key the navigation sits on.
    pub direction: NavigationDirection,
    /// Backing foreign key.
    pub foreign_key: ForeignKeyId,
    /// Inverse navigation, when one is declared.
    pub inverse: Option<NavigationId>,
}

impl Navigation {
    /// Returns true for single-valued dependent-to-principal navigations.
    pub fn is_dependent_to_principal(&self) -> bool {
        self.direction == NavigationDirection::DependentToPrincipal
    }
}

/// Entity type: named set of properties, a primary key, and navigations.
#[derive(Clone, Debug)]
pub struct Entity {
    /// Model-wide identifier.
    pub id: EntityId,
    /// Entity name as declared.
    pub name: String,
    /// Declared scalar properties.
    pub properties: Vec<Property>,
    /// Ordered primary-key properties.
    pub primary_key: Vec<PropertyId>,
    /// Navigations declared on this entity.
    pub navigations: Vec<NavigationId>,
}

impl Entity {
    /// Looks up a declared property by name.
    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Looks up a declared property by identifier.
    pub fn property(&self, id: PropertyId) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }
}

/// Immutable domain model.
///
/// Lookup methods mirror the oracle surface the pipeline needs:
/// find-entity-by-name, find-property-by-name, find-navigation-by-name,
/// find-primary-key, find-foreign-key.
#[derive(Clone, Debug, Default)]
pub struct Model {
    entities: Vec<Entity>,
    navigations: Vec<Navigation>,
    foreign_keys: Vec<ForeignKey>,
    by_name: HashMap<String, EntityId>,
}

impl Model {
    /// Starts building a model.
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Returns the entity with the given identifier.
    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0 as usize]
    }

    /// Resolves an entity type by name.
    pub fn entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.by_name.get(name).map(|id| self.entity(*id))
    }

    /// Returns the navigation with the given identifier.
    pub fn navigation(&self, id: NavigationId) -> &Navigation {
        &self.navigations[id.0 as usize]
    }

    /// Resolves a navigation declared on `entity` by name.
    pub fn navigation_by_name(&self, entity: EntityId, name: &str) -> Option<&Navigation> {
        self.entity(entity)
            .navigations
            .iter()
            .map(|id| self.navigation(*id))
            .find(|n| n.name == name)
    }

    /// Returns the foreign key with the given identifier.
    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.foreign_keys[id.0 as usize]
    }

    /// Returns the ordered primary-key properties of `entity`.
    pub fn primary_key(&self, entity: EntityId) -> &[PropertyId] {
        &self.entity(entity).primary_key
    }

    /// Iterates all declared entities.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }
}

#[derive(Debug)]
struct EntitySpec {
    name: String,
    properties: Vec<(String, bool)>,
    primary_key: Vec<String>,
}

#[derive(Debug)]
struct RelationSpec {
    dependent: String,
    principal: String,
    fk_props: Vec<String>,
    principal_props: Option<Vec<String>>,
    required: bool,
    dependent_nav: Option<String>,
    principal_nav: Option<(String, bool)>,
}

/// Per-entity configuration scope used by [`ModelBuilder::entity`].
#[derive(Debug, Default)]
pub struct EntityBuilder {
    properties: Vec<(String, bool)>,
    primary_key: Vec<String>,
}

impl EntityBuilder {
    /// Declares a non-nullable scalar property.
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push((name.into(), false));
        self
    }

    /// Declares a nullable scalar property.
    pub fn nullable_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push((name.into(), true));
        self
    }

    /// Declares the ordered primary key by property names.
    pub fn primary_key<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = props.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-relationship configuration scope used by [`ModelBuilder::relation`].
#[derive(Debug)]
pub struct RelationBuilder {
    fk_props: Vec<String>,
    principal_props: Option<Vec<String>>,
    required: bool,
    dependent_nav: Option<String>,
    principal_nav: Option<(String, bool)>,
}

impl RelationBuilder {
    fn new() -> Self {
        Self {
            fk_props: Vec::new(),
            principal_props: None,
            required: true,
            dependent_nav: None,
            principal_nav: None,
        }
    }

    /// Sets the ordered foreign-key properties on the dependent entity.
    pub fn foreign_key<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fk_props = props.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the referenced principal properties (defaults to the
    /// principal's primary key).
    pub fn references<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principal_props = Some(props.into_iter().map(Into::into).collect());
        self
    }

    /// Marks the relationship optional (the foreign key may be null).
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Declares the single-valued navigation from dependent to principal.
    pub fn dependent_nav(mut self, name: impl Into<String>) -> Self {
        self.dependent_nav = Some(name.into());
        self
    }

    /// Declares the collection navigation from principal to dependents.
    pub fn principal_nav(mut self, name: impl Into<String>) -> Self {
        self.principal_nav = Some((name.into(), true));
        self
    }

    /// Declares a single-valued navigation from principal to dependent
    /// (one-to-one relationships).
    pub fn principal_nav_single(mut self, name: impl Into<String>) -> Self {
        self.principal_nav = Some((name.into(), false));
        self
    }
}

/// Fluent model construction with validation at [`ModelBuilder::build`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    entities: Vec<EntitySpec>,
    relations: Vec<RelationSpec>,
}

impl ModelBuilder {
    /// Declares an entity and configures it inside the closure.
    pub fn entity(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(EntityBuilder) -> EntityBuilder,
    ) -> Self {
        let spec = configure(EntityBuilder::default());
        self.entities.push(EntitySpec {
            name: name.into(),
            properties: spec.properties,
            primary_key: spec.primary_key,
        });
        self
    }

    /// Declares a relationship between `dependent` and `principal` and
    /// configures it inside the closure.
    pub fn relation(
        mut self,
        dependent: impl Into<String>,
        principal: impl Into<String>,
        configure: impl FnOnce(RelationBuilder) -> RelationBuilder,
    ) -> Self {
        let spec = configure(RelationBuilder::new());
        self.relations.push(RelationSpec {
            dependent: dependent.into(),
            principal: principal.into(),
            fk_props: spec.fk_props,
            principal_props: spec.principal_props,
            required: spec.required,
            dependent_nav: spec.dependent_nav,
            principal_nav: spec.principal_nav,
        });
        self
    }

    /// Validates and freezes the model.
    pub fn build(self) -> Result<Model> {
        let mut model = Model::default();
        let mut next_prop = 0u32;

        for (index, spec) in self.entities.iter().enumerate() {
            let id = EntityId(index as u32);
            if model.by_name.contains_key(&spec.name) {
                return Err(ReliqError::InvalidModel(format!(
                    "duplicate entity '{}'",
                    spec.name
                )));
            }
            let mut properties = Vec::with_capacity(spec.properties.len());
            for (name, nullable) in &spec.properties {
                properties.push(Property {
                    id: PropertyId(next_prop),
                    name: name.clone(),
                    nullable: *nullable,
                });
                next_prop += 1;
            }
            let mut primary_key = Vec::with_capacity(spec.primary_key.len());
            for key_name in &spec.primary_key {
                let prop = properties
                    .iter()
                    .find(|p| &p.name == key_name)
                    .ok_or_else(|| {
                        ReliqError::InvalidModel(format!(
                            "primary key property '{key_name}' not declared on '{}'",
                            spec.name
                        ))
                    })?;
                primary_key.push(prop.id);
            }
            if primary_key.is_empty() {
                return Err(ReliqError::InvalidModel(format!(
                    "entity '{}' has no primary key",
                    spec.name
                )));
            }
            model.by_name.insert(spec.name.clone(), id);
            model.entities.push(Entity {
                id,
                name: spec.name.clone(),
                properties,
                primary_key,
                navigations: Vec::new(),
            });
        }

        for spec in &self.relations {
            self::build_relation(&mut model, spec)?;
        }

        Ok(model)
    }
}

fn resolve_entity(model: &Model, name: &str) -> Result<EntityId> {
    model
        .entity_by_name(name)
        .map(|e| e.id)
        .ok_or_else(|| ReliqError::InvalidModel(format!("unknown entity '{name}'")))
}

fn resolve_props(model: &Model, entity: EntityId, names: &[String]) -> Result<Vec<PropertyId>> {
    names
        .iter()
        .map(|name| {
            model
                .entity(entity)
                .property_by_name(name)
                .map(|p| p.id)
                .ok_or_else(|| {
                    ReliqError::InvalidModel(format!(
                        "unknown property '{name}' on '{}'",
                        model.entity(entity).name
                    ))
                })
        })
        .collect()
}

fn build_relation(model: &mut Model, spec: &RelationSpec) -> Result<()> {
    let dependent = resolve_entity(model, &spec.dependent)?;
    let principal = resolve_entity(model, &spec.principal)?;

    let dependent_props = resolve_props(model, dependent, &spec.fk_props)?;
    let principal_props = match &spec.principal_props {
        Some(names) => resolve_props(model, principal, names)?,
        None => model.primary_key(principal).to_vec(),
    };
    if dependent_props.is_empty() {
        return Err(ReliqError::InvalidModel(format!(
            "relationship {} -> {} declares no foreign-key properties",
            spec.dependent, spec.principal
        )));
    }
    if dependent_props.len() != principal_props.len() {
        return Err(ReliqError::InvalidModel(format!(
            "foreign key {} -> {} has mismatched property counts ({} vs {})",
            spec.dependent,
            spec.principal,
            dependent_props.len(),
            principal_props.len()
        )));
    }

    let fk_id = ForeignKeyId(model.foreign_keys.len() as u32);
    model.foreign_keys.push(ForeignKey {
        id: fk_id,
        dependent,
        principal,
        dependent_props,
        principal_props,
        required: spec.required,
    });

    let dependent_nav_id = spec.dependent_nav.as_ref().map(|name| {
        let id = NavigationId(model.navigations.len() as u32);
        model.navigations.push(Navigation {
            id,
            name: name.clone(),
            declaring: dependent,
            target: principal,
            collection: false,
            direction: NavigationDirection::DependentToPrincipal,
            foreign_key: fk_id,
            inverse: None,
        });
        model.entities[dependent.0 as usize].navigations.push(id);
        id
    });

    let principal_nav_id = spec.principal_nav.as_ref().map(|(name, collection)| {
        let id = NavigationId(model.navigations.len() as u32);
        model.navigations.push(Navigation {
            id,
            name: name.clone(),
            declaring: principal,
            target: dependent,
            collection: *collection,
            direction: NavigationDirection::PrincipalToDependent,
            foreign_key: fk_id,
            inverse: None,
        });
        model.entities[principal.0 as usize].navigations.push(id);
        id
    });

    if let (Some(d), Some(p)) = (dependent_nav_id, principal_nav_id) {
        model.navigations[d.0 as usize].inverse = Some(p);
        model.navigations[p.0 as usize].inverse = Some(d);
    }

    for entity in &model.entities {
        let mut seen = HashMap::new();
        for nav_id in &entity.navigations {
            let nav = &model.navigations[nav_id.0 as usize];
            if let Some(previous) = seen.insert(nav.name.clone(), nav.id) {
                return Err(ReliqError::InvalidModel(format!(
                    "duplicate navigation '{}' on '{}' ({:?} and {:?})",
                    nav.name, entity.name, previous, nav.id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_model() -> Model {
        Model::builder()
            .entity("Customer", |e| {
                e.property("Id").property("Name").primary_key(["Id"])
            })
            .entity("Order", |e| {
                e.property("Id")
                    .nullable_property("CustomerId")
                    .primary_key(["Id"])
            })
            .relation("Order", "Customer", |r| {
                r.foreign_key(["CustomerId"])
                    .optional()
                    .dependent_nav("Customer")
                    .principal_nav("Orders")
            })
            .build()
            .expect("model builds")
    }

    #[test]
    fn resolves_entities_and_members() {
        let model = order_model();
        let order = model.entity_by_name("Order").expect("Order exists");
        assert!(order.property_by_name("CustomerId").is_some());
        let nav = model
            .navigation_by_name(order.id, "Customer")
            .expect("navigation exists");
        assert!(nav.is_dependent_to_principal());
        assert!(!nav.collection);
        let inverse = nav.inverse.expect("inverse declared");
        assert!(model.navigation(inverse).collection);
    }

    #[test]
    fn foreign_key_lists_align() {
        let model = order_model();
        let order = model.entity_by_name("Order").expect("Order exists");
        let nav = model
            .navigation_by_name(order.id, "Customer")
            .expect("navigation exists");
        let fk = model.foreign_key(nav.foreign_key);
        assert_eq!(fk.dependent_props.len(), fk.principal_props.len());
        assert!(!fk.required);
    }

    #[test]
    fn rejects_mismatched_foreign_key() {
        let err = Model::builder()
            .entity("A", |e| e.property("Id").property("X").primary_key(["Id"]))
            .entity("B", |e| e.property("K1").property("K2").primary_key(["K1", "K2"]))
            .relation("A", "B", |r| r.foreign_key(["X"]))
            .build()
            .expect_err("mismatched key lengths rejected");
        assert!(matches!(err, ReliqError::InvalidModel(_)));
    }

    #[test]
    fn rejects_unknown_primary_key_property() {
        let err = Model::builder()
            .entity("A", |e| e.property("Id").primary_key(["Missing"]))
            .build()
            .expect_err("unknown key property rejected");
        assert!(matches!(err, ReliqError::InvalidModel(_)));
    }
}
