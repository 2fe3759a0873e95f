//! Query model: the tree representation of one query or subquery.
//!
//! A [`QueryModel`] is a source clause, an ordered list of body clauses
//! (filters, joins, orderings), a projection, and an ordered list of
//! result operators. Result-operator semantics are positional: operators
//! compose left to right.
//!
//! Cloning a model for a pass that must hold the original and the copy
//! live simultaneously goes through [`QueryModel::clone_remapped`], which
//! allocates fresh source ids for every clause declared inside the tree
//! and rewrites all internal references consistently. References to outer
//! sources survive untouched.

use std::collections::{HashMap, HashSet};

use xxhash_rust::xxh64::Xxh64;

use crate::query::expr::Expr;
use crate::query::value::{CapturedValue, Value};
use crate::types::{EntityId, NavigationId, SourceId, SourceIdGen};

/// Sort direction of one ordering key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortDirection {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

impl SortDirection {
    /// Returns the opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

/// One ordering key.
#[derive(Clone, Debug, PartialEq)]
pub struct Ordering {
    /// Key expression.
    pub expr: Expr,
    /// Sort direction.
    pub direction: SortDirection,
}

impl Ordering {
    /// Ascending ordering on `expr`.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Ascending,
        }
    }

    /// Descending ordering on `expr`.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Descending,
        }
    }
}

/// What a source clause draws its rows from.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceOrigin {
    /// The full set of one entity type.
    EntitySet(EntityId),
    /// A nested query model.
    Query(Box<QueryModel>),
}

/// The main source clause of a query model.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceClause {
    /// Id bound by this clause.
    pub id: SourceId,
    /// Row origin.
    pub origin: SourceOrigin,
}

/// Relational join introduced by rewriting or written explicitly.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinClause {
    /// Id bound to the joined rows.
    pub id: SourceId,
    /// Inner row origin.
    pub inner: SourceOrigin,
    /// Key computed over the outer scope.
    pub outer_key: Expr,
    /// Key computed over the inner rows.
    pub inner_key: Expr,
}

/// Join variant producing, per outer row, the full set of matching inner
/// rows. Flattening the group with default-if-empty models an outer join.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupJoinClause {
    /// Id bound to the per-row group.
    pub group_id: SourceId,
    /// The underlying join.
    pub join: JoinClause,
}

/// Enumerates a previously bound group, one row per element.
#[derive(Clone, Debug, PartialEq)]
pub struct FlattenClause {
    /// Id bound to each element of the group.
    pub id: SourceId,
    /// The group being enumerated.
    pub group: SourceId,
    /// Whether an empty group still yields one default (null) row.
    pub default_if_empty: bool,
}

/// Ordered, order-significant clause between source and projection.
#[derive(Clone, Debug, PartialEq)]
pub enum BodyClause {
    /// Filter predicate.
    Where(Expr),
    /// Inner join.
    Join(JoinClause),
    /// Group join.
    GroupJoin(GroupJoinClause),
    /// Group flattening.
    Flatten(FlattenClause),
    /// Ordering keys (applied in sequence).
    OrderBy(Vec<Ordering>),
}

/// Tagged post-processing step applied to the query's result sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultOperator {
    /// Keep at most the given number of rows.
    Take(Expr),
    /// Drop the given number of leading rows.
    Skip(Expr),
    /// First row; `return_default` yields null instead of failing when empty.
    First {
        /// Yield a default instead of failing on an empty sequence.
        return_default: bool,
    },
    /// The only row; fails on more than one.
    Single {
        /// Yield a default instead of failing on an empty sequence.
        return_default: bool,
    },
    /// Last row.
    Last {
        /// Yield a default instead of failing on an empty sequence.
        return_default: bool,
    },
    /// Whether any row exists.
    Any,
    /// Whether the predicate holds for every row.
    All(Expr),
    /// Whether the sequence contains the item.
    Contains(Expr),
    /// Number of rows.
    Count,
    /// Remove duplicate rows.
    Distinct,
    /// Append another query's rows.
    Concat(Box<QueryModel>),
    /// Set union with another query.
    Union(Box<QueryModel>),
    /// Set intersection with another query.
    Intersect(Box<QueryModel>),
    /// Set difference with another query.
    Except(Box<QueryModel>),
    /// Group rows by key.
    GroupBy {
        /// Grouping key selector.
        key: Expr,
        /// Element selector applied within each group.
        element: Expr,
    },
}

impl ResultOperator {
    /// Returns true for operators that only reorder or bound the window
    /// (the shapes a correlated collection may retain).
    pub fn is_paging(&self) -> bool {
        matches!(
            self,
            ResultOperator::Take(_)
                | ResultOperator::Skip(_)
                | ResultOperator::First { .. }
                | ResultOperator::Single { .. }
                | ResultOperator::Last { .. }
        )
    }

    /// Returns true for the trailing choice operators.
    pub fn is_choice(&self) -> bool {
        matches!(
            self,
            ResultOperator::First { .. }
                | ResultOperator::Single { .. }
                | ResultOperator::Last { .. }
        )
    }
}

/// One query or subquery.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryModel {
    /// Main source clause.
    pub source: SourceClause,
    /// Ordered body clauses.
    pub body: Vec<BodyClause>,
    /// Terminal projection, closed over the sources in scope.
    pub projection: Expr,
    /// Ordered result operators.
    pub operators: Vec<ResultOperator>,
    /// Navigation this subquery was expanded from, when it was produced by
    /// the collection navigation rewriter. Consumed by the correlated
    /// collection extractor; `None` for user-written queries.
    pub origin_navigation: Option<NavigationId>,
}

impl QueryModel {
    /// Creates a query over the full set of `entity`, projecting the rows.
    pub fn from_entity(id: SourceId, entity: EntityId) -> Self {
        Self {
            source: SourceClause {
                id,
                origin: SourceOrigin::EntitySet(entity),
            },
            body: Vec::new(),
            projection: Expr::Source(id),
            operators: Vec::new(),
            origin_navigation: None,
        }
    }

    /// Creates a query over a nested query model.
    pub fn from_query(id: SourceId, inner: QueryModel) -> Self {
        Self {
            source: SourceClause {
                id,
                origin: SourceOrigin::Query(Box::new(inner)),
            },
            body: Vec::new(),
            projection: Expr::Source(id),
            operators: Vec::new(),
            origin_navigation: None,
        }
    }

    /// Appends a filter clause.
    pub fn with_where(mut self, predicate: Expr) -> Self {
        self.body.push(BodyClause::Where(predicate));
        self
    }

    /// Appends an ordering clause.
    pub fn with_order_by(mut self, orderings: Vec<Ordering>) -> Self {
        self.body.push(BodyClause::OrderBy(orderings));
        self
    }

    /// Sets the projection.
    pub fn with_projection(mut self, projection: Expr) -> Self {
        self.projection = projection;
        self
    }

    /// Appends a result operator.
    pub fn with_operator(mut self, operator: ResultOperator) -> Self {
        self.operators.push(operator);
        self
    }

    /// Collects every source id declared anywhere inside this tree,
    /// including nested query models in expression position.
    pub fn declared_sources(&self) -> HashSet<SourceId> {
        let mut out = HashSet::new();
        collect_query(self, &mut out);
        out
    }

    /// Produces a structurally independent copy with fresh source ids and
    /// the old-id to new-id map. Internal references are rewritten through
    /// the map; references to outer sources are left unchanged.
    pub fn clone_remapped(
        &self,
        ids: &mut SourceIdGen,
    ) -> (QueryModel, HashMap<SourceId, SourceId>) {
        let declared = self.declared_sources();
        let mut map = HashMap::with_capacity(declared.len());
        let mut ordered: Vec<SourceId> = declared.into_iter().collect();
        ordered.sort_unstable();
        for old in ordered {
            map.insert(old, ids.fresh());
        }
        (remap_query(self, &map), map)
    }

    /// Deterministic structural hash of the tree shape.
    ///
    /// Captured external values contribute their label only, so the hash is
    /// stable across compilations that differ only in captured payloads;
    /// this is the pre-parameter-extraction cache key.
    pub fn shape_hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        hash_query(self, &mut hasher);
        hasher.digest()
    }
}

fn collect_query(query: &QueryModel, out: &mut HashSet<SourceId>) {
    out.insert(query.source.id);
    if let SourceOrigin::Query(inner) = &query.source.origin {
        collect_query(inner, out);
    }
    for clause in &query.body {
        match clause {
            BodyClause::Where(expr) => collect_expr(expr, out),
            BodyClause::Join(join) => collect_join(join, out),
            BodyClause::GroupJoin(group) => {
                out.insert(group.group_id);
                collect_join(&group.join, out);
            }
            BodyClause::Flatten(flatten) => {
                out.insert(flatten.id);
            }
            BodyClause::OrderBy(orderings) => {
                for ordering in orderings {
                    collect_expr(&ordering.expr, out);
                }
            }
        }
    }
    collect_expr(&query.projection, out);
    for op in &query.operators {
        match op {
            ResultOperator::Take(expr)
            | ResultOperator::Skip(expr)
            | ResultOperator::All(expr)
            | ResultOperator::Contains(expr) => collect_expr(expr, out),
            ResultOperator::Concat(other)
            | ResultOperator::Union(other)
            | ResultOperator::Intersect(other)
            | ResultOperator::Except(other) => collect_query(other, out),
            ResultOperator::GroupBy { key, element } => {
                collect_expr(key, out);
                collect_expr(element, out);
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

fn collect_join(join: &JoinClause, out: &mut HashSet<SourceId>) {
    out.insert(join.id);
    if let SourceOrigin::Query(inner) = &join.inner {
        collect_query(inner, out);
    }
    collect_expr(&join.outer_key, out);
    collect_expr(&join.inner_key, out);
}

fn collect_expr(expr: &Expr, out: &mut HashSet<SourceId>) {
    match expr {
        Expr::Constant(_) | Expr::Parameter(_) | Expr::Source(_) | Expr::SharedRef(_) => {}
        Expr::External(external) => {
            if let CapturedValue::Queryable(query) = &external.value {
                collect_query(query, out);
            }
        }
        Expr::Property { object, .. }
        | Expr::NamedProperty { object, .. }
        | Expr::Downcast { object, .. } => collect_expr(object, out),
        Expr::Unary { operand, .. } => collect_expr(operand, out),
        Expr::Binary { left, right, .. }
        | Expr::Coalesce { left, right }
        | Expr::ReferenceEqual { left, right } => {
            collect_expr(left, out);
            collect_expr(right, out);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            collect_expr(test, out);
            collect_expr(if_true, out);
            collect_expr(if_false, out);
        }
        Expr::NullConditional { guard, access } => {
            collect_expr(guard, out);
            collect_expr(access, out);
        }
        Expr::KeyTuple(items) => {
            for item in items {
                collect_expr(item, out);
            }
        }
        Expr::ArrayLength(operand) => collect_expr(operand, out),
        Expr::Subquery(query) => collect_query(query, out),
        Expr::Materialize { source, .. } => collect_expr(source, out),
        Expr::CorrelatedCollection { .. } => {}
        Expr::Shared { expr, .. } => collect_expr(expr, out),
    }
}

fn mapped(id: SourceId, map: &HashMap<SourceId, SourceId>) -> SourceId {
    map.get(&id).copied().unwrap_or(id)
}

fn remap_query(query: &QueryModel, map: &HashMap<SourceId, SourceId>) -> QueryModel {
    QueryModel {
        source: SourceClause {
            id: mapped(query.source.id, map),
            origin: remap_origin(&query.source.origin, map),
        },
        body: query
            .body
            .iter()
            .map(|clause| match clause {
                BodyClause::Where(expr) => BodyClause::Where(remap_expr(expr, map)),
                BodyClause::Join(join) => BodyClause::Join(remap_join(join, map)),
                BodyClause::GroupJoin(group) => BodyClause::GroupJoin(GroupJoinClause {
                    group_id: mapped(group.group_id, map),
                    join: remap_join(&group.join, map),
                }),
                BodyClause::Flatten(flatten) => BodyClause::Flatten(FlattenClause {
                    id: mapped(flatten.id, map),
                    group: mapped(flatten.group, map),
                    default_if_empty: flatten.default_if_empty,
                }),
                BodyClause::OrderBy(orderings) => BodyClause::OrderBy(
                    orderings
                        .iter()
                        .map(|o| Ordering {
                            expr: remap_expr(&o.expr, map),
                            direction: o.direction,
                        })
                        .collect(),
                ),
            })
            .collect(),
        projection: remap_expr(&query.projection, map),
        operators: query
            .operators
            .iter()
            .map(|op| match op {
                ResultOperator::Take(expr) => ResultOperator::Take(remap_expr(expr, map)),
                ResultOperator::Skip(expr) => ResultOperator::Skip(remap_expr(expr, map)),
                ResultOperator::All(expr) => ResultOperator::All(remap_expr(expr, map)),
                ResultOperator::Contains(expr) => ResultOperator::Contains(remap_expr(expr, map)),
                ResultOperator::Concat(other) => {
                    ResultOperator::Concat(Box::new(remap_query(other, map)))
                }
                ResultOperator::Union(other) => {
                    ResultOperator::Union(Box::new(remap_query(other, map)))
                }
                ResultOperator::Intersect(other) => {
                    ResultOperator::Intersect(Box::new(remap_query(other, map)))
                }
                ResultOperator::Except(other) => {
                    ResultOperator::Except(Box::new(remap_query(other, map)))
                }
                ResultOperator::GroupBy { key, element } => ResultOperator::GroupBy {
                    key: remap_expr(key, map),
                    element: remap_expr(element, map),
                },
                ResultOperator::First { return_default } => ResultOperator::First {
                    return_default: *return_default,
                },
                ResultOperator::Single { return_default } => ResultOperator::Single {
                    return_default: *return_default,
                },
                ResultOperator::Last { return_default } => ResultOperator::Last {
                    return_default: *return_default,
                },
                ResultOperator::Any => ResultOperator::Any,
                ResultOperator::Count => ResultOperator::Count,
                ResultOperator::Distinct => ResultOperator::Distinct,
            })
            .collect(),
        origin_navigation: query.origin_navigation,
    }
}

fn remap_origin(origin: &SourceOrigin, map: &HashMap<SourceId, SourceId>) -> SourceOrigin {
    match origin {
        SourceOrigin::EntitySet(entity) => SourceOrigin::EntitySet(*entity),
        SourceOrigin::Query(inner) => SourceOrigin::Query(Box::new(remap_query(inner, map))),
    }
}

fn remap_join(join: &JoinClause, map: &HashMap<SourceId, SourceId>) -> JoinClause {
    JoinClause {
        id: mapped(join.id, map),
        inner: remap_origin(&join.inner, map),
        outer_key: remap_expr(&join.outer_key, map),
        inner_key: remap_expr(&join.inner_key, map),
    }
}

fn remap_expr(expr: &Expr, map: &HashMap<SourceId, SourceId>) -> Expr {
    match expr {
        Expr::Constant(value) => Expr::Constant(value.clone()),
        Expr::External(external) => Expr::External(match &external.value {
            CapturedValue::Queryable(query) => crate::query::value::ExternalValue {
                label: external.label.clone(),
                value: CapturedValue::Queryable(Box::new(remap_query(query, map))),
            },
            _ => external.clone(),
        }),
        Expr::Parameter(name) => Expr::Parameter(name.clone()),
        Expr::Source(id) => Expr::Source(mapped(*id, map)),
        Expr::Property { object, name } => Expr::Property {
            object: Box::new(remap_expr(object, map)),
            name: name.clone(),
        },
        Expr::NamedProperty { object, name } => Expr::NamedProperty {
            object: Box::new(remap_expr(object, map)),
            name: name.clone(),
        },
        Expr::Downcast { object, entity } => Expr::Downcast {
            object: Box::new(remap_expr(object, map)),
            entity: entity.clone(),
        },
        Expr::Unary { op, operand } => Expr::Unary {
            op: *op,
            operand: Box::new(remap_expr(operand, map)),
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(remap_expr(left, map)),
            right: Box::new(remap_expr(right, map)),
        },
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => Expr::Conditional {
            test: Box::new(remap_expr(test, map)),
            if_true: Box::new(remap_expr(if_true, map)),
            if_false: Box::new(remap_expr(if_false, map)),
        },
        Expr::Coalesce { left, right } => Expr::Coalesce {
            left: Box::new(remap_expr(left, map)),
            right: Box::new(remap_expr(right, map)),
        },
        Expr::NullConditional { guard, access } => Expr::NullConditional {
            guard: Box::new(remap_expr(guard, map)),
            access: Box::new(remap_expr(access, map)),
        },
        Expr::KeyTuple(items) => {
            Expr::KeyTuple(items.iter().map(|item| remap_expr(item, map)).collect())
        }
        Expr::ArrayLength(operand) => Expr::ArrayLength(Box::new(remap_expr(operand, map))),
        Expr::Subquery(query) => Expr::Subquery(Box::new(remap_query(query, map))),
        Expr::Materialize { kind, source } => Expr::Materialize {
            kind: *kind,
            source: Box::new(remap_expr(source, map)),
        },
        Expr::CorrelatedCollection { index, kind } => Expr::CorrelatedCollection {
            index: *index,
            kind: *kind,
        },
        Expr::ReferenceEqual { left, right } => Expr::ReferenceEqual {
            left: Box::new(remap_expr(left, map)),
            right: Box::new(remap_expr(right, map)),
        },
        Expr::Shared { slot, expr } => Expr::Shared {
            slot: *slot,
            expr: Box::new(remap_expr(expr, map)),
        },
        Expr::SharedRef(slot) => Expr::SharedRef(*slot),
    }
}

fn write_str(hasher: &mut Xxh64, s: &str) {
    hasher.update(&(s.len() as u32).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn write_tag(hasher: &mut Xxh64, tag: u8) {
    hasher.update(&[tag]);
}

fn hash_query(query: &QueryModel, hasher: &mut Xxh64) {
    write_tag(hasher, 0x51);
    hasher.update(&query.source.id.0.to_le_bytes());
    match &query.source.origin {
        SourceOrigin::EntitySet(entity) => {
            write_tag(hasher, 1);
            hasher.update(&entity.0.to_le_bytes());
        }
        SourceOrigin::Query(inner) => {
            write_tag(hasher, 2);
            hash_query(inner, hasher);
        }
    }
    for clause in &query.body {
        match clause {
            BodyClause::Where(expr) => {
                write_tag(hasher, 10);
                hash_expr(expr, hasher);
            }
            BodyClause::Join(join) => {
                write_tag(hasher, 11);
                hash_join(join, hasher);
            }
            BodyClause::GroupJoin(group) => {
                write_tag(hasher, 12);
                hasher.update(&group.group_id.0.to_le_bytes());
                hash_join(&group.join, hasher);
            }
            BodyClause::Flatten(flatten) => {
                write_tag(hasher, 13);
                hasher.update(&flatten.id.0.to_le_bytes());
                hasher.update(&flatten.group.0.to_le_bytes());
                write_tag(hasher, flatten.default_if_empty as u8);
            }
            BodyClause::OrderBy(orderings) => {
                write_tag(hasher, 14);
                for ordering in orderings {
                    write_tag(
                        hasher,
                        matches!(ordering.direction, SortDirection::Descending) as u8,
                    );
                    hash_expr(&ordering.expr, hasher);
                }
            }
        }
    }
    write_tag(hasher, 0x50);
    hash_expr(&query.projection, hasher);
    for op in &query.operators {
        match op {
            ResultOperator::Take(expr) => {
                write_tag(hasher, 20);
                hash_expr(expr, hasher);
            }
            ResultOperator::Skip(expr) => {
                write_tag(hasher, 21);
                hash_expr(expr, hasher);
            }
            ResultOperator::First { return_default } => {
                write_tag(hasher, 22);
                write_tag(hasher, *return_default as u8);
            }
            ResultOperator::Single { return_default } => {
                write_tag(hasher, 23);
                write_tag(hasher, *return_default as u8);
            }
            ResultOperator::Last { return_default } => {
                write_tag(hasher, 24);
                write_tag(hasher, *return_default as u8);
            }
            ResultOperator::Any => write_tag(hasher, 25),
            ResultOperator::All(expr) => {
                write_tag(hasher, 26);
                hash_expr(expr, hasher);
            }
            ResultOperator::Contains(expr) => {
                write_tag(hasher, 27);
                hash_expr(expr, hasher);
            }
            ResultOperator::Count => write_tag(hasher, 28),
            ResultOperator::Distinct => write_tag(hasher, 29),
            ResultOperator::Concat(other) => {
                write_tag(hasher, 30);
                hash_query(other, hasher);
            }
            ResultOperator::Union(other) => {
                write_tag(hasher, 31);
                hash_query(other, hasher);
            }
            ResultOperator::Intersect(other) => {
                write_tag(hasher, 32);
                hash_query(other, hasher);
            }
            ResultOperator::Except(other) => {
                write_tag(hasher, 33);
                hash_query(other, hasher);
            }
            ResultOperator::GroupBy { key, element } => {
                write_tag(hasher, 34);
                hash_expr(key, hasher);
                hash_expr(element, hasher);
            }
        }
    }
}

fn hash_join(join: &JoinClause, hasher: &mut Xxh64) {
    hasher.update(&join.id.0.to_le_bytes());
    match &join.inner {
        SourceOrigin::EntitySet(entity) => {
            write_tag(hasher, 1);
            hasher.update(&entity.0.to_le_bytes());
        }
        SourceOrigin::Query(inner) => {
            write_tag(hasher, 2);
            hash_query(inner, hasher);
        }
    }
    hash_expr(&join.outer_key, hasher);
    hash_expr(&join.inner_key, hasher);
}

fn hash_value(value: &Value, hasher: &mut Xxh64) {
    match value {
        Value::Null => write_tag(hasher, 0),
        Value::Bool(b) => {
            write_tag(hasher, 1);
            write_tag(hasher, *b as u8);
        }
        Value::Int(i) => {
            write_tag(hasher, 2);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            write_tag(hasher, 3);
            hasher.update(&f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            write_tag(hasher, 4);
            write_str(hasher, s);
        }
        Value::Bytes(b) => {
            write_tag(hasher, 5);
            hasher.update(&(b.len() as u32).to_le_bytes());
            hasher.update(b);
        }
    }
}

fn hash_expr(expr: &Expr, hasher: &mut Xxh64) {
    match expr {
        Expr::Constant(value) => {
            write_tag(hasher, 40);
            hash_value(value, hasher);
        }
        Expr::External(external) => {
            // Captured payloads do not participate in the shape hash.
            write_tag(hasher, 41);
            write_str(hasher, &external.label);
        }
        Expr::Parameter(name) => {
            write_tag(hasher, 42);
            write_str(hasher, name);
        }
        Expr::Source(id) => {
            write_tag(hasher, 43);
            hasher.update(&id.0.to_le_bytes());
        }
        Expr::Property { object, name } => {
            write_tag(hasher, 44);
            hash_expr(object, hasher);
            write_str(hasher, name);
        }
        Expr::NamedProperty { object, name } => {
            write_tag(hasher, 45);
            hash_expr(object, hasher);
            write_str(hasher, name);
        }
        Expr::Downcast { object, entity } => {
            write_tag(hasher, 46);
            hash_expr(object, hasher);
            write_str(hasher, entity);
        }
        Expr::Unary { op, operand } => {
            write_tag(hasher, 47);
            write_tag(hasher, *op as u8);
            hash_expr(operand, hasher);
        }
        Expr::Binary { op, left, right } => {
            write_tag(hasher, 48);
            write_tag(hasher, *op as u8);
            hash_expr(left, hasher);
            hash_expr(right, hasher);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            write_tag(hasher, 49);
            hash_expr(test, hasher);
            hash_expr(if_true, hasher);
            hash_expr(if_false, hasher);
        }
        Expr::Coalesce { left, right } => {
            write_tag(hasher, 50);
            hash_expr(left, hasher);
            hash_expr(right, hasher);
        }
        Expr::NullConditional { guard, access } => {
            write_tag(hasher, 51);
            hash_expr(guard, hasher);
            hash_expr(access, hasher);
        }
        Expr::KeyTuple(items) => {
            write_tag(hasher, 52);
            hasher.update(&(items.len() as u32).to_le_bytes());
            for item in items {
                hash_expr(item, hasher);
            }
        }
        Expr::ArrayLength(operand) => {
            write_tag(hasher, 53);
            hash_expr(operand, hasher);
        }
        Expr::Subquery(query) => {
            write_tag(hasher, 54);
            hash_query(query, hasher);
        }
        Expr::Materialize { kind, source } => {
            write_tag(hasher, 55);
            write_tag(hasher, *kind as u8);
            hash_expr(source, hasher);
        }
        Expr::CorrelatedCollection { index, kind } => {
            write_tag(hasher, 56);
            hasher.update(&(*index as u32).to_le_bytes());
            write_tag(hasher, *kind as u8);
        }
        Expr::ReferenceEqual { left, right } => {
            write_tag(hasher, 57);
            hash_expr(left, hasher);
            hash_expr(right, hasher);
        }
        Expr::Shared { slot, expr } => {
            write_tag(hasher, 58);
            hasher.update(&(*slot as u32).to_le_bytes());
            hash_expr(expr, hasher);
        }
        Expr::SharedRef(slot) => {
            write_tag(hasher, 59);
            hasher.update(&(*slot as u32).to_le_bytes());
        }
    }
}
