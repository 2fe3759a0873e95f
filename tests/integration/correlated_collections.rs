//! Correlated collection batching through the public compiler surface.

use reliq::model::Model;
use reliq::query::{
    BodyClause, CollectionKind, Expr, ExternalValue, Ordering, ParameterValue, QueryCompiler,
    QueryModel, ResultOperator, SortDirection, SourceOrigin, Value,
};
use reliq::types::{SourceId, SourceIdGen};

fn model() -> Model {
    Model::builder()
        .entity("Customer", |e| {
            e.property("Id").property("Name").primary_key(["Id"])
        })
        .entity("Order", |e| {
            e.property("Id")
                .property("Date")
                .property("CustomerId")
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

/// Hand-built equivalent of what the collection rewriter emits for
/// `customer.Orders`: a filtered subquery stamped with the navigation.
fn orders_of(model: &Model, ids: &mut SourceIdGen, owner: SourceId) -> QueryModel {
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let orders = model.entity_by_name("Order").expect("Order").id;
    let nav = model
        .navigation_by_name(customers, "Orders")
        .expect("Orders nav");
    let child = ids.fresh();
    let mut query = QueryModel::from_entity(child, orders).with_where(Expr::eq(
        Expr::property(Expr::Source(child), "CustomerId"),
        Expr::property(Expr::Source(owner), "Id"),
    ));
    query.origin_navigation = Some(nav.id);
    query
}

#[test]
fn projected_collection_is_batched() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let query = QueryModel::from_entity(root, customers)
        .with_projection(Expr::property(Expr::Source(root), "Orders"));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");

    assert_eq!(
        compiled.query.projection,
        Expr::CorrelatedCollection {
            index: 0,
            kind: CollectionKind::List,
        }
    );
    assert_eq!(compiled.correlations.len(), 1);
    let reg = &compiled.correlations[0];
    assert_eq!(reg.parent_source, root);
    assert_eq!(reg.parent_key, Expr::property(Expr::Source(root), "Id"));
    assert!(reg.window.is_empty());
    assert!(reg.tracking);

    // Batched: the owner rows as source (the bare cloned parent collapses
    // to its entity set), child joined on the foreign key, ordered parent
    // primary key first then the correlation key.
    assert!(matches!(reg.query.source.origin, SourceOrigin::EntitySet(_)));
    let BodyClause::Join(join) = &reg.query.body[0] else {
        panic!("unexpected clause {:?}", reg.query.body[0]);
    };
    assert_eq!(
        join.outer_key,
        Expr::property(Expr::Source(reg.query.source.id), "Id")
    );
    assert_eq!(
        join.inner_key,
        Expr::property(Expr::Source(join.id), "CustomerId")
    );
    let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
        panic!("unexpected clause {:?}", reg.query.body[1]);
    };
    assert_eq!(
        orderings[0].expr,
        Expr::property(Expr::Source(reg.query.source.id), "Id")
    );
    assert_eq!(
        orderings[1].expr,
        Expr::property(Expr::Source(join.id), "CustomerId")
    );
    assert_eq!(
        reg.query.projection,
        Expr::KeyTuple(vec![
            Expr::property(Expr::Source(reg.query.source.id), "Id"),
            Expr::Source(join.id),
        ])
    );
}

#[test]
fn ordering_and_take_become_a_per_parent_window() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let child = orders_of(&model, &mut ids, root);
    let child_src = child.source.id;
    let child = child
        .with_order_by(vec![Ordering::desc(Expr::property(
            Expr::Source(child_src),
            "Date",
        ))])
        .with_operator(ResultOperator::Take(Expr::constant(2i64)));
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::materialize(
        CollectionKind::Array,
        Expr::subquery(child),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");

    let reg = &compiled.correlations[0];
    assert_eq!(reg.kind, CollectionKind::Array);
    assert_eq!(reg.window, vec![ResultOperator::Take(Expr::constant(2i64))]);
    let BodyClause::Join(join) = &reg.query.body[0] else {
        panic!("unexpected clause {:?}", reg.query.body[0]);
    };
    let SourceOrigin::Query(inner) = &join.inner else {
        panic!("unexpected join inner {:?}", join.inner);
    };
    assert!(inner.body.is_empty(), "correlation predicate removed");
    assert!(inner.operators.is_empty(), "window moved to registration");
    let BodyClause::OrderBy(orderings) = &reg.query.body[1] else {
        panic!("unexpected clause {:?}", reg.query.body[1]);
    };
    // Parent key, correlation key, then the explicit child ordering.
    assert_eq!(orderings.len(), 3);
    assert_eq!(
        orderings[2].expr,
        Expr::property(Expr::Source(join.id), "Date")
    );
    assert_eq!(orderings[2].direction, SortDirection::Descending);
}

#[test]
fn first_becomes_a_single_row_window() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let child = orders_of(&model, &mut ids, root).with_operator(ResultOperator::First {
        return_default: true,
    });
    let query =
        QueryModel::from_entity(root, customers).with_projection(Expr::subquery(child));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    let reg = &compiled.correlations[0];
    assert_eq!(reg.window, vec![ResultOperator::Take(Expr::constant(1i64))]);
}

#[test]
fn escaping_subquery_keeps_streaming() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let child = orders_of(&model, &mut ids, root);
    let child_src = child.source.id;
    // A second predicate reaching the parent row disqualifies the lift.
    let child = child.with_where(Expr::eq(
        Expr::property(Expr::Source(child_src), "Date"),
        Expr::property(Expr::Source(root), "Name"),
    ));
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::materialize(
        CollectionKind::List,
        Expr::subquery(child),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    assert!(compiled.correlations.is_empty());
    assert!(matches!(
        compiled.query.projection,
        Expr::Materialize { .. }
    ));
}

#[test]
fn shape_hash_sees_the_collection_window() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let compile = |take: i64| {
        let mut ids = SourceIdGen::new();
        let root = ids.fresh();
        let child = orders_of(&model, &mut ids, root)
            .with_operator(ResultOperator::Take(Expr::constant(take)));
        let query = QueryModel::from_entity(root, customers)
            .with_projection(Expr::subquery(child));
        QueryCompiler::new(&model).compile(query).expect("compiles")
    };

    let two = compile(2);
    let three = compile(3);
    assert_eq!(
        two.correlations[0].window,
        vec![ResultOperator::Take(Expr::constant(2i64))]
    );
    assert_ne!(two.shape_hash, three.shape_hash);
    assert_eq!(compile(2).shape_hash, two.shape_hash);
}

#[test]
fn captured_window_bound_becomes_a_parameter() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let child = orders_of(&model, &mut ids, root).with_operator(ResultOperator::Take(
        Expr::External(ExternalValue::scalar("top", 2i64)),
    ));
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::subquery(child));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    let reg = &compiled.correlations[0];
    assert_eq!(
        reg.window,
        vec![ResultOperator::Take(Expr::Parameter("__top_0".to_owned()))]
    );
    assert_eq!(
        compiled.parameters.get("__top_0"),
        Some(&ParameterValue::Scalar(Value::Int(2)))
    );
}

#[test]
fn non_paging_operator_keeps_streaming() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let child = orders_of(&model, &mut ids, root).with_operator(ResultOperator::Distinct);
    let query =
        QueryModel::from_entity(root, customers).with_projection(Expr::subquery(child));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    assert!(compiled.correlations.is_empty());
    assert!(matches!(compiled.query.projection, Expr::Subquery(_)));
}
