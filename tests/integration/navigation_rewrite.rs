//! Navigation rewriting through the public compiler surface.

use reliq::model::Model;
use reliq::query::{BodyClause, CompileError, Expr, QueryCompiler, QueryModel};
use reliq::types::SourceIdGen;

fn model() -> Model {
    Model::builder()
        .entity("Customer", |e| {
            e.property("Id").property("Name").primary_key(["Id"])
        })
        .entity("Shipper", |e| {
            e.property("Id").property("Name").primary_key(["Id"])
        })
        .entity("Order", |e| {
            e.property("Id")
                .property("Total")
                .nullable_property("CustomerId")
                .property("ShipperId")
                .primary_key(["Id"])
        })
        .relation("Order", "Customer", |r| {
            r.foreign_key(["CustomerId"])
                .optional()
                .dependent_nav("Customer")
                .principal_nav("Orders")
        })
        .relation("Order", "Shipper", |r| {
            r.foreign_key(["ShipperId"]).dependent_nav("Shipper")
        })
        .build()
        .expect("model builds")
}

fn orders_query(model: &Model) -> (QueryModel, reliq::types::SourceId) {
    let orders = model.entity_by_name("Order").expect("Order").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    (QueryModel::from_entity(root, orders), root)
}

#[test]
fn required_reference_filter_compiles_to_inner_join() {
    let model = model();
    let (query, root) = orders_query(&model);
    let query = query.with_where(Expr::eq(
        Expr::property(Expr::property(Expr::Source(root), "Shipper"), "Name"),
        Expr::constant("Speedy"),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");

    let BodyClause::Join(join) = &compiled.query.body[0] else {
        panic!("unexpected clause {:?}", compiled.query.body[0]);
    };
    assert_eq!(
        join.outer_key,
        Expr::property(Expr::Source(root), "ShipperId")
    );
    assert_eq!(join.inner_key, Expr::property(Expr::Source(join.id), "Id"));
    let BodyClause::Where(Expr::Binary { left, .. }) = &compiled.query.body[1] else {
        panic!("unexpected clause {:?}", compiled.query.body[1]);
    };
    assert_eq!(**left, Expr::property(Expr::Source(join.id), "Name"));
}

#[test]
fn optional_reference_projects_through_outer_join() {
    let model = model();
    let (query, root) = orders_query(&model);
    let query = query.with_projection(Expr::property(
        Expr::property(Expr::Source(root), "Customer"),
        "Name",
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");

    let BodyClause::GroupJoin(group) = &compiled.query.body[0] else {
        panic!("unexpected clause {:?}", compiled.query.body[0]);
    };
    let BodyClause::Flatten(flatten) = &compiled.query.body[1] else {
        panic!("unexpected clause {:?}", compiled.query.body[1]);
    };
    assert_eq!(flatten.group, group.group_id);
    assert!(flatten.default_if_empty);
    assert_eq!(
        compiled.query.projection,
        Expr::null_conditional(
            Expr::Source(flatten.id),
            Expr::property(Expr::Source(flatten.id), "Name"),
        )
    );
}

#[test]
fn principal_key_read_uses_the_foreign_key_column() {
    let model = model();
    let (query, root) = orders_query(&model);
    let query = query.with_projection(Expr::property(
        Expr::property(Expr::Source(root), "Customer"),
        "Id",
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    assert!(compiled.query.body.is_empty(), "no join expected");
    assert_eq!(
        compiled.query.projection,
        Expr::property(Expr::Source(root), "CustomerId")
    );
}

#[test]
fn reference_null_test_needs_no_join() {
    let model = model();
    let (query, root) = orders_query(&model);
    let query = query.with_where(Expr::not_eq(
        Expr::property(Expr::Source(root), "Customer"),
        Expr::null(),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    assert_eq!(compiled.query.body.len(), 1);
    let BodyClause::Where(pred) = &compiled.query.body[0] else {
        panic!("unexpected clause {:?}", compiled.query.body[0]);
    };
    assert_eq!(
        *pred,
        Expr::not_eq(
            Expr::property(Expr::Source(root), "CustomerId"),
            Expr::null(),
        )
    );
}

#[test]
fn repeated_paths_share_one_join() {
    let model = model();
    let (query, root) = orders_query(&model);
    let shipper = |name: &str| {
        Expr::property(Expr::property(Expr::Source(root), "Shipper"), name)
    };
    let query = query.with_where(Expr::and(
        Expr::eq(shipper("Name"), Expr::constant("Speedy")),
        Expr::not_eq(shipper("Id"), Expr::constant(7i64)),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    let joins = compiled
        .query
        .body
        .iter()
        .filter(|c| matches!(c, BodyClause::Join(_)))
        .count();
    assert_eq!(joins, 1);
}

#[test]
fn collection_in_the_middle_of_a_path_is_rejected() {
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::property(
        Expr::property(Expr::Source(root), "Orders"),
        "Total",
    ));

    let err = QueryCompiler::new(&model)
        .compile(query)
        .expect_err("collection traversal rejected");
    assert_eq!(err.code(), "CollectionTraversal");
    assert!(matches!(
        err,
        CompileError::CollectionTraversal { entity, navigation }
            if entity == "Customer" && navigation == "Orders"
    ));
}
