//! Full pipeline runs: every pass composed over one query.

use reliq::model::Model;
use reliq::query::{
    BodyClause, Expr, ExternalValue, ParameterValue, QueryCompiler, QueryModel, ResultOperator,
    Value,
};
use reliq::types::SourceIdGen;

/// Routes pass-level tracing through the test harness; `RUST_LOG` selects
/// what is shown. Safe to call from every test, first caller wins.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn model() -> Model {
    Model::builder()
        .entity("Customer", |e| {
            e.property("Id").property("Name").primary_key(["Id"])
        })
        .entity("Order", |e| {
            e.property("Id")
                .property("Total")
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

fn filter_by_customer_name(model: &Model, name: &str, total: i64) -> QueryModel {
    let orders = model.entity_by_name("Order").expect("Order").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    QueryModel::from_entity(root, orders).with_where(Expr::and(
        Expr::eq(
            Expr::property(Expr::property(Expr::Source(root), "Customer"), "Name"),
            Expr::External(ExternalValue::scalar("name", name)),
        ),
        Expr::binary(
            reliq::query::BinaryOp::Gt,
            Expr::property(Expr::Source(root), "Total"),
            Expr::External(ExternalValue::scalar("total", total)),
        ),
    ))
}

#[test]
fn navigation_filter_with_captures_compiles() {
    init_tracing();
    let model = model();
    let compiled = QueryCompiler::new(&model)
        .compile(filter_by_customer_name(&model, "acme", 10))
        .expect("compiles");

    assert!(matches!(compiled.query.body[0], BodyClause::GroupJoin(_)));
    assert!(matches!(compiled.query.body[1], BodyClause::Flatten(_)));
    assert!(matches!(compiled.query.body[2], BodyClause::Where(_)));
    assert_eq!(compiled.parameters.len(), 2);
    assert_eq!(
        compiled.parameters.get("__name_0"),
        Some(&ParameterValue::Scalar(Value::String("acme".into())))
    );
    assert_eq!(
        compiled.parameters.get("__total_1"),
        Some(&ParameterValue::Scalar(Value::Int(10)))
    );
    assert!(compiled.diagnostics.is_empty());
    assert!(compiled.correlations.is_empty());
}

#[test]
fn shape_hash_ignores_captured_payloads_but_not_shape() {
    init_tracing();
    let model = model();
    let a = QueryCompiler::new(&model)
        .compile(filter_by_customer_name(&model, "acme", 10))
        .expect("compiles");
    let b = QueryCompiler::new(&model)
        .compile(filter_by_customer_name(&model, "globex", 99))
        .expect("compiles");
    assert_eq!(a.shape_hash, b.shape_hash);

    let different = QueryCompiler::new(&model)
        .compile(
            filter_by_customer_name(&model, "acme", 10).with_operator(ResultOperator::Distinct),
        )
        .expect("compiles");
    assert_ne!(a.shape_hash, different.shape_hash);
}

#[test]
fn collection_null_comparison_warns_but_compiles() {
    init_tracing();
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let query = QueryModel::from_entity(root, customers).with_where(Expr::eq(
        Expr::property(Expr::Source(root), "Orders"),
        Expr::null(),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    assert_eq!(compiled.diagnostics.len(), 1);
    assert_eq!(compiled.diagnostics[0].code(), "CollectionNullComparison");
    let BodyClause::Where(pred) = &compiled.query.body[0] else {
        panic!("unexpected clause {:?}", compiled.query.body[0]);
    };
    // The owner is compared instead of the collection.
    assert_eq!(
        *pred,
        Expr::eq(Expr::property(Expr::Source(root), "Id"), Expr::null())
    );
}

#[test]
fn any_equality_against_capture_becomes_contains() {
    init_tracing();
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let orders = model.entity_by_name("Order").expect("Order").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let sub_src = ids.fresh();
    let sub = QueryModel::from_entity(sub_src, orders)
        .with_projection(Expr::property(Expr::Source(sub_src), "Id"))
        .with_where(Expr::eq(
            Expr::property(Expr::Source(sub_src), "Id"),
            Expr::External(ExternalValue::scalar("wanted", 5i64)),
        ))
        .with_operator(ResultOperator::Any);
    let query = QueryModel::from_entity(root, customers).with_where(Expr::subquery(sub));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    let BodyClause::Where(Expr::Subquery(sub)) = &compiled.query.body[0] else {
        panic!("unexpected clause {:?}", compiled.query.body[0]);
    };
    assert!(sub.body.is_empty());
    assert_eq!(
        sub.operators,
        vec![ResultOperator::Contains(Expr::Parameter(
            "__wanted_0".to_owned()
        ))]
    );
    assert_eq!(
        compiled.parameters.get("__wanted_0"),
        Some(&ParameterValue::Scalar(Value::Int(5)))
    );
}

#[test]
fn captured_queryable_is_inlined_and_rewritten() {
    init_tracing();
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let orders = model.entity_by_name("Order").expect("Order").id;

    // The captured query carries its own navigation to expand.
    let mut captured_ids = SourceIdGen::new();
    let captured_root = captured_ids.fresh();
    let captured = QueryModel::from_entity(captured_root, orders).with_where(Expr::eq(
        Expr::property(
            Expr::property(Expr::Source(captured_root), "Customer"),
            "Name",
        ),
        Expr::constant("acme"),
    ));

    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::ArrayLength(
        Box::new(Expr::External(ExternalValue::queryable("matching", captured))),
    ));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");

    // Inlined, navigation-rewritten, and the length folded into a count.
    let Expr::Subquery(sub) = &compiled.query.projection else {
        panic!("unexpected projection {:?}", compiled.query.projection);
    };
    assert_eq!(sub.operators, vec![ResultOperator::Count]);
    assert!(matches!(sub.body[0], BodyClause::GroupJoin(_)));
    assert!(matches!(sub.body[1], BodyClause::Flatten(_)));
    assert_ne!(sub.source.id, root, "inlined ids are remapped");
}

#[test]
fn duplicate_projected_subqueries_share_one_evaluation() {
    init_tracing();
    let model = model();
    let customers = model.entity_by_name("Customer").expect("Customer").id;
    let orders = model.entity_by_name("Order").expect("Order").id;
    let mut ids = SourceIdGen::new();
    let root = ids.fresh();
    let sub_src = ids.fresh();
    let count = QueryModel::from_entity(sub_src, orders).with_operator(ResultOperator::Count);
    let query = QueryModel::from_entity(root, customers).with_projection(Expr::KeyTuple(vec![
        Expr::subquery(count.clone()),
        Expr::subquery(count),
    ]));

    let compiled = QueryCompiler::new(&model).compile(query).expect("compiles");
    let Expr::KeyTuple(items) = &compiled.query.projection else {
        panic!("unexpected projection {:?}", compiled.query.projection);
    };
    assert!(matches!(items[0], Expr::Shared { slot: 0, .. }));
    assert_eq!(items[1], Expr::SharedRef(0));
}
