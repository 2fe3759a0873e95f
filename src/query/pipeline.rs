//! Compilation pipeline: the fixed sequence of rewriting passes taking a
//! raw query model to its executable form.
//!
//! Pass order is load-bearing. Captured queryables are inlined first so
//! later passes see their navigations. Entity equality runs on the raw
//! tree, before navigation rewriting turns member paths into joins, so it
//! still sees navigation shapes. Correlated collection extraction needs
//! the subqueries the navigation pass stamped. Normalization and
//! parameter extraction come last, over a tree no pass will touch again.

use std::collections::HashSet;

use tracing::{debug, debug_span};

use crate::model::Model;
use crate::query::correlation::{CorrelatedCollection, CorrelationExtractor};
use crate::query::diagnostics::{Diagnostic, Diagnostics};
use crate::query::equality::EqualityRewriter;
use crate::query::errors::{CompileError, CompileResult};
use crate::query::navigation::NavigationRewriter;
use crate::query::normalize::normalize;
use crate::query::params::{self, ParameterBag};
use crate::query::scope::ScopeMap;
use crate::query::tree::QueryModel;
use crate::query::visit::{source_refs_query, Rewriter};
use crate::types::SourceIdGen;

/// Fully rewritten query plus everything the execution layer needs.
#[derive(Debug)]
pub struct CompiledQuery {
    /// The rewritten, normalized, parameterized tree.
    pub query: QueryModel,
    /// Parameters extracted from captured values.
    pub parameters: ParameterBag,
    /// Correlated collection registrations, in placeholder order.
    pub correlations: Vec<CorrelatedCollection>,
    /// Non-fatal warnings raised while rewriting.
    pub diagnostics: Vec<Diagnostic>,
    /// Structural cache key, computed before collection lifting moves
    /// subtrees into registrations and before parameter extraction.
    pub shape_hash: u64,
}

/// Entry point driving the rewriting passes over one query.
pub struct QueryCompiler<'a> {
    model: &'a Model,
    tracking: bool,
}

impl<'a> QueryCompiler<'a> {
    /// Creates a compiler over `model`. Compilations track entities by
    /// default; see [`QueryCompiler::tracking`].
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            tracking: true,
        }
    }

    /// Sets whether materialized entities participate in change tracking.
    /// The flag is stamped onto every correlated collection registration.
    pub fn tracking(mut self, tracking: bool) -> Self {
        self.tracking = tracking;
        self
    }

    /// Runs the full pipeline over `query`.
    pub fn compile(&self, query: QueryModel) -> CompileResult<CompiledQuery> {
        let span = debug_span!("compile_query");
        let _guard = span.enter();

        let mut ids = SourceIdGen::new();
        for id in query.declared_sources() {
            ids.reserve(id);
        }

        let query = params::inline_queryables(query, &mut ids)?;

        let declared = query.declared_sources();
        let mut refs = HashSet::new();
        source_refs_query(&query, &mut refs);
        if let Some(dangling) = refs.difference(&declared).min() {
            return Err(CompileError::UnboundSource { id: dangling.0 });
        }

        let mut scope = ScopeMap::collect(&query, self.model);
        let mut diagnostics = Diagnostics::new();

        let query = EqualityRewriter::new(self.model, &scope, &mut diagnostics)
            .rewrite_query(query)?;
        debug!("entity equality rewritten");

        let query =
            NavigationRewriter::new(self.model, &mut scope, &mut ids).rewrite(query)?;
        debug!("navigations rewritten");

        // The cache key covers the whole tree, so it is taken before
        // collection lifting moves subtrees out into registrations.
        let shape_hash = query.shape_hash();
        debug!(shape_hash, "shape hashed");

        let (query, correlations) =
            CorrelationExtractor::new(self.model, &mut scope, &mut ids, self.tracking)
                .extract(query)?;
        debug!(lifted = correlations.len(), "correlated collections extracted");

        let query = normalize(query)?;
        debug!("normalized");

        let (query, mut parameters) = params::extract(query)?;
        let mut registrations = Vec::with_capacity(correlations.len());
        for mut reg in correlations {
            reg.query = normalize(reg.query)?;
            let (batched, window) =
                params::extract_registration(reg.query, reg.window, &mut parameters)?;
            reg.query = batched;
            reg.window = window;
            registrations.push(reg);
        }
        debug!(parameters = parameters.len(), "parameters extracted");

        Ok(CompiledQuery {
            query,
            parameters,
            correlations: registrations,
            diagnostics: diagnostics.into_items(),
            shape_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::Expr;
    use crate::query::params::ParameterValue;
    use crate::query::tree::BodyClause;
    use crate::query::value::{ExternalValue, Value};
    use crate::types::{SourceId, SourceIdGen};

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

    #[test]
    fn compiles_navigation_filter_with_capture() {
        let model = model();
        let orders = model.entity_by_name("Order").expect("Order").id;
        let mut ids = SourceIdGen::new();
        let root = ids.fresh();
        let query = QueryModel::from_entity(root, orders).with_where(Expr::and(
            Expr::eq(
                Expr::property(
                    Expr::property(Expr::Source(root), "Customer"),
                    "Name",
                ),
                Expr::External(ExternalValue::scalar("name", "acme")),
            ),
            Expr::eq(
                Expr::property(Expr::Source(root), "Total"),
                Expr::External(ExternalValue::scalar("total", 10i64)),
            ),
        ));

        let compiled = QueryCompiler::new(&model)
            .compile(query)
            .expect("compiles");

        // The navigation became a join ahead of the filter.
        assert!(matches!(compiled.query.body[0], BodyClause::GroupJoin(_)));
        assert!(matches!(compiled.query.body[1], BodyClause::Flatten(_)));
        assert_eq!(
            compiled.parameters.get("__name_0"),
            Some(&ParameterValue::Scalar(Value::String("acme".into())))
        );
        assert_eq!(
            compiled.parameters.get("__total_1"),
            Some(&ParameterValue::Scalar(Value::Int(10)))
        );
        assert!(compiled.correlations.is_empty());
        assert!(compiled.diagnostics.is_empty());
    }

    #[test]
    fn dangling_source_reference_is_rejected() {
        let model = model();
        let orders = model.entity_by_name("Order").expect("Order").id;
        let mut ids = SourceIdGen::new();
        let root = ids.fresh();
        let query = QueryModel::from_entity(root, orders).with_where(Expr::eq(
            Expr::property(Expr::Source(SourceId(99)), "Total"),
            Expr::null(),
        ));

        let err = QueryCompiler::new(&model)
            .compile(query)
            .expect_err("dangling source rejected");
        assert_eq!(err.code(), "UnboundSource");
        assert!(matches!(err, CompileError::UnboundSource { id: 99 }));
    }

    #[test]
    fn shape_hash_is_stable_across_captured_payloads() {
        let model = model();
        let orders = model.entity_by_name("Order").expect("Order").id;
        let build = |total: i64| {
            let mut ids = SourceIdGen::new();
            let root = ids.fresh();
            QueryModel::from_entity(root, orders).with_where(Expr::eq(
                Expr::property(Expr::Source(root), "Total"),
                Expr::External(ExternalValue::scalar("total", total)),
            ))
        };
        let a = QueryCompiler::new(&model).compile(build(1)).expect("compiles");
        let b = QueryCompiler::new(&model).compile(build(2)).expect("compiles");
        assert_eq!(a.shape_hash, b.shape_hash);
    }

    #[test]
    fn tracking_flag_reaches_registrations() {
        let model = model();
        let customers = model.entity_by_name("Customer").expect("Customer").id;
        let mut ids = SourceIdGen::new();
        let root = ids.fresh();
        let query = QueryModel::from_entity(root, customers).with_projection(
            Expr::property(Expr::Source(root), "Orders"),
        );

        let compiled = QueryCompiler::new(&model)
            .tracking(false)
            .compile(query)
            .expect("compiles");
        assert_eq!(compiled.correlations.len(), 1);
        assert!(!compiled.correlations[0].tracking);
        assert!(matches!(
            compiled.query.projection,
            Expr::CorrelatedCollection { index: 0, .. }
        ));
    }
}
