//! Reliq rewrites object-shaped queries over a relational domain model
//! into trees an execution layer can translate directly: navigation
//! member paths become joins, collection navigations become correlated
//! subqueries (batched when possible), entity comparisons become key
//! comparisons, and captured host values become named parameters.
//!
//! The crate is a pure compiler front half. It owns no storage and runs
//! no queries; its output is a [`query::CompiledQuery`] handed to an
//! execution layer.
//!
//! ```
//! use reliq::model::Model;
//! use reliq::query::{Expr, QueryCompiler, QueryModel};
//! use reliq::types::SourceIdGen;
//!
//! let model = Model::builder()
//!     .entity("Customer", |e| e.property("Id").property("Name").primary_key(["Id"]))
//!     .entity("Order", |e| {
//!         e.property("Id").nullable_property("CustomerId").primary_key(["Id"])
//!     })
//!     .relation("Order", "Customer", |r| {
//!         r.foreign_key(["CustomerId"])
//!             .optional()
//!             .dependent_nav("Customer")
//!             .principal_nav("Orders")
//!     })
//!     .build()
//!     .unwrap();
//!
//! let orders = model.entity_by_name("Order").unwrap().id;
//! let mut ids = SourceIdGen::new();
//! let o = ids.fresh();
//! let query = QueryModel::from_entity(o, orders).with_where(Expr::eq(
//!     Expr::property(Expr::property(Expr::Source(o), "Customer"), "Name"),
//!     Expr::constant("acme"),
//! ));
//!
//! let compiled = QueryCompiler::new(&model).compile(query).unwrap();
//! assert!(compiled.diagnostics.is_empty());
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod model;
pub mod query;
pub mod types;

pub use error::{ReliqError, Result};
