//! Structured non-fatal warnings surfaced alongside a compiled query.
//!
//! Diagnostics never fail a compilation: the query keeps its literal
//! (possibly unintended) semantics. Each warning is logged through
//! `tracing` as it is raised and collected so the host can consume the
//! batch programmatically.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Semantic-risk warning raised during rewriting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Diagnostic {
    /// `collection == null` compares the collection's owner to null;
    /// the caller probably meant `!collection.Any()`.
    CollectionNullComparison {
        /// Entity declaring the collection navigation.
        entity: String,
        /// The compared collection navigation.
        navigation: String,
    },
    /// Two collection navigations compared with `==` fall back to
    /// reference identity, not content equality.
    CollectionReferenceComparison {
        /// Entity declaring the collection navigation.
        entity: String,
        /// The compared collection navigation.
        navigation: String,
    },
}

impl Diagnostic {
    /// Returns a machine-readable code for the warning variant.
    pub fn code(&self) -> &'static str {
        match self {
            Diagnostic::CollectionNullComparison { .. } => "CollectionNullComparison",
            Diagnostic::CollectionReferenceComparison { .. } => "CollectionReferenceComparison",
        }
    }

    fn message(&self) -> String {
        match self {
            Diagnostic::CollectionNullComparison { entity, navigation } => format!(
                "comparing collection navigation '{entity}.{navigation}' to null compares its owner; did you mean to check emptiness?"
            ),
            Diagnostic::CollectionReferenceComparison { entity, navigation } => format!(
                "comparing collection navigation '{entity}.{navigation}' uses reference identity, not content equality"
            ),
        }
    }
}

/// Collector shared by the passes of one compilation.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs and records a warning.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        warn!(code = diagnostic.code(), "{}", diagnostic.message());
        self.items.push(diagnostic);
    }

    /// Returns the warnings recorded so far.
    pub fn items(&self) -> &[Diagnostic] {
        &self.items
    }

    /// Consumes the collector, yielding the recorded warnings.
    pub fn into_items(self) -> Vec<Diagnostic> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut diags = Diagnostics::new();
        diags.report(Diagnostic::CollectionNullComparison {
            entity: "Customer".into(),
            navigation: "Orders".into(),
        });
        diags.report(Diagnostic::CollectionReferenceComparison {
            entity: "Customer".into(),
            navigation: "Orders".into(),
        });
        let codes: Vec<_> = diags.items().iter().map(Diagnostic::code).collect();
        assert_eq!(
            codes,
            ["CollectionNullComparison", "CollectionReferenceComparison"]
        );
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(Diagnostic::CollectionNullComparison {
            entity: "Customer".into(),
            navigation: "Orders".into(),
        })
        .expect("serializes");
        assert_eq!(json["kind"], "CollectionNullComparison");
    }
}
