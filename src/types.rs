//! Newtype identifiers shared across the model and the rewriting pipeline.
//!
//! Every identifier is a plain `u32` wrapper so trees stay cheap to clone
//! and hash. Identifiers are only meaningful relative to the [`Model`] or
//! the compilation that allocated them; they are never persisted.
//!
//! [`Model`]: crate::model::Model

use serde::{Deserialize, Serialize};

/// Identifier assigned to an entity type within a [`crate::model::Model`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Identifier assigned to a scalar property of an entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

/// Identifier assigned to a navigation (relationship reference).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NavigationId(pub u32);

/// Identifier assigned to a foreign-key definition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ForeignKeyId(pub u32);

/// Identifier assigned to a query source clause (base set, join, group,
/// or flattened group) within one compilation.
///
/// Source ids are allocated from a [`SourceIdGen`] owned by the compilation
/// so that cloned query models can be remapped without collisions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u32);

/// Monotonic allocator for [`SourceId`]s, owned by one compilation.
#[derive(Debug, Default)]
pub struct SourceIdGen {
    next: u32,
}

impl SourceIdGen {
    /// Creates a generator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a generator that will not collide with ids below `next`.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Allocates the next fresh source id.
    pub fn fresh(&mut self) -> SourceId {
        let id = SourceId(self.next);
        self.next += 1;
        id
    }

    /// Advances the generator past `id` so it can never be reissued.
    pub fn reserve(&mut self, id: SourceId) {
        if id.0 >= self.next {
            self.next = id.0 + 1;
        }
    }
}
