//! Mutation to invalidation mapping.
//!
//! Keys are content hashes, so a pattern can only target "everything" in
//! practice. Narrow invalidation of the volatile tier goes through the
//! dependency registry instead: cached reads record which chunks, tags and
//! parents they depend on, and a plan lists the dependencies a mutation
//! touched. The persistent tier holds no dependency index and is always
//! wiped on any mutation.

use std::collections::HashSet;
use std::fmt;

use super::keys::{Dependency, KeyPattern};

/// A successful write against the chunk service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create,
    Update { chunk_id: String },
    Delete { chunk_id: String },
    BatchCreate,
    BatchUpdate,
    AddTags { chunk_id: String, tags: Vec<String> },
    RemoveTags { chunk_id: String, tags: Vec<String> },
    Move { chunk_id: String, new_parent: String },
}

impl Mutation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutation::Create => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
            Mutation::BatchCreate => "batch_create",
            Mutation::BatchUpdate => "batch_update",
            Mutation::AddTags { .. } => "add_tags",
            Mutation::RemoveTags { .. } => "remove_tags",
            Mutation::Move { .. } => "move",
        }
    }
}

/// What to remove from each tier after a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub reason: &'static str,
    /// Volatile keys to delete by pattern.
    pub volatile_patterns: Vec<KeyPattern>,
    /// Volatile entries registered against any of these are deleted.
    pub dependencies: HashSet<Dependency>,
    /// Persistent rows to delete by pattern.
    pub persistent_patterns: Vec<KeyPattern>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ reason: {}, volatile_patterns: {}, dependencies: {}, \
             persistent_patterns: {} }}",
            self.reason,
            self.volatile_patterns.len(),
            self.dependencies.len(),
            self.persistent_patterns.len(),
        )
    }
}

impl InvalidationPlan {
    pub fn for_mutation(mutation: &Mutation) -> Self {
        let mut plan = Self {
            reason: mutation.as_str(),
            persistent_patterns: vec![KeyPattern::All],
            ..Default::default()
        };

        match mutation {
            Mutation::Create
            | Mutation::Update { .. }
            | Mutation::Delete { .. }
            | Mutation::BatchCreate
            | Mutation::BatchUpdate => {
                plan.volatile_patterns.push(KeyPattern::All);
            }
            Mutation::AddTags { chunk_id, tags } | Mutation::RemoveTags { chunk_id, tags } => {
                plan.dependencies.insert(Dependency::Chunk(chunk_id.clone()));
                plan.dependencies
                    .extend(tags.iter().cloned().map(Dependency::Tag));
                plan.dependencies.insert(Dependency::Search);
            }
            Mutation::Move {
                chunk_id,
                new_parent,
            } => {
                plan.dependencies.insert(Dependency::Chunk(chunk_id.clone()));
                plan.dependencies
                    .insert(Dependency::Parent(new_parent.clone()));
                plan.dependencies.insert(Dependency::Hierarchy);
                plan.dependencies.insert(Dependency::Search);
            }
        }

        plan
    }
}
