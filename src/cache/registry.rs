//! Bidirectional dependency registry.
//!
//! Tracks which volatile entries depend on which chunks, tags and query
//! families so a mutation can drop exactly the entries it made stale. Keys
//! are content hashes, so this is the only precise invalidation path; pattern
//! deletion can only narrow by literal key prefix.
//!
//! The registry has no locking of its own. It lives inside the volatile store
//! state and is mutated under the store's write lock, which keeps it in step
//! with insertions, evictions and expiry.

use std::collections::{HashMap, HashSet};

use super::keys::Dependency;

#[derive(Debug, Default)]
pub struct DependencyRegistry {
    /// Maps dependencies to all keys that rely on them
    dependency_to_keys: HashMap<Dependency, HashSet<String>>,
    /// Maps keys to all dependencies they were registered with
    key_to_dependencies: HashMap<String, HashSet<Dependency>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` against `dependencies`, replacing any previous registration.
    pub fn register(&mut self, key: &str, dependencies: HashSet<Dependency>) {
        self.unregister(key);
        if dependencies.is_empty() {
            return;
        }

        for dependency in &dependencies {
            self.dependency_to_keys
                .entry(dependency.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_dependencies.insert(key.to_string(), dependencies);
    }

    /// Drop every mapping of `key`. Called whenever the store removes an entry.
    pub fn unregister(&mut self, key: &str) {
        let Some(dependencies) = self.key_to_dependencies.remove(key) else {
            return;
        };

        for dependency in dependencies {
            if let Some(keys) = self.dependency_to_keys.get_mut(&dependency) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependency_to_keys.remove(&dependency);
                }
            }
        }
    }

    /// Keys registered against any of `dependencies`.
    pub fn dependents<'a>(
        &self,
        dependencies: impl IntoIterator<Item = &'a Dependency>,
    ) -> HashSet<String> {
        dependencies
            .into_iter()
            .filter_map(|dependency| self.dependency_to_keys.get(dependency))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.dependency_to_keys.clear();
        self.key_to_dependencies.clear();
    }

    #[cfg(test)]
    pub fn dependency_count(&self) -> usize {
        self.dependency_to_keys.len()
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.key_to_dependencies.len()
    }
}
