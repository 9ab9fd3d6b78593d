//! Resource graph: named lock keys and the set currently held.
//!
//! Parent edges record what backs a resource. They take no part in locking:
//! holding a child never locks its parents.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Resource every task may lock to serialize against global changes.
pub const SYSTEM_RESOURCE: &str = "system";

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub parents: BTreeSet<String>,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<String, Resource>,
    held: HashSet<String>,
}

/// DAG of lock resources.
#[derive(Default)]
pub struct ResourceGraph {
    inner: Mutex<GraphInner>,
}

impl ResourceGraph {
    /// Create a graph holding only the [`SYSTEM_RESOURCE`].
    pub fn new() -> Self {
        let graph = Self::default();
        graph.register(SYSTEM_RESOURCE, &[]);
        graph
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `name`, or replace its parent set. Returns false if the node
    /// already existed with the same parents.
    pub fn register(&self, name: &str, parents: &[String]) -> bool {
        let parents: BTreeSet<String> = parents.iter().cloned().collect();
        let mut inner = self.lock();
        if let Some(existing) = inner.nodes.get_mut(name) {
            if existing.parents == parents {
                return false;
            }
            existing.parents = parents;
            debug!(resource = name, "Resource parents updated");
            return true;
        }
        inner.nodes.insert(
            name.to_string(),
            Resource {
                name: name.to_string(),
                parents,
            },
        );
        debug!(resource = name, "Resource registered");
        true
    }

    /// Remove `name`. Dependents are left in place.
    pub fn unregister(&self, name: &str) -> Option<Resource> {
        let removed = self.lock().nodes.remove(name);
        if removed.is_some() {
            debug!(resource = name, "Resource unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Resource> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().nodes.contains_key(name)
    }

    /// Direct dependents of `name`.
    pub fn children(&self, name: &str) -> Vec<String> {
        let mut children: Vec<String> = self
            .lock()
            .nodes
            .values()
            .filter(|r| r.parents.contains(name))
            .map(|r| r.name.clone())
            .collect();
        children.sort();
        children
    }

    /// True iff every named resource exists and none is held.
    pub fn can_acquire(&self, names: &[String]) -> bool {
        Self::available(&self.lock(), names)
    }

    fn available(inner: &GraphInner, names: &[String]) -> bool {
        names
            .iter()
            .all(|n| inner.nodes.contains_key(n) && !inner.held.contains(n))
    }

    /// Take every named resource, or none of them. Returns true on success.
    pub fn acquire(&self, names: &[String]) -> bool {
        let mut inner = self.lock();
        if !Self::available(&inner, names) {
            return false;
        }
        inner.held.extend(names.iter().cloned());
        true
    }

    pub fn release(&self, names: &[String]) {
        let mut inner = self.lock();
        for name in names {
            inner.held.remove(name);
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.lock().held.contains(name)
    }

    /// The named resources that are not in the graph.
    pub fn missing(&self, names: &[String]) -> Vec<String> {
        let inner = self.lock();
        names
            .iter()
            .filter(|n| !inner.nodes.contains_key(n.as_str()))
            .cloned()
            .collect()
    }
}
