use crate::{
    error::{AclError, Result},
    models::*,
    repository::EntityStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of following a group's `inherit` reference
#[derive(Debug, Clone, PartialEq)]
pub enum Parent {
    None,
    Resolved(Group),
    /// The parent id no longer names a group
    Dangling(GroupId),
}

/// Walks group inheritance through the entity store by id
#[derive(Clone)]
pub struct GroupGraph {
    store: Arc<dyn EntityStore>,
    max_depth: usize,
}

impl GroupGraph {
    /// Create a graph that walks at most `max_depth` ancestors
    pub fn new(store: Arc<dyn EntityStore>, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// Look up the group named by `group.inherit`, telling a missing parent
    /// apart from no parent at all
    pub async fn resolve_parent(&self, group: &Group) -> Result<Parent> {
        let Some(parent_id) = group.inherit else {
            return Ok(Parent::None);
        };

        match self.store.group_by_id(parent_id).await {
            Ok(parent) => Ok(Parent::Resolved(parent)),
            Err(AclError::NotFound { .. }) => Ok(Parent::Dangling(parent_id)),
            Err(e) => Err(e),
        }
    }

    /// The parent group, treating a dangling reference as no parent
    pub async fn parent_of(&self, group: &Group) -> Result<Option<Group>> {
        match self.resolve_parent(group).await? {
            Parent::Resolved(parent) => Ok(Some(parent)),
            Parent::Dangling(parent_id) => {
                warn!(
                    group = group.id,
                    parent = parent_id,
                    "Group inherits from a missing group; ignoring"
                );
                Ok(None)
            }
            Parent::None => Ok(None),
        }
    }

    /// Lazy walk over the ancestors of `group`, nearest first
    pub fn ancestors(&self, group: &Group) -> Ancestors {
        let mut visited = HashSet::new();
        visited.insert(group.id);
        Ancestors {
            graph: self.clone(),
            current: Some(group.clone()),
            visited,
            depth: 0,
        }
    }

    /// Every ancestor of `group`, nearest first
    pub async fn collect_ancestors(&self, group: &Group) -> Result<Vec<Group>> {
        let mut ancestors = self.ancestors(group);
        let mut chain = Vec::new();
        while let Some(parent) = ancestors.next().await? {
            chain.push(parent);
        }
        Ok(chain)
    }
}

/// Cursor over an inheritance chain.
///
/// Stops at the first missing parent, at a group already seen (a cycle), or
/// once the configured depth is reached.
pub struct Ancestors {
    graph: GroupGraph,
    current: Option<Group>,
    visited: HashSet<GroupId>,
    depth: usize,
}

impl Ancestors {
    /// The next ancestor, or `None` once the walk has stopped
    pub async fn next(&mut self) -> Result<Option<Group>> {
        let Some(current) = self.current.take() else {
            return Ok(None);
        };

        if self.depth >= self.graph.max_depth {
            warn!(
                group = current.id,
                max_depth = self.graph.max_depth,
                "Inheritance chain exceeds maximum depth; truncating"
            );
            return Ok(None);
        }

        let Some(parent) = self.graph.parent_of(&current).await? else {
            return Ok(None);
        };

        if !self.visited.insert(parent.id) {
            warn!(
                group = current.id,
                parent = parent.id,
                "Inheritance cycle detected; stopping walk"
            );
            return Ok(None);
        }

        debug!("Group {} inherits from {}", current.id, parent.id);
        self.depth += 1;
        self.current = Some(parent.clone());
        Ok(Some(parent))
    }
}
