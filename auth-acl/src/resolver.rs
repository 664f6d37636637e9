use crate::{
    config::AclConfig,
    error::Result,
    graph::GroupGraph,
    models::*,
    repository::{EntityStore, FactRepository},
    token::{AccessToken, FactIndex},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds access tokens by collecting the facts of a subject's closure:
/// - facts attached to the subject itself
/// - for a user, the closure of every group it is a member of
/// - for a group, the facts of each ancestor along its inheritance chain
///
/// Missing groups along the way contribute nothing. Storage failures abort
/// the build.
pub struct AccessResolver {
    facts: Arc<dyn FactRepository>,
    store: Arc<dyn EntityStore>,
    graph: GroupGraph,
    config: AclConfig,
}

impl AccessResolver {
    /// Create a resolver using the root principal and inheritance depth
    /// from `config`
    pub fn new(
        facts: Arc<dyn FactRepository>,
        store: Arc<dyn EntityStore>,
        config: &AclConfig,
    ) -> Self {
        let graph = GroupGraph::new(store.clone(), config.max_inheritance_depth);
        Self {
            facts,
            store,
            graph,
            config: config.clone(),
        }
    }

    /// Resolve the token for any subject
    pub async fn token_for(&self, subject: impl Into<Subject>) -> Result<AccessToken> {
        match subject.into() {
            Subject::User(user) => self.token_for_user(user).await,
            Subject::Group(group) => self.token_for_group(group).await,
        }
    }

    /// Token for a user: its own facts plus the closure of every group it
    /// belongs to. The root principal gets [`AccessToken::GrantAll`].
    pub async fn token_for_user(&self, user: impl Into<UserRef>) -> Result<AccessToken> {
        let user = user.into();
        if self.config.is_root(user.id()) {
            debug!("User {} is root; granting all", user.id());
            return Ok(AccessToken::GrantAll);
        }

        let user = match user {
            EntityRef::Loaded(user) => user,
            EntityRef::Id(id) => self.store.user_by_id(id).await?,
        };

        let mut index = FactIndex::new();
        index.extend(self.facts.facts_for(user.key()).await?);

        for membership in self.store.groups_of_user(user.id).await? {
            match membership {
                Member::Resolved(group) => index.merge(self.group_index(&group).await?),
                Member::Dangling(group_id) => {
                    warn!(
                        user = user.id,
                        group = group_id,
                        "User is a member of a missing group; ignoring"
                    );
                }
            }
        }

        debug!("Resolved {} facts for user {}", index.len(), user.id);
        Ok(AccessToken::Facts(index))
    }

    /// Token for a group: its own facts plus those of its ancestors
    pub async fn token_for_group(&self, group: impl Into<GroupRef>) -> Result<AccessToken> {
        let group = match group.into() {
            EntityRef::Loaded(group) => group,
            EntityRef::Id(id) => self.store.group_by_id(id).await?,
        };
        Ok(AccessToken::Facts(self.group_index(&group).await?))
    }

    /// Facts of `group` followed by those of each ancestor, nearest first
    async fn group_index(&self, group: &Group) -> Result<FactIndex> {
        let mut index = FactIndex::new();
        index.extend(self.facts.facts_for(group.key()).await?);

        let mut ancestors = self.graph.ancestors(group);
        while let Some(ancestor) = ancestors.next().await? {
            index.extend(self.facts.facts_for(ancestor.key()).await?);
        }

        debug!("Resolved {} facts for group {}", index.len(), group.id);
        Ok(index)
    }
}
