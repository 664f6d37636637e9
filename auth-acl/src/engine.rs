use crate::{
    config::AclConfig,
    error::Result,
    models::*,
    repository::{EntityStore, FactRepository},
    resolver::AccessResolver,
    token::AccessToken,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Access-control engine for the print server
pub struct AccessControlEngine {
    /// Storage for access facts
    facts: Arc<dyn FactRepository>,

    /// User and group records
    store: Arc<dyn EntityStore>,

    /// Builds tokens for subject closures
    resolver: Arc<AccessResolver>,

    config: AclConfig,

    /// Tokens resolved since the last write (optional)
    cache: Option<Arc<DashMap<SubjectKey, Arc<AccessToken>>>>,

    /// Bumped by every invalidation; a token resolved across a bump is not cached
    generation: AtomicU64,
}

/// Why a permission query came out the way it did
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub subject: SubjectKey,
    pub permission: String,
    pub allowed: bool,
    /// Answered by the root principal's grant-all token
    pub grant_all: bool,
    pub governing: Option<AccessFact>,
    /// Every fact considered, ascending priority
    pub considered: Vec<AccessFact>,
}

impl AccessControlEngine {
    /// Create an engine with the default configuration
    pub fn new(facts: Arc<dyn FactRepository>, store: Arc<dyn EntityStore>) -> Self {
        Self::with_config(facts, store, AclConfig::default())
    }

    /// Create an engine with the given configuration
    pub fn with_config(
        facts: Arc<dyn FactRepository>,
        store: Arc<dyn EntityStore>,
        config: AclConfig,
    ) -> Self {
        let resolver = Arc::new(AccessResolver::new(facts.clone(), store.clone(), &config));
        let cache = config.cache_tokens.then(|| Arc::new(DashMap::new()));

        Self {
            facts,
            store,
            resolver,
            config,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    /// Enable token caching until the next write made through this engine
    pub fn with_cache(mut self) -> Self {
        self.config.cache_tokens = true;
        self.cache = Some(Arc::new(DashMap::new()));
        self
    }

    /// Get the engine configuration
    pub fn config(&self) -> &AclConfig {
        &self.config
    }

    /// Get the resolver used to build tokens
    pub fn resolver(&self) -> Arc<AccessResolver> {
        self.resolver.clone()
    }

    // =============================================================================
    // Access Queries
    // =============================================================================

    /// Resolved token for a subject, from the cache when enabled
    pub async fn token(&self, subject: impl Into<Subject>) -> Result<Arc<AccessToken>> {
        let subject = subject.into();
        let key = subject.key();

        if let Some(ref cache) = self.cache {
            if let Some(token) = cache.get(&key) {
                debug!("Token cache hit for {}", key);
                return Ok(token.clone());
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let token = Arc::new(self.resolver.token_for(subject).await?);

        if let Some(ref cache) = self.cache {
            if self.generation.load(Ordering::SeqCst) == generation {
                cache.insert(key, token.clone());
                // An invalidation may have cleared the cache just before the insert
                if self.generation.load(Ordering::SeqCst) != generation {
                    cache.remove(&key);
                }
            } else {
                debug!("Facts changed while resolving {}; not caching", key);
            }
        }

        Ok(token)
    }

    /// Token for requests that presented no credentials
    pub async fn anonymous_token(&self) -> Result<Arc<AccessToken>> {
        self.token(Subject::user(self.config.nobody_user_id)).await
    }

    /// Check whether a subject holds a permission
    pub async fn check(&self, subject: impl Into<Subject>, permission: &str) -> Result<bool> {
        let token = self.token(subject).await?;
        Ok(token.get_access(permission))
    }

    /// Like [`check`](Self::check), but any error is logged and denies
    pub async fn is_allowed(&self, subject: impl Into<Subject>, permission: &str) -> bool {
        let subject = subject.into();
        let key = subject.key();
        match self.check(subject, permission).await {
            Ok(allowed) => allowed,
            Err(e) => {
                error!(subject = %key, permission, "Access check failed, denying: {}", e);
                false
            }
        }
    }

    /// Check several permissions against one resolved token
    pub async fn batch_check(
        &self,
        subject: impl Into<Subject>,
        permissions: &[&str],
    ) -> Result<Vec<(String, bool)>> {
        let token = self.token(subject).await?;
        Ok(permissions
            .iter()
            .map(|permission| (permission.to_string(), token.get_access(permission)))
            .collect())
    }

    /// Check a permission and report the facts behind the answer
    pub async fn explain(&self, subject: impl Into<Subject>, permission: &str) -> Result<Decision> {
        let subject = subject.into();
        let key = subject.key();
        let token = self.token(subject).await?;

        Ok(Decision {
            subject: key,
            permission: permission.to_string(),
            allowed: token.get_access(permission),
            grant_all: token.is_grant_all(),
            governing: token.get_access_entry(permission).cloned(),
            considered: token
                .ranked_entries(permission)
                .into_iter()
                .cloned()
                .collect(),
        })
    }

    // =============================================================================
    // Fact Management
    // =============================================================================

    /// Record a grant of `permission` to a subject at `level`
    pub async fn grant(
        &self,
        subject: impl Into<Subject>,
        permission: &str,
        level: i32,
    ) -> Result<AccessFact> {
        self.create_fact(subject.into().key(), permission, false, level).await
    }

    /// Record a revoke of `permission` from a subject at `level`
    pub async fn revoke(
        &self,
        subject: impl Into<Subject>,
        permission: &str,
        level: i32,
    ) -> Result<AccessFact> {
        self.create_fact(subject.into().key(), permission, true, level).await
    }

    async fn create_fact(
        &self,
        subject: SubjectKey,
        permission: &str,
        revoke: bool,
        level: i32,
    ) -> Result<AccessFact> {
        let fact = self.facts.create(subject, permission, revoke, level).await?;
        info!("Created fact: {}", fact);
        self.invalidate();
        Ok(fact)
    }

    /// Delete a fact and every exact duplicate of it
    pub async fn delete_fact(&self, fact: &AccessFact) -> Result<()> {
        info!("Deleting fact: {}", fact);
        self.facts.delete(fact).await?;
        self.invalidate();
        Ok(())
    }

    /// Facts cannot be edited; write the replacement, then drop the original
    pub async fn replace_fact(
        &self,
        old: &AccessFact,
        revoke: bool,
        level: i32,
    ) -> Result<AccessFact> {
        let fact = self
            .create_fact(old.subject, &old.permission, revoke, level)
            .await?;
        self.delete_fact(old).await?;
        Ok(fact)
    }

    /// Facts attached directly to a subject, without groups or ancestors
    pub async fn facts_of(&self, subject: impl Into<Subject>) -> Result<Vec<AccessFact>> {
        self.facts.facts_for(subject.into().key()).await
    }

    // =============================================================================
    // Membership
    // =============================================================================

    /// Add a user to a group
    pub async fn add_member(
        &self,
        user: impl Into<UserRef>,
        group: impl Into<GroupRef>,
    ) -> Result<()> {
        let (user_id, group_id) = (user.into().id(), group.into().id());
        self.store.add_membership(user_id, group_id).await?;
        info!("User {} added to group {}", user_id, group_id);
        self.invalidate();
        Ok(())
    }

    /// Remove a user from a group
    pub async fn remove_member(
        &self,
        user: impl Into<UserRef>,
        group: impl Into<GroupRef>,
    ) -> Result<()> {
        let (user_id, group_id) = (user.into().id(), group.into().id());
        self.store.remove_membership(user_id, group_id).await?;
        info!("User {} removed from group {}", user_id, group_id);
        self.invalidate();
        Ok(())
    }

    // =============================================================================
    // Entity Lookup
    // =============================================================================

    /// Load a user, or pass a loaded one through
    pub async fn user(&self, user: impl Into<UserRef>) -> Result<User> {
        match user.into() {
            EntityRef::Loaded(user) => Ok(user),
            EntityRef::Id(id) => self.store.user_by_id(id).await,
        }
    }

    /// Look up a user by username; duplicates are `Ambiguous`
    pub async fn user_by_name(&self, name: &str) -> Result<User> {
        self.store.user_by_name(name).await
    }

    /// Look up a user by email; duplicates are `Ambiguous`
    pub async fn user_by_email(&self, email: &str) -> Result<User> {
        self.store.user_by_email(email).await
    }

    /// Load a group, or pass a loaded one through
    pub async fn group(&self, group: impl Into<GroupRef>) -> Result<Group> {
        match group.into() {
            EntityRef::Loaded(group) => Ok(group),
            EntityRef::Id(id) => self.store.group_by_id(id).await,
        }
    }

    /// Drop every cached token. Needed after writing to the repositories
    /// directly instead of through this engine.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AclError;
    use crate::repository::InMemoryAccessStore;
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    mock! {
        pub Facts {}

        #[async_trait]
        impl FactRepository for Facts {
            async fn facts_for(&self, subject: SubjectKey) -> Result<Vec<AccessFact>>;
            async fn create(
                &self,
                subject: SubjectKey,
                permission: &str,
                revoke: bool,
                level: i32,
            ) -> Result<AccessFact>;
            async fn delete(&self, fact: &AccessFact) -> Result<()>;
        }
    }

    /// Fact store whose first read takes its snapshot, then waits for
    /// `release` before returning it
    struct PausingFacts {
        inner: Arc<InMemoryAccessStore>,
        paused: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl FactRepository for PausingFacts {
        async fn facts_for(&self, subject: SubjectKey) -> Result<Vec<AccessFact>> {
            let facts = self.inner.facts_for(subject).await?;
            if !self.paused.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(facts)
        }

        async fn create(
            &self,
            subject: SubjectKey,
            permission: &str,
            revoke: bool,
            level: i32,
        ) -> Result<AccessFact> {
            self.inner.create(subject, permission, revoke, level).await
        }

        async fn delete(&self, fact: &AccessFact) -> Result<()> {
            self.inner.delete(fact).await
        }
    }

    async fn engine_with_users() -> (Arc<InMemoryAccessStore>, AccessControlEngine, User) {
        let store = Arc::new(InMemoryAccessStore::new());
        for name in ["root", "nobody"] {
            store
                .create_user(NewUser::new(name, "", "", 0.0))
                .await
                .unwrap();
        }
        let alice = store
            .create_user(NewUser::new("alice", "hash", "alice@example.edu", 10.0))
            .await
            .unwrap();
        let engine = AccessControlEngine::new(store.clone(), store.clone()).with_cache();
        (store, engine, alice)
    }

    #[tokio::test]
    async fn test_basic_check() {
        let (_store, engine, alice) = engine_with_users().await;

        assert!(!engine.check(&alice, "print").await.unwrap());

        engine.grant(&alice, "print", 0).await.unwrap();
        assert!(engine.check(&alice, "print").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_is_dropped_on_writes() {
        let (store, engine, alice) = engine_with_users().await;
        let staff = store.create_group("staff", None).await.unwrap();

        engine.grant(&staff, "print", 0).await.unwrap();
        assert!(!engine.check(&alice, "print").await.unwrap());

        engine.add_member(&alice, &staff).await.unwrap();
        assert!(engine.check(&alice, "print").await.unwrap());

        let revoke = engine.revoke(&alice, "print", 0).await.unwrap();
        assert!(!engine.check(&alice, "print").await.unwrap());

        engine.delete_fact(&revoke).await.unwrap();
        assert!(engine.check(&alice, "print").await.unwrap());

        engine.remove_member(&alice, &staff).await.unwrap();
        assert!(!engine.check(&alice, "print").await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_repository_writes_need_invalidate() {
        let (store, engine, alice) = engine_with_users().await;

        assert!(!engine.check(&alice, "print").await.unwrap());
        store.create(alice.key(), "print", false, 0).await.unwrap();

        // Cached token is still the one resolved before the write
        assert!(!engine.check(&alice, "print").await.unwrap());

        engine.invalidate();
        assert!(engine.check(&alice, "print").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_fact() {
        let (_store, engine, alice) = engine_with_users().await;

        let grant = engine.grant(&alice, "print", 0).await.unwrap();
        let replaced = engine.replace_fact(&grant, true, 2).await.unwrap();

        assert_eq!(engine.facts_of(&alice).await.unwrap(), vec![replaced.clone()]);
        let decision = engine.explain(&alice, "print").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.governing, Some(replaced));
    }

    #[tokio::test]
    async fn test_root_and_anonymous() {
        let (_store, engine, _alice) = engine_with_users().await;

        let decision = engine.explain(Subject::user(1_i64), "admin").await.unwrap();
        assert!(decision.allowed);
        assert!(decision.grant_all);
        assert!(decision.governing.is_none());

        engine.grant(Subject::user(2_i64), "print-public", 0).await.unwrap();
        let anonymous = engine.anonymous_token().await.unwrap();
        assert!(anonymous.get_access("print-public"));
        assert!(!anonymous.get_access("admin"));
    }

    #[tokio::test]
    async fn test_batch_check_and_fail_closed() {
        let (_store, engine, alice) = engine_with_users().await;
        engine.grant(&alice, "print", 0).await.unwrap();

        let results = engine.batch_check(&alice, &["print", "admin"]).await.unwrap();
        assert_eq!(
            results,
            vec![("print".to_string(), true), ("admin".to_string(), false)]
        );

        // Unknown principal: lookup fails, so access is denied
        assert!(!engine.is_allowed(Subject::user(404_i64), "print").await);
    }

    #[tokio::test]
    async fn test_write_during_resolution_is_not_cached() {
        let (store, _engine, alice) = engine_with_users().await;
        let facts = Arc::new(PausingFacts {
            inner: store.clone(),
            paused: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(
            AccessControlEngine::new(facts.clone(), store.clone()).with_cache(),
        );

        let reader = {
            let engine = engine.clone();
            let alice = alice.clone();
            tokio::spawn(async move { engine.check(&alice, "print").await.unwrap() })
        };

        facts.entered.notified().await;
        engine.grant(&alice, "print", 0).await.unwrap();
        facts.release.notify_one();

        // The read started before the grant, so it may answer from old facts
        assert!(!reader.await.unwrap());
        assert!(engine.check(&alice, "print").await.unwrap());
        assert!(engine.is_allowed(&alice, "print").await);
    }

    #[tokio::test]
    async fn test_storage_error_fails_closed() {
        let (store, _engine, alice) = engine_with_users().await;

        let mut facts = MockFacts::new();
        facts
            .expect_facts_for()
            .returning(|_| Err(AclError::StorageError("connection refused".to_string())));
        let engine = AccessControlEngine::new(Arc::new(facts), store).with_cache();

        let err = engine.check(&alice, "print").await.unwrap_err();
        assert!(matches!(err, AclError::StorageError(_)));
        assert!(!engine.is_allowed(&alice, "print").await);
        assert!(engine.batch_check(&alice, &["print"]).await.is_err());
    }
}
