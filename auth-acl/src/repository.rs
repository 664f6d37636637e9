use crate::{
    error::{AclError, Result},
    models::*,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

pub mod postgres;

pub use postgres::PostgresAccessStore;

/// Storage for access facts
#[async_trait]
pub trait FactRepository: Send + Sync {
    /// All facts attached to one subject, duplicates included
    async fn facts_for(&self, subject: SubjectKey) -> Result<Vec<AccessFact>>;

    /// Append a fact; existing facts are never touched
    async fn create(
        &self,
        subject: SubjectKey,
        permission: &str,
        revoke: bool,
        level: i32,
    ) -> Result<AccessFact>;

    /// Remove every row equal to `fact` in all five fields.
    /// Deleting a fact that is not stored is a no-op.
    async fn delete(&self, fact: &AccessFact) -> Result<()>;
}

/// The user/group records the engine reads through
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn user_by_id(&self, id: UserId) -> Result<User>;

    /// Usernames are not unique; more than one match is `Ambiguous`
    async fn user_by_name(&self, name: &str) -> Result<User>;

    async fn user_by_email(&self, email: &str) -> Result<User>;

    async fn all_users(&self) -> Result<Vec<User>>;

    async fn create_user(&self, user: NewUser) -> Result<User>;

    async fn update_user(&self, user: &User) -> Result<()>;

    /// Removes the user and its memberships
    async fn delete_user(&self, id: UserId) -> Result<()>;

    async fn group_by_id(&self, id: GroupId) -> Result<Group>;

    async fn group_by_name(&self, name: &str) -> Result<Group>;

    async fn create_group(&self, name: &str, inherit: Option<GroupId>) -> Result<Group>;

    async fn update_group(&self, group: &Group) -> Result<()>;

    /// Removes the group and its memberships. Groups inheriting from it keep
    /// their now-dangling `inherit` id.
    async fn delete_group(&self, id: GroupId) -> Result<()>;

    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<Member<Group>>>;

    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<Member<User>>>;

    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()>;

    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()>;
}

/// Pick the single row of a lookup by a possibly non-unique key
pub fn exactly_one<T>(
    mut rows: Vec<T>,
    entity: &'static str,
    key: &'static str,
    value: impl ToString,
) -> Result<T> {
    match rows.len() {
        0 => Err(AclError::not_found(entity, key, value)),
        1 => rows
            .pop()
            .ok_or_else(|| AclError::not_found(entity, key, value)),
        count => Err(AclError::ambiguous(entity, key, value, count)),
    }
}

#[derive(Debug, Default)]
struct StoreState {
    users: BTreeMap<UserId, User>,
    groups: BTreeMap<GroupId, Group>,
    memberships: Vec<(UserId, GroupId)>,
    facts: Vec<AccessFact>,
    next_user_id: UserId,
    next_group_id: GroupId,
}

/// In-memory fact repository and entity store for testing and development.
///
/// Every read clones what it returns under a read lock, so a caller always
/// sees a committed snapshot.
pub struct InMemoryAccessStore {
    state: RwLock<StoreState>,
}

impl InMemoryAccessStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_user_id: 1,
                next_group_id: 1,
                ..StoreState::default()
            }),
        }
    }

    /// Number of stored facts, duplicates included
    pub fn fact_count(&self) -> usize {
        self.state.read().facts.len()
    }
}

impl Default for InMemoryAccessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FactRepository for InMemoryAccessStore {
    async fn facts_for(&self, subject: SubjectKey) -> Result<Vec<AccessFact>> {
        let state = self.state.read();
        Ok(state
            .facts
            .iter()
            .filter(|fact| fact.subject == subject)
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        subject: SubjectKey,
        permission: &str,
        revoke: bool,
        level: i32,
    ) -> Result<AccessFact> {
        let fact = AccessFact::new(subject, permission, revoke, level);
        self.state.write().facts.push(fact.clone());
        debug!("Stored fact: {}", fact);
        Ok(fact)
    }

    async fn delete(&self, fact: &AccessFact) -> Result<()> {
        let mut state = self.state.write();
        let before = state.facts.len();
        state.facts.retain(|stored| stored != fact);
        debug!("Deleted {} row(s) for fact: {}", before - state.facts.len(), fact);
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryAccessStore {
    async fn user_by_id(&self, id: UserId) -> Result<User> {
        self.state
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| AclError::not_found("user", "id", id))
    }

    async fn user_by_name(&self, name: &str) -> Result<User> {
        let rows: Vec<User> = self
            .state
            .read()
            .users
            .values()
            .filter(|user| user.username == name)
            .cloned()
            .collect();
        exactly_one(rows, "user", "name", name)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let rows: Vec<User> = self
            .state
            .read()
            .users
            .values()
            .filter(|user| user.email == email)
            .cloned()
            .collect();
        exactly_one(rows, "user", "email", email)
    }

    async fn all_users(&self) -> Result<Vec<User>> {
        Ok(self.state.read().users.values().cloned().collect())
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut state = self.state.write();
        let id = state.next_user_id;
        state.next_user_id += 1;
        let user = user.into_user(id);
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.write();
        match state.users.get_mut(&user.id) {
            Some(stored) => {
                *stored = user.clone();
                Ok(())
            }
            None => Err(AclError::not_found("user", "id", user.id)),
        }
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        let mut state = self.state.write();
        state.memberships.retain(|(uid, _)| *uid != id);
        state.users.remove(&id);
        Ok(())
    }

    async fn group_by_id(&self, id: GroupId) -> Result<Group> {
        self.state
            .read()
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| AclError::not_found("group", "id", id))
    }

    async fn group_by_name(&self, name: &str) -> Result<Group> {
        let rows: Vec<Group> = self
            .state
            .read()
            .groups
            .values()
            .filter(|group| group.name == name)
            .cloned()
            .collect();
        exactly_one(rows, "group", "name", name)
    }

    async fn create_group(&self, name: &str, inherit: Option<GroupId>) -> Result<Group> {
        let mut state = self.state.write();
        let id = state.next_group_id;
        state.next_group_id += 1;
        let group = Group {
            id,
            name: name.to_string(),
            inherit,
        };
        state.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let mut state = self.state.write();
        match state.groups.get_mut(&group.id) {
            Some(stored) => {
                *stored = group.clone();
                Ok(())
            }
            None => Err(AclError::not_found("group", "id", group.id)),
        }
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        let mut state = self.state.write();
        state.memberships.retain(|(_, gid)| *gid != id);
        state.groups.remove(&id);
        Ok(())
    }

    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<Member<Group>>> {
        let state = self.state.read();
        Ok(state
            .memberships
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, gid)| match state.groups.get(gid) {
                Some(group) => Member::Resolved(group.clone()),
                None => Member::Dangling(*gid),
            })
            .collect())
    }

    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<Member<User>>> {
        let state = self.state.read();
        Ok(state
            .memberships
            .iter()
            .filter(|(_, gid)| *gid == group_id)
            .map(|(uid, _)| match state.users.get(uid) {
                Some(user) => Member::Resolved(user.clone()),
                None => Member::Dangling(*uid),
            })
            .collect())
    }

    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.state.write().memberships.push((user_id, group_id));
        Ok(())
    }

    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.state
            .write()
            .memberships
            .retain(|membership| *membership != (user_id, group_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_facts_keep_duplicates() {
        let store = InMemoryAccessStore::new();
        let alice = SubjectKey::user(3);

        store.create(alice, "print", false, 0).await.unwrap();
        store.create(alice, "print", false, 0).await.unwrap();
        store.create(SubjectKey::group(3), "print", true, 0).await.unwrap();

        let facts = store.facts_for(alice).await.unwrap();
        assert_eq!(facts.len(), 2);
        assert!(facts.iter().all(|fact| fact.subject == alice));
    }

    #[tokio::test]
    async fn test_delete_matches_all_fields() {
        let store = InMemoryAccessStore::new();
        let alice = SubjectKey::user(3);

        store.create(alice, "print", false, 0).await.unwrap();
        let high = store.create(alice, "print", false, 1).await.unwrap();

        store.delete(&high).await.unwrap();
        let facts = store.facts_for(alice).await.unwrap();
        assert_eq!(facts, vec![AccessFact::grant(alice, "print")]);

        // Deleting something that is not stored is silent
        store.delete(&high).await.unwrap();
        store
            .delete(&AccessFact::revoke(alice, "print"))
            .await
            .unwrap();
        assert_eq!(store.fact_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_name_distinguishes_missing_and_ambiguous() {
        let store = InMemoryAccessStore::new();
        store
            .create_user(NewUser::new("doe", "h1", "jane@example.edu", 0.0))
            .await
            .unwrap();
        store
            .create_user(NewUser::new("doe", "h2", "john@example.edu", 0.0))
            .await
            .unwrap();

        let err = store.user_by_name("doe").await.unwrap_err();
        assert!(matches!(err, AclError::Ambiguous { count: 2, .. }));

        let err = store.user_by_name("roe").await.unwrap_err();
        assert!(err.is_not_found());

        let john = store.user_by_email("john@example.edu").await.unwrap();
        assert_eq!(john.password_hash, "h2");
    }

    #[tokio::test]
    async fn test_memberships_report_dangling_targets() {
        let store = InMemoryAccessStore::new();
        let user = store
            .create_user(NewUser::new("alice", "h", "alice@example.edu", 10.0))
            .await
            .unwrap();
        let staff = store.create_group("staff", None).await.unwrap();

        store.add_membership(user.id, staff.id).await.unwrap();
        store.add_membership(user.id, 99).await.unwrap();

        let groups = store.groups_of_user(user.id).await.unwrap();
        assert_eq!(groups, vec![Member::Resolved(staff.clone()), Member::Dangling(99)]);

        store.remove_membership(user.id, 99).await.unwrap();
        assert_eq!(store.groups_of_user(user.id).await.unwrap().len(), 1);

        let users = store.users_of_group(staff.id).await.unwrap();
        assert_eq!(users.len(), 1);

        store.delete_group(staff.id).await.unwrap();
        assert!(store.groups_of_user(user.id).await.unwrap().is_empty());
        assert!(store.group_by_id(staff.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_user_persists_balance() {
        let store = InMemoryAccessStore::new();
        let mut user = store
            .create_user(NewUser::new("alice", "h", "alice@example.edu", 10.0))
            .await
            .unwrap();

        user.balance += 20.0;
        store.update_user(&user).await.unwrap();

        let stored = store.user_by_id(user.id).await.unwrap();
        assert_eq!(stored.balance, 30.0);
        assert_eq!(store.all_users().await.unwrap().len(), 1);
    }
}
