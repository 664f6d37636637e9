use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AclError;

pub type UserId = i64;
pub type GroupId = i64;

/// The two kinds of entity that can own access facts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Group => "group",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SubjectKind::User),
            "group" => Ok(SubjectKind::Group),
            other => Err(AclError::StorageError(format!("Unknown subject kind: {}", other))),
        }
    }
}

/// Identifies a subject by kind and id; ids are unique within a kind only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub kind: SubjectKind,
    pub id: i64,
}

impl SubjectKey {
    pub fn user(id: UserId) -> Self {
        Self {
            kind: SubjectKind::User,
            id,
        }
    }

    pub fn group(id: GroupId) -> Self {
        Self {
            kind: SubjectKind::Group,
            id,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Account status codes as stored in the users table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    #[default]
    Normal,
    Disabled,
    Unverified,
    PwReset,
}

impl UserStatus {
    pub fn code(&self) -> i32 {
        match self {
            UserStatus::Normal => 0,
            UserStatus::Disabled => 1,
            UserStatus::Unverified => 2,
            UserStatus::PwReset => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(UserStatus::Normal),
            1 => Some(UserStatus::Disabled),
            2 => Some(UserStatus::Unverified),
            3 => Some(UserStatus::PwReset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub email: String,
    pub balance: f64,
    /// Share of the job cost charged to the user; may be negative
    pub overcharge: f64,
    pub vcode: Option<String>,
    pub status: UserStatus,
}

impl User {
    pub fn key(&self) -> SubjectKey {
        SubjectKey::user(self.id)
    }
}

/// Fields for a user row that has not been stored yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub balance: f64,
    pub overcharge: f64,
    pub vcode: Option<String>,
    pub status: UserStatus,
}

impl NewUser {
    pub fn new(username: &str, password_hash: &str, email: &str, balance: f64) -> Self {
        Self {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            email: email.to_string(),
            balance,
            overcharge: 1.0,
            vcode: None,
            status: UserStatus::Normal,
        }
    }

    pub fn with_status(mut self, status: UserStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_vcode(mut self, vcode: &str) -> Self {
        self.vcode = Some(vcode.to_string());
        self
    }

    pub fn into_user(self, id: UserId) -> User {
        User {
            id,
            username: self.username,
            password_hash: self.password_hash,
            email: self.email,
            balance: self.balance,
            overcharge: self.overcharge,
            vcode: self.vcode,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Parent group this group inherits facts from
    pub inherit: Option<GroupId>,
}

impl Group {
    pub fn key(&self) -> SubjectKey {
        SubjectKey::group(self.id)
    }
}

/// Result of following a membership relation. The target row may have been
/// deleted, in which case only its id is known.
#[derive(Debug, Clone, PartialEq)]
pub enum Member<T> {
    Resolved(T),
    Dangling(i64),
}

impl<T> Member<T> {
    pub fn is_dangling(&self) -> bool {
        matches!(self, Member::Dangling(_))
    }

    /// The resolved value, or [`AclError::DanglingReference`] naming `entity`
    pub fn require(self, entity: &'static str) -> crate::error::Result<T> {
        match self {
            Member::Resolved(value) => Ok(value),
            Member::Dangling(id) => Err(AclError::DanglingReference { entity, id }),
        }
    }
}

/// Anything with a numeric row id
pub trait Entity {
    fn entity_id(&self) -> i64;
}

impl Entity for User {
    fn entity_id(&self) -> i64 {
        self.id
    }
}

impl Entity for Group {
    fn entity_id(&self) -> i64 {
        self.id
    }
}

/// A loaded record or a bare id still to be looked up
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef<T> {
    Id(i64),
    Loaded(T),
}

pub type UserRef = EntityRef<User>;
pub type GroupRef = EntityRef<Group>;

impl<T: Entity> EntityRef<T> {
    pub fn id(&self) -> i64 {
        match self {
            EntityRef::Id(id) => *id,
            EntityRef::Loaded(entity) => entity.entity_id(),
        }
    }
}

impl<T> From<i64> for EntityRef<T> {
    fn from(id: i64) -> Self {
        EntityRef::Id(id)
    }
}

impl From<User> for UserRef {
    fn from(user: User) -> Self {
        EntityRef::Loaded(user)
    }
}

impl From<&User> for UserRef {
    fn from(user: &User) -> Self {
        EntityRef::Loaded(user.clone())
    }
}

impl From<Group> for GroupRef {
    fn from(group: Group) -> Self {
        EntityRef::Loaded(group)
    }
}

impl From<&Group> for GroupRef {
    fn from(group: &Group) -> Self {
        EntityRef::Loaded(group.clone())
    }
}

/// A user or group, loaded or by id
#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    User(UserRef),
    Group(GroupRef),
}

impl Subject {
    pub fn user(user: impl Into<UserRef>) -> Self {
        Subject::User(user.into())
    }

    pub fn group(group: impl Into<GroupRef>) -> Self {
        Subject::Group(group.into())
    }

    pub fn key(&self) -> SubjectKey {
        match self {
            Subject::User(user) => SubjectKey::user(user.id()),
            Subject::Group(group) => SubjectKey::group(group.id()),
        }
    }
}

impl From<User> for Subject {
    fn from(user: User) -> Self {
        Subject::user(user)
    }
}

impl From<&User> for Subject {
    fn from(user: &User) -> Self {
        Subject::user(user)
    }
}

impl From<Group> for Subject {
    fn from(group: Group) -> Self {
        Subject::group(group)
    }
}

impl From<&Group> for Subject {
    fn from(group: &Group) -> Self {
        Subject::group(group)
    }
}

impl From<SubjectKey> for Subject {
    fn from(key: SubjectKey) -> Self {
        match key.kind {
            SubjectKind::User => Subject::User(EntityRef::Id(key.id)),
            SubjectKind::Group => Subject::Group(EntityRef::Id(key.id)),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// One grant or revoke of a permission string for one subject.
///
/// Facts are immutable. Changing one means creating the replacement and
/// deleting the original; two facts that differ only in level are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFact {
    pub subject: SubjectKey,
    pub permission: String,
    #[serde(default)]
    pub revoke: bool,
    #[serde(default)]
    pub level: i32,
}

impl AccessFact {
    pub fn new(subject: SubjectKey, permission: &str, revoke: bool, level: i32) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            revoke,
            level,
        }
    }

    pub fn grant(subject: SubjectKey, permission: &str) -> Self {
        Self::new(subject, permission, false, 0)
    }

    pub fn revoke(subject: SubjectKey, permission: &str) -> Self {
        Self::new(subject, permission, true, 0)
    }

    pub fn at_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Ordering key used by reduction: a revoke outranks a grant at the same
    /// level, and any higher level outranks both.
    pub fn priority(&self) -> i64 {
        i64::from(self.level) * 2 + i64::from(self.revoke)
    }

    pub fn is_grant(&self) -> bool {
        !self.revoke
    }
}

impl fmt::Display for AccessFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @{}",
            self.subject,
            if self.revoke { "revoke" } else { "grant" },
            self.permission,
            self.level
        )
    }
}
