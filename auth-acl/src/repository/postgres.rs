//! PostgreSQL-backed access store
//!
//! Implements both [`FactRepository`] and [`EntityStore`] over the tables
//! created by `migrations/0001_access_control.sql`:
//! - `users` and `acgroups` hold the entity rows
//! - `acmembership` holds (user, group) pairs
//! - `acls` holds access facts, ordered by insertion `position`

use crate::{
    config::AclConfig,
    error::{AclError, Result},
    models::*,
    repository::{exactly_one, EntityStore, FactRepository},
};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, info};

const USER_COLUMNS: &str = "id, username, password, email, balance, overcharge, vcode, status";

/// PostgreSQL-backed fact repository and entity store
#[derive(Clone)]
pub struct PostgresAccessStore {
    pool: PgPool,
}

impl PostgresAccessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| AclError::StorageError(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Connect using `database_url` from the loaded configuration
    pub async fn from_config(config: &AclConfig) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| AclError::Configuration("database_url is not set".to_string()))?;
        Self::from_connection_string(url).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn users_where(&self, column: &str, value: &str) -> Result<Vec<User>> {
        let query = format!("SELECT {} FROM users WHERE {} = $1 ORDER BY id", USER_COLUMNS, column);
        let rows = sqlx::query(&query).bind(value).fetch_all(&self.pool).await?;
        rows.iter().map(user_from_row).collect()
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let code: i32 = row.try_get("status")?;
    let status = UserStatus::from_code(code)
        .ok_or_else(|| AclError::StorageError(format!("Unknown user status code: {}", code)))?;

    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password")?,
        email: row.try_get("email")?,
        balance: row.try_get("balance")?,
        overcharge: row.try_get("overcharge")?,
        vcode: row.try_get("vcode")?,
        status,
    })
}

fn group_from_row(row: &PgRow) -> Result<Group> {
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        inherit: row.try_get("inherit")?,
    })
}

fn fact_from_row(row: &PgRow) -> Result<AccessFact> {
    let kind: String = row.try_get("kind")?;
    Ok(AccessFact {
        subject: SubjectKey {
            kind: kind.parse()?,
            id: row.try_get("subject_id")?,
        },
        permission: row.try_get("access")?,
        revoke: row.try_get("revoke")?,
        level: row.try_get("level")?,
    })
}

#[async_trait]
impl FactRepository for PostgresAccessStore {
    async fn facts_for(&self, subject: SubjectKey) -> Result<Vec<AccessFact>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, subject_id, access, revoke, level
            FROM acls
            WHERE kind = $1 AND subject_id = $2
            ORDER BY position
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AclError::StorageError(format!("Failed to read facts for {}: {}", subject, e)))?;

        let facts = rows.iter().map(fact_from_row).collect::<Result<Vec<_>>>()?;
        debug!("Found {} facts for {}", facts.len(), subject);
        Ok(facts)
    }

    async fn create(
        &self,
        subject: SubjectKey,
        permission: &str,
        revoke: bool,
        level: i32,
    ) -> Result<AccessFact> {
        sqlx::query(
            r#"
            INSERT INTO acls (kind, subject_id, access, revoke, level)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(subject.kind.as_str())
        .bind(subject.id)
        .bind(permission)
        .bind(revoke)
        .bind(level)
        .execute(&self.pool)
        .await
        .map_err(|e| AclError::StorageError(format!("Failed to write fact: {}", e)))?;

        let fact = AccessFact::new(subject, permission, revoke, level);
        info!("Fact written: {}", fact);
        Ok(fact)
    }

    async fn delete(&self, fact: &AccessFact) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM acls
            WHERE kind = $1
              AND subject_id = $2
              AND access = $3
              AND revoke = $4
              AND level = $5
            "#,
        )
        .bind(fact.subject.kind.as_str())
        .bind(fact.subject.id)
        .bind(&fact.permission)
        .bind(fact.revoke)
        .bind(fact.level)
        .execute(&self.pool)
        .await
        .map_err(|e| AclError::StorageError(format!("Failed to delete fact: {}", e)))?;

        debug!("Deleted {} row(s) for fact: {}", result.rows_affected(), fact);
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PostgresAccessStore {
    async fn user_by_id(&self, id: UserId) -> Result<User> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => user_from_row(&row),
            None => Err(AclError::not_found("user", "id", id)),
        }
    }

    async fn user_by_name(&self, name: &str) -> Result<User> {
        let rows = self.users_where("username", name).await?;
        exactly_one(rows, "user", "name", name)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let rows = self.users_where("email", email).await?;
        exactly_one(rows, "user", "email", email)
    }

    async fn all_users(&self) -> Result<Vec<User>> {
        let query = format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, password, email, balance, overcharge, vcode, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(user.balance)
        .bind(user.overcharge)
        .bind(&user.vcode)
        .bind(user.status.code())
        .fetch_one(&self.pool)
        .await?;

        info!("User {} created", id);
        Ok(user.into_user(id))
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET username = $2, password = $3, email = $4, balance = $5,
                overcharge = $6, vcode = $7, status = $8
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(user.balance)
        .bind(user.overcharge)
        .bind(&user.vcode)
        .bind(user.status.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AclError::not_found("user", "id", user.id));
        }
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM acmembership WHERE uid = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("User {} deleted", id);
        Ok(())
    }

    async fn group_by_id(&self, id: GroupId) -> Result<Group> {
        let row = sqlx::query("SELECT id, name, inherit FROM acgroups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => group_from_row(&row),
            None => Err(AclError::not_found("group", "id", id)),
        }
    }

    async fn group_by_name(&self, name: &str) -> Result<Group> {
        let rows = sqlx::query("SELECT id, name, inherit FROM acgroups WHERE name = $1 ORDER BY id")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        let groups = rows.iter().map(group_from_row).collect::<Result<Vec<_>>>()?;
        exactly_one(groups, "group", "name", name)
    }

    async fn create_group(&self, name: &str, inherit: Option<GroupId>) -> Result<Group> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO acgroups (name, inherit) VALUES ($1, $2) RETURNING id",
        )
        .bind(name)
        .bind(inherit)
        .fetch_one(&self.pool)
        .await?;

        info!("Group {} created", id);
        Ok(Group {
            id,
            name: name.to_string(),
            inherit,
        })
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let result = sqlx::query("UPDATE acgroups SET name = $2, inherit = $3 WHERE id = $1")
            .bind(group.id)
            .bind(&group.name)
            .bind(group.inherit)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AclError::not_found("group", "id", group.id));
        }
        Ok(())
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM acmembership WHERE gid = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM acgroups WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Group {} deleted", id);
        Ok(())
    }

    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<Member<Group>>> {
        let rows = sqlx::query(
            r#"
            SELECT m.gid, g.id, g.name, g.inherit
            FROM acmembership m
            LEFT JOIN acgroups g ON g.id = m.gid
            WHERE m.uid = $1
            ORDER BY m.position
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Member<Group>> {
                let found: Option<i64> = row.try_get("id")?;
                match found {
                    Some(_) => Ok(Member::Resolved(group_from_row(row)?)),
                    None => Ok(Member::Dangling(row.try_get("gid")?)),
                }
            })
            .collect()
    }

    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<Member<User>>> {
        let rows = sqlx::query(
            r#"
            SELECT m.uid, u.id, u.username, u.password, u.email, u.balance,
                   u.overcharge, u.vcode, u.status
            FROM acmembership m
            LEFT JOIN users u ON u.id = m.uid
            WHERE m.gid = $1
            ORDER BY m.position
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Member<User>> {
                let found: Option<i64> = row.try_get("id")?;
                match found {
                    Some(_) => Ok(Member::Resolved(user_from_row(row)?)),
                    None => Ok(Member::Dangling(row.try_get("uid")?)),
                }
            })
            .collect()
    }

    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        sqlx::query("INSERT INTO acmembership (gid, uid) VALUES ($1, $2)")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        sqlx::query("DELETE FROM acmembership WHERE gid = $1 AND uid = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
