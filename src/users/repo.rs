use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{NewUser, ProfileUpdate, User};
use crate::error::StoreError;

/// Persistence for user records. Email is unique across records and every
/// method is a single-record atomic write or read.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    /// Record whose reset token digest matches and has not expired at `now`.
    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;
    async fn set_verification(
        &self,
        id: Uuid,
        code_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError>;
    async fn clear_verification(&self, id: Uuid) -> Result<(), StoreError>;
    /// Sets `is_verified` and clears the code in one write, only while the
    /// stored code is still `code_hash` and unexpired at `now`.
    async fn mark_verified(
        &self,
        id: Uuid,
        code_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;
    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, StoreError>;
    /// Overwrites any earlier reset token.
    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError>;
    /// Clears the reset fields only while they still hold `token_hash`.
    async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> Result<(), StoreError>;
    /// Swaps the password and clears the reset fields if the token is still
    /// valid. `None` means another request consumed it first or it expired.
    async fn consume_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;
}

const USER_COLUMNS: &str = "id, name, email, password_hash, avatar_path, is_verified, \
     verification_code_hash, verification_expire, \
     reset_password_token_hash, reset_password_expire, created_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
              FROM users
             WHERE reset_password_token_hash = $1
               AND reset_password_expire > $2
            "#
        ))
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (name, email, password_hash, avatar_path,
                               verification_code_hash, verification_expire)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.avatar_path)
        .bind(&user.verification_code_hash)
        .bind(user.verification_expire)
        .fetch_one(&self.db)
        .await?;
        Ok(created)
    }

    async fn set_verification(
        &self,
        id: Uuid,
        code_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET verification_code_hash = $2, verification_expire = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(code_hash)
        .bind(expire)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn clear_verification(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET verification_code_hash = NULL, verification_expire = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_verified(
        &self,
        id: Uuid,
        code_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET is_verified = TRUE,
                   verification_code_hash = NULL,
                   verification_expire = NULL
             WHERE id = $1
               AND verification_code_hash = $2
               AND verification_expire > $3
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(code_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET name          = COALESCE($2, name),
                   email         = COALESCE($3, email),
                   password_hash = COALESCE($4, password_hash),
                   avatar_path   = COALESCE($5, avatar_path)
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.name)
        .bind(update.email)
        .bind(update.password_hash)
        .bind(update.avatar_path)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET reset_password_token_hash = $2, reset_password_expire = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(expire)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET reset_password_token_hash = NULL, reset_password_expire = NULL
             WHERE id = $1 AND reset_password_token_hash = $2
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET password_hash = $2,
                   reset_password_token_hash = NULL,
                   reset_password_expire = NULL
             WHERE reset_password_token_hash = $1
               AND reset_password_expire > $3
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(token_hash)
        .bind(new_password_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }
}
