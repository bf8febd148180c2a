use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    repo::UserStore,
    repo_types::{NewUser, ProfileUpdate, User},
};
use crate::error::StoreError;

/// `UserStore` over a mutex-guarded map. Same uniqueness and atomicity rules
/// as the Postgres store.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct record access for tests that need to age a code or token.
    pub async fn modify<F: FnOnce(&mut User)>(&self, id: Uuid, f: F) {
        if let Some(user) = self.users.lock().await.get_mut(&id) {
            f(user);
        }
    }
}

fn missing(id: Uuid) -> StoreError {
    StoreError::Other(anyhow::anyhow!("user {id} not found"))
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().await;
        Ok(users
            .values()
            .find(|u| {
                u.reset_password_token_hash.as_deref() == Some(token_hash)
                    && u.reset_password_expire.is_some_and(|exp| exp > now)
            })
            .cloned())
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.lock().await;
        if users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Duplicate);
        }
        if new.name.is_empty() {
            return Err(StoreError::Invalid("name is required".into()));
        }
        let user = User {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            password_hash: new.password_hash,
            avatar_path: new.avatar_path,
            is_verified: false,
            verification_code_hash: Some(new.verification_code_hash),
            verification_expire: Some(new.verification_expire),
            reset_password_token_hash: None,
            reset_password_expire: None,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_verification(
        &self,
        id: Uuid,
        code_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let user = users.get_mut(&id).ok_or_else(|| missing(id))?;
        user.verification_code_hash = Some(code_hash.to_string());
        user.verification_expire = Some(expire);
        Ok(())
    }

    async fn clear_verification(&self, id: Uuid) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let user = users.get_mut(&id).ok_or_else(|| missing(id))?;
        user.verification_code_hash = None;
        user.verification_expire = None;
        Ok(())
    }

    async fn mark_verified(
        &self,
        id: Uuid,
        code_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(&id).filter(|u| {
            u.verification_code_hash.as_deref() == Some(code_hash)
                && u.verification_expire.is_some_and(|exp| exp > now)
        }) else {
            return Ok(None);
        };
        user.is_verified = true;
        user.verification_code_hash = None;
        user.verification_expire = None;
        Ok(Some(user.clone()))
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock().await;
        if let Some(email) = &update.email {
            if users.values().any(|u| u.id != id && &u.email == email) {
                return Err(StoreError::Duplicate);
            }
        }
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(hash) = update.password_hash {
            user.password_hash = hash;
        }
        if let Some(path) = update.avatar_path {
            user.avatar_path = Some(path);
        }
        Ok(Some(user.clone()))
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expire: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let user = users.get_mut(&id).ok_or_else(|| missing(id))?;
        user.reset_password_token_hash = Some(token_hash.to_string());
        user.reset_password_expire = Some(expire);
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        if let Some(user) = users.get_mut(&id) {
            if user.reset_password_token_hash.as_deref() == Some(token_hash) {
                user.reset_password_token_hash = None;
                user.reset_password_expire = None;
            }
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock().await;
        let Some(user) = users.values_mut().find(|u| {
            u.reset_password_token_hash.as_deref() == Some(token_hash)
                && u.reset_password_expire.is_some_and(|exp| exp > now)
        }) else {
            return Ok(None);
        };
        user.password_hash = new_password_hash.to_string();
        user.reset_password_token_hash = None;
        user.reset_password_expire = None;
        Ok(Some(user.clone()))
    }
}
