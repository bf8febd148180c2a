use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AppError, storage::StorageClient};

/// Largest accepted avatar.
pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;

/// An image taken from the multipart `avatar` field.
#[derive(Debug, Clone)]
pub struct AvatarUpload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl AvatarUpload {
    /// Extension and content type must both name png/jpg/jpeg. Returns the
    /// extension to store under.
    pub fn validate(&self) -> Result<&'static str, AppError> {
        let ext = self
            .file_name
            .as_deref()
            .and_then(|n| n.rsplit_once('.'))
            .and_then(|(_, ext)| ext_from_name(ext));
        let mime_ok = self.content_type.as_deref().is_some_and(is_allowed_mime);

        let Some(ext) = ext.filter(|_| mime_ok) else {
            return Err(AppError::bad_request(
                "Only .png, .jpg, and .jpeg format allowed!",
            ));
        };
        if self.body.is_empty() {
            return Err(AppError::bad_request("Avatar file is empty"));
        }
        if self.body.len() > MAX_AVATAR_BYTES {
            return Err(AppError::bad_request("File size must not exceed 5MB"));
        }
        Ok(ext)
    }
}

fn ext_from_name(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("png"),
        "jpg" => Some("jpg"),
        "jpeg" => Some("jpeg"),
        _ => None,
    }
}

fn is_allowed_mime(ct: &str) -> bool {
    matches!(
        ct.to_ascii_lowercase().as_str(),
        "image/png" | "image/jpeg" | "image/jpg"
    )
}

/// Validates and stores the avatar. Returns the storage key.
pub async fn store_avatar(
    storage: &dyn StorageClient,
    upload: AvatarUpload,
) -> Result<String, AppError> {
    let ext = upload.validate()?;
    let key = format!("avatars/{}.{}", Uuid::new_v4(), ext);
    let content_type = upload.content_type.as_deref().unwrap_or("application/octet-stream");
    storage
        .put_object(&key, upload.body, content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;
    debug!(%key, "avatar stored");
    Ok(key)
}

/// Best effort; a leftover file is only logged.
pub async fn discard_avatar(storage: &dyn StorageClient, key: &str) {
    if let Err(e) = storage.delete_object(key).await {
        warn!(error = %e, %key, "failed to delete avatar");
    }
}
