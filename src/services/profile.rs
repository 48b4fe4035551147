use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::types::AVATARS_BUCKET;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::models::{Profile, ProfileUpdate, Role};

/// Lowercased handle without `@` or whitespace
pub fn clean_username(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '@' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn content_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Editable profile fields as entered in the form
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileForm {
    pub full_name: String,
    pub username: String,
    pub phone: String,
    pub city: String,
    pub role: Role,
}

pub struct ProfileService {
    backend: Arc<dyn Backend>,
    user_id: String,
}

impl ProfileService {
    pub fn new(backend: Arc<dyn Backend>, user_id: impl Into<String>) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
        }
    }

    pub async fn view(&self, id: &str) -> Result<Profile> {
        self.backend
            .get_profile(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("profile {}", id)))
    }

    pub async fn me(&self) -> Result<Profile> {
        self.view(&self.user_id).await
    }

    /// Save the form, refusing a username or full name already used by someone else
    pub async fn update(&self, form: &ProfileForm) -> Result<Profile> {
        let username = clean_username(&form.username);
        let full_name = form.full_name.trim().to_string();
        if full_name.is_empty() || username.is_empty() {
            return Err(Error::Validation("full name and username are required".to_string()));
        }

        if let Some(existing) = self
            .backend
            .find_profile_conflict(&self.user_id, &username, &full_name)
            .await?
        {
            if existing.username.as_deref() == Some(username.as_str()) {
                return Err(Error::Conflict("This username is already taken".to_string()));
            }
            if existing.full_name == full_name {
                return Err(Error::Conflict("This full name is already registered to someone else".to_string()));
            }
        }

        let saved = self
            .backend
            .upsert_profile(&ProfileUpdate {
                id: self.user_id.clone(),
                full_name,
                username,
                phone: form.phone.trim().to_string(),
                city: form.city.trim().to_string(),
                role: form.role,
                updated_at: Utc::now(),
            })
            .await?;
        info!("Updated profile {}", saved.id);
        Ok(saved)
    }

    /// Upload an avatar image and point the profile at its public URL
    pub async fn upload_avatar(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let path = format!("{}/{}.{}", self.user_id, Utc::now().timestamp_millis(), extension);

        self.backend
            .upload_object(AVATARS_BUCKET, &path, bytes, content_type_for(extension))
            .await?;
        let url = self.backend.public_url(AVATARS_BUCKET, &path);
        self.backend.set_avatar_url(&self.user_id, &url).await?;
        info!("Avatar for {} stored at {}", self.user_id, path);
        Ok(url)
    }
}
