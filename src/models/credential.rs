use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedString;

/// Registry credential declared by a user at application scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppUserCredential {
    pub id: Uuid,
    pub application_id: Uuid,
    pub name: String,
    pub username: String,
    pub password: EncryptedString,
    #[serde(default)]
    pub description: String,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Pull credential of one registry, projected into a WlApp's namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppImageCredential {
    pub id: Uuid,
    pub wl_app_id: Uuid,
    pub registry: String,
    pub username: String,
    pub password: EncryptedString,
    pub tenant_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// An image and the user credential used to pull it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageCredentialRef {
    pub image: String,
    pub credential_name: String,
}

impl ImageCredentialRef {
    /// Registry host of the image; Docker Hub when the first segment is not a host
    pub fn registry(&self) -> String {
        registry_of(&self.image)
    }
}

pub fn registry_of(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => "docker.io".to_string(),
    }
}
