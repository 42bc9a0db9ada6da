//! Image pull credentials of workload namespaces
//!
//! Credentials are a projection of the reference set: every flush rebuilds
//! the `AppImageCredential` rows (one per registry) and the namespace pull
//! secret from scratch. Nothing is edited in place.
//!
//! ```text
//! refs ──► resolve AppUserCredential ──► rows per registry ──► dockerconfigjson
//!           (MissingImageCredential)      (stale rows dropped)   (create_or_replace)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde_json::json;
use uuid::Uuid;

use crate::cluster::resources::object_meta;
use crate::cluster::{apply_with_retry, KubeClient, RetryPolicy};
use crate::crypto::{CipherManager, EncryptedString};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AppImageCredential, AppType, AppUserCredential, Application, ImageCredentialRef, MapperVersion,
    Module, WlApp,
};
use crate::store::Store;

/// Name of the managed pull secret in every workload namespace
// Every registry the env references lands in this one secret's `auths`
pub const PULL_SECRET_NAME: &str = "bkapp-image-credentials";

/// Model annotation prefix naming the credential of one process
pub const ANNOTATION_PREFIX: &str = "bkpaas.image-credentials/";

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Resolved username and password for one registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub registry: String,
    pub username: String,
    pub password: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Credential references declared for `image`
///
/// Cloud-native modules name one credential per process through model
/// annotations; the referenced set is their union. Other modules carry a
/// single name in the build config.
pub fn discover_refs(app_type: AppType, module: &Module, image: &str) -> Vec<ImageCredentialRef> {
    let names: BTreeSet<String> = match app_type {
        AppType::CloudNative => module
            .model_annotations
            .iter()
            .filter(|(key, _)| key.starts_with(ANNOTATION_PREFIX))
            .map(|(_, name)| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        _ => module
            .build_config
            .image_credential_name
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
    };
    names
        .into_iter()
        .map(|credential_name| ImageCredentialRef {
            image: image.to_string(),
            credential_name,
        })
        .collect()
}

/// Whether `module` references the user credential `name`
pub fn module_references(module: &Module, name: &str) -> bool {
    module.build_config.image_credential_name.as_deref() == Some(name)
        || module
            .model_annotations
            .iter()
            .any(|(key, value)| key.starts_with(ANNOTATION_PREFIX) && value == name)
}

/// `.dockerconfigjson` payload with one `auths` entry per registry
pub fn docker_config(auths: &[RegistryAuth]) -> serde_json::Value {
    let entries: serde_json::Map<String, serde_json::Value> = auths
        .iter()
        .map(|a| {
            let token = STANDARD.encode(format!("{}:{}", a.username, a.password));
            (
                a.registry.clone(),
                json!({"username": a.username, "password": a.password, "auth": token}),
            )
        })
        .collect();
    json!({ "auths": entries })
}

pub fn pull_secret(
    wl_app: &WlApp,
    mapper: MapperVersion,
    auths: &[RegistryAuth],
) -> Secret {
    let payload = docker_config(auths).to_string();
    Secret {
        metadata: object_meta(
            PULL_SECRET_NAME,
            Some(&wl_app.namespace()),
            mapper.owner_labels(wl_app),
        ),
        type_: Some(DOCKER_CONFIG_TYPE.to_string()),
        data: Some(
            [(DOCKER_CONFIG_KEY.to_string(), ByteString(payload.into_bytes()))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

pub struct ImageCredentialManager {
    store: Arc<Store>,
    cipher: Arc<CipherManager>,
    retry: RetryPolicy,
}

impl ImageCredentialManager {
    pub fn new(store: Arc<Store>, cipher: Arc<CipherManager>, retry: RetryPolicy) -> Self {
        Self {
            store,
            cipher,
            retry,
        }
    }

    /// Resolve refs to registry auths, first reference per registry wins
    pub fn resolve(
        &self,
        application: &Application,
        refs: &[ImageCredentialRef],
    ) -> EngineResult<Vec<RegistryAuth>> {
        let mut by_registry: BTreeMap<String, RegistryAuth> = BTreeMap::new();
        let mut sorted: Vec<&ImageCredentialRef> = refs.iter().collect();
        sorted.sort();
        for r in sorted {
            let credential = self
                .store
                .user_credential(application.id, &r.credential_name)
                .ok_or_else(|| EngineError::MissingImageCredential(r.credential_name.clone()))?;
            let registry = r.registry();
            if by_registry.contains_key(&registry) {
                continue;
            }
            by_registry.insert(
                registry.clone(),
                RegistryAuth {
                    registry,
                    username: credential.username.clone(),
                    password: credential.password.reveal(&self.cipher)?,
                },
            );
        }
        Ok(by_registry.into_values().collect())
    }

    /// Rebuild rows and the namespace secret from `refs`
    pub async fn flush_from_refs(
        &self,
        client: &KubeClient,
        application: &Application,
        wl_app: &WlApp,
        mapper: MapperVersion,
        refs: &[ImageCredentialRef],
    ) -> EngineResult<Vec<AppImageCredential>> {
        let auths = self.resolve(application, refs)?;
        let rows = self.sync_rows(wl_app, &auths)?;

        let secret = pull_secret(wl_app, mapper, &auths);
        let namespace = wl_app.namespace();
        apply_with_retry(client, wl_app, &self.retry, "pull secret", || {
            client.create_or_replace(&namespace, &secret)
        })
        .await?;

        tracing::info!(
            wl_app = %wl_app.name,
            registries = rows.len(),
            "flushed image credentials"
        );
        Ok(rows)
    }

    fn sync_rows(
        &self,
        wl_app: &WlApp,
        auths: &[RegistryAuth],
    ) -> EngineResult<Vec<AppImageCredential>> {
        let wanted: BTreeSet<&str> = auths.iter().map(|a| a.registry.as_str()).collect();
        let stale = self
            .store
            .image_credentials
            .remove_where(|c| c.wl_app_id == wl_app.id && !wanted.contains(c.registry.as_str()));
        for row in stale {
            tracing::debug!(wl_app = %wl_app.name, registry = %row.registry, "removed stale image credential");
        }

        let existing: BTreeMap<String, AppImageCredential> = self
            .store
            .image_credentials_of(wl_app.id)
            .into_iter()
            .map(|c| (c.registry.clone(), c))
            .collect();
        let now = Utc::now();
        for auth in auths {
            let password = EncryptedString::seal(&self.cipher, &auth.password)?;
            let row = match existing.get(&auth.registry) {
                Some(current) => AppImageCredential {
                    username: auth.username.clone(),
                    password,
                    ..current.clone()
                },
                None => AppImageCredential {
                    id: Uuid::new_v4(),
                    wl_app_id: wl_app.id,
                    registry: auth.registry.clone(),
                    username: auth.username.clone(),
                    password,
                    tenant_id: wl_app.tenant_id.clone(),
                    created: now,
                    updated: now,
                },
            };
            self.store.image_credentials.upsert(row)?;
        }
        Ok(self.store.image_credentials_of(wl_app.id))
    }

    /// Create or rotate the user credential `name` of an application
    pub fn upsert_user_credential(
        &self,
        application: &Application,
        name: &str,
        username: &str,
        password: &str,
        description: &str,
    ) -> EngineResult<AppUserCredential> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::field("name", "credential name is required"));
        }
        if username.is_empty() || password.is_empty() {
            return Err(EngineError::field("password", "username and password are required"));
        }
        let password = EncryptedString::seal(&self.cipher, password)?;
        let now = Utc::now();
        let credential = match self.store.user_credential(application.id, name) {
            Some(current) => AppUserCredential {
                username: username.to_string(),
                password,
                description: description.to_string(),
                ..current
            },
            None => AppUserCredential {
                id: Uuid::new_v4(),
                application_id: application.id,
                name: name.to_string(),
                username: username.to_string(),
                password,
                description: description.to_string(),
                tenant_id: application.tenant_id.clone(),
                created: now,
                updated: now,
            },
        };
        let credential = self.store.user_credentials.upsert(credential)?;
        tracing::info!(app = %application.code, credential = name, "user credential saved");
        Ok(credential)
    }

    /// Delete a user credential no module references
    pub fn delete_user_credential(&self, application: &Application, name: &str) -> EngineResult<()> {
        let credential = self
            .store
            .user_credential(application.id, name)
            .ok_or_else(|| EngineError::not_found(format!("credential {}", name)))?;
        if let Some(module) = self
            .store
            .modules_of(application.id)
            .into_iter()
            .find(|m| module_references(m, name))
        {
            return Err(EngineError::conflict(
                "CREDENTIAL_IN_USE",
                format!("credential '{}' is used by module '{}'", name, module.name),
            ));
        }
        self.store.user_credentials.remove(&credential.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryApiServer;
    use crate::crypto::CipherAlgorithm;
    use crate::models::{AppUserCredential, BuildConfig, Environment, SourceOrigin};

    struct Fixture {
        store: Arc<Store>,
        cipher: Arc<CipherManager>,
        application: Application,
        wl_app: WlApp,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::new());
        let cipher = Arc::new(CipherManager::new("test", CipherAlgorithm::BkCrypt).unwrap());
        let now = Utc::now();
        let application = Application {
            id: Uuid::new_v4(),
            code: "foo".into(),
            name: "foo".into(),
            region: "r1".into(),
            app_type: AppType::Default,
            secret: EncryptedString::seal(&cipher, "s").unwrap(),
            tenant_id: "default".into(),
            created: now,
            updated: now,
        };
        let wl_app = WlApp {
            id: Uuid::new_v4(),
            region: "r1".into(),
            name: "bkapp-foo-stag".into(),
            app_type: AppType::Default,
            app_code: "foo".into(),
            module_name: "default".into(),
            environment: Environment::Stag,
            tenant_id: "default".into(),
            created: now,
            updated: now,
        };
        Fixture {
            store,
            cipher,
            application,
            wl_app,
        }
    }

    fn add_credential(f: &Fixture, name: &str, password: &str) {
        let now = Utc::now();
        let existing = f.store.user_credential(f.application.id, name);
        f.store
            .user_credentials
            .upsert(AppUserCredential {
                id: existing.map(|c| c.id).unwrap_or_else(Uuid::new_v4),
                application_id: f.application.id,
                name: name.into(),
                username: "robot".into(),
                password: EncryptedString::seal(&f.cipher, password).unwrap(),
                description: String::new(),
                tenant_id: "default".into(),
                created: now,
                updated: now,
            })
            .unwrap();
    }

    fn reference(image: &str, name: &str) -> ImageCredentialRef {
        ImageCredentialRef {
            image: image.into(),
            credential_name: name.into(),
        }
    }

    fn secret_payload(server: &MemoryApiServer) -> serde_json::Value {
        let secret: Secret = serde_json::from_value(
            server
                .object("secrets", "bkapp-foo-stag", PULL_SECRET_NAME)
                .unwrap(),
        )
        .unwrap();
        let raw = &secret.data.unwrap()[DOCKER_CONFIG_KEY];
        serde_json::from_slice(&raw.0).unwrap()
    }

    fn module(app_type_annotations: &[(&str, &str)], credential: Option<&str>) -> Module {
        let now = Utc::now();
        Module {
            id: Uuid::new_v4(),
            application_id: Uuid::new_v4(),
            name: "default".into(),
            is_default: true,
            source_origin: SourceOrigin::AuthorizedVcs,
            build_config: BuildConfig {
                image_credential_name: credential.map(str::to_string),
                ..Default::default()
            },
            pre_release_hook: None,
            model_annotations: app_type_annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tenant_id: "default".into(),
            created: now,
            updated: now,
        }
    }

    #[test]
    fn test_discover_refs() {
        let cnative = module(
            &[
                ("bkpaas.image-credentials/web", "c1"),
                ("bkpaas.image-credentials/worker", "c1"),
                ("other", "x"),
            ],
            None,
        );
        let refs = discover_refs(AppType::CloudNative, &cnative, "r1.example.com/foo:1");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].credential_name, "c1");

        let legacy = module(&[], Some("c2"));
        let refs = discover_refs(AppType::Default, &legacy, "r1.example.com/foo:1");
        assert_eq!(refs[0].credential_name, "c2");
        assert!(discover_refs(AppType::Default, &module(&[], None), "img").is_empty());
        assert!(module_references(&cnative, "c1"));
        assert!(!module_references(&cnative, "x"));
    }

    #[tokio::test]
    async fn test_missing_credential_fails() {
        let f = fixture();
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server);
        let manager = ImageCredentialManager::new(f.store.clone(), f.cipher.clone(), RetryPolicy::default());
        let err = manager
            .flush_from_refs(
                &client,
                &f.application,
                &f.wl_app,
                MapperVersion::V2,
                &[reference("r1.example.com/foo:1", "nope")],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_IMAGE_CREDENTIAL");
    }

    #[tokio::test]
    async fn test_rotation_rewrites_secret_and_drops_stale_registries() {
        let f = fixture();
        add_credential(&f, "c1", "old");
        add_credential(&f, "c2", "other");
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let manager = ImageCredentialManager::new(f.store.clone(), f.cipher.clone(), RetryPolicy::default());

        let refs = vec![
            reference("r1.example.com/foo:1", "c1"),
            reference("r2.example.com/foo:1", "c2"),
        ];
        let rows = manager
            .flush_from_refs(&client, &f.application, &f.wl_app, MapperVersion::V2, &refs)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(server.objects("secrets", &f.wl_app.namespace()).len(), 1);
        let payload = secret_payload(&server);
        assert_eq!(payload["auths"]["r1.example.com"]["password"], "old");
        assert_eq!(payload["auths"]["r2.example.com"]["password"], "other");

        add_credential(&f, "c1", "new");
        let rows = manager
            .flush_from_refs(&client, &f.application, &f.wl_app, MapperVersion::V2, &refs[..1])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].registry, "r1.example.com");
        let payload = secret_payload(&server);
        assert_eq!(payload["auths"]["r1.example.com"]["password"], "new");
        assert!(payload["auths"].get("r2.example.com").is_none());
        let expected = STANDARD.encode("robot:new");
        assert_eq!(payload["auths"]["r1.example.com"]["auth"], expected.as_str());
    }

    #[tokio::test]
    async fn test_flush_is_deterministic() {
        let f = fixture();
        add_credential(&f, "c1", "pw");
        let server = Arc::new(MemoryApiServer::new("c1"));
        let client = KubeClient::new("c1", server.clone());
        let manager = ImageCredentialManager::new(f.store.clone(), f.cipher.clone(), RetryPolicy::default());
        let refs = vec![reference("r1.example.com/foo:1", "c1")];

        manager
            .flush_from_refs(&client, &f.application, &f.wl_app, MapperVersion::V2, &refs)
            .await
            .unwrap();
        let first = secret_payload(&server);
        manager
            .flush_from_refs(&client, &f.application, &f.wl_app, MapperVersion::V2, &refs)
            .await
            .unwrap();
        assert_eq!(secret_payload(&server), first);
        assert_eq!(f.store.image_credentials_of(f.wl_app.id).len(), 1);
    }
}
