//! Shared certificates for routed hosts

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use super::render::{desired_hash, DESIRED_HASH_ANNOTATION};
use crate::cluster::resources::{object_meta, KubeResource};
use crate::cluster::{KubeClient, KubeError};
use crate::crypto::{CipherError, CipherManager};
use crate::models::AppDomainSharedCert;

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Certificate whose CN patterns match `host` most specifically
pub fn pick_cert<'a>(
    certs: &'a [AppDomainSharedCert],
    host: &str,
) -> Option<&'a AppDomainSharedCert> {
    certs
        .iter()
        .filter_map(|c| c.match_len(host).map(|len| (len, c)))
        .max_by(|(a, ca), (b, cb)| a.cmp(b).then_with(|| cb.name.cmp(&ca.name)))
        .map(|(_, c)| c)
}

pub fn tls_secret(
    cert: &AppDomainSharedCert,
    namespace: &str,
    labels: BTreeMap<String, String>,
    cipher: &CipherManager,
) -> Result<Secret, CipherError> {
    let mut data = BTreeMap::new();
    data.insert(
        "tls.crt".to_string(),
        ByteString(cert.cert_data.clone().into_bytes()),
    );
    data.insert(
        "tls.key".to_string(),
        ByteString(cert.key_data.reveal(cipher)?.into_bytes()),
    );
    if let Some(ca) = &cert.ca_data {
        data.insert("ca.crt".to_string(), ByteString(ca.clone().into_bytes()));
    }
    let mut secret = Secret {
        metadata: object_meta(cert.secret_name(), Some(namespace), labels),
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    };
    let hash = desired_hash(&secret.data);
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DESIRED_HASH_ANNOTATION.to_string(), hash);
    Ok(secret)
}

/// Write `secret` unless the live copy already carries the same content
///
/// Returns whether a write happened.
pub async fn ensure_secret(
    client: &KubeClient,
    namespace: &str,
    secret: &Secret,
) -> Result<bool, KubeError> {
    let want = secret.annotation(DESIRED_HASH_ANNOTATION);
    let live = client.get_opt::<Secret>(namespace, secret.name()).await?;
    if let Some(live) = &live {
        if live.annotation(DESIRED_HASH_ANNOTATION) == want {
            return Ok(false);
        }
    }
    client.create_or_replace(namespace, secret).await?;
    tracing::info!(namespace, secret = %secret.name(), "wrote shared cert secret");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherAlgorithm, EncryptedString};
    use chrono::Utc;

    fn cert(cipher: &CipherManager, name: &str, cns: &[&str]) -> AppDomainSharedCert {
        AppDomainSharedCert {
            name: name.into(),
            cert_data: "CERT".into(),
            key_data: EncryptedString::seal(cipher, "KEY").unwrap(),
            ca_data: None,
            auto_match_cns: cns.iter().map(|s| s.to_string()).collect(),
            tenant_id: "default".into(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn test_longest_match_wins() {
        let cipher = CipherManager::new("k", CipherAlgorithm::BkCrypt).unwrap();
        let certs = vec![
            cert(&cipher, "wide", &["*.example.com"]),
            cert(&cipher, "exact", &["api.example.com"]),
        ];
        assert_eq!(pick_cert(&certs, "api.example.com").unwrap().name, "exact");
        assert_eq!(pick_cert(&certs, "www.example.com").unwrap().name, "wide");
        assert!(pick_cert(&certs, "example.org").is_none());
    }

    #[test]
    fn test_secret_carries_decrypted_key() {
        let cipher = CipherManager::new("k", CipherAlgorithm::BkCrypt).unwrap();
        let secret = tls_secret(&cert(&cipher, "a", &["x"]), "ns", BTreeMap::new(), &cipher).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("eng-shared-a"));
        let data = secret.data.unwrap();
        assert_eq!(data["tls.key"].0, b"KEY".to_vec());
        assert!(secret.metadata.annotations.unwrap().contains_key(DESIRED_HASH_ANNOTATION));
    }
}
