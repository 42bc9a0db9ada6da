//! Host, path and object names of an environment's routes

use sha2::{Digest, Sha256};

use crate::models::{Application, Cluster, Environment, Module, WlApp};

/// `<region>-<app>-<env>`, with `-m-<module>` before the env for non-default modules
pub fn env_prefix(application: &Application, module: &Module, env: Environment) -> String {
    if module.is_default {
        format!("{}-{}-{}", application.region, application.code, env)
    } else {
        format!(
            "{}-{}-m-{}-{}",
            application.region, application.code, module.name, env
        )
    }
}

pub fn sub_path(prefix: &str) -> String {
    format!("/{}/", prefix)
}

/// Built-in hosts of a `SUBDOMAIN` cluster with their https flag
pub fn subdomain_hosts(cluster: &Cluster, prefix: &str) -> Vec<(String, bool)> {
    cluster
        .ingress_config
        .app_root_domains
        .iter()
        .map(|root| (format!("{}.{}", prefix, root.name), root.https_enabled))
        .collect()
}

pub fn subdomain_ingress_name(wl_app: &WlApp, host: &str) -> String {
    format!("{}--{}", wl_app.scheduler_safe_name(), host)
}

pub fn subpath_ingress_name(wl_app: &WlApp, host: &str) -> String {
    format!("{}--subpath--{}", wl_app.scheduler_safe_name(), host)
}

/// First eight hex digits of the path prefix digest
pub fn path_hash(path_prefix: &str) -> String {
    let digest = Sha256::digest(path_prefix.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

pub fn custom_ingress_name(host: &str, path_prefix: &str) -> String {
    format!("custom-{}-{}", host, path_hash(path_prefix))
}
