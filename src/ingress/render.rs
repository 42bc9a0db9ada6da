//! Ingress objects rendered from desired routes

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::plugins::{PluginChain, PluginContext};
use crate::cluster::resources::object_meta;
use crate::models::WlApp;

pub const DESIRED_HASH_ANNOTATION: &str = "bkpaas.engine/desired-hash";
pub const LABEL_INGRESS_KIND: &str = "ingress_kind";

pub const SERVER_SNIPPET: &str = "nginx.ingress.kubernetes.io/server-snippet";
pub const CONFIGURATION_SNIPPET: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
pub const REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
pub const USE_REGEX: &str = "nginx.ingress.kubernetes.io/use-regex";
pub const SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressKind {
    Subdomain,
    Subpath,
    Custom,
}

impl IngressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressKind::Subdomain => "subdomain",
            IngressKind::Subpath => "subpath",
            IngressKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteOptions {
    /// Strip a non-root prefix before proxying
    pub rewrite_to_root: bool,
    pub set_header_x_script_name: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            rewrite_to_root: true,
            set_header_x_script_name: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub service: String,
    pub port: i32,
}

/// One host with the path prefixes routed on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRoute {
    pub name: String,
    pub host: String,
    pub paths: Vec<String>,
    pub tls_secret: Option<String>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn desired_hash<T: Serialize>(value: &T) -> String {
    let raw = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Upstream path for `request_path` under a rewritten `prefix`
///
/// `/foo/` rewrites `/foo/bar` to `/bar` and `/foo` to `/`; other paths do
/// not match the prefix.
pub fn rewrite_path(prefix: &str, request_path: &str) -> Option<String> {
    let base = prefix.trim_end_matches('/');
    if base.is_empty() {
        return Some(request_path.to_string());
    }
    let rest = request_path.strip_prefix(base)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    Some(format!("/{}", rest.trim_start_matches('/')))
}

/// Value of `X-Script-Name` for a prefix, `None` at the root
pub fn script_name(prefix: &str) -> Option<String> {
    let base = prefix.trim_end_matches('/');
    (!base.is_empty()).then(|| base.to_string())
}

fn x_script_name_snippet(paths: &[String]) -> Option<String> {
    let names: Vec<String> = paths.iter().filter_map(|p| script_name(p)).collect();
    match names.as_slice() {
        [] => None,
        [only] => Some(format!("proxy_set_header X-Script-Name {};", only)),
        many => {
            let mut lines = vec!["set $bk_script_name \"\";".to_string()];
            for name in many {
                lines.push(format!(
                    "if ($request_uri ~ ^{}(/|$)) {{ set $bk_script_name {}; }}",
                    name, name
                ));
            }
            lines.push("proxy_set_header X-Script-Name $bk_script_name;".to_string());
            Some(lines.join("\n"))
        }
    }
}

fn ingress_path(prefix: &str, rewrite: bool, backend: &Backend) -> HTTPIngressPath {
    let (path, path_type) = match script_name(prefix) {
        Some(base) if rewrite => (format!("{}(/|$)(.*)", base), "ImplementationSpecific"),
        _ => (prefix.to_string(), "Prefix"),
    };
    HTTPIngressPath {
        path: Some(path),
        path_type: path_type.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: backend.service.clone(),
                port: Some(ServiceBackendPort {
                    number: Some(backend.port),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}

/// Render the Ingress for `route`, stamped with the hash of its content
pub fn render_ingress(
    wl_app: &WlApp,
    route: &DesiredRoute,
    labels: BTreeMap<String, String>,
    backend: &Backend,
    options: RouteOptions,
    plugins: &PluginChain,
) -> Ingress {
    let rewrite = options.rewrite_to_root && route.paths.iter().any(|p| script_name(p).is_some());
    let mut annotations = BTreeMap::new();
    if rewrite {
        annotations.insert(USE_REGEX.to_string(), "true".to_string());
        annotations.insert(REWRITE_TARGET.to_string(), "/$2".to_string());
    }

    let ctx = PluginContext {
        wl_app,
        host: &route.host,
        path_prefix: route.paths.first().map(String::as_str).unwrap_or("/"),
    };
    let server = plugins.server_snippet(&ctx);
    if !server.is_empty() {
        annotations.insert(SERVER_SNIPPET.to_string(), server);
    }
    let mut configuration: Vec<String> = Vec::new();
    let plugin_conf = plugins.configuration_snippet(&ctx);
    if !plugin_conf.is_empty() {
        configuration.push(plugin_conf);
    }
    if options.set_header_x_script_name {
        configuration.extend(x_script_name_snippet(&route.paths));
    }
    if !configuration.is_empty() {
        annotations.insert(CONFIGURATION_SNIPPET.to_string(), configuration.join("\n"));
    }
    if route.tls_secret.is_none() {
        annotations.insert(SSL_REDIRECT.to_string(), "false".to_string());
    }

    let spec = IngressSpec {
        rules: Some(vec![IngressRule {
            host: Some(route.host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: route
                    .paths
                    .iter()
                    .map(|p| ingress_path(p, rewrite, backend))
                    .collect(),
            }),
        }]),
        tls: route.tls_secret.as_ref().map(|secret| {
            vec![IngressTLS {
                hosts: Some(vec![route.host.clone()]),
                secret_name: Some(secret.clone()),
            }]
        }),
        ..Default::default()
    };

    let hash = desired_hash(&(&spec, &annotations, &labels));
    annotations.insert(DESIRED_HASH_ANNOTATION.to_string(), hash);
    let mut metadata = object_meta(route.name.clone(), Some(&wl_app.namespace()), labels);
    metadata.annotations = Some(annotations);
    Ingress {
        metadata,
        spec: Some(spec),
        status: None,
    }
}
