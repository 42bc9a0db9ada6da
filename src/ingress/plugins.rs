//! Snippet plugins
//!
//! Each plugin may contribute a server-block and a location-block snippet to
//! an Ingress. The chain keeps plugin order, drops later duplicates of the
//! same kind and joins contributions with newlines.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::models::WlApp;
use crate::settings::IngressSettings;

/// What a plugin sees about the route it decorates
#[derive(Debug, Clone)]
pub struct PluginContext<'a> {
    pub wl_app: &'a WlApp,
    pub host: &'a str,
    pub path_prefix: &'a str,
}

pub trait IngressPlugin: Send + Sync {
    /// Identity used for de-duplication
    fn kind(&self) -> &'static str;

    fn server_snippet(&self, _ctx: &PluginContext<'_>) -> Option<String> {
        None
    }

    fn configuration_snippet(&self, _ctx: &PluginContext<'_>) -> Option<String> {
        None
    }
}

/// Sends every request through the access control service first
pub struct AccessControlPlugin {
    pub check_url: String,
}

impl IngressPlugin for AccessControlPlugin {
    fn kind(&self) -> &'static str {
        "access_control"
    }

    fn server_snippet(&self, ctx: &PluginContext<'_>) -> Option<String> {
        Some(format!(
            "location = /_access_check {{\n    internal;\n    proxy_pass {}?app_code={}&module={};\n}}",
            self.check_url, ctx.wl_app.app_code, ctx.wl_app.module_name
        ))
    }

    fn configuration_snippet(&self, _ctx: &PluginContext<'_>) -> Option<String> {
        Some("auth_request /_access_check;".to_string())
    }
}

/// Tags requests for the platform's traffic analysis
pub struct PaasAnalysisPlugin;

impl IngressPlugin for PaasAnalysisPlugin {
    fn kind(&self) -> &'static str {
        "paas_analysis"
    }

    fn configuration_snippet(&self, ctx: &PluginContext<'_>) -> Option<String> {
        Some(format!(
            "set $bkpaas_app_code \"{}\";\nset $bkpaas_environment \"{}\";",
            ctx.wl_app.app_code, ctx.wl_app.environment
        ))
    }
}

#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn IngressPlugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn IngressPlugin>>) -> Self {
        let mut seen = BTreeSet::new();
        let plugins = plugins
            .into_iter()
            .filter(|p| seen.insert(p.kind()))
            .collect();
        Self { plugins }
    }

    pub fn from_settings(settings: &IngressSettings) -> Self {
        let mut plugins: Vec<Arc<dyn IngressPlugin>> = Vec::new();
        if settings.enable_access_control {
            plugins.push(Arc::new(AccessControlPlugin {
                check_url: settings.access_control_url.clone(),
            }));
        }
        if settings.enable_paas_analysis {
            plugins.push(Arc::new(PaasAnalysisPlugin));
        }
        Self::new(plugins)
    }

    /// A chain with `extra` appended, still de-duplicated
    pub fn extended(&self, extra: Vec<Arc<dyn IngressPlugin>>) -> Self {
        Self::new(self.plugins.iter().cloned().chain(extra).collect())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.kind()).collect()
    }

    pub fn server_snippet(&self, ctx: &PluginContext<'_>) -> String {
        self.plugins
            .iter()
            .filter_map(|p| p.server_snippet(ctx))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn configuration_snippet(&self, ctx: &PluginContext<'_>) -> String {
        self.plugins
            .iter()
            .filter_map(|p| p.configuration_snippet(ctx))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
