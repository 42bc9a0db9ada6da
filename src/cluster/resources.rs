//! Typed Kubernetes resources the engine manipulates
//!
//! Every object the engine reads or writes goes through [`KubeResource`];
//! anything that does not deserialize into one of these shapes is an error
//! rather than a silently missing field.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// Label keys written on every managed object
pub const LABEL_APP_CODE: &str = "app_code";
pub const LABEL_MODULE_NAME: &str = "module_name";
pub const LABEL_ENV: &str = "env";
pub const LABEL_PROCESS_TYPE: &str = "process_type";
pub const LABEL_RELEASE_VERSION: &str = "release_version";
pub const LABEL_MAPPER_VERSION: &str = "mapper_version";
pub const LABEL_WL_APP: &str = "wl_app";
pub const LABEL_CATEGORY: &str = "category";

/// A Kubernetes object addressable through the REST API
pub trait KubeResource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// API group, empty for the core group
    const GROUP: &'static str;
    const VERSION: &'static str;
    const KIND: &'static str;
    /// Lower-case plural used in URLs
    const PLURAL: &'static str;
    const NAMESPACED: bool;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn api_version() -> String {
        if Self::GROUP.is_empty() {
            Self::VERSION.to_string()
        } else {
            format!("{}/{}", Self::GROUP, Self::VERSION)
        }
    }

    /// Collection path, optionally scoped to a namespace
    fn collection_path(namespace: Option<&str>) -> String {
        let prefix = if Self::GROUP.is_empty() {
            format!("/api/{}", Self::VERSION)
        } else {
            format!("/apis/{}/{}", Self::GROUP, Self::VERSION)
        };
        match namespace {
            Some(ns) if Self::NAMESPACED => {
                format!("{}/namespaces/{}/{}", prefix, ns, Self::PLURAL)
            }
            _ => format!("{}/{}", prefix, Self::PLURAL),
        }
    }

    fn object_path(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", Self::collection_path(namespace), name)
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

macro_rules! kube_resource {
    ($ty:ty, $group:literal, $version:literal, $kind:literal, $plural:literal, $namespaced:literal) => {
        impl KubeResource for $ty {
            const GROUP: &'static str = $group;
            const VERSION: &'static str = $version;
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;
            const NAMESPACED: bool = $namespaced;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

kube_resource!(Namespace, "", "v1", "Namespace", "namespaces", false);
kube_resource!(Pod, "", "v1", "Pod", "pods", true);
kube_resource!(Service, "", "v1", "Service", "services", true);
kube_resource!(Secret, "", "v1", "Secret", "secrets", true);
kube_resource!(ConfigMap, "", "v1", "ConfigMap", "configmaps", true);
kube_resource!(Event, "", "v1", "Event", "events", true);
kube_resource!(Deployment, "apps", "v1", "Deployment", "deployments", true);
kube_resource!(Ingress, "networking.k8s.io", "v1", "Ingress", "ingresses", true);
kube_resource!(
    GeneralPodAutoscaler,
    "autoscaling.tkex.tencent.com",
    "v1alpha1",
    "GeneralPodAutoscaler",
    "generalpodautoscalers",
    true
);

/// Response for listing resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceList<T> {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    pub fn new(kind: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: kind.into(),
            items,
        }
    }
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a `labelSelector` query value
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse `a=b,c=d`; `==` is accepted as a synonym
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut match_labels = BTreeMap::new();
        for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (k, v) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| format!("unsupported selector term '{}'", term))?;
            match_labels.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(Self { match_labels })
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

/// Query parameters of a list or delete-collection call
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<String>,
}

impl ListParams {
    pub fn labels(selector: LabelSelector) -> Self {
        Self {
            label_selector: Some(selector),
            field_selector: None,
        }
    }

    pub fn fields(field_selector: impl Into<String>) -> Self {
        Self {
            label_selector: None,
            field_selector: Some(field_selector.into()),
        }
    }

    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(selector) = self.label_selector.as_ref().filter(|s| !s.is_empty()) {
            query.push(("labelSelector".to_string(), selector.to_query()));
        }
        if let Some(fields) = &self.field_selector {
            query.push(("fieldSelector".to_string(), fields.clone()));
        }
        query
    }
}

// ============================================================================
// Autoscaler custom resource
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetricSource {
    pub name: String,
    pub target: MetricTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPodAutoscalerSpec {
    pub scale_target_ref: ScaleTargetRef,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub metric: Vec<MetricSpec>,
}

/// Generic pod autoscaler custom resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralPodAutoscaler {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: GeneralPodAutoscalerSpec,
}

impl GeneralPodAutoscaler {
    pub fn new(metadata: ObjectMeta, spec: GeneralPodAutoscalerSpec) -> Self {
        Self {
            api_version: <Self as KubeResource>::api_version(),
            kind: <Self as KubeResource>::KIND.to_string(),
            metadata,
            spec,
        }
    }
}

/// Metadata with name, namespace and labels set
pub fn object_meta(
    name: impl Into<String>,
    namespace: Option<&str>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: namespace.map(str::to_string),
        labels: if labels.is_empty() { None } else { Some(labels) },
        ..Default::default()
    }
}
