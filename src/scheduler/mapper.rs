//! Naming and labelling per mapper generation
//!
//! `V1` is the legacy scheme (`<region>-<name>-<proc>-deployment`), `V2` the
//! current one (`<name>-<proc>`). Both stamp `mapper_version` into pod labels
//! and selectors so generations never select each other's pods.

use std::collections::BTreeMap;

use crate::cluster::resources::{
    LabelSelector, LABEL_APP_CODE, LABEL_CATEGORY, LABEL_ENV, LABEL_MAPPER_VERSION,
    LABEL_MODULE_NAME, LABEL_PROCESS_TYPE, LABEL_RELEASE_VERSION, LABEL_WL_APP,
};
use crate::models::{MapperVersion, WlApp};

pub const CATEGORY_BKAPP: &str = "bkapp";

impl MapperVersion {
    pub fn deployment_name(&self, wl_app: &WlApp, process_type: &str) -> String {
        match self {
            MapperVersion::V1 => format!(
                "{}-{}-{}-deployment",
                wl_app.region,
                wl_app.scheduler_safe_name(),
                process_type
            ),
            MapperVersion::V2 => format!("{}-{}", wl_app.scheduler_safe_name(), process_type),
        }
    }

    pub fn service_name(&self, wl_app: &WlApp, process_type: &str) -> String {
        match self {
            MapperVersion::V1 => format!(
                "{}-{}-{}",
                wl_app.region,
                wl_app.scheduler_safe_name(),
                process_type
            ),
            MapperVersion::V2 => format!("{}-{}", wl_app.scheduler_safe_name(), process_type),
        }
    }

    /// Labels identifying the pods of one process in this generation
    pub fn pod_selector(&self, wl_app: &WlApp, process_type: &str) -> LabelSelector {
        self.app_selector(wl_app)
            .with(LABEL_PROCESS_TYPE, process_type)
    }

    /// Labels identifying every workload of the app in this generation
    pub fn app_selector(&self, wl_app: &WlApp) -> LabelSelector {
        let selector = LabelSelector::matching(LABEL_WL_APP, wl_app.scheduler_safe_name())
            .with(LABEL_MAPPER_VERSION, self.as_str());
        match self {
            MapperVersion::V1 => selector,
            MapperVersion::V2 => selector.with(LABEL_CATEGORY, CATEGORY_BKAPP),
        }
    }

    /// Labels of app-level objects (secrets, ingresses) written in this generation
    pub fn owner_labels(&self, wl_app: &WlApp) -> BTreeMap<String, String> {
        let mut labels = self.app_selector(wl_app).match_labels;
        labels.insert(LABEL_APP_CODE.to_string(), wl_app.app_code.clone());
        labels.insert(LABEL_MODULE_NAME.to_string(), wl_app.module_name.clone());
        labels.insert(LABEL_ENV.to_string(), wl_app.environment.to_string());
        labels
    }

    /// Full label set written on workload objects and their pod templates
    pub fn labels(
        &self,
        wl_app: &WlApp,
        process_type: &str,
        release_version: u32,
    ) -> BTreeMap<String, String> {
        let mut labels = self.owner_labels(wl_app);
        labels.insert(LABEL_PROCESS_TYPE.to_string(), process_type.to_string());
        labels.insert(LABEL_RELEASE_VERSION.to_string(), release_version.to_string());
        labels
    }
}

/// Selector over every pod of the app, any generation
pub fn any_generation_selector(wl_app: &WlApp) -> LabelSelector {
    LabelSelector::matching(LABEL_WL_APP, wl_app.scheduler_safe_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppType, Environment};
    use chrono::Utc;
    use uuid::Uuid;

    fn wl_app(name: &str) -> WlApp {
        let now = Utc::now();
        WlApp {
            id: Uuid::new_v4(),
            region: "ieod".into(),
            name: name.into(),
            app_type: AppType::Default,
            app_code: "foo".into(),
            module_name: "default".into(),
            environment: Environment::Stag,
            tenant_id: "default".into(),
            created: now,
            updated: now,
        }
    }

    #[test]
    fn test_names_per_generation() {
        let app = wl_app("bkapp-foo_bar-stag");
        assert_eq!(
            MapperVersion::V2.deployment_name(&app, "web"),
            "bkapp-foo0us0bar-stag-web"
        );
        assert_eq!(
            MapperVersion::V1.deployment_name(&app, "web"),
            "ieod-bkapp-foo0us0bar-stag-web-deployment"
        );
    }

    #[test]
    fn test_generations_do_not_overlap() {
        let app = wl_app("bkapp-foo-stag");
        let v1 = MapperVersion::V1.labels(&app, "web", 3);
        let v2_selector = MapperVersion::V2.pod_selector(&app, "web");
        assert!(!v2_selector.matches(&v1));
        assert!(MapperVersion::V1.pod_selector(&app, "web").matches(&v1));
        assert!(any_generation_selector(&app).matches(&v1));
    }

    #[test]
    fn test_labels_carry_required_keys() {
        let app = wl_app("bkapp-foo-stag");
        let labels = MapperVersion::V2.labels(&app, "web", 7);
        for key in ["app_code", "module_name", "env", "process_type", "release_version", "mapper_version"] {
            assert!(labels.contains_key(key), "missing {}", key);
        }
        assert_eq!(labels["release_version"], "7");
        assert_eq!(labels["mapper_version"], "v2");
    }
}
