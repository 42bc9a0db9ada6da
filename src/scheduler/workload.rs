//! Workload objects built from a resolved process

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, LocalObjectReference, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as K8sSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::probes::render_probes;
use super::process::ResolvedProcess;
use crate::cluster::resources::{object_meta, GeneralPodAutoscaler};
use crate::credentials::PULL_SECRET_NAME;
use crate::models::{Cluster, ClusterFeatureFlag, Config, MapperVersion, ResourcePlan, WlApp};

const LOG_VOLUME: &str = "applogs";
const LOG_MOUNT_PATH: &str = "/app/v3logs";

/// Everything needed to materialize one process
#[derive(Debug, Clone)]
pub struct WorkloadInput<'a> {
    pub wl_app: &'a WlApp,
    pub cluster: &'a Cluster,
    pub config: &'a Config,
    pub mapper: MapperVersion,
    pub release_version: u32,
    pub image: &'a str,
    pub process: &'a ResolvedProcess,
    pub env: BTreeMap<String, String>,
}

pub fn resource_requirements(plan: &ResourcePlan) -> ResourceRequirements {
    let quota = |cpu: &str, memory: &str| -> BTreeMap<String, Quantity> {
        [
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]
        .into_iter()
        .collect()
    };
    ResourceRequirements {
        limits: Some(quota(&plan.limits.cpu, &plan.limits.memory)),
        requests: Some(quota(&plan.requests.cpu, &plan.requests.memory)),
        ..Default::default()
    }
}

impl WorkloadInput<'_> {
    pub fn namespace(&self) -> String {
        self.wl_app.namespace()
    }

    pub fn deployment_name(&self) -> String {
        self.mapper.deployment_name(self.wl_app, &self.process.name)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.mapper
            .labels(self.wl_app, &self.process.name, self.release_version)
    }

    /// Replica count written on the Deployment
    ///
    /// With autoscaling the autoscaler owns the count; clusters without the
    /// autoscaling flag pin it to `min_replicas`.
    pub fn replicas(&self) -> i32 {
        self.process.declared_replicas()
    }

    pub fn autoscaling_enabled(&self) -> bool {
        self.process.autoscaling.is_some()
            && self.cluster.has_feature(ClusterFeatureFlag::EnableAutoscaling)
    }

    fn container(&self) -> Container {
        let process = self.process;
        let probes = render_probes(&process.probes, process.target_port);
        let mut container = Container {
            name: process.name.clone(),
            image: Some(self.image.to_string()),
            command: process.command.clone(),
            args: process.args.clone(),
            env: Some(
                self.env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![ContainerPort {
                container_port: process.target_port,
                name: Some(process.port_name.clone()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(resource_requirements(&process.plan)),
            image_pull_policy: Some(
                self.config
                    .image_pull_policy
                    .clone()
                    .unwrap_or_else(|| process.image_pull_policy.as_str().to_string()),
            ),
            liveness_probe: probes.liveness,
            readiness_probe: probes.readiness,
            startup_probe: probes.startup,
            ..Default::default()
        };
        if self.cluster.has_feature(ClusterFeatureFlag::EnableMountLogToHost) {
            container.volume_mounts = Some(vec![VolumeMount {
                name: LOG_VOLUME.to_string(),
                mount_path: LOG_MOUNT_PATH.to_string(),
                ..Default::default()
            }]);
        }
        container
    }

    fn pod_spec(&self) -> PodSpec {
        let mut spec = PodSpec {
            containers: vec![self.container()],
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: PULL_SECRET_NAME.to_string(),
            }]),
            node_selector: (!self.config.node_selector.is_empty())
                .then(|| self.config.node_selector.clone()),
            tolerations: (!self.config.tolerations.is_empty())
                .then(|| self.config.tolerations.clone()),
            ..Default::default()
        };
        if self.cluster.has_feature(ClusterFeatureFlag::EnableMountLogToHost) {
            spec.volumes = Some(vec![Volume {
                name: LOG_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: format!(
                        "{}/{}",
                        self.cluster.log_config.host_dir.trim_end_matches('/'),
                        self.wl_app.scheduler_safe_name()
                    ),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            }]);
        }
        spec
    }

    pub fn build_deployment(&self) -> Deployment {
        let labels = self.labels();
        let selector = self.mapper.pod_selector(self.wl_app, &self.process.name);
        Deployment {
            metadata: object_meta(self.deployment_name(), Some(&self.namespace()), labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas()),
                selector: K8sSelector {
                    match_labels: Some(selector.match_labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(self.pod_spec()),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn build_service(&self) -> Service {
        let name = self.mapper.service_name(self.wl_app, &self.process.name);
        let selector = self.mapper.pod_selector(self.wl_app, &self.process.name);
        Service {
            metadata: object_meta(name, Some(&self.namespace()), self.labels()),
            spec: Some(ServiceSpec {
                selector: Some(selector.match_labels),
                ports: Some(vec![ServicePort {
                    name: Some(self.process.port_name.clone()),
                    port: self.process.port,
                    target_port: Some(IntOrString::Int(self.process.target_port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn build_autoscaler(&self) -> Option<GeneralPodAutoscaler> {
        if !self.autoscaling_enabled() {
            return None;
        }
        self.process.autoscaling.as_ref().map(|config| {
            super::autoscaling::build_autoscaler(
                &self.deployment_name(),
                &self.namespace(),
                self.labels(),
                config,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppType, AutoscalingConfig, Environment, ProcessSpec};
    use crate::scheduler::process::resolve;
    use chrono::Utc;
    use uuid::Uuid;

    fn fixtures() -> (WlApp, Cluster, Config) {
        let now = Utc::now();
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
        let cluster: Cluster = serde_yaml::from_str(
            "name: c1\nregion: r1\nfeature_flags:\n  ENABLE_MOUNT_LOG_TO_HOST: true\n",
        )
        .unwrap();
        let config = Config::initial(wl_app.id, "default");
        (wl_app, cluster, config)
    }

    #[test]
    fn test_deployment_and_service_shape() {
        let (wl_app, cluster, config) = fixtures();
        let spec = ProcessSpec::new(Uuid::new_v4(), "web", Some("./start".into()), "t");
        let process = resolve(&spec, None, None, |_| ResourcePlan::default_plan());
        let input = WorkloadInput {
            wl_app: &wl_app,
            cluster: &cluster,
            config: &config,
            mapper: MapperVersion::V2,
            release_version: 1,
            image: "registry/example/foo:1",
            process: &process,
            env: BTreeMap::new(),
        };

        let deployment = input.build_deployment();
        assert_eq!(deployment.metadata.name.as_deref(), Some("bkapp-foo-stag-web"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, PULL_SECRET_NAME);
        assert!(pod.volumes.is_some());
        let container = &pod.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.command, Some(vec!["./start".to_string()]));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("4000m".into()));
        assert!(!spec.selector.match_labels.unwrap().contains_key("release_version"));

        let service = input.build_service();
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 5000);
        assert_eq!(port.target_port, Some(IntOrString::Int(5000)));
    }

    #[test]
    fn test_autoscaling_without_cluster_flag_pins_min() {
        let (wl_app, cluster, config) = fixtures();
        let mut spec = ProcessSpec::new(Uuid::new_v4(), "web", None, "t");
        spec.autoscaling = true;
        spec.scaling_config = Some(AutoscalingConfig {
            min_replicas: 2,
            max_replicas: 4,
            metrics: vec![],
            compute_by_limits: false,
        });
        let process = resolve(&spec, None, None, |_| ResourcePlan::default_plan());
        let input = WorkloadInput {
            wl_app: &wl_app,
            cluster: &cluster,
            config: &config,
            mapper: MapperVersion::V2,
            release_version: 1,
            image: "img",
            process: &process,
            env: BTreeMap::new(),
        };
        assert_eq!(input.replicas(), 2);
        assert!(input.build_autoscaler().is_none());
    }
}
