//! Cleanup of process types a release no longer declares

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;

use crate::cluster::resources::GeneralPodAutoscaler;
use crate::cluster::{KubeClient, KubeError};
use crate::models::{MapperVersion, WlApp, ZombieSet};

/// What a reap pass touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub deleted: Vec<String>,
    pub rolled: Vec<String>,
}

/// Delete workloads of `zombies.types`
///
/// Types in `zombies.names` were already rolled by the apply since their
/// pod template changed; they are only reported.
pub async fn reap(
    client: &KubeClient,
    wl_app: &WlApp,
    mapper: MapperVersion,
    zombies: &ZombieSet,
) -> Result<ReapReport, KubeError> {
    let namespace = wl_app.namespace();
    let mut report = ReapReport::default();

    for process_type in &zombies.types {
        let workload = mapper.deployment_name(wl_app, process_type);
        client
            .delete::<GeneralPodAutoscaler>(&namespace, &workload)
            .await?;
        client.delete::<Deployment>(&namespace, &workload).await?;
        client
            .delete::<Service>(&namespace, &mapper.service_name(wl_app, process_type))
            .await?;
        tracing::info!(wl_app = %wl_app.name, process = %process_type, "deleted zombie process");
        report.deleted.push(process_type.clone());
    }

    for process_type in &zombies.names {
        tracing::info!(wl_app = %wl_app.name, process = %process_type, "command changed, rolled");
        report.rolled.push(process_type.clone());
    }
    Ok(report)
}
