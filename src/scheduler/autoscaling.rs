//! Autoscaling policy validation and the autoscaler object

use std::collections::BTreeMap;

use crate::cluster::resources::{
    object_meta, GeneralPodAutoscaler, GeneralPodAutoscalerSpec, KubeResource, MetricSpec,
    MetricTarget, ResourceMetricSource, ScaleTargetRef,
};
use crate::error::{EngineError, EngineResult};
use crate::models::{AutoscalingConfig, MetricName, MetricTargetType, ResourcePlan, ScalingMetric};
use k8s_openapi::api::apps::v1::Deployment;

pub const COMPUTE_BY_LIMITS_ANNOTATION: &str = "compute-by-limits.autoscaling.bkapp/enabled";

const QUANTITY_SUFFIXES: [&str; 13] = [
    "", "m", "k", "M", "G", "T", "Ki", "Mi", "Gi", "Ti", "E", "P", "Ei",
];

/// Numeric part of a Kubernetes quantity when the suffix is known
fn quantity_value(raw: &str) -> Option<f64> {
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    if !QUANTITY_SUFFIXES.contains(&suffix) {
        return None;
    }
    number.parse::<f64>().ok()
}

pub fn validate_metric(metric: &ScalingMetric) -> EngineResult<()> {
    match metric.target_type {
        MetricTargetType::Utilization => match metric.value.parse::<i32>() {
            Ok(v) if v > 0 && v <= 100 => Ok(()),
            _ => Err(EngineError::field(
                "autoscaling.metrics",
                format!("utilization must be within (0, 100], got '{}'", metric.value),
            )),
        },
        MetricTargetType::AverageValue => match quantity_value(&metric.value) {
            Some(v) if v > 0.0 => Ok(()),
            _ => Err(EngineError::field(
                "autoscaling.metrics",
                format!("average value must be a positive quantity, got '{}'", metric.value),
            )),
        },
    }
}

pub fn validate_config(config: &AutoscalingConfig, plan: &ResourcePlan) -> EngineResult<()> {
    if config.min_replicas < 1 {
        return Err(EngineError::field(
            "autoscaling.min_replicas",
            "must be at least 1",
        ));
    }
    if config.max_replicas < config.min_replicas {
        return Err(EngineError::field(
            "autoscaling.max_replicas",
            "must not be lower than min_replicas",
        ));
    }
    if config.max_replicas > plan.max_replicas {
        return Err(EngineError::field(
            "autoscaling.max_replicas",
            format!("plan '{}' allows at most {} replicas", plan.name, plan.max_replicas),
        ));
    }
    if config.metrics.is_empty() {
        return Err(EngineError::field(
            "autoscaling.metrics",
            "at least one metric is required",
        ));
    }
    config.metrics.iter().try_for_each(validate_metric)
}

fn metric_spec(metric: &ScalingMetric) -> MetricSpec {
    let name = match metric.metric {
        MetricName::Cpu => "cpu",
        MetricName::Memory => "memory",
    };
    let target = match metric.target_type {
        MetricTargetType::Utilization => MetricTarget {
            type_: "Utilization".to_string(),
            average_utilization: metric.value.parse().ok(),
            average_value: None,
        },
        MetricTargetType::AverageValue => MetricTarget {
            type_: "AverageValue".to_string(),
            average_utilization: None,
            average_value: Some(metric.value.clone()),
        },
    };
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: name.to_string(),
            target,
        }),
    }
}

pub fn build_autoscaler(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    config: &AutoscalingConfig,
) -> GeneralPodAutoscaler {
    let mut metadata = object_meta(name, Some(namespace), labels);
    if config.compute_by_limits {
        metadata.annotations = Some(
            [(COMPUTE_BY_LIMITS_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
    }
    GeneralPodAutoscaler::new(
        metadata,
        GeneralPodAutoscalerSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: Deployment::api_version(),
                kind: Deployment::KIND.to_string(),
                name: name.to_string(),
            },
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
            metric: config.metrics.iter().map(metric_spec).collect(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(target_type: MetricTargetType, value: &str) -> ScalingMetric {
        ScalingMetric {
            metric: MetricName::Cpu,
            target_type,
            value: value.into(),
        }
    }

    fn config(min: i32, max: i32) -> AutoscalingConfig {
        AutoscalingConfig {
            min_replicas: min,
            max_replicas: max,
            metrics: vec![metric(MetricTargetType::Utilization, "70")],
            compute_by_limits: false,
        }
    }

    #[test]
    fn test_utilization_bounds() {
        assert!(validate_metric(&metric(MetricTargetType::Utilization, "100")).is_ok());
        assert!(validate_metric(&metric(MetricTargetType::Utilization, "1")).is_ok());
        assert!(validate_metric(&metric(MetricTargetType::Utilization, "0")).is_err());
        assert!(validate_metric(&metric(MetricTargetType::Utilization, "101")).is_err());
    }

    #[test]
    fn test_average_value_must_be_positive_quantity() {
        assert!(validate_metric(&metric(MetricTargetType::AverageValue, "500m")).is_ok());
        assert!(validate_metric(&metric(MetricTargetType::AverageValue, "1.5Gi")).is_ok());
        assert!(validate_metric(&metric(MetricTargetType::AverageValue, "0")).is_err());
        assert!(validate_metric(&metric(MetricTargetType::AverageValue, "12xb")).is_err());
    }

    #[test]
    fn test_config_respects_plan_cap() {
        let plan = ResourcePlan::default_plan();
        assert!(validate_config(&config(1, 5), &plan).is_ok());
        assert!(validate_config(&config(1, 6), &plan).is_err());
        assert!(validate_config(&config(3, 2), &plan).is_err());
        assert!(validate_config(&config(0, 2), &plan).is_err());
    }

    #[test]
    fn test_build_autoscaler() {
        let mut cfg = config(2, 4);
        cfg.compute_by_limits = true;
        cfg.metrics.push(ScalingMetric {
            metric: MetricName::Memory,
            target_type: MetricTargetType::AverageValue,
            value: "512Mi".into(),
        });
        let gpa = build_autoscaler("bkapp-foo-stag-web", "bkapp-foo-stag", BTreeMap::new(), &cfg);
        assert_eq!(gpa.spec.scale_target_ref.kind, "Deployment");
        assert_eq!(gpa.spec.min_replicas, 2);
        assert_eq!(gpa.spec.metric.len(), 2);
        let mem = gpa.spec.metric[1].resource.as_ref().unwrap();
        assert_eq!(mem.name, "memory");
        assert_eq!(mem.target.average_value.as_deref(), Some("512Mi"));
        assert_eq!(
            gpa.annotation(COMPUTE_BY_LIMITS_ANNOTATION),
            Some("true")
        );
    }
}
