//! Probe templating

use k8s_openapi::api::core::v1::Probe;
use serde_json::Value;

use crate::models::ProbeSet;

const PORT_PLACEHOLDER: &str = "${PORT}";

fn substitute(value: &mut Value, port: i32) {
    match value {
        Value::String(s) if s == PORT_PLACEHOLDER => *value = Value::from(port),
        Value::String(s) if s.contains(PORT_PLACEHOLDER) => {
            *s = s.replace(PORT_PLACEHOLDER, &port.to_string());
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, port)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, port)),
        _ => {}
    }
}

/// Copy a probe replacing `${PORT}` with the container port
pub fn render_probe(probe: &Probe, port: i32) -> Probe {
    let Ok(mut value) = serde_json::to_value(probe) else {
        return probe.clone();
    };
    substitute(&mut value, port);
    serde_json::from_value(value).unwrap_or_else(|_| probe.clone())
}

pub fn render_probes(probes: &ProbeSet, port: i32) -> ProbeSet {
    ProbeSet {
        liveness: probes.liveness.as_ref().map(|p| render_probe(p, port)),
        readiness: probes.readiness.as_ref().map(|p| render_probe(p, port)),
        startup: probes.startup.as_ref().map(|p| render_probe(p, port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use serde_json::json;

    #[test]
    fn test_port_placeholder_in_http_probe() {
        let probe: Probe = serde_json::from_value(json!({
            "httpGet": {"path": "/healthz", "port": "${PORT}"},
            "periodSeconds": 5
        }))
        .unwrap();
        let rendered = render_probe(&probe, 5000);
        let http = rendered.http_get.unwrap();
        assert_eq!(http.port, IntOrString::Int(5000));
        assert_eq!(http.path.as_deref(), Some("/healthz"));
        assert_eq!(rendered.period_seconds, Some(5));
    }

    #[test]
    fn test_port_placeholder_in_exec_probe() {
        let probe: Probe = serde_json::from_value(json!({
            "exec": {"command": ["curl", "http://localhost:${PORT}/ready"]}
        }))
        .unwrap();
        let rendered = render_probe(&probe, 8080);
        assert_eq!(
            rendered.exec.unwrap().command.unwrap()[1],
            "http://localhost:8080/ready"
        );
    }

    #[test]
    fn test_probe_without_placeholder_is_unchanged() {
        let probe: Probe = serde_json::from_value(json!({
            "tcpSocket": {"port": 8000}
        }))
        .unwrap();
        assert_eq!(render_probe(&probe, 5000), probe);
    }
}
