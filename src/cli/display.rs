//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{CheckReport, ContextInfo};
use crate::models::Deployment;
use crate::quota::RepositoryQuota;
use crate::scheduler::ProcessInfo;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }
    output
}

// ============================================================================
// Context display
// ============================================================================

pub fn format_context_list(contexts: &[ContextInfo]) -> String {
    let rows: Vec<Vec<String>> = contexts
        .iter()
        .map(|ctx| {
            vec![
                if ctx.is_current { "*" } else { " " }.to_string(),
                ctx.name.clone(),
                ctx.url.clone(),
            ]
        })
        .collect();

    format_table(&["", "NAME", "URL"], rows)
}

pub fn format_current_context(name: &str, url: &str) -> String {
    format!("Current context: {} ({})\n", name, url)
}

// ============================================================================
// Engine resources
// ============================================================================

/// Processes, each followed by its instances
pub fn format_process_list(processes: &[ProcessInfo]) -> String {
    let mut rows = Vec::new();
    for process in processes {
        rows.push(vec![
            process.process_type.clone(),
            format!("{}/{}", process.ready_replicas, process.target_replicas),
            process.plan.clone(),
            if process.autoscaling { "on" } else { "off" }.to_string(),
            String::new(),
        ]);
        for instance in &process.instances {
            rows.push(vec![
                format!("  {}", instance.name),
                if instance.ready { "ready" } else { "-" }.to_string(),
                instance
                    .release_version
                    .map(|v| format!("v{}", v))
                    .unwrap_or_default(),
                instance.restart_count.to_string(),
                instance.phase.clone(),
            ]);
        }
    }
    format_table(&["PROCESS", "READY", "PLAN", "AUTOSCALE", "PHASE"], rows)
}

pub fn format_deployment(deployment: &Deployment) -> String {
    let mut output = String::new();
    output.push_str(&format!("Deployment: {}\n", deployment.id));
    output.push_str(&format!("Status:     {:?}\n", deployment.status));
    if let Some(version) = deployment.release_version {
        output.push_str(&format!("Release:    v{}\n", version));
    }
    for phase in &deployment.phases {
        output.push_str(&format!("  {:<12} {:?}\n", format!("{:?}", phase.kind), phase.status));
    }
    if let Some(failure) = &deployment.failure {
        output.push_str(&format!("Failed in {:?}: {}\n", failure.phase, failure.reason));
        if let Some(hint) = &failure.hint {
            output.push_str(&format!("Hint: {}\n", hint));
        }
        for line in &failure.logs_tail {
            output.push_str(&format!("  | {}\n", line));
        }
    }
    for url in &deployment.accessible_urls {
        output.push_str(&format!("URL: {}\n", url));
    }
    output
}

pub fn format_quota(quota: &RepositoryQuota) -> String {
    let max = quota
        .max_size
        .map(|m| m.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    format!("{}: {} / {} bytes\n", quota.repo, quota.used, max)
}

pub fn format_check_report(report: &CheckReport) -> String {
    let mut output = format!("Settings: {}\n", report.settings_path);
    output.push_str(&format!("Cipher:   {}\n", report.cipher.tag()));
    output.push_str(&format!("Clusters: {}\n", report.clusters.join(", ")));
    if report.is_ok() {
        output.push_str("OK\n");
    } else {
        for error in &report.errors {
            output.push_str(&format!("error: {}\n", error));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherAlgorithm;
    use crate::scheduler::InstanceInfo;

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["NAME"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let output = format_table(
            &["name", "url"],
            vec![
                vec!["a".into(), "http://x".into()],
                vec!["longer".into(), "http://y".into()],
            ],
        );
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "NAME     URL");
        assert_eq!(lines[1], "a        http://x");
    }

    #[test]
    fn test_format_process_list_includes_instances() {
        let processes = vec![ProcessInfo {
            process_type: "web".into(),
            target_replicas: 2,
            ready_replicas: 1,
            autoscaling: false,
            plan: "default".into(),
            instances: vec![InstanceInfo {
                name: "r1-foo-stag-web-abc".into(),
                process_type: "web".into(),
                phase: "Running".into(),
                ready: true,
                mapper_version: "v2".into(),
                release_version: Some(3),
                start_time: None,
                image: None,
                restart_count: 0,
                is_legacy: false,
            }],
        }];
        let output = format_process_list(&processes);
        assert!(output.contains("1/2"));
        assert!(output.contains("r1-foo-stag-web-abc"));
        assert!(output.contains("v3"));
    }

    #[test]
    fn test_format_quota_unbounded() {
        let quota = RepositoryQuota {
            repo: "foo".into(),
            used: 10,
            max_size: None,
        };
        assert_eq!(format_quota(&quota), "foo: 10 / unlimited bytes\n");
    }

    #[test]
    fn test_format_check_report_lists_errors() {
        let report = CheckReport {
            settings_path: "engine.yaml".into(),
            clusters: vec![],
            cipher: CipherAlgorithm::BkCrypt,
            errors: vec!["crypto.secret must be set".into()],
        };
        let output = format_check_report(&report);
        assert!(output.contains("error: crypto.secret must be set"));
        assert!(!output.contains("OK"));
    }
}
