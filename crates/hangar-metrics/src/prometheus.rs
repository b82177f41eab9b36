//! Prometheus text exposition format.
//!
//! Renders the fleet gauges and request counters for scraping by a
//! Prometheus server or compatible agent. Every metric carries its
//! `# HELP` and `# TYPE` lines even when it has no samples yet.

use std::collections::BTreeMap;

use crate::collector::{FleetSnapshot, Histogram, RequestMetrics};

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

/// Escape a label value (`\`, `"` and newlines).
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn counter_vec(out: &mut String, name: &str, help: &str, label: &str, values: &BTreeMap<String, u64>) {
    header(out, name, help, "counter");
    for (key, value) in values {
        out.push_str(&format!("{name}{{{label}=\"{}\"}} {value}\n", escape(key)));
    }
}

fn histogram(out: &mut String, name: &str, help: &str, h: &Histogram) {
    header(out, name, help, "histogram");
    for (bound, count) in h.bounds.iter().zip(&h.buckets) {
        out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {count}\n"));
    }
    out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count));
    out.push_str(&format!("{name}_sum {}\n", h.sum));
    out.push_str(&format!("{name}_count {}\n", h.count));
}

/// Render fleet gauges and request metrics into Prometheus text format.
pub fn render_prometheus(fleet: &FleetSnapshot, requests: &RequestMetrics) -> String {
    let mut out = String::new();

    // ── Runners ────────────────────────────────────────────────────
    header(&mut out, "hangar_runners_total", "Number of runners by state.", "gauge");
    for (state, count) in &fleet.runners_by_state {
        out.push_str(&format!("hangar_runners_total{{state=\"{state}\"}} {count}\n"));
    }
    header(&mut out, "hangar_runners_idle", "Runners whose guest is waiting for a job.", "gauge");
    out.push_str(&format!("hangar_runners_idle {}\n", fleet.runners_idle));
    header(&mut out, "hangar_runners_busy", "Runners whose guest is running a job.", "gauge");
    out.push_str(&format!("hangar_runners_busy {}\n", fleet.runners_busy));
    header(&mut out, "hangar_runner_errors", "Runners currently in the error state.", "gauge");
    out.push_str(&format!("hangar_runner_errors {}\n", fleet.runner_errors));

    // ── Agents ─────────────────────────────────────────────────────
    header(&mut out, "hangar_agents_total", "Number of agents by status.", "gauge");
    for (status, count) in &fleet.agents_by_status {
        out.push_str(&format!(
            "hangar_agents_total{{status=\"{}\"}} {count}\n",
            status.as_str()
        ));
    }
    header(&mut out, "hangar_agents_online", "Number of online agents.", "gauge");
    out.push_str(&format!("hangar_agents_online {}\n", fleet.agents_online));

    header(
        &mut out,
        "hangar_agent_capacity_runners",
        "Maximum concurrent runners per agent.",
        "gauge",
    );
    for a in &fleet.agents {
        out.push_str(&format!(
            "hangar_agent_capacity_runners{{agent_id=\"{}\",hostname=\"{}\"}} {}\n",
            escape(&a.agent_id),
            escape(&a.hostname),
            a.max_runners
        ));
    }
    header(
        &mut out,
        "hangar_agent_current_runners",
        "Runners occupying a slot per agent.",
        "gauge",
    );
    for a in &fleet.agents {
        out.push_str(&format!(
            "hangar_agent_current_runners{{agent_id=\"{}\",hostname=\"{}\"}} {}\n",
            escape(&a.agent_id),
            escape(&a.hostname),
            a.current_runners
        ));
    }

    // ── Capacity ───────────────────────────────────────────────────
    header(
        &mut out,
        "hangar_capacity_total_runners",
        "Runner slots across online agents.",
        "gauge",
    );
    out.push_str(&format!("hangar_capacity_total_runners {}\n", fleet.capacity_total));
    header(
        &mut out,
        "hangar_capacity_available_runners",
        "Free runner slots across online agents.",
        "gauge",
    );
    out.push_str(&format!(
        "hangar_capacity_available_runners {}\n",
        fleet.capacity_available
    ));
    header(
        &mut out,
        "hangar_capacity_utilization_ratio",
        "Occupied share of runner slots (0.0-1.0).",
        "gauge",
    );
    out.push_str(&format!(
        "hangar_capacity_utilization_ratio {:.4}\n",
        fleet.utilization
    ));

    // ── Requests ───────────────────────────────────────────────────
    counter_vec(
        &mut out,
        "hangar_add_instance_requests_total",
        "AddInstance requests by outcome.",
        "status",
        &requests.add_instance,
    );
    counter_vec(
        &mut out,
        "hangar_delete_instance_requests_total",
        "DeleteInstance requests by outcome.",
        "status",
        &requests.delete_instance,
    );
    counter_vec(
        &mut out,
        "hangar_runner_failures_total",
        "Failed runner starts by reason.",
        "reason",
        &requests.runner_failures,
    );
    histogram(
        &mut out,
        "hangar_add_instance_duration_seconds",
        "AddInstance handling time in seconds.",
        &requests.add_instance_duration,
    );
    histogram(
        &mut out,
        "hangar_runner_startup_duration_seconds",
        "Time from placement to SSH-ready in seconds.",
        &requests.runner_startup_duration,
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::AgentLoad;

    fn fleet() -> FleetSnapshot {
        let mut fleet = FleetSnapshot::default();
        fleet.agents = vec![AgentLoad {
            agent_id: "agent-1".into(),
            hostname: "mac-mini-1".into(),
            max_runners: 2,
            current_runners: 1,
        }];
        fleet.agents_online = 1;
        fleet.capacity_total = 2;
        fleet.capacity_available = 1;
        fleet.utilization = 0.5;
        fleet
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&FleetSnapshot::default(), &RequestMetrics::default());
        assert!(output.contains("# TYPE hangar_runners_total gauge"));
        assert!(output.contains("hangar_runners_total{state=\"tearing_down\"} 0"));
        assert!(output.contains("hangar_agents_total{status=\"offline\"} 0"));
        assert!(output.contains("# TYPE hangar_add_instance_requests_total counter"));
        assert!(!output.contains("hangar_add_instance_requests_total{"));
        assert!(output.contains("hangar_runner_startup_duration_seconds_bucket{le=\"+Inf\"} 0"));
    }

    #[test]
    fn render_agent_load_and_capacity() {
        let output = render_prometheus(&fleet(), &RequestMetrics::default());
        assert!(output.contains(
            "hangar_agent_capacity_runners{agent_id=\"agent-1\",hostname=\"mac-mini-1\"} 2"
        ));
        assert!(output.contains(
            "hangar_agent_current_runners{agent_id=\"agent-1\",hostname=\"mac-mini-1\"} 1"
        ));
        assert!(output.contains("hangar_capacity_total_runners 2"));
        assert!(output.contains("hangar_capacity_available_runners 1"));
        assert!(output.contains("hangar_capacity_utilization_ratio 0.5000"));
    }

    #[test]
    fn render_counters_and_histograms() {
        let mut requests = RequestMetrics::default();
        requests.add_instance.insert("success".into(), 3);
        requests.runner_failures.insert("startup_timeout".into(), 1);
        requests.runner_startup_duration.observe(42.0);

        let output = render_prometheus(&FleetSnapshot::default(), &requests);
        assert!(output.contains("hangar_add_instance_requests_total{status=\"success\"} 3"));
        assert!(output.contains("hangar_runner_failures_total{reason=\"startup_timeout\"} 1"));
        assert!(output.contains("hangar_runner_startup_duration_seconds_bucket{le=\"30\"} 0"));
        assert!(output.contains("hangar_runner_startup_duration_seconds_bucket{le=\"60\"} 1"));
        assert!(output.contains("hangar_runner_startup_duration_seconds_sum 42"));
        assert!(output.contains("hangar_runner_startup_duration_seconds_count 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        let mut fleet = fleet();
        fleet.agents[0].hostname = "mac \"mini\"".into();
        let output = render_prometheus(&fleet, &RequestMetrics::default());
        assert!(output.contains("hostname=\"mac \\\"mini\\\"\""));
    }

    #[test]
    fn every_sample_follows_its_type_line() {
        let output = render_prometheus(&fleet(), &RequestMetrics::default());
        let mut declared = Vec::new();
        for line in output.lines() {
            if let Some(rest) = line.strip_prefix("# TYPE ") {
                declared.push(rest.split(' ').next().unwrap().to_string());
            } else if !line.starts_with('#') {
                let name = line.split(['{', ' ']).next().unwrap();
                assert!(
                    declared.iter().any(|d| name.starts_with(d.as_str())),
                    "sample without TYPE: {line}"
                );
            }
        }
    }
}
