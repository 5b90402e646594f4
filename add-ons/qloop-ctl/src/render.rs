//! Plain-text rendering of controller and verification results.

use qloop_core::{
    Comparison, EnsureOutcome, EnvelopeCheck, FeedbackOutcome, PollState, RunObservation,
    ServiceStatus, StartOutcome, StartReport, StopOutcome, VerificationReport,
};
use serde_json::{json, Value};

fn ensure_label(ensure: &EnsureOutcome) -> String {
    match ensure {
        EnsureOutcome::AlreadyRunning => "already running".to_string(),
        EnsureOutcome::Started { pid: Some(pid) } => format!("started (pid {})", pid),
        EnsureOutcome::Started { pid: None } => "started (container)".to_string(),
    }
}

pub fn start_report(report: &StartReport, allow_degraded: bool) -> String {
    let mut out = String::new();
    for s in &report.services {
        let line = match &s.outcome {
            StartOutcome::Ready {
                ensure,
                probe,
                degraded,
            } => format!(
                "✅ {:<18} :{:<5} {}, {}{}",
                s.name,
                s.port,
                ensure_label(ensure),
                probe,
                if *degraded { " [DEGRADED]" } else { "" }
            ),
            StartOutcome::Unhealthy { ensure, state } => {
                let mut line = format!(
                    "❌ {:<18} :{:<5} {}, {}",
                    s.name,
                    s.port,
                    ensure_label(ensure),
                    state.diagnosis()
                );
                if *ensure == EnsureOutcome::AlreadyRunning {
                    line.push_str(&format!(
                        "\n   port {} is held by a process that is not healthy; try `qloop-ctl restart {}`",
                        s.port, s.name
                    ));
                }
                line
            }
            StartOutcome::Blocked { missing } => {
                let hint = if allow_degraded {
                    "degraded mode declined"
                } else {
                    "rerun with --allow-degraded to start without them"
                };
                format!(
                    "⛔ {:<18} :{:<5} not started: requires {} ({})",
                    s.name,
                    s.port,
                    missing.join(", "),
                    hint
                )
            }
            StartOutcome::Failed { error, remediation } => {
                let mut line = format!("❌ {:<18} :{:<5} {}", s.name, s.port, error);
                if let Some(r) = remediation {
                    line.push_str(&format!("\n   → {}", r));
                }
                line
            }
        };
        out.push_str(&line);
        out.push('\n');
    }
    let ready = report.services.iter().filter(|s| s.outcome.is_ready()).count();
    out.push_str(&format!("\n{}/{} services ready\n", ready, report.services.len()));
    out
}

pub fn stop_results(results: &[(String, StopOutcome)]) -> String {
    let mut out = String::new();
    for (name, outcome) in results {
        let line = match outcome {
            StopOutcome::Stopped { terminated } => {
                format!("🛑 {:<18} stopped ({} process(es))", name, terminated)
            }
            StopOutcome::NotRunning => format!("   {:<18} not running", name),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn restart(name: &str, stopped: &StopOutcome, ensure: &EnsureOutcome, state: &PollState) -> String {
    let stop = match stopped {
        StopOutcome::Stopped { terminated } => format!("stopped {} process(es)", terminated),
        StopOutcome::NotRunning => "was not running".to_string(),
    };
    format!(
        "{} {}: {}; {}; {}\n",
        if state.is_ready() { "✅" } else { "❌" },
        name,
        stop,
        ensure_label(ensure),
        state.diagnosis()
    )
}

pub fn status_table(statuses: &[ServiceStatus]) -> String {
    let mut out = format!(
        "{:<18} {:<10} {:>6} {:<6} {:>8}  {}\n",
        "SERVICE", "TIER", "PORT", "BOUND", "PID", "HEALTH"
    );
    for s in statuses {
        let pid = s
            .registry
            .as_ref()
            .and_then(|e| e.pid.map(|p| p.to_string()).or_else(|| e.container.clone()))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<18} {:<10} {:>6} {:<6} {:>8}  {}\n",
            s.name,
            s.tier.label(),
            s.port,
            if s.port_bound { "yes" } else { "no" },
            pid,
            s.probe
        ));
    }
    out
}

pub fn status_json(statuses: &[ServiceStatus]) -> Value {
    Value::Array(
        statuses
            .iter()
            .map(|s| {
                json!({
                    "service": s.name,
                    "tier": s.tier.label(),
                    "port": s.port,
                    "port_bound": s.port_bound,
                    "health": s.probe.label(),
                    "detail": s.probe.to_string(),
                    "registry": s.registry,
                })
            })
            .collect(),
    )
}

fn run_line(observation: &RunObservation) -> String {
    match observation {
        RunObservation::Scored { score, elapsed_ms } => {
            format!("score {:.4} ({} ms)", score, elapsed_ms)
        }
        RunObservation::Inconclusive {
            reason,
            preview,
            elapsed_ms,
        } => format!("no score: {} ({} ms)\n     response: {}", reason, elapsed_ms, preview),
    }
}

pub fn verification(report: &VerificationReport) -> String {
    let mut out = String::from("Quality improvement verification\n");
    out.push_str(&format!("  agent: {}\n", report.agent_url));
    for p in &report.preflight {
        out.push_str(&format!("  ✅ {}: {}\n", p.service, p.observation));
    }
    out.push_str(&format!("  run 1: {}\n", run_line(&report.first.observation)));
    if let Some(feedback) = &report.feedback {
        let line = match feedback {
            FeedbackOutcome::Accepted {
                status,
                quality_improvement_active,
            } => format!(
                "accepted ({}), quality improvement active: {}",
                status, quality_improvement_active
            ),
            FeedbackOutcome::Skipped { reason } => format!("skipped: {}", reason),
            FeedbackOutcome::Failed { error } => format!("failed: {}", error),
        };
        out.push_str(&format!("  feedback: {}\n", line));
    }
    out.push_str(&format!("  waited {} ms\n", report.delay_ms));
    out.push_str(&format!("  run 2: {}\n", run_line(&report.second.observation)));

    let verdict = match &report.comparison {
        Comparison::Improved {
            first,
            second,
            delta,
            percent,
        } => format!(
            "✅ IMPROVED: {:.4} → {:.4} (delta {:+.4}{})",
            first,
            second,
            delta,
            percent_suffix(*percent)
        ),
        Comparison::NotImproved {
            first,
            second,
            delta,
            percent,
        } => format!(
            "❌ NOT IMPROVED: {:.4} → {:.4} (delta {:+.4}{})",
            first,
            second,
            delta,
            percent_suffix(*percent)
        ),
        Comparison::Inconclusive { reason } => format!("⚠️ INCONCLUSIVE: {}", reason),
    };
    out.push_str(&format!("\n{}\n", verdict));
    out
}

fn percent_suffix(percent: Option<f64>) -> String {
    percent
        .map(|p| format!(", {:+.2}%", p))
        .unwrap_or_default()
}

pub fn envelope(check: &EnvelopeCheck) -> String {
    format!(
        "{} envelope contract {}\n  raw dataset     → HTTP {} {}\n  wrapped dataset → HTTP {} {}\n",
        if check.holds { "✅" } else { "❌" },
        if check.holds { "holds" } else { "violated" },
        check.raw_status,
        check.raw_preview,
        check.wrapped_status,
        check.wrapped_detail
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use qloop_core::{Probe, ServiceReport};

    #[test]
    fn percent_is_omitted_without_baseline() {
        assert_eq!(percent_suffix(None), "");
        assert_eq!(percent_suffix(Some(15.492957)), ", +15.49%");
    }

    #[test]
    fn blocked_service_suggests_degraded_flag() {
        let report = StartReport {
            services: vec![ServiceReport {
                name: "pseudonymization".into(),
                port: 5003,
                outcome: StartOutcome::Blocked {
                    missing: vec!["redis".into()],
                },
            }],
        };
        let text = start_report(&report, false);
        assert!(text.contains("--allow-degraded"));
        assert!(text.contains("0/1 services ready"));
    }

    #[test]
    fn unhealthy_holder_suggests_restart() {
        let report = StartReport {
            services: vec![ServiceReport {
                name: "prompt_engine".into(),
                port: 5000,
                outcome: StartOutcome::Unhealthy {
                    ensure: EnsureOutcome::AlreadyRunning,
                    state: PollState::NotReady(Probe::Unreachable {
                        detail: "refused".into(),
                    }),
                },
            }],
        };
        assert!(start_report(&report, false).contains("qloop-ctl restart prompt_engine"));
    }
}
