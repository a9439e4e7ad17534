use super::sequencer::{Outcome, SequenceReport, SequenceState, Step};
use crate::errors::Error;
use crate::host::libvirt::leases::{NodeAddress, Reconciled};
use serde_derive::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

const EXIT_FATAL: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Clone, Serialize)]
pub struct AddressReport {
    #[serde(flatten)]
    pub node: NodeAddress,
    #[serde(flatten)]
    pub reconciled: Reconciled,
}

/// Everything one invocation of the tool did, in order
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub run_id: String,
    pub command: String,
    pub phases: Vec<SequenceReport>,
    pub addresses: Vec<AddressReport>,
    /// Error that stopped the run outside of any step, e.g. a missing precondition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// Set when a signal stopped the run outside of a phase
    pub interrupted: bool,
}

impl ProvisionReport {
    pub fn new(command: &str) -> Self {
        ProvisionReport {
            run_id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            phases: Vec::new(),
            addresses: Vec::new(),
            aborted: None,
            interrupted: false,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.interrupted
            || self
                .phases
                .iter()
                .any(|phase| matches!(phase.state, SequenceState::Cancelled(_)))
    }

    /// 0 on success (warnings included), 1 on a fatal failure, 130 when cancelled
    pub fn exit_code(&self) -> u8 {
        if self.cancelled() {
            EXIT_CANCELLED
        } else if self.aborted.is_some() || self.phases.iter().any(|phase| !phase.state.is_complete())
        {
            EXIT_FATAL
        } else {
            0
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!("Wrote run report to {}", path.display());
        Ok(())
    }

    /// Human readable summary for stdout
    pub fn render(&self) -> String {
        let mut out = format!("Run {} ({})\n", self.run_id, self.command);

        for address in &self.addresses {
            let reconciled = &address.reconciled;
            let note = if reconciled.detection_failed {
                format!(
                    "WARNING: could not detect IP ({}), using configured",
                    reconciled.detail.as_deref().unwrap_or("no detail")
                )
            } else if reconciled.divergence {
                String::from("detected address differs, using detected")
            } else {
                String::from("matches")
            };
            out.push_str(&format!(
                "  {:<14} expected {:<16} detected {:<16} -> {} ({note})\n",
                address.node.role.to_string(),
                address.node.configured.to_string(),
                address
                    .node
                    .detected
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| String::from("-")),
                reconciled.address,
            ));
        }

        for phase in &self.phases {
            out.push_str(&format!(
                "\n{} [{}] {} action(s), {} poll(s)\n",
                phase.sequence,
                state_label(&phase.state),
                phase.actions_executed(),
                phase.total_poll_attempts(),
            ));
            for result in &phase.results {
                out.push_str(&format!(
                    "  {:<32} {:<18} attempts {:>3}  polls {:>3}  {:>8.1}s",
                    result.step,
                    outcome_label(result.outcome),
                    result.attempts,
                    result.poll_attempts,
                    result.elapsed.as_secs_f64(),
                ));
                if !result.outcome.is_success() {
                    if let Some(detail) = &result.detail {
                        out.push_str(&format!("  {detail}"));
                    }
                }
                out.push('\n');
            }
        }

        if let Some(reason) = &self.aborted {
            out.push_str(&format!("\nAborted: {reason}\n"));
        }
        out
    }
}

fn state_label(state: &SequenceState) -> String {
    match state {
        SequenceState::Pending => String::from("pending"),
        SequenceState::Running(index) => format!("running step {}", index + 1),
        SequenceState::Succeeded => String::from("succeeded"),
        SequenceState::FailedFatal(index) => format!("FAILED at step {}", index + 1),
        SequenceState::CompletedWithWarnings => String::from("completed with warnings"),
        SequenceState::Cancelled(index) => format!("cancelled at step {}", index + 1),
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Succeeded => "ok",
        Outcome::AlreadySatisfied => "already satisfied",
        Outcome::Failed => "FAILED",
        Outcome::TimedOut => "TIMED OUT",
        Outcome::LaunchFailed => "LAUNCH FAILED",
        Outcome::Cancelled => "cancelled",
        Outcome::NotAttempted => "not attempted",
    }
}

/// Describe a plan without running it, for `--dry-run`
pub fn render_plan(phase: &str, steps: &[Step]) -> String {
    let mut out = format!("{phase}\n");
    for (index, step) in steps.iter().enumerate() {
        let severity = match (step.fatal, step.fatal_on_timeout) {
            (true, true) => "fatal",
            (true, false) => "fatal, timeout tolerated",
            (false, true) => "failure tolerated, timeout fatal",
            (false, false) => "non-fatal",
        };
        out.push_str(&format!("  {:>2}. {} ({severity})\n", index + 1, step.name));
        if let Some(guard) = &step.skip_when {
            out.push_str(&format!("      skip when {guard}\n"));
        }
        if let Some(action) = &step.action {
            out.push_str(&format!("      run   {action}\n"));
        }
        if let Some(check) = &step.readiness {
            out.push_str(&format!(
                "      wait  until {check} ({} x {:?})\n",
                step.max_retries, step.retry_interval
            ));
        } else if step.max_retries > 1 {
            out.push_str(&format!(
                "      retry {} x {:?}\n",
                step.max_retries, step.retry_interval
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::engine::sequencer::RunResult;
    use crate::invocation;
    use std::net::IpAddr;
    use std::time::Duration;

    fn result(step: &str, outcome: Outcome) -> RunResult {
        RunResult {
            step: step.to_string(),
            outcome,
            attempts: 1,
            poll_attempts: 0,
            elapsed: Duration::from_millis(1500),
            exit_status: Some(if outcome.is_success() { 0 } else { 1 }),
            output: String::new(),
            detail: (!outcome.is_success()).then(|| String::from("exit status 1: boom")),
        }
    }

    fn phase(state: SequenceState, results: Vec<RunResult>) -> SequenceReport {
        SequenceReport {
            sequence: String::from("bootstrap"),
            state,
            results,
        }
    }

    #[test]
    fn exit_codes_follow_phase_states() {
        let mut report = ProvisionReport::new("provision");
        report.phases.push(phase(SequenceState::CompletedWithWarnings, vec![]));
        assert_eq!(report.exit_code(), 0);

        report.phases.push(phase(SequenceState::FailedFatal(0), vec![]));
        assert_eq!(report.exit_code(), EXIT_FATAL);

        report.phases.push(phase(SequenceState::Cancelled(0), vec![]));
        assert_eq!(report.exit_code(), EXIT_CANCELLED);

        let mut aborted = ProvisionReport::new("bootstrap");
        aborted.aborted = Some(String::from("Required binary talosctl not found on PATH"));
        assert_eq!(aborted.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn render_shows_addresses_and_failures() {
        let mut report = ProvisionReport::new("bootstrap");
        let configured = IpAddr::from([192, 168, 122, 10]);
        let detected = IpAddr::from([192, 168, 122, 45]);
        report.addresses.push(AddressReport {
            node: NodeAddress {
                role: Role::ControlPlane,
                configured,
                detected: Some(detected),
            },
            reconciled: Reconciled {
                address: detected,
                divergence: true,
                detection_failed: false,
                detail: None,
            },
        });
        report.phases.push(phase(
            SequenceState::FailedFatal(1),
            vec![
                result("apply-controlplane-config", Outcome::Succeeded),
                result("wait-etcd", Outcome::TimedOut),
                RunResult {
                    attempts: 0,
                    ..result("bootstrap", Outcome::NotAttempted)
                },
            ],
        ));

        let rendered = report.render();
        assert!(rendered.contains("expected 192.168.122.10"));
        assert!(rendered.contains("-> 192.168.122.45 (detected address differs, using detected)"));
        assert!(rendered.contains("bootstrap [FAILED at step 2] 2 action(s), 0 poll(s)"));
        assert!(rendered.contains("TIMED OUT"));
        assert!(rendered.contains("exit status 1: boom"));
        assert!(rendered.contains("not attempted"));
    }

    #[test]
    fn json_report_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let mut report = ProvisionReport::new("addons");
        report.phases.push(phase(
            SequenceState::Succeeded,
            vec![result("cilium", Outcome::Succeeded)],
        ));
        report.write_json(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["command"], "addons");
        assert_eq!(written["phases"][0]["state"]["state"], "succeeded");
        assert_eq!(written["phases"][0]["results"][0]["outcome"], "succeeded");
    }

    #[test]
    fn plan_lists_actions_and_waits() {
        let steps = vec![
            Step::action("create-talos-cp", invocation!("virt-install", "--name", "talos-cp")),
            Step::wait(
                "wait-etcd",
                crate::exit_zero!(invocation!("talosctl", "service", "etcd")),
                120,
                Duration::from_secs(5),
            ),
        ];
        let plan = render_plan("create-vms", &steps);
        assert!(plan.contains(" 1. create-talos-cp (fatal)"));
        assert!(plan.contains("run   virt-install --name talos-cp"));
        assert!(plan.contains("wait  until `talosctl service etcd` succeeds (120 x 5s)"));
    }
}
