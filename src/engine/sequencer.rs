use super::poller::{Check, PollOutcome, Probe, poll, probe};
use super::runner::{CommandRunner, Invocation};
use crate::errors::Error;
use crate::utils::cancel::Cancellation;
use serde_derive::Serialize;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{error, info, instrument, warn};

/// One provisioning step. Built by a plan and never modified while a sequence runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    /// `None` makes the step a pure wait on `readiness`
    pub action: Option<Invocation>,
    pub readiness: Option<Check>,
    /// Budget of the readiness poll, or of action retries when there is no readiness check
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// A non-zero exit of the action halts the sequence
    pub fatal: bool,
    /// An exhausted poll or retry budget halts the sequence
    pub fatal_on_timeout: bool,
    /// When this already holds the action is skipped
    pub skip_when: Option<Check>,
    /// What the operator should do when this step halts the sequence
    pub hint: Option<String>,
}

impl Step {
    pub fn action(name: impl Into<String>, invocation: Invocation) -> Self {
        Step {
            name: name.into(),
            action: Some(invocation),
            readiness: None,
            max_retries: 1,
            retry_interval: Duration::ZERO,
            fatal: true,
            fatal_on_timeout: true,
            skip_when: None,
            hint: None,
        }
    }

    pub fn wait(name: impl Into<String>, check: Check, attempts: u32, interval: Duration) -> Self {
        Step {
            name: name.into(),
            action: None,
            readiness: Some(check),
            max_retries: attempts,
            retry_interval: interval,
            fatal: true,
            fatal_on_timeout: true,
            skip_when: None,
            hint: None,
        }
    }

    pub fn with_readiness(mut self, check: Check, attempts: u32, interval: Duration) -> Self {
        self.readiness = Some(check);
        self.max_retries = attempts;
        self.retry_interval = interval;
        self
    }

    /// Retry the action itself; only meaningful without a readiness check
    pub fn with_retries(mut self, attempts: u32, interval: Duration) -> Self {
        self.max_retries = attempts;
        self.retry_interval = interval;
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self.fatal_on_timeout = false;
        self
    }

    pub fn tolerate_timeout(mut self) -> Self {
        self.fatal_on_timeout = false;
        self
    }

    /// Set both failure modes at once, used for steps whose severity is configurable
    pub fn fatal_if(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self.fatal_on_timeout = fatal;
        self
    }

    pub fn skip_when(mut self, check: Check) -> Self {
        self.skip_when = Some(check);
        self
    }

    /// Skip the action when the readiness check already holds
    pub fn skip_if_ready(mut self) -> Self {
        self.skip_when = self.readiness.clone();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    /// The skip condition held, no action was run
    AlreadySatisfied,
    /// The action exited non-zero
    Failed,
    /// A readiness poll or the action retries used up their budget
    TimedOut,
    LaunchFailed,
    Cancelled,
    NotAttempted,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded | Outcome::AlreadySatisfied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub step: String,
    pub outcome: Outcome,
    /// Action attempts made
    pub attempts: u32,
    /// Readiness probes made, including the skip probe
    pub poll_attempts: u32,
    pub elapsed: Duration,
    pub exit_status: Option<i32>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunResult {
    fn new(step: &Step) -> Self {
        RunResult {
            step: step.name.clone(),
            outcome: Outcome::NotAttempted,
            attempts: 0,
            poll_attempts: 0,
            elapsed: Duration::ZERO,
            exit_status: None,
            output: String::new(),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "step")]
pub enum SequenceState {
    Pending,
    Running(usize),
    Succeeded,
    FailedFatal(usize),
    CompletedWithWarnings,
    Cancelled(usize),
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SequenceState::Pending | SequenceState::Running(_))
    }

    /// Everything ran; warnings allowed
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            SequenceState::Succeeded | SequenceState::CompletedWithWarnings
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    pub sequence: String,
    pub state: SequenceState,
    pub results: Vec<RunResult>,
}

impl SequenceReport {
    /// Result of the step that halted the sequence
    pub fn failing_step(&self) -> Option<&RunResult> {
        match self.state {
            SequenceState::FailedFatal(index) | SequenceState::Cancelled(index) => {
                self.results.get(index)
            }
            _ => None,
        }
    }

    pub fn total_poll_attempts(&self) -> u32 {
        self.results.iter().map(|result| result.poll_attempts).sum()
    }

    /// Steps whose action actually ran
    pub fn actions_executed(&self) -> u32 {
        self.results.iter().map(|result| result.attempts).sum()
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|result| result.outcome == Outcome::NotAttempted)
            .map(|result| result.step.as_str())
    }
}

enum Verdict {
    Continue,
    Warning,
    Fatal,
    Cancelled,
}

/// Strictly linear executor for a list of [`Step`]s
pub struct Sequencer<'a> {
    name: String,
    runner: &'a dyn CommandRunner,
    cancel: Cancellation,
    state: SequenceState,
}

impl<'a> Sequencer<'a> {
    pub fn new(name: impl Into<String>, runner: &'a dyn CommandRunner, cancel: Cancellation) -> Self {
        Sequencer {
            name: name.into(),
            runner,
            cancel,
            state: SequenceState::Pending,
        }
    }

    /// Run every step in order, stopping at the first fatal failure or cancellation.
    /// Steps after the stopping point are reported as `NotAttempted`.
    #[instrument(skip_all, fields(sequence = %self.name))]
    pub async fn run(&mut self, steps: &[Step]) -> SequenceReport {
        let mut results = Vec::with_capacity(steps.len());
        let mut warnings = 0;
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            self.state = SequenceState::Running(index);
            info!("[{}/{}] {}", index + 1, total, describe(step));

            let (result, verdict) = self.execute(step).await;
            results.push(result);

            match verdict {
                Verdict::Continue => {}
                Verdict::Warning => {
                    warnings += 1;
                    warn!("{}: WARNING: continuing anyway", step.name);
                }
                Verdict::Fatal => {
                    error!("{}: fatal failure, stopping {}", step.name, self.name);
                    if let Some(hint) = &step.hint {
                        error!("hint: {hint}");
                    }
                    self.state = SequenceState::FailedFatal(index);
                    break;
                }
                Verdict::Cancelled => {
                    warn!("{}: cancelled, stopping {}", step.name, self.name);
                    self.state = SequenceState::Cancelled(index);
                    break;
                }
            }
        }

        if !self.state.is_terminal() {
            self.state = if warnings == 0 {
                SequenceState::Succeeded
            } else {
                SequenceState::CompletedWithWarnings
            };
        }
        for step in steps.iter().skip(results.len()) {
            results.push(RunResult::new(step));
        }

        info!("{} finished: {:?}", self.name, self.state);
        SequenceReport {
            sequence: self.name.clone(),
            state: self.state,
            results,
        }
    }

    async fn execute(&self, step: &Step) -> (RunResult, Verdict) {
        let started = Instant::now();
        let mut result = RunResult::new(step);
        let verdict = self.execute_inner(step, &mut result).await;
        result.elapsed = started.elapsed();

        match result.outcome {
            Outcome::Succeeded => info!("{}: done in {:?}", step.name, result.elapsed),
            Outcome::AlreadySatisfied => info!("{}: already satisfied, skipped", step.name),
            outcome => warn!(
                "{}: {:?} after {} attempt(s), {} poll(s): {}",
                step.name,
                outcome,
                result.attempts,
                result.poll_attempts,
                result.detail.as_deref().unwrap_or("-")
            ),
        }
        (result, verdict)
    }

    async fn execute_inner(&self, step: &Step, result: &mut RunResult) -> Verdict {
        let cancel = &self.cancel;

        if let Some(guard) = &step.skip_when {
            result.poll_attempts += 1;
            match probe(self.runner, guard, cancel).await {
                Ok(Probe::Ready) => {
                    result.outcome = Outcome::AlreadySatisfied;
                    return Verdict::Continue;
                }
                Ok(Probe::NotReady(_)) => {}
                Err(_) => return cancelled(result),
            }
        }

        if let Some(action) = &step.action {
            let budget = if step.readiness.is_some() {
                1
            } else {
                step.max_retries.max(1)
            };

            let mut succeeded = false;
            while result.attempts < budget {
                if result.attempts > 0 {
                    tokio::select! {
                        _ = sleep(step.retry_interval) => {}
                        _ = cancel.cancelled() => return cancelled(result),
                    }
                }
                result.attempts += 1;

                match self.runner.run(action, cancel).await {
                    Ok(output) => {
                        result.exit_status = output.status;
                        result.output = output.combined();
                        if output.success() {
                            succeeded = true;
                            break;
                        }
                        result.detail = Some(output.failure_detail());
                        if budget > 1 {
                            info!(
                                "{}: attempt {}/{} failed: {}",
                                step.name,
                                result.attempts,
                                budget,
                                output.failure_detail()
                            );
                        }
                    }
                    Err(Error::Cancelled) => return cancelled(result),
                    Err(e) => {
                        result.outcome = Outcome::LaunchFailed;
                        result.detail = Some(e.to_string());
                        return Verdict::Fatal;
                    }
                }
            }

            if !succeeded {
                return if budget > 1 {
                    result.outcome = Outcome::TimedOut;
                    severity(step.fatal_on_timeout)
                } else {
                    result.outcome = Outcome::Failed;
                    severity(step.fatal)
                };
            }
        }

        if let Some(check) = &step.readiness {
            let outcome = poll(
                self.runner,
                check,
                step.max_retries,
                step.retry_interval,
                cancel,
            )
            .await;
            result.poll_attempts += outcome.attempts();
            match outcome {
                PollOutcome::Ready { .. } => {}
                PollOutcome::Exhausted { last_failure, .. } => {
                    result.outcome = Outcome::TimedOut;
                    result.detail = Some(format!("{check} never held: {last_failure}"));
                    return severity(step.fatal_on_timeout);
                }
                PollOutcome::Cancelled { .. } => return cancelled(result),
            }
        }

        result.outcome = Outcome::Succeeded;
        Verdict::Continue
    }
}

fn severity(fatal: bool) -> Verdict {
    if fatal { Verdict::Fatal } else { Verdict::Warning }
}

fn cancelled(result: &mut RunResult) -> Verdict {
    result.outcome = Outcome::Cancelled;
    Verdict::Cancelled
}

fn describe(step: &Step) -> String {
    match (&step.action, &step.readiness) {
        (Some(action), Some(check)) => format!("{}: {action}, then wait until {check}", step.name),
        (Some(action), None) => format!("{}: {action}", step.name),
        (None, Some(check)) => format!("{}: wait until {check}", step.name),
        (None, None) => format!("{}: nothing to do", step.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedRunner;
    use crate::utils::cancel::cancellation;
    use crate::{exit_zero, invocation};

    const APPLY: &str = "talosctl apply-config --insecure -n 10.0.0.10 --file controlplane.yaml";
    const ETCD: &str = "talosctl -n 10.0.0.10 service etcd";
    const BOOTSTRAP: &str = "talosctl bootstrap -n 10.0.0.10";
    const API: &str = "talosctl -n 10.0.0.10 get staticpodstatus";
    const KUBECONFIG: &str = "talosctl kubeconfig -n 10.0.0.10 --force";

    fn command(line: &str) -> Invocation {
        let mut parts = line.split(' ');
        let program = parts.next().unwrap();
        Invocation::new(program).args(parts)
    }

    /// The five step bootstrap scenario
    fn bootstrap_steps() -> Vec<Step> {
        vec![
            Step::action("apply-controlplane-config", command(APPLY)),
            Step::wait("wait-etcd", exit_zero!(command(ETCD)), 120, Duration::from_secs(5)),
            Step::action("bootstrap", command(BOOTSTRAP)),
            Step::wait("wait-kube-api", exit_zero!(command(API)), 60, Duration::from_secs(5)),
            Step::action("fetch-kubeconfig", command(KUBECONFIG))
                .with_retries(10, Duration::from_secs(5))
                .tolerate_timeout(),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn all_steps_succeed_first_time() {
        let runner = ScriptedRunner::new();
        let mut sequencer = Sequencer::new("bootstrap", &runner, Cancellation::never());

        let report = sequencer.run(&bootstrap_steps()).await;

        assert_eq!(report.state, SequenceState::Succeeded);
        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|r| r.outcome == Outcome::Succeeded));
        assert_eq!(report.total_poll_attempts(), 2);
        assert_eq!(
            runner.calls(),
            vec![APPLY, ETCD, BOOTSTRAP, API, KUBECONFIG]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn etcd_never_ready_halts_before_bootstrap() {
        let runner = ScriptedRunner::new().always_fail(ETCD);
        let mut sequencer = Sequencer::new("bootstrap", &runner, Cancellation::never());

        let report = sequencer.run(&bootstrap_steps()).await;

        assert_eq!(report.state, SequenceState::FailedFatal(1));
        let failing = report.failing_step().unwrap();
        assert_eq!(failing.step, "wait-etcd");
        assert_eq!(failing.outcome, Outcome::TimedOut);
        assert_eq!(failing.poll_attempts, 120);
        assert_eq!(
            report.not_attempted().collect::<Vec<_>>(),
            vec!["bootstrap", "wait-kube-api", "fetch-kubeconfig"]
        );
        assert_eq!(runner.count(BOOTSTRAP), 0);
        assert_eq!(runner.count(KUBECONFIG), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_action_failure_halts() {
        let runner = ScriptedRunner::new().always_fail(APPLY);
        let mut sequencer = Sequencer::new("bootstrap", &runner, Cancellation::never());

        let report = sequencer.run(&bootstrap_steps()).await;

        assert_eq!(report.state, SequenceState::FailedFatal(0));
        assert_eq!(report.results[0].outcome, Outcome::Failed);
        assert_eq!(report.results[0].exit_status, Some(1));
        assert_eq!(report.results.len(), 5);
        assert!(report.results[1..].iter().all(|r| r.outcome == Outcome::NotAttempted));
        assert_eq!(runner.calls(), vec![APPLY]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_fatal_failure_continues() {
        let steps = vec![
            Step::action("destroy", invocation!("virsh", "destroy", "talos-cp")).non_fatal(),
            Step::action("undefine", invocation!("virsh", "undefine", "talos-cp")),
        ];
        let runner = ScriptedRunner::new().always_fail("virsh destroy talos-cp");
        let mut sequencer = Sequencer::new("teardown", &runner, Cancellation::never());

        let report = sequencer.run(&steps).await;

        assert_eq!(report.state, SequenceState::CompletedWithWarnings);
        assert!(report.state.is_complete());
        assert_eq!(report.results[0].outcome, Outcome::Failed);
        assert_eq!(report.results[1].outcome, Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_action_retries_can_be_tolerated() {
        let runner = ScriptedRunner::new().always_fail(KUBECONFIG);
        let mut sequencer = Sequencer::new("bootstrap", &runner, Cancellation::never());

        let report = sequencer.run(&bootstrap_steps()).await;

        assert_eq!(report.state, SequenceState::CompletedWithWarnings);
        let fetch = &report.results[4];
        assert_eq!(fetch.outcome, Outcome::TimedOut);
        assert_eq!(fetch.attempts, 10);
        assert_eq!(runner.count(KUBECONFIG), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn action_retries_stop_on_success() {
        let runner = ScriptedRunner::new().fail_times(KUBECONFIG, 2);
        let steps = vec![
            Step::action("fetch-kubeconfig", command(KUBECONFIG))
                .with_retries(10, Duration::from_secs(5)),
        ];
        let report = Sequencer::new("kubeconfig", &runner, Cancellation::never())
            .run(&steps)
            .await;
        assert_eq!(report.state, SequenceState::Succeeded);
        assert_eq!(report.results[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_fatal_even_for_non_fatal_steps() {
        let steps = vec![
            Step::action("cilium", invocation!("helm", "upgrade", "--install")).non_fatal(),
            Step::action("argocd", invocation!("kubectl", "apply", "-k", "argocd")),
        ];
        let runner = ScriptedRunner::new().launch_failure("helm upgrade --install");
        let report = Sequencer::new("addons", &runner, Cancellation::never())
            .run(&steps)
            .await;
        assert_eq!(report.state, SequenceState::FailedFatal(0));
        assert_eq!(report.results[0].outcome, Outcome::LaunchFailed);
        assert!(report.results[0].detail.as_ref().unwrap().contains("helm"));
        assert_eq!(report.results[1].outcome, Outcome::NotAttempted);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_against_ready_target_only_runs_checks() {
        let steps: Vec<Step> = bootstrap_steps()
            .into_iter()
            .map(|step| match step.name.as_str() {
                "apply-controlplane-config" | "bootstrap" => step.skip_when(exit_zero!(command(ETCD))),
                "fetch-kubeconfig" => step.skip_when(exit_zero!(command(API))),
                _ => step.skip_if_ready(),
            })
            .collect();
        let runner = ScriptedRunner::new();

        let report = Sequencer::new("bootstrap", &runner, Cancellation::never())
            .run(&steps)
            .await;

        assert_eq!(report.state, SequenceState::Succeeded);
        assert!(report.results.iter().all(|r| r.outcome == Outcome::AlreadySatisfied));
        assert_eq!(report.actions_executed(), 0);
        assert_eq!(runner.count(APPLY), 0);
        assert_eq!(runner.count(BOOTSTRAP), 0);
        assert_eq!(runner.count(KUBECONFIG), 0);
        assert_eq!(runner.calls().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_sequence() {
        let runner = ScriptedRunner::new().always_fail(ETCD);
        let (handle, token) = cancellation();
        let steps = bootstrap_steps();

        let run = async {
            let mut sequencer = Sequencer::new("bootstrap", &runner, token);
            sequencer.run(&steps).await
        };
        let cancel = async {
            sleep(Duration::from_secs(12)).await;
            handle.cancel();
        };
        let (report, _) = tokio::join!(run, cancel);

        assert_eq!(report.state, SequenceState::Cancelled(1));
        assert_eq!(report.results[1].outcome, Outcome::Cancelled);
        assert_eq!(report.results[1].poll_attempts, 3);
        assert_eq!(report.results[0].outcome, Outcome::Succeeded);
        assert_eq!(report.not_attempted().count(), 3);
    }
}
