use super::runner::{CommandRunner, Invocation};
use crate::cluster::kube::{api_server_of, count_ready_nodes};
use crate::errors::Error;
use crate::utils::cancel::Cancellation;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How a command's result is interpreted as "ready"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    ExitZero,
    /// Exit zero and at least this many non-blank lines on stdout
    MinLines(usize),
    /// Exit zero and stdout contains the text
    Contains(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Command {
        invocation: Invocation,
        expect: Expect,
    },
    /// Every one of these files exists
    PathsExist(Vec<PathBuf>),
    TcpReachable(SocketAddr),
    /// At least `min_ready` nodes report the `Ready` condition through the Kubernetes API
    KubeNodes {
        kubeconfig: PathBuf,
        min_ready: usize,
    },
    /// The kubeconfig's current context points at this API server
    KubeconfigFor {
        kubeconfig: PathBuf,
        api_server: SocketAddr,
    },
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Command { invocation, expect } => match expect {
                Expect::ExitZero => write!(f, "`{invocation}` succeeds"),
                Expect::MinLines(lines) => write!(f, "`{invocation}` prints {lines}+ lines"),
                Expect::Contains(text) => write!(f, "`{invocation}` reports {text:?}"),
            },
            Check::PathsExist(paths) => {
                let paths: Vec<_> = paths.iter().map(|path| path.display().to_string()).collect();
                write!(f, "{} exist(s)", paths.join(", "))
            }
            Check::TcpReachable(address) => write!(f, "{address} accepts connections"),
            Check::KubeNodes { min_ready, .. } => write!(f, "{min_ready}+ nodes Ready"),
            Check::KubeconfigFor {
                kubeconfig,
                api_server,
            } => write!(f, "{} points at {api_server}", kubeconfig.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Ready,
    NotReady(String),
}

/// Evaluate a check exactly once. Only cancellation is an error; every other failure,
/// including a check command that cannot be launched, is `NotReady`.
pub async fn probe(
    runner: &dyn CommandRunner,
    check: &Check,
    cancel: &Cancellation,
) -> Result<Probe, Error> {
    match check {
        Check::Command { invocation, expect } => match runner.run(invocation, cancel).await {
            Ok(output) if !output.success() => Ok(Probe::NotReady(output.failure_detail())),
            Ok(output) => Ok(match expect {
                Expect::ExitZero => Probe::Ready,
                Expect::MinLines(wanted) => {
                    let lines = output
                        .stdout
                        .lines()
                        .filter(|line| !line.trim().is_empty())
                        .count();
                    if lines >= *wanted {
                        Probe::Ready
                    } else {
                        Probe::NotReady(format!("{lines} of {wanted} expected lines"))
                    }
                }
                Expect::Contains(text) if output.stdout.contains(text.as_str()) => Probe::Ready,
                Expect::Contains(text) => Probe::NotReady(format!("output lacks {text:?}")),
            }),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => Ok(Probe::NotReady(e.to_string())),
        },
        Check::PathsExist(paths) => Ok(match paths.iter().find(|path| !path.exists()) {
            Some(missing) => Probe::NotReady(format!("{} missing", missing.display())),
            None => Probe::Ready,
        }),
        Check::TcpReachable(address) => {
            let attempt = timeout(CONNECT_TIMEOUT, TcpStream::connect(address));
            tokio::select! {
                result = attempt => Ok(match result {
                    Ok(Ok(_)) => Probe::Ready,
                    Ok(Err(e)) => Probe::NotReady(format!("{address}: {e}")),
                    Err(_) => Probe::NotReady(format!("{address}: connect timed out")),
                }),
                _ = cancel.cancelled() => Err(Error::Cancelled),
            }
        }
        Check::KubeNodes {
            kubeconfig,
            min_ready,
        } => {
            tokio::select! {
                result = count_ready_nodes(kubeconfig) => Ok(match result {
                    Ok(ready) if ready >= *min_ready => Probe::Ready,
                    Ok(ready) => Probe::NotReady(format!("{ready} of {min_ready} nodes Ready")),
                    Err(e) => Probe::NotReady(e.to_string()),
                }),
                _ = cancel.cancelled() => Err(Error::Cancelled),
            }
        }
        Check::KubeconfigFor {
            kubeconfig,
            api_server,
        } => Ok(match api_server_of(kubeconfig).await {
            Ok(server) if server == api_server.to_string() => Probe::Ready,
            Ok(server) => Probe::NotReady(format!("{} points at {server}", kubeconfig.display())),
            Err(e) => Probe::NotReady(e.to_string()),
        }),
    }
}

/// Terminal result of one poll; produced exactly once per call to [`poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32, last_failure: String },
    Cancelled { attempts: u32 },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts }
            | PollOutcome::Exhausted { attempts, .. }
            | PollOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Probe `check` until it is ready or `max_attempts` probes have failed, sleeping `interval`
/// between attempts. A budget of zero is treated as one attempt.
pub async fn poll(
    runner: &dyn CommandRunner,
    check: &Check,
    max_attempts: u32,
    interval: Duration,
    cancel: &Cancellation,
) -> PollOutcome {
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;
    let mut last_failure = String::new();

    while attempts < max_attempts {
        if attempts > 0 {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = cancel.cancelled() => return PollOutcome::Cancelled { attempts },
            }
        }
        attempts += 1;

        match probe(runner, check, cancel).await {
            Ok(Probe::Ready) => {
                debug!("{check}: ready after {attempts} attempt(s)");
                return PollOutcome::Ready { attempts };
            }
            Ok(Probe::NotReady(detail)) => {
                info!("waiting until {check} ({attempts}/{max_attempts}): {detail}");
                last_failure = detail;
            }
            Err(_) => return PollOutcome::Cancelled { attempts },
        }
    }

    PollOutcome::Exhausted {
        attempts,
        last_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedRunner;
    use crate::utils::cancel::cancellation;
    use crate::{exit_zero, invocation};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    fn etcd_check() -> Check {
        exit_zero!(invocation!("talosctl", "service", "etcd"))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_nth_attempt_within_budget() {
        let runner = ScriptedRunner::new().fail_times("talosctl service etcd", 4);
        let started = Instant::now();

        let outcome = poll(&runner, &etcd_check(), 10, Duration::from_secs(5), &Cancellation::never()).await;

        assert_eq!(outcome, PollOutcome::Ready { attempts: 5 });
        assert_eq!(runner.count("talosctl service etcd"), 5);
        // Four sleeps between five attempts, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_when_budget_is_smaller() {
        let runner = ScriptedRunner::new().fail_times("talosctl service etcd", 4);

        let outcome = poll(&runner, &etcd_check(), 3, Duration::from_secs(5), &Cancellation::never()).await;

        match outcome {
            PollOutcome::Exhausted {
                attempts,
                last_failure,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_failure.starts_with("exit status 1"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(runner.count("talosctl service etcd"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_still_probes_once() {
        let runner = ScriptedRunner::new();
        let outcome = poll(&runner, &etcd_check(), 0, Duration::from_secs(5), &Cancellation::never()).await;
        assert_eq!(outcome, PollOutcome::Ready { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failures_are_retried_like_any_failure() {
        let runner = ScriptedRunner::new().launch_failure("talosctl service etcd");
        let outcome = poll(&runner, &etcd_check(), 4, Duration::from_secs(1), &Cancellation::never()).await;
        assert_eq!(outcome.attempts(), 4);
        assert!(matches!(outcome, PollOutcome::Exhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let runner = ScriptedRunner::new().fail_times("talosctl service etcd", 100);
        let (handle, token) = cancellation();

        let poll_task = async { poll(&runner, &etcd_check(), 100, Duration::from_secs(60), &token).await };
        let cancel_task = async {
            sleep(Duration::from_secs(90)).await;
            handle.cancel();
        };
        let (outcome, _) = tokio::join!(poll_task, cancel_task);

        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 2 });
    }

    #[tokio::test]
    async fn min_lines_counts_non_blank_lines() {
        let nodes = invocation!("kubectl", "get", "nodes", "--no-headers");
        let check = Check::Command {
            invocation: nodes.clone(),
            expect: Expect::MinLines(2),
        };
        let runner = ScriptedRunner::new().respond(
            "kubectl get nodes --no-headers",
            0,
            "talos-cp   Ready   control-plane   5m   v1.30.0\n\n",
        );
        assert_eq!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::NotReady(String::from("1 of 2 expected lines"))
        );

        let runner = ScriptedRunner::new().respond(
            "kubectl get nodes --no-headers",
            0,
            "talos-cp   Ready\ntalos-worker   NotReady\n",
        );
        assert_eq!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::Ready
        );
    }

    #[tokio::test]
    async fn contains_requires_success_and_text() {
        let check = crate::output_contains!(invocation!("virsh", "domstate", "talos-cp"), "running");
        let runner = ScriptedRunner::new().respond("virsh domstate talos-cp", 0, "shut off\n");
        assert!(matches!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::NotReady(_)
        ));
        let runner = ScriptedRunner::new().respond("virsh domstate talos-cp", 0, "running\n");
        assert_eq!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::Ready
        );
    }

    #[tokio::test]
    async fn path_and_tcp_checks() {
        let runner = ScriptedRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("kubeconfig");
        let check = Check::PathsExist(vec![kubeconfig.clone()]);
        assert!(matches!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::NotReady(_)
        ));
        std::fs::write(&kubeconfig, "apiVersion: v1").unwrap();
        assert_eq!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::Ready
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let check = Check::TcpReachable(listener.local_addr().unwrap());
        assert_eq!(
            probe(&runner, &check, &Cancellation::never()).await.unwrap(),
            Probe::Ready
        );
        assert!(runner.calls().is_empty());
    }
}
