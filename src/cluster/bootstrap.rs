use super::{KUBE_API_PORT, talosctl};
use crate::config::{ProvisionerConfig, Role};
use crate::engine::poller::{Check, Expect};
use crate::engine::{Invocation, Step};
use crate::host::libvirt::leases::ClusterAddresses;
use crate::utils::Requirements;
use crate::{exit_zero, output_contains};
use std::net::{IpAddr, SocketAddr};

/// `talosctl -n <node> -e <endpoint>`
fn talosctl_on(config: &ProvisionerConfig, node: IpAddr, endpoint: IpAddr) -> Invocation {
    talosctl(config).arg("-n").arg(node).arg("-e").arg(endpoint)
}

/// Passes once the node accepts authenticated requests, i.e. left maintenance mode
fn configured(config: &ProvisionerConfig, node: IpAddr) -> Check {
    exit_zero!(talosctl_on(config, node, node).arg("version"))
}

fn registered_nodes(config: &ProvisionerConfig, count: usize) -> Check {
    Check::Command {
        invocation: super::kubectl(config).args(["get", "nodes", "--no-headers"]),
        expect: Expect::MinLines(count),
    }
}

fn apply_config(config: &ProvisionerConfig, role: Role, node: IpAddr) -> Invocation {
    talosctl(config)
        .args(["apply-config", "--insecure", "-n"])
        .arg(node)
        .arg("--file")
        .arg(config.machine_config_path(role).display())
}

pub fn requirements(config: &ProvisionerConfig) -> Requirements {
    Requirements::binaries(&["talosctl", "kubectl"])
        .file(config.machine_config_path(Role::ControlPlane))
        .file(config.machine_config_path(Role::Worker))
        .file(config.talosconfig_path())
}

/// Apply configs, bootstrap etcd, fetch credentials and wait for both nodes to register.
/// Worker steps are only fatal with `strict_join`.
pub fn bootstrap_steps(config: &ProvisionerConfig, addresses: &ClusterAddresses) -> Vec<Step> {
    let timing = &config.timing;
    let cp = addresses.controlplane;
    let worker = addresses.worker;
    let strict = config.strict_join;
    let kubeconfig = config.kubeconfig_path();
    let etcd = talosctl_on(config, cp, cp).args(["service", "etcd"]);

    vec![
        Step::wait(
            "wait-controlplane-apid",
            Check::TcpReachable(SocketAddr::new(cp, config.talos.api_port)),
            timing.talos_api.attempts,
            timing.talos_api.interval(),
        )
        .with_hint(format!("is {} booted from the Talos ISO? check `virsh console`", config.controlplane.name)),
        Step::action("apply-controlplane-config", apply_config(config, Role::ControlPlane, cp))
            .skip_when(configured(config, cp))
            .with_hint("the node may already be configured with other secrets, re-run teardown first"),
        Step::wait(
            "wait-etcd",
            exit_zero!(etcd.clone()),
            timing.etcd.attempts,
            timing.etcd.interval(),
        )
        .with_hint(format!("inspect `talosctl -n {cp} -e {cp} dmesg`")),
        Step::action("bootstrap", talosctl_on(config, cp, cp).arg("bootstrap"))
            .skip_when(output_contains!(etcd, "Running")),
        Step::wait(
            "wait-kube-apiserver",
            output_contains!(
                talosctl_on(config, cp, cp).args(["get", "staticpodstatus"]),
                "kube-apiserver"
            ),
            timing.kube_api.attempts,
            timing.kube_api.interval(),
        ),
        Step::action(
            "fetch-kubeconfig",
            talosctl_on(config, cp, cp)
                .arg("kubeconfig")
                .arg(kubeconfig.display())
                .arg("--force"),
        )
        .with_retries(timing.kubeconfig.attempts, timing.kubeconfig.interval())
        .tolerate_timeout()
        .skip_when(Check::KubeconfigFor {
            kubeconfig: kubeconfig.clone(),
            api_server: SocketAddr::new(cp, KUBE_API_PORT),
        })
        .with_hint(format!("fetch it later with `talosctl -n {cp} kubeconfig`")),
        Step::wait(
            "wait-controlplane-registered",
            registered_nodes(config, 1),
            timing.nodes.attempts,
            timing.nodes.interval(),
        ),
        Step::wait(
            "wait-worker-apid",
            Check::TcpReachable(SocketAddr::new(worker, config.talos.api_port)),
            timing.talos_api.attempts,
            timing.talos_api.interval(),
        )
        .fatal_if(strict),
        Step::action("apply-worker-config", apply_config(config, Role::Worker, worker))
            .skip_when(configured(config, worker))
            .fatal_if(strict),
        Step::wait(
            "wait-worker-joined",
            registered_nodes(config, 2),
            timing.nodes.attempts,
            timing.nodes.interval(),
        )
        .fatal_if(strict)
        .with_hint(format!("check `talosctl -n {worker} -e {worker} logs kubelet`")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sequencer::{Outcome, SequenceReport, SequenceState, Sequencer};
    use crate::engine::testing::ScriptedRunner;
    use crate::utils::cancel::Cancellation;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const LOCAL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
    const VERSION: &str = "talosctl -n 127.0.0.1 -e 127.0.0.1 version";
    const ETCD: &str = "talosctl -n 127.0.0.1 -e 127.0.0.1 service etcd";
    const BOOTSTRAP: &str = "talosctl -n 127.0.0.1 -e 127.0.0.1 bootstrap";
    const PODS: &str = "talosctl -n 127.0.0.1 -e 127.0.0.1 get staticpodstatus";
    const NODES: &str = "kubectl get nodes --no-headers";

    /// Both nodes on loopback with a listener standing in for apid
    struct Lab {
        config: ProvisionerConfig,
        addresses: ClusterAddresses,
        _artifacts: TempDir,
        _apid: TcpListener,
    }

    fn lab(strict_join: bool) -> Lab {
        let artifacts = tempfile::tempdir().unwrap();
        let apid = TcpListener::bind((LOCAL, 0)).unwrap();
        let mut config = ProvisionerConfig::default();
        config.artifacts_dir = artifacts.path().to_path_buf();
        config.talos.api_port = apid.local_addr().unwrap().port();
        config.strict_join = strict_join;
        Lab {
            config,
            addresses: ClusterAddresses {
                controlplane: LOCAL,
                worker: LOCAL,
            },
            _artifacts: artifacts,
            _apid: apid,
        }
    }

    fn fresh_cluster() -> ScriptedRunner {
        ScriptedRunner::new()
            .always_fail(VERSION)
            .respond(PODS, 0, "127.0.0.1   k8s   StaticPodStatus   kube-system/kube-apiserver-talos-cp\n")
            .respond(NODES, 0, "talos-cp       NotReady   control-plane   1m\ntalos-worker   NotReady   <none>   5s\n")
    }

    fn kubeconfig_for(server: &str) -> String {
        format!(
            "apiVersion: v1
kind: Config
clusters:
- name: lab
  cluster:
    server: {server}
contexts:
- name: admin@lab
  context:
    cluster: lab
    user: admin@lab
current-context: admin@lab
users:
- name: admin@lab
  user:
    token: secret
"
        )
    }

    async fn run(lab: &Lab, runner: &ScriptedRunner) -> SequenceReport {
        Sequencer::new("bootstrap", runner, Cancellation::never())
            .run(&bootstrap_steps(&lab.config, &lab.addresses))
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cluster_is_bootstrapped_once() {
        let lab = lab(false);
        let runner = fresh_cluster();

        let report = run(&lab, &runner).await;

        assert_eq!(report.state, SequenceState::Succeeded);
        assert_eq!(runner.count(BOOTSTRAP), 1);
        let applies: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("talosctl apply-config --insecure -n 127.0.0.1"))
            .collect();
        assert_eq!(applies.len(), 2);
        assert!(applies[0].ends_with("controlplane.yaml"));
        assert!(applies[1].ends_with("worker.yaml"));
        assert_eq!(report.results[5].outcome, Outcome::Succeeded);
        assert_eq!(report.results[5].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn etcd_never_ready_stops_before_credentials() {
        let lab = lab(false);
        let runner = fresh_cluster().always_fail(ETCD);

        let report = run(&lab, &runner).await;

        assert_eq!(report.state, SequenceState::FailedFatal(2));
        assert_eq!(report.results[2].poll_attempts, 120);
        assert_eq!(runner.count(BOOTSTRAP), 0);
        assert!(runner.calls().iter().all(|call| !call.contains(" kubeconfig ")));
        assert_eq!(report.not_attempted().count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_that_never_joins_is_a_warning_by_default() {
        let lab = lab(false);
        let runner = fresh_cluster().respond(NODES, 0, "talos-cp   NotReady   control-plane   1m\n");

        let report = run(&lab, &runner).await;

        assert_eq!(report.state, SequenceState::CompletedWithWarnings);
        assert_eq!(report.results[9].outcome, Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_join_makes_worker_failures_fatal() {
        let lab = lab(true);
        let runner = fresh_cluster().respond(NODES, 0, "talos-cp   NotReady   control-plane   1m\n");

        let report = run(&lab, &runner).await;

        assert_eq!(report.state, SequenceState::FailedFatal(9));
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_on_bootstrapped_cluster_changes_nothing() {
        let lab = lab(false);
        std::fs::write(lab.config.kubeconfig_path(), kubeconfig_for("https://127.0.0.1:6443")).unwrap();
        let runner = fresh_cluster()
            .respond(VERSION, 0, "Server: v1.7.6")
            .respond(ETCD, 0, "STATE    Running\nHEALTH   OK\n");

        let report = run(&lab, &runner).await;

        assert_eq!(report.state, SequenceState::Succeeded);
        assert_eq!(report.actions_executed(), 0);
        assert!(runner.calls().iter().all(|call| !call.contains("apply-config")));
        assert_eq!(runner.count(BOOTSTRAP), 0);
        for index in [1, 3, 5, 8] {
            assert_eq!(report.results[index].outcome, Outcome::AlreadySatisfied);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kubeconfig_of_another_cluster_is_replaced() {
        let lab = lab(false);
        std::fs::write(lab.config.kubeconfig_path(), kubeconfig_for("https://10.0.0.99:6443")).unwrap();
        let runner = fresh_cluster()
            .respond(VERSION, 0, "Server: v1.7.6")
            .respond(ETCD, 0, "STATE    Running\nHEALTH   OK\n");

        let report = run(&lab, &runner).await;

        assert_eq!(report.results[5].step, "fetch-kubeconfig");
        assert_eq!(report.results[5].outcome, Outcome::Succeeded);
        let fetch = format!(
            "talosctl -n 127.0.0.1 -e 127.0.0.1 kubeconfig {} --force",
            lab.config.kubeconfig_path().display()
        );
        assert_eq!(runner.count(&fetch), 1);
    }
}
