use super::{KUBE_API_PORT, helm, kubectl};
use crate::config::ProvisionerConfig;
use crate::engine::poller::Check;
use crate::engine::Step;
use crate::host::libvirt::leases::ClusterAddresses;
use crate::utils::Requirements;
use crate::{exit_zero, output_contains};

const CILIUM_REPO: &str = "https://helm.cilium.io/";

/// Values Cilium needs on Talos: no kube-proxy, no cgroup automount, restricted capabilities
const CILIUM_TALOS_VALUES: &[&str] = &[
    "ipam.mode=kubernetes",
    "kubeProxyReplacement=true",
    "securityContext.capabilities.ciliumAgent={CHOWN,KILL,NET_ADMIN,NET_RAW,IPC_LOCK,SYS_ADMIN,SYS_RESOURCE,DAC_OVERRIDE,FOWNER,SETGID,SETUID}",
    "securityContext.capabilities.cleanCiliumState={NET_ADMIN,SYS_ADMIN,SYS_RESOURCE}",
    "cgroup.autoMount.enabled=false",
    "cgroup.hostRoot=/sys/fs/cgroup",
];

pub fn requirements(config: &ProvisionerConfig) -> Requirements {
    let addons = &config.addons;
    let mut requirements = if addons.cilium.enabled {
        Requirements::binaries(&["kubectl", "helm"])
    } else {
        Requirements::binaries(&["kubectl"])
    };
    requirements = requirements.file(config.kubeconfig_path());
    if addons.argocd.enabled {
        if let Some(dir) = &addons.argocd.kustomize_dir {
            requirements = requirements.file(dir);
        }
    }
    for manifest in &addons.monitoring.manifests {
        requirements = requirements.file(manifest);
    }
    requirements
}

fn rollout(config: &ProvisionerConfig, namespace: &str, resource: &str) -> Check {
    exit_zero!(kubectl(config).args([
        "-n",
        namespace,
        "rollout",
        "status",
        resource,
        "--timeout",
        "10s",
    ]))
}

fn cilium_steps(config: &ProvisionerConfig, addresses: &ClusterAddresses) -> Vec<Step> {
    let cilium = &config.addons.cilium;
    let timing = &config.timing.addons;

    let mut install = helm(config).args([
        "upgrade",
        "--install",
        "cilium",
        "cilium/cilium",
        "--version",
        cilium.version.as_str(),
        "--namespace",
        cilium.namespace.as_str(),
    ]);
    let values = CILIUM_TALOS_VALUES
        .iter()
        .map(|value| value.to_string())
        .chain([
            format!("k8sServiceHost={}", addresses.controlplane),
            format!("k8sServicePort={KUBE_API_PORT}"),
        ])
        .chain(cilium.values.iter().cloned());
    for value in values {
        install = install.arg("--set").arg(value);
    }

    vec![
        Step::action(
            "helm-repo-cilium",
            helm(config).args(["repo", "add", "cilium", CILIUM_REPO, "--force-update"]),
        )
        .skip_when(output_contains!(helm(config).args(["repo", "list"]), CILIUM_REPO)),
        Step::action("install-cilium", install)
            .with_readiness(
                rollout(config, &cilium.namespace, "daemonset/cilium"),
                timing.attempts,
                timing.interval(),
            )
            .skip_if_ready()
            .with_hint("nodes stay NotReady without a CNI, check `kubectl -n kube-system get pods`"),
    ]
}

fn argocd_steps(config: &ProvisionerConfig) -> Vec<Step> {
    let argocd = &config.addons.argocd;
    let namespace = argocd.namespace.as_str();
    let timing = &config.timing.addons;

    let install = match &argocd.kustomize_dir {
        Some(dir) => kubectl(config).arg("apply").arg("-k").arg(dir.display()),
        None => kubectl(config).args(["apply", "-n", namespace, "-f", argocd.manifest_url.as_str()]),
    };

    vec![
        Step::action(
            "argocd-namespace",
            kubectl(config).args(["create", "namespace", namespace]),
        )
        .skip_when(exit_zero!(kubectl(config).args(["get", "namespace", namespace]))),
        Step::action("install-argocd", install)
            .with_readiness(
                rollout(config, namespace, "deployment/argocd-server"),
                timing.attempts,
                timing.interval(),
            )
            .skip_if_ready(),
    ]
}

/// CNI, GitOps controller, monitoring exporters, then wait for every node to report Ready
pub fn addon_steps(config: &ProvisionerConfig, addresses: &ClusterAddresses) -> Vec<Step> {
    let addons = &config.addons;
    let mut steps = Vec::new();

    if addons.cilium.enabled {
        steps.extend(cilium_steps(config, addresses));
    }
    if addons.argocd.enabled {
        steps.extend(argocd_steps(config));
    }
    for manifest in &addons.monitoring.manifests {
        let name = manifest
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.display().to_string());
        // `kubectl diff` exits zero only when the live objects already match
        steps.push(
            Step::action(
                format!("apply-{name}"),
                kubectl(config).arg("apply").arg("-f").arg(manifest.display()),
            )
            .skip_when(exit_zero!(kubectl(config).arg("diff").arg("-f").arg(manifest.display()))),
        );
    }

    steps.push(
        Step::wait(
            "wait-nodes-ready",
            Check::KubeNodes {
                kubeconfig: config.kubeconfig_path(),
                min_ready: 2,
            },
            config.timing.nodes.attempts,
            config.timing.nodes.interval(),
        )
        .fatal_if(config.strict_join),
    );
    steps
}
