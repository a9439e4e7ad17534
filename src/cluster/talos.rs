//! Talos machine-config generation.
//!
//! Per-role patches are rendered from the configuration into a scoped temporary directory and
//! handed to `talosctl gen config`, which owns the actual machine-config schema.

use super::{cluster_endpoint, talosctl};
use crate::config::{ProvisionerConfig, Role};
use crate::engine::poller::Check;
use crate::engine::Step;
use crate::errors::Error;
use crate::host::libvirt::leases::ClusterAddresses;
use crate::invocation;
use crate::utils::Requirements;
use serde_derive::Serialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, instrument};

const GPU_KERNEL_MODULES: &[&str] = &["nvidia", "nvidia_uvm", "nvidia_drm", "nvidia_modeset"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub machine: MachinePatch,
    pub cluster: ClusterPatch,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePatch {
    #[serde(rename = "certSANs")]
    pub cert_sans: Vec<String>,
    pub network: NetworkPatch,
    pub install: InstallPatch,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelPatch>,
}

#[derive(Debug, Serialize)]
pub struct NetworkPatch {
    pub hostname: String,
    pub interfaces: Vec<InterfacePatch>,
    pub nameservers: Vec<IpAddr>,
}

#[derive(Debug, Serialize)]
pub struct InterfacePatch {
    pub interface: String,
    pub dhcp: bool,
    pub addresses: Vec<String>,
    pub routes: Vec<RoutePatch>,
}

#[derive(Debug, Serialize)]
pub struct RoutePatch {
    pub network: String,
    pub gateway: IpAddr,
}

#[derive(Debug, Serialize)]
pub struct InstallPatch {
    pub disk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub wipe: bool,
}

#[derive(Debug, Serialize)]
pub struct DiskPatch {
    pub device: String,
    pub partitions: Vec<PartitionPatch>,
}

#[derive(Debug, Serialize)]
pub struct PartitionPatch {
    pub mountpoint: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletPatch {
    pub extra_mounts: Vec<ExtraMount>,
}

#[derive(Debug, Serialize)]
pub struct ExtraMount {
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct KernelPatch {
    pub modules: Vec<KernelModule>,
}

#[derive(Debug, Serialize)]
pub struct KernelModule {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<ClusterNetworkPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server: Option<ApiServerPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_scheduling_on_control_planes: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ClusterNetworkPatch {
    pub cni: CniPatch,
}

#[derive(Debug, Serialize)]
pub struct CniPatch {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyPatch {
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerPatch {
    #[serde(rename = "certSANs")]
    pub cert_sans: Vec<String>,
}

/// Build the patch for one role. Addresses are the reconciled ones, so certificates and the
/// static network config match what the node actually leased.
pub fn build_patch(
    config: &ProvisionerConfig,
    role: Role,
    addresses: &ClusterAddresses,
) -> Result<ConfigPatch, Error> {
    let node = config.node(role);
    let address = addresses.get(role);
    let cert_sans = vec![address.to_string(), node.name.clone()];

    let network = NetworkPatch {
        hostname: node.name.clone(),
        interfaces: vec![InterfacePatch {
            interface: config.network.interface.clone(),
            dhcp: false,
            addresses: vec![config.node_cidr(address)?.to_string()],
            routes: vec![RoutePatch {
                network: default_route(config.network.gateway),
                gateway: config.network.gateway,
            }],
        }],
        nameservers: if config.network.nameservers.is_empty() {
            vec![config.network.gateway]
        } else {
            config.network.nameservers.clone()
        },
    };

    let persistent = role == Role::Worker && config.storage.enabled;
    let disks = if persistent {
        vec![DiskPatch {
            device: config.storage.device.clone(),
            partitions: vec![PartitionPatch {
                mountpoint: config.storage.mount_path.clone(),
            }],
        }]
    } else {
        Vec::new()
    };
    let kubelet = persistent.then(|| KubeletPatch {
        extra_mounts: vec![ExtraMount {
            destination: config.storage.mount_path.clone(),
            type_: String::from("bind"),
            source: config.storage.mount_path.clone(),
            options: ["bind", "rshared", "rw"].map(String::from).to_vec(),
        }],
    });
    let kernel = node.gpu_pci.as_ref().map(|_| KernelPatch {
        modules: GPU_KERNEL_MODULES
            .iter()
            .map(|name| KernelModule {
                name: name.to_string(),
            })
            .collect(),
    });

    let cilium = config.addons.cilium.enabled;
    let cluster = ClusterPatch {
        network: cilium.then(|| ClusterNetworkPatch {
            cni: CniPatch {
                name: String::from("none"),
            },
        }),
        proxy: cilium.then_some(ProxyPatch { disabled: true }),
        api_server: (role == Role::ControlPlane).then(|| ApiServerPatch {
            cert_sans: vec![addresses.controlplane.to_string()],
        }),
        allow_scheduling_on_control_planes: (role == Role::ControlPlane
            && config.talos.allow_scheduling_on_control_planes)
            .then_some(true),
    };

    Ok(ConfigPatch {
        machine: MachinePatch {
            cert_sans,
            network,
            install: InstallPatch {
                disk: config.talos.install_disk.clone(),
                image: config.talos.install_image.clone(),
                wipe: false,
            },
            disks,
            kubelet,
            kernel,
        },
        cluster,
    })
}

fn default_route(gateway: IpAddr) -> String {
    match gateway {
        IpAddr::V4(_) => String::from("0.0.0.0/0"),
        IpAddr::V6(_) => String::from("::/0"),
    }
}

/// Patch files for both roles. The directory is removed when this is dropped, so it must
/// outlive the sequence that reads the files.
pub struct RenderedPatches {
    _dir: TempDir,
    pub controlplane: PathBuf,
    pub worker: PathBuf,
}

impl RenderedPatches {
    #[instrument(skip_all)]
    pub fn render(config: &ProvisionerConfig, addresses: &ClusterAddresses) -> Result<Self, Error> {
        let dir = tempfile::Builder::new().prefix("talos-patches").tempdir()?;
        let controlplane = write_patch(dir.path(), config, Role::ControlPlane, addresses)?;
        let worker = write_patch(dir.path(), config, Role::Worker, addresses)?;
        Ok(RenderedPatches {
            _dir: dir,
            controlplane,
            worker,
        })
    }
}

fn write_patch(
    dir: &Path,
    config: &ProvisionerConfig,
    role: Role,
    addresses: &ClusterAddresses,
) -> Result<PathBuf, Error> {
    let path = dir.join(format!("{role}-patch.yaml"));
    let rendered = serde_yaml::to_string(&build_patch(config, role, addresses)?)?;
    debug!("{role} patch:\n{rendered}");
    fs::write(&path, rendered)?;
    Ok(path)
}

pub fn requirements() -> Requirements {
    Requirements::binaries(&["talosctl"])
}

/// Secrets, machine configs and the talosctl client context. Secrets are generated once
/// and reused, the machine configs are regenerated from them on every run.
pub fn config_steps(
    config: &ProvisionerConfig,
    addresses: &ClusterAddresses,
    patches: &RenderedPatches,
) -> Vec<Step> {
    let secrets = config.secrets_path();
    let artifacts = &config.artifacts_dir;
    let controlplane = addresses.controlplane.to_string();

    let mut generate = invocation!(
        "talosctl",
        "gen",
        "config",
        &config.cluster_name,
        cluster_endpoint(addresses.controlplane),
        "--with-secrets",
        secrets.display(),
        "--config-patch-control-plane",
        format!("@{}", patches.controlplane.display()),
        "--config-patch-worker",
        format!("@{}", patches.worker.display()),
        "--install-disk",
        &config.talos.install_disk,
        "--output-dir",
        artifacts.display(),
        "--force",
    )
    .current_dir(artifacts);
    if let Some(version) = &config.talos.kubernetes_version {
        generate = generate.args(["--kubernetes-version", version.as_str()]);
    }

    vec![
        Step::action(
            "gen-secrets",
            invocation!("talosctl", "gen", "secrets", "-o", secrets.display()).current_dir(artifacts),
        )
        .skip_when(Check::PathsExist(vec![secrets.clone()]))
        .with_hint(format!("remove a partial {} and re-run gen-config", secrets.display())),
        Step::action("gen-config", generate)
            .with_readiness(
                Check::PathsExist(vec![
                    config.machine_config_path(Role::ControlPlane),
                    config.machine_config_path(Role::Worker),
                    artifacts.join("talosconfig"),
                ]),
                1,
                Duration::ZERO,
            )
            .with_hint("check the rendered patches with `talosctl validate`"),
        Step::action(
            "talosconfig-endpoint",
            talosctl(config).args(["config", "endpoint", controlplane.as_str()]),
        ),
        Step::action(
            "talosconfig-node",
            talosctl(config).args(["config", "node", controlplane.as_str()]),
        ),
    ]
}
