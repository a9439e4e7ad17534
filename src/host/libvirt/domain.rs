use super::leases::lease_lookup;
use super::virsh;
use crate::config::{NodeConfig, ProvisionerConfig, Role};
use crate::engine::{Invocation, Step};
use crate::{exit_zero, invocation, output_contains};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

const PREFIX: &str = "52:54:00";

/// Takes a VM name and the libvirt network it is attached to and generates
/// a stable MAC address based on a hash of the information
pub fn generate_mac_address(vm_name: &str, network: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vm_name);
    hasher.update(network);
    hasher.update([index as u8]);
    let hash = hasher.finalize();
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        PREFIX, hash[29], hash[30], hash[31]
    )
}

/// Everything virt-install needs to define one Talos node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk: PathBuf,
    pub disk_gib: u64,
    /// Second disk backing the persistent mount
    pub data_disk: Option<(PathBuf, u64)>,
    pub network: String,
    pub mac: String,
    pub iso: PathBuf,
    pub os_variant: String,
    pub gpu_pci: Option<String>,
}

impl VmSpec {
    pub fn for_role(config: &ProvisionerConfig, role: Role) -> Self {
        let node: &NodeConfig = config.node(role);
        let data_disk = (role == Role::Worker && config.storage.enabled).then(|| {
            (
                config
                    .storage
                    .host_path
                    .join(format!("{}-persistent.qcow2", node.name)),
                config.storage.size.gibibytes_ceil(),
            )
        });

        VmSpec {
            name: node.name.clone(),
            vcpus: node.vcpus,
            memory_mib: node.memory.mebibytes(),
            disk: config.libvirt.images_dir.join(format!("{}.qcow2", node.name)),
            disk_gib: node.disk_size.gibibytes_ceil(),
            data_disk,
            network: config.libvirt.network.clone(),
            mac: generate_mac_address(&node.name, &config.libvirt.network, 0),
            iso: config.libvirt.iso.clone(),
            os_variant: config.libvirt.os_variant.clone(),
            gpu_pci: node.gpu_pci.clone(),
        }
    }

    pub fn virt_install(&self, uri: &str) -> Invocation {
        let mut install = invocation!(
            "virt-install",
            "--connect",
            uri,
            "--name",
            &self.name,
            "--vcpus",
            self.vcpus,
            "--memory",
            self.memory_mib,
            "--cpu",
            "host-passthrough",
            "--os-variant",
            &self.os_variant,
            "--disk",
            format!("path={},size={},format=qcow2,bus=virtio", self.disk.display(), self.disk_gib),
        );
        if let Some((path, size)) = &self.data_disk {
            install = install.args([
                "--disk".to_string(),
                format!("path={},size={},format=qcow2,bus=virtio", path.display(), size),
            ]);
        }
        install = install.args([
            "--cdrom".to_string(),
            self.iso.display().to_string(),
            "--network".to_string(),
            format!("network={},mac={},model=virtio", self.network, self.mac),
            "--boot".to_string(),
            "hd,cdrom".to_string(),
            "--graphics".to_string(),
            "none".to_string(),
            "--noautoconsole".to_string(),
        ]);
        if let Some(pci) = &self.gpu_pci {
            install = install.args(["--host-device", pci.as_str()]);
        }
        install
    }
}

/// Define and start both nodes, then wait for each to lease its address. Existing or running
/// domains are left alone, so the plan can be re-run after a partial failure. A missing lease
/// is only a warning: reconciliation then falls back to the configured address.
pub fn create_steps(config: &ProvisionerConfig) -> Vec<Step> {
    let timing = &config.timing.vm_running;
    let lease = &config.timing.lease;
    let mut steps = Vec::new();

    for role in [Role::ControlPlane, Role::Worker] {
        let spec = VmSpec::for_role(config, role);
        let defined = exit_zero!(virsh(config).args(["dominfo", spec.name.as_str()]));
        let running = output_contains!(virsh(config).args(["domstate", spec.name.as_str()]), "running");

        steps.push(
            Step::action(format!("define-{}", spec.name), spec.virt_install(&config.libvirt.uri))
                .skip_when(defined)
                .with_hint(format!(
                    "check `virsh -c {} dominfo {}` and the virt-install output, then re-run create-vms",
                    config.libvirt.uri, spec.name
                )),
        );
        steps.push(
            Step::action(
                format!("start-{}", spec.name),
                virsh(config).args(["start", spec.name.as_str()]),
            )
            .with_readiness(running, timing.attempts, timing.interval())
            .skip_if_ready()
            .with_hint(format!("inspect `virsh -c {} domstate {} --reason`", config.libvirt.uri, spec.name)),
        );
        steps.push(
            Step::wait(
                format!("wait-{}-lease", spec.name),
                output_contains!(lease_lookup(config, &spec.name), spec.mac.as_str()),
                lease.attempts,
                lease.interval(),
            )
            .non_fatal(),
        );
    }
    steps
}

/// Stop and remove both domains including their storage. Every step tolerates failure since
/// the domain may already be gone.
pub fn teardown_steps(config: &ProvisionerConfig) -> Vec<Step> {
    let mut steps = Vec::new();
    for role in [Role::Worker, Role::ControlPlane] {
        let name = config.node(role).name.as_str();
        let stopped = output_contains!(virsh(config).args(["domstate", name]), "shut off");

        steps.push(
            Step::action(format!("destroy-{name}"), virsh(config).args(["destroy", name]))
                .skip_when(stopped)
                .non_fatal(),
        );
        steps.push(
            Step::action(
                format!("undefine-{name}"),
                virsh(config).args(["undefine", name, "--remove-all-storage"]),
            )
            .non_fatal()
            .with_hint(format!("domain {name} may need manual cleanup")),
        );
    }
    steps
}
