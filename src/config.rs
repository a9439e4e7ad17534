//! Immutable provisioning configuration.
//!
//! Loaded once from a YAML file, then overridden by the environment variables the old
//! provisioning scripts consumed (`TALOSCONFIG`, `KUBECONFIG`, `CONTROLPLANE_IP`, `WORKER_IP`,
//! `PERSISTENT_MOUNT_PATH`, `PERSISTENT_HOST_PATH`, `GPU_PCI`). Everything downstream receives
//! a shared reference and never mutates it.

use crate::errors::Error;
use humanize_rs::bytes::Bytes;
use ipnet::IpNet;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "provisioner.yaml";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Byte size written the human way, e.g. `4 GiB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Size(u64);

impl Size {
    pub const fn from_bytes(bytes: u64) -> Self {
        Size(bytes)
    }

    pub fn mebibytes(&self) -> u64 {
        self.0 / MIB
    }

    /// Whole GiB, rounded up, as virt-install expects for `--disk size=`
    pub fn gibibytes_ceil(&self) -> u64 {
        self.0.div_ceil(GIB)
    }
}

impl TryFrom<String> for Size {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Size(value.parse::<Bytes<u64>>()?.size()))
    }
}

/// Delay written the human way, e.g. `5s`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Interval(Duration);

impl Interval {
    pub const fn from_secs(secs: u64) -> Self {
        Interval(Duration::from_secs(secs))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl TryFrom<String> for Interval {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Interval(humanize_rs::duration::parse(&value)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::ControlPlane => f.write_str("control-plane"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
    pub network: String,
    pub images_dir: PathBuf,
    pub iso: PathBuf,
    pub os_variant: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        LibvirtConfig {
            uri: String::from("qemu:///system"),
            network: String::from("default"),
            images_dir: PathBuf::from("/var/lib/libvirt/images"),
            iso: PathBuf::from("/var/lib/libvirt/images/metal-amd64.iso"),
            os_variant: String::from("linux2022"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub cidr: IpNet,
    pub gateway: IpAddr,
    pub nameservers: Vec<IpAddr>,
    pub interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            cidr: IpNet::V4("192.168.122.0/24".parse().expect("static CIDR")),
            gateway: IpAddr::from([192, 168, 122, 1]),
            nameservers: vec![IpAddr::from([192, 168, 122, 1])],
            interface: String::from("eth0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory")]
    pub memory: Size,
    #[serde(default = "default_disk_size")]
    pub disk_size: Size,
    /// PCI address (`0000:01:00.0`) of a host GPU passed through to this node
    #[serde(default)]
    pub gpu_pci: Option<String>,
}

fn default_vcpus() -> u32 {
    2
}

fn default_memory() -> Size {
    Size::from_bytes(4 * GIB)
}

fn default_disk_size() -> Size {
    Size::from_bytes(20 * GIB)
}

impl NodeConfig {
    fn new(name: &str, ip: [u8; 4]) -> Self {
        NodeConfig {
            name: String::from(name),
            ip: IpAddr::from(ip),
            vcpus: default_vcpus(),
            memory: default_memory(),
            disk_size: default_disk_size(),
            gpu_pci: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    /// Device of the second virtio disk inside the worker
    pub device: String,
    pub size: Size,
    /// Where the disk is mounted inside the node and bind-mounted into the kubelet
    pub mount_path: PathBuf,
    /// Directory on the hypervisor holding the persistent disk image
    pub host_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            enabled: true,
            device: String::from("/dev/vdb"),
            size: Size::from_bytes(50 * GIB),
            mount_path: PathBuf::from("/var/mnt/persistent"),
            host_path: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TalosConfig {
    pub install_disk: String,
    pub install_image: Option<String>,
    pub kubernetes_version: Option<String>,
    /// Let workloads run on the control plane, for single-worker labs
    pub allow_scheduling_on_control_planes: bool,
    /// Port of the Talos API (apid) on every node
    pub api_port: u16,
}

impl Default for TalosConfig {
    fn default() -> Self {
        TalosConfig {
            install_disk: String::from("/dev/vda"),
            install_image: None,
            kubernetes_version: None,
            allow_scheduling_on_control_planes: false,
            api_port: 50000,
        }
    }
}

/// Attempt budget and fixed delay for one readiness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollConfig {
    pub attempts: u32,
    pub interval: Interval,
}

impl PollConfig {
    pub const fn new(attempts: u32, interval_secs: u64) -> Self {
        PollConfig {
            attempts,
            interval: Interval::from_secs(interval_secs),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval.duration()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub vm_running: PollConfig,
    /// Waiting for a freshly started domain to obtain its DHCP lease
    pub lease: PollConfig,
    pub talos_api: PollConfig,
    pub etcd: PollConfig,
    pub kube_api: PollConfig,
    pub kubeconfig: PollConfig,
    pub nodes: PollConfig,
    pub addons: PollConfig,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            vm_running: PollConfig::new(30, 2),
            lease: PollConfig::new(30, 2),
            talos_api: PollConfig::new(60, 5),
            etcd: PollConfig::new(120, 5),
            kube_api: PollConfig::new(60, 5),
            kubeconfig: PollConfig::new(10, 5),
            nodes: PollConfig::new(60, 5),
            addons: PollConfig::new(60, 5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CiliumConfig {
    pub enabled: bool,
    pub version: String,
    pub namespace: String,
    /// Extra `--set` values passed to helm
    pub values: Vec<String>,
}

impl Default for CiliumConfig {
    fn default() -> Self {
        CiliumConfig {
            enabled: true,
            version: String::from("1.16.1"),
            namespace: String::from("kube-system"),
            values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArgocdConfig {
    pub enabled: bool,
    pub namespace: String,
    /// Kustomization applied with `kubectl apply -k`; the upstream install manifest otherwise
    pub kustomize_dir: Option<PathBuf>,
    pub manifest_url: String,
}

impl Default for ArgocdConfig {
    fn default() -> Self {
        ArgocdConfig {
            enabled: false,
            namespace: String::from("argocd"),
            kustomize_dir: None,
            manifest_url: String::from(
                "https://raw.githubusercontent.com/argoproj/argo-cd/stable/manifests/install.yaml",
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Exporter manifests (node-exporter, gpu exporters, ...) applied with `kubectl apply -f`
    pub manifests: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AddonsConfig {
    pub cilium: CiliumConfig,
    pub argocd: ArgocdConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub cluster_name: String,
    pub artifacts_dir: PathBuf,
    pub talosconfig: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub libvirt: LibvirtConfig,
    pub network: NetworkConfig,
    pub controlplane: NodeConfig,
    pub worker: NodeConfig,
    pub storage: StorageConfig,
    pub talos: TalosConfig,
    pub timing: TimingConfig,
    pub addons: AddonsConfig,
    /// Treat an unreachable or non-joining worker as fatal instead of a warning
    pub strict_join: bool,
    pub report_path: Option<PathBuf>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        ProvisionerConfig {
            cluster_name: String::from("talos"),
            artifacts_dir: PathBuf::from("_out"),
            talosconfig: None,
            kubeconfig: None,
            libvirt: LibvirtConfig::default(),
            network: NetworkConfig::default(),
            controlplane: NodeConfig::new("talos-cp", [192, 168, 122, 10]),
            worker: NodeConfig::new("talos-worker", [192, 168, 122, 11]),
            storage: StorageConfig::default(),
            talos: TalosConfig::default(),
            timing: TimingConfig::default(),
            addons: AddonsConfig::default(),
            strict_join: false,
            report_path: None,
        }
    }
}

impl ProvisionerConfig {
    /// Read the configuration file and apply environment overrides.
    ///
    /// An explicitly requested file must exist. When `path` is `None` the default file is used
    /// if present, built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) if !path.exists() => return Err(Error::FileMissing(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                info!("No {DEFAULT_CONFIG_PATH} found, using built-in defaults");
                ProvisionerConfig::default()
            }
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path).map_err(|e| Error::ConfigRead(path.to_path_buf(), e))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply the script-era environment variables, looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_ip = |key: &str, value: String| {
            value
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| Error::InvalidConfig(format!("{key}={value}: {e}")))
        };

        if let Some(value) = lookup("TALOSCONFIG") {
            self.talosconfig = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("KUBECONFIG") {
            self.kubeconfig = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("CONTROLPLANE_IP") {
            self.controlplane.ip = parse_ip("CONTROLPLANE_IP", value)?;
        }
        if let Some(value) = lookup("WORKER_IP") {
            self.worker.ip = parse_ip("WORKER_IP", value)?;
        }
        if let Some(value) = lookup("PERSISTENT_MOUNT_PATH") {
            self.storage.mount_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("PERSISTENT_HOST_PATH") {
            self.storage.host_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("GPU_PCI").filter(|value| !value.trim().is_empty()) {
            self.worker.gpu_pci = Some(value.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.controlplane.name == self.worker.name {
            return Err(Error::InvalidConfig(format!(
                "control plane and worker share the domain name {}",
                self.worker.name
            )));
        }
        if self.controlplane.ip == self.worker.ip {
            return Err(Error::InvalidConfig(format!(
                "control plane and worker share the address {}",
                self.worker.ip
            )));
        }
        for timing in [
            &self.timing.vm_running,
            &self.timing.lease,
            &self.timing.talos_api,
            &self.timing.etcd,
            &self.timing.kube_api,
            &self.timing.kubeconfig,
            &self.timing.nodes,
            &self.timing.addons,
        ] {
            if timing.attempts == 0 {
                return Err(Error::InvalidConfig(String::from(
                    "every readiness poll needs at least one attempt",
                )));
            }
        }
        for node in [&self.controlplane, &self.worker] {
            if !self.network.cidr.contains(&node.ip) {
                warn!(
                    "{} address {} is outside of {}",
                    node.name, node.ip, self.network.cidr
                );
            }
        }
        Ok(())
    }

    pub fn node(&self, role: Role) -> &NodeConfig {
        match role {
            Role::ControlPlane => &self.controlplane,
            Role::Worker => &self.worker,
        }
    }

    pub fn talosconfig_path(&self) -> PathBuf {
        self.talosconfig
            .clone()
            .unwrap_or_else(|| self.artifacts_dir.join("talosconfig"))
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig
            .clone()
            .unwrap_or_else(|| self.artifacts_dir.join("kubeconfig"))
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.artifacts_dir.join("secrets.yaml")
    }

    pub fn machine_config_path(&self, role: Role) -> PathBuf {
        match role {
            Role::ControlPlane => self.artifacts_dir.join("controlplane.yaml"),
            Role::Worker => self.artifacts_dir.join("worker.yaml"),
        }
    }

    /// Static address of a node in CIDR notation, prefix taken from the node network
    pub fn node_cidr(&self, address: IpAddr) -> Result<IpNet, Error> {
        IpNet::new(address, self.network.cidr.prefix_len())
            .map_err(|e| Error::InvalidConfig(format!("{address}: {e}")))
    }
}
