pub mod addons;
pub mod bootstrap;
pub mod kube;
pub mod talos;

use crate::config::ProvisionerConfig;
use crate::engine::Invocation;
use crate::invocation;
use std::net::{IpAddr, SocketAddr};

pub const KUBE_API_PORT: u16 = 6443;

/// `talosctl` pointed at the generated client configuration
pub fn talosctl(config: &ProvisionerConfig) -> Invocation {
    invocation!("talosctl").env("TALOSCONFIG", config.talosconfig_path().display().to_string())
}

/// `kubectl` pointed at the fetched kubeconfig
pub fn kubectl(config: &ProvisionerConfig) -> Invocation {
    invocation!("kubectl").env("KUBECONFIG", config.kubeconfig_path().display().to_string())
}

pub fn helm(config: &ProvisionerConfig) -> Invocation {
    invocation!("helm").env("KUBECONFIG", config.kubeconfig_path().display().to_string())
}

/// `https://<address>:6443`, bracketing IPv6 addresses
pub fn cluster_endpoint(controlplane: IpAddr) -> String {
    format!("https://{}", SocketAddr::new(controlplane, KUBE_API_PORT))
}
