pub mod domain;
pub mod leases;

use crate::config::{ProvisionerConfig, Role};
use crate::context::Context;
use crate::engine::{Invocation, Step};
use crate::engine::report::AddressReport;
use crate::errors::Error;
use crate::invocation;
use crate::utils::Requirements;
use domain::{VmSpec, create_steps, teardown_steps};
use leases::{ClusterAddresses, NodeAddress};
use tracing::instrument;

/// `virsh` bound to the configured connection URI
pub fn virsh(config: &ProvisionerConfig) -> Invocation {
    invocation!("virsh", "-c", &config.libvirt.uri)
}

pub fn create_vms_requirements(config: &ProvisionerConfig) -> Requirements {
    Requirements::binaries(&["virsh", "virt-install"]).file(&config.libvirt.iso)
}

pub fn create_vms(config: &ProvisionerConfig) -> Vec<Step> {
    create_steps(config)
}

pub fn teardown(config: &ProvisionerConfig) -> Vec<Step> {
    teardown_steps(config)
}

/// Resolve the address of every node from libvirt's DHCP leases, falling back to the
/// configured addresses per node
#[instrument(skip(ctx))]
pub async fn reconcile_addresses(
    ctx: &Context,
) -> Result<(ClusterAddresses, Vec<AddressReport>), Error> {
    let config = &ctx.config;
    let mut addresses = ClusterAddresses::configured(config);
    let mut reports = Vec::new();

    for role in [Role::ControlPlane, Role::Worker] {
        let spec = VmSpec::for_role(config, role);
        let mut node = NodeAddress::new(role, config.node(role).ip);
        let reconciled = node
            .reconcile(ctx.runner.as_ref(), config, &spec.name, &spec.mac, &ctx.cancel)
            .await?;

        match role {
            Role::ControlPlane => addresses.controlplane = reconciled.address,
            Role::Worker => addresses.worker = reconciled.address,
        }
        reports.push(AddressReport { node, reconciled });
    }
    Ok((addresses, reports))
}
