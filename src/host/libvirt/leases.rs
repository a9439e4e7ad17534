//! Node address detection from libvirt DHCP lease data.

use super::virsh;
use crate::config::{ProvisionerConfig, Role};
use crate::engine::{CommandRunner, Invocation};
use crate::errors::Error;
use crate::utils::cancel::Cancellation;
use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::Serialize;
use std::net::IpAddr;
use tracing::{info, instrument, warn};

lazy_static! {
    // " vnet0      52:54:00:8e:7b:1c    ipv4         192.168.122.45/24"
    static ref DOMIFADDR_ROW: Regex = Regex::new(
        r"^\s*(\S+)\s+((?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2})\s+(ipv4|ipv6)\s+(\S+)\s*$"
    )
    .expect("valid domifaddr regex");
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("lease lookup failed: {0}")]
    CommandFailed(String),
    #[error("no address in lease data")]
    NoAddress,
    #[error("unparseable lease data: {0}")]
    Malformed(String),
}

/// Expected and observed address of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    pub role: Role,
    pub configured: IpAddr,
    pub detected: Option<IpAddr>,
}

/// The address to use from here on, and how it was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub address: IpAddr,
    pub divergence: bool,
    pub detection_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct Lease {
    mac: String,
    ipv4: bool,
    address: String,
}

/// DHCP leases libvirt handed out to `domain`
pub fn lease_lookup(config: &ProvisionerConfig, domain: &str) -> Invocation {
    virsh(config).args(["domifaddr", domain, "--source", "lease"])
}

/// Parse the output of `virsh domifaddr`, or a bare address literal printed by any other
/// detection command. When `mac` is given only rows for that interface are considered.
/// IPv4 leases win over IPv6 ones.
pub fn parse_detected_address(output: &str, mac: Option<&str>) -> Result<IpAddr, DetectionError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(DetectionError::NoAddress);
    }

    let leases: Vec<Lease> = trimmed
        .lines()
        .filter_map(|line| DOMIFADDR_ROW.captures(line))
        .map(|captures| Lease {
            mac: captures[2].to_lowercase(),
            ipv4: &captures[3] == "ipv4",
            address: captures[4].to_string(),
        })
        .filter(|lease| mac.is_none_or(|mac| lease.mac == mac.to_lowercase()))
        .collect();

    if let Some(lease) = leases
        .iter()
        .find(|lease| lease.ipv4)
        .or_else(|| leases.first())
    {
        return parse_literal(&lease.address);
    }

    if !trimmed.contains(char::is_whitespace) {
        return parse_literal(trimmed);
    }
    if trimmed.lines().next().is_some_and(|header| header.contains("Address")) {
        // Header only, the domain has no lease yet
        return Err(DetectionError::NoAddress);
    }
    Err(DetectionError::Malformed(first_line(trimmed)))
}

fn parse_literal(value: &str) -> Result<IpAddr, DetectionError> {
    let address = value.split_once('/').map_or(value, |(address, _prefix)| address);
    address
        .parse()
        .map_err(|_| DetectionError::Malformed(value.to_string()))
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

/// Pick the address to use: a valid detected address wins, otherwise the configured one
pub fn reconcile(configured: IpAddr, detection: &Result<IpAddr, DetectionError>) -> Reconciled {
    match detection {
        Ok(detected) => Reconciled {
            address: *detected,
            divergence: *detected != configured,
            detection_failed: false,
            detail: None,
        },
        Err(e) => Reconciled {
            address: configured,
            divergence: false,
            detection_failed: true,
            detail: Some(e.to_string()),
        },
    }
}

impl NodeAddress {
    pub fn new(role: Role, configured: IpAddr) -> Self {
        NodeAddress {
            role,
            configured,
            detected: None,
        }
    }

    /// Look up the domain's lease and record the detected address.
    /// Only cancellation is an error, detection problems degrade to the configured address.
    #[instrument(skip(self, runner, config, cancel), fields(role = %self.role))]
    pub async fn reconcile(
        &mut self,
        runner: &dyn CommandRunner,
        config: &ProvisionerConfig,
        domain: &str,
        mac: &str,
        cancel: &Cancellation,
    ) -> Result<Reconciled, Error> {
        let detection = match runner.run(&lease_lookup(config, domain), cancel).await {
            Ok(output) if output.success() => parse_detected_address(&output.stdout, Some(mac)),
            Ok(output) => Err(DetectionError::CommandFailed(output.failure_detail())),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => Err(DetectionError::CommandFailed(e.to_string())),
        };

        self.detected = detection.as_ref().ok().copied();
        let reconciled = reconcile(self.configured, &detection);
        if reconciled.detection_failed {
            warn!(
                "WARNING: Could not detect IP for {domain} ({}), using configured {}",
                reconciled.detail.as_deref().unwrap_or_default(),
                self.configured
            );
        } else if reconciled.divergence {
            warn!(
                "{domain}: expected {} but libvirt leased {}, using the detected address",
                self.configured, reconciled.address
            );
        } else {
            info!("{domain}: address {} confirmed", reconciled.address);
        }
        Ok(reconciled)
    }
}

/// Reconciled addresses of both nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAddresses {
    pub controlplane: IpAddr,
    pub worker: IpAddr,
}

impl ClusterAddresses {
    /// Addresses straight from configuration, used when nothing can be detected
    pub fn configured(config: &ProvisionerConfig) -> Self {
        ClusterAddresses {
            controlplane: config.controlplane.ip,
            worker: config.worker.ip,
        }
    }

    pub fn get(&self, role: Role) -> IpAddr {
        match role {
            Role::ControlPlane => self.controlplane,
            Role::Worker => self.worker,
        }
    }
}
