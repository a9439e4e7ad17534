//! Subcommand parsing and the phases each subcommand runs.

use crate::cluster::{addons, bootstrap, talos};
use crate::context::Context;
use crate::engine::report::{ProvisionReport, render_plan};
use crate::engine::{Sequencer, Step};
use crate::errors::Error;
use crate::host::libvirt::{self, leases::ClusterAddresses};
use crate::utils::Requirements;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{error, info, instrument, warn};

pub const USAGE: &str = "Usage: talos-provisioner [--config <path>] [--dry-run] <command>

Commands:
  create-vms   define and start the control plane and worker domains
  gen-config   render patches and generate Talos machine configs
  bootstrap    apply configs, bootstrap etcd, fetch the kubeconfig, join the worker
  addons       install Cilium, ArgoCD and monitoring exporters
  provision    all of the above in order
  teardown     destroy both domains and their storage

Options:
  --config <path>  configuration file (default provisioner.yaml)
  --dry-run        print the plan without running anything
  --version        print the version and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CreateVms,
    GenConfig,
    Bootstrap,
    Addons,
    Provision,
    Teardown,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create-vms" => Ok(Command::CreateVms),
            "gen-config" => Ok(Command::GenConfig),
            "bootstrap" => Ok(Command::Bootstrap),
            "addons" => Ok(Command::Addons),
            "provision" => Ok(Command::Provision),
            "teardown" => Ok(Command::Teardown),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::CreateVms => "create-vms",
            Command::GenConfig => "gen-config",
            Command::Bootstrap => "bootstrap",
            Command::Addons => "addons",
            Command::Provision => "provision",
            Command::Teardown => "teardown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cli {
    Version,
    Help,
    Run {
        config: Option<PathBuf>,
        dry_run: bool,
        command: Command,
    },
}

/// Parse the arguments after the program name
pub fn parse_args<I>(args: I) -> Result<Cli, Error>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut config = None;
    let mut dry_run = false;
    let mut command = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" => return Ok(Cli::Version),
            "--help" | "-h" => return Ok(Cli::Help),
            "--dry-run" => dry_run = true,
            "--config" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => {
                    return Err(Error::InvalidConfig(String::from(
                        "--config needs a path",
                    )));
                }
            },
            other if other.starts_with("--config=") => {
                config = Some(PathBuf::from(&other["--config=".len()..]));
            }
            other if command.is_none() => command = Some(other.parse::<Command>()?),
            other => return Err(Error::UnknownCommand(other.to_string())),
        }
    }

    match command {
        Some(command) => Ok(Cli::Run {
            config,
            dry_run,
            command,
        }),
        None => Ok(Cli::Help),
    }
}

/// Run one subcommand to completion. Never fails: errors end up in the report.
#[instrument(skip(ctx))]
pub async fn run(ctx: &Context, command: Command) -> ProvisionReport {
    let mut report = ProvisionReport::new(&command.to_string());
    info!(
        "Run {} of {command} ({})",
        report.run_id,
        if ctx.dry_run { "dry run" } else { "live" }
    );

    if let Err(e) = execute(ctx, command, &mut report).await {
        if matches!(e, Error::Cancelled) {
            report.interrupted = true;
        } else if e.is_precondition() {
            error!("Precondition failed, nothing was changed: {e}");
        } else {
            error!("{command} aborted: {e}");
        }
        report.aborted = Some(e.to_string());
    }
    report
}

async fn execute(ctx: &Context, command: Command, report: &mut ProvisionReport) -> Result<(), Error> {
    match command {
        Command::CreateVms => {
            create_vms_phase(ctx, report).await?;
        }
        Command::Teardown => {
            teardown_phase(ctx, report).await?;
        }
        Command::GenConfig => {
            let addresses = resolve_addresses(ctx, report).await?;
            gen_config_phase(ctx, report, &addresses).await?;
        }
        Command::Bootstrap => {
            let addresses = resolve_addresses(ctx, report).await?;
            bootstrap_phase(ctx, report, &addresses).await?;
        }
        Command::Addons => {
            let addresses = resolve_addresses(ctx, report).await?;
            addons_phase(ctx, report, &addresses).await?;
        }
        Command::Provision => {
            if !create_vms_phase(ctx, report).await? {
                return Ok(());
            }
            let addresses = resolve_addresses(ctx, report).await?;
            if !gen_config_phase(ctx, report, &addresses).await? {
                return Ok(());
            }
            if !bootstrap_phase(ctx, report, &addresses).await? {
                return Ok(());
            }
            addons_phase(ctx, report, &addresses).await?;
        }
    }
    Ok(())
}

/// Check preconditions, then run the steps as one sequence. Returns whether the phase
/// completed, warnings allowed.
async fn run_phase(
    ctx: &Context,
    report: &mut ProvisionReport,
    name: &str,
    requirements: Requirements,
    steps: Vec<Step>,
) -> Result<bool, Error> {
    if ctx.dry_run {
        if let Err(e) = requirements.check(ctx.runner.as_ref()) {
            warn!("{name}: {e}");
        }
        println!("{}", render_plan(name, &steps));
        return Ok(true);
    }

    requirements.check(ctx.runner.as_ref())?;
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let phase = Sequencer::new(name, ctx.runner.as_ref(), ctx.cancel.clone())
        .run(&steps)
        .await;
    let complete = phase.state.is_complete();
    if !complete {
        if let Some(failing) = phase.failing_step() {
            let skipped: Vec<_> = phase.not_attempted().collect();
            warn!("{name} stopped at {}, not attempted: {}", failing.step, skipped.join(", "));
        }
    }
    report.phases.push(phase);
    Ok(complete)
}

async fn create_vms_phase(ctx: &Context, report: &mut ProvisionReport) -> Result<bool, Error> {
    let config = &ctx.config;
    run_phase(
        ctx,
        report,
        "create-vms",
        libvirt::create_vms_requirements(config),
        libvirt::create_vms(config),
    )
    .await
}

async fn teardown_phase(ctx: &Context, report: &mut ProvisionReport) -> Result<bool, Error> {
    let config = &ctx.config;
    run_phase(
        ctx,
        report,
        "teardown",
        Requirements::binaries(&["virsh"]),
        libvirt::teardown(config),
    )
    .await
}

/// Reconciled node addresses; the configured ones in a dry run
async fn resolve_addresses(
    ctx: &Context,
    report: &mut ProvisionReport,
) -> Result<ClusterAddresses, Error> {
    if ctx.dry_run {
        let addresses = ClusterAddresses::configured(&ctx.config);
        println!(
            "addresses (configured, not detected)\n  control-plane {}\n  worker        {}\n",
            addresses.controlplane, addresses.worker
        );
        return Ok(addresses);
    }

    Requirements::binaries(&["virsh"]).check(ctx.runner.as_ref())?;
    let (addresses, reports) = libvirt::reconcile_addresses(ctx).await?;
    report.addresses = reports;
    Ok(addresses)
}

async fn gen_config_phase(
    ctx: &Context,
    report: &mut ProvisionReport,
    addresses: &ClusterAddresses,
) -> Result<bool, Error> {
    let config = &ctx.config;
    if !ctx.dry_run {
        fs::create_dir_all(&config.artifacts_dir)?;
    }
    // Lives until the sequence is done with the patch files
    let patches = talos::RenderedPatches::render(config, addresses)?;
    run_phase(
        ctx,
        report,
        "gen-config",
        talos::requirements(),
        talos::config_steps(config, addresses, &patches),
    )
    .await
}

async fn bootstrap_phase(
    ctx: &Context,
    report: &mut ProvisionReport,
    addresses: &ClusterAddresses,
) -> Result<bool, Error> {
    let config = &ctx.config;
    run_phase(
        ctx,
        report,
        "bootstrap",
        bootstrap::requirements(config),
        bootstrap::bootstrap_steps(config, addresses),
    )
    .await
}

async fn addons_phase(
    ctx: &Context,
    report: &mut ProvisionReport,
    addresses: &ClusterAddresses,
) -> Result<bool, Error> {
    let config = &ctx.config;
    run_phase(
        ctx,
        report,
        "addons",
        addons::requirements(config),
        addons::addon_steps(config, addresses),
    )
    .await
}
