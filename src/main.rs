use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use graceful_monitor::config::{ProbeMode, Settings};
use graceful_monitor::nat::IptablesTable;
use graceful_monitor::observability::ObservabilityGuard;
use graceful_monitor::probe::{ListenProbe, ProbeStrategy, ReadinessWaiter, TcpProbe};
use graceful_monitor::rollout::{plan_rollout, GracefulRollout, RolloutOptions};

#[derive(Parser, Debug)]
#[command(name = "graceful-monitor")]
#[command(
    about = "Hands local API server traffic over between two static pod revisions",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print effective settings and configuration warnings.
    Doctor,
    /// Run one reconciliation pass over the manifest directory.
    Rollout {
        /// Directory holding static pod manifests.
        #[arg(long)]
        pod_manifest_dir: Option<PathBuf>,
    },
    /// Scan manifests and print the planned action without touching iptables.
    Plan {
        #[arg(long)]
        pod_manifest_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let _observability = ObservabilityGuard::init();
    let cli = Cli::parse();

    let result = run(cli);
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "graceful-monitor failed");
    }
    result
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load()?;

    match cli.command.unwrap_or(Commands::Doctor) {
        Commands::Doctor => {
            let report = settings.doctor_report();
            println!("Graceful Monitor Doctor");
            println!("pod_manifest_dir: {}", report.settings.pod_manifest_dir.display());
            println!("pod_prefix: {}", report.settings.pod_prefix);
            println!("container_name: {}", report.settings.container_name);
            println!("iptables_bin: {}", report.settings.iptables.binary);
            println!("iptables_wait: {}", report.settings.iptables.wait_for_lock);
            println!("probe_mode: {:?}", report.settings.probe.mode);
            println!("probe_host: {}", report.settings.probe.host);
            println!("probe_interval_ms: {}", report.settings.probe.interval_ms);
            println!(
                "probe_connect_timeout_ms: {}",
                report.settings.probe.connect_timeout_ms
            );
            println!(
                "ready_timeout_secs: {}",
                report.settings.probe.ready_timeout_secs
            );
            println!(
                "drain_timeout_secs: {}",
                report.settings.probe.drain_timeout_secs
            );
            if report.warnings.is_empty() {
                println!("warnings: none");
            } else {
                for warning in &report.warnings {
                    println!("warning: {}", warning);
                }
            }
        }
        Commands::Rollout { pod_manifest_dir } => {
            let options = rollout_options(&settings, pod_manifest_dir)?;
            let table = IptablesTable::new(
                settings.iptables.binary.clone(),
                settings.iptables.wait_for_lock,
            );
            let probe = match settings.probe.mode {
                ProbeMode::Listen => ProbeStrategy::Listen(ListenProbe::default()),
                ProbeMode::Connect => ProbeStrategy::Connect(TcpProbe::new(
                    settings.probe.host.clone(),
                    settings.probe.connect_timeout(),
                )),
            };
            let readiness = ReadinessWaiter::new(probe, settings.probe.interval());

            info!(manifest_dir = %options.manifest_dir.display(), "starting rollout pass");
            let report = GracefulRollout::new(options, &table, &readiness).run()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed encoding rollout report")?
            );
        }
        Commands::Plan { pod_manifest_dir } => {
            let options = rollout_options(&settings, pod_manifest_dir)?;
            let manifests = graceful_monitor::manifest::read_static_pod_manifests(
                &options.manifest_dir,
                &options.pod_prefix,
                &options.container_name,
            )?;
            let plan = plan_rollout(&manifests)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&plan).context("failed encoding rollout plan")?
            );
        }
    }

    Ok(())
}

fn rollout_options(settings: &Settings, pod_manifest_dir: Option<PathBuf>) -> Result<RolloutOptions> {
    let options = RolloutOptions::from_settings(settings);
    let Some(dir) = pod_manifest_dir else {
        return Ok(options);
    };
    if dir.as_os_str().is_empty() {
        bail!("--pod-manifest-dir must not be empty");
    }
    Ok(options.with_manifest_dir(dir))
}
