use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::Settings;
use crate::error::{RolloutError, RolloutStep};
use crate::manifest::{read_static_pod_manifests, StaticPodManifest, StaticPodManifests};
use crate::nat::{ensure_active_rules, ensure_transition_rules, NatTable, ReconcileOutcome};
use crate::observability;
use crate::ports::{active_port_map, next_port_map, PortError, PortMap, Slot};
use crate::probe::{Expectation, PortProbe, ReadinessWaiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    NoInstance,
    SingleActive,
    AwaitingNextReady,
    Transitioning,
    RetiringOld,
    AwaitingDrain,
    Finalized,
    Ambiguous,
}

impl RolloutPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoInstance => "no_instance",
            Self::SingleActive => "single_active",
            Self::AwaitingNextReady => "awaiting_next_ready",
            Self::Transitioning => "transitioning",
            Self::RetiringOld => "retiring_old",
            Self::AwaitingDrain => "awaiting_drain",
            Self::Finalized => "finalized",
            Self::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RolloutPlan {
    Idle,
    Stabilize {
        active: StaticPodManifest,
        ports: PortMap,
    },
    Transition {
        active: StaticPodManifest,
        next: StaticPodManifest,
        active_ports: PortMap,
        next_ports: PortMap,
    },
    Ambiguous {
        count: usize,
    },
}

pub fn plan_rollout(manifests: &StaticPodManifests) -> Result<RolloutPlan, PortError> {
    match &manifests[..] {
        [] => Ok(RolloutPlan::Idle),
        [active] => Ok(RolloutPlan::Stabilize {
            active: active.clone(),
            ports: active_port_map(active.port)?,
        }),
        [active, next] => Ok(RolloutPlan::Transition {
            active: active.clone(),
            next: next.clone(),
            active_ports: active_port_map(active.port)?,
            next_ports: next_port_map(active.port)?,
        }),
        more => Ok(RolloutPlan::Ambiguous { count: more.len() }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub manifest_dir: PathBuf,
    pub manifests: Vec<StaticPodManifest>,
    pub phases: Vec<RolloutPhase>,
    pub active_slot: Option<Slot>,
    pub next_slot: Option<Slot>,
    pub rules_appended: usize,
    pub rules_deleted: usize,
    pub warnings: Vec<String>,
}

impl RolloutReport {
    fn new(manifest_dir: &Path) -> Self {
        Self {
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            manifest_dir: manifest_dir.to_path_buf(),
            manifests: Vec::new(),
            phases: Vec::new(),
            active_slot: None,
            next_slot: None,
            rules_appended: 0,
            rules_deleted: 0,
            warnings: Vec::new(),
        }
    }

    pub fn phase(&self) -> Option<RolloutPhase> {
        self.phases.last().copied()
    }

    fn enter(&mut self, phase: RolloutPhase) {
        info!(phase = phase.as_str(), "entering rollout phase");
        self.phases.push(phase);
    }

    fn absorb(&mut self, outcome: ReconcileOutcome) {
        self.rules_appended += outcome.appended;
        self.rules_deleted += outcome.deleted;
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone)]
pub struct RolloutOptions {
    pub manifest_dir: PathBuf,
    pub pod_prefix: String,
    pub container_name: String,
    pub ready_timeout: Duration,
    pub drain_timeout: Duration,
}

impl RolloutOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            manifest_dir: settings.pod_manifest_dir.clone(),
            pod_prefix: settings.pod_prefix.clone(),
            container_name: settings.container_name.clone(),
            ready_timeout: settings.probe.ready_timeout(),
            drain_timeout: settings.probe.drain_timeout(),
        }
    }

    pub fn with_manifest_dir(mut self, manifest_dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = manifest_dir.into();
        self
    }
}

pub struct GracefulRollout<'a, T: ?Sized, P> {
    options: RolloutOptions,
    table: &'a T,
    readiness: &'a ReadinessWaiter<P>,
}

impl<'a, T, P> GracefulRollout<'a, T, P>
where
    T: NatTable + ?Sized,
    P: PortProbe,
{
    pub fn new(options: RolloutOptions, table: &'a T, readiness: &'a ReadinessWaiter<P>) -> Self {
        Self {
            options,
            table,
            readiness,
        }
    }

    pub fn scan(&self) -> Result<StaticPodManifests, RolloutError> {
        Ok(read_static_pod_manifests(
            &self.options.manifest_dir,
            &self.options.pod_prefix,
            &self.options.container_name,
        )?)
    }

    #[instrument(name = "rollout.run", skip(self), fields(manifest_dir = %self.options.manifest_dir.display()))]
    pub fn run(&self) -> Result<RolloutReport, RolloutError> {
        let mut report = RolloutReport::new(&self.options.manifest_dir);
        let result = self.run_with_report(&mut report);
        let phase = report.phase().map(RolloutPhase::as_str).unwrap_or("scan");
        match result {
            Ok(()) => {
                report.finished_at = Some(Utc::now().to_rfc3339());
                observability::record_rollout_run("ok", phase);
                Ok(report)
            }
            Err(err) => {
                observability::record_rollout_run(err.kind(), phase);
                Err(err)
            }
        }
    }

    fn run_with_report(&self, report: &mut RolloutReport) -> Result<(), RolloutError> {
        let manifests = self.scan()?;
        report.manifests = manifests.to_vec();

        match plan_rollout(&manifests)? {
            RolloutPlan::Idle => {
                report.enter(RolloutPhase::NoInstance);
                info!(
                    prefix = %self.options.pod_prefix,
                    "no static pod manifests found, nothing to coordinate"
                );
                Ok(())
            }
            RolloutPlan::Stabilize { active, ports } => {
                report.enter(RolloutPhase::SingleActive);
                report.active_slot = Some(ports.slot());
                info!(
                    revision = active.revision,
                    port = active.port,
                    "ensuring port forwarding for the only revision"
                );
                let outcome = ensure_active_rules(self.table, &ports).map_err(|source| {
                    RolloutError::ActiveRules {
                        revision: active.revision,
                        source,
                    }
                })?;
                report.absorb(outcome);
                Ok(())
            }
            RolloutPlan::Transition {
                active,
                next,
                active_ports,
                next_ports,
            } => self.transition(report, &active, &next, &active_ports, &next_ports),
            RolloutPlan::Ambiguous { count } => {
                report.enter(RolloutPhase::Ambiguous);
                report.warn(format!(
                    "graceful transition is only possible between 2 pods, but {} manifests were found; leaving rules untouched",
                    count
                ));
                Ok(())
            }
        }
    }

    fn transition(
        &self,
        report: &mut RolloutReport,
        active: &StaticPodManifest,
        next: &StaticPodManifest,
        active_ports: &PortMap,
        next_ports: &PortMap,
    ) -> Result<(), RolloutError> {
        report.active_slot = Some(active_ports.slot());
        report.next_slot = Some(next_ports.slot());
        info!(
            from_revision = active.revision,
            from_port = active.port,
            to_revision = next.revision,
            to_port = next.port,
            "attempting graceful transition"
        );
        if next.port != next_ports.secure_port() {
            report.warn(format!(
                "revision {} declares port {} but the rotation expects {}",
                next.revision,
                next.port,
                next_ports.secure_port()
            ));
        }

        let outcome = ensure_active_rules(self.table, active_ports).map_err(|source| {
            RolloutError::ActiveRules {
                revision: active.revision,
                source,
            }
        })?;
        report.absorb(outcome);

        report.enter(RolloutPhase::AwaitingNextReady);
        let next_health_port = next_ports.insecure_port();
        self.readiness
            .wait_for(
                next_health_port,
                Expectation::Reachable,
                self.options.ready_timeout,
            )
            .map_err(|source| RolloutError::NextNotReady {
                revision: next.revision,
                port: next_health_port,
                source,
            })?;

        report.enter(RolloutPhase::Transitioning);
        match ensure_transition_rules(self.table, active_ports, next_ports) {
            Ok(outcome) => report.absorb(outcome),
            Err(source) => {
                return Err(self.restore_active(
                    report,
                    RolloutStep::TransitionRules,
                    active,
                    active_ports,
                    source,
                ))
            }
        }

        report.enter(RolloutPhase::RetiringOld);
        if let Err(source) = retire_manifest(report, &active.filename) {
            return Err(self.restore_active(
                report,
                RolloutStep::RetireManifest,
                active,
                active_ports,
                source,
            ));
        }

        report.enter(RolloutPhase::AwaitingDrain);
        if let Err(source) = self.readiness.wait_for(
            active_ports.insecure_port(),
            Expectation::Refused,
            self.options.drain_timeout,
        ) {
            return Err(self.restore_active(
                report,
                RolloutStep::AwaitDrain,
                active,
                active_ports,
                source,
            ));
        }

        let outcome = ensure_active_rules(self.table, next_ports).map_err(|source| {
            RolloutError::Finalize {
                revision: next.revision,
                source,
            }
        })?;
        report.absorb(outcome);
        report.enter(RolloutPhase::Finalized);
        info!(
            revision = next.revision,
            port = next_ports.secure_port(),
            "all traffic forwarded to the new revision"
        );
        Ok(())
    }

    fn restore_active(
        &self,
        report: &mut RolloutReport,
        step: RolloutStep,
        active: &StaticPodManifest,
        active_ports: &PortMap,
        source: anyhow::Error,
    ) -> RolloutError {
        warn!(
            step = %step,
            revision = active.revision,
            error = %format!("{source:#}"),
            "transition step failed, restoring active rules"
        );
        match ensure_active_rules(self.table, active_ports) {
            Ok(outcome) => {
                report.absorb(outcome);
                RolloutError::RolledBack {
                    step,
                    revision: active.revision,
                    source,
                }
            }
            Err(rollback) => {
                error!(
                    step = %step,
                    revision = active.revision,
                    error = %format!("{rollback:#}"),
                    "failed to restore active rules"
                );
                RolloutError::DoubleFault {
                    step,
                    revision: active.revision,
                    source,
                    rollback,
                }
            }
        }
    }
}

/// Removing the manifest tells the kubelet to stop the instance. A manifest
/// that is already gone counts as retired.
fn retire_manifest(report: &mut RolloutReport, path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(manifest = %path.display(), "removed retiring manifest");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            report.warn(format!(
                "manifest {} was already removed",
                path.display()
            ));
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed removing manifest {}", path.display()))),
    }
}
