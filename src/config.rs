use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::probe::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PROBE_HOST, DEFAULT_PROBE_INTERVAL_MS};

const ENV_FILE_ENV: &str = "GRACEFUL_MONITOR_ENV_FILE";

pub const DEFAULT_POD_MANIFEST_DIR: &str = "/etc/kubernetes/manifests";
pub const DEFAULT_POD_PREFIX: &str = "kube-apiserver-pod-";
pub const DEFAULT_CONTAINER_NAME: &str = "kube-apiserver";
const DEFAULT_IPTABLES_BIN: &str = "iptables";
const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub pod_manifest_dir: PathBuf,
    pub pod_prefix: String,
    pub container_name: String,
    pub iptables: IptablesSettings,
    pub probe: ProbeSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct IptablesSettings {
    pub binary: String,
    pub wait_for_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    Listen,
    Connect,
}

impl ProbeMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "listen" => Some(Self::Listen),
            "connect" => Some(Self::Connect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSettings {
    pub mode: ProbeMode,
    pub host: String,
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub ready_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

impl ProbeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub settings: Settings,
    pub warnings: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let pod_manifest_dir = read_non_empty_env("GRACEFUL_MONITOR_POD_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POD_MANIFEST_DIR));
        let pod_prefix = read_non_empty_env("GRACEFUL_MONITOR_POD_PREFIX")
            .unwrap_or_else(|| DEFAULT_POD_PREFIX.to_string());
        let container_name = read_non_empty_env("GRACEFUL_MONITOR_CONTAINER_NAME")
            .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.to_string());

        let iptables = IptablesSettings {
            binary: read_non_empty_env("GRACEFUL_MONITOR_IPTABLES_BIN")
                .unwrap_or_else(|| DEFAULT_IPTABLES_BIN.to_string()),
            wait_for_lock: read_bool_env("GRACEFUL_MONITOR_IPTABLES_WAIT", true),
        };

        let probe = ProbeSettings {
            mode: match read_non_empty_env("GRACEFUL_MONITOR_PROBE_MODE") {
                Some(value) => ProbeMode::parse(&value).ok_or_else(|| {
                    anyhow!(
                        "GRACEFUL_MONITOR_PROBE_MODE must be 'listen' or 'connect', got '{}'",
                        value
                    )
                })?,
                None => ProbeMode::Listen,
            },
            host: read_non_empty_env("GRACEFUL_MONITOR_PROBE_HOST")
                .unwrap_or_else(|| DEFAULT_PROBE_HOST.to_string()),
            interval_ms: read_u64_env(
                "GRACEFUL_MONITOR_PROBE_INTERVAL_MS",
                DEFAULT_PROBE_INTERVAL_MS,
            ),
            connect_timeout_ms: read_u64_env(
                "GRACEFUL_MONITOR_PROBE_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            ),
            ready_timeout_secs: read_u64_env(
                "GRACEFUL_MONITOR_READY_TIMEOUT_SECS",
                DEFAULT_READY_TIMEOUT_SECS,
            ),
            drain_timeout_secs: read_u64_env(
                "GRACEFUL_MONITOR_DRAIN_TIMEOUT_SECS",
                DEFAULT_DRAIN_TIMEOUT_SECS,
            ),
        };

        Ok(Self {
            pod_manifest_dir,
            pod_prefix,
            container_name,
            iptables,
            probe,
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if !self.pod_manifest_dir.is_dir() {
            warnings.push(format!(
                "pod manifest dir {} is not a readable directory",
                self.pod_manifest_dir.display()
            ));
        }
        if self.probe.interval_ms == 0 {
            warnings.push(
                "GRACEFUL_MONITOR_PROBE_INTERVAL_MS is 0; readiness waits will busy-poll"
                    .to_string(),
            );
        }
        if self.probe.connect_timeout_ms == 0 {
            warnings
                .push("GRACEFUL_MONITOR_PROBE_CONNECT_TIMEOUT_MS should be > 0".to_string());
        }
        if self.probe.ready_timeout_secs == 0 {
            warnings.push(
                "GRACEFUL_MONITOR_READY_TIMEOUT_SECS is 0; the incoming instance gets a single probe"
                    .to_string(),
            );
        }
        if self.probe.drain_timeout_secs == 0 {
            warnings.push(
                "GRACEFUL_MONITOR_DRAIN_TIMEOUT_SECS is 0; drain failures will roll back rules immediately"
                    .to_string(),
            );
        }
        if self.probe.ready_timeout_secs > 0
            && self.probe.connect_timeout_ms >= self.probe.ready_timeout_secs.saturating_mul(1000)
        {
            warnings.push(
                "GRACEFUL_MONITOR_PROBE_CONNECT_TIMEOUT_MS should be shorter than GRACEFUL_MONITOR_READY_TIMEOUT_SECS"
                    .to_string(),
            );
        }
        if self.probe.mode == ProbeMode::Connect {
            warnings.push(
                "GRACEFUL_MONITOR_PROBE_MODE=connect; probes of canonical ports are rewritten by the NAT rules they are gating"
                    .to_string(),
            );
        }
        if !self.iptables.wait_for_lock {
            warnings.push(
                "GRACEFUL_MONITOR_IPTABLES_WAIT=false; concurrent xtables users can fail rule updates"
                    .to_string(),
            );
        }

        DoctorReport {
            settings: self.clone(),
            warnings,
        }
    }
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
