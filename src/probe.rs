use std::fmt;
use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::observability;

pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;

/// `Err` means the state of the port could not be observed at all.
pub trait PortProbe {
    fn probe(&self, port: u16) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROBE_HOST,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout: connect_timeout.max(Duration::from_millis(1)),
        }
    }
}

impl PortProbe for TcpProbe {
    fn probe(&self, port: u16) -> Result<bool> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("failed resolving probe host {}", self.host))?
            .next()
            .ok_or_else(|| anyhow!("probe host {} resolved to no address", self.host))?;

        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!(%addr, error = %err, "connection attempt failed");
                Ok(false)
            }
        }
    }
}

pub const PROC_NET_TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

const TCP_LISTEN_STATE: &str = "0A";

/// Reachable while some local socket listens on the port. Unlike
/// [`TcpProbe`] this is not affected by NAT rules, so an instance bound to a
/// canonical port can be observed while its traffic is redirected.
///
/// Fails when none of the tables can be read.
#[derive(Debug, Clone)]
pub struct ListenProbe {
    tables: Vec<PathBuf>,
}

impl Default for ListenProbe {
    fn default() -> Self {
        Self::new(PROC_NET_TCP_TABLES)
    }
}

impl ListenProbe {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathBuf>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }
}

impl PortProbe for ListenProbe {
    fn probe(&self, port: u16) -> Result<bool> {
        let mut readable = 0;
        for table in &self.tables {
            match fs::read_to_string(table) {
                Ok(contents) => {
                    if table_has_listener(&contents, port) {
                        return Ok(true);
                    }
                    readable += 1;
                }
                Err(err) => {
                    debug!(table = %table.display(), error = %err, "socket table unreadable");
                }
            }
        }
        if readable == 0 {
            bail!(
                "none of the socket tables {} could be read",
                self.tables
                    .iter()
                    .map(|table| table.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(false)
    }
}

pub fn table_has_listener(contents: &str, port: u16) -> bool {
    contents.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace().skip(1);
        let (Some(local), Some(_remote), Some(state)) = (fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        state == TCP_LISTEN_STATE
            && local
                .rsplit_once(':')
                .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
                == Some(port)
    })
}

#[derive(Debug, Clone)]
pub enum ProbeStrategy {
    Listen(ListenProbe),
    Connect(TcpProbe),
}

impl PortProbe for ProbeStrategy {
    fn probe(&self, port: u16) -> Result<bool> {
        match self {
            Self::Listen(probe) => probe.probe(port),
            Self::Connect(probe) => probe.probe(port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Reachable,
    Refused,
}

impl Expectation {
    pub fn holds(self, reachable: bool) -> bool {
        match self {
            Self::Reachable => reachable,
            Self::Refused => !reachable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reachable => "reachable",
            Self::Refused => "refused",
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessWaiter<P> {
    probe: P,
    interval: Duration,
}

impl<P: PortProbe> ReadinessWaiter<P> {
    pub fn new(probe: P, interval: Duration) -> Self {
        Self { probe, interval }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Probes at least once, even with a zero `timeout`. A failed probe never
    /// satisfies either expectation.
    pub fn wait_for(
        &self,
        port: u16,
        expectation: Expectation,
        timeout: Duration,
    ) -> Result<Duration> {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut last_error = None;

        loop {
            attempts = attempts.saturating_add(1);
            match self.probe.probe(port) {
                Ok(reachable) if expectation.holds(reachable) => {
                    let waited = started.elapsed();
                    info!(
                        port,
                        expectation = expectation.as_str(),
                        attempts,
                        waited_ms = waited.as_millis() as u64,
                        "port readiness condition met"
                    );
                    observability::record_readiness_wait(expectation.as_str(), "ok", waited);
                    return Ok(waited);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(port, error = %format!("{err:#}"), "port state unknown");
                    last_error = Some(err);
                }
            }

            if started.elapsed() >= timeout {
                observability::record_readiness_wait(
                    expectation.as_str(),
                    "timeout",
                    started.elapsed(),
                );
                let summary = format!(
                    "port {} was not {} within {} seconds ({} probes)",
                    port,
                    expectation,
                    timeout.as_secs(),
                    attempts
                );
                return Err(match last_error {
                    Some(err) => err.context(summary),
                    None => anyhow!(summary),
                });
            }

            thread::sleep(self.interval);
        }
    }
}
