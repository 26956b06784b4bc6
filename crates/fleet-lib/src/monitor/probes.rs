//! Reachability checks and utilization probes

use crate::channel::RemoteSession;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub const HEARTBEAT_COMMAND: &str = "echo 'heartbeat'";
pub const HEARTBEAT_REPLY: &str = "heartbeat";

pub const CPU_PROBES: [(&str, &str); 4] = [
    (
        "top",
        "top -bn1 | grep 'Cpu(s)' | awk '{print $2}' | awk -F'%' '{print $1}'",
    ),
    ("vmstat", "vmstat 1 2 | tail -1 | awk '{print 100-$15}'"),
    ("sar", "sar 1 1 | tail -1 | awk '{print 100-$8}'"),
    ("iostat", "iostat -c 1 1 | tail -1 | awk '{print 100-$6}'"),
];

pub const MEMORY_PROBE: (&str, &str) = (
    "free",
    "free | grep Mem | awk '{printf \"%.1f\", $3/$2 * 100.0}'",
);

/// Prints the received plus transmitted byte count over all non-loopback interfaces
const NET_BYTES_SAMPLE: &str = r#"awk 'NR>2 {sub(/^ +/, ""); split($0, f, /[: ]+/); if (f[1] != "lo") total += f[2] + f[10]} END {printf "%.0f\n", total}' /proc/net/dev"#;

pub const PYTHON_VERSION_COMMAND: &str = "python3 --version";
pub const LOCUST_VERSION_COMMAND: &str = "locust --version";
pub const CPU_CORES_COMMAND: &str = "cat /proc/cpuinfo | grep processor | wc -l";
pub const MEMORY_MB_COMMAND: &str = "free -m | grep Mem | awk '{print $2}'";

/// Raw TCP reachability of an agent's control port
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Opens and immediately drops a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpReachability;

#[async_trait]
impl Reachability for TcpReachability {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host = %host, port, error = %e, "TCP connect failed");
                false
            }
            Err(_) => {
                debug!(host = %host, port, "TCP connect timed out");
                false
            }
        }
    }
}

/// Reachability double: every host is reachable unless listed
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct StaticReachability {
    unreachable: dashmap::DashSet<String>,
}

#[cfg(any(test, feature = "testing"))]
impl StaticReachability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(self, host: impl Into<String>) -> Self {
        self.unreachable.insert(host.into());
        self
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(host);
        } else {
            self.unreachable.insert(host.to_string());
        }
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Reachability for StaticReachability {
    async fn is_reachable(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
        !self.unreachable.contains(host)
    }
}

/// One way of measuring a utilization percentage on an open session
#[async_trait]
pub trait UtilizationProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the probe produced no usable number
    async fn measure(&self, session: &dyn RemoteSession) -> Option<f64>;
}

/// Runs a shell command and reads the first token of stdout as a number
pub struct ShellProbe {
    name: &'static str,
    command: &'static str,
}

impl ShellProbe {
    pub const fn new(name: &'static str, command: &'static str) -> Self {
        Self { name, command }
    }
}

#[async_trait]
impl UtilizationProbe for ShellProbe {
    fn name(&self) -> &str {
        self.name
    }

    async fn measure(&self, session: &dyn RemoteSession) -> Option<f64> {
        let output = match session.run(self.command).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                debug!(probe = self.name, exit_code = ?output.exit_code, "Probe command failed");
                return None;
            }
            Err(e) => {
                debug!(probe = self.name, error = %e, "Probe command errored");
                return None;
            }
        };
        parse_first_number(&output.stdout)
    }
}

/// Network utilization as a share of declared bandwidth, from two byte
/// counter samples
pub struct NetworkProbe {
    bandwidth_mbps: u32,
    sample_secs: u64,
}

impl NetworkProbe {
    pub fn new(bandwidth_mbps: u32) -> Self {
        Self {
            bandwidth_mbps,
            sample_secs: 1,
        }
    }

    pub fn command(&self) -> String {
        format!(
            "{sample}; sleep {secs}; {sample}",
            sample = NET_BYTES_SAMPLE,
            secs = self.sample_secs
        )
    }
}

#[async_trait]
impl UtilizationProbe for NetworkProbe {
    fn name(&self) -> &str {
        "proc_net_dev"
    }

    async fn measure(&self, session: &dyn RemoteSession) -> Option<f64> {
        if self.bandwidth_mbps == 0 {
            return Some(0.0);
        }

        let output = session.run(&self.command()).await.ok()?;
        if !output.success() {
            return None;
        }

        let samples: Vec<f64> = output
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse::<f64>().ok())
            .collect();
        let [first, second] = samples.as_slice() else {
            return None;
        };

        let bytes_per_sec = (second - first).max(0.0) / self.sample_secs as f64;
        let mbps = bytes_per_sec * 8.0 / 1_000_000.0;
        Some((mbps / f64::from(self.bandwidth_mbps) * 100.0).min(100.0))
    }
}

/// Ordered fallback list; the first probe yielding a number wins
pub struct ProbeChain {
    probes: Vec<Box<dyn UtilizationProbe>>,
}

impl ProbeChain {
    pub fn new(probes: Vec<Box<dyn UtilizationProbe>>) -> Self {
        Self { probes }
    }

    /// top, vmstat, sar, iostat
    pub fn cpu() -> Self {
        Self::new(
            CPU_PROBES
                .iter()
                .map(|&(name, command)| {
                    Box::new(ShellProbe::new(name, command)) as Box<dyn UtilizationProbe>
                })
                .collect(),
        )
    }

    pub fn memory() -> Self {
        Self::new(vec![Box::new(ShellProbe::new(MEMORY_PROBE.0, MEMORY_PROBE.1))])
    }

    /// Returns the winning probe's name alongside the value
    pub async fn measure(&self, session: &dyn RemoteSession) -> Option<(&str, f64)> {
        for probe in &self.probes {
            if let Some(value) = probe.measure(session).await {
                return Some((probe.name(), value));
            }
        }
        None
    }
}

pub(crate) fn parse_first_number(text: &str) -> Option<f64> {
    text.split_whitespace()
        .next()
        .and_then(|token| token.trim_end_matches(',').parse::<f64>().ok())
        .filter(|value| value.is_finite())
}
