use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::error::Error;
use crate::probe::packet::MIN_PROBE_SIZE;

/// Smallest snapshot that still holds an ICMP error quoting a probe header:
/// outer IPv4 header, ICMP header, quoted IPv4 header and 8 transport bytes,
/// rounded up
pub const MIN_SNAP_LEN: u32 = 64;

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// ICMP Echo Request, confirmed by an Echo Reply
    #[default]
    Icmp,
    /// UDP datagram to the destination port, confirmed by Port Unreachable
    Udp,
}

/// Runtime configuration derived from the config file and CLI args
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture snapshot length in bytes
    pub snap_len: u32,
    /// Replay a pcap file instead of capturing live
    pub replay_file: Option<PathBuf>,
    /// Verbose logging
    pub debug: bool,
    /// Probe source address (None = derived from the route)
    pub source_ip: Option<Ipv4Addr>,
    /// Probe destination
    pub destination_ip: Ipv4Addr,
    /// Destination port for UDP probes
    pub port: u16,
    /// Probe protocol
    pub protocol: ProbeProtocol,
    /// Probe size of the first pass
    pub start_mtu: u16,
    /// Size increment of the first pass
    pub increment: u16,
    /// Number of refinement passes
    pub passes: u8,
    /// Time to wait for a probe response
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Pause after a confirmed probe
    #[serde(with = "duration_serde")]
    pub settle_delay: Duration,
    /// Capacity of each classified frame queue
    pub queue_capacity: usize,
    /// Count large ESP packets from the destination as probe responses
    pub esp_ack: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snap_len: 65535,
            replay_file: None,
            debug: false,
            source_ip: None,
            destination_ip: Ipv4Addr::UNSPECIFIED,
            port: 33434,
            protocol: ProbeProtocol::Icmp,
            start_mtu: 500,
            increment: 500,
            passes: 3,
            probe_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            queue_capacity: 64,
            esp_ack: false,
        }
    }
}

impl Config {
    /// Load a config file (TOML), missing keys take their default value
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Build the runtime config: config file first, then CLI overrides
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match args.config {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(destination) = args.destination {
            config.destination_ip = destination;
        }
        if args.source.is_some() {
            config.source_ip = args.source;
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(ref protocol) = args.protocol {
            config.protocol = match protocol.to_lowercase().as_str() {
                "udp" => ProbeProtocol::Udp,
                _ => ProbeProtocol::Icmp,
            };
        }
        if let Some(start_mtu) = args.start_mtu {
            config.start_mtu = start_mtu;
        }
        if let Some(increment) = args.increment {
            config.increment = increment;
        }
        if let Some(passes) = args.passes {
            config.passes = passes;
        }
        if let Some(timeout) = args.timeout {
            config.probe_timeout =
                Duration::try_from_secs_f64(timeout).context("invalid probe timeout")?;
        }
        if let Some(settle) = args.settle {
            config.settle_delay =
                Duration::try_from_secs_f64(settle).context("invalid settle delay")?;
        }
        if let Some(snap_len) = args.snap_len {
            config.snap_len = snap_len;
        }
        if let Some(capacity) = args.queue_capacity {
            config.queue_capacity = capacity;
        }
        if args.replay.is_some() {
            config.replay_file = args.replay.clone();
        }
        config.esp_ack |= args.esp_ack;
        config.debug |= args.debug;

        config.validate()?;
        Ok(config)
    }

    /// Check values a config file may have set out of range
    pub fn validate(&self) -> crate::error::Result<()> {
        let bad = |msg: String| -> crate::error::Result<()> { Err(Error::BadConfig(msg)) };
        if self.destination_ip.is_unspecified() {
            return bad("no destination configured".into());
        }
        if self.destination_ip.is_multicast() || self.destination_ip.is_broadcast() {
            return bad(format!("destination {} is not a unicast address", self.destination_ip));
        }
        if (self.start_mtu as usize) < MIN_PROBE_SIZE {
            return bad(format!("start MTU must be at least {} bytes", MIN_PROBE_SIZE));
        }
        if self.snap_len < MIN_SNAP_LEN {
            return bad(format!("snapshot length must be at least {} bytes", MIN_SNAP_LEN));
        }
        if self.increment == 0 {
            return bad("increment must be at least 1".into());
        }
        if self.passes == 0 {
            return bad("passes must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return bad("queue capacity must be at least 1".into());
        }
        if self.probe_timeout.is_zero() {
            return bad("probe timeout must be positive".into());
        }
        Ok(())
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
