use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::MIN_SNAP_LEN;
use crate::probe::packet::MIN_PROBE_SIZE;

/// Active path MTU discovery across IPsec-protected IPv4 links
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ipsecmtu")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Destination (remote IPsec endpoint or a host behind it)
    pub destination: Option<Ipv4Addr>,

    /// TOML config file (command line flags override its values)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Source IP for probes (default: derived from the route to the destination)
    #[arg(short = 's', long = "source")]
    pub source: Option<Ipv4Addr>,

    /// Destination port for UDP probes
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Probe protocol (icmp, udp)
    #[arg(long = "protocol")]
    pub protocol: Option<String>,

    /// Probe size for the first pass, in bytes
    #[arg(long = "start-mtu")]
    pub start_mtu: Option<u16>,

    /// Size increment of the first pass, in bytes (halved every pass)
    #[arg(short = 'i', long = "increment")]
    pub increment: Option<u16>,

    /// Number of refinement passes
    #[arg(short = 'n', long = "passes")]
    pub passes: Option<u8>,

    /// Seconds to wait for a probe response
    #[arg(long = "timeout")]
    pub timeout: Option<f64>,

    /// Seconds to pause after a confirmed probe
    #[arg(long = "settle")]
    pub settle: Option<f64>,

    /// Capture snapshot length in bytes
    #[arg(long = "snaplen")]
    pub snap_len: Option<u32>,

    /// Capacity of each classified frame queue
    #[arg(long = "queue-capacity")]
    pub queue_capacity: Option<usize>,

    /// Read frames from a pcap file instead of capturing live
    #[arg(short = 'r', long = "replay")]
    pub replay: Option<PathBuf>,

    /// Count large ESP packets from the destination as probe responses
    #[arg(long = "esp-ack")]
    pub esp_ack: bool,

    /// Verbose logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Print the final report as JSON
    #[arg(long = "json")]
    pub json: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.destination.is_none() && self.config.is_none() {
            return Err("A destination is required (positional or via --config)".into());
        }

        if let Some(ref protocol) = self.protocol {
            let protocol = protocol.to_lowercase();
            if !["icmp", "udp"].contains(&protocol.as_str()) {
                return Err(format!("Unknown protocol: {}. Use icmp or udp", protocol));
            }
        }

        if self.increment == Some(0) {
            return Err("Increment must be at least 1".into());
        }

        if self.passes == Some(0) {
            return Err("Passes must be at least 1".into());
        }

        if self.timeout.is_some_and(|t| t <= 0.0) {
            return Err("Timeout must be positive".into());
        }

        if self.settle.is_some_and(|s| s < 0.0) {
            return Err("Settle delay cannot be negative".into());
        }

        if self.queue_capacity == Some(0) {
            return Err("Queue capacity must be at least 1".into());
        }

        if self.start_mtu.is_some_and(|m| (m as usize) < MIN_PROBE_SIZE) {
            return Err(format!("Start MTU must be at least {}", MIN_PROBE_SIZE));
        }

        if self.snap_len.is_some_and(|s| s < MIN_SNAP_LEN) {
            return Err(format!("Snapshot length must be at least {}", MIN_SNAP_LEN));
        }

        Ok(())
    }
}
