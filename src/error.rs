use std::fmt::{Display, Formatter};
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// An ipsecmtu result.
pub type Result<T> = std::result::Result<T, Error>;

/// An ipsecmtu error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open capture on {device}: {source}")]
    CaptureOpen {
        device: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read replay file {path}: {source}")]
    ReplayFile {
        path: PathBuf,
        #[source]
        source: pcap_file::PcapError,
    },
    #[error("unsupported replay link type: {0:?}")]
    UnsupportedLinkType(pcap_file::DataLink),
    #[error("live capture is not supported on this platform")]
    CaptureUnsupported,
    #[error("capture stopped after {errors} consecutive read errors (last: {last})")]
    CaptureRead { errors: u32, last: io::Error },
    #[error("capture thread exited unexpectedly")]
    CaptureExited,
    #[error("analysis interrupted")]
    Interrupted,
    #[error("failed to {0}: {1}")]
    Socket(IoOperation, io::Error),
    #[error("failed to send {size} byte probe to {destination}: {source}")]
    ProbeSend {
        size: usize,
        destination: Ipv4Addr,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    BadConfig(String),
}

impl Error {
    /// True if the error is a local send failure caused by the packet
    /// exceeding the outgoing interface MTU.
    pub fn is_message_too_long(&self) -> bool {
        match self {
            Self::ProbeSend { source, .. } => source.raw_os_error() == Some(libc::EMSGSIZE),
            _ => false,
        }
    }
}

/// Socket operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    NewSocket,
    SetReadTimeout,
    AddMembership,
    LocalAddr,
}

impl Display for IoOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSocket => write!(f, "create new socket"),
            Self::SetReadTimeout => write!(f, "set read timeout"),
            Self::AddMembership => write!(f, "add packet membership"),
            Self::LocalAddr => write!(f, "determine local address"),
        }
    }
}
