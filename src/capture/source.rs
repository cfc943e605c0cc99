//! Frame sources: live capture on all interfaces, or a pcap replay file.

use pcap_file::pcap::PcapReader;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::frame::{Frame, LinkType};
use crate::config::Config;
use crate::error::{Error, Result};

/// Read timeout of the live source, bounds how long quit can go unnoticed
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of asking a source for its next frame
#[derive(Debug)]
pub enum NextFrame {
    Frame(Frame),
    /// Read timeout elapsed without a frame
    Idle,
    /// The source will never yield another frame
    Exhausted,
}

/// Anything that yields captured frames
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> std::io::Result<NextFrame>;

    /// Short description for logs
    fn describe(&self) -> String;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn next_frame(&mut self) -> std::io::Result<NextFrame> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Open the source the config asks for
pub fn open_source(config: &Config) -> Result<Box<dyn PacketSource>> {
    match config.replay_file {
        Some(ref path) => {
            tracing::info!(path = %path.display(), "reading frames from replay file");
            Ok(Box::new(ReplaySource::open(path, config.snap_len)?))
        }
        None => Ok(Box::new(LiveSource::open(config.snap_len)?)),
    }
}

/// Frames from a classic pcap file
pub struct ReplaySource {
    reader: PcapReader<BufReader<File>>,
    link: LinkType,
    path: PathBuf,
    snap_len: usize,
}

impl ReplaySource {
    pub fn open(path: &Path, snap_len: u32) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::CaptureOpen {
            device: path.display().to_string(),
            source: e,
        })?;
        let reader = PcapReader::new(BufReader::new(file)).map_err(|e| Error::ReplayFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let datalink = reader.header().datalink;
        let link = LinkType::from_datalink(datalink).ok_or(Error::UnsupportedLinkType(datalink))?;
        Ok(Self {
            reader,
            link,
            path: path.to_path_buf(),
            snap_len: snap_len as usize,
        })
    }
}

impl PacketSource for ReplaySource {
    fn next_frame(&mut self) -> std::io::Result<NextFrame> {
        match self.reader.next_packet() {
            Some(Ok(packet)) => {
                let len = packet.data.len().min(self.snap_len);
                Ok(NextFrame::Frame(Frame::new(self.link, packet.data[..len].to_vec())))
            }
            Some(Err(e)) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            None => Ok(NextFrame::Exhausted),
        }
    }

    fn describe(&self) -> String {
        format!("replay file {}", self.path.display())
    }
}

/// Live capture on every interface
#[cfg(target_os = "linux")]
pub struct LiveSource {
    socket: socket2::Socket,
    buffer: Vec<u8>,
}

#[cfg(target_os = "linux")]
impl LiveSource {
    /// Open an AF_PACKET socket not bound to any interface.
    ///
    /// SOCK_DGRAM strips the link header so every frame starts at the network
    /// layer regardless of the interface it arrived on.
    pub fn open(snap_len: u32) -> Result<Self> {
        use crate::error::IoOperation;
        use socket2::{Domain, Protocol, Socket, Type};

        let protocol = Protocol::from((libc::ETH_P_ALL as u16).to_be() as libc::c_int);
        let socket = Socket::new(Domain::PACKET, Type::DGRAM, Some(protocol)).map_err(|e| {
            Error::CaptureOpen {
                device: "any".to_string(),
                source: e,
            }
        })?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| Error::Socket(IoOperation::SetReadTimeout, e))?;

        enable_promiscuous(&socket);

        Ok(Self {
            socket,
            buffer: vec![0u8; snap_len as usize],
        })
    }
}

/// Request promiscuous mode on every up, non-loopback interface.
/// Best-effort: failures are logged and capture continues.
#[cfg(target_os = "linux")]
fn enable_promiscuous(socket: &socket2::Socket) {
    use crate::error::IoOperation;
    use std::os::unix::io::AsRawFd;

    for iface in pnet::datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        let mreq = libc::packet_mreq {
            mr_ifindex: iface.index as libc::c_int,
            mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of_val(&mreq) as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = Error::Socket(IoOperation::AddMembership, std::io::Error::last_os_error());
            tracing::warn!(interface = %iface.name, "promiscuous mode unavailable: {}", err);
        } else {
            tracing::debug!(interface = %iface.name, "promiscuous mode enabled");
        }
    }
}

#[cfg(target_os = "linux")]
impl PacketSource for LiveSource {
    fn next_frame(&mut self) -> std::io::Result<NextFrame> {
        use std::io::{ErrorKind, Read};

        match (&self.socket).read(&mut self.buffer) {
            Ok(len) => Ok(NextFrame::Frame(Frame::new(
                LinkType::RawIp,
                self.buffer[..len].to_vec(),
            ))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(NextFrame::Idle)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(NextFrame::Idle),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        "live capture on any interface".to_string()
    }
}

/// Live capture needs AF_PACKET, only replay files work elsewhere
#[cfg(not(target_os = "linux"))]
pub struct LiveSource;

#[cfg(not(target_os = "linux"))]
impl LiveSource {
    pub fn open(_snap_len: u32) -> Result<Self> {
        Err(Error::CaptureUnsupported)
    }
}

#[cfg(not(target_os = "linux"))]
impl PacketSource for LiveSource {
    fn next_frame(&mut self) -> std::io::Result<NextFrame> {
        Ok(NextFrame::Exhausted)
    }

    fn describe(&self) -> String {
        "unsupported live capture".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::DataLink;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};

    fn write_replay(datalink: DataLink, frames: &[&[u8]]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let header = PcapHeader {
            datalink,
            ..Default::default()
        };
        let mut writer = PcapWriter::with_header(file.reopen().unwrap(), header).unwrap();
        for data in frames {
            let packet = PcapPacket::new(Duration::ZERO, data.len() as u32, data);
            writer.write_packet(&packet).unwrap();
        }
        drop(writer);
        file
    }

    #[test]
    fn test_replay_yields_frames_then_exhausts() {
        let file = write_replay(DataLink::RAW, &[&[0x45; 20], &[0x45; 40]]);
        let mut source = ReplaySource::open(file.path(), 65535).unwrap();

        let mut lens = Vec::new();
        loop {
            match source.next_frame().unwrap() {
                NextFrame::Frame(frame) => {
                    assert_eq!(frame.link, LinkType::RawIp);
                    lens.push(frame.data.len());
                }
                NextFrame::Idle => continue,
                NextFrame::Exhausted => break,
            }
        }
        assert_eq!(lens, vec![20, 40]);
        assert!(matches!(source.next_frame().unwrap(), NextFrame::Exhausted));
    }

    #[test]
    fn test_replay_truncates_to_snap_len() {
        let file = write_replay(DataLink::ETHERNET, &[&[0u8; 200]]);
        let mut source = ReplaySource::open(file.path(), 64).unwrap();
        match source.next_frame().unwrap() {
            NextFrame::Frame(frame) => assert_eq!(frame.data.len(), 64),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_replay_missing_file() {
        let err = ReplaySource::open(Path::new("/nonexistent/capture.pcap"), 65535)
            .err()
            .unwrap();
        assert!(matches!(err, Error::CaptureOpen { .. }));
    }

    #[test]
    fn test_replay_unsupported_link() {
        let file = write_replay(DataLink::IEEE802_11, &[&[0u8; 40]]);
        let err = ReplaySource::open(file.path(), 65535).err().unwrap();
        assert!(matches!(err, Error::UnsupportedLinkType(_)));
    }

    #[test]
    fn test_replay_not_a_pcap() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"definitely not a capture file").unwrap();
        assert!(ReplaySource::open(file.path(), 65535).is_err());
    }
}
