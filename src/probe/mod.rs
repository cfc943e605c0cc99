pub mod icmp;
pub mod packet;
pub mod sender;
pub mod socket;
pub mod udp;

pub use icmp::*;
pub use packet::*;
pub use sender::*;
pub use socket::*;
pub use udp::*;
