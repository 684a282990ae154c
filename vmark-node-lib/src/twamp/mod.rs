//! TWAMP-Light measurement engine: NTP clock and wire formats, reflector and
//! sender session tasks, and the in-memory session registry.

pub mod clock;
pub mod dscp;
pub mod reflector;
pub mod registry;
pub mod sender;
mod socket;
pub mod stats;
pub mod wire;

pub use clock::NtpTimestamp;
pub use reflector::{Reflector, ReflectorConfig};
pub use registry::{SenderStatus, SessionRegistry};
pub use sender::{run_sender, SenderConfig};
pub use socket::SocketOptions;
pub use stats::SenderResult;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address family of a session, part of every registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "ipv4"),
            IpVersion::V6 => write!(f, "ipv6"),
        }
    }
}
