use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use uuid::Uuid;

/// Unique, persistent identifier of one running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub const STR_LENGTH: usize = 36;

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parses the textual form written to the id file. Anything that is not a
    /// full hyphenated UUID is rejected.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.len() != Self::STR_LENGTH {
            return None;
        }
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A peer heard on the announce channel. Discovered peers are not linked
/// until someone dials them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub id: PeerId,
    pub address: SocketAddr,
    pub listen_port: u16,
    pub hostname: String,
    /// When the last announce from this peer arrived.
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    /// Address to dial for a direct link.
    pub fn link_address(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.listen_port)
    }
}
