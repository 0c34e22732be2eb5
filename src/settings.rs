use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 2773;
pub const MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 160, 181, 73);
pub const MULTICAST_IPV6: Ipv6Addr = Ipv6Addr::new(0xff15, 0, 0, 0, 0, 0, 0x1, 0x145);

/// Node settings, read from `settings.json` and overridden from the command
/// line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub port: u16,
    pub multicast: bool,
    pub multicast_ipv4: Ipv4Addr,
    pub multicast_ipv6: Ipv6Addr,
    /// Peers dialed at startup and re-dialed when their link drops, as
    /// `host:port` or bare `host` (default port).
    pub peers: Vec<String>,
    /// Dial peers heard on the announce channel.
    pub auto_connect: bool,
    /// Carried in message headers when set; never verified.
    pub username: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PORT,
            multicast: true,
            multicast_ipv4: MULTICAST_IPV4,
            multicast_ipv6: MULTICAST_IPV6,
            peers: Vec::new(),
            auto_connect: false,
            username: String::new(),
        }
    }
}

impl Settings {
    /// Splits the configured peers into host and port, skipping entries that
    /// do not parse.
    pub fn peer_targets(&self) -> Vec<(String, u16)> {
        self.peers
            .iter()
            .filter_map(|entry| match parse_target(entry) {
                Some(target) => Some(target),
                None => {
                    tracing::warn!("ignoring malformed peer entry {:?}", entry);
                    None
                }
            })
            .collect()
    }
}

fn parse_target(entry: &str) -> Option<(String, u16)> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if let Ok(addr) = entry.parse::<std::net::SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    match entry.rsplit_once(':') {
        // Bare IPv6 literal without a port
        Some((host, _)) if host.contains(':') => Some((entry.to_string(), DEFAULT_PORT)),
        Some((host, port)) => {
            let port = port.parse().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        None => Some((entry.to_string(), DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "port": 2701 }"#).unwrap();
        assert_eq!(settings.port, 2701);
        assert!(settings.multicast);
        assert_eq!(settings.multicast_ipv4, MULTICAST_IPV4);
        assert!(settings.peers.is_empty());
    }

    #[test]
    fn peer_targets_parse_host_and_port() {
        let settings = Settings {
            peers: vec![
                "192.168.1.5:2702".into(),
                "workstation".into(),
                "laptop.local:4000".into(),
                "[::1]:2705".into(),
                "host:notaport".into(),
                "".into(),
            ],
            ..Settings::default()
        };
        assert_eq!(
            settings.peer_targets(),
            vec![
                ("192.168.1.5".to_string(), 2702),
                ("workstation".to_string(), DEFAULT_PORT),
                ("laptop.local".to_string(), 4000),
                ("::1".to_string(), 2705),
            ]
        );
    }
}
