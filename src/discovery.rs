//! Multicast announce channel. Best-effort UDP to a fixed group: no
//! reliability, ordering or de-duplication.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::{DiscoveredPeer, PeerId};
use crate::protocol::Alive;

pub const ANNOUNCE_TICK: Duration = Duration::from_millis(500);
const ANNOUNCE_WAIT: Duration = Duration::from_secs(5);
const ANNOUNCE_COUNT: u32 = 5;
/// Discovered peers not heard from for this long are forgotten.
pub const DISCOVERED_TTL: Duration = Duration::from_secs(300);

/// An inbound datagram. The sender is treated as a peer that is always
/// connected for the lifetime of this one datagram.
#[derive(Debug)]
pub struct Datagram {
    pub frame: Bytes,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceState {
    Idle,
    WaitForAnnounce,
    Announcing,
    Listening,
}

pub struct Announce {
    outbound: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
    state: AnnounceState,
    wait_until: Instant,
    announce_left: u32,
    peers: HashMap<PeerId, DiscoveredPeer>,
}

impl Announce {
    /// Joins the IPv4 group on `port` and, if the host allows it, the IPv6
    /// group too. Inbound datagrams are forwarded to `datagrams`.
    pub async fn init(
        ipv4_group: Ipv4Addr,
        ipv6_group: Ipv6Addr,
        port: u16,
        datagrams: mpsc::UnboundedSender<Datagram>,
    ) -> io::Result<Self> {
        let mut sockets: Vec<(Arc<UdpSocket>, SocketAddr)> = Vec::new();

        let v4 = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        v4.join_multicast_v4(ipv4_group, Ipv4Addr::UNSPECIFIED)?;
        v4.set_multicast_loop_v4(true)?;
        tracing::info!("joined multicast group {}:{}", ipv4_group, port);
        sockets.push((Arc::new(v4), SocketAddr::V4(SocketAddrV4::new(ipv4_group, port))));

        match join_v6(ipv6_group, port).await {
            Ok(v6) => {
                tracing::info!("joined multicast group [{}]:{}", ipv6_group, port);
                sockets.push((
                    Arc::new(v6),
                    SocketAddr::V6(SocketAddrV6::new(ipv6_group, port, 0, 0)),
                ));
            }
            Err(e) => tracing::warn!("ipv6 multicast unavailable: {}", e),
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let mut tasks = Vec::new();

        for (socket, _) in &sockets {
            let socket = socket.clone();
            let datagrams = datagrams.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let datagram = Datagram {
                                frame: Bytes::copy_from_slice(&buf[..n]),
                                from,
                            };
                            if datagrams.send(datagram).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("multicast receive failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                for (socket, group) in &sockets {
                    if let Err(e) = socket.send_to(&frame, *group).await {
                        tracing::debug!("multicast send to {} failed: {}", group, e);
                    }
                }
            }
        }));

        Ok(Self::with_sender(outbound, tasks))
    }

    /// An announce channel whose outbound frames land in the returned
    /// receiver instead of a socket.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self::with_sender(outbound, Vec::new()), rx)
    }

    fn with_sender(outbound: mpsc::UnboundedSender<Bytes>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            outbound,
            tasks,
            state: AnnounceState::Idle,
            wait_until: Instant::now(),
            announce_left: 0,
            peers: HashMap::new(),
        }
    }

    /// Fire and forget.
    pub fn send(&self, frame: &Bytes) {
        if self.outbound.send(frame.clone()).is_err() {
            tracing::debug!("multicast writer gone, dropping frame");
        }
    }

    pub fn state(&self) -> AnnounceState {
        self.state
    }

    pub fn start(&mut self, now: Instant) {
        self.goto_state(AnnounceState::WaitForAnnounce, now);
    }

    fn goto_state(&mut self, state: AnnounceState, now: Instant) {
        match state {
            AnnounceState::WaitForAnnounce => {
                self.wait_until = now + ANNOUNCE_WAIT;
            }
            AnnounceState::Announcing => {
                self.announce_left = ANNOUNCE_COUNT;
            }
            AnnounceState::Idle | AnnounceState::Listening => {}
        }
        self.state = state;
    }

    /// Advances the announce state machine; returns true when an `Alive`
    /// should go out on this tick.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        self.sweep(now);
        match self.state {
            AnnounceState::Idle | AnnounceState::Listening => false,
            AnnounceState::WaitForAnnounce => {
                if now >= self.wait_until {
                    self.goto_state(AnnounceState::Announcing, now);
                }
                false
            }
            AnnounceState::Announcing => {
                if self.announce_left > 0 {
                    self.announce_left -= 1;
                    true
                } else {
                    self.goto_state(AnnounceState::Listening, now);
                    false
                }
            }
        }
    }

    /// Records an `Alive` heard on the group. Returns true for a peer not
    /// seen before.
    pub fn on_alive(
        &mut self,
        source: PeerId,
        from: SocketAddr,
        alive: &Alive,
        local: PeerId,
        now: Instant,
    ) -> bool {
        let is_new = self
            .peers
            .insert(
                source,
                DiscoveredPeer {
                    id: source,
                    address: from,
                    listen_port: alive.listen_port,
                    hostname: alive.hostname.clone(),
                    last_seen: now,
                },
            )
            .is_none();

        match self.state {
            AnnounceState::Idle => {}
            AnnounceState::WaitForAnnounce => {
                // Someone else is announcing; keep quiet a little longer
                self.goto_state(AnnounceState::WaitForAnnounce, now);
            }
            AnnounceState::Announcing => {
                if source > local {
                    self.goto_state(AnnounceState::WaitForAnnounce, now);
                } else if self.announce_left < 2 {
                    self.announce_left = 2;
                }
            }
            AnnounceState::Listening => {
                if is_new {
                    // Answer once so the newcomer learns about us
                    self.state = AnnounceState::Announcing;
                    self.announce_left = 1;
                }
            }
        }

        if is_new {
            tracing::info!(peer = %source, "discovered {} at {}", alive.hostname, from);
        }
        is_new
    }

    /// Drops peers whose last `Alive` is older than [`DISCOVERED_TTL`]. A
    /// forgotten peer counts as new when it announces again.
    pub fn sweep(&mut self, now: Instant) {
        self.peers.retain(|id, peer| {
            let keep = now.saturating_duration_since(peer.last_seen) <= DISCOVERED_TTL;
            if !keep {
                tracing::debug!(peer = %id, "forgetting {}", peer.hostname);
            }
            keep
        });
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        self.peers.values().cloned().collect()
    }

    pub fn discovered_peer(&self, id: PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(&id)
    }
}

impl Drop for Announce {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn join_v6(group: Ipv6Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)).await?;
    socket.join_multicast_v6(&group, 0)?;
    socket.set_multicast_loop_v6(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive() -> Alive {
        Alive {
            hostname: "other".into(),
            listen_port: 2702,
        }
    }

    fn from() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 2773))
    }

    #[test]
    fn waits_then_announces_five_times() {
        let (mut announce, _rx) = Announce::detached();
        let t0 = Instant::now();
        announce.start(t0);

        assert!(!announce.heartbeat(t0 + Duration::from_secs(1)));
        assert_eq!(announce.state(), AnnounceState::WaitForAnnounce);

        let mut now = t0 + ANNOUNCE_WAIT;
        assert!(!announce.heartbeat(now));
        assert_eq!(announce.state(), AnnounceState::Announcing);

        let mut sent = 0;
        for _ in 0..10 {
            now += ANNOUNCE_TICK;
            if announce.heartbeat(now) {
                sent += 1;
            }
        }
        assert_eq!(sent, ANNOUNCE_COUNT);
        assert_eq!(announce.state(), AnnounceState::Listening);
    }

    #[test]
    fn larger_peer_makes_us_defer() {
        let (mut announce, _rx) = Announce::detached();
        let local = PeerId::from_bytes([0; 16]);
        let bigger = PeerId::from_bytes([0xff; 16]);
        let t0 = Instant::now();
        announce.start(t0);
        announce.heartbeat(t0 + ANNOUNCE_WAIT);
        assert_eq!(announce.state(), AnnounceState::Announcing);

        announce.on_alive(bigger, from(), &alive(), local, t0 + ANNOUNCE_WAIT);
        assert_eq!(announce.state(), AnnounceState::WaitForAnnounce);
    }

    #[test]
    fn newcomer_gets_one_answer_while_listening() {
        let (mut announce, _rx) = Announce::detached();
        let local = PeerId::random();
        let t0 = Instant::now();
        announce.state = AnnounceState::Listening;

        let newcomer = PeerId::random();
        assert!(announce.on_alive(newcomer, from(), &alive(), local, t0));
        assert!(announce.heartbeat(t0));
        assert!(!announce.heartbeat(t0));
        assert_eq!(announce.state(), AnnounceState::Listening);

        // Known peers do not trigger another answer
        assert!(!announce.on_alive(newcomer, from(), &alive(), local, t0));
        assert_eq!(announce.state(), AnnounceState::Listening);

        let peer = announce.discovered_peer(newcomer).expect("recorded");
        assert_eq!(peer.link_address(), SocketAddr::from(([192, 168, 1, 20], 2702)));
    }

    #[test]
    fn silent_peers_are_forgotten() {
        let (mut announce, _rx) = Announce::detached();
        let local = PeerId::random();
        let t0 = Instant::now();
        let quiet = PeerId::random();
        let chatty = PeerId::random();
        announce.on_alive(quiet, from(), &alive(), local, t0);
        announce.on_alive(chatty, from(), &alive(), local, t0);

        announce.heartbeat(t0 + DISCOVERED_TTL);
        assert_eq!(announce.discovered().len(), 2);

        let later = t0 + DISCOVERED_TTL + Duration::from_secs(1);
        announce.on_alive(chatty, from(), &alive(), local, later);
        announce.heartbeat(later);
        let ids: Vec<PeerId> = announce.discovered().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![chatty]);

        // Heard again after being forgotten
        assert!(announce.on_alive(quiet, from(), &alive(), local, later));
    }

    #[test]
    fn detached_send_is_captured() {
        let (announce, mut rx) = Announce::detached();
        announce.send(&Bytes::from_static(b"hi"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"hi"));
    }
}
