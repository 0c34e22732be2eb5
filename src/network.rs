//! The network event loop. One task owns the router, the direct links and
//! the announce channel; everything else talks to it through a
//! [`NetworkHandle`].

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::codec::Codec;
use crate::discovery::{Announce, Datagram, ANNOUNCE_TICK};
use crate::peer::{DiscoveredPeer, PeerId};
use crate::protocol::Envelope;
use crate::router::{Inbound, Router, Subscription, Via};
use crate::settings::Settings;
use crate::transport::{DirectLinks, LinkChange, LinkEvent, LinkId, LinkInfo, LinkState};

const CHANGE_CAPACITY: usize = 64;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network event loop has stopped")]
    Stopped,
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub local_id: PeerId,
    pub hostname: String,
    pub username: String,
    /// Listen port for direct links and the announce group (0 picks any).
    pub port: u16,
    pub multicast: bool,
    pub multicast_ipv4: Ipv4Addr,
    pub multicast_ipv6: Ipv6Addr,
    pub auto_connect: bool,
}

impl NetworkConfig {
    pub fn from_settings(settings: &Settings, local_id: PeerId, hostname: String) -> Self {
        Self {
            local_id,
            hostname,
            username: settings.username.clone(),
            port: settings.port,
            multicast: settings.multicast,
            multicast_ipv4: settings.multicast_ipv4,
            multicast_ipv6: settings.multicast_ipv6,
            auto_connect: settings.auto_connect,
        }
    }
}

enum Command {
    Send(Envelope),
    SendTo(Envelope, LinkId),
    SendExcept(Envelope, LinkId),
    Connect {
        host: String,
        port: u16,
        supervised: bool,
        reply: oneshot::Sender<LinkId>,
    },
    Disconnect(LinkId),
    Leave,
    Subscribe {
        domain: u32,
        payload_tag: u32,
        reply: oneshot::Sender<Subscription>,
    },
    Links(oneshot::Sender<Vec<LinkInfo>>),
    DiscoveredPeers(oneshot::Sender<Vec<DiscoveredPeer>>),
    Shutdown,
}

/// Cheap to clone; every method marshals onto the event loop.
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<LinkChange>,
    local_id: PeerId,
    listen_addr: SocketAddr,
}

impl NetworkHandle {
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn command(&self, command: Command) -> Result<(), NetworkError> {
        self.commands.send(command).map_err(|_| NetworkError::Stopped)
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.command(Command::Send(envelope))
    }

    pub fn send_to(&self, envelope: Envelope, link: LinkId) -> Result<(), NetworkError> {
        self.command(Command::SendTo(envelope, link))
    }

    /// Sends to every connected link but `link`.
    pub fn send_except(&self, envelope: Envelope, link: LinkId) -> Result<(), NetworkError> {
        self.command(Command::SendExcept(envelope, link))
    }

    /// Dials a peer once.
    pub async fn connect(&self, host: &str, port: u16) -> Result<LinkId, NetworkError> {
        self.dial(host, port, false).await
    }

    /// Dials a peer and keeps re-dialing it whenever the link drops.
    pub async fn connect_supervised(&self, host: &str, port: u16) -> Result<LinkId, NetworkError> {
        self.dial(host, port, true).await
    }

    async fn dial(&self, host: &str, port: u16, supervised: bool) -> Result<LinkId, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            host: host.to_string(),
            port,
            supervised,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    /// Closes `link` and stops supervising it, including a re-dial that is
    /// already waiting after the link dropped.
    pub fn disconnect(&self, link: LinkId) -> Result<(), NetworkError> {
        self.command(Command::Disconnect(link))
    }

    /// Drops every link and stops re-dialing.
    pub fn leave(&self) -> Result<(), NetworkError> {
        self.command(Command::Leave)
    }

    pub async fn signal_message(
        &self,
        domain: u32,
        payload_tag: u32,
    ) -> Result<Subscription, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            domain,
            payload_tag,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    pub async fn links(&self) -> Result<Vec<LinkInfo>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Links(reply))?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    pub async fn discovered_peers(&self) -> Result<Vec<DiscoveredPeer>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::DiscoveredPeers(reply))?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    /// "Client changed": every link state transition.
    pub fn link_changes(&self) -> broadcast::Receiver<LinkChange> {
        self.changes.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }
}

/// Delay before re-dial number `attempt` (0-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    RECONNECT_BASE.saturating_mul(factor).min(RECONNECT_MAX)
}

struct Supervised {
    host: String,
    port: u16,
    attempt: u32,
}

struct Redial {
    /// The closed link this re-dial replaces.
    from: LinkId,
    host: String,
    port: u16,
    attempt: u32,
}

pub struct Network {
    router: Router,
    local_id: PeerId,
    auto_connect: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    datagrams: mpsc::UnboundedReceiver<Datagram>,
    // Held so the datagram branch stays pending when multicast is off
    _datagram_tx: mpsc::UnboundedSender<Datagram>,
    redials: mpsc::UnboundedReceiver<Redial>,
    redial_tx: mpsc::UnboundedSender<Redial>,
    changes: broadcast::Sender<LinkChange>,
    supervised: HashMap<LinkId, Supervised>,
    // Backoff timers, keyed by the link that closed
    pending: HashMap<LinkId, JoinHandle<()>>,
}

impl Network {
    /// Binds the listener, joins the announce group and spawns the loop.
    pub async fn start(
        config: NetworkConfig,
    ) -> Result<(NetworkHandle, JoinHandle<()>), NetworkError> {
        let (link_tx, link_events) = mpsc::unbounded_channel();
        let mut links = DirectLinks::new(link_tx);
        let listen_addr = links
            .listen(config.port)
            .await
            .map_err(|source| NetworkError::Listen {
                port: config.port,
                source,
            })?;

        let mut router = Router::new(config.local_id, config.hostname.clone(), Codec::default(), links);
        router.set_listen_port(listen_addr.port());
        router.set_username(&config.username);

        let (datagram_tx, datagrams) = mpsc::unbounded_channel();
        if config.multicast {
            match Announce::init(
                config.multicast_ipv4,
                config.multicast_ipv6,
                listen_addr.port(),
                datagram_tx.clone(),
            )
            .await
            {
                Ok(mut announce) => {
                    announce.start(Instant::now());
                    router.set_announce(Some(announce));
                }
                Err(e) => tracing::warn!("multicast disabled: {}", e),
            }
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (redial_tx, redials) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        let handle = NetworkHandle {
            commands: commands_tx,
            changes: changes.clone(),
            local_id: config.local_id,
            listen_addr,
        };

        let network = Network {
            router,
            local_id: config.local_id,
            auto_connect: config.auto_connect,
            commands,
            link_events,
            datagrams,
            _datagram_tx: datagram_tx,
            redials,
            redial_tx,
            changes,
            supervised: HashMap::new(),
            pending: HashMap::new(),
        };

        tracing::info!(peer = %config.local_id, "network started on {}", listen_addr);
        let task = tokio::spawn(network.run());
        Ok((handle, task))
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(ANNOUNCE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                Some(datagram) = self.datagrams.recv() => self.on_datagram(datagram),
                Some(redial) = self.redials.recv() => self.on_redial(redial),
                _ = tick.tick() => self.router.heartbeat(Instant::now()),
            }
        }

        self.stop_supervision();
        for change in self.router.links_mut().close_all() {
            let _ = self.changes.send(change);
        }
        self.router.links_mut().stop_listening();
        tracing::info!("network stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(envelope) => {
                if let Err(e) = self.router.send(envelope) {
                    tracing::warn!("dropping outbound message: {}", e);
                }
            }
            Command::SendTo(envelope, link) => {
                if let Err(e) = self.router.send_to(envelope, link) {
                    tracing::warn!(link = link, "dropping outbound message: {}", e);
                }
            }
            Command::SendExcept(envelope, link) => {
                if let Err(e) = self.router.send_except(envelope, link) {
                    tracing::warn!(link = link, "dropping outbound message: {}", e);
                }
            }
            Command::Connect {
                host,
                port,
                supervised,
                reply,
            } => {
                let id = self.router.links_mut().connect(&host, port);
                if supervised {
                    self.supervised.insert(
                        id,
                        Supervised {
                            host,
                            port,
                            attempt: 0,
                        },
                    );
                }
                let _ = reply.send(id);
            }
            Command::Disconnect(link) => {
                self.supervised.remove(&link);
                if let Some(timer) = self.pending.remove(&link) {
                    timer.abort();
                }
                if let Some(change) = self.router.links_mut().close(link) {
                    self.on_link_change(change);
                }
            }
            Command::Leave => {
                self.stop_supervision();
                for change in self.router.links_mut().close_all() {
                    self.on_link_change(change);
                }
            }
            Command::Subscribe {
                domain,
                payload_tag,
                reply,
            } => {
                let _ = reply.send(self.router.signal_message(domain, payload_tag));
            }
            Command::Links(reply) => {
                let links = self.router.links().links().map(|l| l.info()).collect();
                let _ = reply.send(links);
            }
            Command::DiscoveredPeers(reply) => {
                let _ = reply.send(self.router.discovered_peers());
            }
            Command::Shutdown => {}
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Data { id, frame } => {
                self.router.on_data(frame, Via::Link(id));
            }
            event => {
                if let Some(change) = self.router.links_mut().on_state_event(event) {
                    self.on_link_change(change);
                }
            }
        }
    }

    fn on_link_change(&mut self, change: LinkChange) {
        self.router.on_link_change(&change);

        match change.state {
            LinkState::Connected => {
                if let Some(entry) = self.supervised.get_mut(&change.id) {
                    entry.attempt = 0;
                }
            }
            LinkState::Closed => {
                if let Some(entry) = self.supervised.remove(&change.id) {
                    self.schedule_redial(change.id, entry);
                }
            }
            LinkState::Connecting => {}
        }

        let _ = self.changes.send(change);
    }

    fn stop_supervision(&mut self) {
        self.supervised.clear();
        for (_, timer) in self.pending.drain() {
            timer.abort();
        }
    }

    fn schedule_redial(&mut self, from: LinkId, entry: Supervised) {
        let delay = reconnect_delay(entry.attempt);
        tracing::info!(
            "re-dialing {}:{} in {:?} (attempt {})",
            entry.host,
            entry.port,
            delay,
            entry.attempt + 1
        );
        let redial_tx = self.redial_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = redial_tx.send(Redial {
                from,
                host: entry.host,
                port: entry.port,
                attempt: entry.attempt.saturating_add(1),
            });
        });
        self.pending.insert(from, timer);
    }

    fn on_redial(&mut self, redial: Redial) {
        // Cancelled after the timer already fired
        if self.pending.remove(&redial.from).is_none() {
            return;
        }
        let id = self.router.links_mut().connect(&redial.host, redial.port);
        self.supervised.insert(
            id,
            Supervised {
                host: redial.host,
                port: redial.port,
                attempt: redial.attempt,
            },
        );
    }

    fn on_datagram(&mut self, datagram: Datagram) {
        let Inbound::Discovered(peer) = self.router.on_data(datagram.frame, Via::Multicast(datagram.from))
        else {
            return;
        };
        if !self.auto_connect || self.local_id >= peer.id || self.router.links().is_linked_to(peer.id) {
            return;
        }
        let target = peer.link_address();
        tracing::info!(peer = %peer.id, "auto-connecting to {}", target);
        self.router
            .links_mut()
            .connect(&target.ip().to_string(), target.port());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{tag, OperationModeUpdate, Payload, DOMAIN_CORE};

    fn config() -> NetworkConfig {
        NetworkConfig {
            local_id: PeerId::random(),
            hostname: "test".into(),
            username: String::new(),
            port: 0,
            multicast: false,
            multicast_ipv4: crate::settings::MULTICAST_IPV4,
            multicast_ipv6: crate::settings::MULTICAST_IPV6,
            auto_connect: false,
        }
    }

    async fn wait_for_connected(changes: &mut broadcast::Receiver<LinkChange>) -> LinkChange {
        loop {
            let change = changes.recv().await.expect("change");
            if change.state == LinkState::Connected {
                return change;
            }
        }
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(5), Duration::from_secs(32));
        assert_eq!(reconnect_delay(6), Duration::from_secs(60));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn linked_instances_exchange_messages_and_identities() {
        let (a, _ta) = Network::start(config()).await.unwrap();
        let (b, _tb) = Network::start(config()).await.unwrap();
        let mut sub = b.signal_message(DOMAIN_CORE, tag::OPERATION_MODE).await.unwrap();
        let mut changes = a.link_changes();

        a.connect("127.0.0.1", b.listen_addr().port()).await.unwrap();
        wait_for_connected(&mut changes).await;

        a.send(Envelope::new(Payload::OperationMode(OperationModeUpdate { mode: 1 })))
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timely")
            .expect("delivery");
        assert_eq!(delivery.context.source, a.local_id());
        assert_eq!(
            delivery.payload,
            Payload::OperationMode(OperationModeUpdate { mode: 1 })
        );

        // Alive precedes any other traffic on the link, so B knows A by now
        let links = b.links().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].remote_id, Some(a.local_id()));

        a.shutdown();
        b.shutdown();
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn supervised_links_are_redialed() {
        let port = free_port();

        let (a, _ta) = Network::start(config()).await.unwrap();
        let mut changes = a.link_changes();
        a.connect_supervised("127.0.0.1", port).await.unwrap();

        // First attempt fails; the peer shows up before the re-dial
        let closed = changes.recv().await.unwrap();
        assert_eq!(closed.state, LinkState::Closed);

        let mut b_config = config();
        b_config.port = port;
        let (b, _tb) = Network::start(b_config).await.unwrap();

        let connected = tokio::time::timeout(Duration::from_secs(10), wait_for_connected(&mut changes))
            .await
            .expect("re-dialed");
        assert!(connected.outbound);

        a.shutdown();
        b.shutdown();
    }

    /// Dials a dead port under supervision and returns once the first
    /// attempt has failed, so a re-dial is waiting.
    async fn in_backoff() -> (NetworkHandle, LinkId, u16) {
        let port = free_port();
        let (a, _ta) = Network::start(config()).await.unwrap();
        let mut changes = a.link_changes();
        let id = a.connect_supervised("127.0.0.1", port).await.unwrap();
        let closed = changes.recv().await.unwrap();
        assert_eq!(closed.state, LinkState::Closed);
        (a, id, port)
    }

    async fn still_unlinked_after_backoff(a: &NetworkHandle, port: u16) {
        let mut b_config = config();
        b_config.port = port;
        let (b, _tb) = Network::start(b_config).await.unwrap();

        // Well past the first two re-dial delays
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(a.links().await.unwrap().is_empty());
        assert!(b.links().await.unwrap().is_empty());
        b.shutdown();
    }

    #[tokio::test]
    async fn leave_cancels_a_waiting_redial() {
        let (a, _, port) = in_backoff().await;
        a.leave().unwrap();
        still_unlinked_after_backoff(&a, port).await;
        a.shutdown();
    }

    #[tokio::test]
    async fn disconnect_cancels_a_waiting_redial() {
        let (a, id, port) = in_backoff().await;
        a.disconnect(id).unwrap();
        still_unlinked_after_backoff(&a, port).await;
        a.shutdown();
    }

    #[tokio::test]
    async fn send_except_reaches_the_other_links() {
        let (a, _ta) = Network::start(config()).await.unwrap();
        let (b, _tb) = Network::start(config()).await.unwrap();
        let (c, _tc) = Network::start(config()).await.unwrap();
        let mut b_sub = b.signal_message(DOMAIN_CORE, tag::OPERATION_MODE).await.unwrap();
        let mut c_sub = c.signal_message(DOMAIN_CORE, tag::OPERATION_MODE).await.unwrap();
        let mut changes = a.link_changes();

        let to_b = a.connect("127.0.0.1", b.listen_addr().port()).await.unwrap();
        wait_for_connected(&mut changes).await;
        a.connect("127.0.0.1", c.listen_addr().port()).await.unwrap();
        wait_for_connected(&mut changes).await;

        a.send_except(
            Envelope::new(Payload::OperationMode(OperationModeUpdate { mode: 2 })),
            to_b,
        )
        .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), c_sub.recv())
            .await
            .expect("timely")
            .expect("delivery");
        assert_eq!(delivery.context.source, a.local_id());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b_sub.try_recv().is_err());

        a.shutdown();
        b.shutdown();
        c.shutdown();
    }

    #[tokio::test]
    async fn handle_reports_stopped_loop() {
        let (a, task) = Network::start(config()).await.unwrap();
        a.shutdown();
        task.await.unwrap();
        assert!(matches!(a.links().await, Err(NetworkError::Stopped)));
        assert!(a.send(Envelope::new(Payload::OperationMode(OperationModeUpdate { mode: 0 }))).is_err());
    }
}
