//! Message routing between the local instance and its neighbours.
//!
//! Every frame is decoded once, dispatched to local subscribers of its
//! `(domain, tag)` and then flooded to every other direct link. A bounded
//! cache of `(source, message_id)` pairs stops a frame from being handled
//! twice when the link graph contains cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{AuthStub, Codec, FrameError, WireHeader};
use crate::discovery::Announce;
use crate::peer::{DiscoveredPeer, PeerId};
use crate::protocol::{Alive, Envelope, Payload, Scope, DOMAIN_LINK};
use crate::transport::{DirectLinks, LinkChange, LinkId, LinkState};

const SEEN_CAPACITY: usize = 1024;

/// How a frame reached this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Link(LinkId),
    Multicast(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub source: PeerId,
    pub scope: Scope,
    pub via: Via,
    pub authenticated: bool,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Payload,
    pub context: MessageContext,
}

pub type Subscription = mpsc::UnboundedReceiver<Delivery>;

/// Outcome of handling one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Undecodable, sent by us, or already handled.
    Dropped,
    Delivered,
    /// Delivered, and the frame announced a peer heard for the first time.
    Discovered(DiscoveredPeer),
}

/// Fixed-size FIFO of recently handled message keys.
struct SeenCache {
    order: VecDeque<(PeerId, u64)>,
    keys: HashSet<(PeerId, u64)>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: (PeerId, u64)) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct Router {
    local_id: PeerId,
    alive: Alive,
    codec: Codec,
    links: DirectLinks,
    announce: Option<Announce>,
    subscribers: HashMap<(u32, u32), Vec<mpsc::UnboundedSender<Delivery>>>,
    seen: SeenCache,
    auth: Option<AuthStub>,
}

impl Router {
    pub fn new(local_id: PeerId, hostname: String, codec: Codec, links: DirectLinks) -> Self {
        Self {
            local_id,
            alive: Alive {
                hostname,
                listen_port: 0,
            },
            codec,
            links,
            announce: None,
            subscribers: HashMap::new(),
            seen: SeenCache::new(SEEN_CAPACITY),
            auth: None,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Port advertised in `Alive`.
    pub fn set_listen_port(&mut self, port: u16) {
        self.alive.listen_port = port;
    }

    /// Username placed in every outgoing header. Receivers do not check it.
    pub fn set_username(&mut self, username: &str) {
        self.auth = if username.is_empty() {
            None
        } else {
            Some(AuthStub {
                username: username.to_string(),
                nonce: String::new(),
                hash: Vec::new(),
            })
        };
    }

    pub fn set_announce(&mut self, announce: Option<Announce>) {
        self.announce = announce;
    }

    pub fn announce(&self) -> Option<&Announce> {
        self.announce.as_ref()
    }

    pub fn links(&self) -> &DirectLinks {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut DirectLinks {
        &mut self.links
    }

    /// Registers interest in one message type.
    pub fn signal_message(&mut self, domain: u32, payload_tag: u32) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry((domain, payload_tag))
            .or_default()
            .push(tx);
        rx
    }

    /// Stamps, encodes and records a locally originated message.
    fn encode_local(&mut self, envelope: &mut Envelope) -> Result<Bytes, FrameError> {
        envelope.source = Some(self.local_id);
        let message_id: u64 = rand::random();
        let mut header = WireHeader::new(self.local_id, &envelope.payload, message_id);
        header.authenticated = envelope.authenticated;
        header.auth = self.auth.clone();
        let frame = self.codec.encode(&header, &envelope.payload)?;
        self.seen.insert((self.local_id, message_id));
        Ok(Bytes::from(frame))
    }

    pub fn send(&mut self, mut envelope: Envelope) -> Result<(), FrameError> {
        let frame = self.encode_local(&mut envelope)?;
        tracing::trace!(
            domain = envelope.domain(),
            tag = envelope.payload_tag(),
            scope = ?envelope.scope,
            "send"
        );
        if envelope.scope.includes_direct() {
            self.links.send_message(&frame);
        }
        if envelope.scope.includes_multicast() {
            if let Some(announce) = &self.announce {
                announce.send(&frame);
            }
        }
        Ok(())
    }

    pub fn send_to(&mut self, mut envelope: Envelope, link: LinkId) -> Result<(), FrameError> {
        let frame = self.encode_local(&mut envelope)?;
        self.links.send_message_to(&frame, link);
        Ok(())
    }

    pub fn send_except(&mut self, mut envelope: Envelope, link: LinkId) -> Result<(), FrameError> {
        let frame = self.encode_local(&mut envelope)?;
        self.links.send_message_except(&frame, link);
        Ok(())
    }

    /// Decodes, dispatches and relays one inbound frame.
    pub fn on_data(&mut self, frame: Bytes, via: Via) -> Inbound {
        let (header, payload) = match self.codec.decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(?via, "dropping undecodable frame: {}", e);
                return Inbound::Dropped;
            }
        };

        let source = header.source_id();
        if source == self.local_id {
            tracing::trace!(?via, "dropping own message");
            return Inbound::Dropped;
        }
        if !self.seen.insert((source, header.message_id)) {
            tracing::trace!(peer = %source, message = header.message_id, "dropping duplicate");
            return Inbound::Dropped;
        }

        let scope = match via {
            Via::Link(_) => Scope::Direct,
            Via::Multicast(_) => Scope::Multicast,
        };

        let mut outcome = Inbound::Delivered;
        if let Payload::Alive(alive) = &payload {
            outcome = self.on_alive(source, alive, via);
        }

        self.dispatch(
            &header,
            payload,
            MessageContext {
                source,
                scope,
                via,
                authenticated: header.authenticated,
            },
        );

        // Link-level traffic describes the neighbour itself and stays one hop
        if header.domain != DOMAIN_LINK {
            match via {
                Via::Link(id) => self.links.send_message_except(&frame, id),
                Via::Multicast(_) => self.links.send_message(&frame),
            }
        }

        outcome
    }

    fn on_alive(&mut self, source: PeerId, alive: &Alive, via: Via) -> Inbound {
        match via {
            Via::Link(id) => {
                if let Some(link) = self.links.get_mut(id) {
                    if link.remote_id != Some(source) {
                        tracing::info!(link = id, peer = %source, "neighbour is {}", alive.hostname);
                    }
                    link.remote_id = Some(source);
                }
                Inbound::Delivered
            }
            Via::Multicast(from) => {
                let local = self.local_id;
                match self.announce.as_mut() {
                    Some(announce) => {
                        if announce.on_alive(source, from, alive, local, Instant::now()) {
                            announce
                                .discovered_peer(source)
                                .cloned()
                                .map(Inbound::Discovered)
                                .unwrap_or(Inbound::Delivered)
                        } else {
                            Inbound::Delivered
                        }
                    }
                    None => Inbound::Delivered,
                }
            }
        }
    }

    fn dispatch(&mut self, header: &WireHeader, payload: Payload, context: MessageContext) {
        let key = (header.domain, header.payload_tag);
        let Some(subscribers) = self.subscribers.get_mut(&key) else {
            return;
        };
        subscribers.retain(|tx| {
            tx.send(Delivery {
                payload: payload.clone(),
                context: context.clone(),
            })
            .is_ok()
        });
    }

    /// Reacts to a link state change; new neighbours are told who we are.
    pub fn on_link_change(&mut self, change: &LinkChange) {
        if change.state != LinkState::Connected {
            return;
        }
        let alive = Envelope::new(Payload::Alive(self.alive.clone())).with_scope(Scope::Direct);
        if let Err(e) = self.send_to(alive, change.id) {
            tracing::warn!(link = change.id, "failed to send alive: {}", e);
        }
    }

    /// Drives the announce state machine; sends an `Alive` on the group
    /// when it is our turn.
    pub fn heartbeat(&mut self, now: Instant) {
        let due = match self.announce.as_mut() {
            Some(announce) => announce.heartbeat(now),
            None => false,
        };
        if due {
            let alive =
                Envelope::new(Payload::Alive(self.alive.clone())).with_scope(Scope::Multicast);
            if let Err(e) = self.send(alive) {
                tracing::warn!("failed to announce: {}", e);
            }
        }
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.announce
            .as_ref()
            .map(Announce::discovered)
            .unwrap_or_default()
    }
}
