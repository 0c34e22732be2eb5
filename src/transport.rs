//! Direct links: TCP connections to explicitly configured peers, each frame
//! prefixed with a 16-bit big-endian length.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::codec::MAX_FRAME_LEN;
use crate::peer::PeerId;
use crate::protocol::Scope;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Closed,
}

/// One direct connection.
#[derive(Debug)]
pub struct PeerLink {
    pub id: LinkId,
    pub address: Option<SocketAddr>,
    pub state: LinkState,
    pub authenticated: bool,
    pub scope: Scope,
    /// True when this side dialed.
    pub outbound: bool,
    /// Learned from the neighbour's `Alive`.
    pub remote_id: Option<PeerId>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id,
            address: self.address,
            state: self.state,
            outbound: self.outbound,
            remote_id: self.remote_id,
        }
    }

    fn write(&self, frame: &Bytes) {
        if self.state != LinkState::Connected {
            return;
        }
        if let Some(writer) = &self.writer {
            if writer.send(frame.clone()).is_err() {
                tracing::debug!(link = self.id, "write to a link that is shutting down");
            }
        }
    }
}

/// Read-only view of a link handed out of the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: LinkId,
    pub address: Option<SocketAddr>,
    pub state: LinkState,
    pub outbound: bool,
    pub remote_id: Option<PeerId>,
}

/// Raised by the I/O tasks and consumed by the event loop.
#[derive(Debug)]
pub enum LinkEvent {
    Connected {
        id: LinkId,
        address: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
    },
    Accepted {
        id: LinkId,
        address: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
    },
    Data {
        id: LinkId,
        frame: Bytes,
    },
    Closed {
        id: LinkId,
        reason: String,
    },
}

/// The "client changed" notification: a link entered a new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChange {
    pub id: LinkId,
    pub address: Option<SocketAddr>,
    pub state: LinkState,
    pub outbound: bool,
}

pub struct DirectLinks {
    links: HashMap<LinkId, PeerLink>,
    events: mpsc::UnboundedSender<LinkEvent>,
    next_id: Arc<AtomicU64>,
    listener: Option<JoinHandle<()>>,
}

impl DirectLinks {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            links: HashMap::new(),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            listener: None,
        }
    }

    /// Starts accepting connections on `port` (0 picks a free port).
    pub async fn listen(&mut self, port: u16) -> io::Result<SocketAddr> {
        self.stop_listening();

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("direct links listening on {}", local_addr);

        let events = self.events.clone();
        let next_id = self.next_id.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, address)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let (writer, outbound) = mpsc::unbounded_channel();
                        if events
                            .send(LinkEvent::Accepted { id, address, writer })
                            .is_err()
                        {
                            break;
                        }
                        tokio::spawn(drive_link(id, stream, outbound, events.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));

        Ok(local_addr)
    }

    pub fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            tracing::info!("stopped listening for direct links");
        }
    }

    /// Starts dialing `host:port`. The link stays `Connecting` until the
    /// connect task reports back.
    pub fn connect(&mut self, host: &str, port: u16) -> LinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let target = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        tracing::info!(link = id, "connecting to {}", target);

        let task = tokio::spawn(async move {
            let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let _ = events.send(LinkEvent::Closed {
                        id,
                        reason: format!("connect to {} failed: {}", target, e),
                    });
                    return;
                }
                Err(_) => {
                    let _ = events.send(LinkEvent::Closed {
                        id,
                        reason: format!("connect to {} timed out", target),
                    });
                    return;
                }
            };

            let address = match stream.peer_addr() {
                Ok(address) => address,
                Err(e) => {
                    let _ = events.send(LinkEvent::Closed {
                        id,
                        reason: format!("connected socket has no peer address: {}", e),
                    });
                    return;
                }
            };

            let (writer, outbound) = mpsc::unbounded_channel();
            if events
                .send(LinkEvent::Connected { id, address, writer })
                .is_err()
            {
                return;
            }
            drive_link(id, stream, outbound, events).await;
        });

        self.links.insert(
            id,
            PeerLink {
                id,
                address: None,
                state: LinkState::Connecting,
                authenticated: true,
                scope: Scope::Direct,
                outbound: true,
                remote_id: None,
                writer: None,
                task: Some(task),
            },
        );
        id
    }

    /// Inserts a link whose frames go to `writer`. Used for accepted sockets
    /// and by tests that stand in for a socket.
    pub fn attach(
        &mut self,
        address: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
    ) -> LinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert_connected(id, address, writer, false);
        id
    }

    fn insert_connected(
        &mut self,
        id: LinkId,
        address: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
        outbound: bool,
    ) {
        self.links.insert(
            id,
            PeerLink {
                id,
                address: Some(address),
                state: LinkState::Connected,
                authenticated: true,
                scope: Scope::Direct,
                outbound,
                remote_id: None,
                writer: Some(writer),
                task: None,
            },
        );
    }

    /// Applies a state event from an I/O task. Returns the resulting change,
    /// if any, so the caller can fire "client changed".
    pub fn on_state_event(&mut self, event: LinkEvent) -> Option<LinkChange> {
        match event {
            LinkEvent::Connected { id, address, writer } => {
                // Closed locally while the connect was in flight
                let link = self.links.get_mut(&id)?;
                link.address = Some(address);
                link.state = LinkState::Connected;
                link.writer = Some(writer);
                tracing::info!(link = id, "connected to {}", address);
                Some(change_of(link))
            }
            LinkEvent::Accepted { id, address, writer } => {
                tracing::info!(link = id, "accepted link from {}", address);
                self.insert_connected(id, address, writer, false);
                self.links.get(&id).map(change_of)
            }
            LinkEvent::Closed { id, reason } => {
                let mut link = self.links.remove(&id)?;
                tracing::warn!(link = id, "link closed: {}", reason);
                link.state = LinkState::Closed;
                Some(change_of(&link))
            }
            LinkEvent::Data { .. } => None,
        }
    }

    /// Closes a link from this side.
    pub fn close(&mut self, id: LinkId) -> Option<LinkChange> {
        let mut link = self.links.remove(&id)?;
        if let Some(task) = link.task.take() {
            if link.state == LinkState::Connecting {
                task.abort();
            }
        }
        // Dropping the writer ends the link task
        link.writer = None;
        link.state = LinkState::Closed;
        tracing::info!(link = id, "closed link");
        Some(change_of(&link))
    }

    pub fn close_all(&mut self) -> Vec<LinkChange> {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    pub fn send_message(&self, frame: &Bytes) {
        for link in self.links.values() {
            link.write(frame);
        }
    }

    pub fn send_message_to(&self, frame: &Bytes, target: LinkId) {
        if let Some(link) = self.links.get(&target) {
            link.write(frame);
        }
    }

    pub fn send_message_except(&self, frame: &Bytes, excluded: LinkId) {
        for link in self.links.values().filter(|l| l.id != excluded) {
            link.write(frame);
        }
    }

    pub fn get(&self, id: LinkId) -> Option<&PeerLink> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut PeerLink> {
        self.links.get_mut(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn is_linked_to(&self, peer: PeerId) -> bool {
        self.links.values().any(|l| l.remote_id == Some(peer))
    }
}

impl Drop for DirectLinks {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

fn change_of(link: &PeerLink) -> LinkChange {
    LinkChange {
        id: link.id,
        address: link.address,
        state: link.state,
        outbound: link.outbound,
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Pumps frames both ways until either side hangs up.
async fn drive_link(
    id: LinkId,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, frame_codec());

    let reason = loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    if events.send(LinkEvent::Data { id, frame: frame.freeze() }).is_err() {
                        break "event loop gone".to_string();
                    }
                }
                Some(Err(e)) => break format!("read error: {}", e),
                None => break "peer disconnected".to_string(),
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        break format!("write error: {}", e);
                    }
                }
                None => break "closed locally".to_string(),
            },
        }
    };

    let _ = events.send(LinkEvent::Closed { id, reason });
}
