//! TCP transport.
//!
//! One accept task plus a reader and a writer task per connection, all on the
//! tokio runtime. They meet the tick thread through a bounded event queue
//! (inbound) and a [`SendQueue`] per peer (outbound) that the writer task
//! drains. Both channel classes ride the same ordered stream.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Context;
use bytes::Bytes;
use sync_shared::{
    ecs::{EntityId, PeerId},
    net::{FrameWriter, FramedConn},
    protocol::ChannelClass,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{SendQueue, Transport, TransportError, TransportEvent};

enum NetEvent {
    Accepted {
        peer: PeerId,
        addr: SocketAddr,
        lane: Arc<WriteLane>,
        close: oneshot::Sender<()>,
    },
    Frame(PeerId, Bytes),
    Closed(PeerId),
}

struct Outgoing {
    queue: SendQueue,
    closed: bool,
}

/// Outbound frames for one connection, shared with its writer task.
struct WriteLane {
    out: Mutex<Outgoing>,
    ready: Notify,
}

enum Next {
    Frame(Bytes),
    Idle,
    Closed,
}

impl WriteLane {
    fn new(capacity: usize) -> Self {
        Self {
            out: Mutex::new(Outgoing {
                queue: SendQueue::new(capacity),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outgoing> {
        self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(
        &self,
        peer: PeerId,
        channel: ChannelClass,
        frame: Bytes,
        sync: Option<EntityId>,
    ) -> Result<(), TransportError> {
        {
            let mut out = self.lock();
            if out.closed {
                return Err(TransportError::Closed(peer));
            }
            out.queue
                .push(channel, frame, sync)
                .map_err(|_| TransportError::QueueFull(peer))?;
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Stops accepting frames. The writer still drains what is queued.
    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    fn next(&self) -> Next {
        let mut out = self.lock();
        match out.queue.pop() {
            Some(d) => Next::Frame(d.frame),
            None if out.closed => Next::Closed,
            None => Next::Idle,
        }
    }
}

async fn write_loop(
    peer: PeerId,
    mut writer: FrameWriter,
    lane: Arc<WriteLane>,
    events: mpsc::Sender<NetEvent>,
) {
    loop {
        match lane.next() {
            Next::Frame(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    debug!(peer = %peer, error = %e, "write failed");
                    lane.close();
                    let _ = events.send(NetEvent::Closed(peer)).await;
                    return;
                }
            }
            Next::Idle => lane.ready.notified().await,
            Next::Closed => break,
        }
    }
    let _ = writer.shutdown().await;
}

struct PeerLink {
    addr: SocketAddr,
    lane: Arc<WriteLane>,
    close: Option<oneshot::Sender<()>>,
}

impl PeerLink {
    fn close(mut self) {
        self.lane.close();
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

pub struct TcpTransport {
    events: mpsc::Receiver<NetEvent>,
    peers: HashMap<PeerId, PeerLink>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Binds the listener and starts accepting. Must run inside a tokio runtime.
    pub async fn bind(
        addr: &str,
        inbound_capacity: usize,
        outbound_capacity: usize,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tcp bind {addr}"))?;
        let local_addr = listener.local_addr().context("local_addr")?;
        let (tx, rx) = mpsc::channel(inbound_capacity.max(1));
        let accept_task = tokio::spawn(accept_loop(listener, tx, outbound_capacity.max(1)));
        info!(%local_addr, "tcp transport listening");
        Ok(Self {
            events: rx,
            peers: HashMap::new(),
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|l| l.addr)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        for (_, link) in self.peers.drain() {
            link.close();
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<NetEvent>, outbound_capacity: usize) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }

        let peer = PeerId::new_unique();
        let (mut reader, writer) = FramedConn::new(stream).into_split();
        let lane = Arc::new(WriteLane::new(outbound_capacity));
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        // Announce before the reader starts so Connected precedes any Frame.
        let accepted = NetEvent::Accepted {
            peer,
            addr,
            lane: Arc::clone(&lane),
            close: close_tx,
        };
        if events.send(accepted).await.is_err() {
            break;
        }

        tokio::spawn(write_loop(peer, writer, lane, events.clone()));

        let reader_events = events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    frame = reader.recv() => match frame {
                        Ok(frame) => {
                            if reader_events.send(NetEvent::Frame(peer, frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "read ended");
                            let _ = reader_events.send(NetEvent::Closed(peer)).await;
                            break;
                        }
                    },
                }
            }
        });
    }
}

impl Transport for TcpTransport {
    fn poll(&mut self) -> Option<TransportEvent> {
        loop {
            match self.events.try_recv().ok()? {
                NetEvent::Accepted {
                    peer,
                    addr,
                    lane,
                    close,
                } => {
                    info!(peer = %peer, %addr, "peer connected");
                    self.peers.insert(
                        peer,
                        PeerLink {
                            addr,
                            lane,
                            close: Some(close),
                        },
                    );
                    return Some(TransportEvent::Connected(peer));
                }
                NetEvent::Frame(peer, frame) => {
                    if self.peers.contains_key(&peer) {
                        return Some(TransportEvent::Frame(peer, frame));
                    }
                }
                NetEvent::Closed(peer) => {
                    if let Some(link) = self.peers.remove(&peer) {
                        info!(peer = %peer, addr = %link.addr, "peer disconnected");
                        link.close();
                        return Some(TransportEvent::Disconnected(peer));
                    }
                }
            }
        }
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelClass,
        frame: Bytes,
        sync: Option<EntityId>,
    ) -> Result<(), TransportError> {
        let link = self.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        link.lane.push(peer, channel, frame, sync)
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(link) = self.peers.remove(&peer) {
            info!(peer = %peer, addr = %link.addr, "closing peer");
            link.close();
        }
    }
}
