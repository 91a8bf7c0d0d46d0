//! In-process transport.
//!
//! [`LoopbackHub`] plays the part of the remote clients: it connects peers,
//! feeds frames in and collects whatever the server sent. Used by tests and
//! by anything embedding the server without sockets.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::anyhow;
use bytes::Bytes;
use sync_shared::{
    ecs::{EntityId, PeerId},
    protocol::{ChannelClass, Message, Payload},
};
use tokio::sync::mpsc;
use tracing::warn;

use super::{Delivered, SendQueue, Transport, TransportError, TransportEvent};

#[derive(Debug, Default)]
struct LoopbackState {
    connected: HashSet<PeerId>,
    failing: HashSet<PeerId>,
    delivered: HashMap<PeerId, SendQueue>,
    closed_by_server: Vec<PeerId>,
}

fn lock(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Server side of the loopback pair.
pub struct LoopbackTransport {
    events: mpsc::Receiver<TransportEvent>,
    state: Arc<Mutex<LoopbackState>>,
}

/// Client side of the loopback pair.
#[derive(Clone)]
pub struct LoopbackHub {
    events: mpsc::Sender<TransportEvent>,
    state: Arc<Mutex<LoopbackState>>,
}

/// Creates a connected transport/hub pair with a bounded event queue.
pub fn loopback(capacity: usize) -> (LoopbackTransport, LoopbackHub) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let state = Arc::new(Mutex::new(LoopbackState::default()));
    (
        LoopbackTransport {
            events: rx,
            state: state.clone(),
        },
        LoopbackHub { events: tx, state },
    )
}

impl Transport for LoopbackTransport {
    fn poll(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelClass,
        frame: Bytes,
        sync: Option<EntityId>,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.connected.contains(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        if state.failing.contains(&peer) {
            return Err(TransportError::Closed(peer));
        }
        state
            .delivered
            .entry(peer)
            .or_insert_with(|| SendQueue::new(usize::MAX))
            .push(channel, frame, sync)
            .map_err(|_| TransportError::QueueFull(peer))
    }

    fn disconnect(&mut self, peer: PeerId) {
        let mut state = lock(&self.state);
        if state.connected.remove(&peer) {
            state.closed_by_server.push(peer);
        }
    }
}

impl LoopbackHub {
    fn push(&self, event: TransportEvent) -> anyhow::Result<()> {
        self.events
            .try_send(event)
            .map_err(|e| anyhow!("loopback queue rejected event: {e}"))
    }

    /// Connects a new peer.
    pub fn connect(&self) -> anyhow::Result<PeerId> {
        let peer = PeerId::new_unique();
        lock(&self.state).connected.insert(peer);
        self.push(TransportEvent::Connected(peer))?;
        Ok(peer)
    }

    /// Drops a peer as if its connection went away.
    pub fn disconnect(&self, peer: PeerId) -> anyhow::Result<()> {
        lock(&self.state).connected.remove(&peer);
        self.push(TransportEvent::Disconnected(peer))
    }

    pub fn send_frame(&self, peer: PeerId, frame: Bytes) -> anyhow::Result<()> {
        self.push(TransportEvent::Frame(peer, frame))
    }

    pub fn send<P: Payload>(&self, peer: PeerId, payload: &P) -> anyhow::Result<()> {
        self.send_frame(peer, payload.encode())
    }

    /// Makes every later send to `peer` fail.
    pub fn fail_sends(&self, peer: PeerId) {
        lock(&self.state).failing.insert(peer);
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        lock(&self.state).connected.contains(&peer)
    }

    /// Peers the server closed on its own initiative.
    pub fn closed_by_server(&self) -> Vec<PeerId> {
        lock(&self.state).closed_by_server.clone()
    }

    /// Takes the raw frames delivered to `peer` so far.
    pub fn take_delivered(&self, peer: PeerId) -> Vec<Delivered> {
        lock(&self.state)
            .delivered
            .remove(&peer)
            .map(|mut q| q.drain())
            .unwrap_or_default()
    }

    /// Takes and decodes the frames delivered to `peer`. Undecodable frames
    /// are logged and skipped.
    pub fn take_messages(&self, peer: PeerId) -> Vec<Message> {
        self.take_delivered(peer)
            .into_iter()
            .filter_map(|d| match Message::decode(&d.frame) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "server sent an undecodable frame");
                    None
                }
            })
            .collect()
    }

    /// Clears everything delivered so far to every peer.
    pub fn clear(&self) {
        lock(&self.state).delivered.clear();
    }
}
