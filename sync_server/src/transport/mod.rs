//! Transport seam.
//!
//! The core never touches sockets. It pulls [`TransportEvent`]s during the
//! Drain phase and pushes frames during Flush. Implementations do their I/O on
//! other threads and meet the tick thread through bounded queues.

mod loopback;
mod queue;
mod tcp;

pub use loopback::{loopback, LoopbackHub, LoopbackTransport};
pub use queue::{Delivered, QueueFull, SendQueue};
pub use tcp::TcpTransport;

use bytes::Bytes;
use sync_shared::{
    ecs::{EntityId, PeerId},
    protocol::ChannelClass,
};
use thiserror::Error;

/// Something the transport observed since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Frame(PeerId, Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("send queue for peer {0} is full")]
    QueueFull(PeerId),
    #[error("connection to peer {0} is closed")]
    Closed(PeerId),
}

pub trait Transport: Send {
    /// Next pending event, without blocking. Events for one peer come out in
    /// the order the transport received them.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Queues a frame for a peer, without blocking. A frame with a `sync`
    /// entity replaces whatever sync for that entity is still pending.
    fn send(
        &mut self,
        peer: PeerId,
        channel: ChannelClass,
        frame: Bytes,
        sync: Option<EntityId>,
    ) -> Result<(), TransportError>;

    /// Closes a peer's connection. No `Disconnected` event follows for it.
    fn disconnect(&mut self, peer: PeerId);
}
