//! Outbound frame queue.
//!
//! Frames accumulate per peer during a tick and are handed to the transport
//! in the Flush phase, in the order they were queued. Sync frames are keyed
//! by entity: a newer `HumanUpdate` for the same `(entity, peer)` replaces the
//! pending one in place instead of queueing a second.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use sync_shared::{
    ecs::{EntityId, PeerId},
    protocol::{ChannelClass, MessageKind},
};

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub kind: MessageKind,
    pub channel: ChannelClass,
    pub frame: Bytes,
    /// Entity a sync frame describes; the transport keeps only the newest.
    pub sync: Option<EntityId>,
}

#[derive(Debug, Default)]
struct PeerQueue {
    frames: Vec<Option<OutboundFrame>>,
    sync_slots: HashMap<EntityId, usize>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    queues: BTreeMap<PeerId, PeerQueue>,
}

impl Outbox {
    pub fn push(&mut self, peer: PeerId, kind: MessageKind, frame: Bytes) {
        self.queues.entry(peer).or_default().frames.push(Some(OutboundFrame {
            kind,
            channel: kind.channel(),
            frame,
            sync: None,
        }));
    }

    /// Queues a per-tick sync frame, replacing a pending one for the same entity.
    pub fn push_sync(&mut self, peer: PeerId, entity: EntityId, kind: MessageKind, frame: Bytes) {
        let queue = self.queues.entry(peer).or_default();
        let out = OutboundFrame {
            kind,
            channel: kind.channel(),
            frame,
            sync: Some(entity),
        };
        match queue.sync_slots.get(&entity) {
            Some(&slot) => queue.frames[slot] = Some(out),
            None => {
                queue.sync_slots.insert(entity, queue.frames.len());
                queue.frames.push(Some(out));
            }
        }
    }

    /// Drops pending sync frames for an entity that is going away.
    pub fn cancel_sync(&mut self, entity: EntityId) {
        for queue in self.queues.values_mut() {
            if let Some(slot) = queue.sync_slots.remove(&entity) {
                queue.frames[slot] = None;
            }
        }
    }

    /// Forgets everything queued for a peer. Returns how many frames were dropped.
    pub fn drop_peer(&mut self, peer: PeerId) -> usize {
        self.queues
            .remove(&peer)
            .map(|q| q.frames.iter().flatten().count())
            .unwrap_or(0)
    }

    pub fn pending(&self, peer: PeerId) -> usize {
        self.queues
            .get(&peer)
            .map(|q| q.frames.iter().flatten().count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.frames.iter().all(Option::is_none))
    }

    /// Takes every queued frame, grouped by peer in id order.
    pub fn take(&mut self) -> Vec<(PeerId, Vec<OutboundFrame>)> {
        std::mem::take(&mut self.queues)
            .into_iter()
            .map(|(peer, q)| (peer, q.frames.into_iter().flatten().collect()))
            .collect()
    }
}
