//! Per-peer send queue shared by the transports.
//!
//! Frames leave in the order they were pushed. A sync frame carries the entity
//! it describes; pushing a newer one for an entity that still has a sync
//! pending removes the old frame and appends the new one at the back, so a
//! peer that reads slowly holds at most one sync per entity. Only reliable
//! frames count against the capacity.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use sync_shared::{ecs::EntityId, protocol::ChannelClass};

/// A frame the server handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub channel: ChannelClass,
    pub frame: Bytes,
}

#[derive(Debug)]
struct Slot {
    delivered: Delivered,
    sync: Option<EntityId>,
}

/// Returned by [`SendQueue::push`] when the reliable budget is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

#[derive(Debug)]
pub struct SendQueue {
    slots: BTreeMap<u64, Slot>,
    sync_slots: HashMap<EntityId, u64>,
    next_seq: u64,
    reliable: usize,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            sync_slots: HashMap::new(),
            next_seq: 0,
            reliable: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn push(
        &mut self,
        channel: ChannelClass,
        frame: Bytes,
        sync: Option<EntityId>,
    ) -> Result<(), QueueFull> {
        match sync {
            Some(entity) => {
                if let Some(stale) = self.sync_slots.remove(&entity) {
                    self.slots.remove(&stale);
                }
                self.sync_slots.insert(entity, self.next_seq);
            }
            None => {
                if self.reliable >= self.capacity {
                    return Err(QueueFull);
                }
                self.reliable += 1;
            }
        }
        self.slots.insert(
            self.next_seq,
            Slot {
                delivered: Delivered { channel, frame },
                sync,
            },
        );
        self.next_seq += 1;
        Ok(())
    }

    /// Oldest pending frame.
    pub fn pop(&mut self) -> Option<Delivered> {
        let (_, slot) = self.slots.pop_first()?;
        match slot.sync {
            Some(entity) => {
                self.sync_slots.remove(&entity);
            }
            None => self.reliable -= 1,
        }
        Some(slot.delivered)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Delivered> {
        std::iter::from_fn(|| self.pop()).collect()
    }
}
