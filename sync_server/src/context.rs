//! Per-server state carried through every tick phase.
//!
//! Everything the core touches lives here and is owned by the tick thread.
//! Tests build a fresh context per case.

use sync_shared::{
    config::ServerConfig,
    ecs::{EntityId, EntityKind, EntityStore, HumanSync, PeerBinding, PeerId, SpawnProfile, Streamer, Transform},
    math::Vec3,
    protocol::{HumanDespawn, Payload},
};
use tracing::{debug, info};

use crate::{mutation::Mutation, outbox::Outbox, peers::PeerTable, world::WorldState};

pub struct ServerContext {
    pub cfg: ServerConfig,
    pub tick: u64,
    pub store: EntityStore,
    pub world: WorldState,
    pub peers: PeerTable,
    pub outbox: Outbox,
    /// Effects recorded during Dispatch, committed in Apply.
    pub mutations: Vec<Mutation>,
}

impl ServerContext {
    pub fn new(cfg: ServerConfig) -> Self {
        let peers = PeerTable::new(cfg.max_faults, cfg.fault_window_ticks);
        Self {
            cfg,
            tick: 0,
            store: EntityStore::default(),
            world: WorldState::default(),
            peers,
            outbox: Outbox::default(),
            mutations: Vec::new(),
        }
    }

    /// Queues a payload for one peer. Sends to peers that are gone are dropped.
    pub fn send_to<P: Payload>(&mut self, peer: PeerId, payload: &P) {
        if !self.peers.is_connected(peer) {
            debug!(peer = %peer, kind = P::KIND.name(), "send to disconnected peer dropped");
            return;
        }
        self.outbox.push(peer, P::KIND, payload.encode());
    }

    /// Queues a payload for every connected peer.
    pub fn broadcast<P: Payload>(&mut self, payload: &P) {
        let frame = payload.encode();
        for peer in self.peers.ids() {
            self.outbox.push(peer, P::KIND, frame.clone());
        }
    }

    /// Queues a payload for every current observer of `entity`.
    pub fn broadcast_to_observers<P: Payload>(&mut self, entity: EntityId, payload: &P) {
        let Some(streamer) = self.store.try_get::<Streamer>(entity) else {
            debug!(entity = %entity, kind = P::KIND.name(), "broadcast to entity without streamer");
            return;
        };
        let observers: Vec<PeerId> = streamer.observers.iter().copied().collect();
        let frame = payload.encode();
        for peer in observers {
            if self.peers.is_connected(peer) {
                self.outbox.push(peer, P::KIND, frame.clone());
            }
        }
    }

    pub fn queue(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Creates the player entity bound to `peer`.
    ///
    /// Observers start empty; the owner is added by the next Stream phase.
    pub fn spawn_player(&mut self, peer: PeerId) -> EntityId {
        let entity = self.store.create();
        self.store.set(entity, EntityKind::Player);
        self.store.set(entity, Transform::at(Vec3::ZERO));
        self.store.set(entity, HumanSync::default());
        self.store.set(entity, SpawnProfile(0));
        self.store
            .set(entity, Streamer::new(peer, self.cfg.default_relevance_radius));
        self.store.set(entity, PeerBinding { peer, entity });
        info!(peer = %peer, entity = %entity, "player entity created");
        entity
    }

    /// Brings a reserved id to life as a server-owned human.
    pub fn spawn_scripted(&mut self, entity: EntityId, profile: u64, position: Vec3) -> bool {
        if !self.store.create_reserved(entity) {
            debug!(entity = %entity, "scripted spawn of unreserved or live id ignored");
            return false;
        }
        self.store.set(entity, EntityKind::Scripted);
        self.store.set(entity, Transform::at(position));
        self.store.set(entity, HumanSync::default());
        self.store.set(entity, SpawnProfile(profile));
        self.store.set(
            entity,
            Streamer::new(PeerId::SERVER, self.cfg.default_relevance_radius),
        );
        debug!(entity = %entity, profile, "scripted entity created");
        true
    }

    /// Tells every observer the entity is gone, then removes it from the store.
    pub fn despawn_entity(&mut self, entity: EntityId) {
        if !self.store.contains(entity) {
            debug!(entity = %entity, "despawn of unknown entity ignored");
            return;
        }
        self.outbox.cancel_sync(entity);
        self.broadcast_to_observers(entity, &HumanDespawn { entity });
        self.store.destroy(entity);
        debug!(entity = %entity, "entity destroyed");
    }

    /// Owner of an entity, if it has a streamer.
    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.store.try_get::<Streamer>(entity).map(|s| s.guid)
    }

    /// Entities currently owned by `peer`, in id order.
    pub fn owned_by(&self, peer: PeerId) -> Vec<EntityId> {
        self.store
            .query::<Streamer>()
            .filter(|(_, s)| s.guid == peer)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::protocol::{ChatMessage, MessageKind};

    fn ctx_with_peers(n: usize) -> (ServerContext, Vec<PeerId>) {
        let mut ctx = ServerContext::new(ServerConfig::default());
        let peers: Vec<PeerId> = (1..=n as u64).map(PeerId).collect();
        for &p in &peers {
            ctx.peers.insert(p, 0);
        }
        (ctx, peers)
    }

    #[test]
    fn send_to_gone_peer_is_dropped() {
        let (mut ctx, peers) = ctx_with_peers(1);
        ctx.send_to(PeerId(99), &ChatMessage::new("x"));
        ctx.send_to(peers[0], &ChatMessage::new("x"));
        assert_eq!(ctx.outbox.pending(PeerId(99)), 0);
        assert_eq!(ctx.outbox.pending(peers[0]), 1);
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let (mut ctx, peers) = ctx_with_peers(3);
        ctx.broadcast(&ChatMessage::new("all"));
        for p in peers {
            assert_eq!(ctx.outbox.pending(p), 1);
        }
    }

    #[test]
    fn player_entity_is_bound_and_owned() {
        let (mut ctx, peers) = ctx_with_peers(1);
        let e = ctx.spawn_player(peers[0]);
        assert_eq!(ctx.store.lookup_by_peer(peers[0]), Some(e));
        assert_eq!(ctx.owner_of(e), Some(peers[0]));
        assert_eq!(*ctx.store.get::<EntityKind>(e), EntityKind::Player);
        assert_eq!(ctx.owned_by(peers[0]), vec![e]);
    }

    #[test]
    fn despawn_notifies_observers_first() {
        let (mut ctx, peers) = ctx_with_peers(2);
        let e = ctx.spawn_player(peers[0]);
        if let Some(s) = ctx.store.get_mut::<Streamer>(e) {
            s.observers.extend([peers[0], peers[1]]);
        }
        ctx.despawn_entity(e);
        assert!(!ctx.store.contains(e));
        assert_eq!(ctx.store.lookup_by_peer(peers[0]), None);
        for (_, frames) in ctx.outbox.take() {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind, MessageKind::HumanDespawn);
        }
    }

    #[test]
    fn scripted_spawn_needs_a_reserved_id() {
        let (mut ctx, _) = ctx_with_peers(0);
        let id = ctx.store.reserve();
        assert!(ctx.spawn_scripted(id, 7, Vec3::new(1.0, 2.0, 3.0)));
        assert!(!ctx.spawn_scripted(id, 7, Vec3::ZERO));
        assert_eq!(ctx.owner_of(id), Some(PeerId::SERVER));
        assert_eq!(ctx.store.get::<SpawnProfile>(id).0, 7);
    }
}
