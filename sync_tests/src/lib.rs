//! Shared helpers for the cross-crate integration tests.
//!
//! [`Harness`] drives a [`GameServer`] over the in-memory transport so
//! scenarios can control exactly which frames arrive on which tick.

use sync_server::{
    server::GameServer,
    transport::{loopback, LoopbackHub},
};
use sync_shared::{
    config::ServerConfig,
    ecs::{EntityId, PeerId, Streamer, Transform},
    math::Vec3,
    protocol::{Message, Payload},
};

/// Routes test logging through the libtest capture.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A server plus the peer side of its loopback transport.
pub struct Harness {
    pub server: GameServer,
    pub hub: LoopbackHub,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(cfg: ServerConfig) -> anyhow::Result<Self> {
        init_tracing();
        let (transport, hub) = loopback(cfg.inbound_capacity);
        let server = GameServer::new(cfg, Box::new(transport))?;
        Ok(Self { server, hub })
    }

    pub fn step(&mut self) -> anyhow::Result<()> {
        self.server.step()?;
        Ok(())
    }

    pub fn steps(&mut self, n: u32) -> anyhow::Result<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Connects a peer and runs one tick so its entity exists.
    pub fn join(&mut self) -> anyhow::Result<(PeerId, EntityId)> {
        let peer = self.hub.connect()?;
        self.step()?;
        let entity = self
            .entity_of(peer)
            .ok_or_else(|| anyhow::anyhow!("no entity bound to {peer}"))?;
        Ok((peer, entity))
    }

    pub fn entity_of(&self, peer: PeerId) -> Option<EntityId> {
        self.server.context().store.lookup_by_peer(peer)
    }

    pub fn send<P: Payload>(&self, peer: PeerId, payload: &P) -> anyhow::Result<()> {
        self.hub.send(peer, payload)
    }

    pub fn messages(&self, peer: PeerId) -> Vec<Message> {
        self.hub.take_messages(peer)
    }

    pub fn observers(&self, entity: EntityId) -> Vec<PeerId> {
        self.server
            .context()
            .store
            .try_get::<Streamer>(entity)
            .map(|s| s.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn position(&self, entity: EntityId) -> Option<Vec3> {
        self.server
            .context()
            .store
            .try_get::<Transform>(entity)
            .map(|t| t.position)
    }

    /// Moves an entity directly, bypassing input.
    pub fn place(&mut self, entity: EntityId, position: Vec3) {
        if let Some(t) = self.server.context_mut().store.get_mut::<Transform>(entity) {
            t.position = position;
        }
    }

    pub fn set_radius(&mut self, entity: EntityId, radius: f32) {
        if let Some(s) = self.server.context_mut().store.get_mut::<Streamer>(entity) {
            s.relevance_radius = radius;
        }
    }
}
