//! Entity/component store.
//!
//! A small ECS used by the authoritative server. It is not archetype-based;
//! each component type gets its own ordered storage keyed by entity id, which
//! keeps iteration order stable across runs.
//!
//! Ids come from a monotonic counter and are never reused within a session.
//! `0` is reserved for "no entity".
//!
//! Queries borrow the store immutably, so mutating while iterating does not
//! compile. Callers collect what they need first and mutate afterwards.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::math::{Quat, Vec3};

/// Opaque entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const NONE: Self = EntityId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a connected peer. Opaque 64-bit GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The server itself; owner of script-spawned entities.
    pub const SERVER: Self = PeerId(0);

    /// Allocates a process-unique peer id.
    pub fn new_unique() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Secondary indices maintained by component hooks.
#[derive(Debug, Default)]
pub struct StoreIndex {
    by_peer: HashMap<PeerId, EntityId>,
}

/// Marker for types that can be attached to entities.
///
/// The hooks let a component keep [`StoreIndex`] in sync; most components
/// leave them empty.
pub trait Component: 'static + Send + Sync + Sized {
    fn on_attach(&self, _entity: EntityId, _index: &mut StoreIndex) {}
    fn on_detach(&self, _entity: EntityId, _index: &mut StoreIndex) {}
}

trait Storage: Send + Sync {
    fn remove(&mut self, entity: EntityId, index: &mut StoreIndex) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<C: Component> Storage for BTreeMap<EntityId, C> {
    fn remove(&mut self, entity: EntityId, index: &mut StoreIndex) -> bool {
        match BTreeMap::remove(self, &entity) {
            Some(old) => {
                old.on_detach(entity, index);
                true
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Owns every entity and component in a world.
pub struct EntityStore {
    next_id: u64,
    alive: BTreeSet<EntityId>,
    storages: HashMap<TypeId, Box<dyn Storage>>,
    index: StoreIndex,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self {
            next_id: 1,
            alive: BTreeSet::new(),
            storages: HashMap::new(),
            index: StoreIndex::default(),
        }
    }
}

impl EntityStore {
    /// Creates a new entity with no components.
    pub fn create(&mut self) -> EntityId {
        let id = self.reserve();
        self.alive.insert(id);
        id
    }

    /// Allocates an id without bringing the entity to life yet.
    ///
    /// Used when the id must be known before the apply phase commits it.
    pub fn reserve(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Brings a previously reserved id to life. Returns false for ids that
    /// were never reserved or are already alive.
    pub fn create_reserved(&mut self, id: EntityId) -> bool {
        if id.is_none() || id.0 >= self.next_id || self.alive.contains(&id) {
            return false;
        }
        self.alive.insert(id)
    }

    /// Removes an entity and all of its components. Unknown ids are a no-op.
    pub fn destroy(&mut self, id: EntityId) {
        if !self.alive.remove(&id) {
            debug!(entity = %id, "destroy of unknown entity ignored");
            return;
        }
        for storage in self.storages.values_mut() {
            storage.remove(id, &mut self.index);
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.alive.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Live entity ids in ascending order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive.iter().copied()
    }

    fn storage<C: Component>(&self) -> Option<&BTreeMap<EntityId, C>> {
        self.storages
            .get(&TypeId::of::<C>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<BTreeMap<EntityId, C>>())
    }

    fn storage_mut<C: Component>(&mut self) -> Option<&mut BTreeMap<EntityId, C>> {
        self.storages
            .get_mut(&TypeId::of::<C>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<BTreeMap<EntityId, C>>())
    }

    /// Inserts or replaces a component. Returns false if the entity is not alive.
    pub fn set<C: Component>(&mut self, entity: EntityId, component: C) -> bool {
        if !self.alive.contains(&entity) {
            debug!(entity = %entity, component = std::any::type_name::<C>(), "set on unknown entity ignored");
            return false;
        }
        let storage = self
            .storages
            .entry(TypeId::of::<C>())
            .or_insert_with(|| Box::new(BTreeMap::<EntityId, C>::new()));
        let Some(storage) = storage.as_any_mut().downcast_mut::<BTreeMap<EntityId, C>>() else {
            return false;
        };
        component.on_attach(entity, &mut self.index);
        if let Some(old) = storage.insert(entity, component) {
            old.on_detach(entity, &mut self.index);
            // Re-attach the new value in case detach cleared a shared index key.
            if let Some(new) = storage.get(&entity) {
                new.on_attach(entity, &mut self.index);
            }
        }
        true
    }

    /// Gets a component reference.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not carry `C`; asking for a component that is
    /// not there is a logic error. Use [`EntityStore::try_get`] when absence is expected.
    pub fn get<C: Component>(&self, entity: EntityId) -> &C {
        match self.try_get::<C>(entity) {
            Some(c) => c,
            None => panic!(
                "entity {entity} has no {} component",
                std::any::type_name::<C>()
            ),
        }
    }

    pub fn try_get<C: Component>(&self, entity: EntityId) -> Option<&C> {
        self.storage::<C>().and_then(|s| s.get(&entity))
    }

    pub fn get_mut<C: Component>(&mut self, entity: EntityId) -> Option<&mut C> {
        self.storage_mut::<C>().and_then(|s| s.get_mut(&entity))
    }

    pub fn has<C: Component>(&self, entity: EntityId) -> bool {
        self.try_get::<C>(entity).is_some()
    }

    /// Detaches a component, returning it.
    pub fn remove<C: Component>(&mut self, entity: EntityId) -> Option<C> {
        let removed = self.storage_mut::<C>().and_then(|s| s.remove(&entity))?;
        removed.on_detach(entity, &mut self.index);
        Some(removed)
    }

    /// Iterates entities with `C`, in id order.
    pub fn query<C: Component>(&self) -> impl Iterator<Item = (EntityId, &C)> {
        self.storage::<C>()
            .into_iter()
            .flat_map(|storage| storage.iter().map(|(k, v)| (*k, v)))
    }

    /// Iterates entities carrying both `A` and `B`.
    pub fn query2<A: Component, B: Component>(&self) -> impl Iterator<Item = (EntityId, &A, &B)> {
        let b = self.storage::<B>();
        self.query::<A>()
            .filter_map(move |(id, a)| b.and_then(|s| s.get(&id)).map(|b| (id, a, b)))
    }

    /// Iterates entities carrying `A`, `B` and `C`.
    pub fn query3<A: Component, B: Component, C: Component>(
        &self,
    ) -> impl Iterator<Item = (EntityId, &A, &B, &C)> {
        let c = self.storage::<C>();
        self.query2::<A, B>()
            .filter_map(move |(id, a, b)| c.and_then(|s| s.get(&id)).map(|c| (id, a, b, c)))
    }

    /// Mutable iteration over one component type.
    ///
    /// Components with index hooks must not be rewritten through this; use
    /// [`EntityStore::set`] for those.
    pub fn query_mut<C: Component>(&mut self) -> impl Iterator<Item = (EntityId, &mut C)> {
        self.storage_mut::<C>()
            .into_iter()
            .flat_map(|storage| storage.iter_mut().map(|(k, v)| (*k, v)))
    }

    /// Snapshot of the ids carrying `C`.
    pub fn ids_with<C: Component>(&self) -> Vec<EntityId> {
        self.query::<C>().map(|(id, _)| id).collect()
    }

    /// The entity bound to `peer` through [`PeerBinding`].
    pub fn lookup_by_peer(&self, peer: PeerId) -> Option<EntityId> {
        self.index.by_peer.get(&peer).copied()
    }
}

/// Role tag of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    /// Bound one-to-one to a connected peer.
    Player,
    /// Spawned by a script; owned by the server.
    Scripted,
}

impl Component for EntityKind {}

/// Ownership and visibility of a replicated entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Streamer {
    /// The owning peer, or [`PeerId::SERVER`].
    pub guid: PeerId,
    /// Peers currently receiving updates for this entity.
    pub observers: BTreeSet<PeerId>,
    pub relevance_radius: f32,
    /// Relevant to every connected peer regardless of distance.
    pub global: bool,
}

impl Streamer {
    pub fn new(guid: PeerId, relevance_radius: f32) -> Self {
        Self {
            guid,
            observers: BTreeSet::new(),
            relevance_radius,
            global: false,
        }
    }
}

impl Component for Streamer {}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

impl Component for Transform {}

/// Per-tick gameplay state replicated alongside the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanSync {
    /// Client tick of the newest applied input.
    pub tick: u32,
    pub input_bits: u32,
}

impl Component for HumanSync {}

/// Appearance profile sent with `HumanSpawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpawnProfile(pub u64);

impl Component for SpawnProfile {}

/// Inverse index from a peer to the entity it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBinding {
    pub peer: PeerId,
    pub entity: EntityId,
}

impl Component for PeerBinding {
    fn on_attach(&self, entity: EntityId, index: &mut StoreIndex) {
        index.by_peer.insert(self.peer, entity);
    }

    fn on_detach(&self, entity: EntityId, index: &mut StoreIndex) {
        if index.by_peer.get(&self.peer) == Some(&entity) {
            index.by_peer.remove(&self.peer);
        }
    }
}
