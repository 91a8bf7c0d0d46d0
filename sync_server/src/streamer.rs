//! Relevance and replication.
//!
//! Once per tick every entity with a [`Streamer`] gets a fresh observer set.
//! The difference against the previous set drives the wire: peers that gained
//! the entity get a spawn, peers that kept it get an update, peers that lost it
//! get a despawn. Frames go out spawns first, then updates, then despawns,
//! each in entity-id order.

use std::collections::{BTreeMap, BTreeSet};

use sync_shared::{
    ecs::{EntityId, EntityKind, EntityStore, HumanSync, PeerBinding, PeerId, SpawnProfile, Streamer, Transform},
    math::Vec3,
    protocol::{HumanDespawn, HumanSpawn, HumanUpdate, Payload},
};
use tracing::trace;

use crate::context::ServerContext;

struct Plan {
    entity: EntityId,
    old: BTreeSet<PeerId>,
    new: BTreeSet<PeerId>,
}

/// Where each connected peer looks from: the position of its bound entity.
fn viewpoints(ctx: &ServerContext) -> BTreeMap<PeerId, Option<Vec3>> {
    ctx.peers
        .ids()
        .into_iter()
        .map(|peer| {
            let at = ctx
                .store
                .lookup_by_peer(peer)
                .and_then(|e| ctx.store.try_get::<Transform>(e))
                .map(|t| t.position);
            (peer, at)
        })
        .collect()
}

fn plan(ctx: &ServerContext) -> Vec<Plan> {
    let views = viewpoints(ctx);
    ctx.store
        .query::<Streamer>()
        .map(|(entity, streamer)| {
            let position = ctx.store.try_get::<Transform>(entity).map(|t| t.position);
            let owner = streamer.guid;
            let owner_is_peer = !owner.is_server() && ctx.peers.is_connected(owner);

            let new = if owner_is_peer && ctx.peers.is_idle(owner) {
                BTreeSet::from([owner])
            } else {
                views
                    .iter()
                    .filter(|(peer, view)| {
                        **peer == owner
                            || streamer.global
                            || matches!((position, **view), (Some(p), Some(v)) if p.distance(v) <= streamer.relevance_radius)
                    })
                    .map(|(peer, _)| *peer)
                    .collect()
            };
            Plan {
                entity,
                old: streamer.observers.clone(),
                new,
            }
        })
        .collect()
}

/// Runs the relevance pass and queues the resulting frames.
pub fn stream(ctx: &mut ServerContext) {
    let plans = plan(ctx);

    for p in &plans {
        let gained: Vec<PeerId> = p.new.difference(&p.old).copied().collect();
        if gained.is_empty() {
            continue;
        }
        let spawn = HumanSpawn {
            entity: p.entity,
            spawn_profile: ctx.store.try_get::<SpawnProfile>(p.entity).map_or(0, |s| s.0),
            position: ctx
                .store
                .try_get::<Transform>(p.entity)
                .map_or(Vec3::ZERO, |t| t.position),
        };
        for peer in gained {
            trace!(entity = %p.entity, peer = %peer, "spawn");
            ctx.send_to(peer, &spawn);
        }
    }

    for p in &plans {
        let kept: Vec<PeerId> = p.new.intersection(&p.old).copied().collect();
        if kept.is_empty() {
            continue;
        }
        let update = HumanUpdate {
            entity: p.entity,
            transform: ctx
                .store
                .try_get::<Transform>(p.entity)
                .copied()
                .unwrap_or_default(),
            sync: ctx
                .store
                .try_get::<HumanSync>(p.entity)
                .copied()
                .unwrap_or_default(),
        };
        let frame = update.encode();
        for peer in kept {
            ctx.outbox
                .push_sync(peer, p.entity, HumanUpdate::KIND, frame.clone());
        }
    }

    for p in &plans {
        for &peer in p.old.difference(&p.new) {
            trace!(entity = %p.entity, peer = %peer, "despawn");
            ctx.send_to(peer, &HumanDespawn { entity: p.entity });
        }
    }

    for p in plans {
        if let Some(streamer) = ctx.store.get_mut::<Streamer>(p.entity) {
            streamer.observers = p.new;
        }
    }
}

/// Drops `peer` from every observer set.
pub fn remove_observer_everywhere(store: &mut EntityStore, peer: PeerId) {
    for (_, streamer) in store.query_mut::<Streamer>() {
        streamer.observers.remove(&peer);
    }
}

/// Checks the ownership and observer invariants that must hold after Stream.
pub fn check_invariants(ctx: &ServerContext) -> Result<(), String> {
    for (entity, streamer) in ctx.store.query::<Streamer>() {
        if let Some(stranger) = streamer
            .observers
            .iter()
            .find(|p| !ctx.peers.is_connected(**p))
        {
            return Err(format!("entity {entity} observed by disconnected peer {stranger}"));
        }
        if streamer.guid.is_server() {
            continue;
        }
        if !ctx.peers.is_connected(streamer.guid) {
            return Err(format!(
                "entity {entity} owned by disconnected peer {}",
                streamer.guid
            ));
        }
        if !streamer.observers.contains(&streamer.guid) {
            return Err(format!(
                "owner {} missing from observers of entity {entity}",
                streamer.guid
            ));
        }
    }

    for (entity, binding) in ctx.store.query::<PeerBinding>() {
        if binding.entity != entity || ctx.store.lookup_by_peer(binding.peer) != Some(entity) {
            return Err(format!("peer binding of entity {entity} is inconsistent"));
        }
        if ctx.owner_of(entity) != Some(binding.peer) {
            return Err(format!("entity {entity} bound to {} but owned elsewhere", binding.peer));
        }
    }

    for (entity, kind) in ctx.store.query::<EntityKind>() {
        if *kind == EntityKind::Player && !ctx.store.has::<PeerBinding>(entity) {
            return Err(format!("player entity {entity} has no peer binding"));
        }
    }

    for peer in ctx.peers.ids() {
        if ctx.store.lookup_by_peer(peer).is_none() {
            return Err(format!("connected peer {peer} has no entity"));
        }
    }
    Ok(())
}
