//! Deferred world mutations.
//!
//! Dispatch never writes the entity store directly; handlers and scripts
//! record what they want here and the Apply phase commits it in order.

use sync_shared::{
    ecs::{EntityId, EntityKind, HumanSync, Transform},
    math::Vec3,
    protocol::ClientInput,
};
use tracing::{debug, warn};

use crate::context::ServerContext;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Owner input, already authorized.
    ApplyInput { entity: EntityId, input: ClientInput },
    /// Scripted human on a reserved id.
    Spawn {
        entity: EntityId,
        profile: u64,
        position: Vec3,
    },
    Despawn { entity: EntityId },
    Teleport { entity: EntityId, position: Vec3 },
}

/// Commits every recorded mutation in the order it was queued.
pub fn apply_mutations(ctx: &mut ServerContext) {
    let pending = std::mem::take(&mut ctx.mutations);
    for mutation in pending {
        match mutation {
            Mutation::ApplyInput { entity, input } => apply_input(ctx, entity, &input),
            Mutation::Spawn {
                entity,
                profile,
                position,
            } => {
                ctx.spawn_scripted(entity, profile, position);
            }
            Mutation::Despawn { entity } => {
                if ctx.store.try_get::<EntityKind>(entity) == Some(&EntityKind::Player) {
                    warn!(entity = %entity, "refusing to despawn a player entity");
                    continue;
                }
                ctx.despawn_entity(entity);
            }
            Mutation::Teleport { entity, position } => {
                match ctx.store.get_mut::<Transform>(entity) {
                    Some(t) => t.position = position,
                    None => debug!(entity = %entity, "teleport of unknown entity ignored"),
                }
            }
        }
    }
}

fn apply_input(ctx: &mut ServerContext, entity: EntityId, input: &ClientInput) {
    let Some(sync) = ctx.store.get_mut::<HumanSync>(entity) else {
        debug!(entity = %entity, "input for vanished entity ignored");
        return;
    };
    // Unreliable-sequenced: anything older than the newest applied input is stale.
    if input.tick < sync.tick {
        debug!(entity = %entity, tick = input.tick, newest = sync.tick, "stale input dropped");
        return;
    }
    sync.tick = input.tick;
    sync.input_bits = input.input_bits;
    if let Some(t) = ctx.store.get_mut::<Transform>(entity) {
        t.rotation = input.look.normalize();
    }
}
