//! Local mirror of server state.
//!
//! Built purely from server frames: spawns insert humans, updates overwrite
//! them, despawns remove them. Keeps the previous transform of each human so
//! a renderer can interpolate between the last two updates.

use std::collections::BTreeMap;

use sync_shared::{
    ecs::{EntityId, HumanSync, Transform},
    math::Vec3,
    protocol::Message,
    weather::Weather,
};
use tracing::{debug, info};

/// A human as last reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHuman {
    pub spawn_profile: u64,
    pub transform: Transform,
    pub previous: Transform,
    pub sync: HumanSync,
    pub updates: u32,
}

#[derive(Debug, Default)]
pub struct WorldMirror {
    pub own_entity: Option<EntityId>,
    pub humans: BTreeMap<EntityId, RemoteHuman>,
    pub weather: Option<Weather>,
    pub chat: Vec<String>,
}

impl WorldMirror {
    pub fn apply(&mut self, msg: Message) {
        match msg {
            Message::AssignEntity(a) => {
                info!(entity = %a.entity, "entity assigned");
                self.own_entity = Some(a.entity);
            }
            Message::SetWeather(w) => {
                debug!(?w, "weather");
                self.weather = Some(w);
            }
            Message::HumanSpawn(s) => {
                let t = Transform::at(s.position);
                self.humans.insert(
                    s.entity,
                    RemoteHuman {
                        spawn_profile: s.spawn_profile,
                        transform: t,
                        previous: t,
                        sync: HumanSync::default(),
                        updates: 0,
                    },
                );
            }
            Message::HumanDespawn(d) => {
                if self.humans.remove(&d.entity).is_none() {
                    debug!(entity = %d.entity, "despawn for unknown human");
                }
            }
            Message::HumanUpdate(u) => match self.humans.get_mut(&u.entity) {
                Some(h) => {
                    h.previous = h.transform;
                    h.transform = u.transform;
                    h.sync = u.sync;
                    h.updates += 1;
                }
                None => debug!(entity = %u.entity, "update for unknown human"),
            },
            Message::Chat(c) => {
                info!(text = %c.text, "chat");
                self.chat.push(c.text);
            }
            Message::ClientInput(_) => debug!("server echoed a client-only kind"),
        }
    }

    pub fn own(&self) -> Option<&RemoteHuman> {
        self.own_entity.and_then(|e| self.humans.get(&e))
    }

    /// Position between the last two updates; `alpha` 0 is the older one.
    pub fn interp_position(&self, entity: EntityId, alpha: f32) -> Option<Vec3> {
        let h = self.humans.get(&entity)?;
        let (a, b) = (h.previous.position, h.transform.position);
        Some(a + (b - a) * alpha.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::protocol::{HumanDespawn, HumanSpawn, HumanUpdate};

    #[test]
    fn spawn_update_despawn() {
        let mut m = WorldMirror::default();
        let e = EntityId(3);
        m.apply(Message::HumanSpawn(HumanSpawn {
            entity: e,
            spawn_profile: 2,
            position: Vec3::ZERO,
        }));
        m.apply(Message::HumanUpdate(HumanUpdate {
            entity: e,
            transform: Transform::at(Vec3::new(10.0, 0.0, 0.0)),
            sync: HumanSync { tick: 4, input_bits: 1 },
        }));
        assert_eq!(m.humans[&e].updates, 1);
        assert_eq!(m.interp_position(e, 0.5), Some(Vec3::new(5.0, 0.0, 0.0)));

        m.apply(Message::HumanDespawn(HumanDespawn { entity: e }));
        assert!(m.humans.is_empty());
    }

    #[test]
    fn updates_for_unknown_humans_are_ignored() {
        let mut m = WorldMirror::default();
        m.apply(Message::HumanUpdate(HumanUpdate {
            entity: EntityId(9),
            ..Default::default()
        }));
        assert!(m.humans.is_empty());
    }
}
