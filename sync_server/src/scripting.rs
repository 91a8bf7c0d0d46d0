//! Host scripting surface.
//!
//! Script engines plug in as [`ScriptHandler`] subscribers on named events.
//! Handlers run on the tick thread and reach the world only through
//! [`ScriptApi`]; entities are passed as plain [`EntityId`] handles.
//!
//! A handler that returns an error or panics is logged with the event name and
//! entity, and that subscriber is skipped for that entity until the tick ends.

use std::{
    collections::HashSet,
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
};

use anyhow::bail;
use sync_shared::{
    ecs::{EntityId, PeerBinding, PeerId, Transform},
    math::Vec3,
    protocol::{ChatMessage, Payload},
    weather::{Season, Weather},
};
use tracing::{debug, warn};

use crate::{context::ServerContext, mutation::Mutation};

/// Names of the events a script can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    PlayerConnected,
    PlayerDisconnected,
    ChatMessage,
    ChatCommand,
}

impl EventName {
    pub const ALL: [EventName; 4] = [
        EventName::PlayerConnected,
        EventName::PlayerDisconnected,
        EventName::ChatMessage,
        EventName::ChatCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::PlayerConnected => "onPlayerConnected",
            EventName::PlayerDisconnected => "onPlayerDisconnected",
            EventName::ChatMessage => "onChatMessage",
            EventName::ChatCommand => "onChatCommand",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::ALL.into_iter().find(|e| e.as_str() == s) {
            Some(e) => Ok(e),
            None => bail!("unknown script event '{s}'"),
        }
    }
}

/// An event as delivered to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    PlayerConnected {
        entity: EntityId,
    },
    PlayerDisconnected {
        entity: EntityId,
    },
    ChatMessage {
        entity: EntityId,
        text: String,
    },
    /// Fired instead of `ChatMessage` for lines starting with `/`.
    ChatCommand {
        entity: EntityId,
        full_text: String,
        command: String,
        args: Vec<String>,
    },
}

impl ScriptEvent {
    pub fn name(&self) -> EventName {
        match self {
            ScriptEvent::PlayerConnected { .. } => EventName::PlayerConnected,
            ScriptEvent::PlayerDisconnected { .. } => EventName::PlayerDisconnected,
            ScriptEvent::ChatMessage { .. } => EventName::ChatMessage,
            ScriptEvent::ChatCommand { .. } => EventName::ChatCommand,
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            ScriptEvent::PlayerConnected { entity }
            | ScriptEvent::PlayerDisconnected { entity }
            | ScriptEvent::ChatMessage { entity, .. }
            | ScriptEvent::ChatCommand { entity, .. } => *entity,
        }
    }
}

/// Functions callable from script handlers.
pub struct ScriptApi<'a> {
    ctx: &'a mut ServerContext,
}

impl<'a> ScriptApi<'a> {
    pub fn new(ctx: &'a mut ServerContext) -> Self {
        Self { ctx }
    }

    /// Sends chat to the peer bound to `entity`. False if the text is invalid
    /// or the entity has no peer.
    pub fn send_chat(&mut self, entity: EntityId, text: &str) -> bool {
        let msg = ChatMessage::new(text);
        if !msg.validate() {
            return false;
        }
        let Some(peer) = self.ctx.store.try_get::<PeerBinding>(entity).map(|b| b.peer) else {
            debug!(entity = %entity, "send_chat to entity without a peer");
            return false;
        };
        self.ctx.send_to(peer, &msg);
        true
    }

    pub fn broadcast_chat(&mut self, text: &str) -> bool {
        let msg = ChatMessage::new(text);
        if !msg.validate() {
            return false;
        }
        self.ctx.broadcast(&msg);
        true
    }

    pub fn set_weather(&mut self, name: &str) -> bool {
        self.ctx.set_weather(name)
    }

    pub fn set_time(&mut self, hour: u8, minute: u8) -> bool {
        self.ctx.set_time(hour, minute)
    }

    pub fn set_date(&mut self, day: u8, month: u8) -> bool {
        self.ctx.set_date(day, month)
    }

    pub fn set_season(&mut self, season: Season) -> bool {
        self.ctx.set_season(season)
    }

    pub fn weather(&self) -> &Weather {
        &self.ctx.world.weather
    }

    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.ctx.owner_of(entity)
    }

    pub fn transform_of(&self, entity: EntityId) -> Option<Transform> {
        self.ctx.store.try_get::<Transform>(entity).copied()
    }

    /// Player entities in id order.
    pub fn players(&self) -> Vec<EntityId> {
        self.ctx.store.ids_with::<PeerBinding>()
    }

    pub fn tick(&self) -> u64 {
        self.ctx.tick
    }

    /// Reserves an id for a server-owned human; it comes alive in Apply.
    pub fn spawn_human(&mut self, profile: u64, position: Vec3) -> anyhow::Result<EntityId> {
        if !position.is_finite() {
            bail!("spawn position {position:?} is not finite");
        }
        let entity = self.ctx.store.reserve();
        self.ctx.queue(Mutation::Spawn {
            entity,
            profile,
            position,
        });
        Ok(entity)
    }

    pub fn despawn(&mut self, entity: EntityId) {
        self.ctx.queue(Mutation::Despawn { entity });
    }

    pub fn teleport(&mut self, entity: EntityId, position: Vec3) -> anyhow::Result<()> {
        if !position.is_finite() {
            bail!("teleport target {position:?} is not finite");
        }
        self.ctx.queue(Mutation::Teleport { entity, position });
        Ok(())
    }
}

pub trait ScriptHandler: Send {
    fn handle(&mut self, api: &mut ScriptApi<'_>, event: &ScriptEvent) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

impl<F> ScriptHandler for FnHandler<F>
where
    F: FnMut(&mut ScriptApi<'_>, &ScriptEvent) -> anyhow::Result<()> + Send,
{
    fn handle(&mut self, api: &mut ScriptApi<'_>, event: &ScriptEvent) -> anyhow::Result<()> {
        (self.0)(api, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u32);

struct Subscriber {
    id: SubscriptionId,
    event: EventName,
    handler: Box<dyn ScriptHandler>,
}

/// Event subscriptions and the per-tick quarantine.
#[derive(Default)]
pub struct ScriptBridge {
    subscribers: Vec<Subscriber>,
    next_id: u32,
    quarantined: HashSet<(SubscriptionId, EntityId)>,
}

impl ScriptBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a handler to an event by its `onX` name.
    pub fn subscribe(
        &mut self,
        event: &str,
        handler: Box<dyn ScriptHandler>,
    ) -> anyhow::Result<SubscriptionId> {
        let event: EventName = event.parse()?;
        Ok(self.subscribe_event(event, handler))
    }

    pub fn subscribe_event(&mut self, event: EventName, handler: Box<dyn ScriptHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, event, handler });
        debug!(event = %event, id = id.0, "script subscribed");
        id
    }

    /// Subscribes a closure.
    pub fn on<F>(&mut self, event: EventName, f: F) -> SubscriptionId
    where
        F: FnMut(&mut ScriptApi<'_>, &ScriptEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_event(event, Box::new(FnHandler(f)))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self, event: EventName) -> usize {
        self.subscribers.iter().filter(|s| s.event == event).count()
    }

    /// Lifts every quarantine. Called at the start of each tick.
    pub fn begin_tick(&mut self) {
        self.quarantined.clear();
    }

    pub fn is_quarantined(&self, id: SubscriptionId, entity: EntityId) -> bool {
        self.quarantined.contains(&(id, entity))
    }

    /// Runs every subscriber of the event, in subscription order.
    pub fn fire(&mut self, ctx: &mut ServerContext, event: ScriptEvent) {
        let name = event.name();
        let entity = event.entity();
        for sub in self.subscribers.iter_mut().filter(|s| s.event == name) {
            if self.quarantined.contains(&(sub.id, entity)) {
                debug!(event = %name, entity = %entity, id = sub.id.0, "handler quarantined");
                continue;
            }
            let mut api = ScriptApi::new(ctx);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sub.handler.handle(&mut api, &event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(event = %name, entity = %entity, id = sub.id.0, error = %failure, "script handler failed");
            self.quarantined.insert((sub.id, entity));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use sync_shared::config::ServerConfig;

    fn ctx() -> ServerContext {
        let mut ctx = ServerContext::new(ServerConfig::default());
        ctx.peers.insert(PeerId(1), 0);
        ctx
    }

    #[test]
    fn event_names_round_trip() {
        for e in EventName::ALL {
            assert_eq!(e.as_str().parse::<EventName>().ok(), Some(e));
        }
        let mut bridge = ScriptBridge::new();
        let handler: Box<dyn ScriptHandler> =
            Box::new(FnHandler(|_: &mut ScriptApi<'_>, _: &ScriptEvent| -> anyhow::Result<()> { Ok(()) }));
        assert!(bridge.subscribe("playerConnected", handler).is_err());
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let mut ctx = ctx();
        let mut bridge = ScriptBridge::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let log = log.clone();
            bridge.on(EventName::PlayerConnected, move |_, _| {
                log.lock().unwrap().push(tag);
                Ok(())
            });
        }
        bridge.fire(&mut ctx, ScriptEvent::PlayerConnected { entity: EntityId(1) });
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn failing_handler_is_quarantined_for_the_tick() {
        let mut ctx = ctx();
        let mut bridge = ScriptBridge::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let id = bridge.on(EventName::ChatMessage, move |_, _| {
            *counter.lock().unwrap() += 1;
            bail!("boom")
        });
        let event = |e| ScriptEvent::ChatMessage {
            entity: EntityId(e),
            text: "x".into(),
        };
        bridge.fire(&mut ctx, event(1));
        bridge.fire(&mut ctx, event(1));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(bridge.is_quarantined(id, EntityId(1)));

        bridge.fire(&mut ctx, event(2));
        assert_eq!(*calls.lock().unwrap(), 2, "other entities are unaffected");

        bridge.begin_tick();
        bridge.fire(&mut ctx, event(1));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[test]
    fn panics_are_caught() {
        let mut ctx = ctx();
        let mut bridge = ScriptBridge::new();
        let id = bridge.on(EventName::PlayerConnected, |_, _| panic!("script bug"));
        bridge.fire(&mut ctx, ScriptEvent::PlayerConnected { entity: EntityId(9) });
        assert!(bridge.is_quarantined(id, EntityId(9)));
    }

    #[test]
    fn api_reaches_the_world() {
        let mut ctx = ctx();
        let e = ctx.spawn_player(PeerId(1));
        let mut bridge = ScriptBridge::new();
        bridge.on(EventName::PlayerConnected, |api, ev| {
            let entity = ev.entity();
            assert_eq!(api.owner_of(entity), Some(PeerId(1)));
            assert!(api.transform_of(entity).is_some());
            assert!(api.send_chat(entity, "welcome"));
            assert!(!api.send_chat(entity, ""));
            assert!(api.set_time(8, 15));
            api.spawn_human(2, Vec3::new(1.0, 1.0, 0.0))?;
            assert!(api.teleport(entity, Vec3::new(f32::NAN, 0.0, 0.0)).is_err());
            Ok(())
        });
        bridge.fire(&mut ctx, ScriptEvent::PlayerConnected { entity: e });
        assert_eq!(ctx.world.weather.time_hour, 8);
        assert_eq!(ctx.mutations.len(), 1);
        assert_eq!(ctx.outbox.pending(PeerId(1)), 2);
    }
}
