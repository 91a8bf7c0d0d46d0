//! RPC registry and inbound dispatch.
//!
//! One entry per message kind, registered at startup. An inbound frame is
//! looked up by its kind byte, checked for direction, decoded, validated and
//! handed to the kind's handler. Every rejection is reported back to the
//! caller, which owns fault accounting.

use std::collections::BTreeMap;

use anyhow::bail;
use sync_shared::{
    bitstream::BitStream,
    chat::ChatLine,
    ecs::{EntityId, PeerId},
    protocol::{
        AssignEntity, ChannelClass, ChatMessage, ClientInput, DecodeError, Flow, HumanDespawn, HumanSpawn,
        HumanUpdate, MessageKind, Payload,
    },
    weather::Weather,
};
use thiserror::Error;

use crate::{
    context::ServerContext,
    mutation::Mutation,
    peers::FaultKind,
    scripting::{ScriptBridge, ScriptEvent},
};

/// Why an inbound frame had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameRejection {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("malformed {} payload", .0.name())]
    Malformed(MessageKind),
    #[error("{} is not accepted from clients", .0.name())]
    WrongDirection(MessageKind),
    #[error("{} payload failed validation", .0.name())]
    Invalid(MessageKind),
    #[error("entity {entity} is not owned by the sender")]
    Unauthorized { entity: EntityId },
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("sender has no entity")]
    UnknownPeer,
}

impl FrameRejection {
    /// The fault this rejection counts as, if any.
    pub fn fault(self) -> Option<FaultKind> {
        match self {
            FrameRejection::Empty | FrameRejection::UnknownKind(_) | FrameRejection::Malformed(_) => {
                Some(FaultKind::Malformed)
            }
            FrameRejection::WrongDirection(_) | FrameRejection::Invalid(_) => Some(FaultKind::Invalid),
            FrameRejection::Unauthorized { .. } => Some(FaultKind::Unauthorized),
            FrameRejection::UnknownEntity(_) | FrameRejection::UnknownPeer => None,
        }
    }
}

/// A payload the server accepts from clients.
pub trait InboundRpc: Payload {
    fn handle(
        ctx: &mut ServerContext,
        scripts: &mut ScriptBridge,
        peer: PeerId,
        payload: Self,
    ) -> Result<(), FrameRejection>;
}

type RouteFn =
    fn(&mut ServerContext, &mut ScriptBridge, PeerId, &mut BitStream) -> Result<(), FrameRejection>;

fn route<P: InboundRpc>(
    ctx: &mut ServerContext,
    scripts: &mut ScriptBridge,
    peer: PeerId,
    s: &mut BitStream,
) -> Result<(), FrameRejection> {
    let payload = P::decode_checked(s).map_err(|e| match e {
        DecodeError::Invalid(kind) => FrameRejection::Invalid(kind),
        _ => FrameRejection::Malformed(P::KIND),
    })?;
    P::handle(ctx, scripts, peer, payload)
}

#[derive(Clone, Copy)]
pub struct RpcEntry {
    pub kind: MessageKind,
    pub channel: ChannelClass,
    pub flow: Flow,
    route: Option<RouteFn>,
}

#[derive(Default)]
pub struct RpcRegistry {
    entries: BTreeMap<u8, RpcEntry>,
}

impl RpcRegistry {
    /// The registry with every built-in kind.
    pub fn standard() -> anyhow::Result<Self> {
        let mut registry = Self::default();
        registry.register_inbound::<ChatMessage>()?;
        registry.register_inbound::<ClientInput>()?;
        registry.register_outbound::<Weather>()?;
        registry.register_outbound::<HumanSpawn>()?;
        registry.register_outbound::<HumanDespawn>()?;
        registry.register_outbound::<HumanUpdate>()?;
        registry.register_outbound::<AssignEntity>()?;
        Ok(registry)
    }

    fn insert(&mut self, entry: RpcEntry) -> anyhow::Result<()> {
        let id = entry.kind as u8;
        if self.entries.contains_key(&id) {
            bail!("message kind {} registered twice", entry.kind.name());
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn register_inbound<P: InboundRpc>(&mut self) -> anyhow::Result<()> {
        self.insert(RpcEntry {
            kind: P::KIND,
            channel: P::KIND.channel(),
            flow: P::KIND.flow(),
            route: Some(route::<P> as RouteFn),
        })
    }

    /// Registers a kind the server only ever sends.
    pub fn register_outbound<P: Payload>(&mut self) -> anyhow::Result<()> {
        self.insert(RpcEntry {
            kind: P::KIND,
            channel: P::KIND.channel(),
            flow: P::KIND.flow(),
            route: None,
        })
    }

    pub fn entry(&self, kind: MessageKind) -> Option<&RpcEntry> {
        self.entries.get(&(kind as u8))
    }

    /// Routes one inbound frame from `peer`.
    pub fn dispatch(
        &self,
        ctx: &mut ServerContext,
        scripts: &mut ScriptBridge,
        peer: PeerId,
        frame: &[u8],
    ) -> Result<MessageKind, FrameRejection> {
        let (&raw, payload) = frame.split_first().ok_or(FrameRejection::Empty)?;
        let entry = self.entries.get(&raw).ok_or(FrameRejection::UnknownKind(raw))?;
        let handler = match entry.route {
            Some(handler) if entry.flow.accepts_from_client() => handler,
            _ => return Err(FrameRejection::WrongDirection(entry.kind)),
        };
        let mut s = BitStream::reader(payload);
        handler(ctx, scripts, peer, &mut s)?;
        Ok(entry.kind)
    }
}

impl InboundRpc for ChatMessage {
    fn handle(
        ctx: &mut ServerContext,
        scripts: &mut ScriptBridge,
        peer: PeerId,
        payload: Self,
    ) -> Result<(), FrameRejection> {
        let entity = ctx.store.lookup_by_peer(peer).ok_or(FrameRejection::UnknownPeer)?;
        let event = match ChatLine::parse(&payload.text) {
            ChatLine::Message(text) => ScriptEvent::ChatMessage {
                entity,
                text: text.to_string(),
            },
            ChatLine::Command { command, args } => ScriptEvent::ChatCommand {
                entity,
                full_text: payload.text.clone(),
                command: command.to_string(),
                args: args.into_iter().map(str::to_string).collect(),
            },
        };
        scripts.fire(ctx, event);
        Ok(())
    }
}

impl InboundRpc for ClientInput {
    fn handle(
        ctx: &mut ServerContext,
        _scripts: &mut ScriptBridge,
        peer: PeerId,
        payload: Self,
    ) -> Result<(), FrameRejection> {
        let entity = payload.entity;
        let owner = ctx
            .owner_of(entity)
            .ok_or(FrameRejection::UnknownEntity(entity))?;
        if owner != peer {
            return Err(FrameRejection::Unauthorized { entity });
        }
        ctx.peers.mark_input(peer, ctx.tick);
        ctx.queue(Mutation::ApplyInput {
            entity,
            input: payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use sync_shared::{config::ServerConfig, math::Quat};

    use crate::scripting::EventName;

    struct Fixture {
        ctx: ServerContext,
        scripts: ScriptBridge,
        registry: RpcRegistry,
        events: Arc<Mutex<Vec<ScriptEvent>>>,
    }

    fn fixture() -> Fixture {
        let mut ctx = ServerContext::new(ServerConfig::default());
        for p in [PeerId(1), PeerId(2)] {
            ctx.peers.insert(p, 0);
            ctx.spawn_player(p);
        }
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut scripts = ScriptBridge::new();
        for name in [EventName::ChatMessage, EventName::ChatCommand] {
            let events = events.clone();
            scripts.on(name, move |_, ev| {
                events.lock().unwrap().push(ev.clone());
                Ok(())
            });
        }
        Fixture {
            ctx,
            scripts,
            registry: RpcRegistry::standard().unwrap(),
            events,
        }
    }

    impl Fixture {
        fn dispatch(&mut self, peer: PeerId, frame: &[u8]) -> Result<MessageKind, FrameRejection> {
            self.registry
                .dispatch(&mut self.ctx, &mut self.scripts, peer, frame)
        }
    }

    fn input(entity: EntityId) -> ClientInput {
        ClientInput {
            entity,
            tick: 1,
            input_bits: 1,
            look: Quat::IDENTITY,
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = RpcRegistry::standard().unwrap();
        assert!(registry.register_inbound::<ChatMessage>().is_err());
        assert_eq!(
            registry.entry(MessageKind::HumanUpdate).map(|e| e.channel),
            Some(ChannelClass::UnreliableSequenced)
        );
    }

    #[test]
    fn chat_fires_message_or_command() {
        let mut f = fixture();
        f.dispatch(PeerId(1), &ChatMessage::new("hello").encode()).unwrap();
        f.dispatch(PeerId(1), &ChatMessage::new("/kick alice reason").encode())
            .unwrap();
        let e1 = f.ctx.store.lookup_by_peer(PeerId(1)).unwrap();
        assert_eq!(
            *f.events.lock().unwrap(),
            vec![
                ScriptEvent::ChatMessage {
                    entity: e1,
                    text: "hello".into()
                },
                ScriptEvent::ChatCommand {
                    entity: e1,
                    full_text: "/kick alice reason".into(),
                    command: "kick".into(),
                    args: vec!["alice".into(), "reason".into()],
                },
            ]
        );
    }

    #[test]
    fn rejections_are_classified() {
        let mut f = fixture();
        assert_eq!(f.dispatch(PeerId(1), &[]), Err(FrameRejection::Empty));
        assert_eq!(f.dispatch(PeerId(1), &[200]), Err(FrameRejection::UnknownKind(200)));
        assert_eq!(
            f.dispatch(PeerId(1), &[MessageKind::ChatMessage as u8, 9]),
            Err(FrameRejection::Malformed(MessageKind::ChatMessage))
        );
        assert_eq!(
            f.dispatch(PeerId(1), &Weather::default().encode()),
            Err(FrameRejection::WrongDirection(MessageKind::SetWeather))
        );
        assert_eq!(
            f.dispatch(PeerId(1), &ChatMessage::new("").encode()),
            Err(FrameRejection::Invalid(MessageKind::ChatMessage))
        );
        assert_eq!(FrameRejection::Empty.fault(), Some(FaultKind::Malformed));
        assert_eq!(FrameRejection::UnknownEntity(EntityId(1)).fault(), None);
        assert!(f.events.lock().unwrap().is_empty());
    }

    #[test]
    fn input_needs_ownership() {
        let mut f = fixture();
        let e1 = f.ctx.store.lookup_by_peer(PeerId(1)).unwrap();
        assert_eq!(
            f.dispatch(PeerId(2), &input(e1).encode()),
            Err(FrameRejection::Unauthorized { entity: e1 })
        );
        assert_eq!(
            f.dispatch(PeerId(2), &input(EntityId(999)).encode()),
            Err(FrameRejection::UnknownEntity(EntityId(999)))
        );
        assert!(f.ctx.mutations.is_empty());

        assert_eq!(f.dispatch(PeerId(1), &input(e1).encode()), Ok(MessageKind::ClientInput));
        assert_eq!(f.ctx.mutations.len(), 1);
    }

    #[test]
    fn random_frames_never_reach_handlers_unchecked() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut f = fixture();
        let mut rng = StdRng::seed_from_u64(0xD15);
        for kind in MessageKind::ALL {
            for _ in 0..300 {
                let len = rng.gen_range(0..64);
                let mut frame = vec![kind as u8];
                frame.extend((0..len).map(|_| rng.gen::<u8>()));
                match f.dispatch(PeerId(2), &frame) {
                    Ok(k) => assert_eq!(k, kind),
                    Err(FrameRejection::Malformed(k) | FrameRejection::Invalid(k) | FrameRejection::WrongDirection(k)) => {
                        assert_eq!(k, kind)
                    }
                    Err(FrameRejection::UnknownEntity(_) | FrameRejection::Unauthorized { .. }) => {
                        assert_eq!(kind, MessageKind::ClientInput)
                    }
                    Err(other) => panic!("{kind:?}: unexpected {other:?}"),
                }
            }
        }
        // Anything accepted was validated first.
        for m in &f.ctx.mutations {
            if let Mutation::ApplyInput { input, .. } = m {
                assert!(input.validate());
            }
        }
        for ev in f.events.lock().unwrap().iter() {
            if let ScriptEvent::ChatMessage { text, .. } = ev {
                assert!(sync_shared::chat::is_valid_message(text));
            }
        }
    }
}