//! Wire protocol.
//!
//! Every frame is `u8 kind` followed by the payload bound to that kind, walked
//! with the [`BitStream`] codec. There is no length prefix at this layer; the
//! transport delivers whole frames.
//!
//! Kind ids are part of the wire format. Changing one is a breaking protocol
//! change.

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

use crate::{
    bitstream::{BitStream, Streamable},
    chat,
    ecs::{EntityId, HumanSync, Transform},
    math::{Quat, Vec3},
    weather::{Season, Weather},
};

/// Delivery guarantees a kind is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Control messages, chat, world-state changes.
    ReliableOrdered,
    /// Per-tick entity sync; only the newest per entity per peer matters.
    UnreliableSequenced,
}

/// Who may send a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    ServerToClient,
    ClientToServer,
    Both,
}

impl Flow {
    pub fn accepts_from_client(self) -> bool {
        matches!(self, Flow::ClientToServer | Flow::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ChatMessage = 1,
    SetWeather = 2,
    HumanSpawn = 3,
    HumanDespawn = 4,
    HumanUpdate = 5,
    ClientInput = 6,
    AssignEntity = 7,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::ChatMessage,
        MessageKind::SetWeather,
        MessageKind::HumanSpawn,
        MessageKind::HumanDespawn,
        MessageKind::HumanUpdate,
        MessageKind::ClientInput,
        MessageKind::AssignEntity,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::ChatMessage => "ChatMessage",
            MessageKind::SetWeather => "SetWeather",
            MessageKind::HumanSpawn => "HumanSpawn",
            MessageKind::HumanDespawn => "HumanDespawn",
            MessageKind::HumanUpdate => "HumanUpdate",
            MessageKind::ClientInput => "ClientInput",
            MessageKind::AssignEntity => "AssignEntity",
        }
    }

    pub fn channel(self) -> ChannelClass {
        match self {
            MessageKind::HumanUpdate | MessageKind::ClientInput => ChannelClass::UnreliableSequenced,
            _ => ChannelClass::ReliableOrdered,
        }
    }

    pub fn flow(self) -> Flow {
        match self {
            MessageKind::ChatMessage => Flow::Both,
            MessageKind::ClientInput => Flow::ClientToServer,
            _ => Flow::ServerToClient,
        }
    }
}

/// A typed message body bound to one [`MessageKind`].
pub trait Payload: Streamable + Default + Clone {
    const KIND: MessageKind;

    /// Per-field constraints checked after decoding and before any effect.
    fn validate(&self) -> bool {
        true
    }

    /// Encodes `kind + payload`. The value is expected to pass [`Payload::validate`].
    fn encode(&self) -> Bytes {
        let mut s = BitStream::writer();
        let mut kind = Self::KIND as u8;
        s.serialize_u8(&mut kind);
        s.serialize(&mut self.clone());
        if s.is_poisoned() {
            error!(kind = Self::KIND.name(), "payload exceeded a wire length cap while encoding");
        }
        s.finish()
    }

    /// Decodes the payload that follows the kind byte. `None` if the stream poisoned.
    fn decode(s: &mut BitStream) -> Option<Self> {
        let mut value = Self::default();
        s.serialize(&mut value);
        (!s.is_poisoned()).then_some(value)
    }

    /// Decodes and validates: `Malformed` if the stream poisoned, `Invalid`
    /// if a field is out of range.
    fn decode_checked(s: &mut BitStream) -> Result<Self, DecodeError> {
        let value = Self::decode(s).ok_or(DecodeError::Malformed(Self::KIND))?;
        if !value.validate() {
            return Err(DecodeError::Invalid(Self::KIND));
        }
        Ok(value)
    }
}

impl Streamable for EntityId {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_u64(&mut self.0);
    }
}

impl Streamable for Vec3 {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_f32(&mut self.x);
        s.serialize_f32(&mut self.y);
        s.serialize_f32(&mut self.z);
    }
}

impl Streamable for Quat {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_f32(&mut self.x);
        s.serialize_f32(&mut self.y);
        s.serialize_f32(&mut self.z);
        s.serialize_f32(&mut self.w);
    }
}

impl Streamable for Transform {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.position);
        s.serialize(&mut self.rotation);
        s.serialize(&mut self.velocity);
    }
}

impl Streamable for HumanSync {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_u32(&mut self.tick);
        s.serialize_u32(&mut self.input_bits);
    }
}

// ─── Payloads ───

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatMessage {
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Streamable for ChatMessage {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_string(&mut self.text);
    }
}

impl Payload for ChatMessage {
    const KIND: MessageKind = MessageKind::ChatMessage;

    fn validate(&self) -> bool {
        chat::is_valid_message(&self.text)
    }
}

/// `SetWeather` as it sits on the wire, season still a raw byte.
#[derive(Debug, Default)]
struct WeatherWire {
    time_hour: u8,
    time_minute: u8,
    date_day: u8,
    date_month: u8,
    weather_name: String,
    season: u8,
}

impl WeatherWire {
    fn from_weather(w: &Weather) -> Self {
        Self {
            time_hour: w.time_hour,
            time_minute: w.time_minute,
            date_day: w.date_day,
            date_month: w.date_month,
            weather_name: w.weather_name.clone(),
            season: w.season.to_wire(),
        }
    }

    fn into_weather(self) -> Option<Weather> {
        Some(Weather {
            time_hour: self.time_hour,
            time_minute: self.time_minute,
            date_day: self.date_day,
            date_month: self.date_month,
            weather_name: self.weather_name,
            season: Season::from_wire(self.season)?,
        })
    }
}

impl Streamable for WeatherWire {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize_u8(&mut self.time_hour);
        s.serialize_u8(&mut self.time_minute);
        s.serialize_u8(&mut self.date_day);
        s.serialize_u8(&mut self.date_month);
        s.serialize_string(&mut self.weather_name);
        s.serialize_u8(&mut self.season);
    }
}

impl Streamable for Weather {
    fn stream(&mut self, s: &mut BitStream) {
        let mut wire = WeatherWire::from_weather(self);
        s.serialize(&mut wire);
        if s.is_reading() && !s.is_poisoned() {
            match wire.into_weather() {
                Some(decoded) => *self = decoded,
                None => s.poison(),
            }
        }
    }
}

impl Payload for Weather {
    const KIND: MessageKind = MessageKind::SetWeather;

    /// An unknown season byte is a range failure like any other field.
    fn decode_checked(s: &mut BitStream) -> Result<Self, DecodeError> {
        let mut wire = WeatherWire::default();
        s.serialize(&mut wire);
        if s.is_poisoned() {
            return Err(DecodeError::Malformed(Self::KIND));
        }
        match wire.into_weather() {
            Some(w) if w.validate() => Ok(w),
            _ => Err(DecodeError::Invalid(Self::KIND)),
        }
    }

    fn validate(&self) -> bool {
        self.is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HumanSpawn {
    pub entity: EntityId,
    pub spawn_profile: u64,
    pub position: Vec3,
}

impl Streamable for HumanSpawn {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.entity);
        s.serialize_u64(&mut self.spawn_profile);
        s.serialize(&mut self.position);
    }
}

impl Payload for HumanSpawn {
    const KIND: MessageKind = MessageKind::HumanSpawn;

    fn validate(&self) -> bool {
        !self.entity.is_none() && self.position.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanDespawn {
    pub entity: EntityId,
}

impl Streamable for HumanDespawn {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.entity);
    }
}

impl Payload for HumanDespawn {
    const KIND: MessageKind = MessageKind::HumanDespawn;

    fn validate(&self) -> bool {
        !self.entity.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HumanUpdate {
    pub entity: EntityId,
    pub transform: Transform,
    pub sync: HumanSync,
}

impl Streamable for HumanUpdate {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.entity);
        s.serialize(&mut self.transform);
        s.serialize(&mut self.sync);
    }
}

impl Payload for HumanUpdate {
    const KIND: MessageKind = MessageKind::HumanUpdate;

    fn validate(&self) -> bool {
        !self.entity.is_none()
            && self.transform.position.is_finite()
            && self.transform.rotation.is_finite()
            && self.transform.velocity.is_finite()
    }
}

/// Owner input for one client tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClientInput {
    /// The entity the sender claims to drive.
    pub entity: EntityId,
    pub tick: u32,
    pub input_bits: u32,
    pub look: Quat,
}

impl Streamable for ClientInput {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.entity);
        s.serialize_u32(&mut self.tick);
        s.serialize_u32(&mut self.input_bits);
        s.serialize(&mut self.look);
    }
}

impl Payload for ClientInput {
    const KIND: MessageKind = MessageKind::ClientInput;

    fn validate(&self) -> bool {
        !self.entity.is_none() && self.look.is_finite() && self.look.norm_sq() > f32::EPSILON
    }
}

/// Tells a peer which entity it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssignEntity {
    pub entity: EntityId,
}

impl Streamable for AssignEntity {
    fn stream(&mut self, s: &mut BitStream) {
        s.serialize(&mut self.entity);
    }
}

impl Payload for AssignEntity {
    const KIND: MessageKind = MessageKind::AssignEntity;

    fn validate(&self) -> bool {
        !self.entity.is_none()
    }
}

/// Why a frame could not be turned into a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("truncated or malformed {} payload", .0.name())]
    Malformed(MessageKind),
    #[error("{} payload failed validation", .0.name())]
    Invalid(MessageKind),
}

/// Any decoded frame. Convenient for clients and tests; the server routes
/// through its registry instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Chat(ChatMessage),
    SetWeather(Weather),
    HumanSpawn(HumanSpawn),
    HumanDespawn(HumanDespawn),
    HumanUpdate(HumanUpdate),
    ClientInput(ClientInput),
    AssignEntity(AssignEntity),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Chat(_) => MessageKind::ChatMessage,
            Message::SetWeather(_) => MessageKind::SetWeather,
            Message::HumanSpawn(_) => MessageKind::HumanSpawn,
            Message::HumanDespawn(_) => MessageKind::HumanDespawn,
            Message::HumanUpdate(_) => MessageKind::HumanUpdate,
            Message::ClientInput(_) => MessageKind::ClientInput,
            Message::AssignEntity(_) => MessageKind::AssignEntity,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Message::Chat(p) => p.encode(),
            Message::SetWeather(p) => p.encode(),
            Message::HumanSpawn(p) => p.encode(),
            Message::HumanDespawn(p) => p.encode(),
            Message::HumanUpdate(p) => p.encode(),
            Message::ClientInput(p) => p.encode(),
            Message::AssignEntity(p) => p.encode(),
        }
    }

    /// Decodes and validates one whole frame.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let (&raw, _) = frame.split_first().ok_or(DecodeError::Empty)?;
        let kind = MessageKind::from_u8(raw).ok_or(DecodeError::UnknownKind(raw))?;
        let mut s = BitStream::reader(&frame[1..]);
        Ok(match kind {
            MessageKind::ChatMessage => Message::Chat(Payload::decode_checked(&mut s)?),
            MessageKind::SetWeather => Message::SetWeather(Payload::decode_checked(&mut s)?),
            MessageKind::HumanSpawn => Message::HumanSpawn(Payload::decode_checked(&mut s)?),
            MessageKind::HumanDespawn => Message::HumanDespawn(Payload::decode_checked(&mut s)?),
            MessageKind::HumanUpdate => Message::HumanUpdate(Payload::decode_checked(&mut s)?),
            MessageKind::ClientInput => Message::ClientInput(Payload::decode_checked(&mut s)?),
            MessageKind::AssignEntity => Message::AssignEntity(Payload::decode_checked(&mut s)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_ids_are_stable() {
        let ids: Vec<u8> = MessageKind::ALL.iter().map(|k| *k as u8).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(8), None);
    }

    #[test]
    fn channel_classes() {
        assert_eq!(MessageKind::HumanUpdate.channel(), ChannelClass::UnreliableSequenced);
        assert_eq!(MessageKind::ClientInput.channel(), ChannelClass::UnreliableSequenced);
        assert_eq!(MessageKind::SetWeather.channel(), ChannelClass::ReliableOrdered);
        assert_eq!(MessageKind::ChatMessage.channel(), ChannelClass::ReliableOrdered);
    }

    #[test]
    fn chat_frame_layout() {
        let frame = ChatMessage::new("hi").encode();
        assert_eq!(&frame[..], &[1, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn weather_frame_layout() {
        let w = Weather {
            time_hour: 14,
            time_minute: 30,
            date_day: 2,
            date_month: 3,
            weather_name: "rain".into(),
            season: Season::Autumn,
        };
        let frame = w.encode();
        assert_eq!(
            &frame[..],
            &[2, 14, 30, 2, 3, 4, 0, 0, 0, b'r', b'a', b'i', b'n', 2]
        );
        assert_eq!(Message::decode(&frame), Ok(Message::SetWeather(w)));
    }

    #[test]
    fn human_update_is_fixed_size() {
        let update = HumanUpdate {
            entity: EntityId(9),
            transform: Transform::at(Vec3::new(1.0, 2.0, 3.0)),
            sync: HumanSync { tick: 4, input_bits: 5 },
        };
        let frame = update.encode();
        // kind + u64 + 10 * f32 + 2 * u32
        assert_eq!(frame.len(), 1 + 8 + 40 + 8);
        assert_eq!(Message::decode(&frame), Ok(Message::HumanUpdate(update)));
    }

    #[test]
    fn client_input_round_trips() {
        let input = ClientInput {
            entity: EntityId(3),
            tick: 77,
            input_bits: 0b101,
            look: Quat::from_yaw(0.5),
        };
        assert_eq!(Message::decode(&input.encode()), Ok(Message::ClientInput(input)));
    }

    #[test]
    fn bad_season_is_invalid() {
        let mut frame = Weather::default().encode().to_vec();
        *frame.last_mut().unwrap() = 9;
        assert_eq!(
            Message::decode(&frame),
            Err(DecodeError::Invalid(MessageKind::SetWeather))
        );
        frame.pop();
        assert_eq!(
            Message::decode(&frame),
            Err(DecodeError::Malformed(MessageKind::SetWeather))
        );
    }

    #[test]
    fn out_of_range_weather_is_invalid() {
        let w = Weather {
            time_hour: 25,
            ..Weather::default()
        };
        assert_eq!(
            Message::decode(&w.encode()),
            Err(DecodeError::Invalid(MessageKind::SetWeather))
        );
    }

    #[test]
    fn truncated_and_unknown_frames() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Message::decode(&[42]), Err(DecodeError::UnknownKind(42)));
        assert_eq!(
            Message::decode(&[5, 1, 2]),
            Err(DecodeError::Malformed(MessageKind::HumanUpdate))
        );
    }

    #[test]
    fn empty_chat_is_invalid() {
        assert_eq!(
            Message::decode(&ChatMessage::new("").encode()),
            Err(DecodeError::Invalid(MessageKind::ChatMessage))
        );
    }

    fn samples() -> Vec<Bytes> {
        vec![
            ChatMessage::new("hello there").encode(),
            Weather::default().encode(),
            HumanSpawn {
                entity: EntityId(2),
                spawn_profile: 11,
                position: Vec3::new(1.0, 0.0, -4.0),
            }
            .encode(),
            HumanDespawn { entity: EntityId(2) }.encode(),
            HumanUpdate {
                entity: EntityId(2),
                ..Default::default()
            }
            .encode(),
            ClientInput {
                entity: EntityId(2),
                tick: 3,
                input_bits: 1,
                look: Quat::IDENTITY,
            }
            .encode(),
            AssignEntity { entity: EntityId(2) }.encode(),
        ]
    }

    fn check_frame(frame: &[u8]) {
        let kind = MessageKind::from_u8(frame[0]).expect("fuzzed frames keep a known kind");
        match Message::decode(frame) {
            Ok(msg) => {
                assert_eq!(msg.kind(), kind);
                let again = msg.encode();
                assert!(
                    frame.starts_with(&again),
                    "{kind:?}: re-encoded {again:?} is not a prefix of {frame:?}"
                );
            }
            Err(DecodeError::Malformed(k)) | Err(DecodeError::Invalid(k)) => assert_eq!(k, kind),
            Err(other) => panic!("{kind:?}: unexpected {other:?}"),
        }
    }

    #[test]
    fn random_tails_decode_or_reject_for_every_kind() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xF022);
        for kind in MessageKind::ALL {
            for _ in 0..500 {
                let len = rng.gen_range(0..80);
                let mut frame = vec![kind as u8];
                frame.extend((0..len).map(|_| rng.gen::<u8>()));
                check_frame(&frame);
            }
        }
    }

    #[test]
    fn mutated_valid_frames_decode_or_reject() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xBEEF);
        for sample in samples() {
            check_frame(&sample);
            for _ in 0..500 {
                let mut frame = sample.to_vec();
                for _ in 0..rng.gen_range(1..4) {
                    let at = rng.gen_range(1..frame.len());
                    frame[at] = rng.gen();
                }
                if rng.gen_bool(0.3) {
                    frame.truncate(rng.gen_range(1..=frame.len()));
                }
                check_frame(&frame);
            }
        }
    }
}