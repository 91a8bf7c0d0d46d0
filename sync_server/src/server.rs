//! Server implementation.
//!
//! An authoritative fixed-step loop. Each tick runs, in order:
//! 1. Drain: pull transport events (connects, disconnects, frames).
//! 2. Dispatch: route frames through the RPC registry in arrival order.
//! 3. Apply: commit recorded mutations to the entity store.
//! 4. Simulate: run simulation systems.
//! 5. Stream: recompute observers and queue replication frames.
//! 6. Flush: hand queued frames to the transport.
//!
//! Determinism notes:
//! - Gameplay code never reads the wall clock; only `run` sleeps.
//! - Peers and entities are iterated in id order.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use sync_shared::{
    config::ServerConfig,
    ecs::{EntityId, HumanSync, PeerId},
    movement::{InputMovement, SimulationSystem},
    protocol::{AssignEntity, ChannelClass, ChatMessage, Payload},
    weather::Season,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bundle::ScriptBundle,
    context::ServerContext,
    error::ServerError,
    mutation::apply_mutations,
    peers::FaultKind,
    rpc::{FrameRejection, RpcRegistry},
    scripting::{ScriptBridge, ScriptEvent},
    streamer,
    transport::{TcpTransport, Transport, TransportError, TransportEvent},
};

/// Game server.
pub struct GameServer {
    ctx: ServerContext,
    registry: RpcRegistry,
    scripts: ScriptBridge,
    systems: Vec<Box<dyn SimulationSystem>>,
    transport: Box<dyn Transport>,
    /// Peers whose sends failed during the last flush.
    pending_disconnects: Vec<PeerId>,
    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
    shutdown_requested: bool,
    local_addr: Option<SocketAddr>,
}

impl GameServer {
    /// Creates a server over an existing transport.
    pub fn new(cfg: ServerConfig, transport: Box<dyn Transport>) -> anyhow::Result<Self> {
        let registry = RpcRegistry::standard().context("build rpc registry")?;
        let movement = InputMovement::new(cfg.movement());
        Ok(Self {
            ctx: ServerContext::new(cfg),
            registry,
            scripts: ScriptBridge::new(),
            systems: vec![Box::new(movement)],
            transport,
            pending_disconnects: Vec::new(),
            console_rx: None,
            shutdown_requested: false,
            local_addr: None,
        })
    }

    /// Binds the TCP transport and installs the configured script bundle.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let transport =
            TcpTransport::bind(&cfg.bind_addr, cfg.inbound_capacity, cfg.outbound_capacity).await?;
        let local_addr = transport.local_addr();
        let bundle = cfg.script_bundle.clone();

        let mut server = Self::new(cfg, Box::new(transport))?;
        server.local_addr = Some(local_addr);
        if let Some(path) = bundle {
            ScriptBundle::load(&path)?.install(&mut server.scripts);
            info!(path = %path.display(), "script bundle installed");
        }
        Ok(server)
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address when bound to a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.ctx
    }

    pub fn scripts_mut(&mut self) -> &mut ScriptBridge {
        &mut self.scripts
    }

    pub fn add_system(&mut self, system: Box<dyn SimulationSystem>) {
        self.systems.push(system);
    }

    pub fn tick(&self) -> u64 {
        self.ctx.tick
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Runs until shutdown is requested or a tick fails.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.ctx.cfg.tick_hz.max(1)));
        let mut next = Instant::now();
        info!(tick_hz = self.ctx.cfg.tick_hz, "server loop running");

        while !self.shutdown_requested {
            self.step()?;
            next += interval;
            let now = Instant::now();
            if now > next + interval {
                warn!(
                    behind_ms = (now - next).as_millis() as u64,
                    "tick schedule overran, resetting"
                );
                next = now;
            }
            tokio::time::sleep_until(next).await;
        }
        self.shutdown();
        Ok(())
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.ctx.cfg.tick_hz.max(1)));
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += interval;
            self.step()?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub fn step(&mut self) -> Result<(), ServerError> {
        self.scripts.begin_tick();
        self.process_console_commands();
        self.process_pending_disconnects();
        self.drain();
        apply_mutations(&mut self.ctx);
        self.simulate();
        streamer::stream(&mut self.ctx);
        if let Err(detail) = streamer::check_invariants(&self.ctx) {
            error!(tick = self.ctx.tick, %detail, "invariant violated");
            return Err(ServerError::InvariantViolation {
                tick: self.ctx.tick,
                detail,
            });
        }
        self.flush();
        self.ctx.tick += 1;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let Some(rx) = self.console_rx.as_mut() else {
            return;
        };
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        for line in lines {
            for out in self.exec_console(&line) {
                info!("{out}");
            }
        }
    }

    fn process_pending_disconnects(&mut self) {
        for peer in std::mem::take(&mut self.pending_disconnects) {
            self.kick(peer);
        }
    }

    fn drain(&mut self) {
        let budget = self.ctx.cfg.inbound_capacity.max(1);
        let mut events = Vec::new();
        while events.len() < budget {
            match self.transport.poll() {
                Some(ev) => events.push(ev),
                None => break,
            }
        }
        for ev in events {
            match ev {
                TransportEvent::Connected(peer) => self.handle_connect(peer),
                TransportEvent::Disconnected(peer) => self.handle_disconnect(peer),
                TransportEvent::Frame(peer, frame) => self.dispatch_frame(peer, &frame),
            }
        }
    }

    fn dispatch_frame(&mut self, peer: PeerId, frame: &[u8]) {
        if !self.ctx.peers.is_connected(peer) {
            debug!(peer = %peer, "frame from unknown peer dropped");
            return;
        }
        match self
            .registry
            .dispatch(&mut self.ctx, &mut self.scripts, peer, frame)
        {
            Ok(kind) => trace!(peer = %peer, kind = kind.name(), "frame dispatched"),
            Err(rejection) => self.reject(peer, rejection),
        }
    }

    fn reject(&mut self, peer: PeerId, rejection: FrameRejection) {
        let Some(fault) = rejection.fault() else {
            debug!(peer = %peer, %rejection, "frame ignored");
            return;
        };
        let tick = self.ctx.tick;
        let Some(state) = self.ctx.peers.get_mut(peer) else {
            return;
        };
        let over_limit = state.record_fault(fault, tick);
        if fault == FaultKind::Unauthorized && state.unauthorized == 1 {
            warn!(peer = %peer, %rejection, "unauthorized mutation");
        } else {
            debug!(peer = %peer, %rejection, ?fault, "frame rejected");
        }
        if over_limit {
            warn!(peer = %peer, faults = state.recent_faults(tick), "fault limit exceeded, disconnecting");
            self.kick(peer);
        }
    }

    fn handle_connect(&mut self, peer: PeerId) {
        if !self.ctx.peers.insert(peer, self.ctx.tick) {
            warn!(peer = %peer, "duplicate connect ignored");
            return;
        }
        let entity = self.ctx.spawn_player(peer);
        self.ctx.send_to(peer, &AssignEntity { entity });
        let weather = self.ctx.world.weather.clone();
        self.ctx.send_to(peer, &weather);
        info!(peer = %peer, entity = %entity, peers = self.ctx.peers.len(), "player joined");
        self.scripts
            .fire(&mut self.ctx, ScriptEvent::PlayerConnected { entity });
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        if self.ctx.peers.remove(peer).is_none() {
            return;
        }
        self.pending_disconnects.retain(|p| *p != peer);
        let dropped = self.ctx.outbox.drop_peer(peer);
        streamer::remove_observer_everywhere(&mut self.ctx.store, peer);

        let entity = self.ctx.store.lookup_by_peer(peer);
        if let Some(entity) = entity {
            self.scripts
                .fire(&mut self.ctx, ScriptEvent::PlayerDisconnected { entity });
        }
        for owned in self.ctx.owned_by(peer) {
            self.ctx.despawn_entity(owned);
        }
        info!(peer = %peer, entity = ?entity, dropped, "player left");
    }

    /// Closes a peer's connection and cleans up after it.
    pub fn kick(&mut self, peer: PeerId) -> bool {
        if !self.ctx.peers.is_connected(peer) {
            return false;
        }
        self.transport.disconnect(peer);
        self.handle_disconnect(peer);
        true
    }

    fn simulate(&mut self) {
        let tick = self.ctx.tick;
        for peer in self.ctx.peers.update_idle(tick, self.ctx.cfg.idle_ticks) {
            info!(peer = %peer, "peer idle");
            let Some(entity) = self.ctx.store.lookup_by_peer(peer) else {
                continue;
            };
            if let Some(sync) = self.ctx.store.get_mut::<HumanSync>(entity) {
                sync.input_bits = 0;
            }
        }
        let dt = self.ctx.cfg.tick_dt();
        for system in &mut self.systems {
            system.step(&mut self.ctx.store, dt);
        }
    }

    fn flush(&mut self) {
        for (peer, frames) in self.ctx.outbox.take() {
            for out in frames {
                match self.transport.send(peer, out.channel, out.frame, out.sync) {
                    Ok(()) => {}
                    Err(TransportError::QueueFull(_)) if out.channel == ChannelClass::UnreliableSequenced => {
                        debug!(peer = %peer, kind = out.kind.name(), "sync frame dropped, queue full");
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "send failed, disconnecting");
                        if !self.pending_disconnects.contains(&peer) {
                            self.pending_disconnects.push(peer);
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Despawns every entity, then gives each connected peer a fresh one.
    pub fn world_reset(&mut self) {
        let entities: Vec<EntityId> = self.ctx.store.entities().collect();
        for entity in &entities {
            self.ctx.despawn_entity(*entity);
        }
        self.ctx.mutations.clear();
        for peer in self.ctx.peers.ids() {
            let entity = self.ctx.spawn_player(peer);
            self.ctx.send_to(peer, &AssignEntity { entity });
        }
        info!(despawned = entities.len(), "world reset");
    }

    /// Flushes what is queued and disconnects everyone.
    pub fn shutdown(&mut self) {
        self.flush();
        for peer in self.ctx.peers.ids() {
            self.kick(peer);
        }
        self.ctx.outbox.take();
        info!(tick = self.ctx.tick, "server shut down");
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = tokens.split_first() else {
            return Vec::new();
        };

        match (cmd, args) {
            ("status", _) => self.status(),
            ("say", words) if !words.is_empty() => {
                let msg = ChatMessage::new(words.join(" "));
                if !msg.validate() {
                    return vec!["Message too long".to_string()];
                }
                self.ctx.broadcast(&msg);
                Vec::new()
            }
            ("time", [h, m]) => match (h.parse(), m.parse()) {
                (Ok(h), Ok(m)) if self.ctx.set_time(h, m) => vec![format!("Time set to {h:02}:{m:02}")],
                _ => vec!["Usage: time <0-23> <0-59>".to_string()],
            },
            ("date", [d, mo]) => match (d.parse(), mo.parse()) {
                (Ok(d), Ok(mo)) if self.ctx.set_date(d, mo) => vec![format!("Date set to {d}/{mo}")],
                _ => vec!["Usage: date <1-31> <1-12>".to_string()],
            },
            ("weather", [name]) => {
                if self.ctx.set_weather(name) {
                    vec![format!("Weather set to {name}")]
                } else {
                    vec!["Usage: weather <name>".to_string()]
                }
            }
            ("season", [name]) => match name.parse::<Season>() {
                Ok(season) if self.ctx.set_season(season) => vec![format!("Season set to {season}")],
                Ok(_) => vec!["Season change rejected".to_string()],
                Err(e) => vec![e],
            },
            ("kick", [id]) => match parse_peer(id) {
                Some(peer) if self.kick(peer) => vec![format!("Kicked {peer}")],
                Some(peer) => vec![format!("No such peer {peer}")],
                None => vec!["Usage: kick <peer id>".to_string()],
            },
            ("reset", _) => {
                self.world_reset();
                vec!["World reset".to_string()]
            }
            ("quit" | "exit", _) => {
                info!("Server shutting down");
                self.request_shutdown();
                Vec::new()
            }
            ("help", _) => vec![
                "status | say <text> | time <h> <m> | date <d> <mo> | weather <name>".to_string(),
                "season <name> | kick <peer> | reset | quit".to_string(),
            ],
            _ => vec![format!("Unknown command: {line}")],
        }
    }

    fn status(&mut self) -> Vec<String> {
        let tick = self.ctx.tick;
        let w = &self.ctx.world.weather;
        let mut out = vec![
            format!("Tick: {tick}"),
            format!(
                "Weather: {:02}:{:02} {}/{} {} {}",
                w.time_hour, w.time_minute, w.date_day, w.date_month, w.weather_name, w.season
            ),
            format!("Entities: {}", self.ctx.store.len()),
            format!("Peers: {}", self.ctx.peers.len()),
        ];
        let ids = self.ctx.peers.ids();
        for peer in ids {
            let entity = self.ctx.store.lookup_by_peer(peer);
            if let Some(state) = self.ctx.peers.get_mut(peer) {
                let recent = state.recent_faults(tick);
                out.push(format!(
                    "  {peer}: entity={entity:?} idle={} malformed={} invalid={} unauthorized={} recent={recent}",
                    state.idle, state.malformed, state.invalid, state.unauthorized,
                ));
            }
        }
        out
    }
}

fn parse_peer(s: &str) -> Option<PeerId> {
    let raw = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => s.parse().ok()?,
    };
    Some(PeerId(raw))
}

/// Helper for tests: bind to an ephemeral local port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, ServerConfig)> {
    let cfg = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        tick_hz,
        ..ServerConfig::default()
    };
    let server = GameServer::bind(cfg.clone()).await?;
    let mut cfg = cfg;
    if let Some(addr) = server.local_addr() {
        cfg.bind_addr = addr.to_string();
    }
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::{
        ecs::Streamer,
        protocol::{ClientInput, HumanDespawn, Message},
    };

    use crate::transport::{loopback, LoopbackHub};

    fn server_with(cfg: ServerConfig) -> (GameServer, LoopbackHub) {
        let (transport, hub) = loopback(1024);
        (GameServer::new(cfg, Box::new(transport)).unwrap(), hub)
    }

    fn server() -> (GameServer, LoopbackHub) {
        server_with(ServerConfig::default())
    }

    #[test]
    fn join_sends_assignment_weather_and_self_spawn() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();

        let entity = server.context().store.lookup_by_peer(p).unwrap();
        let msgs = hub.take_messages(p);
        assert!(matches!(msgs[0], Message::AssignEntity(a) if a.entity == entity));
        assert!(matches!(msgs[1], Message::SetWeather(_)));
        assert!(matches!(msgs[2], Message::HumanSpawn(s) if s.entity == entity));
        assert_eq!(msgs.len(), 3);

        server.step().unwrap();
        assert!(matches!(hub.take_messages(p)[..], [Message::HumanUpdate(_)]));
    }

    #[test]
    fn disconnect_despawns_for_remaining_observers() {
        let (mut server, hub) = server();
        let (p1, p2) = (hub.connect().unwrap(), hub.connect().unwrap());
        server.step().unwrap();
        let e1 = server.context().store.lookup_by_peer(p1).unwrap();
        assert_eq!(server.context().store.get::<Streamer>(e1).observers.len(), 2);
        hub.clear();

        hub.disconnect(p1).unwrap();
        server.step().unwrap();
        assert!(!server.context().store.contains(e1));
        let despawns: Vec<_> = hub
            .take_messages(p2)
            .into_iter()
            .filter(|m| matches!(m, Message::HumanDespawn(HumanDespawn { entity }) if *entity == e1))
            .collect();
        assert_eq!(despawns.len(), 1);
        assert!(hub.take_delivered(p1).is_empty());
    }

    #[test]
    fn repeated_garbage_gets_a_peer_kicked() {
        let cfg = ServerConfig {
            max_faults: 2,
            ..ServerConfig::default()
        };
        let (mut server, hub) = server_with(cfg);
        let p = hub.connect().unwrap();
        server.step().unwrap();
        for _ in 0..3 {
            hub.send_frame(p, bytes::Bytes::from_static(&[250])).unwrap();
        }
        server.step().unwrap();
        assert!(!server.context().peers.is_connected(p));
        assert_eq!(hub.closed_by_server(), vec![p]);
    }

    #[test]
    fn failed_send_disconnects_next_tick() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        hub.fail_sends(p);
        server.step().unwrap();
        assert!(server.context().peers.is_connected(p));
        server.step().unwrap();
        assert!(!server.context().peers.is_connected(p));
        assert!(server.context().store.is_empty());
    }

    #[test]
    fn input_moves_the_owned_entity() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();
        let e = server.context().store.lookup_by_peer(p).unwrap();
        let input = ClientInput {
            entity: e,
            tick: 1,
            input_bits: 1,
            look: sync_shared::math::Quat::IDENTITY,
        };
        hub.send(p, &input).unwrap();
        server.step().unwrap();
        let pos = server
            .context()
            .store
            .get::<sync_shared::ecs::Transform>(e)
            .position;
        assert!(pos.x > 0.0);
    }

    #[test]
    fn idle_peer_has_input_cleared() {
        let cfg = ServerConfig {
            idle_ticks: 2,
            ..ServerConfig::default()
        };
        let (mut server, hub) = server_with(cfg);
        let p = hub.connect().unwrap();
        server.step().unwrap();
        let e = server.context().store.lookup_by_peer(p).unwrap();
        if let Some(sync) = server.context_mut().store.get_mut::<HumanSync>(e) {
            sync.input_bits = 1;
        }
        for _ in 0..4 {
            server.step().unwrap();
        }
        assert!(server.context().peers.is_idle(p));
        assert_eq!(server.context().store.get::<HumanSync>(e).input_bits, 0);
    }

    #[test]
    fn console_commands() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();
        hub.clear();

        assert_eq!(server.exec_console("time 14 30"), vec!["Time set to 14:30"]);
        assert_eq!(server.exec_console("time 25 0"), vec!["Usage: time <0-23> <0-59>"]);
        assert_eq!(server.exec_console("season fall"), vec!["Season set to autumn"]);
        assert!(server.exec_console("status").iter().any(|l| l.starts_with("Peers: 1")));
        server.exec_console("say hello all");
        server.step().unwrap();
        let msgs = hub.take_messages(p);
        assert!(msgs.contains(&Message::Chat(ChatMessage::new("hello all"))));

        assert_eq!(server.exec_console(&format!("kick {p}")), vec![format!("Kicked {p}")]);
        assert!(server.context().peers.is_empty());

        server.exec_console("quit");
        assert!(server.shutdown_requested());
    }

    #[test]
    fn world_reset_replaces_entities() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();
        let before = server.context().store.lookup_by_peer(p).unwrap();
        hub.clear();

        server.world_reset();
        server.step().unwrap();
        let after = server.context().store.lookup_by_peer(p).unwrap();
        assert_ne!(before, after);
        let msgs = hub.take_messages(p);
        assert!(msgs.contains(&Message::HumanDespawn(HumanDespawn { entity: before })));
        assert!(msgs.contains(&Message::AssignEntity(AssignEntity { entity: after })));
    }

    #[test]
    fn corrupted_ownership_is_fatal() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();
        let e = server.context().store.lookup_by_peer(p).unwrap();
        if let Some(s) = server.context_mut().store.get_mut::<Streamer>(e) {
            s.guid = PeerId(u64::MAX);
        }
        assert!(matches!(
            server.step(),
            Err(ServerError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn peer_ids_parse_hex_or_decimal() {
        assert_eq!(parse_peer("0x1f"), Some(PeerId(31)));
        assert_eq!(parse_peer("31"), Some(PeerId(31)));
        assert_eq!(parse_peer("zz"), None);
    }

    #[test]
    fn status_reports_fault_counts() {
        let (mut server, hub) = server();
        let p = hub.connect().unwrap();
        server.step().unwrap();
        hub.send_frame(p, bytes::Bytes::from_static(&[250])).unwrap();
        server.step().unwrap();
        let status = server.exec_console("status");
        let line = status
            .iter()
            .find(|l| l.trim_start().starts_with(&p.to_string()))
            .expect("peer line");
        assert!(line.contains("malformed=1"), "{line}");
        assert!(line.ends_with("recent=1"), "{line}");
    }
}