//! Client implementation.
//!
//! The client maintains:
//! - A framed TCP connection; a background task reads frames into a queue
//! - A local mirror of spawned humans, weather and chat
//! - Per-tick input generation for the entity the server assigned

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use bytes::Bytes;
use sync_shared::{
    config::ClientConfig,
    net::{FrameWriter, FramedConn},
    protocol::{ChatMessage, ClientInput, Message, Payload},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    input::{build_input, InputState},
    mirror::WorldMirror,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// High-level game client.
pub struct GameClient {
    pub state: ClientState,
    pub mirror: WorldMirror,
    writer: FrameWriter,
    frames: mpsc::Receiver<Bytes>,
    reader_task: JoinHandle<()>,
    server_addr: SocketAddr,
    tick: u32,
}

impl GameClient {
    /// Connects to a server.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        info!(server = %cfg.server_addr, "Connecting to server");
        let conn = FramedConn::connect(&cfg.server_addr).await?;
        let server_addr = conn.peer_addr().context("peer_addr")?;
        let (mut reader, writer) = conn.into_split();

        let (tx, rx) = mpsc::channel(1024);
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "server stream ended");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            state: ClientState::Connected,
            mirror: WorldMirror::default(),
            writer,
            frames: rx,
            reader_task,
            server_addr,
            tick: 0,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        match Message::decode(frame) {
            Ok(msg) => self.mirror.apply(msg),
            Err(e) => warn!(error = %e, "undecodable frame from server"),
        }
    }

    /// Applies every frame received so far. Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut n = 0;
        loop {
            match self.frames.try_recv() {
                Ok(frame) => {
                    self.handle_frame(&frame);
                    n += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if self.state == ClientState::Connected {
                        info!("Disconnected from server");
                    }
                    self.state = ClientState::Disconnected;
                    break;
                }
            }
        }
        n
    }

    /// Applies frames until `done` holds for the mirror or the timeout passes.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&WorldMirror) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if done(&self.mirror) {
                return true;
            }
            if self.state == ClientState::Disconnected {
                return false;
            }
            match tokio::time::timeout_at(deadline, self.frames.recv()).await {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => self.state = ClientState::Disconnected,
                Err(_) => return done(&self.mirror),
            }
        }
    }

    async fn send<P: Payload>(&mut self, payload: &P) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            bail!("not connected");
        }
        self.writer.send(&payload.encode()).await
    }

    /// Sends this tick's input for the assigned entity. `None` until the
    /// server has assigned one.
    pub async fn send_input(&mut self, input: InputState) -> anyhow::Result<Option<ClientInput>> {
        let Some(entity) = self.mirror.own_entity else {
            return Ok(None);
        };
        let cmd = build_input(entity, self.tick, input);
        self.send(&cmd).await?;
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(cmd))
    }

    pub async fn send_chat(&mut self, text: &str) -> anyhow::Result<()> {
        let msg = ChatMessage::new(text);
        if !msg.validate() {
            bail!("chat message must be 1..=1023 bytes");
        }
        self.send(&msg).await
    }

    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.state = ClientState::Disconnected;
        self.reader_task.abort();
        self.writer.shutdown().await
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = vec![
                    format!("State: {:?}", self.state),
                    format!("Server: {}", self.server_addr),
                    format!("Tick: {}", self.tick),
                    format!("Entity: {:?}", self.mirror.own_entity),
                    format!("Humans in view: {}", self.mirror.humans.len()),
                ];
                if let Some(w) = &self.mirror.weather {
                    out.push(format!(
                        "Weather: {:02}:{:02} {}/{} {} {}",
                        w.time_hour, w.time_minute, w.date_day, w.date_month, w.weather_name, w.season
                    ));
                }
                Ok(out)
            }
            "say" => {
                let text = tokens[1..].join(" ");
                self.send_chat(&text).await?;
                Ok(Vec::new())
            }
            "disconnect" => {
                self.disconnect().await?;
                Ok(vec!["Disconnected".to_string()])
            }
            _ => {
                // Everything else goes to the server as a chat command.
                self.send_chat(&format!("/{line}")).await?;
                Ok(Vec::new())
            }
        }
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::{
        ecs::EntityId,
        math::Vec3,
        protocol::{AssignEntity, HumanSpawn},
    };
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn mirrors_frames_and_sends_input_for_assigned_entity() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let entity = EntityId(3);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut conn = FramedConn::new(stream);
            conn.send(&AssignEntity { entity }.encode()).await?;
            conn.send(
                &HumanSpawn {
                    entity,
                    spawn_profile: 9,
                    position: Vec3::new(1.0, 2.0, 3.0),
                }
                .encode(),
            )
            .await?;
            let frame = conn.recv().await?;
            Ok::<_, anyhow::Error>(Message::decode(&frame)?)
        });

        let cfg = ClientConfig {
            server_addr: addr.to_string(),
            tick_hz: 60,
        };
        let mut client = GameClient::connect(&cfg).await?;
        assert!(client.send_input(InputState::default()).await?.is_none());
        assert!(
            client
                .wait_for(Duration::from_secs(5), |m| m.own().is_some())
                .await
        );
        assert_eq!(client.mirror.own().map(|h| h.spawn_profile), Some(9));

        let sent = client
            .send_input(InputState {
                forward: 1.0,
                ..Default::default()
            })
            .await?
            .expect("entity assigned");
        assert_eq!(sent.entity, entity);
        assert_eq!(server.await??, Message::ClientInput(sent));

        // The fake server hung up after reading one frame.
        assert!(!client.wait_for(Duration::from_secs(5), |_| false).await);
        assert_eq!(client.state, ClientState::Disconnected);
        assert!(client.send_chat("late").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn chat_length_is_checked_before_sending() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let cfg = ClientConfig {
            server_addr: listener.local_addr()?.to_string(),
            tick_hz: 60,
        };
        let mut client = GameClient::connect(&cfg).await?;
        assert!(client.send_chat("").await.is_err());
        assert!(client.send_chat(&"a".repeat(1024)).await.is_err());
        assert!(client.send_chat("ok").await.is_ok());
        Ok(())
    }
}
