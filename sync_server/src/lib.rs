//! `sync_server`
//!
//! Authoritative multiplayer core:
//! - Fixed timestep loop with strict phase order
//! - RPC registry routing client frames to typed handlers
//! - Relevance-based entity streaming
//! - World weather singleton
//! - Script event bridge with a JSON bundle host
//!
//! Networking model:
//! - The core talks to a [`transport::Transport`] only
//! - TCP and in-process loopback transports are provided

pub mod bundle;
pub mod context;
pub mod error;
pub mod mutation;
pub mod outbox;
pub mod peers;
pub mod rpc;
pub mod scripting;
pub mod server;
pub mod streamer;
pub mod transport;
pub mod world;

pub use context::ServerContext;
pub use error::ServerError;
pub use server::GameServer;
