//! `sync_shared`
//!
//! Libraries used by both the authoritative server and clients.
//!
//! Design goals:
//! - Deterministic where practical (ordered storages, fixed-step movement).
//! - One codec walk per wire type, shared by encode and decode.
//! - No `unsafe`.

pub mod bitstream;
pub mod chat;
pub mod config;
pub mod ecs;
pub mod math;
pub mod movement;
pub mod net;
pub mod protocol;
pub mod weather;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bitstream::*;
    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::math::*;
    pub use crate::movement::*;
    pub use crate::protocol::*;
    pub use crate::weather::*;
}
