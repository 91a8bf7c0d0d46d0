//! `sync_client`
//!
//! Headless client:
//! - Framed TCP connection to the server
//! - Input sampling and `ClientInput` generation
//! - Local mirror of replicated humans and world weather

pub mod client;
pub mod input;
pub mod mirror;

pub use client::GameClient;
