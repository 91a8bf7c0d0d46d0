//! Configuration system.
//!
//! Loads server and client configuration from JSON strings/files. Every field
//! has a default so partial files are fine; binaries layer CLI flags on top.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::movement::MovementConfig;

/// Authoritative server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:27015`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// JSON script bundle to install at boot.
    #[serde(default)]
    pub script_bundle: Option<PathBuf>,
    /// Faults tolerated inside one window before a peer is disconnected.
    #[serde(default = "default_max_faults")]
    pub max_faults: u32,
    /// Rolling fault window, in ticks.
    #[serde(default = "default_window_ticks")]
    pub fault_window_ticks: u64,
    /// Ticks without input before a peer counts as idle.
    #[serde(default = "default_window_ticks")]
    pub idle_ticks: u64,
    /// Relevance radius given to new player entities.
    #[serde(default = "default_relevance_radius")]
    pub default_relevance_radius: f32,
    /// Capacity of the transport → core event queue.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Capacity of each per-peer core → transport queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,
    #[serde(default = "default_sprint_multiplier")]
    pub sprint_multiplier: f32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:27015".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_max_faults() -> u32 {
    16
}

fn default_window_ticks() -> u64 {
    300
}

fn default_relevance_radius() -> f32 {
    100.0
}

fn default_inbound_capacity() -> usize {
    4096
}

fn default_outbound_capacity() -> usize {
    1024
}

fn default_move_speed() -> f32 {
    5.0
}

fn default_sprint_multiplier() -> f32 {
    2.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tick_hz: default_tick_hz(),
            script_bundle: None,
            max_faults: default_max_faults(),
            fault_window_ticks: default_window_ticks(),
            idle_ticks: default_window_ticks(),
            default_relevance_radius: default_relevance_radius(),
            inbound_capacity: default_inbound_capacity(),
            outbound_capacity: default_outbound_capacity(),
            move_speed: default_move_speed(),
            sprint_multiplier: default_sprint_multiplier(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Seconds per tick.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }

    pub fn movement(&self) -> MovementConfig {
        MovementConfig {
            move_speed: self.move_speed,
            sprint_multiplier: self.sprint_multiplier,
        }
    }
}

/// Headless client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:27015`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Input send rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:27015".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
