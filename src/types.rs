//! Shared types and limits for WireStorm

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ==================== DIRECTION ====================

/// Traffic direction through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client → upstream server
    ClientToServer,
    /// Upstream server → client
    ServerToClient,
}

impl Direction {
    /// Stable numeric coordinate for the deterministic RNG
    pub fn as_u8(self) -> u8 {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }

    /// The opposite direction
    pub fn flip(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// Short label for log fields
    pub fn label(self) -> &'static str {
        match self {
            Direction::ClientToServer => "c2s",
            Direction::ServerToClient => "s2c",
        }
    }
}

// ==================== PROFILES ====================

/// Fault knobs for one direction of traffic
///
/// Rates are probabilities in [0, 1]; durations are milliseconds.
/// Values are clamped to [`ConfigLimits`] when stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionalProfile {
    /// Base injected latency (ms)
    pub latency_ms: u32,
    /// Jitter amplitude around the base latency (ms)
    pub jitter_ms: u32,
    /// Bandwidth cap (kbit/s), 0 = unlimited
    pub throttle_kbps: u32,
    /// Probability a packet is silently dropped
    pub drop_rate: f32,
    /// Probability a packet stalls the direction
    pub stall_probability: f32,
    /// Probability a single byte is corrupted
    pub corrupt_rate: f32,
    /// Reordering is realized by jitter; knob kept for the control API
    pub reorder_rate: f32,
    /// Probability the opposite write side is half-closed
    pub half_close_rate: f32,
}

/// Bidirectional fault profile with a store-assigned version
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyProfile {
    pub client_to_server: DirectionalProfile,
    pub server_to_client: DirectionalProfile,
    /// Monotone version assigned by the config store on every set
    pub version: u32,
}

impl AnomalyProfile {
    /// The profile for one direction
    pub fn direction(&self, dir: Direction) -> &DirectionalProfile {
        match dir {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }
}

// ==================== LIMITS ====================

/// Hard limits applied when profiles and configs are stored
pub struct ConfigLimits;

impl ConfigLimits {
    pub const MAX_LATENCY_MS: u32 = 30_000;
    pub const MAX_JITTER_MS: u32 = 10_000;
    /// 1 Gbit/s
    pub const MAX_THROTTLE_KBPS: u32 = 1_000_000;
    pub const MAX_RATE: f32 = 1.0;
    pub const MAX_SESSIONS: usize = 10_000;
    pub const SOFT_LIMIT_PERCENT: usize = 90;
    /// Successful profile mutations per one-second window
    pub const CONFIG_UPDATE_RATE_LIMIT: u32 = 10;
}

// ==================== SERVER CONFIG ====================

/// Process-wide server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub control_port: u16,
    /// Seed for the deterministic anomaly RNG
    pub global_seed: u64,

    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub stall_timeout: Duration,
    pub min_linger: Duration,
    pub max_linger: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 9000,
            control_port: 9090,
            global_seed: 0,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            min_linger: Duration::from_secs(2),
            max_linger: Duration::from_secs(120),
        }
    }
}

// ==================== CHANNEL STATE ====================

/// Four-way half-close tracking
///
/// Each side transitions Open → Closed at most once and never re-opens.
#[derive(Debug, Clone, Copy)]
pub struct ChannelState {
    pub client_read_open: bool,
    pub client_write_open: bool,
    pub server_read_open: bool,
    pub server_write_open: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            client_read_open: true,
            client_write_open: true,
            server_read_open: true,
            server_write_open: true,
        }
    }
}

impl ChannelState {
    pub fn fully_closed(&self) -> bool {
        !self.client_read_open
            && !self.client_write_open
            && !self.server_read_open
            && !self.server_write_open
    }

    /// Read side of the source transport for a flow direction
    pub fn read_open(&self, dir: Direction) -> bool {
        match dir {
            Direction::ClientToServer => self.client_read_open,
            Direction::ServerToClient => self.server_read_open,
        }
    }

    /// Write side of the destination transport for a flow direction
    pub fn write_open(&self, dir: Direction) -> bool {
        match dir {
            Direction::ClientToServer => self.server_write_open,
            Direction::ServerToClient => self.client_write_open,
        }
    }
}

/// Upstream connection progress: Connecting → Connected | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Connecting,
    Connected,
    Failed,
}
