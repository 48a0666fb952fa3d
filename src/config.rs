//! Server configuration.
//!
//! One plain-data struct carries every tunable the server has. The defaults
//! reproduce the wire format and layout constants the client programs are
//! built against (320x240 cells, 30 fps, 500 kbit/s H.264), so overriding
//! anything other than the port is only useful for tests and experiments.

use std::time::Duration;

/// Default UDP port clients connect to.
pub const DEFAULT_PORT: u16 = 27884;

/// Configuration for a [`Server`](crate::server::Server) instance and its
/// composite pipeline.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP port the client-facing socket binds to.
    pub port: u16,

    /// Maximum number of concurrent publishers; also the number of pipeline
    /// inputs and grid slots created at startup. Fixed for the process
    /// lifetime.
    pub max_clients: usize,

    /// Width of one grid cell in pixels.
    pub cell_width: u32,

    /// Height of one grid cell in pixels.
    pub cell_height: u32,

    /// Display aspect ratio the grid growth steers toward.
    pub target_aspect: f32,

    /// Composite framerate and the framerate publishers are normalized to.
    pub framerate: u32,

    /// Composite encoder bitrate in kbit/s.
    pub bitrate_kbps: u32,

    /// A client silent for longer than this is eligible for eviction.
    pub idle_limit: Duration,

    /// Interval between liveness sweeps.
    pub sweep_period: Duration,

    /// Receive buffer size for one datagram.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_clients: 9,
            cell_width: 320,
            cell_height: 240,
            target_aspect: 16.0 / 9.0,
            framerate: 30,
            bitrate_kbps: 500,
            idle_limit: Duration::from_secs(2),
            sweep_period: Duration::from_secs(8),
            buffer_size: 4096,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration, returning a human-readable reason on
    /// failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.cell_width == 0 || self.cell_height == 0 {
            return Err(format!(
                "cell dimensions must be non-zero (got {}x{})",
                self.cell_width, self.cell_height
            ));
        }
        if !self.target_aspect.is_finite() || self.target_aspect <= 0.0 {
            return Err(format!(
                "target_aspect must be a positive finite ratio (got {})",
                self.target_aspect
            ));
        }
        if self.framerate == 0 {
            return Err("framerate must be greater than 0".to_string());
        }
        if self.bitrate_kbps == 0 {
            return Err("bitrate must be greater than 0".to_string());
        }
        if self.buffer_size < 1500 {
            return Err(format!(
                "buffer_size must hold at least one MTU-sized datagram (got {})",
                self.buffer_size
            ));
        }
        Ok(())
    }
}
