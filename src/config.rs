//! Runtime configuration for shard serving.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the per-shard serving loop. All fields default sensibly;
/// embedders typically deserialize this from their own config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the buffered channel between message pumps and the
    /// transaction loop.
    pub msg_buffer: usize,
    /// How often recorded hints are persisted to the consensus store
    /// while the shard is live.
    pub hint_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msg_buffer: 128,
            hint_interval: Duration::from_secs(300),
        }
    }
}
