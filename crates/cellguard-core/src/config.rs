use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling for a single framed line (1 MiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Longest piece of process output carried by one event (64 KiB); longer lines are
/// split into several events
pub const MAX_OUTPUT_CHUNK: usize = 64 * 1024;

/// Smallest transport line limit that still fits an event carrying a full output chunk,
/// assuming every byte is escaped as `\u00XX`
pub const MIN_MAX_LINE_LENGTH: usize = MAX_OUTPUT_CHUNK * 6 + 4096;

/// Timeouts and limits for the worker channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTimeouts {
    /// How long to wait for the worker's `OK` readiness line (in milliseconds)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Grace period given to tracked processes when the worker shuts down (in milliseconds)
    #[serde(default = "default_stop_timeout_ms")]
    pub default_stop_timeout_ms: u64,

    /// How long a ping may take before the worker counts as unresponsive (in milliseconds)
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Longest line accepted by the transport, in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            default_stop_timeout_ms: default_stop_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl ChannelTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timeouts for tests and local tooling
    pub fn fast() -> Self {
        Self {
            handshake_timeout_ms: 2_000,
            default_stop_timeout_ms: 500,
            ping_timeout_ms: 1_000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("handshake_timeout_ms must be greater than zero"));
        }

        if self.ping_timeout_ms == 0 {
            return Err(anyhow::anyhow!("ping_timeout_ms must be greater than zero"));
        }

        if self.max_line_length < MIN_MAX_LINE_LENGTH {
            return Err(anyhow::anyhow!(
                "max_line_length must be at least {MIN_MAX_LINE_LENGTH} bytes"
            ));
        }

        if self.default_stop_timeout_ms > 300_000 {
            return Err(anyhow::anyhow!(
                "default_stop_timeout_ms should not exceed 5 minutes"
            ));
        }

        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn default_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.default_stop_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Credentials the worker runs under (Unix only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Configuration used by the orchestrator to launch one sandbox worker
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct LauncherConfig {
    /// Path to the `cellguard-host` executable
    pub worker_executable: PathBuf,
    /// Identifier passed to the worker as its first argument
    pub sandbox_id: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    /// Parent directory for cgroup-based containment, forwarded to the worker
    #[builder(default)]
    pub cgroup_root: Option<PathBuf>,
    #[builder(default)]
    pub run_as: Option<RunAs>,
    #[builder(default)]
    pub timeouts: ChannelTimeouts,
}

impl LauncherConfig {
    pub fn builder() -> LauncherConfigBuilder {
        LauncherConfigBuilder::default()
    }
}

impl LauncherConfigBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_stop_timeout_ms() -> u64 {
    10_000
}
fn default_ping_timeout_ms() -> u64 {
    5_000
}
fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}
