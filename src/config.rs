//! Relay configuration.
//!
//! A single JSON file holds the channel lists and every tunable threshold.
//! All fields except the channel lists have defaults, so a minimal config is
//! just `sources` and `destinations`. The file path comes from the
//! `RELAY_CONFIG` environment variable (default `relay.json`); `RELAY_STATE_DIR`
//! overrides the state directory without touching the file.
//!
//! The reconciler re-reads the file periodically, so channel-list edits take
//! effect without a restart. Threshold changes still require one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::BackoffConfig;
use crate::retry::RetryConfig;
use crate::types::ChannelId;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

/// Environment variable overriding `state_dir`.
pub const STATE_DIR_ENV: &str = "RELAY_STATE_DIR";

const DEFAULT_CONFIG_PATH: &str = "relay.json";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config has no source channels")]
    NoSources,

    #[error("config has no destination channels")]
    NoDestinations,

    #[error("config field {field} must be a non-negative finite number, got {value}")]
    InvalidNumber { field: &'static str, value: f64 },
}

/// Polling cadence and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Maximum messages fetched per poll call.
    pub page_limit: usize,
    /// Pause between polls of consecutive channels within one cycle.
    pub channel_gap_secs: f64,
    /// Base pause between full poll cycles of one channel.
    pub cycle_interval_secs: f64,
    /// Uniform jitter added to the cycle interval, in seconds.
    pub cycle_jitter_secs: f64,
    /// Consecutive non-rate-limit errors before a channel is skipped until
    /// the next reconciliation.
    pub error_threshold: u32,
    /// How often the channel list is synced against the config file.
    pub reconcile_interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            page_limit: 100,
            channel_gap_secs: 1.0,
            cycle_interval_secs: 10.0,
            cycle_jitter_secs: 3.0,
            error_threshold: 5,
            reconcile_interval_secs: 60,
        }
    }
}

impl PollSettings {
    pub fn channel_gap(&self) -> Duration {
        Duration::from_secs_f64(self.channel_gap_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_interval_secs)
    }

    pub fn cycle_jitter(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_jitter_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Forwarding pace and retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSettings {
    /// Minimum gap between consecutive sends to one destination.
    pub min_spacing_secs: f64,
    /// Uniform jitter added to the minimum gap, in seconds.
    pub spacing_jitter_secs: f64,
    /// Send attempts after the first failure.
    pub max_retries: u32,
    /// First retry delay, in seconds; doubles per attempt.
    pub initial_retry_delay_secs: f64,
    /// Upper bound on any computed retry delay.
    pub max_retry_delay_secs: f64,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        ForwardSettings {
            min_spacing_secs: 15.0,
            spacing_jitter_secs: 5.0,
            max_retries: 3,
            initial_retry_delay_secs: 2.0,
            max_retry_delay_secs: 60.0,
        }
    }
}

impl ForwardSettings {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs_f64(self.min_spacing_secs)
    }

    pub fn spacing_jitter(&self) -> Duration {
        Duration::from_secs_f64(self.spacing_jitter_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_secs_f64(self.initial_retry_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_retry_delay_secs),
            ..RetryConfig::DEFAULT
        }
    }
}

/// Deduplication and download limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSettings {
    /// Maximum stored fingerprint records.
    pub hash_capacity: usize,
    /// Quiet period before a media group is considered complete, in seconds.
    pub group_debounce_secs: f64,
    /// Items reported larger than this skip fingerprinting and route to the
    /// dump destination instead.
    pub oversize_threshold_bytes: u64,
    /// How much of a video is downloaded for fingerprinting.
    pub video_sample_bytes: u64,
    /// Caption length limit after transformation.
    pub max_caption_chars: usize,
}

impl Default for ContentSettings {
    fn default() -> Self {
        ContentSettings {
            hash_capacity: 500,
            group_debounce_secs: 2.0,
            oversize_threshold_bytes: 20 * 1024 * 1024,
            video_sample_bytes: 20 * 1024 * 1024,
            max_caption_chars: 1024,
        }
    }
}

impl ContentSettings {
    pub fn group_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.group_debounce_secs)
    }
}

/// Queue backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub backoff_growth: f64,
    pub backoff_decay: f64,
    /// Cadence of the backoff decay tick.
    pub decay_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            initial_backoff_secs: 5.0,
            max_backoff_secs: 300.0,
            backoff_growth: 2.0,
            backoff_decay: 0.5,
            decay_interval_secs: 60,
        }
    }
}

impl QueueSettings {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs_f64(self.initial_backoff_secs),
            max: Duration::from_secs_f64(self.max_backoff_secs),
            growth: self.backoff_growth,
            decay: self.backoff_decay,
        }
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

/// The full relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Channels to watch.
    pub sources: Vec<ChannelId>,

    /// Channels every surviving post forwards to.
    pub destinations: Vec<ChannelId>,

    /// Where rejected and oversize content is routed, if anywhere.
    #[serde(default)]
    pub dump_destination: Option<ChannelId>,

    /// Case-insensitive substrings that reject a whole batch.
    #[serde(default)]
    pub banned_words: Vec<String>,

    /// Directory for the offset map and fingerprint index files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub forward: ForwardSettings,

    #[serde(default)]
    pub content: ContentSettings,

    #[serde(default)]
    pub queue: QueueSettings,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl RelayConfig {
    /// The config file path: `RELAY_CONFIG` or `relay.json`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Loads and validates the config file, applying environment overrides.
    pub fn load(path: &Path) -> Result<RelayConfig, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: RelayConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;

        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            config.state_dir = PathBuf::from(dir);
        }

        if config.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if config.destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        config.validate_numbers()?;
        Ok(config)
    }

    /// Rejects values that would panic in `Duration::from_secs_f64` or
    /// `Duration::mul_f64` later: negatives, NaN, infinities.
    fn validate_numbers(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, f64); 12] = [
            ("poll.channel_gap_secs", self.poll.channel_gap_secs),
            ("poll.cycle_interval_secs", self.poll.cycle_interval_secs),
            ("poll.cycle_jitter_secs", self.poll.cycle_jitter_secs),
            ("forward.min_spacing_secs", self.forward.min_spacing_secs),
            ("forward.spacing_jitter_secs", self.forward.spacing_jitter_secs),
            (
                "forward.initial_retry_delay_secs",
                self.forward.initial_retry_delay_secs,
            ),
            (
                "forward.max_retry_delay_secs",
                self.forward.max_retry_delay_secs,
            ),
            ("content.group_debounce_secs", self.content.group_debounce_secs),
            ("queue.initial_backoff_secs", self.queue.initial_backoff_secs),
            ("queue.max_backoff_secs", self.queue.max_backoff_secs),
            ("queue.backoff_growth", self.queue.backoff_growth),
            ("queue.backoff_decay", self.queue.backoff_decay),
        ];
        for (field, value) in checks {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidNumber { field, value });
            }
        }
        Ok(())
    }

    pub fn offsets_path(&self) -> PathBuf {
        self.state_dir.join("offsets.json")
    }

    pub fn hash_index_path(&self) -> PathBuf {
        self.state_dir.join("hash_index.json")
    }
}
