// config.rs - Engine configuration

//! Startup configuration.
//!
//! Every section has working defaults. `EngineConfig::load` layers an optional
//! file (TOML, YAML or JSON by extension) and `CNET__*` environment variables
//! on top, e.g. `CNET__PARTICIPANT__BID_DELAY_MS=250`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::network::TransportConfig;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Contract-net initiator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Publisher topic the participants subscribe to
    pub participant_topic: String,
    /// Longest wait for all proposals before deciding on what arrived
    pub collection_window_ms: u64,
    /// Longest wait for the winner's INFORM after the award
    pub completion_timeout_ms: u64,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            participant_topic: String::from("machine"),
            collection_window_ms: 5_000,
            completion_timeout_ms: 10_000,
        }
    }
}

impl InitiatorConfig {
    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

/// Contract-net participant settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Delay between receiving a CFP and answering it
    pub bid_delay_ms: u64,
    pub bid_min: f64,
    pub bid_max: f64,
    /// Give up on a proposal nobody answered after this long
    pub award_timeout_ms: u64,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            bid_delay_ms: 1_000,
            bid_min: 100.0,
            bid_max: 500.0,
            award_timeout_ms: 15_000,
        }
    }
}

impl ParticipantConfig {
    pub fn bid_delay(&self) -> Duration {
        Duration::from_millis(self.bid_delay_ms)
    }

    pub fn award_timeout(&self) -> Duration {
        Duration::from_millis(self.award_timeout_ms)
    }
}

/// Organization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationConfig {
    pub name: String,
    /// Actor mailbox capacity per agent
    pub mailbox_capacity: usize,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            name: String::from("organization"),
            mailbox_capacity: 64,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub initiator: InitiatorConfig,
    pub participant: ParticipantConfig,
    pub organization: OrganizationConfig,
}

impl EngineConfig {
    /// Defaults, then `path` if given, then `CNET__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("CNET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = (self.participant.bid_min, self.participant.bid_max);
        if !(min.is_finite() && max.is_finite() && (max - min).is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "bid range {min}..{max} must be finite with a finite span"
            )));
        }
        if self.participant.bid_min > self.participant.bid_max {
            return Err(ConfigError::Invalid(format!(
                "bid_min {} exceeds bid_max {}",
                self.participant.bid_min, self.participant.bid_max
            )));
        }
        if self.initiator.participant_topic.is_empty() {
            return Err(ConfigError::Invalid("participant_topic is empty".into()));
        }
        if self.transport.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        if self.transport.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("idle_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
