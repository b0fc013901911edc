// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observe dispatcher configuration.
//!
//! Supports both programmatic and TOML file configuration:
//!
//! ```toml
//! response_timeout_ms = 2000
//! max_retransmit = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::message::HEADER_SIZE;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retransmission and queueing parameters for confirmable delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserveConfig {
    /// Time to wait for an ACK before retransmitting (milliseconds).
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Retransmissions after the first send. 0 = one send, one wait.
    #[serde(default)]
    pub max_retransmit: u32,

    /// Dispatcher command queue depth.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Per-subscriber inbound transmission queue depth.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,

    /// Largest datagram accepted by the endpoint and client (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_command_capacity() -> usize {
    64
}

fn default_inbound_capacity() -> usize {
    32
}

fn default_max_message_size() -> usize {
    1152
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            max_retransmit: 0,
            command_capacity: default_command_capacity(),
            inbound_capacity: default_inbound_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ObserveConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the ACK wait interval.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retransmission budget.
    pub fn max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }

    /// ACK wait interval as a Duration.
    pub fn response_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "response_timeout_ms cannot be 0".into(),
            ));
        }
        if self.command_capacity == 0 {
            return Err(ConfigError::Invalid("command_capacity cannot be 0".into()));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid("inbound_capacity cannot be 0".into()));
        }
        if self.max_message_size < HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be >= {}",
                HEADER_SIZE
            )));
        }
        Ok(())
    }
}
