// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for CoAP transport and observe dispatch.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for CoAP operations.
pub type CoapResult<T> = Result<T, CoapError>;

/// Errors surfaced by the transport, codec, client and dispatcher handle.
#[derive(Debug, Error)]
pub enum CoapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address resolution failed: {0}")]
    Resolve(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("No message received within {0:?}")]
    Timeout(Duration),

    #[error("Dispatcher is not running")]
    DispatcherClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoapError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = CoapError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "No message received within 250ms");

        let err = CoapError::malformed("token length 9");
        assert_eq!(err.to_string(), "Malformed message: token length 9");
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: CoapError = io.into();
        assert!(matches!(err, CoapError::Io(_)));
    }
}
