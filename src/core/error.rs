/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Driver error types

use thiserror::Error;

/// Result type for driver operations
pub type HsmResult<T> = Result<T, HsmError>;

/// Errors surfaced by the driver.
///
/// Validation errors (`InvalidArgument`, `BadState`, `BufferTooSmall`) are raised
/// before any token reaches the engine. Verification failures are successful
/// round-trips with a negative cryptographic outcome and never count as hardware
/// faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HsmError {
    /// Null, zero-length, oversized or otherwise malformed parameter
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Call issued in the wrong phase of an operation
    #[error("Operation not allowed in phase {0}")]
    BadState(&'static str),

    /// Caller buffer cannot hold the engine output
    #[error("Buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Engine lock could not be acquired in time
    #[error("Engine lock unavailable")]
    ResourceUnavailable,

    /// Mailbox could not accept a token, or an asset could not be provisioned
    #[error("Engine resource error: {0}")]
    ResourceError(String),

    /// Engine returned an unexpected negative result
    #[error("Engine reported error code {0}")]
    HardwareError(i8),

    /// No result token arrived before the deadline
    #[error("Timed out waiting for the engine")]
    Timeout,

    #[error("MAC verification failed")]
    MacInvalid,

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Public key is not a valid curve point")]
    PublicKeyNotOnCurve,

    /// Unsupported algorithm or key-type combination
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Key retrieval collaborator failed
    #[error("Key store error: {0}")]
    KeyStore(String),
}

impl HsmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        HsmError::InvalidArgument(msg.into())
    }

    /// True for a completed round-trip whose cryptographic check failed.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            HsmError::MacInvalid | HsmError::InvalidSignature | HsmError::PublicKeyNotOnCurve
        )
    }

    /// Check if retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HsmError::ResourceUnavailable | HsmError::ResourceError(_) | HsmError::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_failures_are_not_recoverable() {
        assert!(HsmError::MacInvalid.is_verification_failure());
        assert!(HsmError::InvalidSignature.is_verification_failure());
        assert!(!HsmError::MacInvalid.is_recoverable());
        assert!(!HsmError::HardwareError(-13).is_verification_failure());
        assert!(HsmError::ResourceUnavailable.is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = HsmError::BufferTooSmall {
            needed: 16,
            available: 4,
        };
        assert_eq!(err.to_string(), "Buffer too small: need 16 bytes, got 4");
        assert_eq!(
            HsmError::HardwareError(-4).to_string(),
            "Engine reported error code -4"
        );
    }
}
