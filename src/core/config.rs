/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::core::error::{HsmError, HsmResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Largest single DMA transfer the engine accepts (2 MB - 1).
pub const DMA_MAX_LENGTH: usize = 0x001F_FFFF;
/// Smallest transfer limit that still leaves room for the signature hash loop.
pub const MIN_TRANSFER_LENGTH: usize = 1024;

/// How a driver call completes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnBehavior {
    /// The call returns at once and the result is delivered to a callback.
    Callback = 1,
    /// The caller suspends until the engine signals completion.
    #[default]
    Blocking = 2,
    /// The caller spins on the mailbox until the result arrives.
    Polling = 4,
}

impl FromStr for ReturnBehavior {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "callback" => Ok(ReturnBehavior::Callback),
            "blocking" => Ok(ReturnBehavior::Blocking),
            "polling" => Ok(ReturnBehavior::Polling),
            other => Err(HsmError::invalid(format!("unknown return behavior '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Default behavior for new operation contexts. `Callback` only takes
    /// effect once a context has a callback registered with `with_callback`;
    /// until then that context completes its calls blocking.
    pub return_behavior: ReturnBehavior,
    /// Engine lock timeout; `None` waits forever
    pub lock_timeout: Option<Duration>,
    /// How long to wait for a single result token
    pub result_timeout: Duration,
    /// Largest payload carried by one token
    pub max_transfer_len: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            return_behavior: ReturnBehavior::Blocking,
            lock_timeout: None,
            result_timeout: Duration::from_secs(10),
            max_transfer_len: DMA_MAX_LENGTH,
        }
    }
}

impl DriverConfig {
    pub fn with_return_behavior(mut self, behavior: ReturnBehavior) -> Self {
        self.return_behavior = behavior;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn with_max_transfer_len(mut self, len: usize) -> Self {
        self.max_transfer_len = len;
        self
    }

    pub fn validate(&self) -> HsmResult<()> {
        if !(MIN_TRANSFER_LENGTH..=DMA_MAX_LENGTH).contains(&self.max_transfer_len) {
            return Err(HsmError::invalid(format!(
                "max_transfer_len must be within {}..={}, got {}",
                MIN_TRANSFER_LENGTH, DMA_MAX_LENGTH, self.max_transfer_len
            )));
        }
        if self.result_timeout.is_zero() {
            return Err(HsmError::invalid("result_timeout must be non-zero"));
        }
        Ok(())
    }

    /// Reads overrides from `HSM_RETURN_BEHAVIOR`, `HSM_LOCK_TIMEOUT_MS`,
    /// `HSM_RESULT_TIMEOUT_MS` and `HSM_MAX_TRANSFER`.
    pub fn from_env() -> HsmResult<Self> {
        let mut config = DriverConfig::default();

        if let Ok(val) = env::var("HSM_RETURN_BEHAVIOR") {
            config.return_behavior = val.parse()?;
        }
        if let Some(ms) = env_number("HSM_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Some(Duration::from_millis(ms as u64));
        }
        if let Some(ms) = env_number("HSM_RESULT_TIMEOUT_MS")? {
            config.result_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(len) = env_number("HSM_MAX_TRANSFER")? {
            config.max_transfer_len = len;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_number(key: &str) -> HsmResult<Option<usize>> {
    match env::var(key) {
        Ok(val) => {
            let trimmed = val.trim();
            let parsed = match trimmed.strip_prefix("0x") {
                Some(hex) => usize::from_str_radix(hex, 16),
                None => trimmed.parse::<usize>(),
            };
            parsed
                .map(Some)
                .map_err(|_| HsmError::invalid(format!("{} is not a number: '{}'", key, val)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.return_behavior, ReturnBehavior::Blocking);
        assert_eq!(config.max_transfer_len, DMA_MAX_LENGTH);
    }

    #[test]
    fn test_transfer_bounds() {
        let config = DriverConfig::default().with_max_transfer_len(512);
        assert!(matches!(config.validate(), Err(HsmError::InvalidArgument(_))));
        let config = DriverConfig::default().with_max_transfer_len(DMA_MAX_LENGTH + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_behavior() {
        assert_eq!(
            "Polling".parse::<ReturnBehavior>(),
            Ok(ReturnBehavior::Polling)
        );
        assert!("interrupt".parse::<ReturnBehavior>().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        // Only test in this binary that touches these variables.
        unsafe {
            env::set_var("HSM_RETURN_BEHAVIOR", "polling");
            env::set_var("HSM_LOCK_TIMEOUT_MS", "250");
            env::set_var("HSM_MAX_TRANSFER", "0x800");
        }
        let config = DriverConfig::from_env().unwrap();
        assert_eq!(config.return_behavior, ReturnBehavior::Polling);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_transfer_len, 0x800);

        unsafe { env::set_var("HSM_MAX_TRANSFER", "lots") };
        assert!(matches!(DriverConfig::from_env(), Err(HsmError::InvalidArgument(_))));

        unsafe {
            env::remove_var("HSM_RETURN_BEHAVIOR");
            env::remove_var("HSM_LOCK_TIMEOUT_MS");
            env::remove_var("HSM_MAX_TRANSFER");
        }
    }
}
