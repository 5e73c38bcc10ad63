//! Retry backoff and submission error classification

use crate::config::RelayerConfig;

use rand::Rng;
use std::time::Duration;

/// Jittered exponential backoff between attempts of one record
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RelayerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            cap: Duration::from_millis(config.retry_cap_ms.max(config.retry_base_ms)),
        }
    }

    /// Un-jittered delay after `attempts` failed attempts (1-indexed)
    pub fn ceiling_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap)
    }

    /// Delay drawn from the upper half of the ceiling
    pub fn backoff_for_attempt(&self, attempts: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempts).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

/// Classifies submission errors for nonce and replacement decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Fee too low for the pool or for replacing a pending transaction
    Underpriced,
    /// This exact transaction is already in the pool
    AlreadyKnown,
    /// Nonce already used by a mined transaction
    NonceTooLow,
    /// Nonce gap ahead of the account
    NonceTooHigh,
    /// Signer cannot pay for gas
    InsufficientFunds,
    Unknown,
}

impl ErrorClass {
    /// The local nonce counter disagrees with the chain
    pub fn needs_nonce_resync(&self) -> bool {
        matches!(self, ErrorClass::NonceTooLow | ErrorClass::NonceTooHigh)
    }
}

/// Classify an error message returned by a node
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("already known") || error_lower.contains("known transaction") {
        return ErrorClass::AlreadyKnown;
    }

    // Gas price errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
        || error_lower.contains("fee too low")
    {
        return ErrorClass::Underpriced;
    }

    // Nonce errors
    if error_lower.contains("nonce too low") || error_lower.contains("already been used") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    if error_lower.contains("insufficient funds") {
        return ErrorClass::InsufficientFunds;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    ErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling_for_attempt(5), Duration::from_secs(32));
        assert_eq!(policy.ceiling_for_attempt(9), Duration::from_secs(300));
        assert_eq!(policy.ceiling_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn backoff_is_jittered_within_bounds() {
        let policy = RetryPolicy::default();
        for attempts in 1..12 {
            let ceiling = policy.ceiling_for_attempt(attempts);
            let delay = policy.backoff_for_attempt(attempts);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(
            classify_error("(code: -32000, message: nonce too low, data: None)"),
            ErrorClass::NonceTooLow
        );
        assert_eq!(classify_error("nonce too high"), ErrorClass::NonceTooHigh);
        assert_eq!(classify_error("already known"), ErrorClass::AlreadyKnown);
        assert_eq!(
            classify_error("insufficient funds for gas * price + value"),
            ErrorClass::InsufficientFunds
        );
        assert_eq!(classify_error("something odd"), ErrorClass::Unknown);
        assert!(ErrorClass::NonceTooLow.needs_nonce_resync());
        assert!(!ErrorClass::Underpriced.needs_nonce_resync());
    }
}
