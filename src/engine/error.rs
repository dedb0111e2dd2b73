//! Hard failures of a trade execution.
//!
//! Domain rejections (unmet signal threshold, insufficient funds) are not
//! errors; they come back as `rejected` responses.

use crate::ledger::{StoreError, TradeAction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid trade request: {0}")]
    Validation(String),

    #[error("stale sequence {supplied} for {pair} {action}: next expected is {expected}")]
    StaleSequence {
        pair: String,
        action: TradeAction,
        supplied: u64,
        expected: u64,
    },

    #[error("sequence gap for {pair} {action}: got {supplied}, expected {expected}")]
    SequenceGap {
        pair: String,
        action: TradeAction,
        supplied: u64,
        expected: u64,
    },

    #[error("market signal for {pair} timed out after {timeout_ms}ms")]
    SignalTimeout { pair: String, timeout_ms: u64 },

    #[error("market signal unavailable for {pair}: {reason}")]
    Signal { pair: String, reason: String },

    #[error("ledger failure: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the caller can fix the request and resend it.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::StaleSequence { .. }
                | EngineError::SequenceGap { .. }
        )
    }

    /// HTTP status an inbound layer should answer with.
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            400
        } else {
            500
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::Validation("quantity".into()).status_code(), 400);
        let stale = EngineError::StaleSequence {
            pair: "BTCUSDT".into(),
            action: TradeAction::Buy,
            supplied: 1,
            expected: 3,
        };
        assert!(stale.is_client_error());
        assert_eq!(
            EngineError::Store(StoreError::TransactionIdCollision).status_code(),
            500
        );
        assert_eq!(
            EngineError::SignalTimeout {
                pair: "BTCUSDT".into(),
                timeout_ms: 10
            }
            .status_code(),
            500
        );
    }
}
