//! Per-stream ordering guard.

use super::error::EngineError;
use crate::ledger::{LedgerStore, SequenceClaim, StoreResult, TradeAction};

/// Validates caller-supplied sequence numbers against the ledger.
pub struct SequenceGuard<'a> {
    store: &'a dyn LedgerStore,
}

impl<'a> SequenceGuard<'a> {
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        Self { store }
    }

    /// Next sequence number the (pair, action) stream will accept.
    pub fn next_expected(&self, pair: &str, action: TradeAction) -> StoreResult<u64> {
        Ok(self.store.last_sequence(pair, action)? + 1)
    }

    /// Turn an optional caller sequence into a claim for the commit.
    ///
    /// Omitted numbers become [`SequenceClaim::Next`] and are assigned inside
    /// the commit transaction.
    pub fn validate(
        &self,
        pair: &str,
        action: TradeAction,
        supplied: Option<u64>,
    ) -> Result<SequenceClaim, EngineError> {
        let Some(supplied) = supplied else {
            return Ok(SequenceClaim::Next);
        };

        let expected = self.next_expected(pair, action)?;
        if supplied == expected {
            Ok(SequenceClaim::Exact(supplied))
        } else {
            Err(violation(pair, action, supplied, expected))
        }
    }
}

/// Error for a supplied sequence that does not match `expected`.
pub fn violation(pair: &str, action: TradeAction, supplied: u64, expected: u64) -> EngineError {
    if supplied < expected {
        EngineError::StaleSequence {
            pair: pair.to_string(),
            action,
            supplied,
            expected,
        }
    } else {
        EngineError::SequenceGap {
            pair: pair.to_string(),
            action,
            supplied,
            expected,
        }
    }
}
