//! Durable ledger for simulated trading.
//!
//! Owns every piece of persisted state:
//! - Asset balances
//! - Trade records, unique by transaction id and by request hash
//! - Per-(pair, action) sequence counters
//!
//! The engine never caches any of this between calls; all coordination goes
//! through the atomic operations exposed by [`LedgerStore`].

mod sqlite;
mod types;

pub use sqlite::SqliteLedger;
pub use types::*;

use rust_decimal::Decimal;
use thiserror::Error;

/// Failures raised by a ledger backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode trade metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("either a transaction id or a request hash is required")]
    MissingLookupKey,

    #[error("{asset} balance would go negative ({available} available, {required} required)")]
    InsufficientBalance {
        asset: String,
        available: Decimal,
        required: Decimal,
    },

    #[error("{asset} balance is out of range after applying {delta}")]
    BalanceOverflow { asset: String, delta: Decimal },

    #[error("transaction id collided with an existing trade after regeneration")]
    TransactionIdCollision,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the execution engine needs from a ledger backend.
///
/// Every method is atomic on its own. [`LedgerStore::commit_execution`] is the
/// single unit that moves balances, inserts the trade and advances the
/// sequence tracker together.
pub trait LedgerStore: Send + Sync {
    /// Balance of `asset`, zero when the asset has never been seen.
    fn get_balance(&self, asset: &str) -> StoreResult<Decimal>;

    /// Add `delta` to `asset` and return the new balance.
    ///
    /// Fails with [`StoreError::InsufficientBalance`] instead of going negative.
    fn adjust_balance(&self, asset: &str, delta: Decimal) -> StoreResult<Decimal>;

    /// Overwrite the balance of `asset`.
    fn set_balance(&self, asset: &str, amount: Decimal) -> StoreResult<()>;

    /// Seed `asset` with `amount` unless it already has an entry.
    ///
    /// Returns `true` when the seed was written.
    fn ensure_initial_balance(&self, asset: &str, amount: Decimal) -> StoreResult<bool>;

    /// Every tracked balance.
    fn balances(&self) -> StoreResult<Balances>;

    /// Insert a trade and, for executed trades, upsert its sequence tracker
    /// row in the same transaction.
    fn record_trade(&self, record: &NewTradeRecord) -> StoreResult<i64>;

    /// Whether a trade exists with the given transaction id or request hash.
    fn trade_exists(
        &self,
        transaction_id: Option<&str>,
        request_hash: Option<&str>,
    ) -> StoreResult<bool>;

    fn fetch_by_request_hash(&self, request_hash: &str) -> StoreResult<Option<TradeRecord>>;

    /// Last executed sequence number for the stream, zero if none.
    fn last_sequence(&self, pair: &str, action: TradeAction) -> StoreResult<u64>;

    /// Apply an execution: re-check fingerprint, sequence and funds, then move
    /// balances, insert the record and advance the tracker, all or nothing.
    fn commit_execution(&self, commit: &ExecutionCommit) -> StoreResult<CommitOutcome>;

    /// Most recent trades, newest first.
    fn recent_trades(&self, limit: usize) -> StoreResult<Vec<TradeRecord>>;

    fn trade_summary(&self) -> StoreResult<TradeSummary>;
}
