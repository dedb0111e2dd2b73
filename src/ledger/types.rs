//! Ledger record types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Asset symbol -> balance.
pub type Balances = BTreeMap<String, Decimal>;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            other => Err(format!("unknown trade action: {other}")),
        }
    }
}

/// Outcome recorded on a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Executed,
    Rejected,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Executed => "executed",
            TradeStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executed" => Ok(TradeStatus::Executed),
            "rejected" => Ok(TradeStatus::Rejected),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

/// Audit payload stored alongside each trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeMetadata {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub client_ref: Option<String>,
    #[serde(default)]
    pub forced: bool,
    /// Every tracked balance right after the trade was applied
    #[serde(default)]
    pub balances: Balances,
}

/// A trade ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewTradeRecord {
    pub transaction_id: String,
    pub sequence_number: u64,
    pub request_hash: String,
    pub pair: String,
    pub action: TradeAction,
    pub signal: Decimal,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: TradeStatus,
    pub metadata: TradeMetadata,
}

/// A persisted trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub transaction_id: String,
    pub sequence_number: u64,
    pub request_hash: String,
    pub timestamp: DateTime<Utc>,
    pub pair: String,
    pub action: TradeAction,
    pub signal: Decimal,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: TradeStatus,
    pub metadata: TradeMetadata,
}

/// Aggregate trade counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub total_trades: u64,
    pub buy_trades: u64,
    pub sell_trades: u64,
}

/// How the commit should pick the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClaim {
    /// Take `last_sequence + 1` inside the transaction.
    Next,
    /// Caller-supplied number; must equal `last_sequence + 1` at commit time.
    Exact(u64),
}

/// Signed change to one asset balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub asset: String,
    pub delta: Decimal,
}

impl BalanceDelta {
    pub fn new(asset: impl Into<String>, delta: Decimal) -> Self {
        Self {
            asset: asset.into(),
            delta,
        }
    }
}

/// Everything the store needs to apply one execution atomically.
#[derive(Debug, Clone)]
pub struct ExecutionCommit {
    pub transaction_id: String,
    pub request_hash: String,
    pub pair: String,
    pub action: TradeAction,
    pub sequence: SequenceClaim,
    pub signal: Decimal,
    pub price: Decimal,
    pub quantity: Decimal,
    pub deltas: Vec<BalanceDelta>,
    /// Balances are snapshotted by the store; this carries the rest.
    pub metadata: TradeMetadata,
}

/// Result of [`ExecutionCommit`] against the ledger.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// Balances moved, record inserted, tracker advanced.
    Committed(TradeRecord),
    /// Another call recorded the same fingerprint first.
    Duplicate(TradeRecord),
    /// The exact sequence claim no longer matches the stream.
    SequenceConflict { expected: u64 },
    /// A debit would have taken the asset below zero.
    InsufficientBalance {
        asset: String,
        available: Decimal,
        required: Decimal,
    },
}
