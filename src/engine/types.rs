//! Request and response types of the execution engine.

use super::error::EngineError;
use crate::config::TradingConfig;
use crate::ledger::{Balances, TradeAction, TradeRecord, TradeStatus, TradeSummary};
use crate::utils::decimal::round_quantity;
use crate::utils::{generate_request_id, parse_pair, AssetPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted client reference, in characters.
pub const MAX_CLIENT_REF_LEN: usize = 64;

/// Caller-supplied trade request. Every field is optional; defaults come from
/// the trading configuration at the time of the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Correlation id; generated when absent
    #[serde(default)]
    pub request_id: Option<String>,
    /// Ordering token for the (pair, action) stream
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub client_ref: Option<String>,
    /// Skip the signal threshold check
    #[serde(default)]
    pub force: bool,
}

impl TradeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Apply defaults and validate.
    pub fn normalize(
        self,
        action: TradeAction,
        config: &TradingConfig,
    ) -> Result<NormalizedRequest, EngineError> {
        let pair = self
            .pair
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(config.pair.trim())
            .to_uppercase();
        if pair.is_empty() {
            return Err(EngineError::Validation("pair must not be empty".into()));
        }

        let assets = parse_pair(&pair);
        if assets.base == assets.quote {
            return Err(EngineError::Validation(format!(
                "pair {pair} does not name distinct base and quote assets"
            )));
        }

        let raw_quantity = self.quantity.unwrap_or(config.default_order_quantity);
        if raw_quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "quantity must be positive, got {raw_quantity}"
            )));
        }
        let quantity = round_quantity(raw_quantity);
        if quantity.is_zero() {
            return Err(EngineError::Validation(format!(
                "quantity {raw_quantity} rounds to zero at 6 decimals"
            )));
        }

        if self.sequence_number == Some(0) {
            return Err(EngineError::Validation(
                "sequence_number starts at 1".into(),
            ));
        }

        if let Some(client_ref) = &self.client_ref {
            if client_ref.chars().count() > MAX_CLIENT_REF_LEN {
                return Err(EngineError::Validation(format!(
                    "client_ref exceeds {MAX_CLIENT_REF_LEN} characters"
                )));
            }
        }

        let request_id = self
            .request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_request_id);

        Ok(NormalizedRequest {
            pair,
            assets,
            action,
            quantity,
            request_id,
            client_ref: self.client_ref,
            sequence_number: self.sequence_number,
            force: self.force,
        })
    }
}

/// A request with defaults applied, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub pair: String,
    pub assets: AssetPair,
    pub action: TradeAction,
    pub quantity: Decimal,
    pub request_id: String,
    pub client_ref: Option<String>,
    pub sequence_number: Option<u64>,
    pub force: bool,
}

/// Why a request was turned down without touching the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    SignalThresholdNotMet {
        action: TradeAction,
        signal: Decimal,
        threshold: Decimal,
    },
    InsufficientFunds {
        asset: String,
        available: Decimal,
        required: Decimal,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SignalThresholdNotMet {
                action: TradeAction::Buy,
                signal,
                threshold,
            } => write!(
                f,
                "RSI ({signal}) is not below oversold threshold ({threshold})"
            ),
            RejectReason::SignalThresholdNotMet {
                action: TradeAction::Sell,
                signal,
                threshold,
            } => write!(
                f,
                "RSI ({signal}) is not above overbought threshold ({threshold})"
            ),
            RejectReason::InsufficientFunds {
                asset,
                available,
                required,
            } => write!(
                f,
                "Insufficient {asset} balance: {available} available, {required} required"
            ),
        }
    }
}

/// Result of [`crate::engine::TradeEngine::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResponse {
    pub pair: String,
    pub action: TradeAction,
    pub signal: Decimal,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub status: TradeStatus,
    pub trade_id: Option<i64>,
    pub transaction_id: Option<String>,
    pub sequence_number: Option<u64>,
    pub request_id: String,
    pub request_hash: String,
    pub balances: Balances,
    pub message: Option<String>,
    /// Set when this call replayed an earlier execution
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
}

impl TradeResponse {
    /// Response for a freshly committed trade.
    pub fn executed(record: &TradeRecord, request_id: &str) -> Self {
        Self {
            message: Some("Trade executed".to_string()),
            ..Self::from_record(record, request_id)
        }
    }

    /// Replay of an already recorded trade, returned verbatim.
    pub fn duplicate(record: &TradeRecord, request_id: &str) -> Self {
        Self {
            message: Some("Duplicate request detected; returning existing trade".to_string()),
            duplicate: true,
            ..Self::from_record(record, request_id)
        }
    }

    /// Non-mutating rejection.
    pub fn rejected(
        request: &NormalizedRequest,
        request_hash: String,
        signal: Decimal,
        price: Decimal,
        balances: Balances,
        reason: RejectReason,
    ) -> Self {
        Self {
            pair: request.pair.clone(),
            action: request.action,
            signal,
            price: Some(price),
            quantity: Some(request.quantity),
            status: TradeStatus::Rejected,
            trade_id: None,
            transaction_id: None,
            sequence_number: None,
            request_id: request.request_id.clone(),
            request_hash,
            balances,
            message: Some(reason.to_string()),
            duplicate: false,
            reject_reason: Some(reason),
        }
    }

    fn from_record(record: &TradeRecord, request_id: &str) -> Self {
        Self {
            pair: record.pair.clone(),
            action: record.action,
            signal: record.signal,
            price: Some(record.price),
            quantity: Some(record.quantity),
            status: record.status,
            trade_id: Some(record.id),
            transaction_id: Some(record.transaction_id.clone()),
            sequence_number: Some(record.sequence_number),
            request_id: request_id.to_string(),
            request_hash: record.request_hash.clone(),
            balances: record.metadata.balances.clone(),
            message: None,
            duplicate: false,
            reject_reason: None,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == TradeStatus::Executed
    }
}

/// Snapshot for the status command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub pair: String,
    pub signal: Decimal,
    pub price: Decimal,
    pub rsi_oversold: Decimal,
    pub rsi_overbought: Decimal,
    pub trades: TradeSummary,
    pub balances: Balances,
}
