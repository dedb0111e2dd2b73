//! Trade execution against the ledger.

use super::error::EngineError;
use super::fingerprint::request_fingerprint;
use super::sequence::{violation, SequenceGuard};
use super::types::{NormalizedRequest, RejectReason, StatusReport, TradeRequest, TradeResponse};
use crate::config::TradingConfig;
use crate::ledger::{
    BalanceDelta, CommitOutcome, ExecutionCommit, LedgerStore, SequenceClaim, StoreError,
    TradeAction, TradeMetadata, TradeRecord,
};
use crate::market::{MarketSignal, MarketSignalProvider};
use crate::notify::{format_trade_notification, NoopNotifier, NotificationOutcome, Notifier};
use crate::utils::decimal::{notional, round_price, PRICE_DP};
use crate::utils::{generate_transaction_id, AssetPair};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

type IdGenerator = dyn Fn() -> String + Send + Sync;

/// Stateless trade executor.
///
/// All persistent state lives in the [`LedgerStore`]; the engine only keeps
/// its collaborators and the current trading configuration, which is read
/// fresh on every call.
pub struct TradeEngine {
    store: Arc<dyn LedgerStore>,
    signals: Arc<dyn MarketSignalProvider>,
    notifier: Arc<dyn Notifier>,
    config: RwLock<TradingConfig>,
    transaction_ids: Box<IdGenerator>,
}

impl TradeEngine {
    /// Create an engine with notifications disabled.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        signals: Arc<dyn MarketSignalProvider>,
        config: TradingConfig,
    ) -> Self {
        Self {
            store,
            signals,
            notifier: Arc::new(NoopNotifier),
            config: RwLock::new(config),
            transaction_ids: Box::new(generate_transaction_id),
        }
    }

    /// Send a notification after every executed trade.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the transaction id source.
    pub fn with_transaction_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.transaction_ids = Box::new(generator);
        self
    }

    /// Current trading configuration.
    pub async fn trading_config(&self) -> TradingConfig {
        self.config.read().await.clone()
    }

    /// Swap the trading configuration; the next call picks it up.
    ///
    /// An invalid configuration is refused and the current one stays live.
    pub async fn update_config(&self, config: TradingConfig) -> Result<(), EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Validation(format!("trading config: {e:#}")))?;

        *self.config.write().await = config;
        info!("Trading configuration updated");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn buy(&self, request: TradeRequest) -> Result<TradeResponse, EngineError> {
        self.execute(TradeAction::Buy, request).await
    }

    pub async fn sell(&self, request: TradeRequest) -> Result<TradeResponse, EngineError> {
        self.execute(TradeAction::Sell, request).await
    }

    /// Execute one trade request.
    ///
    /// Duplicates return the recorded trade unchanged. Unmet thresholds and
    /// insufficient funds come back as `rejected` responses without touching
    /// the ledger. Validation, sequencing, signal and store problems are
    /// errors.
    #[instrument(skip(self, request), fields(action = %action))]
    pub async fn execute(
        &self,
        action: TradeAction,
        request: TradeRequest,
    ) -> Result<TradeResponse, EngineError> {
        let config = self.trading_config().await;
        let order = request.normalize(action, &config)?;

        self.seed_balances(&order.assets, &config)?;

        let market = self.sample_market(&order.pair, config.signal_timeout_ms).await?;
        let request_hash = request_fingerprint(&order);

        if let Some(existing) = self.store.fetch_by_request_hash(&request_hash)? {
            return Ok(self.replay(&existing, &order));
        }

        let sequence =
            SequenceGuard::new(self.store.as_ref()).validate(&order.pair, action, order.sequence_number)?;

        if !order.force {
            if let Some(reason) = threshold_violation(action, market.signal, &config) {
                return self.reject(&order, request_hash, market, reason);
            }
        }

        let Some(notional) = notional(market.price, order.quantity) else {
            return Err(EngineError::Validation(format!(
                "order value of {} at {} is out of range",
                order.quantity, market.price
            )));
        };
        if let Some(reason) = self.funds_shortfall(&order, notional)? {
            return self.reject(&order, request_hash, market, reason);
        }

        let transaction_id = self.new_transaction_id()?;
        let commit = ExecutionCommit {
            transaction_id,
            request_hash: request_hash.clone(),
            pair: order.pair.clone(),
            action,
            sequence,
            signal: market.signal,
            price: market.price,
            quantity: order.quantity,
            deltas: balance_deltas(action, &order.assets, order.quantity, notional),
            metadata: TradeMetadata {
                request_id: order.request_id.clone(),
                client_ref: order.client_ref.clone(),
                forced: order.force,
                ..Default::default()
            },
        };

        // Synchronous from here on: once the commit starts it either lands
        // whole or rolls back, even if the caller drops this future.
        match self.store.commit_execution(&commit)? {
            CommitOutcome::Committed(record) => {
                info!(
                    pair = %record.pair,
                    price = %record.price,
                    quantity = %record.quantity,
                    signal = %record.signal,
                    sequence = record.sequence_number,
                    transaction_id = %record.transaction_id,
                    "{} trade executed",
                    action
                );
                let response = TradeResponse::executed(&record, &order.request_id);
                self.notify_executed(&response);
                Ok(response)
            }
            CommitOutcome::Duplicate(existing) => Ok(self.replay(&existing, &order)),
            CommitOutcome::SequenceConflict { expected } => {
                let supplied = match sequence {
                    SequenceClaim::Exact(n) => n,
                    // The store assigns `Next` itself and cannot conflict on it
                    SequenceClaim::Next => expected,
                };
                Err(violation(&order.pair, action, supplied, expected))
            }
            CommitOutcome::InsufficientBalance {
                asset,
                available,
                required,
            } => {
                let reason = RejectReason::InsufficientFunds {
                    asset,
                    available,
                    required,
                };
                self.reject(&order, request_hash, market, reason)
            }
        }
    }

    /// Current signal, thresholds, trade counts and balances.
    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        let config = self.trading_config().await;
        let pair = config.pair.trim().to_uppercase();
        let market = self.sample_market(&pair, config.signal_timeout_ms).await?;

        Ok(StatusReport {
            pair,
            signal: market.signal,
            price: market.price,
            rsi_oversold: config.rsi_oversold,
            rsi_overbought: config.rsi_overbought,
            trades: self.store.trade_summary()?,
            balances: self.store.balances()?,
        })
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, EngineError> {
        Ok(self.store.recent_trades(limit)?)
    }

    // ==================== Steps ====================

    fn seed_balances(&self, assets: &AssetPair, config: &TradingConfig) -> Result<(), EngineError> {
        self.store
            .ensure_initial_balance(&assets.base, config.default_base_balance)?;
        self.store
            .ensure_initial_balance(&assets.quote, config.default_quote_balance)?;
        Ok(())
    }

    async fn sample_market(&self, pair: &str, timeout_ms: u64) -> Result<MarketSignal, EngineError> {
        let sample = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.signals.sample(pair),
        )
        .await;

        let market = match sample {
            Ok(Ok(market)) => market,
            Ok(Err(e)) => {
                return Err(EngineError::Signal {
                    pair: pair.to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                warn!(%pair, timeout_ms, "Market signal sample timed out");
                return Err(EngineError::SignalTimeout {
                    pair: pair.to_string(),
                    timeout_ms,
                });
            }
        };

        if market.price <= Decimal::ZERO {
            return Err(EngineError::Signal {
                pair: pair.to_string(),
                reason: format!("non-positive price {}", market.price),
            });
        }

        debug!(%pair, signal = %market.signal, price = %market.price, "Market sampled");
        Ok(MarketSignal {
            signal: market.signal.round_dp(PRICE_DP),
            price: round_price(market.price),
        })
    }

    fn funds_shortfall(
        &self,
        order: &NormalizedRequest,
        notional: Decimal,
    ) -> Result<Option<RejectReason>, EngineError> {
        let (asset, required) = match order.action {
            TradeAction::Buy => (&order.assets.quote, notional),
            TradeAction::Sell => (&order.assets.base, order.quantity),
        };

        let available = self.store.get_balance(asset)?;
        if available >= required {
            return Ok(None);
        }

        Ok(Some(RejectReason::InsufficientFunds {
            asset: asset.clone(),
            available,
            required,
        }))
    }

    /// Generate a transaction id, regenerating once on collision.
    fn new_transaction_id(&self) -> Result<String, EngineError> {
        let candidate = (self.transaction_ids)();
        if !self.store.trade_exists(Some(&candidate), None)? {
            return Ok(candidate);
        }

        warn!(transaction_id = %candidate, "Transaction id collision; regenerating");
        let retry = (self.transaction_ids)();
        if self.store.trade_exists(Some(&retry), None)? {
            return Err(StoreError::TransactionIdCollision.into());
        }
        Ok(retry)
    }

    fn replay(&self, existing: &TradeRecord, order: &NormalizedRequest) -> TradeResponse {
        info!(
            transaction_id = %existing.transaction_id,
            request_id = %order.request_id,
            "Duplicate request; returning recorded trade"
        );
        TradeResponse::duplicate(existing, &order.request_id)
    }

    fn reject(
        &self,
        order: &NormalizedRequest,
        request_hash: String,
        market: MarketSignal,
        reason: RejectReason,
    ) -> Result<TradeResponse, EngineError> {
        warn!(pair = %order.pair, action = %order.action, %reason, "Trade rejected");
        let balances = self.store.balances()?;
        Ok(TradeResponse::rejected(
            order,
            request_hash,
            market.signal,
            market.price,
            balances,
            reason,
        ))
    }

    /// Fire-and-forget alert; the outcome is only logged.
    fn notify_executed(&self, response: &TradeResponse) {
        let message = format_trade_notification(
            &response.pair,
            response.action,
            response.signal,
            response.price,
        );
        let notifier = Arc::clone(&self.notifier);
        let transaction_id = response.transaction_id.clone().unwrap_or_default();

        tokio::spawn(async move {
            match notifier.send(&message).await {
                NotificationOutcome::Sent => debug!(%transaction_id, "Trade notification sent"),
                NotificationOutcome::Skipped { reason } => {
                    debug!(%transaction_id, %reason, "Trade notification skipped")
                }
                NotificationOutcome::Failed { error } => {
                    warn!(%transaction_id, %error, "Trade notification failed")
                }
            }
        });
    }
}

/// `Some(reason)` when the signal does not permit the action.
fn threshold_violation(
    action: TradeAction,
    signal: Decimal,
    config: &TradingConfig,
) -> Option<RejectReason> {
    let (permitted, threshold) = match action {
        TradeAction::Buy => (signal < config.rsi_oversold, config.rsi_oversold),
        TradeAction::Sell => (signal > config.rsi_overbought, config.rsi_overbought),
    };

    (!permitted).then_some(RejectReason::SignalThresholdNotMet {
        action,
        signal,
        threshold,
    })
}

/// Ledger movements for a fill of `quantity` worth `notional` quote.
fn balance_deltas(
    action: TradeAction,
    assets: &AssetPair,
    quantity: Decimal,
    notional: Decimal,
) -> Vec<BalanceDelta> {
    match action {
        TradeAction::Buy => vec![
            BalanceDelta::new(assets.quote.clone(), -notional),
            BalanceDelta::new(assets.base.clone(), quantity),
        ],
        TradeAction::Sell => vec![
            BalanceDelta::new(assets.base.clone(), -quantity),
            BalanceDelta::new(assets.quote.clone(), notional),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SqliteLedger, TradeStatus};
    use crate::market::{MockMarketSignalProvider, StaticMarketSignal};
    use crate::notify::MockNotifier;
    use crate::utils::decimal::approx_eq;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const EPSILON: Decimal = dec!(0.000001);

    // =========================================================================
    // Helpers
    // =========================================================================

    fn test_config() -> TradingConfig {
        TradingConfig {
            pair: "BTCUSDT".to_string(),
            rsi_oversold: dec!(20),
            rsi_overbought: dec!(80),
            default_base_balance: dec!(1),
            default_quote_balance: dec!(50000),
            default_order_quantity: dec!(0.01),
            signal_timeout_ms: 500,
        }
    }

    fn engine_with(signal: Decimal, price: Decimal) -> (TradeEngine, Arc<SqliteLedger>) {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let engine = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(signal, price)),
            test_config(),
        );
        (engine, ledger)
    }

    fn first_request() -> TradeRequest {
        TradeRequest::new()
            .with_pair("BTCUSDT")
            .with_quantity(dec!(0.01))
            .with_request_id("req-1")
            .with_client_ref("client-a")
    }

    /// Forwards every message into a channel.
    struct ChannelNotifier(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn send(&self, message: &str) -> NotificationOutcome {
            let _ = self.0.send(message.to_string());
            NotificationOutcome::Sent
        }
    }

    /// Never answers within any reasonable timeout.
    struct StalledSignal;

    #[async_trait]
    impl MarketSignalProvider for StalledSignal {
        async fn sample(&self, _pair: &str) -> anyhow::Result<MarketSignal> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(MarketSignal::new(dec!(15), dec!(45000)))
        }
    }

    /// Ledger whose commits always fail after delegating reads.
    struct FailingCommitLedger(SqliteLedger);

    impl LedgerStore for FailingCommitLedger {
        fn get_balance(&self, asset: &str) -> crate::ledger::StoreResult<Decimal> {
            self.0.get_balance(asset)
        }
        fn adjust_balance(&self, asset: &str, delta: Decimal) -> crate::ledger::StoreResult<Decimal> {
            self.0.adjust_balance(asset, delta)
        }
        fn set_balance(&self, asset: &str, amount: Decimal) -> crate::ledger::StoreResult<()> {
            self.0.set_balance(asset, amount)
        }
        fn ensure_initial_balance(&self, asset: &str, amount: Decimal) -> crate::ledger::StoreResult<bool> {
            self.0.ensure_initial_balance(asset, amount)
        }
        fn balances(&self) -> crate::ledger::StoreResult<crate::ledger::Balances> {
            self.0.balances()
        }
        fn record_trade(&self, record: &crate::ledger::NewTradeRecord) -> crate::ledger::StoreResult<i64> {
            self.0.record_trade(record)
        }
        fn trade_exists(
            &self,
            transaction_id: Option<&str>,
            request_hash: Option<&str>,
        ) -> crate::ledger::StoreResult<bool> {
            self.0.trade_exists(transaction_id, request_hash)
        }
        fn fetch_by_request_hash(&self, request_hash: &str) -> crate::ledger::StoreResult<Option<TradeRecord>> {
            self.0.fetch_by_request_hash(request_hash)
        }
        fn last_sequence(&self, pair: &str, action: TradeAction) -> crate::ledger::StoreResult<u64> {
            self.0.last_sequence(pair, action)
        }
        fn commit_execution(&self, _commit: &ExecutionCommit) -> crate::ledger::StoreResult<CommitOutcome> {
            Err(StoreError::Corrupt("disk unplugged".to_string()))
        }
        fn recent_trades(&self, limit: usize) -> crate::ledger::StoreResult<Vec<TradeRecord>> {
            self.0.recent_trades(limit)
        }
        fn trade_summary(&self) -> crate::ledger::StoreResult<crate::ledger::TradeSummary> {
            self.0.trade_summary()
        }
    }

    // =========================================================================
    // Execution paths
    // =========================================================================

    #[tokio::test]
    async fn test_buy_executes_and_moves_balances() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        let response = engine.buy(first_request()).await.unwrap();

        assert_eq!(response.status, TradeStatus::Executed);
        assert_eq!(response.sequence_number, Some(1));
        assert_eq!(response.price, Some(dec!(45000)));
        assert!(response.transaction_id.is_some());
        assert!(response.trade_id.is_some());
        assert!(!response.duplicate);
        assert_eq!(response.request_id, "req-1");
        assert!(approx_eq(response.balances["USDT"], dec!(49550), EPSILON));
        assert!(approx_eq(response.balances["BTC"], dec!(1.01), EPSILON));

        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49550));
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(1.01));
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sell_executes_and_moves_balances() {
        let (engine, ledger) = engine_with(dec!(85), dec!(45000));

        let response = engine
            .sell(TradeRequest::new().with_quantity(dec!(0.5)))
            .await
            .unwrap();

        assert!(response.is_executed());
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(0.5));
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(72500));
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Sell).unwrap(), 1);
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_signal_above_oversold_rejects_without_mutation() {
        let (engine, ledger) = engine_with(dec!(55), dec!(45000));

        let response = engine.buy(first_request()).await.unwrap();

        assert_eq!(response.status, TradeStatus::Rejected);
        assert_eq!(response.signal, dec!(55));
        assert!(response.message.as_deref().unwrap().contains("threshold"));
        assert!(matches!(
            response.reject_reason,
            Some(RejectReason::SignalThresholdNotMet { .. })
        ));
        assert!(response.transaction_id.is_none());
        assert!(response.sequence_number.is_none());

        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(50000));
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(1));
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 0);
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let (engine, _) = engine_with(dec!(20), dec!(45000));
        let response = engine.buy(TradeRequest::new()).await.unwrap();
        assert_eq!(response.status, TradeStatus::Rejected);

        let (engine, _) = engine_with(dec!(80), dec!(45000));
        let response = engine.sell(TradeRequest::new()).await.unwrap();
        assert_eq!(response.status, TradeStatus::Rejected);
    }

    #[tokio::test]
    async fn test_force_bypasses_threshold() {
        let (engine, ledger) = engine_with(dec!(55), dec!(45000));

        let response = engine.buy(first_request().forced()).await.unwrap();

        assert!(response.is_executed());
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49550));
        let record = ledger
            .fetch_by_request_hash(&response.request_hash)
            .unwrap()
            .unwrap();
        assert!(record.metadata.forced);
        assert_eq!(record.metadata.client_ref.as_deref(), Some("client-a"));
    }

    #[tokio::test]
    async fn test_insufficient_quote_rejects() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        let response = engine
            .buy(TradeRequest::new().with_quantity(dec!(2)))
            .await
            .unwrap();

        assert_eq!(response.status, TradeStatus::Rejected);
        match response.reject_reason {
            Some(RejectReason::InsufficientFunds {
                asset,
                available,
                required,
            }) => {
                assert_eq!(asset, "USDT");
                assert_eq!(available, dec!(50000));
                assert_eq!(required, dec!(90000));
            }
            other => panic!("unexpected reason {other:?}"),
        }
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(50000));
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_base_rejects_sell() {
        let (engine, ledger) = engine_with(dec!(85), dec!(45000));

        let response = engine
            .sell(TradeRequest::new().with_quantity(dec!(1.5)))
            .await
            .unwrap();

        assert_eq!(response.status, TradeStatus::Rejected);
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(1));
        assert!(!ledger.trade_exists(None, Some(&response.request_hash)).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_deduplicated() {
        let (engine, ledger) = engine_with(dec!(55), dec!(45000));
        let rejected = engine.buy(first_request()).await.unwrap();
        assert_eq!(rejected.status, TradeStatus::Rejected);

        // Same request, signal now favourable: it re-runs and executes
        engine
            .update_config(TradingConfig {
                rsi_oversold: dec!(60),
                ..test_config()
            })
            .await
            .unwrap();
        let retried = engine.buy(first_request()).await.unwrap();
        assert!(retried.is_executed());
        assert_eq!(retried.request_hash, rejected.request_hash);
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 1);
    }

    // =========================================================================
    // Idempotence and sequencing
    // =========================================================================

    #[tokio::test]
    async fn test_duplicate_returns_original_without_second_mutation() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        let first = engine.buy(first_request()).await.unwrap();
        let second = engine.buy(first_request()).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert_eq!(second.trade_id, first.trade_id);
        assert_eq!(second.sequence_number, first.sequence_number);
        assert_eq!(second.status, first.status);
        assert_eq!(second.balances, first.balances);
        assert!(second.message.as_deref().unwrap().contains("Duplicate"));

        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49550));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn test_duplicate_wins_over_stale_sequence() {
        let (engine, _) = engine_with(dec!(15), dec!(45000));

        let first = engine.buy(first_request().with_sequence(1)).await.unwrap();
        let replay = engine.buy(first_request().with_sequence(1)).await.unwrap();

        assert!(replay.duplicate);
        assert_eq!(replay.transaction_id, first.transaction_id);
    }

    #[tokio::test]
    async fn test_duplicate_keeps_recorded_values_when_market_moves() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let first = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(dec!(15), dec!(45000))),
            test_config(),
        )
        .buy(first_request())
        .await
        .unwrap();

        let replay = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(dec!(70), dec!(47000))),
            test_config(),
        )
        .buy(first_request())
        .await
        .unwrap();

        assert!(replay.is_executed());
        assert_eq!(replay.price, Some(dec!(45000)));
        assert_eq!(replay.signal, dec!(15));
        assert_eq!(replay.transaction_id, first.transaction_id);
    }

    #[tokio::test]
    async fn test_new_request_id_is_a_new_trade() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        engine.buy(first_request()).await.unwrap();
        let other = engine
            .buy(first_request().with_request_id("req-2"))
            .await
            .unwrap();

        assert!(!other.duplicate);
        assert_eq!(other.sequence_number, Some(2));
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49100));
    }

    #[tokio::test]
    async fn test_explicit_sequences() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        let first = engine
            .buy(TradeRequest::new().with_request_id("a").with_sequence(1))
            .await
            .unwrap();
        assert_eq!(first.sequence_number, Some(1));

        let stale = engine
            .buy(TradeRequest::new().with_request_id("b").with_sequence(1))
            .await
            .unwrap_err();
        assert!(matches!(stale, EngineError::StaleSequence { expected: 2, .. }));
        assert!(stale.is_client_error());

        let gap = engine
            .buy(TradeRequest::new().with_request_id("c").with_sequence(4))
            .await
            .unwrap_err();
        assert!(matches!(gap, EngineError::SequenceGap { expected: 2, .. }));

        let second = engine
            .buy(TradeRequest::new().with_request_id("d").with_sequence(2))
            .await
            .unwrap();
        assert_eq!(second.sequence_number, Some(2));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 2);
    }

    #[tokio::test]
    async fn test_rejection_does_not_consume_sequence() {
        let (engine, _) = engine_with(dec!(15), dec!(45000));

        let rejected = engine
            .buy(TradeRequest::new().with_quantity(dec!(5)).with_sequence(1))
            .await
            .unwrap();
        assert_eq!(rejected.status, TradeStatus::Rejected);

        let executed = engine
            .buy(TradeRequest::new().with_sequence(1))
            .await
            .unwrap();
        assert_eq!(executed.sequence_number, Some(1));
    }

    #[tokio::test]
    async fn test_validation_error_touches_nothing() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));

        let err = engine
            .buy(TradeRequest::new().with_quantity(dec!(-1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(err.status_code(), 400);
        assert!(ledger.balances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_order_value_is_refused() {
        let huge = dec!(10000000000000000000000000);

        let (engine, ledger) = engine_with(dec!(85), dec!(45000));
        let err = engine
            .sell(TradeRequest::new().with_quantity(huge))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.is_client_error());

        let (engine, _) = engine_with(dec!(15), dec!(45000));
        let err = engine
            .buy(TradeRequest::new().with_quantity(huge))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(1));
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(50000));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_refused() {
        let (engine, _) = engine_with(dec!(15), dec!(45000));

        let inverted = engine
            .update_config(TradingConfig {
                rsi_oversold: dec!(90),
                rsi_overbought: dec!(10),
                ..test_config()
            })
            .await;
        assert!(matches!(inverted, Err(EngineError::Validation(_))));

        let zero_quantity = engine
            .update_config(TradingConfig {
                default_order_quantity: Decimal::ZERO,
                ..test_config()
            })
            .await;
        assert!(zero_quantity.is_err());

        let live = engine.trading_config().await;
        assert_eq!(live.rsi_oversold, dec!(20));
        assert_eq!(live.default_order_quantity, dec!(0.01));
    }

    // =========================================================================
    // Balances, ids, collaborators
    // =========================================================================

    #[tokio::test]
    async fn test_existing_balances_are_not_reseeded() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        ledger.set_balance("USDT", dec!(1000)).unwrap();

        engine.buy(TradeRequest::new()).await.unwrap();

        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(550));
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(1.01));
    }

    #[tokio::test]
    async fn test_config_is_read_per_call() {
        let (engine, ledger) = engine_with(dec!(15), dec!(2500));
        engine
            .update_config(TradingConfig {
                pair: "ETHUSDT".to_string(),
                default_order_quantity: dec!(2),
                ..test_config()
            })
            .await
            .unwrap();

        let response = engine.buy(TradeRequest::new()).await.unwrap();

        assert_eq!(response.pair, "ETHUSDT");
        assert_eq!(response.quantity, Some(dec!(2)));
        assert_eq!(ledger.get_balance("ETH").unwrap(), dec!(3));
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(45000));
    }

    #[tokio::test]
    async fn test_transaction_id_collision_regenerates_once() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let first = engine.buy(first_request()).await.unwrap();
        let taken = first.transaction_id.clone().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(dec!(15), dec!(45000))),
            test_config(),
        )
        .with_transaction_id_generator(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                taken.clone()
            } else {
                "fresh-id".to_string()
            }
        });

        let second = engine
            .buy(first_request().with_request_id("req-2"))
            .await
            .unwrap();
        assert_eq!(second.transaction_id.as_deref(), Some("fresh-id"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_transaction_id_collision_is_store_failure() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let first = engine.buy(first_request()).await.unwrap();
        let taken = first.transaction_id.unwrap();

        let engine = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(dec!(15), dec!(45000))),
            test_config(),
        )
        .with_transaction_id_generator(move || taken.clone());

        let err = engine
            .buy(first_request().with_request_id("req-2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::TransactionIdCollision)
        ));
        assert_eq!(err.status_code(), 500);
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49550));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 1);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_no_trace() {
        let ledger = Arc::new(FailingCommitLedger(SqliteLedger::in_memory().unwrap()));
        let engine = TradeEngine::new(
            ledger.clone(),
            Arc::new(StaticMarketSignal::new(dec!(15), dec!(45000))),
            test_config(),
        );

        let err = engine.buy(first_request()).await.unwrap_err();

        assert!(matches!(err, EngineError::Store(_)));
        assert!(!err.is_client_error());
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(50000));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_signal_timeout_fails_before_mutation() {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let engine = TradeEngine::new(
            ledger.clone(),
            Arc::new(StalledSignal),
            TradingConfig {
                signal_timeout_ms: 20,
                ..test_config()
            },
        );

        let err = engine.buy(first_request()).await.unwrap_err();

        assert!(matches!(err, EngineError::SignalTimeout { timeout_ms: 20, .. }));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 0);
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_signal_provider_error_propagates() {
        let mut provider = MockMarketSignalProvider::new();
        provider
            .expect_sample()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("feed down")));

        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let engine = TradeEngine::new(ledger.clone(), Arc::new(provider), test_config());

        let err = engine.buy(first_request()).await.unwrap_err();
        match err {
            EngineError::Signal { reason, .. } => assert!(reason.contains("feed down")),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_notification_sent_only_for_executions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (engine, _) = engine_with(dec!(15), dec!(45000));
        let engine = engine.with_notifier(Arc::new(ChannelNotifier(tx)));

        engine.buy(first_request()).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("Pair: BTCUSDT"));
        assert!(message.contains("Action: BUY"));
        assert!(message.contains("RSI: 15.00"));
        assert!(message.contains("$45,000.00"));

        // Duplicate replay and rejection stay silent
        engine.buy(first_request()).await.unwrap();
        engine.sell(TradeRequest::new()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_change_status() {
        let mut notifier = MockNotifier::new();
        notifier.expect_send().returning(|_| NotificationOutcome::Failed {
            error: "chat not found".to_string(),
        });

        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let engine = engine.with_notifier(Arc::new(notifier));

        let response = engine.buy(first_request()).await.unwrap();
        tokio::task::yield_now().await;

        assert!(response.is_executed());
        let record = ledger
            .fetch_by_request_hash(&response.request_hash)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TradeStatus::Executed);
    }

    #[tokio::test]
    async fn test_status_report() {
        let (engine, _) = engine_with(dec!(15), dec!(45000));
        engine.buy(first_request()).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.pair, "BTCUSDT");
        assert_eq!(status.signal, dec!(15));
        assert_eq!(status.rsi_oversold, dec!(20));
        assert_eq!(status.trades.buy_trades, 1);
        assert_eq!(status.balances["USDT"], dec!(49550));
        assert_eq!(engine.recent_trades(5).unwrap().len(), 1);
    }

    // =========================================================================
    // Concurrency properties
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_requests_execute_once() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let engine = Arc::new(engine);

        let calls = (0..16).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.buy(first_request()).await })
        });
        let responses: Vec<TradeResponse> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let tx_ids: HashSet<_> = responses.iter().map(|r| r.transaction_id.clone()).collect();
        assert_eq!(tx_ids.len(), 1);
        assert_eq!(responses.iter().filter(|r| !r.duplicate).count(), 1);
        assert_eq!(ledger.get_balance("USDT").unwrap(), dec!(49550));
        assert_eq!(ledger.trade_summary().unwrap().total_trades, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_buys_keep_sequences_contiguous_and_balances_non_negative() {
        // 50000 USDT buys at most 11 lots of 0.1 BTC at 45000
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let engine = Arc::new(engine);

        let calls = (0..20).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .buy(
                        TradeRequest::new()
                            .with_quantity(dec!(0.1))
                            .with_request_id(format!("req-{i}")),
                    )
                    .await
            })
        });
        let responses: Vec<TradeResponse> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let executed = responses.iter().filter(|r| r.is_executed()).count();
        assert_eq!(executed, 11);

        let mut sequences: Vec<u64> = ledger
            .recent_trades(100)
            .unwrap()
            .iter()
            .map(|r| r.sequence_number)
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=executed as u64).collect::<Vec<_>>());

        let usdt = ledger.get_balance("USDT").unwrap();
        assert!(usdt >= Decimal::ZERO);
        assert_eq!(usdt, dec!(500));
        assert_eq!(ledger.get_balance("BTC").unwrap(), dec!(2.1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exact_sequence_claims_admit_one() {
        let (engine, ledger) = engine_with(dec!(15), dec!(45000));
        let engine = Arc::new(engine);

        let calls = (0..8).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .buy(
                        TradeRequest::new()
                            .with_request_id(format!("claim-{i}"))
                            .with_sequence(1),
                    )
                    .await
            })
        });
        let results: Vec<_> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::StaleSequence { .. })));
        assert_eq!(ledger.last_sequence("BTCUSDT", TradeAction::Buy).unwrap(), 1);
    }
}
