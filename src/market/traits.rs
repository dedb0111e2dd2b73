//! Provider-agnostic market signal trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

/// One atomic sample for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarketSignal {
    /// Oscillator reading (RSI-like, 0-100)
    pub signal: Decimal,
    /// Price in the pair's quote currency
    pub price: Decimal,
}

impl MarketSignal {
    pub fn new(signal: Decimal, price: Decimal) -> Self {
        Self { signal, price }
    }
}

/// Source of signal and price readings.
///
/// Implementations must return both values from the same sample so the
/// threshold check and the fill price agree.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketSignalProvider: Send + Sync {
    /// Sample the oscillator and price for `pair`.
    async fn sample(&self, pair: &str) -> anyhow::Result<MarketSignal>;
}
