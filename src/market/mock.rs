//! Simulated market signal providers.

use super::traits::{MarketSignal, MarketSignalProvider};
use crate::utils::decimal::{from_f64_rounded, round_price, PRICE_DP};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::debug;

/// Random oscillator and jittered price around a per-pair base.
pub struct MockMarketSignal {
    base_prices: HashMap<String, Decimal>,
    fallback_price: Decimal,
    /// Inclusive oscillator range
    signal_range: (f64, f64),
    /// Maximum relative price deviation (0.02 = ±2%)
    max_jitter: f64,
}

impl Default for MockMarketSignal {
    fn default() -> Self {
        let base_prices = HashMap::from([
            ("BTCUSDT".to_string(), dec!(45000)),
            ("ETHUSDT".to_string(), dec!(2500)),
            ("BNBUSDT".to_string(), dec!(300)),
        ]);

        Self {
            base_prices,
            fallback_price: dec!(100),
            signal_range: (10.0, 90.0),
            max_jitter: 0.02,
        }
    }
}

impl MockMarketSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override or add the base price for a pair.
    pub fn with_base_price(mut self, pair: &str, price: Decimal) -> Self {
        self.base_prices.insert(pair.to_uppercase(), price);
        self
    }

    /// Base price before jitter; unknown pairs get the fallback.
    pub fn base_price(&self, pair: &str) -> Decimal {
        self.base_prices
            .get(&pair.to_uppercase())
            .copied()
            .unwrap_or(self.fallback_price)
    }
}

#[async_trait]
impl MarketSignalProvider for MockMarketSignal {
    async fn sample(&self, pair: &str) -> Result<MarketSignal> {
        let (signal, jitter) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(self.signal_range.0..=self.signal_range.1),
                rng.gen_range(-self.max_jitter..=self.max_jitter),
            )
        };

        let base = self.base_price(pair);
        let price = round_price(base * (Decimal::ONE + from_f64_rounded(jitter, 6)));
        let signal = from_f64_rounded(signal, PRICE_DP);

        debug!(%pair, %signal, %price, "Sampled mock market signal");
        Ok(MarketSignal { signal, price })
    }
}

/// Always returns the same reading.
#[derive(Debug, Clone, Copy)]
pub struct StaticMarketSignal {
    reading: MarketSignal,
}

impl StaticMarketSignal {
    pub fn new(signal: Decimal, price: Decimal) -> Self {
        Self {
            reading: MarketSignal::new(signal, price),
        }
    }
}

#[async_trait]
impl MarketSignalProvider for StaticMarketSignal {
    async fn sample(&self, _pair: &str) -> Result<MarketSignal> {
        Ok(self.reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_signal_stays_in_bounds() {
        let provider = MockMarketSignal::new();
        for _ in 0..200 {
            let sample = provider.sample("BTCUSDT").await.unwrap();
            assert!(sample.signal >= dec!(10) && sample.signal <= dec!(90));
            assert!(sample.price >= dec!(44100) && sample.price <= dec!(45900));
            assert_eq!(sample.price, sample.price.round_dp(2));
        }
    }

    #[tokio::test]
    async fn test_unknown_pair_uses_fallback_price() {
        let provider = MockMarketSignal::new();
        assert_eq!(provider.base_price("XRPUSDT"), dec!(100));

        let sample = provider.sample("XRPUSDT").await.unwrap();
        assert!(sample.price >= dec!(98) && sample.price <= dec!(102));
    }

    #[tokio::test]
    async fn test_base_price_override() {
        let provider = MockMarketSignal::new().with_base_price("solusdt", dec!(150));
        assert_eq!(provider.base_price("SOLUSDT"), dec!(150));
    }

    #[tokio::test]
    async fn test_static_signal() {
        let provider = StaticMarketSignal::new(dec!(15), dec!(45000));
        let sample = provider.sample("anything").await.unwrap();
        assert_eq!(sample, MarketSignal::new(dec!(15), dec!(45000)));
    }
}
