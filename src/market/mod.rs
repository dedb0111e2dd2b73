//! Synthetic market signals.
//!
//! The engine only needs an oscillator reading and a price per call; where
//! they come from is behind [`MarketSignalProvider`].

mod mock;
mod traits;

pub use mock::{MockMarketSignal, StaticMarketSignal};
pub use traits::{MarketSignal, MarketSignalProvider};

#[cfg(test)]
pub use traits::MockMarketSignalProvider;
