//! Trading pair parsing.

/// Quote currencies recognised by suffix, in match order.
const QUOTE_CANDIDATES: [&str; 4] = ["USDT", "USD", "USDC", "EUR"];

/// Quote asset assumed when no known suffix matches.
const FALLBACK_QUOTE: &str = "USDT";

/// Base and quote assets of a trading pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPair {
    pub base: String,
    pub quote: String,
}

/// Split a pair such as `BTCUSDT` into base and quote assets.
///
/// Unknown formats fall back to the whole pair as base with a USDT quote.
pub fn parse_pair(pair: &str) -> AssetPair {
    let pair = pair.to_uppercase();

    for quote in QUOTE_CANDIDATES {
        if let Some(base) = pair.strip_suffix(quote) {
            if !base.is_empty() {
                return AssetPair {
                    base: base.to_string(),
                    quote: quote.to_string(),
                };
            }
        }
    }

    AssetPair {
        base: pair,
        quote: FALLBACK_QUOTE.to_string(),
    }
}
