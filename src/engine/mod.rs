//! Trade execution engine.
//!
//! One call runs the whole pipeline:
//! 1. Normalize the request against the current trading configuration
//! 2. Seed balances for assets seen for the first time
//! 3. Sample the market signal (bounded by a timeout)
//! 4. Fingerprint the request and replay any recorded execution
//! 5. Validate the per-(pair, action) sequence number
//! 6. Check the signal threshold, unless forced
//! 7. Check available funds
//! 8. Commit balances, trade record and sequence tracker atomically
//!
//! Steps 4, 5 and 7 are repeated inside the commit transaction, so callers
//! racing on the same ledger cannot double-execute, skip a sequence number or
//! overdraw an asset.

mod error;
mod executor;
pub mod fingerprint;
pub mod sequence;
mod types;

pub use error::EngineError;
pub use executor::TradeEngine;
pub use types::{
    NormalizedRequest, RejectReason, StatusReport, TradeRequest, TradeResponse,
    MAX_CLIENT_REF_LEN,
};
