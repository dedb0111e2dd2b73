//! Shared utilities: decimal helpers, pair parsing and identifiers.

pub mod decimal;
mod ids;
mod pair;

pub use ids::{generate_request_id, generate_transaction_id, mask_secret};
pub use pair::{parse_pair, AssetPair};
