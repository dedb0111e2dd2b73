//! Notification text.

use crate::ledger::TradeAction;
use rust_decimal::Decimal;

/// Render the alert sent after an executed trade.
pub fn format_trade_notification(
    pair: &str,
    action: TradeAction,
    signal: Decimal,
    price: Option<Decimal>,
) -> String {
    let marker = match action {
        TradeAction::Buy => "🟢",
        TradeAction::Sell => "🔴",
    };

    let mut message = format!(
        "{marker} Trade Executed\n\nPair: {pair}\nAction: {action}\nRSI: {:.2}",
        signal
    );

    if let Some(price) = price.filter(|p| !p.is_zero()) {
        message.push_str(&format!("\nPrice: ${}", with_thousands(price)));
    }

    message.push_str("\n\nThis is a simulated trade for testing purposes.");
    message
}

/// `45123.4` -> `45,123.40`
fn with_thousands(value: Decimal) -> String {
    let rendered = format!("{:.2}", value.abs());
    let (int_part, frac_part) = rendered.split_once('.').unwrap_or((rendered.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value.is_sign_negative() && !value.is_zero() { "-" } else { "" };
    format!("{sign}{grouped}.{frac_part}")
}
