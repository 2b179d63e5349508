// =============================================================================
// Notifier — downstream notification collaborator (interface-level only)
// =============================================================================
//
// The chat dispatch transport and HTML formatting of a winning card are
// out of scope for this service (spec.md §1, §6); what lives here is the
// seam SignalService hands a card across. `LoggingNotifier` is a stand-in
// that satisfies the interface without a real transport.
// =============================================================================

use tracing::info;

use crate::types::ProposalCard;

/// `send_card` carries the structured card; formatting it into HTML and
/// inline actions is the receiver's job. `post_json` is a fire-and-forget
/// postback used by some collaborators instead of (or alongside) chat.
///
/// Both methods take `&self` rather than requiring `async fn` in the
/// trait: the real transport (HTTP POST to a chat webhook) is out of
/// scope here, so there is nothing in this crate that needs to suspend.
/// A transport-backed implementation is free to spawn its own task.
pub trait Notifier: Send + Sync {
    fn send_card(&self, card: &ProposalCard);
    fn post_json(&self, url: &str, card: &ProposalCard);
}

/// Logs cards instead of dispatching them anywhere. Used until a real
/// chat-transport collaborator is wired in.
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn send_card(&self, card: &ProposalCard) {
        info!(
            symbol = %card.symbol,
            strategy = %card.strategy,
            side = %card.side,
            entry = card.entry,
            stop = card.stop,
            confidence = card.confidence,
            "proposal card dispatched"
        );
    }

    fn post_json(&self, url: &str, card: &ProposalCard) {
        info!(url, symbol = %card.symbol, "postback skipped (no transport configured)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn card() -> ProposalCard {
        ProposalCard {
            symbol: "BTCUSDT".to_string(),
            strategy: "vol_breakout_card".to_string(),
            side: Side::Long,
            entry: 100.0,
            stop: 98.0,
            leverage_suggest: 5,
            position_usdt: 100.0,
            max_risk_usdt: 10.0,
            ttl_minutes: 10,
            rationale: "test".to_string(),
            priority: 40,
            confidence: 70,
            created_at_ms: 0,
        }
    }

    #[test]
    fn logging_notifier_accepts_a_card() {
        LoggingNotifier.send_card(&card());
        LoggingNotifier.post_json("https://example.invalid/hook", &card());
    }
}
