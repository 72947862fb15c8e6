use tracing::warn;

use crate::db::TradeRow;

/// Telegram notification client. If token/chat_id are missing, all methods
/// are no-ops.
#[derive(Clone)]
pub struct Alerts {
    bot_token: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
}

impl Alerts {
    pub fn new() -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty());

        if bot_token.is_some() && chat_id.is_some() {
            tracing::info!("Telegram alerts enabled");
        } else {
            tracing::info!("Telegram alerts disabled (missing TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID)");
        }

        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    /// Send a message. Fire and forget; failures only warn.
    pub async fn send_now(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Telegram API error: {}", resp.status());
            }
            Err(e) => {
                warn!("Telegram send failed: {}", e);
            }
            _ => {}
        }
    }

    pub async fn trade_entry(&self, trade: &TradeRow) {
        let msg = format!(
            "<b>Trade Entered</b>\n\
             {} {} {} on {}\n\
             {} @ ${:.2} | {:.0} shares = ${:.2}\n\
             p={:.1}% | edge={:.1}pp | reason: {}",
            html_escape(&trade.city),
            trade.date,
            html_escape(&trade.range_name),
            trade.venue,
            trade.side,
            trade.entry_price,
            trade.shares,
            trade.cost,
            trade.entry_probability * 100.0,
            trade.edge_pct.unwrap_or(0.0),
            trade.entry_reason,
        );
        self.send_now(&msg).await;
    }

    pub async fn trade_exit(&self, trade: &TradeRow, exit_price: f64, pnl: f64) {
        let msg = format!(
            "<b>Trade Exited</b>\n\
             {} {} {} on {}\n\
             {} exit @ ${:.2} | P&L ${:+.2}",
            html_escape(&trade.city),
            trade.date,
            html_escape(&trade.range_name),
            trade.venue,
            trade.side,
            exit_price,
            pnl,
        );
        self.send_now(&msg).await;
    }
}

impl Default for Alerts {
    fn default() -> Self {
        Self::new()
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_credentials() {
        // Construct directly so ambient env vars can't flip the result
        let alerts = Alerts {
            bot_token: None,
            chat_id: None,
            client: reqwest::Client::new(),
        };
        assert!(!alerts.is_enabled());
    }

    #[tokio::test]
    async fn test_send_is_noop_when_disabled() {
        let alerts = Alerts {
            bot_token: None,
            chat_id: None,
            client: reqwest::Client::new(),
        };
        // Must not panic or attempt network I/O
        alerts.send_now("hello").await;
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
