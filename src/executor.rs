use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alerts::Alerts;
use crate::config::{GuaranteedEntryConfig, SizingConfig};
use crate::db::{Database, TradeRow};
use crate::scanner::{kelly_fraction, Opportunity, Side};
use crate::venue::VenueClient;

/// Converts approved opportunities into sized positions. Owns both
/// bankrolls and the per-date NO accumulator; all entries run sequentially
/// through `&mut self`, which keeps sizing, dedup, order, persist and
/// deduct atomic with respect to each other.
pub struct Executor {
    db: Arc<Mutex<Database>>,
    venues: Arc<VenueClient>,
    alerts: Arc<Alerts>,
    sizing: SizingConfig,
    gw: GuaranteedEntryConfig,
    yes_bankroll: f64,
    no_bankroll: f64,
    no_exposure_by_date: HashMap<String, f64>,
}

impl Executor {
    /// Bankrolls start from the configured totals minus the cost of open
    /// positions, so a restart never double-spends.
    pub async fn new(
        db: Arc<Mutex<Database>>,
        venues: Arc<VenueClient>,
        alerts: Arc<Alerts>,
        sizing: SizingConfig,
        gw: GuaranteedEntryConfig,
    ) -> Result<Self> {
        let (yes_open, no_open, no_by_date) = {
            let db = db.lock().await;
            (
                db.sum_open_cost("YES")?,
                db.sum_open_cost("NO")?,
                db.open_no_cost_by_date()?,
            )
        };
        let yes_bankroll = sizing.yes_bankroll - yes_open;
        let no_bankroll = sizing.no_bankroll - no_open;
        info!(
            "Executor bankrolls: YES ${:.2} (${:.2} open), NO ${:.2} (${:.2} open)",
            yes_bankroll, yes_open, no_bankroll, no_open
        );
        Ok(Executor {
            db,
            venues,
            alerts,
            sizing,
            gw,
            yes_bankroll,
            no_bankroll,
            no_exposure_by_date: no_by_date,
        })
    }

    pub fn yes_bankroll(&self) -> f64 {
        self.yes_bankroll
    }

    pub fn no_bankroll(&self) -> f64 {
        self.no_bankroll
    }

    pub fn no_exposure(&self, date: &str) -> f64 {
        self.no_exposure_by_date.get(date).copied().unwrap_or(0.0)
    }

    /// Model-driven entries, processed sequentially so bankroll accounting
    /// stays serialized.
    pub async fn execute(&mut self, approved: Vec<Opportunity>) -> Vec<TradeRow> {
        let mut trades = Vec::new();
        for op in approved {
            match self.execute_one(&op, None).await {
                Ok(Some(trade)) => trades.push(trade),
                Ok(None) => {}
                Err(e) => warn!("Execution failed for {} {}: {}", op.city, op.range.name, e),
            }
        }
        trades
    }

    /// Guaranteed-win entries run the same dedup and bankroll gates but are
    /// sized at a fixed bankroll fraction with entry probability 1.0.
    pub async fn execute_guaranteed_wins(&mut self, approved: Vec<Opportunity>) -> Vec<TradeRow> {
        let fixed = self.gw.max_bankroll_pct;
        let mut trades = Vec::new();
        for op in approved {
            match self.execute_one(&op, Some(fixed)).await {
                Ok(Some(trade)) => trades.push(trade),
                Ok(None) => {}
                Err(e) => warn!(
                    "Guaranteed-win execution failed for {} {}: {}",
                    op.city, op.range.name, e
                ),
            }
        }
        trades
    }

    async fn execute_one(
        &mut self,
        op: &Opportunity,
        fixed_fraction: Option<f64>,
    ) -> Result<Option<TradeRow>> {
        let bankroll = match op.side {
            Side::Yes => self.yes_bankroll,
            Side::No => self.no_bankroll,
        };

        // 1. Depleted side bankroll (strict: == MIN_BET still skips).
        if bankroll <= self.sizing.min_bet {
            info!(
                "Skipping {} {} {}: bankroll depleted (${:.2})",
                op.city, op.side, op.range.name, bankroll
            );
            return Ok(None);
        }

        // 2. The scanner already filters dead markets; re-check anyway.
        if op.range.volume <= 0.0 {
            info!("Skipping {} {}: zero volume", op.city, op.range.name);
            return Ok(None);
        }

        // 3. Per-date NO exposure cap.
        let no_allowance = if op.side == Side::No {
            let spent = self.no_exposure(&op.date);
            if spent >= self.sizing.no_max_per_date {
                info!(
                    "Skipping NO {} {}: date allowance exhausted (${:.2})",
                    op.city, op.date, spent
                );
                return Ok(None);
            }
            let remaining = self.sizing.no_max_per_date - spent;
            if remaining < self.sizing.min_bet {
                info!(
                    "Skipping NO {} {}: remaining allowance ${:.2} below minimum bet",
                    op.city, op.date, remaining
                );
                return Ok(None);
            }
            Some(remaining)
        } else {
            None
        };

        // 4 + 5. Duplicate and mutual-exclusivity checks against the store
        // ('open' and 'resolved' both count, so checks survive restart). DB failure
        // refuses the entry.
        {
            let db = self.db.lock().await;
            let dup = db.has_position(
                &op.city,
                &op.date,
                &op.range.name,
                op.side.as_str(),
                op.venue.as_str(),
            );
            match dup {
                Ok(true) => {
                    info!("Skipping {} {}: existing position", op.city, op.range.name);
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Duplicate check failed, refusing entry (fail closed): {}", e);
                    return Ok(None);
                }
            }
            match db.has_open_side(&op.city, &op.date, op.venue.as_str(), op.side.as_str()) {
                Ok(true) => {
                    info!(
                        "Skipping {} {} {}: side already open for city/date",
                        op.city, op.side, op.date
                    );
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Open-side check failed, refusing entry (fail closed): {}", e);
                    return Ok(None);
                }
            }
            // Opposite side of the same range may have filled earlier in
            // this very batch; the persisted row catches it.
            match db.has_open_range(&op.city, &op.date, &op.range.name, op.venue.as_str()) {
                Ok(true) => {
                    info!(
                        "Skipping {} {} {}: range already has an open leg",
                        op.city, op.side, op.range.name
                    );
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Open-range check failed, refusing entry (fail closed): {}", e);
                    return Ok(None);
                }
            }
        }

        // 6. Sizing.
        let effective_cost = op.ask + op.fee;
        let net_profit = 1.0 - effective_cost;
        if net_profit <= 0.0 {
            info!(
                "Skipping {} {}: no profit at effective cost {:.3}",
                op.city, op.range.name, effective_cost
            );
            return Ok(None);
        }

        let fraction = match fixed_fraction {
            Some(f) => f,
            None => {
                let kelly = if op.kelly > 0.0 {
                    op.kelly
                } else {
                    kelly_fraction(
                        op.corrected_probability,
                        op.ask,
                        op.fee,
                        self.sizing.kelly_fraction,
                    )
                };
                kelly.min(self.sizing.max_bankroll_pct)
            }
        };
        if fraction <= 0.0 {
            info!("Skipping {} {}: zero sizing fraction", op.city, op.range.name);
            return Ok(None);
        }

        let mut dollars = bankroll * fraction;
        if let Some(allowance) = no_allowance {
            dollars = dollars.min(allowance);
        }
        dollars = dollars.min(bankroll);
        dollars = dollars.max(self.sizing.min_bet);

        let mut shares = (dollars / effective_cost).floor();
        if shares < 1.0 {
            info!("Skipping {} {}: sized to zero shares", op.city, op.range.name);
            return Ok(None);
        }

        // 7. Volume participation.
        if op.range.volume > 0.0 {
            let pct = shares / op.range.volume * 100.0;
            if pct > self.sizing.hard_reject_volume_pct {
                info!(
                    "Skipping {} {}: {:.1}% of visible volume exceeds hard cap",
                    op.city, op.range.name, pct
                );
                return Ok(None);
            }
            if let Some(cap) = self.sizing.max_volume_pct {
                let max_shares = (cap * op.range.volume).floor();
                if shares > max_shares {
                    shares = max_shares;
                    if shares < 1.0 || shares * effective_cost < self.sizing.min_bet {
                        info!(
                            "Skipping {} {}: volume clamp leaves less than the minimum bet",
                            op.city, op.range.name
                        );
                        return Ok(None);
                    }
                }
            }
        }

        // Fees are settled by the resolver; recorded cost is shares × ask.
        let cost = shares * op.ask;

        // 8. Order placement. Failure: warn, no trade row, no retry.
        let execution = match self
            .venues
            .execute_buy(
                op.venue,
                &op.range.token_id,
                op.side.as_str(),
                op.ask,
                shares,
            )
            .await
        {
            Ok(e) => e,
            Err(e) => {
                warn!("Order placement failed for {} {}: {}", op.city, op.range.name, e);
                return Ok(None);
            }
        };

        // 9. Trade row first, bankroll second. If the write fails the
        // bankroll must stay untouched.
        let entry_probability = match op.entry_reason {
            crate::scanner::EntryReason::GuaranteedWin
            | crate::scanner::EntryReason::GuaranteedWinMetarOnly => 1.0,
            _ => op.corrected_probability,
        };
        let trade = TradeRow {
            id: 0,
            trade_id: execution.order_id.clone(),
            opportunity_id: op.opportunity_id,
            city: op.city.clone(),
            date: op.date.clone(),
            venue: op.venue.as_str().to_string(),
            market_id: op.range.market_id.clone(),
            token_id: op.range.token_id.clone(),
            range_name: op.range.name.clone(),
            range_min: op.range.min,
            range_max: op.range.max,
            range_kind: op.range.kind.as_str().to_string(),
            side: op.side.as_str().to_string(),
            entry_price: op.ask,
            shares,
            cost,
            entry_fee: op.fee,
            entry_reason: op.entry_reason.as_str().to_string(),
            entry_probability,
            corrected_probability: Some(op.corrected_probability),
            edge_pct: Some(op.edge_pct),
            kelly: Some(fraction),
            forecast_temp: op.forecast_temp,
            forecast_stddev: op.forecast_stddev_c,
            sources_json: serde_json::to_string(
                &op.source_temps
                    .iter()
                    .map(|s| serde_json::json!({"source": s.source, "temp_f": s.temp_f, "used": s.used}))
                    .collect::<Vec<_>>(),
            )
            .ok(),
            market_snapshot_json: serde_json::to_string(&serde_json::json!({
                "bid": op.bid,
                "ask": op.ask,
                "spread": op.range.spread,
                "volume": op.range.volume,
                "bid_depth": op.range.bid_depth,
                "ask_depth": op.range.ask_depth,
            }))
            .ok(),
            evaluator_log_json: "[]".to_string(),
            current_price: Some(op.ask),
            max_price_seen: Some(op.ask),
            min_probability_seen: Some(entry_probability),
            status: "open".to_string(),
            pnl: None,
            fees: None,
            created_at: String::new(),
        };

        {
            let db = self.db.lock().await;
            if let Err(e) = db.insert_trade(&trade) {
                error!(
                    "Trade persist failed for {} {} (bankroll untouched): {}",
                    op.city, op.range.name, e
                );
                return Ok(None);
            }
        }

        match op.side {
            Side::Yes => self.yes_bankroll -= cost,
            Side::No => {
                self.no_bankroll -= cost;
                *self.no_exposure_by_date.entry(op.date.clone()).or_insert(0.0) += cost;
            }
        }

        info!(
            "ENTERED {} {} {} on {}: {:.0} shares @ {:.2} = ${:.2} ({})",
            op.city, op.side, op.range.name, op.venue, shares, op.ask, cost, op.entry_reason
        );

        // 10. Fire-and-forget alert.
        self.alerts.trade_entry(&trade).await;

        Ok(Some(trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingMode;
    use crate::scanner::EntryReason;
    use crate::units::TempUnit;
    use crate::venue::{Range, RangeKind, Venue};

    fn paper_venues() -> Arc<VenueClient> {
        Arc::new(VenueClient::with_client(
            reqwest::Client::new(),
            "http://unused".to_string(),
            TradingMode::Paper,
        ))
    }

    fn silent_alerts() -> Arc<Alerts> {
        // No credentials → every call is a no-op
        Arc::new(Alerts::new())
    }

    fn sample_range(bid: f64, ask: f64, volume: f64) -> Range {
        Range {
            venue: Venue::Polymarket,
            market_id: "mkt1".to_string(),
            token_id: "tok1".to_string(),
            name: "70-75°F".to_string(),
            min: Some(70.0),
            max: Some(75.0),
            kind: RangeKind::Bounded,
            unit: TempUnit::Fahrenheit,
            bid,
            ask,
            spread: (ask - bid).max(0.0),
            volume,
            bid_depth: None,
            ask_depth: None,
        }
    }

    fn sample_opportunity(side: Side, ask: f64, kelly: f64) -> Opportunity {
        let range = sample_range(ask - 0.03, ask, 5000.0);
        Opportunity {
            opportunity_id: None,
            city: "nyc".to_string(),
            date: "2026-02-20".to_string(),
            venue: Venue::Polymarket,
            range,
            side,
            raw_probability: 0.522,
            corrected_probability: 0.522,
            correction_ratio: 1.0,
            edge_pct: 14.2,
            kelly,
            ask,
            bid: ask - 0.03,
            fee: 0.0,
            entry_reason: EntryReason::Model,
            calibration_bucket: None,
            forecast_temp: Some(72.5),
            forecast_stddev_c: Some(2.0),
            hours_to_resolution: Some(20.0),
            source_temps: Vec::new(),
        }
    }

    async fn executor_with(sizing: SizingConfig) -> (Executor, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let executor = Executor::new(
            db.clone(),
            paper_venues(),
            silent_alerts(),
            sizing,
            GuaranteedEntryConfig::default(),
        )
        .await
        .unwrap();
        (executor, db)
    }

    #[tokio::test]
    async fn test_clean_yes_entry_sizing() {
        let (mut executor, db) = executor_with(SizingConfig::default()).await;
        assert!((executor.yes_bankroll() - 1000.0).abs() < 1e-9);

        // Scanner Kelly 0.229 full → capped at MAX_BANKROLL_PCT 0.05 →
        // $50 → floor(50/0.38) = 131 shares → cost $49.78
        let op = sample_opportunity(Side::Yes, 0.38, 0.229);
        let trades = executor.execute(vec![op]).await;
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.shares, 131.0);
        assert!((t.cost - 131.0 * 0.38).abs() < 0.01);
        assert!((t.cost - t.shares * t.entry_price).abs() < 0.01);
        assert!((executor.yes_bankroll() - (1000.0 - t.cost)).abs() < 1e-9);

        // The row is persisted with the open state
        let open = db.lock().await.get_open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, "YES");
    }

    #[tokio::test]
    async fn test_bankroll_depletion_skips() {
        let sizing = SizingConfig {
            yes_bankroll: 20.0,
            min_bet: 25.0,
            ..SizingConfig::default()
        };
        let (mut executor, db) = executor_with(sizing).await;

        let op = sample_opportunity(Side::Yes, 0.38, 0.2);
        let trades = executor.execute(vec![op]).await;
        assert!(trades.is_empty());
        assert!(db.lock().await.get_open_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bankroll_exactly_min_bet_skips() {
        let sizing = SizingConfig {
            yes_bankroll: 25.0,
            min_bet: 25.0,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;
        let op = sample_opportunity(Side::Yes, 0.38, 0.2);
        assert!(executor.execute(vec![op]).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_suppressed_after_persist() {
        let (mut executor, _db) = executor_with(SizingConfig::default()).await;
        let op = sample_opportunity(Side::Yes, 0.38, 0.2);

        let first = executor.execute(vec![op.clone()]).await;
        assert_eq!(first.len(), 1);
        let bankroll_after = executor.yes_bankroll();

        // Same opportunity again: duplicate check hits the persisted row
        let second = executor.execute(vec![op]).await;
        assert!(second.is_empty());
        assert!((executor.yes_bankroll() - bankroll_after).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_side_mutual_exclusivity_across_ranges() {
        let (mut executor, _db) = executor_with(SizingConfig::default()).await;
        let first = sample_opportunity(Side::Yes, 0.38, 0.2);
        assert_eq!(executor.execute(vec![first]).await.len(), 1);

        // Different range, same (city, date, venue, side)
        let mut second = sample_opportunity(Side::Yes, 0.30, 0.2);
        second.range.name = "75-80°F".to_string();
        second.range.token_id = "tok2".to_string();
        second.range.min = Some(75.0);
        second.range.max = Some(80.0);
        assert!(executor.execute(vec![second]).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_per_date_cap() {
        let sizing = SizingConfig {
            no_bankroll: 10_000.0,
            no_max_per_date: 100.0,
            max_bankroll_pct: 1.0,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;

        // Large Kelly; the date allowance caps dollars at $100
        let op = sample_opportunity(Side::No, 0.50, 0.9);
        let trades = executor.execute(vec![op]).await;
        assert_eq!(trades.len(), 1);
        assert!(trades[0].cost <= 100.0 + 1e-9);
        assert!(executor.no_exposure("2026-02-20") <= 100.0 + 1e-9);

        // Second NO on the same date (other venue to dodge exclusivity)
        let mut op2 = sample_opportunity(Side::No, 0.50, 0.9);
        op2.venue = Venue::Kalshi;
        op2.range.venue = Venue::Kalshi;
        op2.range.name = "60-65°F".to_string();
        op2.range.min = Some(60.0);
        op2.range.max = Some(65.0);
        let trades2 = executor.execute(vec![op2]).await;
        // Date allowance already spent → skipped
        assert!(trades2.is_empty());
    }

    #[tokio::test]
    async fn test_negative_net_profit_aborts() {
        let (mut executor, _db) = executor_with(SizingConfig::default()).await;
        let mut op = sample_opportunity(Side::Yes, 0.96, 0.2);
        op.fee = 0.05; // effective cost 1.01 → net −0.01
        assert!(executor.execute(vec![op]).await.is_empty());
    }

    #[tokio::test]
    async fn test_hard_volume_reject() {
        let sizing = SizingConfig {
            hard_reject_volume_pct: 10.0,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;
        let mut op = sample_opportunity(Side::Yes, 0.38, 0.2);
        op.range.volume = 500.0; // 131 shares ≈ 26% > 10%
        assert!(executor.execute(vec![op]).await.is_empty());
    }

    #[tokio::test]
    async fn test_soft_volume_clamp() {
        let sizing = SizingConfig {
            max_volume_pct: Some(0.02),
            min_bet: 10.0,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;
        let mut op = sample_opportunity(Side::Yes, 0.38, 0.2);
        op.range.volume = 4000.0; // clamp at floor(0.02 × 4000) = 80 shares
        let trades = executor.execute(vec![op]).await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].shares, 80.0);
    }

    #[tokio::test]
    async fn test_recompute_kelly_when_missing() {
        let (mut executor, _db) = executor_with(SizingConfig::default()).await;
        // Scanner passed zero Kelly; executor recomputes from probability
        let op = sample_opportunity(Side::Yes, 0.38, 0.0);
        let trades = executor.execute(vec![op]).await;
        assert_eq!(trades.len(), 1);
        assert!(trades[0].kelly.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_guaranteed_win_fixed_sizing() {
        let sizing = SizingConfig {
            no_bankroll: 1000.0,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;

        // Scenario: bounded NO at yes bid 0.10 → NO ask 0.90, margin 0.10
        let mut op = sample_opportunity(Side::No, 0.90, 0.0);
        op.entry_reason = EntryReason::GuaranteedWin;
        op.raw_probability = 1.0;
        op.corrected_probability = 1.0;
        op.range.bid = 0.10;
        op.range.ask = 0.12;
        op.bid = 0.88;

        let trades = executor.execute_guaranteed_wins(vec![op]).await;
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        // dollars = 0.10 × 1000 = 100 → shares = floor(100 / 0.90) = 111
        assert_eq!(t.shares, 111.0);
        assert_eq!(t.entry_reason, "guaranteed_win");
        assert!((t.entry_probability - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_min_bet_floor_applies() {
        let sizing = SizingConfig {
            yes_bankroll: 1000.0,
            min_bet: 25.0,
            max_bankroll_pct: 0.05,
            ..SizingConfig::default()
        };
        let (mut executor, _db) = executor_with(sizing).await;
        // Tiny Kelly → dollars would be $5, floored to $25
        let op = sample_opportunity(Side::Yes, 0.38, 0.005);
        let trades = executor.execute(vec![op]).await;
        assert_eq!(trades.len(), 1);
        let expected_shares = (25.0_f64 / 0.38).floor();
        assert_eq!(trades[0].shares, expected_shares);
    }

    #[tokio::test]
    async fn test_startup_bankroll_subtracts_open_cost() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        {
            let conn = db.lock().await;
            // Pre-existing open YES position costing $300
            let mut t = TradeRow {
                id: 0,
                trade_id: "preexisting".to_string(),
                opportunity_id: None,
                city: "chi".to_string(),
                date: "2026-02-19".to_string(),
                venue: "kalshi".to_string(),
                market_id: "m".to_string(),
                token_id: "tok".to_string(),
                range_name: "50-55°F".to_string(),
                range_min: Some(50.0),
                range_max: Some(55.0),
                range_kind: "bounded".to_string(),
                side: "YES".to_string(),
                entry_price: 0.30,
                shares: 1000.0,
                cost: 300.0,
                entry_fee: 0.0,
                entry_reason: "model".to_string(),
                entry_probability: 0.5,
                corrected_probability: None,
                edge_pct: None,
                kelly: None,
                forecast_temp: None,
                forecast_stddev: None,
                sources_json: None,
                market_snapshot_json: None,
                evaluator_log_json: "[]".to_string(),
                current_price: None,
                max_price_seen: None,
                min_probability_seen: None,
                status: "open".to_string(),
                pnl: None,
                fees: None,
                created_at: String::new(),
            };
            conn.insert_trade(&t).unwrap();
            t.trade_id = "preexisting-no".to_string();
            t.side = "NO".to_string();
            t.cost = 150.0;
            t.range_name = "60-65°F".to_string();
            conn.insert_trade(&t).unwrap();
        }

        let executor = Executor::new(
            db,
            paper_venues(),
            silent_alerts(),
            SizingConfig::default(),
            GuaranteedEntryConfig::default(),
        )
        .await
        .unwrap();

        assert!((executor.yes_bankroll() - 700.0).abs() < 1e-9);
        assert!((executor.no_bankroll() - 850.0).abs() < 1e-9);
        assert!((executor.no_exposure("2026-02-19") - 150.0).abs() < 1e-9);
    }
}
