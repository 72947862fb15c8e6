use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// One position row. `status` is 'open' → 'exited' (user-initiated) or
/// 'resolved' (settled); monetary fields are frozen once resolved.
#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub trade_id: String,
    pub opportunity_id: Option<i64>,
    pub city: String,
    pub date: String,
    pub venue: String,
    pub market_id: String,
    pub token_id: String,
    pub range_name: String,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_kind: String,
    pub side: String,
    pub entry_price: f64,
    pub shares: f64,
    pub cost: f64,
    pub entry_fee: f64,
    pub entry_reason: String,
    pub entry_probability: f64,
    pub corrected_probability: Option<f64>,
    pub edge_pct: Option<f64>,
    pub kelly: Option<f64>,
    pub forecast_temp: Option<f64>,
    pub forecast_stddev: Option<f64>,
    pub sources_json: Option<String>,
    pub market_snapshot_json: Option<String>,
    pub evaluator_log_json: String,
    pub current_price: Option<f64>,
    pub max_price_seen: Option<f64>,
    pub min_probability_seen: Option<f64>,
    pub status: String,
    pub pnl: Option<f64>,
    pub fees: Option<f64>,
    pub created_at: String,
}

/// One row per scanner evaluation. Append-only; never mutated except by the
/// resolver filling `outcome_yes`.
#[derive(Debug, Clone)]
pub struct OpportunityRecord {
    pub cycle: i64,
    pub city: String,
    pub date: String,
    pub venue: String,
    pub market_id: String,
    pub token_id: String,
    pub range_name: String,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub range_kind: String,
    pub side: String,
    pub raw_probability: f64,
    pub corrected_probability: f64,
    pub correction_ratio: f64,
    pub edge_pct: f64,
    pub kelly: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    pub hours_to_resolution: Option<f64>,
    pub forecast_temp: Option<f64>,
    pub forecast_stddev: Option<f64>,
    pub action: String,
    pub filter_reason: Option<String>,
    pub entry_reason: Option<String>,
    pub calibration_bucket: Option<String>,
    // ML feature columns
    pub forecast_to_near_edge: Option<f64>,
    pub forecast_to_far_edge: Option<f64>,
    pub forecast_in_range: Option<bool>,
    pub source_disagreement_deg: Option<f64>,
    pub market_implied_divergence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AccuracyRow {
    pub city: String,
    pub date: String,
    pub source: String,
    pub unit: String,
    pub lead_bucket: String,
    /// Signed error, forecast − actual, in the city's native unit.
    pub error: f64,
}

/// Resolved opportunity join row feeding market/model calibration.
#[derive(Debug, Clone)]
pub struct ResolvedOppRow {
    pub city: String,
    pub venue: String,
    pub range_kind: String,
    pub side: String,
    pub lead_bucket: String,
    pub ask: f64,
    pub raw_probability: f64,
    /// Whether the evaluated side won.
    pub side_won: bool,
}

#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub city: String,
    pub date: String,
    pub station_id: String,
    pub running_high_c: Option<f64>,
    pub running_high_f: Option<f64>,
    pub wu_high_c: Option<f64>,
    pub wu_high_f: Option<f64>,
    pub observed_at: String,
    pub observation_count: i64,
}

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;

        let db = Database { conn };
        db.run_migrations()?;
        db.enable_wal()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    // ─── Trades ───

    pub fn insert_trade(&self, t: &TradeRow) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO trades (trade_id, opportunity_id, city, date, venue, market_id, token_id, \
                 range_name, range_min, range_max, range_kind, side, entry_price, shares, cost, \
                 entry_fee, entry_reason, entry_probability, corrected_probability, edge_pct, kelly, \
                 forecast_temp, forecast_stddev, sources_json, market_snapshot_json, evaluator_log_json, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
                rusqlite::params![
                    t.trade_id,
                    t.opportunity_id,
                    t.city,
                    t.date,
                    t.venue,
                    t.market_id,
                    t.token_id,
                    t.range_name,
                    t.range_min,
                    t.range_max,
                    t.range_kind,
                    t.side,
                    t.entry_price,
                    t.shares,
                    t.cost,
                    t.entry_fee,
                    t.entry_reason,
                    t.entry_probability,
                    t.corrected_probability,
                    t.edge_pct,
                    t.kelly,
                    t.forecast_temp,
                    t.forecast_stddev,
                    t.sources_json,
                    t.market_snapshot_json,
                    t.evaluator_log_json,
                    t.status,
                ],
            )
            .context("Failed to insert trade")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
        Ok(TradeRow {
            id: row.get(0)?,
            trade_id: row.get(1)?,
            opportunity_id: row.get(2)?,
            city: row.get(3)?,
            date: row.get(4)?,
            venue: row.get(5)?,
            market_id: row.get(6)?,
            token_id: row.get(7)?,
            range_name: row.get(8)?,
            range_min: row.get(9)?,
            range_max: row.get(10)?,
            range_kind: row.get(11)?,
            side: row.get(12)?,
            entry_price: row.get(13)?,
            shares: row.get(14)?,
            cost: row.get(15)?,
            entry_fee: row.get(16)?,
            entry_reason: row.get(17)?,
            entry_probability: row.get(18)?,
            corrected_probability: row.get(19)?,
            edge_pct: row.get(20)?,
            kelly: row.get(21)?,
            forecast_temp: row.get(22)?,
            forecast_stddev: row.get(23)?,
            sources_json: row.get(24)?,
            market_snapshot_json: row.get(25)?,
            evaluator_log_json: row.get(26)?,
            current_price: row.get(27)?,
            max_price_seen: row.get(28)?,
            min_probability_seen: row.get(29)?,
            status: row.get(30)?,
            pnl: row.get(31)?,
            fees: row.get(32)?,
            created_at: row.get(33)?,
        })
    }

    const TRADE_COLUMNS: &'static str =
        "id, trade_id, opportunity_id, city, date, venue, market_id, token_id, range_name, \
         range_min, range_max, range_kind, side, entry_price, shares, cost, entry_fee, \
         entry_reason, entry_probability, corrected_probability, edge_pct, kelly, forecast_temp, \
         forecast_stddev, sources_json, market_snapshot_json, evaluator_log_json, current_price, \
         max_price_seen, min_probability_seen, status, pnl, fees, created_at";

    pub fn get_open_trades(&self) -> Result<Vec<TradeRow>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE status = 'open' ORDER BY id",
            Self::TRADE_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare open trades query")?;
        let rows = stmt
            .query_map([], Self::trade_from_row)
            .context("Failed to query open trades")?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.context("Failed to read trade row")?);
        }
        Ok(trades)
    }

    /// Duplicate check across restart: 'open' and 'resolved' rows both count.
    pub fn has_position(
        &self,
        city: &str,
        date: &str,
        range_name: &str,
        side: &str,
        venue: &str,
    ) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE city = ?1 AND date = ?2 AND range_name = ?3 \
                 AND side = ?4 AND venue = ?5 AND status IN ('open', 'resolved')",
                rusqlite::params![city, date, range_name, side, venue],
                |row| row.get(0),
            )
            .context("Failed to run duplicate position check")?;
        Ok(count > 0)
    }

    /// Any open trade on this exact range, either side. Both legs of one
    /// range cannot win.
    pub fn has_open_range(&self, city: &str, date: &str, range_name: &str, venue: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE city = ?1 AND date = ?2 AND range_name = ?3 \
                 AND venue = ?4 AND status = 'open'",
                rusqlite::params![city, date, range_name, venue],
                |row| row.get(0),
            )
            .context("Failed to run open-range check")?;
        Ok(count > 0)
    }

    /// Side-level mutual exclusivity: any open trade of this side on
    /// (city, date, venue), regardless of range.
    pub fn has_open_side(&self, city: &str, date: &str, venue: &str, side: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE city = ?1 AND date = ?2 AND venue = ?3 \
                 AND side = ?4 AND status = 'open'",
                rusqlite::params![city, date, venue, side],
                |row| row.get(0),
            )
            .context("Failed to run open-side check")?;
        Ok(count > 0)
    }

    /// Sum of entry cost over open trades of one side. Used to initialize
    /// the executor bankrolls at startup.
    pub fn sum_open_cost(&self, side: &str) -> Result<f64> {
        let sum: f64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM trades WHERE status = 'open' AND side = ?1",
                [side],
                |row| row.get(0),
            )
            .context("Failed to sum open trade cost")?;
        Ok(sum)
    }

    /// Open NO exposure per contract date.
    pub fn open_no_cost_by_date(&self) -> Result<HashMap<String, f64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT date, COALESCE(SUM(cost), 0.0) FROM trades \
                 WHERE status = 'open' AND side = 'NO' GROUP BY date",
            )
            .context("Failed to prepare NO exposure query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
            .context("Failed to query NO exposure")?;
        let mut map = HashMap::new();
        for row in rows {
            let (date, cost) = row.context("Failed to read NO exposure row")?;
            map.insert(date, cost);
        }
        Ok(map)
    }

    /// Monitor pass: refresh the current price, track extremes, append to the
    /// bounded evaluator log (last 100 entries, oldest dropped first).
    pub fn update_trade_market(
        &self,
        trade_id: &str,
        current_price: f64,
        current_probability: Option<f64>,
        evaluator_entry: Option<&serde_json::Value>,
    ) -> Result<()> {
        let existing: Option<(String, Option<f64>, Option<f64>)> = self
            .conn
            .query_row(
                "SELECT evaluator_log_json, max_price_seen, min_probability_seen \
                 FROM trades WHERE trade_id = ?1 AND status = 'open'",
                [trade_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to read trade for market update")?;

        let Some((log_json, max_seen, min_prob_seen)) = existing else {
            return Ok(());
        };

        let mut log: Vec<serde_json::Value> = serde_json::from_str(&log_json).unwrap_or_default();
        if let Some(entry) = evaluator_entry {
            log.push(entry.clone());
            while log.len() > 100 {
                log.remove(0);
            }
        }
        let new_log = serde_json::to_string(&log).context("Failed to serialize evaluator log")?;

        let new_max = match max_seen {
            Some(m) if m >= current_price => m,
            _ => current_price,
        };
        let new_min_prob = match (min_prob_seen, current_probability) {
            (Some(m), Some(p)) if m <= p => Some(m),
            (_, Some(p)) => Some(p),
            (m, None) => m,
        };

        self.conn
            .execute(
                "UPDATE trades SET current_price = ?1, max_price_seen = ?2, \
                 min_probability_seen = ?3, evaluator_log_json = ?4, \
                 updated_at = datetime('now') WHERE trade_id = ?5 AND status = 'open'",
                rusqlite::params![current_price, new_max, new_min_prob, new_log, trade_id],
            )
            .context("Failed to update trade market state")?;
        Ok(())
    }

    pub fn exit_trade(&self, trade_id: &str, exit_price: f64) -> Result<f64> {
        let (entry_price, shares): (f64, f64) = self
            .conn
            .query_row(
                "SELECT entry_price, shares FROM trades WHERE trade_id = ?1 AND status = 'open'",
                [trade_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to find open trade to exit")?;

        let pnl = (exit_price - entry_price) * shares;
        self.conn
            .execute(
                "UPDATE trades SET status = 'exited', current_price = ?1, pnl = ?2, \
                 updated_at = datetime('now') WHERE trade_id = ?3 AND status = 'open'",
                rusqlite::params![exit_price, pnl, trade_id],
            )
            .context("Failed to exit trade")?;
        Ok(pnl)
    }

    /// Terminal settlement. Monetary fields are frozen after this.
    pub fn resolve_trade(&self, trade_id: &str, won: bool, settlement_fee: f64) -> Result<()> {
        let (entry_price, shares, entry_fee): (f64, f64, f64) = self
            .conn
            .query_row(
                "SELECT entry_price, shares, entry_fee FROM trades \
                 WHERE trade_id = ?1 AND status = 'open'",
                [trade_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to find open trade to resolve")?;

        let payout = if won { shares } else { 0.0 };
        let fees = entry_fee * shares + settlement_fee;
        let pnl = payout - entry_price * shares - fees;

        self.conn
            .execute(
                "UPDATE trades SET status = 'resolved', pnl = ?1, fees = ?2, \
                 updated_at = datetime('now') WHERE trade_id = ?3 AND status = 'open'",
                rusqlite::params![pnl, fees, trade_id],
            )
            .context("Failed to resolve trade")?;
        Ok(())
    }

    // ─── Opportunities ───

    pub fn insert_opportunity(&self, o: &OpportunityRecord) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO opportunities (cycle, city, date, venue, market_id, token_id, \
                 range_name, range_min, range_max, range_kind, side, raw_probability, \
                 corrected_probability, correction_ratio, edge_pct, kelly, bid, ask, spread, \
                 volume, hours_to_resolution, forecast_temp, forecast_stddev, action, \
                 filter_reason, entry_reason, calibration_bucket, forecast_to_near_edge, \
                 forecast_to_far_edge, forecast_in_range, source_disagreement_deg, \
                 market_implied_divergence) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)",
                rusqlite::params![
                    o.cycle,
                    o.city,
                    o.date,
                    o.venue,
                    o.market_id,
                    o.token_id,
                    o.range_name,
                    o.range_min,
                    o.range_max,
                    o.range_kind,
                    o.side,
                    o.raw_probability,
                    o.corrected_probability,
                    o.correction_ratio,
                    o.edge_pct,
                    o.kelly,
                    o.bid,
                    o.ask,
                    o.spread,
                    o.volume,
                    o.hours_to_resolution,
                    o.forecast_temp,
                    o.forecast_stddev,
                    o.action,
                    o.filter_reason,
                    o.entry_reason,
                    o.calibration_bucket,
                    o.forecast_to_near_edge,
                    o.forecast_to_far_edge,
                    o.forecast_in_range,
                    o.source_disagreement_deg,
                    o.market_implied_divergence,
                ],
            )
            .context("Failed to insert opportunity")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_opportunities(&self, cycle: i64) -> Result<i64> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM opportunities WHERE cycle = ?1",
                [cycle],
                |row| row.get(0),
            )
            .context("Failed to count opportunities")?;
        Ok(n)
    }

    /// Resolved evaluations inside the calibration window. Deduplication of
    /// repeated evaluations of the same contract happens here, not at write
    /// time: one row per (city, date, venue, range, side), latest snapshot.
    pub fn get_resolved_opportunities(&self, window_days: u32) -> Result<Vec<ResolvedOppRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT city, venue, range_kind, side, hours_to_resolution, ask, \
                 raw_probability, outcome_yes \
                 FROM opportunities o \
                 WHERE outcome_yes IS NOT NULL \
                 AND date >= date('now', '-' || ?1 || ' days') \
                 AND id = (SELECT MAX(id) FROM opportunities o2 WHERE o2.city = o.city \
                   AND o2.date = o.date AND o2.venue = o.venue \
                   AND o2.range_name = o.range_name AND o2.side = o.side)",
            )
            .context("Failed to prepare resolved opportunities query")?;
        let rows = stmt
            .query_map([window_days], |row| {
                let hours: Option<f64> = row.get(4)?;
                let side: String = row.get(3)?;
                let outcome_yes: bool = row.get(7)?;
                Ok(ResolvedOppRow {
                    city: row.get(0)?,
                    venue: row.get(1)?,
                    range_kind: row.get(2)?,
                    lead_bucket: crate::units::LeadBucket::from_hours(hours.unwrap_or(0.0))
                        .as_str()
                        .to_string(),
                    ask: row.get(5)?,
                    raw_probability: row.get(6)?,
                    side_won: (side == "YES") == outcome_yes,
                    side,
                })
            })
            .context("Failed to query resolved opportunities")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read resolved opportunity row")?);
        }
        Ok(out)
    }

    // ─── Snapshots ───

    #[allow(clippy::too_many_arguments)]
    pub fn insert_snapshot(
        &self,
        cycle: i64,
        city: &str,
        date: &str,
        venue: &str,
        market_id: &str,
        range_name: &str,
        bid: f64,
        ask: f64,
        spread: f64,
        volume: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO snapshots (cycle, city, date, venue, market_id, range_name, bid, ask, spread, volume) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![cycle, city, date, venue, market_id, range_name, bid, ask, spread, volume],
            )
            .context("Failed to insert snapshot")?;
        Ok(())
    }

    // ─── Forecast accuracy ledger ───

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_forecast_accuracy(
        &self,
        city: &str,
        date: &str,
        source: &str,
        unit: &str,
        lead_bucket: &str,
        forecast_high: f64,
        actual_high: Option<f64>,
    ) -> Result<()> {
        let error = actual_high.map(|a| forecast_high - a);
        self.conn
            .execute(
                "INSERT INTO v2_forecast_accuracy (city, date, source, unit, lead_bucket, forecast_high, actual_high, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(city, date, source, lead_bucket) DO UPDATE SET \
                    forecast_high = excluded.forecast_high, \
                    actual_high = COALESCE(excluded.actual_high, actual_high), \
                    error = COALESCE(excluded.error, error)",
                rusqlite::params![city, date, source, unit, lead_bucket, forecast_high, actual_high, error],
            )
            .context("Failed to upsert forecast accuracy")?;
        Ok(())
    }

    /// Scored rows (error known) inside the rolling window.
    pub fn get_accuracy_rows(&self, window_days: u32) -> Result<Vec<AccuracyRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT city, date, source, unit, lead_bucket, error FROM v2_forecast_accuracy \
                 WHERE error IS NOT NULL AND date >= date('now', '-' || ?1 || ' days')",
            )
            .context("Failed to prepare accuracy query")?;
        let rows = stmt
            .query_map([window_days], |row| {
                Ok(AccuracyRow {
                    city: row.get(0)?,
                    date: row.get(1)?,
                    source: row.get(2)?,
                    unit: row.get(3)?,
                    lead_bucket: row.get(4)?,
                    error: row.get(5)?,
                })
            })
            .context("Failed to query accuracy rows")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read accuracy row")?);
        }
        Ok(out)
    }

    // ─── Materialized calibration tables ───

    pub fn upsert_market_calibration(
        &self,
        bucket_key: &str,
        win_rate: f64,
        n: u32,
        true_edge: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO market_calibration (bucket_key, empirical_win_rate, n, true_edge, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, datetime('now')) \
                 ON CONFLICT(bucket_key) DO UPDATE SET \
                    empirical_win_rate = excluded.empirical_win_rate, \
                    n = excluded.n, true_edge = excluded.true_edge, updated_at = excluded.updated_at",
                rusqlite::params![bucket_key, win_rate, n, true_edge],
            )
            .context("Failed to upsert market calibration")?;
        Ok(())
    }

    pub fn upsert_model_calibration(&self, bucket_key: &str, ratio: f64, n: u32) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO model_calibration (bucket_key, correction_ratio, n, updated_at) \
                 VALUES (?1, ?2, ?3, datetime('now')) \
                 ON CONFLICT(bucket_key) DO UPDATE SET \
                    correction_ratio = excluded.correction_ratio, n = excluded.n, \
                    updated_at = excluded.updated_at",
                rusqlite::params![bucket_key, ratio, n],
            )
            .context("Failed to upsert model calibration")?;
        Ok(())
    }

    pub fn upsert_city_error_distribution(
        &self,
        city: &str,
        unit: &str,
        percentiles_json: &str,
        n: u32,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO city_error_distribution (city, unit, percentiles_json, n, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, datetime('now')) \
                 ON CONFLICT(city) DO UPDATE SET \
                    unit = excluded.unit, percentiles_json = excluded.percentiles_json, \
                    n = excluded.n, updated_at = excluded.updated_at",
                rusqlite::params![city, unit, percentiles_json, n],
            )
            .context("Failed to upsert city error distribution")?;
        Ok(())
    }

    pub fn upsert_market_implied(
        &self,
        city: &str,
        date: &str,
        venue: &str,
        implied_mean_c: f64,
        n_ranges: u32,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO market_implied (city, date, venue, implied_mean_c, n_ranges, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
                 ON CONFLICT(city, date, venue) DO UPDATE SET \
                    implied_mean_c = excluded.implied_mean_c, n_ranges = excluded.n_ranges, \
                    updated_at = excluded.updated_at",
                rusqlite::params![city, date, venue, implied_mean_c, n_ranges],
            )
            .context("Failed to upsert market implied")?;
        Ok(())
    }

    pub fn insert_ensemble_spread(
        &self,
        city: &str,
        date: &str,
        spread_f: f64,
        n_sources: u32,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO ensemble_spread (city, date, spread_f, n_sources) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![city, date, spread_f, n_sources],
            )
            .context("Failed to insert ensemble spread")?;
        Ok(())
    }

    // ─── Observations ───

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_observation(
        &self,
        city: &str,
        date: &str,
        station_id: &str,
        running_high_c: Option<f64>,
        running_high_f: Option<f64>,
        wu_high_c: Option<f64>,
        wu_high_f: Option<f64>,
        observed_at: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metar_observations (city, date, station_id, running_high_c, running_high_f, \
                 wu_high_c, wu_high_f, observed_at, observation_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1) \
                 ON CONFLICT(city, date, station_id) DO UPDATE SET \
                    running_high_c = CASE \
                        WHEN running_high_c IS NULL THEN excluded.running_high_c \
                        WHEN excluded.running_high_c IS NULL THEN running_high_c \
                        ELSE MAX(running_high_c, excluded.running_high_c) END, \
                    running_high_f = CASE \
                        WHEN running_high_f IS NULL THEN excluded.running_high_f \
                        WHEN excluded.running_high_f IS NULL THEN running_high_f \
                        ELSE MAX(running_high_f, excluded.running_high_f) END, \
                    wu_high_c = COALESCE(excluded.wu_high_c, wu_high_c), \
                    wu_high_f = COALESCE(excluded.wu_high_f, wu_high_f), \
                    observed_at = excluded.observed_at, \
                    observation_count = observation_count + 1",
                rusqlite::params![
                    city,
                    date,
                    station_id,
                    running_high_c,
                    running_high_f,
                    wu_high_c,
                    wu_high_f,
                    observed_at
                ],
            )
            .context("Failed to upsert observation")?;
        Ok(())
    }

    /// Latest observation for (city, date), optionally pinned to one station
    /// so dual-station cities never mix readings.
    pub fn get_latest_observation(
        &self,
        city: &str,
        date: &str,
        station_id: Option<&str>,
    ) -> Result<Option<ObservationRow>> {
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ObservationRow> {
            Ok(ObservationRow {
                city: row.get(0)?,
                date: row.get(1)?,
                station_id: row.get(2)?,
                running_high_c: row.get(3)?,
                running_high_f: row.get(4)?,
                wu_high_c: row.get(5)?,
                wu_high_f: row.get(6)?,
                observed_at: row.get(7)?,
                observation_count: row.get(8)?,
            })
        };

        let result = match station_id {
            Some(station) => self
                .conn
                .query_row(
                    "SELECT city, date, station_id, running_high_c, running_high_f, wu_high_c, \
                     wu_high_f, observed_at, observation_count FROM metar_observations \
                     WHERE city = ?1 AND date = ?2 AND station_id = ?3",
                    rusqlite::params![city, date, station],
                    map,
                )
                .optional(),
            None => self
                .conn
                .query_row(
                    "SELECT city, date, station_id, running_high_c, running_high_f, wu_high_c, \
                     wu_high_f, observed_at, observation_count FROM metar_observations \
                     WHERE city = ?1 AND date = ?2 ORDER BY observed_at DESC LIMIT 1",
                    rusqlite::params![city, date],
                    map,
                )
                .optional(),
        };
        result.context("Failed to query latest observation")
    }

    /// Record a threshold crossing seen by one source only, awaiting the
    /// second source.
    pub fn insert_pending_event(
        &self,
        city: &str,
        date: &str,
        station_id: &str,
        range_name: &str,
        threshold: f64,
        observed: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metar_pending_events (city, date, station_id, range_name, threshold, observed) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(city, date, station_id, range_name) DO UPDATE SET \
                    observed = MAX(observed, excluded.observed), updated_at = datetime('now')",
                rusqlite::params![city, date, station_id, range_name, threshold, observed],
            )
            .context("Failed to insert pending event")?;
        Ok(())
    }

    // ─── Cycles ───

    pub fn get_next_cycle_number(&self) -> Result<i64> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(cycle_number), 0) + 1 FROM cycle_log",
                [],
                |row| row.get(0),
            )
            .context("Failed to get next cycle number")?;
        Ok(n)
    }

    pub fn log_cycle(
        &self,
        cycle_number: i64,
        evaluations: i64,
        approved: i64,
        trades_placed: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cycle_log (cycle_number, evaluations, approved, trades_placed) \
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![cycle_number, evaluations, approved, trades_placed],
            )
            .context("Failed to log cycle")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL UNIQUE,
                opportunity_id INTEGER,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                venue TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                range_name TEXT NOT NULL,
                range_min REAL,
                range_max REAL,
                range_kind TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                shares REAL NOT NULL,
                cost REAL NOT NULL,
                entry_fee REAL NOT NULL DEFAULT 0.0,
                entry_reason TEXT NOT NULL DEFAULT 'model',
                entry_probability REAL NOT NULL,
                corrected_probability REAL,
                edge_pct REAL,
                kelly REAL,
                forecast_temp REAL,
                forecast_stddev REAL,
                sources_json TEXT,
                market_snapshot_json TEXT,
                evaluator_log_json TEXT NOT NULL DEFAULT '[]',
                current_price REAL,
                max_price_seen REAL,
                min_probability_seen REAL,
                status TEXT NOT NULL DEFAULT 'open',
                pnl REAL,
                fees REAL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_position
                ON trades (city, date, range_name, side, venue)
                WHERE status IN ('open', 'resolved');

            CREATE TABLE IF NOT EXISTS opportunities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle INTEGER NOT NULL,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                venue TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                range_name TEXT NOT NULL,
                range_min REAL,
                range_max REAL,
                range_kind TEXT NOT NULL,
                side TEXT NOT NULL,
                raw_probability REAL NOT NULL,
                corrected_probability REAL NOT NULL,
                correction_ratio REAL NOT NULL DEFAULT 1.0,
                edge_pct REAL NOT NULL,
                kelly REAL NOT NULL DEFAULT 0.0,
                bid REAL NOT NULL,
                ask REAL NOT NULL,
                spread REAL NOT NULL,
                volume REAL NOT NULL,
                hours_to_resolution REAL,
                forecast_temp REAL,
                forecast_stddev REAL,
                action TEXT NOT NULL,
                filter_reason TEXT,
                entry_reason TEXT,
                calibration_bucket TEXT,
                forecast_to_near_edge REAL,
                forecast_to_far_edge REAL,
                forecast_in_range BOOLEAN,
                source_disagreement_deg REAL,
                market_implied_divergence REAL,
                outcome_yes BOOLEAN,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle INTEGER NOT NULL,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                venue TEXT NOT NULL,
                market_id TEXT NOT NULL,
                range_name TEXT NOT NULL,
                bid REAL NOT NULL,
                ask REAL NOT NULL,
                spread REAL NOT NULL,
                volume REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS v2_forecast_accuracy (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                source TEXT NOT NULL,
                unit TEXT NOT NULL,
                lead_bucket TEXT NOT NULL,
                forecast_high REAL NOT NULL,
                actual_high REAL,
                error REAL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, date, source, lead_bucket)
            );

            CREATE TABLE IF NOT EXISTS market_calibration (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_key TEXT NOT NULL UNIQUE,
                empirical_win_rate REAL NOT NULL,
                n INTEGER NOT NULL,
                true_edge REAL NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS model_calibration (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_key TEXT NOT NULL UNIQUE,
                correction_ratio REAL NOT NULL,
                n INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS city_error_distribution (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL UNIQUE,
                unit TEXT NOT NULL,
                percentiles_json TEXT NOT NULL,
                n INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS market_implied (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                venue TEXT NOT NULL,
                implied_mean_c REAL NOT NULL,
                n_ranges INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, date, venue)
            );

            CREATE TABLE IF NOT EXISTS ensemble_spread (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                spread_f REAL NOT NULL,
                n_sources INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS metar_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                station_id TEXT NOT NULL,
                running_high_c REAL,
                running_high_f REAL,
                wu_high_c REAL,
                wu_high_f REAL,
                observed_at TEXT NOT NULL,
                observation_count INTEGER NOT NULL DEFAULT 1,
                UNIQUE(city, date, station_id)
            );

            CREATE TABLE IF NOT EXISTS metar_pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                date TEXT NOT NULL,
                station_id TEXT NOT NULL,
                range_name TEXT NOT NULL,
                threshold REAL NOT NULL,
                observed REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(city, date, station_id, range_name)
            );

            CREATE TABLE IF NOT EXISTS cycle_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_number INTEGER NOT NULL,
                evaluations INTEGER NOT NULL DEFAULT 0,
                approved INTEGER NOT NULL DEFAULT 0,
                trades_placed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
            )
            .context("Failed to run database migrations")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(city: &str, date: &str, range: &str, side: &str, venue: &str) -> TradeRow {
        TradeRow {
            id: 0,
            trade_id: uuid::Uuid::new_v4().to_string(),
            opportunity_id: None,
            city: city.to_string(),
            date: date.to_string(),
            venue: venue.to_string(),
            market_id: "mkt1".to_string(),
            token_id: "tok1".to_string(),
            range_name: range.to_string(),
            range_min: Some(70.0),
            range_max: Some(75.0),
            range_kind: "bounded".to_string(),
            side: side.to_string(),
            entry_price: 0.38,
            shares: 123.0,
            cost: 46.74,
            entry_fee: 0.0,
            entry_reason: "model".to_string(),
            entry_probability: 0.52,
            corrected_probability: Some(0.52),
            edge_pct: Some(14.2),
            kelly: Some(0.047),
            forecast_temp: Some(72.5),
            forecast_stddev: Some(2.0),
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
        }
    }

    fn sample_opportunity(city: &str, date: &str) -> OpportunityRecord {
        OpportunityRecord {
            cycle: 1,
            city: city.to_string(),
            date: date.to_string(),
            venue: "polymarket".to_string(),
            market_id: "mkt1".to_string(),
            token_id: "tok1".to_string(),
            range_name: "70-75°F".to_string(),
            range_min: Some(70.0),
            range_max: Some(75.0),
            range_kind: "bounded".to_string(),
            side: "YES".to_string(),
            raw_probability: 0.52,
            corrected_probability: 0.52,
            correction_ratio: 1.0,
            edge_pct: 14.2,
            kelly: 0.047,
            bid: 0.35,
            ask: 0.38,
            spread: 0.03,
            volume: 5000.0,
            hours_to_resolution: Some(20.0),
            forecast_temp: Some(72.5),
            forecast_stddev: Some(2.0),
            action: "entered".to_string(),
            filter_reason: None,
            entry_reason: Some("model".to_string()),
            calibration_bucket: Some("polymarket|bounded|same-day|35-40c".to_string()),
            forecast_to_near_edge: Some(2.5),
            forecast_to_far_edge: Some(2.5),
            forecast_in_range: Some(true),
            source_disagreement_deg: Some(3.0),
            market_implied_divergence: Some(0.4),
        }
    }

    #[test]
    fn test_tables_exist() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for t in [
            "trades",
            "opportunities",
            "snapshots",
            "v2_forecast_accuracy",
            "market_calibration",
            "model_calibration",
            "city_error_distribution",
            "market_implied",
            "ensemble_spread",
            "metar_observations",
            "metar_pending_events",
            "cycle_log",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {}", t);
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_insert_and_read_open_trade() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();

        let open = db.get_open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].city, "nyc");
        assert!((open[0].cost - 46.74).abs() < 1e-9);
        assert_eq!(open[0].evaluator_log_json, "[]");
    }

    #[test]
    fn test_unique_position_index() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();

        let mut dup = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        dup.trade_id = uuid::Uuid::new_v4().to_string();
        assert!(db.insert_trade(&dup).is_err());

        // Same position on the other venue is fine
        let mut other = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "kalshi");
        other.trade_id = uuid::Uuid::new_v4().to_string();
        db.insert_trade(&other).unwrap();
    }

    #[test]
    fn test_exited_rows_free_the_position_key() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();
        db.exit_trade(&t.trade_id, 0.60).unwrap();

        let mut again = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        again.trade_id = uuid::Uuid::new_v4().to_string();
        db.insert_trade(&again).unwrap();
    }

    #[test]
    fn test_has_position_covers_resolved() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("chi", "2026-02-21", "60-65°F", "NO", "kalshi");
        db.insert_trade(&t).unwrap();
        assert!(db.has_position("chi", "2026-02-21", "60-65°F", "NO", "kalshi").unwrap());

        db.resolve_trade(&t.trade_id, true, 0.0).unwrap();
        // Resolved rows still block re-entry
        assert!(db.has_position("chi", "2026-02-21", "60-65°F", "NO", "kalshi").unwrap());

        assert!(!db.has_position("chi", "2026-02-21", "60-65°F", "YES", "kalshi").unwrap());
    }

    #[test]
    fn test_sum_open_cost_by_side() {
        let db = Database::open_in_memory().unwrap();
        db.insert_trade(&sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket"))
            .unwrap();
        let mut no = sample_trade("nyc", "2026-02-20", "60-65°F", "NO", "polymarket");
        no.trade_id = uuid::Uuid::new_v4().to_string();
        no.cost = 90.0;
        db.insert_trade(&no).unwrap();

        assert!((db.sum_open_cost("YES").unwrap() - 46.74).abs() < 1e-9);
        assert!((db.sum_open_cost("NO").unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_open_no_cost_by_date() {
        let db = Database::open_in_memory().unwrap();
        let mut a = sample_trade("nyc", "2026-02-20", "60-65°F", "NO", "polymarket");
        a.cost = 50.0;
        db.insert_trade(&a).unwrap();
        let mut b = sample_trade("chi", "2026-02-20", "40-45°F", "NO", "polymarket");
        b.trade_id = uuid::Uuid::new_v4().to_string();
        b.cost = 30.0;
        db.insert_trade(&b).unwrap();

        let map = db.open_no_cost_by_date().unwrap();
        assert!((map.get("2026-02-20").unwrap() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_freezes_pnl() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();
        db.resolve_trade(&t.trade_id, true, 0.0).unwrap();

        // pnl = shares - entry*shares = 123 - 46.74 = 76.26
        let (status, pnl): (String, f64) = db
            .conn
            .query_row(
                "SELECT status, pnl FROM trades WHERE trade_id = ?1",
                [&t.trade_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "resolved");
        assert!((pnl - 76.26).abs() < 1e-9);

        // A second resolve finds no open row
        assert!(db.resolve_trade(&t.trade_id, false, 0.0).is_err());
    }

    #[test]
    fn test_evaluator_log_bounded_at_100() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();

        for i in 0..110 {
            db.update_trade_market(
                &t.trade_id,
                0.40,
                Some(0.5),
                Some(&serde_json::json!({"i": i})),
            )
            .unwrap();
        }

        let log_json: String = db
            .conn
            .query_row(
                "SELECT evaluator_log_json FROM trades WHERE trade_id = ?1",
                [&t.trade_id],
                |row| row.get(0),
            )
            .unwrap();
        let log: Vec<serde_json::Value> = serde_json::from_str(&log_json).unwrap();
        assert_eq!(log.len(), 100);
        // FIFO: the oldest entries were dropped
        assert_eq!(log[0]["i"], 10);
        assert_eq!(log[99]["i"], 109);
    }

    #[test]
    fn test_update_trade_market_tracks_extremes() {
        let db = Database::open_in_memory().unwrap();
        let t = sample_trade("nyc", "2026-02-20", "70-75°F", "YES", "polymarket");
        db.insert_trade(&t).unwrap();

        db.update_trade_market(&t.trade_id, 0.45, Some(0.55), None).unwrap();
        db.update_trade_market(&t.trade_id, 0.41, Some(0.48), None).unwrap();
        db.update_trade_market(&t.trade_id, 0.50, Some(0.60), None).unwrap();

        let (max_price, min_prob): (f64, f64) = db
            .conn
            .query_row(
                "SELECT max_price_seen, min_probability_seen FROM trades WHERE trade_id = ?1",
                [&t.trade_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((max_price - 0.50).abs() < 1e-9);
        assert!((min_prob - 0.48).abs() < 1e-9);
    }

    #[test]
    fn test_insert_opportunity_and_count() {
        let db = Database::open_in_memory().unwrap();
        db.insert_opportunity(&sample_opportunity("nyc", "2026-02-20")).unwrap();
        db.insert_opportunity(&sample_opportunity("nyc", "2026-02-20")).unwrap();
        // No write-time dedup: both rows land
        assert_eq!(db.count_opportunities(1).unwrap(), 2);
    }

    #[test]
    fn test_forecast_accuracy_upsert() {
        let db = Database::open_in_memory().unwrap();
        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        db.upsert_forecast_accuracy("nyc", &today, "gfs", "F", "same-day", 72.0, None)
            .unwrap();
        // Actual arrives later, error fills in
        db.upsert_forecast_accuracy("nyc", &today, "gfs", "F", "same-day", 72.0, Some(70.0))
            .unwrap();

        let rows = db.get_accuracy_rows(7).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].error - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_accuracy_rows_skip_unscored() {
        let db = Database::open_in_memory().unwrap();
        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        db.upsert_forecast_accuracy("nyc", &today, "gfs", "F", "same-day", 72.0, None)
            .unwrap();
        assert!(db.get_accuracy_rows(7).unwrap().is_empty());
    }

    #[test]
    fn test_market_calibration_upsert() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_market_calibration("polymarket|bounded|same-day|25-30c", 0.42, 40, 0.14)
            .unwrap();
        db.upsert_market_calibration("polymarket|bounded|same-day|25-30c", 0.45, 44, 0.17)
            .unwrap();

        let (rate, n): (f64, i64) = db
            .conn
            .query_row(
                "SELECT empirical_win_rate, n FROM market_calibration WHERE bucket_key = ?1",
                ["polymarket|bounded|same-day|25-30c"],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((rate - 0.45).abs() < 1e-9);
        assert_eq!(n, 44);
    }

    #[test]
    fn test_observation_upsert_keeps_running_max() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_observation("nyc", "2026-02-20", "KLGA", Some(20.0), Some(68.0), None, None, "t1")
            .unwrap();
        db.upsert_observation("nyc", "2026-02-20", "KLGA", Some(18.0), Some(64.4), None, None, "t2")
            .unwrap();

        let obs = db
            .get_latest_observation("nyc", "2026-02-20", Some("KLGA"))
            .unwrap()
            .unwrap();
        // Running high never goes down
        assert!((obs.running_high_f.unwrap() - 68.0).abs() < 1e-9);
        assert_eq!(obs.observation_count, 2);
        assert_eq!(obs.observed_at, "t2");
    }

    #[test]
    fn test_observation_station_isolation() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_observation("nyc", "2026-02-20", "KLGA", Some(20.0), Some(68.0), None, None, "t1")
            .unwrap();
        db.upsert_observation("nyc", "2026-02-20", "KNYC", Some(18.0), Some(64.4), None, None, "t1")
            .unwrap();

        let lga = db.get_latest_observation("nyc", "2026-02-20", Some("KLGA")).unwrap().unwrap();
        let nyc = db.get_latest_observation("nyc", "2026-02-20", Some("KNYC")).unwrap().unwrap();
        assert!((lga.running_high_f.unwrap() - 68.0).abs() < 1e-9);
        assert!((nyc.running_high_f.unwrap() - 64.4).abs() < 1e-9);
    }

    #[test]
    fn test_resolved_opportunities_dedup_latest() {
        let db = Database::open_in_memory().unwrap();
        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let mut o = sample_opportunity("nyc", &today);
        o.ask = 0.30;
        db.insert_opportunity(&o).unwrap();
        o.ask = 0.38;
        db.insert_opportunity(&o).unwrap();

        db.conn
            .execute("UPDATE opportunities SET outcome_yes = 1", [])
            .unwrap();

        let rows = db.get_resolved_opportunities(30).unwrap();
        // Two writes of the same evaluation collapse to the latest
        assert_eq!(rows.len(), 1);
        assert!((rows[0].ask - 0.38).abs() < 1e-9);
        assert!(rows[0].side_won);
    }

    #[test]
    fn test_cycle_numbering() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_next_cycle_number().unwrap(), 1);
        db.log_cycle(1, 10, 2, 1).unwrap();
        db.log_cycle(2, 12, 0, 0).unwrap();
        assert_eq!(db.get_next_cycle_number().unwrap(), 3);
    }
}
