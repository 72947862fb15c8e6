use anyhow::Result;
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alerts::Alerts;
use crate::calibration::{CalibrationSnapshot, CalibrationStore};
use crate::config::{CalibrationConfig, City, Config, EntryConfig, PlatformConfig};
use crate::db::{Database, OpportunityRecord, TradeRow};
use crate::forecast::{ForecastEngine, ForecastResult, SourceTemp};
use crate::observations::{Observation, ObservationFeed};
use crate::units::{delta_c_to_f, delta_f_to_c, fahrenheit_to_celsius, LeadBucket, TempUnit};
use crate::venue::{entry_fee, Range, RangeKind, Venue, VenueClient, VENUES};

/// Consecutive empty-market cycles before a (city, venue) pair is reported
/// stale.
const STALE_CYCLES_THRESHOLD: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    Model,
    CalConfirms,
    GuaranteedWin,
    GuaranteedWinMetarOnly,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::Model => "model",
            EntryReason::CalConfirms => "cal_confirms",
            EntryReason::GuaranteedWin => "guaranteed_win",
            EntryReason::GuaranteedWinMetarOnly => "guaranteed_win_metar_only",
        }
    }
}

impl std::fmt::Display for EntryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An approved candidate handed to the executor. One is produced per
/// passing evaluation; the opportunity log row has already been written.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub opportunity_id: Option<i64>,
    pub city: String,
    pub date: String,
    pub venue: Venue,
    pub range: Range,
    pub side: Side,
    pub raw_probability: f64,
    pub corrected_probability: f64,
    pub correction_ratio: f64,
    pub edge_pct: f64,
    pub kelly: f64,
    /// Price of the bought side (YES ask, or the NO ask derived from the
    /// YES book).
    pub ask: f64,
    pub bid: f64,
    pub fee: f64,
    pub entry_reason: EntryReason,
    pub calibration_bucket: Option<String>,
    pub forecast_temp: Option<f64>,
    pub forecast_stddev_c: Option<f64>,
    pub hours_to_resolution: Option<f64>,
    pub source_temps: Vec<SourceTemp>,
}

/// O(1) duplicate lookups built from the open-trade set once per scan.
#[derive(Debug, Default)]
pub struct PositionIndex {
    /// (city, date, range, side, venue)
    full: HashSet<(String, String, String, String, String)>,
    /// (city, date, venue) with an open YES
    yes_open: HashSet<(String, String, String)>,
    /// (city, date, venue) with an open NO
    no_open: HashSet<(String, String, String)>,
    /// (city, date, range, venue): blocks the opposite side on one range
    range_open: HashSet<(String, String, String, String)>,
    /// (city, date, venue) → open YES range_min thresholds, for adjacent-NO
    /// protection
    yes_range_mins: HashMap<(String, String, String), Vec<f64>>,
}

impl PositionIndex {
    pub fn build(trades: &[TradeRow]) -> Self {
        let mut index = PositionIndex::default();
        for t in trades {
            if t.status != "open" {
                continue;
            }
            index.full.insert((
                t.city.clone(),
                t.date.clone(),
                t.range_name.clone(),
                t.side.clone(),
                t.venue.clone(),
            ));
            let cdv = (t.city.clone(), t.date.clone(), t.venue.clone());
            match t.side.as_str() {
                "YES" => {
                    index.yes_open.insert(cdv.clone());
                    if let Some(min) = t.range_min {
                        index.yes_range_mins.entry(cdv).or_default().push(min);
                    }
                }
                "NO" => {
                    index.no_open.insert(cdv);
                }
                _ => {}
            }
            index.range_open.insert((
                t.city.clone(),
                t.date.clone(),
                t.range_name.clone(),
                t.venue.clone(),
            ));
        }
        index
    }

    pub fn has_full(&self, city: &str, date: &str, range: &str, side: Side, venue: Venue) -> bool {
        self.full.contains(&(
            city.to_string(),
            date.to_string(),
            range.to_string(),
            side.as_str().to_string(),
            venue.as_str().to_string(),
        ))
    }

    pub fn has_side_open(&self, city: &str, date: &str, venue: Venue, side: Side) -> bool {
        let key = (city.to_string(), date.to_string(), venue.as_str().to_string());
        match side {
            Side::Yes => self.yes_open.contains(&key),
            Side::No => self.no_open.contains(&key),
        }
    }

    pub fn has_range_open(&self, city: &str, date: &str, range: &str, venue: Venue) -> bool {
        self.range_open.contains(&(
            city.to_string(),
            date.to_string(),
            range.to_string(),
            venue.as_str().to_string(),
        ))
    }

    pub fn yes_range_mins(&self, city: &str, date: &str, venue: Venue) -> &[f64] {
        self.yes_range_mins
            .get(&(city.to_string(), date.to_string(), venue.as_str().to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Fractional Kelly for buying one side at `ask` plus `fee`. Zero when the
/// bet has no positive expectation.
pub(crate) fn kelly_fraction(p: f64, ask: f64, fee: f64, fraction: f64) -> f64 {
    let effective = ask + fee;
    let net = 1.0 - effective;
    if net <= 0.0 || effective <= 0.0 {
        return 0.0;
    }
    let b = net / effective;
    let full = (b * p - (1.0 - p)) / b;
    (full * fraction).max(0.0)
}

/// Everything one evaluation needs, venue-adjusted.
pub(crate) struct EvalInput<'a> {
    pub city: &'a City,
    pub date: &'a str,
    pub venue: Venue,
    pub platform: &'a PlatformConfig,
    pub entry: &'a EntryConfig,
    pub cal_cfg: &'a CalibrationConfig,
    pub snapshot: &'a CalibrationSnapshot,
    pub index: &'a PositionIndex,
    pub kelly_cfg_fraction: f64,
    /// Ensemble temperature in the city's market unit (NWS-boosted variant
    /// for the NWS-priority venue).
    pub forecast_temp: f64,
    /// Venue-adjusted stddev, °C.
    pub std_dev_c: f64,
    pub spread_f: f64,
    pub hours: Option<f64>,
    pub lead: LeadBucket,
    pub implied_divergence_c: Option<f64>,
    /// Running observed high in the market unit, today only.
    pub observed_high: Option<f64>,
    pub local_hour: Option<u32>,
    pub is_today: bool,
}

pub(crate) struct Evaluation {
    pub side: Side,
    pub raw_p: f64,
    pub corrected_p: f64,
    pub ratio: f64,
    pub edge_pct: f64,
    pub kelly: f64,
    pub ask: f64,
    pub bid: f64,
    pub fee: f64,
    pub reasons: Vec<String>,
    pub entry_reason: EntryReason,
    pub bucket: Option<String>,
}

impl Evaluation {
    pub fn passes(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// The full filter chain for one (range, side). Reasons are collected, not
/// short-circuited; the calibration-confirmation bypass may strike the edge
/// and model/market clauses afterwards.
pub(crate) fn evaluate_range_side(
    input: &EvalInput<'_>,
    range: &Range,
    side: Side,
) -> Result<Evaluation> {
    let unit = input.city.unit;

    let p_yes = ForecastEngine::calculate_probability(
        input.snapshot,
        input.forecast_temp,
        input.std_dev_c,
        range.min,
        range.max,
        unit,
        Some(&input.city.key),
    )?;

    let (raw_p, ask, bid) = match side {
        Side::Yes => (p_yes, range.ask, range.bid),
        Side::No => (1.0 - p_yes, range.no_ask(), range.no_bid()),
    };
    let fee = entry_fee(range.venue, ask);

    let (ratio, _model_key) = input
        .snapshot
        .correction_ratio(&input.city.key, range.kind.as_str(), raw_p);
    let corrected_p = (raw_p * ratio).clamp(0.0, 1.0);
    let edge_pct = (corrected_p - ask) * 100.0;
    let mut kelly = kelly_fraction(corrected_p, ask, fee, input.kelly_cfg_fraction);

    let mut reasons: Vec<String> = Vec::new();

    // Position pre-pass checks.
    if input
        .index
        .has_full(&input.city.key, input.date, &range.name, side, input.venue)
    {
        reasons.push("existing_position".to_string());
    } else if input
        .index
        .has_range_open(&input.city.key, input.date, &range.name, input.venue)
    {
        // Opposite side open on the same range; both legs cannot win.
        reasons.push("opposite_side_open".to_string());
    } else if input
        .index
        .has_side_open(&input.city.key, input.date, input.venue, side)
    {
        reasons.push(match side {
            Side::Yes => "yes_already_open_for_city_date".to_string(),
            Side::No => "no_already_open_for_city_date".to_string(),
        });
    }

    // Adjacent-NO protection against open YES legs (inclusive comparison).
    if side == Side::No {
        if let Some(max) = range.max {
            let mins = input
                .index
                .yes_range_mins(&input.city.key, input.date, input.venue);
            if mins.iter().any(|yes_min| max <= *yes_min) {
                reasons.push("adjacent_no_protection".to_string());
            }
        }
    }

    // 1–2: venue gates.
    if !input.platform.trading_enabled {
        reasons.push("platform_trading_disabled".to_string());
    }
    if input.city.venue_blocked(input.venue) {
        reasons.push("venue_blocked_for_city".to_string());
    }

    // Accuracy eligibility: cities whose weighted MAE is too high lose
    // bounded (and eventually unbounded) contracts.
    let eligibility = ForecastEngine::city_eligibility(input.snapshot, input.city);
    match range.kind {
        RangeKind::Bounded if !eligibility.allow_bounded => {
            reasons.push("city_not_eligible_bounded".to_string());
        }
        RangeKind::UnboundedUpper | RangeKind::UnboundedLower if !eligibility.allow_unbounded => {
            reasons.push("city_not_eligible_unbounded".to_string());
        }
        _ => {}
    }

    // 3: ensemble disagreement.
    let max_spread_f = match unit {
        TempUnit::Fahrenheit => input.entry.max_ensemble_spread_f,
        TempUnit::Celsius => delta_c_to_f(input.entry.max_ensemble_spread_c),
    };
    if input.spread_f > max_spread_f {
        reasons.push("ensemble_spread_too_wide".to_string());
    }

    // 4: market-implied divergence, YES only.
    if side == Side::Yes {
        if let Some(div) = input.implied_divergence_c {
            if div > input.entry.max_market_divergence_c {
                reasons.push("market_divergence".to_string());
            }
        }
    }

    // 5: stddev-to-width ratio for bounded YES.
    if side == Side::Yes && range.kind == RangeKind::Bounded {
        if let Some(width) = range.width() {
            let std_in_unit = match unit {
                TempUnit::Fahrenheit => delta_c_to_f(input.std_dev_c),
                TempUnit::Celsius => input.std_dev_c,
            };
            if width > 0.0 && std_in_unit / width > input.entry.max_std_range_ratio {
                reasons.push("std_range_ratio".to_string());
            }
        }
    }

    // 6: observation entry gate: the range ceiling is about to be overshot.
    if side == Side::Yes && range.kind == RangeKind::Bounded && input.is_today {
        if let (Some(obs), Some(max), Some(hour)) = (input.observed_high, range.max, input.local_hour)
        {
            let buffer = match unit {
                TempUnit::Fahrenheit => input.entry.observation_buffer_f,
                TempUnit::Celsius => input.entry.observation_buffer_c,
            };
            if obs > input.forecast_temp && max - obs <= buffer && hour < input.city.cooling_hour {
                reasons.push("observation_ceiling_risk".to_string());
            }
        }
    }

    // 7: minimum edge.
    if edge_pct < input.entry.min_edge_pct {
        reasons.push("edge_below_minimum".to_string());
    }

    // 8: spread gates (the NO book inherits the YES spread).
    if range.spread > input.entry.max_spread {
        reasons.push("spread_too_wide".to_string());
    }
    if ask > 0.0 && range.spread / ask > input.entry.max_spread_pct {
        reasons.push("spread_pct_too_wide".to_string());
    }

    // 9: price sanity.
    if ask <= 0.0 {
        reasons.push("no_ask".to_string());
    } else if ask >= 0.97 {
        reasons.push("ask_too_high".to_string());
    }
    match side {
        Side::Yes => {
            if ask > 0.0 && ask < input.entry.min_ask_price {
                reasons.push("ask_below_minimum".to_string());
            }
        }
        Side::No => {
            if ask > 0.0 && ask < input.entry.min_no_ask_price {
                reasons.push("no_ask_below_minimum".to_string());
            }
            if ask > input.entry.max_no_ask_price {
                reasons.push("no_ask_above_maximum".to_string());
            }
        }
    }

    // 10: resolution window.
    match input.hours {
        None => reasons.push("missing_hours_to_resolution".to_string()),
        Some(h) if h <= 0.0 || h < input.entry.min_hours_to_resolution => {
            reasons.push("insufficient_hours_to_resolution".to_string())
        }
        _ => {}
    }

    // 11: model-vs-market sanity.
    if ask > 0.0 && corrected_p > input.entry.max_model_market_ratio * ask {
        reasons.push("model_market_ratio".to_string());
    }

    // 12: dead market.
    if range.volume <= 0.0 {
        reasons.push("zero_volume".to_string());
    }

    // 13 + bypass: market calibration.
    let mut entry_reason = EntryReason::Model;
    let mut bucket = None;
    if let Some((cal, key)) = input.snapshot.market_entry(
        input.venue.as_str(),
        range.kind.as_str(),
        input.lead,
        ask,
        &input.city.key,
        input.cal_cfg.cal_confirms_min_n,
    ) {
        bucket = Some(key);
        if cal.win_rate < ask && cal.n >= input.cal_cfg.cal_blocks_min_n {
            reasons.push("market_calibration_block".to_string());
        }
        let confirms = cal.n >= input.cal_cfg.cal_confirms_min_n
            && cal.true_edge > 0.0
            && cal.win_rate - ask >= input.cal_cfg.cal_min_trade_edge;
        if confirms {
            reasons.retain(|r| r != "edge_below_minimum" && r != "model_market_ratio");
            entry_reason = EntryReason::CalConfirms;
            if kelly <= 0.0 {
                // The model was conservative; size from the empirical rate.
                kelly = kelly_fraction(cal.win_rate, ask, fee, input.kelly_cfg_fraction);
            }
        }
    }

    Ok(Evaluation {
        side,
        raw_p,
        corrected_p,
        ratio,
        edge_pct,
        kelly,
        ask,
        bid,
        fee,
        reasons,
        entry_reason,
        bucket,
    })
}

/// Probability-weighted market-implied mean of the book, °C. None when the
/// book is too thin to imply anything.
pub(crate) fn market_implied_mean_c(ranges: &[Range], unit: TempUnit) -> Option<f64> {
    let mut weight_sum = 0.0;
    let mut weighted = 0.0;
    let mut n = 0;
    for range in ranges {
        let mid = (range.bid + range.ask) / 2.0;
        let point = range.reference_point();
        if mid <= 0.0 || !point.is_finite() {
            continue;
        }
        weight_sum += mid;
        weighted += mid * point;
        n += 1;
    }
    if n < 2 || weight_sum < 0.10 {
        return None;
    }
    let mean = weighted / weight_sum;
    Some(match unit {
        TempUnit::Fahrenheit => fahrenheit_to_celsius(mean),
        TempUnit::Celsius => mean,
    })
}

struct StaleState {
    count: u32,
    alerted: bool,
}

pub struct Scanner {
    db: Arc<Mutex<Database>>,
    engine: Arc<ForecastEngine>,
    calibration: Arc<CalibrationStore>,
    venues: Arc<VenueClient>,
    observations: Arc<ObservationFeed>,
    alerts: Arc<Alerts>,
    config: Config,
    stale: std::sync::Mutex<HashMap<(String, Venue), StaleState>>,
}

impl Scanner {
    pub fn new(
        db: Arc<Mutex<Database>>,
        engine: Arc<ForecastEngine>,
        calibration: Arc<CalibrationStore>,
        venues: Arc<VenueClient>,
        observations: Arc<ObservationFeed>,
        alerts: Arc<Alerts>,
        config: Config,
    ) -> Self {
        Scanner {
            db,
            engine,
            calibration,
            venues,
            observations,
            alerts,
            config,
            stale: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One full scan cycle. Every evaluation writes an opportunity row; the
    /// return value is only the approved subset.
    pub async fn scan(&self, cycle: i64) -> Result<Vec<Opportunity>> {
        let snapshot = self.calibration.snapshot().await;
        let open_trades = {
            let db = self.db.lock().await;
            db.get_open_trades()?
        };
        let index = PositionIndex::build(&open_trades);

        let mut approved = Vec::new();
        let mut evaluations = 0i64;

        for city in &self.config.cities {
            let tz = match city.tz() {
                Ok(tz) => tz,
                Err(e) => {
                    warn!("Skipping {}: {}", city.key, e);
                    continue;
                }
            };
            let local_now = Utc::now().with_timezone(&tz);
            let local_today = local_now.date_naive();

            for offset in 0..self.config.forecasts.scan_days {
                let date = (local_today + chrono::Duration::days(offset as i64))
                    .format("%Y-%m-%d")
                    .to_string();

                let forecast = match self.engine.get_forecast(city, &date).await {
                    Ok(Some(f)) => f,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Forecast failed for {}/{}: {}", city.key, date, e);
                        continue;
                    }
                };

                for &venue in VENUES {
                    let n = self
                        .scan_city_date_venue(
                            cycle,
                            city,
                            &date,
                            venue,
                            &forecast,
                            &snapshot,
                            &index,
                            offset == 0,
                            local_now.hour(),
                            &mut approved,
                        )
                        .await;
                    evaluations += n;
                }
            }
        }

        info!(
            "Scan cycle {}: {} evaluations, {} approved",
            cycle,
            evaluations,
            approved.len()
        );
        Ok(approved)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_city_date_venue(
        &self,
        cycle: i64,
        city: &City,
        date: &str,
        venue: Venue,
        forecast: &ForecastResult,
        snapshot: &CalibrationSnapshot,
        index: &PositionIndex,
        is_today: bool,
        local_hour: u32,
        approved: &mut Vec<Opportunity>,
    ) -> i64 {
        let ranges = match self.venues.get_markets(city, date, venue).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Market fetch failed for {}/{} on {}: {}", city.key, date, venue, e);
                return 0;
            }
        };
        if ranges.is_empty() {
            self.note_stale(city, venue).await;
            return 0;
        }
        self.clear_stale(city, venue);

        let platform = self.config.platform(venue);

        // Venue-adjusted forecast view.
        let forecast_temp = if city.nws_priority_venue == Some(venue) {
            forecast.nws_boosted_temp.unwrap_or(forecast.ensemble_temp)
        } else {
            forecast.ensemble_temp
        };
        let std_dev_c = forecast.std_dev_c * platform.std_dev_multiplier;

        let implied_c = market_implied_mean_c(&ranges, city.unit);
        if let Some(implied) = implied_c {
            let db = self.db.lock().await;
            if let Err(e) =
                db.upsert_market_implied(&city.key, date, venue.as_str(), implied, ranges.len() as u32)
            {
                warn!("Failed to persist market implied: {}", e);
            }
        }
        let ensemble_c = match city.unit {
            TempUnit::Fahrenheit => fahrenheit_to_celsius(forecast_temp),
            TempUnit::Celsius => forecast_temp,
        };
        let implied_divergence_c = implied_c.map(|i| (i - ensemble_c).abs());

        let observed_high = if is_today {
            match self
                .observations
                .get_latest_observation(city, date, Some(venue))
                .await
            {
                Ok(Some(obs)) => obs.running_high(city.unit),
                Ok(None) => None,
                Err(e) => {
                    debug!("Observation read failed for {}: {}", city.key, e);
                    None
                }
            }
        } else {
            None
        };

        let input = EvalInput {
            city,
            date,
            venue,
            platform: &platform,
            entry: &self.config.entry,
            cal_cfg: &self.config.calibration,
            snapshot,
            index,
            kelly_cfg_fraction: self.config.sizing.kelly_fraction,
            forecast_temp,
            std_dev_c,
            spread_f: forecast.spread_f,
            hours: Some(forecast.hours_to_resolution),
            lead: forecast.lead_bucket,
            implied_divergence_c,
            observed_high,
            local_hour: Some(local_hour),
            is_today,
        };

        let mut evaluations = 0i64;

        // ── YES selection: candidates near the forecast, scored, top-N. ──
        let sigma_in_unit = match city.unit {
            TempUnit::Fahrenheit => delta_c_to_f(std_dev_c),
            TempUnit::Celsius => std_dev_c,
        };
        let window = self.config.entry.yes_max_forecast_distance * sigma_in_unit;

        let mut yes_candidates: Vec<(usize, f64)> = Vec::new();
        for (i, range) in ranges.iter().enumerate() {
            let point = range.reference_point();
            if !point.is_finite() || (point - forecast_temp).abs() > window {
                continue;
            }
            match evaluate_range_side(&input, range, Side::Yes) {
                Ok(eval) => yes_candidates.push((i, eval.corrected_p - eval.ask)),
                Err(e) => debug!("YES pre-score failed for {}: {}", range.name, e),
            }
        }
        // Descending score; exact ties break toward the lower range_min.
        yes_candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let min_a = ranges[a.0].min.unwrap_or(f64::NEG_INFINITY);
                    let min_b = ranges[b.0].min.unwrap_or(f64::NEG_INFINITY);
                    min_a.partial_cmp(&min_b).unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let top_n = self.config.entry.yes_candidate_count;
        let mut yes_winner: Option<usize> = None;
        for (rank, (i, _score)) in yes_candidates.iter().enumerate() {
            let range = &ranges[*i];
            let eval = match evaluate_range_side(&input, range, Side::Yes) {
                Ok(e) => e,
                Err(e) => {
                    debug!("YES evaluation failed for {}: {}", range.name, e);
                    continue;
                }
            };
            evaluations += 1;

            let superseded = yes_winner.is_some() || rank >= top_n;
            let (action, reason) = if superseded && eval.passes() {
                ("filtered", Some("better_candidate_selected".to_string()))
            } else if eval.passes() {
                yes_winner = Some(*i);
                ("entered", None)
            } else {
                // A candidate that fails on its own merits keeps its real
                // reasons even when it was outranked anyway.
                ("filtered", Some(eval.reasons.join(",")))
            };

            let opportunity_id = self
                .log_evaluation(
                    cycle,
                    city,
                    date,
                    venue,
                    range,
                    &eval,
                    forecast,
                    implied_divergence_c,
                    action,
                    reason,
                )
                .await;

            if action == "entered" {
                approved.push(self.to_opportunity(opportunity_id, city, date, venue, range, &eval, forecast));
            }
        }

        // ── NO selection: every range evaluated, best edge wins. ──
        let mut no_evals: Vec<(usize, Evaluation)> = Vec::new();
        for (i, range) in ranges.iter().enumerate() {
            match evaluate_range_side(&input, range, Side::No) {
                Ok(eval) => no_evals.push((i, eval)),
                Err(e) => debug!("NO evaluation failed for {}: {}", range.name, e),
            }
        }
        let best_no: Option<usize> = no_evals
            .iter()
            .filter(|(_, e)| e.passes())
            .max_by(|a, b| {
                a.1.edge_pct
                    .partial_cmp(&b.1.edge_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| *i);

        for (i, eval) in &no_evals {
            evaluations += 1;
            let range = &ranges[*i];
            let (action, reason) = if Some(*i) == best_no {
                ("entered", None)
            } else if eval.passes() {
                ("filtered", Some("not_best_no_for_city_date".to_string()))
            } else {
                ("filtered", Some(eval.reasons.join(",")))
            };

            let opportunity_id = self
                .log_evaluation(
                    cycle,
                    city,
                    date,
                    venue,
                    range,
                    eval,
                    forecast,
                    implied_divergence_c,
                    action,
                    reason,
                )
                .await;

            if action == "entered" {
                approved.push(self.to_opportunity(opportunity_id, city, date, venue, range, eval, forecast));
            }
        }

        evaluations
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_evaluation(
        &self,
        cycle: i64,
        city: &City,
        date: &str,
        venue: Venue,
        range: &Range,
        eval: &Evaluation,
        forecast: &ForecastResult,
        implied_divergence_c: Option<f64>,
        action: &str,
        filter_reason: Option<String>,
    ) -> Option<i64> {
        let (near, far, in_range) = forecast_edge_features(forecast.ensemble_temp, range);
        let disagreement = match city.unit {
            TempUnit::Fahrenheit => forecast.spread_f,
            TempUnit::Celsius => delta_f_to_c(forecast.spread_f),
        };
        let record = OpportunityRecord {
            cycle,
            city: city.key.clone(),
            date: date.to_string(),
            venue: venue.as_str().to_string(),
            market_id: range.market_id.clone(),
            token_id: range.token_id.clone(),
            range_name: range.name.clone(),
            range_min: range.min,
            range_max: range.max,
            range_kind: range.kind.as_str().to_string(),
            side: eval.side.as_str().to_string(),
            raw_probability: eval.raw_p,
            corrected_probability: eval.corrected_p,
            correction_ratio: eval.ratio,
            edge_pct: eval.edge_pct,
            kelly: eval.kelly,
            bid: eval.bid,
            ask: eval.ask,
            spread: range.spread,
            volume: range.volume,
            hours_to_resolution: Some(forecast.hours_to_resolution),
            forecast_temp: Some(forecast.ensemble_temp),
            forecast_stddev: Some(forecast.std_dev_c),
            action: action.to_string(),
            filter_reason,
            entry_reason: if action == "entered" {
                Some(eval.entry_reason.as_str().to_string())
            } else {
                None
            },
            calibration_bucket: eval.bucket.clone(),
            forecast_to_near_edge: near,
            forecast_to_far_edge: far,
            forecast_in_range: Some(in_range),
            source_disagreement_deg: Some(disagreement),
            market_implied_divergence: implied_divergence_c,
        };
        let db = self.db.lock().await;
        match db.insert_opportunity(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                // Analytical row; losing it is acceptable.
                warn!("Failed to log opportunity for {}: {}", range.name, e);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn to_opportunity(
        &self,
        opportunity_id: Option<i64>,
        city: &City,
        date: &str,
        venue: Venue,
        range: &Range,
        eval: &Evaluation,
        forecast: &ForecastResult,
    ) -> Opportunity {
        Opportunity {
            opportunity_id,
            city: city.key.clone(),
            date: date.to_string(),
            venue,
            range: range.clone(),
            side: eval.side,
            raw_probability: eval.raw_p,
            corrected_probability: eval.corrected_p,
            correction_ratio: eval.ratio,
            edge_pct: eval.edge_pct,
            kelly: eval.kelly,
            ask: eval.ask,
            bid: eval.bid,
            fee: eval.fee,
            entry_reason: eval.entry_reason,
            calibration_bucket: eval.bucket.clone(),
            forecast_temp: Some(forecast.ensemble_temp),
            forecast_stddev_c: Some(forecast.std_dev_c),
            hours_to_resolution: Some(forecast.hours_to_resolution),
            source_temps: forecast.source_temps.clone(),
        }
    }

    async fn note_stale(&self, city: &City, venue: Venue) {
        let should_alert = {
            let mut stale = self.stale.lock().expect("stale lock");
            let state = stale
                .entry((city.key.clone(), venue))
                .or_insert(StaleState { count: 0, alerted: false });
            state.count += 1;
            if state.count >= STALE_CYCLES_THRESHOLD && !state.alerted {
                state.alerted = true;
                true
            } else {
                false
            }
        };
        if should_alert {
            warn!(
                "{} has returned no {} markets for {} cycles",
                venue, city.key, STALE_CYCLES_THRESHOLD
            );
            self.alerts
                .send_now(&format!(
                    "Stale platform: {} has returned no markets for {} for {} cycles",
                    venue, city.key, STALE_CYCLES_THRESHOLD
                ))
                .await;
        }
    }

    fn clear_stale(&self, city: &City, venue: Venue) {
        let mut stale = self.stale.lock().expect("stale lock");
        stale.remove(&(city.key.clone(), venue));
    }

    /// Guaranteed-win pass, run after observation updates. Detects contracts
    /// whose outcome the day's running high has already settled.
    pub async fn scan_guaranteed_wins(&self) -> Result<Vec<Opportunity>> {
        if !self.config.guaranteed_entry.enabled {
            return Ok(Vec::new());
        }

        let open_trades = {
            let db = self.db.lock().await;
            db.get_open_trades()?
        };
        let index = PositionIndex::build(&open_trades);

        // Best margin per (city, date, venue, side); NO additionally keyed
        // by range, since multiple NO legs can all win.
        let mut batch: HashMap<(String, String, Venue, Side, Option<String>), Opportunity> =
            HashMap::new();
        // Same-batch YES thresholds for adjacent-NO protection.
        let mut batch_yes_mins: HashMap<(String, String, Venue), Vec<f64>> = HashMap::new();

        for city in &self.config.cities {
            let tz = match city.tz() {
                Ok(tz) => tz,
                Err(_) => continue,
            };
            let date = Utc::now().with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string();

            for &venue in VENUES {
                let platform = self.config.platform(venue);
                if !platform.trading_enabled || !platform.guaranteed_win_enabled {
                    continue;
                }
                if city.venue_blocked(venue) {
                    continue;
                }

                let observation = match self
                    .observations
                    .get_latest_observation(city, &date, Some(venue))
                    .await
                {
                    Ok(Some(obs)) => obs,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("GW observation read failed for {}: {}", city.key, e);
                        continue;
                    }
                };

                let ranges = match self.venues.get_markets(city, &date, venue).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("GW market fetch failed for {}/{}: {}", city.key, venue, e);
                        continue;
                    }
                };

                for range in &ranges {
                    if let Some(op) = self
                        .evaluate_guaranteed_win(city, &date, venue, range, &observation, &index, &batch_yes_mins)
                        .await
                    {
                        if op.side == Side::Yes {
                            if let Some(min) = op.range.min {
                                batch_yes_mins
                                    .entry((op.city.clone(), op.date.clone(), venue))
                                    .or_default()
                                    .push(min);
                            }
                        }
                        let margin = 1.0 - op.ask - op.fee;
                        let key = (
                            op.city.clone(),
                            op.date.clone(),
                            venue,
                            op.side,
                            if op.side == Side::No {
                                Some(op.range.name.clone())
                            } else {
                                None
                            },
                        );
                        match batch.get(&key) {
                            Some(existing) if 1.0 - existing.ask - existing.fee >= margin => {}
                            _ => {
                                batch.insert(key, op);
                            }
                        }
                    }
                }
            }
        }

        let mut approved: Vec<Opportunity> = Vec::new();
        for mut op in batch.into_values() {
            op.opportunity_id = self.log_gw_opportunity(&op).await;
            approved.push(op);
        }
        if !approved.is_empty() {
            info!("Guaranteed-win scan: {} entries", approved.len());
        }
        Ok(approved)
    }

    /// Guaranteed-win entries get an opportunity row too; the fast-poll pass
    /// has no scan cycle, so they log under cycle 0.
    async fn log_gw_opportunity(&self, op: &Opportunity) -> Option<i64> {
        let record = OpportunityRecord {
            cycle: 0,
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
            raw_probability: 1.0,
            corrected_probability: 1.0,
            correction_ratio: 1.0,
            edge_pct: op.edge_pct,
            kelly: 0.0,
            bid: op.bid,
            ask: op.ask,
            spread: op.range.spread,
            volume: op.range.volume,
            hours_to_resolution: None,
            forecast_temp: None,
            forecast_stddev: None,
            action: "entered".to_string(),
            filter_reason: None,
            entry_reason: Some(op.entry_reason.as_str().to_string()),
            calibration_bucket: None,
            forecast_to_near_edge: None,
            forecast_to_far_edge: None,
            forecast_in_range: None,
            source_disagreement_deg: None,
            market_implied_divergence: None,
        };
        let db = self.db.lock().await;
        match db.insert_opportunity(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to log guaranteed-win opportunity: {}", e);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_guaranteed_win(
        &self,
        city: &City,
        date: &str,
        venue: Venue,
        range: &Range,
        observation: &Observation,
        index: &PositionIndex,
        batch_yes_mins: &HashMap<(String, String, Venue), Vec<f64>>,
    ) -> Option<Opportunity> {
        let gw = &self.config.guaranteed_entry;
        let unit = city.unit;
        let primary = observation.running_high(unit)?;
        let secondary = observation.secondary_high(unit);

        // Only two shapes are decidable from a running high: an
        // unbounded-upper YES once H >= min, and a bounded NO once H > max.
        let (side, threshold, crossed_primary) = match range.kind {
            RangeKind::UnboundedUpper => {
                let min = range.min?;
                (Side::Yes, min, primary >= min)
            }
            RangeKind::Bounded => {
                let max = range.max?;
                (Side::No, max, primary > max)
            }
            RangeKind::UnboundedLower => return None,
        };
        if !crossed_primary {
            return None;
        }

        let crossed_secondary = secondary
            .map(|s| match side {
                Side::Yes => s >= threshold,
                Side::No => s > threshold,
            })
            .unwrap_or(false);

        let dual = crossed_secondary;
        let entry_reason = if dual {
            EntryReason::GuaranteedWin
        } else {
            if gw.require_dual_confirmation {
                return None;
            }
            let (gap_c, gap_f) = if city.dual_station() && city.nws_priority_venue == Some(venue) {
                (gw.dual_station_min_gap_c, gw.dual_station_min_gap_f)
            } else {
                (gw.metar_only_min_gap_c, gw.metar_only_min_gap_f)
            };
            let gap = match unit {
                TempUnit::Fahrenheit => gap_f,
                TempUnit::Celsius => gap_c,
            };
            if primary - threshold < gap {
                // Crossed on one source but not yet by the full gap; park
                // it for the next poll.
                let db = self.db.lock().await;
                if let Err(e) = db.insert_pending_event(
                    &city.key,
                    date,
                    &observation.station_id,
                    &range.name,
                    threshold,
                    primary,
                ) {
                    warn!(
                        "Failed to record pending event for {} {}: {}",
                        city.key, range.name, e
                    );
                }
                return None;
            }
            EntryReason::GuaranteedWinMetarOnly
        };

        let (ask, bid) = match side {
            Side::Yes => (range.ask, range.bid),
            Side::No => (range.no_ask(), range.no_bid()),
        };
        let fee = entry_fee(venue, ask);
        let min_ask = if dual { gw.min_ask_dual_confirmed } else { gw.min_ask };

        if ask < min_ask || ask > gw.max_ask {
            return None;
        }
        if bid < gw.gw_min_bid {
            return None;
        }
        let margin = 1.0 - ask - fee;
        if margin < gw.min_margin_cents / 100.0 {
            return None;
        }
        if range.volume <= 0.0 {
            return None;
        }

        // Duplicate checks mirror the scan pre-pass.
        if index.has_full(&city.key, date, &range.name, side, venue)
            || index.has_range_open(&city.key, date, &range.name, venue)
            || index.has_side_open(&city.key, date, venue, side)
        {
            return None;
        }
        // Adjacent-NO protection, against both persisted and same-batch YES.
        if side == Side::No {
            if let Some(max) = range.max {
                let persisted = index.yes_range_mins(&city.key, date, venue);
                let in_batch = batch_yes_mins
                    .get(&(city.key.clone(), date.to_string(), venue))
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);
                if persisted
                    .iter()
                    .chain(in_batch.iter())
                    .any(|yes_min| max <= *yes_min)
                {
                    return None;
                }
            }
        }

        info!(
            "Guaranteed win: {} {} {} on {} (obs {:.1}{} vs threshold {:.1}, {})",
            city.key,
            side,
            range.name,
            venue,
            primary,
            unit.symbol(),
            threshold,
            entry_reason,
        );

        Some(Opportunity {
            opportunity_id: None,
            city: city.key.clone(),
            date: date.to_string(),
            venue,
            range: range.clone(),
            side,
            raw_probability: 1.0,
            corrected_probability: 1.0,
            correction_ratio: 1.0,
            edge_pct: margin * 100.0,
            kelly: 0.0,
            ask,
            bid,
            fee,
            entry_reason,
            calibration_bucket: None,
            forecast_temp: None,
            forecast_stddev_c: None,
            hours_to_resolution: None,
            source_temps: Vec::new(),
        })
    }
}

/// ML feature triple: distance from the forecast to the near and far bounds
/// (market unit) and whether the forecast sits inside the range.
pub(crate) fn forecast_edge_features(
    forecast_temp: f64,
    range: &Range,
) -> (Option<f64>, Option<f64>, bool) {
    match (range.min, range.max) {
        (Some(lo), Some(hi)) => {
            let d_lo = (forecast_temp - lo).abs();
            let d_hi = (forecast_temp - hi).abs();
            (
                Some(d_lo.min(d_hi)),
                Some(d_lo.max(d_hi)),
                forecast_temp >= lo && forecast_temp <= hi,
            )
        }
        (Some(lo), None) => {
            let d = (forecast_temp - lo).abs();
            (Some(d), None, forecast_temp >= lo)
        }
        (None, Some(hi)) => {
            let d = (forecast_temp - hi).abs();
            (Some(d), None, forecast_temp <= hi)
        }
        (None, None) => (None, None, true),
    }
}
