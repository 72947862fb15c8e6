use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{CalibrationConfig, City, ForecastsConfig};
use crate::db::{AccuracyRow, Database, ResolvedOppRow};
use crate::units::{delta_f_to_c, LeadBucket, TempUnit};

/// Empirical CDFs need this many scored days before they replace the normal
/// approximation.
const CDF_MIN_SAMPLES: u32 = 40;
/// Model-calibration sample floors: pooled entries and city-specific entries.
const MODEL_CAL_POOLED_MIN_N: u32 = 30;
const MODEL_CAL_CITY_MIN_N: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct BiasEntry {
    pub bias: f64,
    pub n: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct StdEntry {
    /// Residual standard deviation in °C.
    pub std_c: f64,
    pub n: u32,
}

#[derive(Debug, Clone)]
pub struct CityEligibility {
    pub mae: f64,
    pub n: u32,
    pub unit: TempUnit,
    pub allow_bounded: bool,
    pub allow_unbounded: bool,
}

#[derive(Debug, Clone)]
pub struct EmpiricalCdf {
    /// Signed forecast error (forecast − actual) at the 5th..95th percentile,
    /// 5-point steps, in the city's native unit.
    pub percentiles: Vec<f64>,
    pub n: u32,
    pub unit: TempUnit,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MarketCalEntry {
    pub win_rate: f64,
    pub n: u32,
    pub true_edge: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelCalEntry {
    pub ratio: f64,
    pub n: u32,
}

/// 5-cent price buckets from 0c to 55c, then one open bucket.
pub fn price_bucket(ask: f64) -> &'static str {
    const BUCKETS: &[(f64, &str)] = &[
        (0.05, "0-5c"),
        (0.10, "5-10c"),
        (0.15, "10-15c"),
        (0.20, "15-20c"),
        (0.25, "20-25c"),
        (0.30, "25-30c"),
        (0.35, "30-35c"),
        (0.40, "35-40c"),
        (0.45, "40-45c"),
        (0.50, "45-50c"),
        (0.55, "50-55c"),
    ];
    for (hi, label) in BUCKETS {
        if ask < *hi {
            return label;
        }
    }
    "55c+"
}

/// Midpoint of a price bucket, for trueEdge = winRate − mid.
pub fn price_bucket_mid(bucket: &str) -> f64 {
    if bucket == "55c+" {
        return 0.775;
    }
    let parsed: Option<(f64, f64)> = bucket.strip_suffix('c').and_then(|core| {
        let mut parts = core.splitn(2, '-');
        let lo = parts.next()?.parse::<f64>().ok()?;
        let hi = parts.next()?.parse::<f64>().ok()?;
        Some((lo, hi))
    });
    match parsed {
        Some((lo, hi)) => (lo + hi) / 200.0,
        None => 0.5,
    }
}

/// 5-percentage-point model probability buckets up to 75%. Above that the
/// model is left uncorrected.
pub fn prob_bucket(p: f64) -> Option<&'static str> {
    const BUCKETS: &[(f64, &str)] = &[
        (0.05, "0-5"),
        (0.10, "5-10"),
        (0.15, "10-15"),
        (0.20, "15-20"),
        (0.25, "20-25"),
        (0.30, "25-30"),
        (0.35, "30-35"),
        (0.40, "35-40"),
        (0.45, "40-45"),
        (0.50, "45-50"),
        (0.55, "50-55"),
        (0.60, "55-60"),
        (0.65, "60-65"),
        (0.70, "65-70"),
        (0.75, "70-75"),
    ];
    for (hi, label) in BUCKETS {
        if p < *hi {
            return Some(label);
        }
    }
    None
}

/// Immutable view of every derived calibration table. Readers hold one Arc
/// for the duration of an evaluation; the store swaps the whole value on
/// refresh, so no torn reads are possible.
#[derive(Debug, Default)]
pub struct CalibrationSnapshot {
    pub generation: u64,
    /// "source:unit"
    pub biases: HashMap<String, BiasEntry>,
    /// "city:source:unit"
    pub city_biases: HashMap<String, BiasEntry>,
    /// "source:unit:leadBucket"
    pub lead_biases: HashMap<String, BiasEntry>,
    /// "city:source:unit:leadBucket"
    pub city_lead_biases: HashMap<String, BiasEntry>,
    /// unit code → pooled residual stddev
    pub pooled_std_devs: HashMap<String, StdEntry>,
    pub city_std_devs: HashMap<String, StdEntry>,
    pub city_active_sources: HashMap<String, HashSet<String>>,
    pub city_soft_demoted: HashMap<String, HashSet<String>>,
    pub city_source_weights: HashMap<String, HashMap<String, f64>>,
    pub city_eligibility: HashMap<String, CityEligibility>,
    pub city_empirical_cdf: HashMap<String, EmpiricalCdf>,
    /// "venue|rangeKind|leadBucket|priceBucket" and "...|city"
    pub market_calibration: HashMap<String, MarketCalEntry>,
    /// "rangeKind|probBucket" and "city|rangeKind|probBucket"
    pub model_calibration: HashMap<String, ModelCalEntry>,
}

impl CalibrationSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Four-level bias cascade: most specific entry with n >= min_n wins.
    /// The returned bias is in the unit it was recorded in.
    pub fn bias_cascade(
        &self,
        city: &str,
        source: &str,
        unit: TempUnit,
        lead: LeadBucket,
        min_n: u32,
    ) -> Option<f64> {
        let u = unit.code();
        let lookups = [
            self.city_lead_biases.get(&format!("{}:{}:{}:{}", city, source, u, lead)),
            self.city_biases.get(&format!("{}:{}:{}", city, source, u)),
            self.lead_biases.get(&format!("{}:{}:{}", source, u, lead)),
            self.biases.get(&format!("{}:{}", source, u)),
        ];
        lookups
            .into_iter()
            .flatten()
            .find(|e| e.n >= min_n)
            .map(|e| e.bias)
    }

    /// Market calibration lookup: city-specific entry preferred when it has
    /// enough samples, pooled otherwise. Returns the entry and the bucket key
    /// actually used (recorded on the opportunity row).
    pub fn market_entry(
        &self,
        venue: &str,
        range_kind: &str,
        lead: LeadBucket,
        ask: f64,
        city: &str,
        city_min_n: u32,
    ) -> Option<(MarketCalEntry, String)> {
        let pooled_key = format!("{}|{}|{}|{}", venue, range_kind, lead, price_bucket(ask));
        let city_key = format!("{}|{}", pooled_key, city);
        if let Some(entry) = self.market_calibration.get(&city_key) {
            if entry.n >= city_min_n {
                return Some((*entry, city_key));
            }
        }
        self.market_calibration
            .get(&pooled_key)
            .map(|e| (*e, pooled_key))
    }

    /// Model correction ratio for a raw probability. City entries need
    /// n >= 50 to win over pooled entries (n >= 30). Returns (ratio, key).
    pub fn correction_ratio(&self, city: &str, range_kind: &str, raw_p: f64) -> (f64, Option<String>) {
        let Some(bucket) = prob_bucket(raw_p) else {
            return (1.0, None);
        };
        let city_key = format!("{}|{}|{}", city, range_kind, bucket);
        if let Some(entry) = self.model_calibration.get(&city_key) {
            if entry.n >= MODEL_CAL_CITY_MIN_N {
                return (entry.ratio, Some(city_key));
            }
        }
        let pooled_key = format!("{}|{}", range_kind, bucket);
        if let Some(entry) = self.model_calibration.get(&pooled_key) {
            if entry.n >= MODEL_CAL_POOLED_MIN_N {
                return (entry.ratio, Some(pooled_key));
            }
        }
        (1.0, None)
    }

    /// Active source set for a city. None means no evidence yet; callers
    /// treat that as "all applicable sources".
    pub fn active_sources(&self, city: &str) -> Option<&HashSet<String>> {
        self.city_active_sources.get(city)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64], center: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let var = values.iter().map(|v| (v - center).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn percentile_interpolated(sorted: &[f64], p: f64) -> f64 {
    let idx = p * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = idx - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

fn std_to_celsius(std: f64, unit: TempUnit) -> f64 {
    match unit {
        TempUnit::Celsius => std,
        TempUnit::Fahrenheit => delta_f_to_c(std),
    }
}

/// Pure derivation of a snapshot from the two history tables. Ordering
/// matters: weights and eligibility depend on which sources survive
/// demotion, so activity is settled before weights.
pub fn build_snapshot(
    accuracy: &[AccuracyRow],
    resolved: &[ResolvedOppRow],
    forecasts: &ForecastsConfig,
    cities: &[City],
    generation: u64,
) -> CalibrationSnapshot {
    let mut snap = CalibrationSnapshot {
        generation,
        ..Default::default()
    };
    let sm = &forecasts.source_management;
    let elig = &forecasts.city_eligibility;

    let city_unit = |key: &str| -> TempUnit {
        cities
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.unit)
            .unwrap_or(TempUnit::Fahrenheit)
    };

    // 1. Per-(source, unit) bias and residual stddev; pooled per-unit residuals.
    let mut group_errors: HashMap<(String, String), Vec<f64>> = HashMap::new();
    for row in accuracy {
        group_errors
            .entry((row.source.clone(), row.unit.clone()))
            .or_default()
            .push(row.error);
    }
    let mut unit_residuals: HashMap<String, Vec<f64>> = HashMap::new();
    for ((source, unit), errors) in &group_errors {
        let bias = mean(errors);
        snap.biases.insert(
            format!("{}:{}", source, unit),
            BiasEntry {
                bias,
                n: errors.len() as u32,
            },
        );
        let residuals = unit_residuals.entry(unit.clone()).or_default();
        residuals.extend(errors.iter().map(|e| e - bias));
    }
    for (unit_code, residuals) in &unit_residuals {
        if let Some(std) = sample_std(residuals, 0.0) {
            let unit: TempUnit = unit_code.parse().unwrap_or(TempUnit::Fahrenheit);
            snap.pooled_std_devs.insert(
                unit_code.clone(),
                StdEntry {
                    std_c: std_to_celsius(std, unit),
                    n: residuals.len() as u32,
                },
            );
        }
    }

    // 2. Per-city per-source bias and residual MAE.
    let mut city_source_errors: HashMap<(String, String, String), Vec<f64>> = HashMap::new();
    for row in accuracy {
        city_source_errors
            .entry((row.city.clone(), row.source.clone(), row.unit.clone()))
            .or_default()
            .push(row.error);
    }
    // (city → source → (mae, n)) with bias and MAE recorded along the way.
    let mut city_maes: HashMap<String, HashMap<String, (f64, u32)>> = HashMap::new();
    for ((city, source, unit), errors) in &city_source_errors {
        let bias = mean(errors);
        snap.city_biases.insert(
            format!("{}:{}:{}", city, source, unit),
            BiasEntry {
                bias,
                n: errors.len() as u32,
            },
        );
        let group_bias = snap
            .biases
            .get(&format!("{}:{}", source, unit))
            .map(|b| b.bias)
            .unwrap_or(0.0);
        let mae = errors.iter().map(|e| (e - group_bias).abs()).sum::<f64>() / errors.len() as f64;
        city_maes
            .entry(city.clone())
            .or_default()
            .insert(source.clone(), (mae, errors.len() as u32));
    }

    // 3 + 4. Rank by MAE and demote. If a hard demotion would drop the city
    // below the active-source floor, demote softly (weight-capped) instead.
    for (city, maes) in &city_maes {
        let unit = city_unit(city);
        let abs_ceiling = match unit {
            TempUnit::Fahrenheit => sm.demotion_mae_f,
            TempUnit::Celsius => sm.demotion_mae_c,
        };

        let mut judged: Vec<(&String, f64, u32)> = maes
            .iter()
            .map(|(source, (mae, n))| (source, *mae, *n))
            .collect();
        judged.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let best_mae = judged
            .iter()
            .filter(|(_, mae, n)| *mae <= abs_ceiling && *n >= sm.min_samples)
            .map(|(_, mae, _)| *mae)
            .next();
        let rel_ceiling = best_mae.map(|b| b * sm.relative_demotion_factor);

        let mut active: HashSet<String> = HashSet::new();
        let mut demote: HashSet<String> = HashSet::new();
        for (source, mae, n) in &judged {
            // Sources with thin history stay active.
            if *n < sm.min_samples {
                active.insert((*source).clone());
                continue;
            }
            let over_abs = *mae > abs_ceiling;
            let over_rel = rel_ceiling.map(|c| *mae > c).unwrap_or(false);
            if over_abs || over_rel {
                demote.insert((*source).clone());
            } else {
                active.insert((*source).clone());
            }
        }

        let mut soft: HashSet<String> = HashSet::new();
        if !demote.is_empty() && active.len() < sm.min_active_sources {
            // Keep the would-be-demoted sources alive with a weight cap.
            for source in demote.drain() {
                soft.insert(source.clone());
                active.insert(source);
            }
        }

        snap.city_active_sources.insert(city.clone(), active);
        if !soft.is_empty() {
            snap.city_soft_demoted.insert(city.clone(), soft);
        }
    }

    // 5. Sample-weighted city MAE over active sources → eligibility gates.
    for (city, maes) in &city_maes {
        let unit = city_unit(city);
        let active = snap.city_active_sources.get(city);
        let mut weighted_sum = 0.0;
        let mut total_n = 0u32;
        for (source, (mae, n)) in maes {
            if active.map(|a| a.contains(source)).unwrap_or(true) {
                weighted_sum += mae * *n as f64;
                total_n += n;
            }
        }
        if total_n == 0 {
            continue;
        }
        let weighted_mae = weighted_sum / total_n as f64;
        let (bounded_max, unbounded_max) = match unit {
            TempUnit::Fahrenheit => (elig.bounded_max_mae_f, elig.unbounded_max_mae_f),
            TempUnit::Celsius => (elig.bounded_max_mae_c, elig.unbounded_max_mae_c),
        };
        let below_floor = total_n < elig.min_samples;
        snap.city_eligibility.insert(
            city.clone(),
            CityEligibility {
                mae: weighted_mae,
                n: total_n,
                unit,
                allow_bounded: below_floor || weighted_mae <= bounded_max,
                allow_unbounded: below_floor || weighted_mae <= unbounded_max,
            },
        );
    }

    // 6. Per-city empirical stddev over bias-removed residuals.
    for city in city_maes.keys() {
        let unit = city_unit(city);
        let mut residuals: Vec<f64> = Vec::new();
        for ((c, source, u), errors) in &city_source_errors {
            if c != city {
                continue;
            }
            let bias = snap
                .city_biases
                .get(&format!("{}:{}:{}", c, source, u))
                .map(|b| b.bias)
                .unwrap_or(0.0);
            residuals.extend(errors.iter().map(|e| e - bias));
        }
        if residuals.len() >= elig.min_samples as usize {
            if let Some(std) = sample_std(&residuals, 0.0) {
                snap.city_std_devs.insert(
                    city.clone(),
                    StdEntry {
                        std_c: std_to_celsius(std, unit),
                        n: residuals.len() as u32,
                    },
                );
            }
        }
    }

    // 7. Lead-time-bucketed biases at both cascade levels.
    let mut lead_groups: HashMap<String, Vec<f64>> = HashMap::new();
    let mut city_lead_groups: HashMap<String, Vec<f64>> = HashMap::new();
    for row in accuracy {
        lead_groups
            .entry(format!("{}:{}:{}", row.source, row.unit, row.lead_bucket))
            .or_default()
            .push(row.error);
        city_lead_groups
            .entry(format!(
                "{}:{}:{}:{}",
                row.city, row.source, row.unit, row.lead_bucket
            ))
            .or_default()
            .push(row.error);
    }
    for (key, errors) in lead_groups {
        snap.lead_biases.insert(
            key,
            BiasEntry {
                bias: mean(&errors),
                n: errors.len() as u32,
            },
        );
    }
    for (key, errors) in city_lead_groups {
        snap.city_lead_biases.insert(
            key,
            BiasEntry {
                bias: mean(&errors),
                n: errors.len() as u32,
            },
        );
    }

    // 8. Inverse-MAE weights over active sources, soft-demotion caps applied.
    for (city, maes) in &city_maes {
        let Some(active) = snap.city_active_sources.get(city) else {
            continue;
        };
        let soft = snap.city_soft_demoted.get(city);
        let mut weights: HashMap<String, f64> = HashMap::new();
        for (source, (mae, n)) in maes {
            if !active.contains(source) || *n < sm.weight_min_samples {
                continue;
            }
            weights.insert(source.clone(), 1.0 / mae.max(0.1));
        }
        if weights.is_empty() {
            continue;
        }
        let total: f64 = weights.values().sum();
        for w in weights.values_mut() {
            *w /= total;
        }

        if let Some(soft) = soft {
            let cap = sm.soft_demotion_max_weight;
            let mut overflow = 0.0;
            let mut uncapped_total = 0.0;
            for (source, w) in weights.iter_mut() {
                if soft.contains(source) && *w > cap {
                    overflow += *w - cap;
                    *w = cap;
                } else if !soft.contains(source) {
                    uncapped_total += *w;
                }
            }
            if overflow > 0.0 && uncapped_total > 0.0 {
                for (source, w) in weights.iter_mut() {
                    if !soft.contains(source) {
                        *w += overflow * (*w / uncapped_total);
                    }
                }
            }
            // Renormalize: caps plus redistribution can leave dust.
            let total: f64 = weights.values().sum();
            if total > 0.0 {
                for w in weights.values_mut() {
                    *w /= total;
                }
            }
        }

        snap.city_source_weights.insert(city.clone(), weights);
    }

    // 9. Market calibration buckets, pooled and per-city.
    {
        struct Acc {
            wins: u32,
            n: u32,
        }
        let mut buckets: HashMap<String, Acc> = HashMap::new();
        for row in resolved {
            let pooled = format!(
                "{}|{}|{}|{}",
                row.venue,
                row.range_kind,
                row.lead_bucket,
                price_bucket(row.ask)
            );
            let city = format!("{}|{}", pooled, row.city);
            for key in [pooled, city] {
                let acc = buckets.entry(key).or_insert(Acc { wins: 0, n: 0 });
                acc.n += 1;
                if row.side_won {
                    acc.wins += 1;
                }
            }
        }
        for (key, acc) in buckets {
            let win_rate = acc.wins as f64 / acc.n as f64;
            let bucket_label = key.split('|').nth(3).unwrap_or("55c+").to_string();
            snap.market_calibration.insert(
                key,
                MarketCalEntry {
                    win_rate,
                    n: acc.n,
                    true_edge: win_rate - price_bucket_mid(&bucket_label),
                },
            );
        }
    }

    // 10. Model calibration correction ratios.
    {
        struct Acc {
            wins: u32,
            n: u32,
            prob_sum: f64,
        }
        let mut buckets: HashMap<String, Acc> = HashMap::new();
        for row in resolved {
            let Some(bucket) = prob_bucket(row.raw_probability) else {
                continue;
            };
            let pooled = format!("{}|{}", row.range_kind, bucket);
            let city = format!("{}|{}|{}", row.city, row.range_kind, bucket);
            for key in [pooled, city] {
                let acc = buckets.entry(key).or_insert(Acc {
                    wins: 0,
                    n: 0,
                    prob_sum: 0.0,
                });
                acc.n += 1;
                acc.prob_sum += row.raw_probability;
                if row.side_won {
                    acc.wins += 1;
                }
            }
        }
        for (key, acc) in buckets {
            let mean_prob = acc.prob_sum / acc.n as f64;
            if mean_prob <= 0.0 {
                continue;
            }
            snap.model_calibration.insert(
                key,
                ModelCalEntry {
                    ratio: (acc.wins as f64 / acc.n as f64) / mean_prob,
                    n: acc.n,
                },
            );
        }
    }

    // 11. 19-point per-city empirical error CDF in the native unit.
    for city in city_maes.keys() {
        let unit = city_unit(city);
        let mut errors: Vec<f64> = accuracy
            .iter()
            .filter(|r| &r.city == city)
            .map(|r| r.error)
            .collect();
        if errors.len() < 2 {
            continue;
        }
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentiles: Vec<f64> = (1..=19)
            .map(|i| percentile_interpolated(&errors, i as f64 * 0.05))
            .collect();
        snap.city_empirical_cdf.insert(
            city.clone(),
            EmpiricalCdf {
                percentiles,
                n: errors.len() as u32,
                unit,
                is_active: errors.len() as u32 >= CDF_MIN_SAMPLES,
            },
        );
    }

    snap
}

/// TTL-refreshed owner of the current snapshot. Single-flight: callers that
/// arrive while a refresh is running get the previous snapshot immediately;
/// only the caller that triggered the refresh waits for the rebuild.
pub struct CalibrationStore {
    db: Arc<Mutex<Database>>,
    forecasts: ForecastsConfig,
    calibration: CalibrationConfig,
    cities: Vec<City>,
    ttl: Duration,
    state: Mutex<StoreState>,
}

struct StoreState {
    snapshot: Arc<CalibrationSnapshot>,
    fetched_at: Option<Instant>,
    refreshing: bool,
    generation: u64,
    warned_empty: bool,
}

impl CalibrationStore {
    pub fn new(
        db: Arc<Mutex<Database>>,
        forecasts: ForecastsConfig,
        calibration: CalibrationConfig,
        cities: Vec<City>,
    ) -> Self {
        let ttl = Duration::from_secs(calibration.refresh_hours * 3600);
        CalibrationStore {
            db,
            forecasts,
            calibration,
            cities,
            ttl,
            state: Mutex::new(StoreState {
                snapshot: Arc::new(CalibrationSnapshot::empty()),
                fetched_at: None,
                refreshing: false,
                generation: 0,
                warned_empty: false,
            }),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.calibration
    }

    /// Current snapshot, refreshing first when the TTL has lapsed. On
    /// refresh failure the prior snapshot is retained.
    pub async fn snapshot(&self) -> Arc<CalibrationSnapshot> {
        let generation = {
            let mut state = self.state.lock().await;
            let fresh = state
                .fetched_at
                .map(|t| t.elapsed() < self.ttl)
                .unwrap_or(false);
            if fresh || state.refreshing {
                return state.snapshot.clone();
            }
            state.refreshing = true;
            state.generation + 1
        };

        let built = self.load_and_build(generation).await;

        let mut state = self.state.lock().await;
        state.refreshing = false;
        match built {
            Ok(snapshot) => {
                if snapshot.biases.is_empty() && !state.warned_empty {
                    warn!("Calibration history empty; engine falls back to tier stddevs and zero bias");
                    state.warned_empty = true;
                }
                info!(
                    "Calibration refreshed: gen={} sources={} cities={} market_buckets={} model_buckets={}",
                    generation,
                    snapshot.biases.len(),
                    snapshot.city_eligibility.len(),
                    snapshot.market_calibration.len(),
                    snapshot.model_calibration.len(),
                );
                state.snapshot = Arc::new(snapshot);
                state.fetched_at = Some(Instant::now());
                state.generation = generation;
            }
            Err(e) => {
                // Keep the prior snapshot; partial data is never exposed.
                warn!("Calibration refresh failed (retaining prior snapshot): {}", e);
            }
        }
        state.snapshot.clone()
    }

    async fn load_and_build(&self, generation: u64) -> anyhow::Result<CalibrationSnapshot> {
        let window = self.forecasts.calibration_window_days;
        let (accuracy, resolved) = {
            let db = self.db.lock().await;
            (db.get_accuracy_rows(window)?, db.get_resolved_opportunities(window)?)
        };

        let snapshot = build_snapshot(&accuracy, &resolved, &self.forecasts, &self.cities, generation);

        // Materialize derived tables for inspection; analytical, so failures
        // only warn.
        {
            let db = self.db.lock().await;
            for (key, entry) in &snapshot.market_calibration {
                if let Err(e) = db.upsert_market_calibration(key, entry.win_rate, entry.n, entry.true_edge)
                {
                    warn!("Failed to materialize market calibration {}: {}", key, e);
                    break;
                }
            }
            for (key, entry) in &snapshot.model_calibration {
                if let Err(e) = db.upsert_model_calibration(key, entry.ratio, entry.n) {
                    warn!("Failed to materialize model calibration {}: {}", key, e);
                    break;
                }
            }
            for (city, cdf) in &snapshot.city_empirical_cdf {
                let json = serde_json::to_string(&cdf.percentiles).unwrap_or_else(|_| "[]".into());
                if let Err(e) = db.upsert_city_error_distribution(city, cdf.unit.code(), &json, cdf.n) {
                    warn!("Failed to materialize error distribution for {}: {}", city, e);
                    break;
                }
            }
        }

        Ok(snapshot)
    }
}
