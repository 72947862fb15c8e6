use anyhow::Result;
use chrono::{NaiveDate, Utc};
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationSnapshot, CalibrationStore, CityEligibility, EmpiricalCdf};
use crate::config::{City, ForecastsConfig, PlatformConfig};
use crate::db::Database;
use crate::sources::{SourceClient, SourceId, ALL_SOURCES};
use crate::units::{
    delta_c_to_f, delta_f_to_c, fahrenheit_to_celsius, from_fahrenheit, Confidence, LeadBucket,
    TempUnit,
};
use crate::venue::Venue;

/// Outlier trim threshold: deviation from the mean of the other sources, °F.
const OUTLIER_TRIM_F: f64 = 8.0;
/// Spread widening kicks in above this source disagreement, °F.
const SPREAD_WIDEN_THRESHOLD_F: f64 = 4.0;
const SPREAD_WIDEN_FACTOR: f64 = 0.3;
/// Extra °C of uncertainty for cities whose venues resolve on different
/// stations.
const DUAL_STATION_WIDEN_C: f64 = 1.0;
/// Pooled per-unit stddev needs this many residuals.
const POOLED_STD_MIN_N: u32 = 10;

#[derive(Debug, Clone)]
pub struct SourceTemp {
    pub source: String,
    pub temp_f: f64,
    pub shadow: bool,
    /// Survived trimming and entered the average.
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct ForecastResult {
    pub city: String,
    pub date: String,
    /// Ensemble temperature in the city's market unit.
    pub ensemble_temp: f64,
    /// NWS-boosted variant for the NWS-priority venue, market unit.
    pub nws_boosted_temp: Option<f64>,
    /// Always strictly positive, °C.
    pub std_dev_c: f64,
    pub confidence: Confidence,
    pub source_temps: Vec<SourceTemp>,
    /// Max − min of the surviving sources, °F.
    pub spread_f: f64,
    pub hours_to_resolution: f64,
    pub lead_bucket: LeadBucket,
}

/// Φ via the Abramowitz & Stegun 7.1.26 erf polynomial with the √2
/// normalization (`z = |x|/√2`). Input clamped to ±8.
pub fn normal_cdf(x: f64) -> f64 {
    let x = x.clamp(-8.0, 8.0);
    let z = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.3275911 * z);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-z * z).exp();
    let p = 0.5 * (1.0 + erf);
    if x < 0.0 {
        1.0 - p
    } else {
        p
    }
}

/// P(error <= x) from a 19-point percentile table, linearly interpolated.
/// Beyond the table: 0.025 below the 5th percentile, 0.975 above the 95th.
fn empirical_error_cdf(cdf: &EmpiricalCdf, x: f64) -> f64 {
    let pts = &cdf.percentiles;
    if x < pts[0] {
        return 0.025;
    }
    if x > pts[pts.len() - 1] {
        return 0.975;
    }
    for i in 0..pts.len() - 1 {
        if x <= pts[i + 1] {
            let p_lo = (i + 1) as f64 * 0.05;
            let p_hi = (i + 2) as f64 * 0.05;
            let width = pts[i + 1] - pts[i];
            if width <= f64::EPSILON {
                return p_hi;
            }
            return p_lo + (p_hi - p_lo) * (x - pts[i]) / width;
        }
    }
    0.975
}

/// Drop at most one source whose deviation from the mean of the others
/// exceeds the trim threshold; the largest deviation wins. Input order must
/// be stable for determinism; callers sort by source name.
pub(crate) fn trim_outlier(temps: &mut Vec<(String, f64)>) -> Option<String> {
    if temps.len() < 3 {
        return None;
    }
    let mut worst: Option<(usize, f64)> = None;
    for i in 0..temps.len() {
        let others_sum: f64 = temps
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, (_, t))| t)
            .sum();
        let others_mean = others_sum / (temps.len() - 1) as f64;
        let dev = (temps[i].1 - others_mean).abs();
        if dev > OUTLIER_TRIM_F {
            match worst {
                Some((_, w)) if w >= dev => {}
                _ => worst = Some((i, dev)),
            }
        }
    }
    worst.map(|(i, _)| temps.remove(i).0)
}

/// Three-stage widening of the base stddev: spread, dual-station, lead time.
pub(crate) fn widen_std(base_c: f64, spread_f: f64, dual_station: bool, hours: f64) -> f64 {
    let mut std = base_c;
    if spread_f > SPREAD_WIDEN_THRESHOLD_F {
        std += SPREAD_WIDEN_FACTOR * delta_f_to_c(spread_f);
    }
    if dual_station {
        std += DUAL_STATION_WIDEN_C;
    }
    std * (hours / 24.0).max(0.5).sqrt()
}

pub struct ForecastEngine {
    sources: Arc<SourceClient>,
    calibration: Arc<CalibrationStore>,
    db: Arc<Mutex<Database>>,
    config: ForecastsConfig,
    platforms: HashMap<Venue, PlatformConfig>,
    /// city → last calibration generation for which the weighted-vs-equal
    /// delta was logged.
    weight_delta_logged: std::sync::Mutex<HashMap<String, u64>>,
}

impl ForecastEngine {
    pub fn new(
        sources: Arc<SourceClient>,
        calibration: Arc<CalibrationStore>,
        db: Arc<Mutex<Database>>,
        config: ForecastsConfig,
        platforms: HashMap<Venue, PlatformConfig>,
    ) -> Self {
        ForecastEngine {
            sources,
            calibration,
            db,
            config,
            platforms,
            weight_delta_logged: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Hours until the contract resolves: end of the contract date in the
    /// city's local time. Never negative.
    pub fn hours_to_resolution(city: &City, date: &str) -> Result<f64> {
        let tz = city.tz()?;
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("Invalid date '{}': {}", date, e))?;
        let end_naive = day
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| anyhow::anyhow!("Invalid end-of-day for {}", date))?;
        let end_local = end_naive
            .and_local_timezone(tz)
            .earliest()
            .ok_or_else(|| anyhow::anyhow!("Unrepresentable local time for {}", date))?;
        let now = Utc::now().with_timezone(&tz);
        let hours = (end_local - now).num_seconds() as f64 / 3600.0;
        Ok(hours.max(0.0))
    }

    /// Ensemble forecast for (city, date). None when no source produced a
    /// usable value; the cycle simply skips the pair.
    pub async fn get_forecast(&self, city: &City, date: &str) -> Result<Option<ForecastResult>> {
        let snapshot = self.calibration.snapshot().await;
        let hours = Self::hours_to_resolution(city, date)?;
        let lead = LeadBucket::from_hours(hours);
        let days = self.config.scan_days.max(3) + 1;

        let applicable: Vec<SourceId> = ALL_SOURCES
            .iter()
            .copied()
            .filter(|s| s.applies_to(city))
            .collect();

        let results: Vec<(SourceId, Result<crate::sources::MultiDay>)> =
            stream::iter(applicable.into_iter())
                .map(|source| {
                    let sources = self.sources.clone();
                    let city = city.clone();
                    async move {
                        let result = sources.fetch_multi_day(source, &city, days).await;
                        (source, result)
                    }
                })
                .buffer_unordered(8)
                .collect()
                .await;

        let mut member_spread_f: Option<f64> = None;
        let mut fetched: Vec<(SourceId, f64)> = Vec::new();
        for (source, result) in results {
            match result {
                Ok(multi_day) => {
                    let Some(day) = multi_day.iter().find(|d| d.date == date) else {
                        debug!("{} has no {} entry for {}", source, date, city.key);
                        continue;
                    };
                    if !day.high_f.is_finite() {
                        warn!("{} produced non-finite value for {}/{}", source, city.key, date);
                        continue;
                    }
                    if source.is_variance_only() {
                        member_spread_f = Some(day.high_f);
                    } else {
                        fetched.push((source, day.high_f));
                    }
                }
                Err(e) => {
                    warn!("Source {} failed for {}/{}: {}", source, city.key, date, e);
                }
            }
        }

        // Stable iteration order for deterministic trimming.
        fetched.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        // Calibration decides the live set; shadows are recorded only. With
        // no activity evidence every non-shadow source is live.
        let active_set = snapshot.active_sources(&city.key);
        let mut candidates: Vec<(String, f64)> = Vec::new();
        let mut source_temps: Vec<SourceTemp> = Vec::new();
        for (source, temp_f) in &fetched {
            let name = source.as_str().to_string();
            let live = !source.is_shadow()
                && active_set
                    .map(|set| set.is_empty() || set.contains(&name))
                    .unwrap_or(true);
            source_temps.push(SourceTemp {
                source: name.clone(),
                temp_f: *temp_f,
                shadow: source.is_shadow(),
                used: live,
            });
            if live {
                candidates.push((name, *temp_f));
            }
        }

        if candidates.is_empty() {
            debug!("No usable sources for {}/{} this cycle", city.key, date);
            return Ok(None);
        }

        if let Some(dropped) = trim_outlier(&mut candidates) {
            info!("Outlier-trimmed {} for {}/{}", dropped, city.key, date);
            if let Some(st) = source_temps.iter_mut().find(|s| s.source == dropped) {
                st.used = false;
            }
        }

        // Bias correction via the four-level cascade. Biases live in the
        // city's native unit; deltas convert with ×9/5.
        let min_n = self.config.source_management.min_samples;
        let mut corrected: Vec<(String, f64)> = Vec::new();
        for (name, temp_f) in &candidates {
            let bias_f = snapshot
                .bias_cascade(&city.key, name, city.unit, lead, min_n)
                .map(|b| match city.unit {
                    TempUnit::Fahrenheit => b,
                    TempUnit::Celsius => delta_c_to_f(b),
                })
                .unwrap_or(0.0);
            let value = temp_f - bias_f;
            if !value.is_finite() {
                warn!("Bias-corrected value non-finite for {} {}/{}", name, city.key, date);
                continue;
            }
            corrected.push((name.clone(), value));
        }
        if corrected.is_empty() {
            return Ok(None);
        }

        let weights = snapshot.city_source_weights.get(&city.key);
        let covers_all = weights
            .map(|w| corrected.iter().all(|(name, _)| w.contains_key(name)))
            .unwrap_or(false);

        let equal_mean =
            corrected.iter().map(|(_, t)| t).sum::<f64>() / corrected.len() as f64;
        let ensemble_f = if covers_all {
            let w = weights.expect("covers_all implies weights");
            let total: f64 = corrected.iter().map(|(name, _)| w[name]).sum();
            corrected.iter().map(|(name, t)| w[name] * t).sum::<f64>() / total
        } else {
            equal_mean
        };

        if covers_all {
            let mut logged = self.weight_delta_logged.lock().expect("weight log lock");
            if logged.get(&city.key) != Some(&snapshot.generation) {
                info!(
                    "{}: weighted ensemble {:+.2}°F vs equal-weight (gen {})",
                    city.key,
                    ensemble_f - equal_mean,
                    snapshot.generation,
                );
                logged.insert(city.key.clone(), snapshot.generation);
            }
        }

        // NWS-boosted variant for the NWS-priority venue.
        let nws_boosted_f = city.nws_priority_venue.and_then(|venue| {
            let boost = self
                .platforms
                .get(&venue)
                .map(|p| p.nws_weight_boost)
                .unwrap_or(1.0);
            let has_nws = corrected.iter().any(|(name, _)| name == "nws");
            if !has_nws || (boost - 1.0).abs() < f64::EPSILON {
                return None;
            }
            let mut boosted: HashMap<&str, f64> = HashMap::new();
            for (name, _) in &corrected {
                let base = if covers_all {
                    weights.expect("covers_all implies weights")[name.as_str()]
                } else {
                    1.0 / corrected.len() as f64
                };
                boosted.insert(name.as_str(), if name == "nws" { base * boost } else { base });
            }
            let total: f64 = boosted.values().sum();
            Some(
                corrected
                    .iter()
                    .map(|(name, t)| boosted[name.as_str()] * t)
                    .sum::<f64>()
                    / total,
            )
        });

        let max_t = corrected.iter().map(|(_, t)| *t).fold(f64::NEG_INFINITY, f64::max);
        let min_t = corrected.iter().map(|(_, t)| *t).fold(f64::INFINITY, f64::min);
        let spread_f = if corrected.len() > 1 { max_t - min_t } else { 0.0 };
        let confidence = Confidence::from_spread_f(spread_f);

        // Base stddev: per-city empirical → pooled per-unit → confidence tier.
        let elig_min = self.config.city_eligibility.min_samples;
        let base_std_c = snapshot
            .city_std_devs
            .get(&city.key)
            .filter(|e| e.n >= elig_min)
            .map(|e| e.std_c)
            .or_else(|| {
                snapshot
                    .pooled_std_devs
                    .get(city.unit.code())
                    .filter(|e| e.n >= POOLED_STD_MIN_N)
                    .map(|e| e.std_c)
            })
            .unwrap_or_else(|| match confidence {
                Confidence::High => self.config.default_std_devs.high,
                Confidence::Medium => self.config.default_std_devs.medium,
                Confidence::Low => self.config.default_std_devs.low,
            });

        let std_dev_c = widen_std(base_std_c, spread_f, city.dual_station(), hours);
        if !std_dev_c.is_finite() || std_dev_c <= 0.0 || !ensemble_f.is_finite() {
            warn!(
                "Refusing forecast for {}/{}: non-finite ensemble or stddev",
                city.key, date
            );
            return Ok(None);
        }

        // Persist per-source snapshots (raw, native unit) so the accuracy
        // ledger self-populates once actuals arrive, plus the spread record.
        {
            let db = self.db.lock().await;
            for st in &source_temps {
                let native = from_fahrenheit(st.temp_f, city.unit);
                if let Err(e) = db.upsert_forecast_accuracy(
                    &city.key,
                    date,
                    &st.source,
                    city.unit.code(),
                    lead.as_str(),
                    native,
                    None,
                ) {
                    warn!("Failed to record forecast snapshot: {}", e);
                    break;
                }
            }
            let recorded_spread = member_spread_f.unwrap_or(spread_f);
            if let Err(e) =
                db.insert_ensemble_spread(&city.key, date, recorded_spread, corrected.len() as u32)
            {
                warn!("Failed to record ensemble spread: {}", e);
            }
        }

        Ok(Some(ForecastResult {
            city: city.key.clone(),
            date: date.to_string(),
            ensemble_temp: from_fahrenheit(ensemble_f, city.unit),
            nws_boosted_temp: nws_boosted_f.map(|t| from_fahrenheit(t, city.unit)),
            std_dev_c,
            confidence,
            source_temps,
            spread_f,
            hours_to_resolution: hours,
            lead_bucket: lead,
        }))
    }

    /// Probability that the realized high lands in [min, max] (either side
    /// optional). Prefers the city's empirical error CDF when active, else
    /// the normal approximation on the °C scale.
    pub fn calculate_probability(
        snapshot: &CalibrationSnapshot,
        forecast_temp: f64,
        std_dev_c: f64,
        range_min: Option<f64>,
        range_max: Option<f64>,
        unit: TempUnit,
        city: Option<&str>,
    ) -> Result<f64> {
        if !forecast_temp.is_finite() || !std_dev_c.is_finite() || std_dev_c <= 0.0 {
            anyhow::bail!("non-finite probability inputs");
        }
        match (range_min, range_max) {
            (None, None) => return Ok(1.0),
            (Some(lo), Some(hi)) if (hi - lo).abs() < f64::EPSILON => return Ok(0.0),
            _ => {}
        }

        let cdf = city.and_then(|c| snapshot.city_empirical_cdf.get(c)).filter(|c| c.is_active);

        let p = if let Some(cdf) = cdf {
            // Error table is in the city's native unit; actual = forecast − e,
            // so P(actual <= x) = 1 − F_e(forecast − x).
            let convert = |v: f64| -> f64 {
                if unit == cdf.unit {
                    v
                } else {
                    match cdf.unit {
                        TempUnit::Fahrenheit => crate::units::celsius_to_fahrenheit(v),
                        TempUnit::Celsius => fahrenheit_to_celsius(v),
                    }
                }
            };
            let mu = convert(forecast_temp);
            let actual_cdf = |x: f64| 1.0 - empirical_error_cdf(cdf, mu - x);
            match (range_min.map(convert), range_max.map(convert)) {
                (Some(lo), Some(hi)) => actual_cdf(hi) - actual_cdf(lo),
                (Some(lo), None) => 1.0 - actual_cdf(lo),
                (None, Some(hi)) => actual_cdf(hi),
                (None, None) => unreachable!(),
            }
        } else {
            let to_c = |v: f64| match unit {
                TempUnit::Celsius => v,
                TempUnit::Fahrenheit => fahrenheit_to_celsius(v),
            };
            let mu = to_c(forecast_temp);
            match (range_min.map(to_c), range_max.map(to_c)) {
                (Some(lo), Some(hi)) => {
                    normal_cdf((hi - mu) / std_dev_c) - normal_cdf((lo - mu) / std_dev_c)
                }
                (Some(lo), None) => 1.0 - normal_cdf((lo - mu) / std_dev_c),
                (None, Some(hi)) => normal_cdf((hi - mu) / std_dev_c),
                (None, None) => unreachable!(),
            }
        };

        if !p.is_finite() {
            anyhow::bail!("probability computation produced non-finite value");
        }
        Ok(p.clamp(0.0, 1.0))
    }

    /// Accuracy gate for a city. Missing history allows everything.
    pub fn city_eligibility(snapshot: &CalibrationSnapshot, city: &City) -> CityEligibility {
        snapshot
            .city_eligibility
            .get(&city.key)
            .cloned()
            .unwrap_or(CityEligibility {
                mae: 0.0,
                n: 0,
                unit: city.unit,
                allow_bounded: true,
                allow_unbounded: true,
            })
    }
}
