use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::config::City;

/// Forecast sources. The first four feed the live ensemble; shadows are
/// recorded for future calibration only; `GefsSpread` contributes variance,
/// never a temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    Gfs,
    Ecmwf,
    Tomorrow,
    Nws,
    Icon,
    Gem,
    Hrrr,
    GefsSpread,
}

pub const ALL_SOURCES: &[SourceId] = &[
    SourceId::Gfs,
    SourceId::Ecmwf,
    SourceId::Tomorrow,
    SourceId::Nws,
    SourceId::Icon,
    SourceId::Gem,
    SourceId::Hrrr,
    SourceId::GefsSpread,
];

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Gfs => "gfs",
            SourceId::Ecmwf => "ecmwf",
            SourceId::Tomorrow => "tomorrow",
            SourceId::Nws => "nws",
            SourceId::Icon => "icon",
            SourceId::Gem => "gem",
            SourceId::Hrrr => "hrrr",
            SourceId::GefsSpread => "gefs-spread",
        }
    }

    /// Shadow sources are persisted but never enter the ensemble average.
    pub fn is_shadow(&self) -> bool {
        matches!(self, SourceId::Icon | SourceId::Gem | SourceId::Hrrr)
    }

    pub fn is_variance_only(&self) -> bool {
        matches!(self, SourceId::GefsSpread)
    }

    /// Whether this source is queried at all for the given city.
    pub fn applies_to(&self, city: &City) -> bool {
        match self {
            SourceId::Nws => city.us,
            SourceId::Hrrr => city.conditional_source.as_deref() == Some("hrrr"),
            _ => true,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One forecast day. `high_f` is the high-of-day in °F, except for the
/// spread source, where it carries the ensemble-member standard deviation
/// in °F for that date.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyHigh {
    pub date: String,
    pub high_f: f64,
}

pub type MultiDay = Arc<Vec<DailyHigh>>;

#[derive(Clone)]
enum FetchState {
    InFlight,
    Done(MultiDay),
    Failed(String),
}

enum Slot {
    Ready { fetched_at: Instant, value: MultiDay },
    Pending(watch::Receiver<FetchState>),
}

/// HTTP fetchers for all sources behind a per-`source:city` single-flight
/// cache. The first caller for a key fetches; concurrent callers await the
/// same result; entries hold the full multi-day set so other dates of the
/// same city never refetch.
pub struct SourceClient {
    client: Client,
    open_meteo_url: String,
    ensemble_url: String,
    nws_url: String,
    tomorrow_url: String,
    tomorrow_api_key: Option<String>,
    ttl: Duration,
    cache: Mutex<HashMap<(SourceId, String), Slot>>,
}

/// Source endpoint configuration. Defaults to the live services; tests and
/// staging point everything at one base.
#[derive(Debug, Clone)]
pub struct SourceEndpoints {
    pub open_meteo: String,
    pub ensemble: String,
    pub nws: String,
    pub tomorrow: String,
    pub tomorrow_api_key: Option<String>,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        SourceEndpoints {
            open_meteo: "https://api.open-meteo.com".to_string(),
            ensemble: "https://ensemble-api.open-meteo.com".to_string(),
            nws: "https://api.weather.gov".to_string(),
            tomorrow: "https://api.tomorrow.io".to_string(),
            tomorrow_api_key: std::env::var("TOMORROW_API_KEY").ok().filter(|s| !s.is_empty()),
        }
    }
}

impl SourceEndpoints {
    /// Every service behind one base URL (mock servers).
    pub fn single_base(base: &str) -> Self {
        SourceEndpoints {
            open_meteo: base.to_string(),
            ensemble: base.to_string(),
            nws: base.to_string(),
            tomorrow: base.to_string(),
            tomorrow_api_key: Some("test-key".to_string()),
        }
    }
}

impl SourceClient {
    pub fn new(cache_minutes: u64, timeout_secs: u64) -> Result<Self> {
        Self::with_endpoints(SourceEndpoints::default(), cache_minutes, timeout_secs)
    }

    pub fn with_endpoints(
        endpoints: SourceEndpoints,
        cache_minutes: u64,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent("weather-trader/0.1 (ops@weather-trader.local)")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build SourceClient HTTP client")?;

        Ok(SourceClient {
            client,
            open_meteo_url: endpoints.open_meteo,
            ensemble_url: endpoints.ensemble,
            nws_url: endpoints.nws,
            tomorrow_url: endpoints.tomorrow,
            tomorrow_api_key: endpoints.tomorrow_api_key,
            ttl: Duration::from_secs(cache_minutes * 60),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Cached multi-day fetch. Returns the whole forecast set; callers pick
    /// their date out of it.
    pub async fn fetch_multi_day(&self, source: SourceId, city: &City, days: u32) -> Result<MultiDay> {
        let key = (source, city.key.clone());

        // First caller for the key installs a pending slot and keeps the
        // sender; everyone else waits on the receiver.
        let owned_tx: watch::Sender<FetchState>;
        {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(Slot::Ready { fetched_at, value }) if fetched_at.elapsed() < self.ttl => {
                    return Ok(value.clone());
                }
                Some(Slot::Pending(rx)) => {
                    let mut rx = rx.clone();
                    drop(cache);
                    loop {
                        let state = rx.borrow().clone();
                        match state {
                            FetchState::Done(value) => return Ok(value),
                            FetchState::Failed(e) => anyhow::bail!("{} fetch failed: {}", source, e),
                            FetchState::InFlight => {
                                if rx.changed().await.is_err() {
                                    anyhow::bail!("{} fetch abandoned", source);
                                }
                            }
                        }
                    }
                }
                _ => {
                    let (tx, rx) = watch::channel(FetchState::InFlight);
                    cache.insert(key.clone(), Slot::Pending(rx));
                    owned_tx = tx;
                }
            }
        }

        // This caller owns the fetch.
        let result = self.fetch_uncached(source, city, days).await;
        let mut cache = self.cache.lock().await;
        match result {
            Ok(value) => {
                let value: MultiDay = Arc::new(value);
                cache.insert(
                    key,
                    Slot::Ready {
                        fetched_at: Instant::now(),
                        value: value.clone(),
                    },
                );
                let _ = owned_tx.send(FetchState::Done(value.clone()));
                Ok(value)
            }
            Err(e) => {
                cache.remove(&key);
                let _ = owned_tx.send(FetchState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn fetch_uncached(&self, source: SourceId, city: &City, days: u32) -> Result<Vec<DailyHigh>> {
        debug!("Fetching {} for {} ({}d)", source, city.key, days);
        match source {
            SourceId::Gfs => self.fetch_open_meteo(city, days, "gfs_seamless").await,
            SourceId::Ecmwf => self.fetch_open_meteo(city, days, "ecmwf_ifs025").await,
            SourceId::Icon => self.fetch_open_meteo(city, days, "icon_seamless").await,
            SourceId::Gem => self.fetch_open_meteo(city, days, "gem_seamless").await,
            SourceId::Hrrr => self.fetch_open_meteo(city, days, "hrrr").await,
            SourceId::Nws => self.fetch_nws(city).await,
            SourceId::Tomorrow => self.fetch_tomorrow(city, days).await,
            SourceId::GefsSpread => self.fetch_ensemble_spread(city, days).await,
        }
    }

    async fn fetch_open_meteo(&self, city: &City, days: u32, model: &str) -> Result<Vec<DailyHigh>> {
        #[derive(serde::Deserialize)]
        struct Daily {
            time: Vec<String>,
            temperature_2m_max: Vec<Option<f64>>,
        }
        #[derive(serde::Deserialize)]
        struct Response {
            daily: Daily,
        }

        let url = format!(
            "{}/v1/forecast?latitude={:.4}&longitude={:.4}&daily=temperature_2m_max&temperature_unit=fahrenheit&timezone={}&forecast_days={}&models={}",
            self.open_meteo_url, city.lat, city.lon, city.timezone, days, model
        );

        let resp: Response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Open-Meteo {} request failed", model))?
            .error_for_status()
            .with_context(|| format!("Open-Meteo {} returned error status", model))?
            .json()
            .await
            .with_context(|| format!("Failed to parse Open-Meteo {} response", model))?;

        let mut out = Vec::new();
        for (date, temp) in resp.daily.time.iter().zip(resp.daily.temperature_2m_max.iter()) {
            if let Some(t) = temp {
                out.push(DailyHigh {
                    date: date.clone(),
                    high_f: *t,
                });
            }
        }
        if out.is_empty() {
            anyhow::bail!("Open-Meteo {} returned no daily highs for {}", model, city.key);
        }
        Ok(out)
    }

    /// NWS two-step: points lookup, then the daytime periods of the gridpoint
    /// forecast. No API key, just a User-Agent.
    async fn fetch_nws(&self, city: &City) -> Result<Vec<DailyHigh>> {
        #[derive(serde::Deserialize)]
        struct Points {
            properties: PointsProps,
        }
        #[derive(serde::Deserialize)]
        struct PointsProps {
            forecast: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct Forecast {
            properties: ForecastProps,
        }
        #[derive(serde::Deserialize)]
        struct ForecastProps {
            periods: Vec<Period>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Period {
            temperature: f64,
            temperature_unit: String,
            is_daytime: bool,
            start_time: String,
        }

        let points_url = format!("{}/points/{:.4},{:.4}", self.nws_url, city.lat, city.lon);
        let points: Points = self
            .client
            .get(&points_url)
            .send()
            .await
            .context("NWS points request failed")?
            .error_for_status()
            .context("NWS points returned error status")?
            .json()
            .await
            .context("Failed to parse NWS points response")?;

        let forecast_url = points
            .properties
            .forecast
            .context("No forecast URL in NWS points response")?;
        // Relative forecast paths only occur in tests against a mock server
        let forecast_url = if forecast_url.starts_with('/') {
            format!("{}{}", self.nws_url, forecast_url)
        } else {
            forecast_url
        };

        let forecast: Forecast = self
            .client
            .get(&forecast_url)
            .send()
            .await
            .context("NWS forecast request failed")?
            .error_for_status()
            .context("NWS forecast returned error status")?
            .json()
            .await
            .context("Failed to parse NWS forecast response")?;

        let mut out = Vec::new();
        for period in forecast.properties.periods.iter().filter(|p| p.is_daytime) {
            let high_f = if period.temperature_unit == "C" {
                crate::units::celsius_to_fahrenheit(period.temperature)
            } else {
                period.temperature
            };
            let date = period.start_time.split('T').next().unwrap_or("").to_string();
            if date.is_empty() {
                continue;
            }
            out.push(DailyHigh { date, high_f });
        }
        if out.is_empty() {
            anyhow::bail!("NWS returned no daytime periods for {}", city.key);
        }
        Ok(out)
    }

    async fn fetch_tomorrow(&self, city: &City, days: u32) -> Result<Vec<DailyHigh>> {
        let Some(api_key) = &self.tomorrow_api_key else {
            anyhow::bail!("TOMORROW_API_KEY not configured");
        };

        #[derive(serde::Deserialize)]
        struct Response {
            timelines: Timelines,
        }
        #[derive(serde::Deserialize)]
        struct Timelines {
            daily: Vec<DailyEntry>,
        }
        #[derive(serde::Deserialize)]
        struct DailyEntry {
            time: String,
            values: Values,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Values {
            temperature_max: Option<f64>,
        }

        let url = format!(
            "{}/v4/weather/forecast?location={:.4},{:.4}&timesteps=1d&units=imperial&apikey={}",
            self.tomorrow_url, city.lat, city.lon, api_key
        );

        let resp: Response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Tomorrow.io request failed")?
            .error_for_status()
            .context("Tomorrow.io returned error status")?
            .json()
            .await
            .context("Failed to parse Tomorrow.io response")?;

        let mut out = Vec::new();
        for entry in resp.timelines.daily.iter().take(days as usize) {
            let Some(high_f) = entry.values.temperature_max else {
                continue;
            };
            let date = entry.time.split('T').next().unwrap_or("").to_string();
            if date.is_empty() {
                continue;
            }
            out.push(DailyHigh { date, high_f });
        }
        if out.is_empty() {
            anyhow::bail!("Tomorrow.io returned no daily highs for {}", city.key);
        }
        Ok(out)
    }

    /// GEFS ensemble members; returns the per-date member standard deviation
    /// (°F) in `high_f`.
    async fn fetch_ensemble_spread(&self, city: &City, days: u32) -> Result<Vec<DailyHigh>> {
        #[derive(serde::Deserialize)]
        struct Response {
            daily: serde_json::Value,
        }

        let url = format!(
            "{}/v1/ensemble?latitude={:.4}&longitude={:.4}&daily=temperature_2m_max&temperature_unit=fahrenheit&timezone={}&forecast_days={}&models=gfs_ensemble_seamless",
            self.ensemble_url, city.lat, city.lon, city.timezone, days
        );

        let resp: Response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Ensemble request failed")?
            .error_for_status()
            .context("Ensemble returned error status")?
            .json()
            .await
            .context("Failed to parse ensemble response")?;

        let times: Vec<String> = resp
            .daily
            .get("time")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if times.is_empty() {
            anyhow::bail!("Ensemble returned no dates for {}", city.key);
        }

        // Member arrays arrive as temperature_2m_max, temperature_2m_max_member01, ...
        let member_arrays: Vec<&Vec<serde_json::Value>> = resp
            .daily
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(k, _)| k.starts_with("temperature_2m_max"))
                    .filter_map(|(_, v)| v.as_array())
                    .collect()
            })
            .unwrap_or_default();
        if member_arrays.len() < 2 {
            anyhow::bail!("Ensemble returned {} member arrays for {}", member_arrays.len(), city.key);
        }

        let mut out = Vec::new();
        for (i, date) in times.iter().enumerate() {
            let members: Vec<f64> = member_arrays
                .iter()
                .filter_map(|arr| arr.get(i).and_then(|v| v.as_f64()))
                .filter(|v| v.is_finite())
                .collect();
            if members.len() < 2 {
                continue;
            }
            let mean = members.iter().sum::<f64>() / members.len() as f64;
            let var = members.iter().map(|m| (m - mean).powi(2)).sum::<f64>()
                / (members.len() - 1) as f64;
            out.push(DailyHigh {
                date: date.clone(),
                high_f: var.sqrt(),
            });
        }
        if out.is_empty() {
            warn!("Ensemble spread empty for {}", city.key);
            anyhow::bail!("Ensemble spread empty for {}", city.key);
        }
        Ok(out)
    }
}
