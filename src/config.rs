use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::units::TempUnit;
use crate::venue::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            _ => anyhow::bail!("Invalid trading mode: '{}'. Must be 'paper' or 'live'", s),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// Static city descriptor. A city absent from the config is simply never
/// scanned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub key: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// IANA zone name, e.g. "America/New_York".
    pub timezone: String,
    pub unit: TempUnit,
    #[serde(default)]
    pub station_polymarket: Option<String>,
    #[serde(default)]
    pub station_kalshi: Option<String>,
    /// Venue whose resolution source tracks the NWS climate report; the
    /// ensemble exposes an NWS-boosted variant for it.
    #[serde(default)]
    pub nws_priority_venue: Option<Venue>,
    /// Local hour after which the daily high is climatologically locked in.
    #[serde(default = "default_cooling_hour")]
    pub cooling_hour: u32,
    /// US cities additionally query the NWS forecast source.
    #[serde(default)]
    pub us: bool,
    /// Optional per-city shadow source key (e.g. "hrrr").
    #[serde(default)]
    pub conditional_source: Option<String>,
    #[serde(default)]
    pub blocked_venues: Vec<Venue>,
}

fn default_cooling_hour() -> u32 {
    17
}

impl City {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            anyhow::anyhow!("Invalid timezone '{}' for {}: {}", self.timezone, self.key, e)
        })
    }

    pub fn station_for(&self, venue: Venue) -> Option<&str> {
        match venue {
            Venue::Polymarket => self.station_polymarket.as_deref(),
            Venue::Kalshi => self.station_kalshi.as_deref(),
        }
    }

    /// The two venues resolve against different weather stations.
    pub fn dual_station(&self) -> bool {
        match (&self.station_polymarket, &self.station_kalshi) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }

    pub fn venue_blocked(&self, venue: Venue) -> bool {
        self.blocked_venues.contains(&venue)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_true")]
    pub trading_enabled: bool,
    #[serde(default = "default_true")]
    pub guaranteed_win_enabled: bool,
    #[serde(default = "default_one")]
    pub std_dev_multiplier: f64,
    #[serde(default = "default_one")]
    pub nws_weight_boost: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            trading_enabled: true,
            guaranteed_win_enabled: true,
            std_dev_multiplier: 1.0,
            nws_weight_boost: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultStdDevs {
    #[serde(default = "default_std_high")]
    pub high: f64,
    #[serde(default = "default_std_medium")]
    pub medium: f64,
    #[serde(default = "default_std_low")]
    pub low: f64,
}

impl Default for DefaultStdDevs {
    fn default() -> Self {
        DefaultStdDevs {
            high: default_std_high(),
            medium: default_std_medium(),
            low: default_std_low(),
        }
    }
}

fn default_std_high() -> f64 {
    1.2
}
fn default_std_medium() -> f64 {
    1.8
}
fn default_std_low() -> f64 {
    2.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityEligibilityConfig {
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_bounded_mae_c")]
    pub bounded_max_mae_c: f64,
    #[serde(default = "default_bounded_mae_f")]
    pub bounded_max_mae_f: f64,
    #[serde(default = "default_unbounded_mae_c")]
    pub unbounded_max_mae_c: f64,
    #[serde(default = "default_unbounded_mae_f")]
    pub unbounded_max_mae_f: f64,
}

impl Default for CityEligibilityConfig {
    fn default() -> Self {
        CityEligibilityConfig {
            min_samples: default_min_samples(),
            bounded_max_mae_c: default_bounded_mae_c(),
            bounded_max_mae_f: default_bounded_mae_f(),
            unbounded_max_mae_c: default_unbounded_mae_c(),
            unbounded_max_mae_f: default_unbounded_mae_f(),
        }
    }
}

fn default_min_samples() -> u32 {
    10
}
fn default_bounded_mae_c() -> f64 {
    1.0
}
fn default_bounded_mae_f() -> f64 {
    1.8
}
fn default_unbounded_mae_c() -> f64 {
    1.5
}
fn default_unbounded_mae_f() -> f64 {
    2.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceManagementConfig {
    #[serde(default = "default_demotion_mae_c")]
    pub demotion_mae_c: f64,
    #[serde(default = "default_demotion_mae_f")]
    pub demotion_mae_f: f64,
    #[serde(default = "default_cascade_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_min_active_sources")]
    pub min_active_sources: usize,
    #[serde(default = "default_relative_demotion")]
    pub relative_demotion_factor: f64,
    #[serde(default = "default_soft_demotion_weight")]
    pub soft_demotion_max_weight: f64,
    #[serde(default = "default_weight_min_samples")]
    pub weight_min_samples: u32,
}

impl Default for SourceManagementConfig {
    fn default() -> Self {
        SourceManagementConfig {
            demotion_mae_c: default_demotion_mae_c(),
            demotion_mae_f: default_demotion_mae_f(),
            min_samples: default_cascade_min_samples(),
            min_active_sources: default_min_active_sources(),
            relative_demotion_factor: default_relative_demotion(),
            soft_demotion_max_weight: default_soft_demotion_weight(),
            weight_min_samples: default_weight_min_samples(),
        }
    }
}

fn default_demotion_mae_c() -> f64 {
    2.0
}
fn default_demotion_mae_f() -> f64 {
    4.0
}
fn default_cascade_min_samples() -> u32 {
    3
}
fn default_min_active_sources() -> usize {
    2
}
fn default_relative_demotion() -> f64 {
    1.8
}
fn default_soft_demotion_weight() -> f64 {
    0.10
}
fn default_weight_min_samples() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastsConfig {
    #[serde(default = "default_cache_minutes")]
    pub cache_minutes: u64,
    #[serde(default)]
    pub default_std_devs: DefaultStdDevs,
    #[serde(default = "default_calibration_window")]
    pub calibration_window_days: u32,
    /// How many days ahead of today the scanner evaluates.
    #[serde(default = "default_scan_days")]
    pub scan_days: u32,
    #[serde(default)]
    pub city_eligibility: CityEligibilityConfig,
    #[serde(default)]
    pub source_management: SourceManagementConfig,
}

impl Default for ForecastsConfig {
    fn default() -> Self {
        ForecastsConfig {
            cache_minutes: default_cache_minutes(),
            default_std_devs: DefaultStdDevs::default(),
            calibration_window_days: default_calibration_window(),
            scan_days: default_scan_days(),
            city_eligibility: CityEligibilityConfig::default(),
            source_management: SourceManagementConfig::default(),
        }
    }
}

fn default_cache_minutes() -> u64 {
    30
}
fn default_calibration_window() -> u32 {
    45
}
fn default_scan_days() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Minimum edge in percentage points.
    #[serde(default = "default_min_edge_pct")]
    pub min_edge_pct: f64,
    #[serde(default = "default_max_spread")]
    pub max_spread: f64,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_min_ask_price")]
    pub min_ask_price: f64,
    #[serde(default = "default_min_no_ask_price")]
    pub min_no_ask_price: f64,
    #[serde(default = "default_max_no_ask_price")]
    pub max_no_ask_price: f64,
    #[serde(default = "default_min_hours")]
    pub min_hours_to_resolution: f64,
    #[serde(default = "default_model_market_ratio")]
    pub max_model_market_ratio: f64,
    #[serde(default = "default_max_spread_c")]
    pub max_ensemble_spread_c: f64,
    #[serde(default = "default_max_spread_f")]
    pub max_ensemble_spread_f: f64,
    #[serde(default = "default_market_divergence")]
    pub max_market_divergence_c: f64,
    #[serde(default = "default_std_range_ratio")]
    pub max_std_range_ratio: f64,
    #[serde(default = "default_yes_distance")]
    pub yes_max_forecast_distance: f64,
    #[serde(default = "default_yes_candidates")]
    pub yes_candidate_count: usize,
    #[serde(default = "default_observation_buffer_c")]
    pub observation_buffer_c: f64,
    #[serde(default = "default_observation_buffer_f")]
    pub observation_buffer_f: f64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        EntryConfig {
            min_edge_pct: default_min_edge_pct(),
            max_spread: default_max_spread(),
            max_spread_pct: default_max_spread_pct(),
            min_ask_price: default_min_ask_price(),
            min_no_ask_price: default_min_no_ask_price(),
            max_no_ask_price: default_max_no_ask_price(),
            min_hours_to_resolution: default_min_hours(),
            max_model_market_ratio: default_model_market_ratio(),
            max_ensemble_spread_c: default_max_spread_c(),
            max_ensemble_spread_f: default_max_spread_f(),
            max_market_divergence_c: default_market_divergence(),
            max_std_range_ratio: default_std_range_ratio(),
            yes_max_forecast_distance: default_yes_distance(),
            yes_candidate_count: default_yes_candidates(),
            observation_buffer_c: default_observation_buffer_c(),
            observation_buffer_f: default_observation_buffer_f(),
        }
    }
}

fn default_min_edge_pct() -> f64 {
    5.0
}
fn default_max_spread() -> f64 {
    0.10
}
fn default_max_spread_pct() -> f64 {
    0.35
}
fn default_min_ask_price() -> f64 {
    0.05
}
fn default_min_no_ask_price() -> f64 {
    0.20
}
fn default_max_no_ask_price() -> f64 {
    0.92
}
fn default_min_hours() -> f64 {
    2.0
}
fn default_model_market_ratio() -> f64 {
    3.0
}
fn default_max_spread_c() -> f64 {
    4.0
}
fn default_max_spread_f() -> f64 {
    7.0
}
fn default_market_divergence() -> f64 {
    2.0
}
fn default_std_range_ratio() -> f64 {
    2.0
}
fn default_yes_distance() -> f64 {
    3.0
}
fn default_yes_candidates() -> usize {
    5
}
fn default_observation_buffer_c() -> f64 {
    0.5
}
fn default_observation_buffer_f() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_bankroll")]
    pub yes_bankroll: f64,
    #[serde(default = "default_bankroll")]
    pub no_bankroll: f64,
    #[serde(default = "default_min_bet")]
    pub min_bet: f64,
    #[serde(default = "default_max_bankroll_pct")]
    pub max_bankroll_pct: f64,
    #[serde(default = "default_no_max_per_date")]
    pub no_max_per_date: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_hard_reject_volume_pct")]
    pub hard_reject_volume_pct: f64,
    /// Optional soft cap on volume participation (fraction of visible
    /// volume). None disables the clamp.
    #[serde(default)]
    pub max_volume_pct: Option<f64>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig {
            yes_bankroll: default_bankroll(),
            no_bankroll: default_bankroll(),
            min_bet: default_min_bet(),
            max_bankroll_pct: default_max_bankroll_pct(),
            no_max_per_date: default_no_max_per_date(),
            kelly_fraction: default_kelly_fraction(),
            hard_reject_volume_pct: default_hard_reject_volume_pct(),
            max_volume_pct: None,
        }
    }
}

fn default_bankroll() -> f64 {
    1000.0
}
fn default_min_bet() -> f64 {
    25.0
}
fn default_max_bankroll_pct() -> f64 {
    0.05
}
fn default_no_max_per_date() -> f64 {
    200.0
}
fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_hard_reject_volume_pct() -> f64 {
    25.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuaranteedEntryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gw_min_ask")]
    pub min_ask: f64,
    #[serde(default = "default_gw_max_ask")]
    pub max_ask: f64,
    #[serde(default = "default_gw_min_ask")]
    pub min_ask_dual_confirmed: f64,
    /// Minimum net margin in cents (1 − ask − fee, × 100).
    #[serde(default = "default_min_margin_cents")]
    pub min_margin_cents: f64,
    #[serde(default = "default_gw_bankroll_pct")]
    pub max_bankroll_pct: f64,
    #[serde(default)]
    pub require_dual_confirmation: bool,
    #[serde(default = "default_metar_gap_c")]
    pub metar_only_min_gap_c: f64,
    #[serde(default = "default_metar_gap_f")]
    pub metar_only_min_gap_f: f64,
    /// Wider gap for dual-station cities on the NWS-priority venue.
    #[serde(default = "default_dual_station_gap_c")]
    pub dual_station_min_gap_c: f64,
    #[serde(default = "default_dual_station_gap_f")]
    pub dual_station_min_gap_f: f64,
    #[serde(default = "default_gw_min_bid")]
    pub gw_min_bid: f64,
}

impl Default for GuaranteedEntryConfig {
    fn default() -> Self {
        GuaranteedEntryConfig {
            enabled: true,
            min_ask: default_gw_min_ask(),
            max_ask: default_gw_max_ask(),
            min_ask_dual_confirmed: default_gw_min_ask(),
            min_margin_cents: default_min_margin_cents(),
            max_bankroll_pct: default_gw_bankroll_pct(),
            require_dual_confirmation: false,
            metar_only_min_gap_c: default_metar_gap_c(),
            metar_only_min_gap_f: default_metar_gap_f(),
            dual_station_min_gap_c: default_dual_station_gap_c(),
            dual_station_min_gap_f: default_dual_station_gap_f(),
            gw_min_bid: default_gw_min_bid(),
        }
    }
}

fn default_gw_min_ask() -> f64 {
    0.30
}
fn default_gw_max_ask() -> f64 {
    0.95
}
fn default_min_margin_cents() -> f64 {
    5.0
}
fn default_gw_bankroll_pct() -> f64 {
    0.10
}
fn default_metar_gap_c() -> f64 {
    0.5
}
fn default_metar_gap_f() -> f64 {
    1.0
}
fn default_dual_station_gap_c() -> f64 {
    0.8
}
fn default_dual_station_gap_f() -> f64 {
    1.5
}
fn default_gw_min_bid() -> f64 {
    0.20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Minimum empirical edge (win rate − ask) for the confirmation bypass.
    #[serde(default = "default_cal_min_trade_edge")]
    pub cal_min_trade_edge: f64,
    #[serde(default = "default_cal_confirms_min_n")]
    pub cal_confirms_min_n: u32,
    #[serde(default = "default_cal_blocks_min_n")]
    pub cal_blocks_min_n: u32,
    #[serde(default = "default_refresh_hours")]
    pub refresh_hours: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            cal_min_trade_edge: default_cal_min_trade_edge(),
            cal_confirms_min_n: default_cal_confirms_min_n(),
            cal_blocks_min_n: default_cal_blocks_min_n(),
            refresh_hours: default_refresh_hours(),
        }
    }
}

fn default_cal_min_trade_edge() -> f64 {
    0.03
}
fn default_cal_confirms_min_n() -> u32 {
    20
}
fn default_cal_blocks_min_n() -> u32 {
    15
}
fn default_refresh_hours() -> u64 {
    6
}

fn default_true() -> bool {
    true
}
fn default_one() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_trading_mode")]
    pub trading_mode: TradingMode,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_polymarket_url")]
    pub polymarket_api_url: String,
    #[serde(default = "default_kalshi_url")]
    pub kalshi_api_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_fast_poll_interval")]
    pub fast_poll_interval_secs: u64,
    #[serde(default)]
    pub cities: Vec<City>,
    #[serde(default)]
    pub platforms: HashMap<Venue, PlatformConfig>,
    #[serde(default)]
    pub forecasts: ForecastsConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub guaranteed_entry: GuaranteedEntryConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

fn default_trading_mode() -> TradingMode {
    TradingMode::Paper
}
fn default_database_path() -> String {
    "data/weather-trader.db".to_string()
}
fn default_polymarket_url() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_kalshi_url() -> String {
    "https://api.elections.kalshi.com/trade-api/v2".to_string()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_scan_interval() -> u64 {
    300
}
fn default_snapshot_interval() -> u64 {
    900
}
fn default_fast_poll_interval() -> u64 {
    20
}

impl Config {
    /// Load the config document. `CONFIG_PATH` overrides the default
    /// `config.toml`; `DATABASE_PATH` overrides the document's value.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let mut config =
            Self::from_toml(&text).with_context(|| format!("Failed to parse config file {}", path))?;
        if let Ok(db_path) = std::env::var("DATABASE_PATH") {
            config.database_path = db_path;
        }
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Invalid config document")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for city in &self.cities {
            city.tz()?;
        }
        if self.sizing.kelly_fraction <= 0.0 || self.sizing.kelly_fraction > 1.0 {
            anyhow::bail!(
                "sizing.kelly_fraction must be in (0, 1], got {}",
                self.sizing.kelly_fraction
            );
        }
        Ok(())
    }

    pub fn city(&self, key: &str) -> Option<&City> {
        self.cities.iter().find(|c| c.key == key)
    }

    pub fn platform(&self, venue: Venue) -> PlatformConfig {
        self.platforms.get(&venue).cloned().unwrap_or_default()
    }
}
