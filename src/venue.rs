use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{City, TradingMode};
use crate::units::TempUnit;

/// The two venues we trade daily-high temperature contracts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Polymarket,
    Kalshi,
}

pub const VENUES: &[Venue] = &[Venue::Polymarket, Venue::Kalshi];

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Polymarket => "polymarket",
            Venue::Kalshi => "kalshi",
        }
    }
}

impl FromStr for Venue {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "polymarket" => Ok(Venue::Polymarket),
            "kalshi" => Ok(Venue::Kalshi),
            _ => anyhow::bail!("Invalid venue: '{}'", s),
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry fee per contract. Kalshi charges `0.07 * p * (1 - p)` at entry and
/// nothing at settlement; Polymarket charges nothing on weather markets.
pub fn entry_fee(venue: Venue, ask: f64) -> f64 {
    match venue {
        Venue::Kalshi => 0.07 * ask * (1.0 - ask),
        Venue::Polymarket => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeKind {
    Bounded,
    UnboundedUpper,
    UnboundedLower,
}

impl RangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeKind::Bounded => "bounded",
            RangeKind::UnboundedUpper => "unbounded-upper",
            RangeKind::UnboundedLower => "unbounded-lower",
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, RangeKind::Bounded)
    }
}

impl FromStr for RangeKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bounded" => Ok(RangeKind::Bounded),
            "unbounded-upper" => Ok(RangeKind::UnboundedUpper),
            "unbounded-lower" => Ok(RangeKind::UnboundedLower),
            _ => anyhow::bail!("Invalid range kind: '{}'", s),
        }
    }
}

impl std::fmt::Display for RangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One price level of a depth ladder: (price, size).
pub type DepthLevel = (f64, f64);

/// A single outcome contract in a categorical daily-high market, with its
/// live YES book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Range {
    pub venue: Venue,
    pub market_id: String,
    pub token_id: String,
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub kind: RangeKind,
    pub unit: TempUnit,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    #[serde(default)]
    pub bid_depth: Option<Vec<DepthLevel>>,
    #[serde(default)]
    pub ask_depth: Option<Vec<DepthLevel>>,
}

impl Range {
    /// At least one bound must be present; when both are, min <= max.
    pub fn validate(&self) -> Result<()> {
        match (self.min, self.max) {
            (None, None) => anyhow::bail!("range '{}' has no bounds", self.name),
            (Some(lo), Some(hi)) if lo > hi => {
                anyhow::bail!("range '{}' has min {} > max {}", self.name, lo, hi)
            }
            _ => Ok(()),
        }
    }

    /// Reference point used for the YES candidate window: midpoint of a
    /// bounded range, threshold of an unbounded one.
    pub fn reference_point(&self) -> f64 {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => (lo + hi) / 2.0,
            (Some(lo), None) => lo,
            (None, Some(hi)) => hi,
            (None, None) => f64::NAN,
        }
    }

    /// Width of a bounded range in its own unit.
    pub fn width(&self) -> Option<f64> {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => Some(hi - lo),
            _ => None,
        }
    }

    /// NO book derived from the YES book.
    pub fn no_ask(&self) -> f64 {
        1.0 - self.bid
    }

    pub fn no_bid(&self) -> f64 {
        1.0 - self.ask
    }

    /// Stable identity of this contract within a (city, date).
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.venue, self.market_id, self.token_id)
    }
}

/// Parse a contract name like "72-74°F", "85°F or higher", "20°C or below"
/// into bounds and a kind. Bounds come back in the unit embedded in the name.
pub fn parse_range_name(name: &str) -> Option<(Option<f64>, Option<f64>, RangeKind, TempUnit)> {
    let unit = if name.contains("°C") || name.ends_with('C') {
        TempUnit::Celsius
    } else {
        TempUnit::Fahrenheit
    };

    // "X-Y°F" / "X to Y°F"
    let range_re = Regex::new(r"(-?\d+)\s*(?:[-\u{2013}]|to)\s*(-?\d+)\s*°?[FC]").ok()?;
    if let Some(caps) = range_re.captures(name) {
        let lo: f64 = caps[1].parse().ok()?;
        let hi: f64 = caps[2].parse().ok()?;
        return Some((Some(lo), Some(hi), RangeKind::Bounded, unit));
    }

    // "X°F or higher/above"
    let above_re = Regex::new(r"(-?\d+)\s*°?[FC]\s+or\s+(?:above|higher|more)").ok()?;
    if let Some(caps) = above_re.captures(name) {
        let lo: f64 = caps[1].parse().ok()?;
        return Some((Some(lo), None, RangeKind::UnboundedUpper, unit));
    }

    // "X°F or lower/below"
    let below_re = Regex::new(r"(-?\d+)\s*°?[FC]\s+or\s+(?:below|lower|less)").ok()?;
    if let Some(caps) = below_re.captures(name) {
        let hi: f64 = caps[1].parse().ok()?;
        return Some((None, Some(hi), RangeKind::UnboundedLower, unit));
    }

    None
}

// ─── Wire types ───

#[derive(Debug, Deserialize)]
struct WireMarket {
    market_id: String,
    contracts: Vec<WireContract>,
}

#[derive(Debug, Deserialize)]
struct WireContract {
    token_id: String,
    name: String,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    volume: Option<f64>,
    #[serde(default)]
    bid_depth: Option<Vec<DepthLevel>>,
    #[serde(default)]
    ask_depth: Option<Vec<DepthLevel>>,
}

#[derive(Debug, Deserialize)]
pub struct PriceQuote {
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
}

#[derive(Debug, Serialize)]
struct WireOrderRequest {
    token_id: String,
    price: f64,
    size: f64,
    side: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderResponse {
    order_id: String,
    status: String,
}

/// Record returned by `execute_buy`.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub status: String,
    pub price: f64,
    pub shares: f64,
    pub paper: bool,
}

/// REST adapter over both venues' market endpoints. In paper mode
/// `execute_buy` fills locally without touching the wire.
pub struct VenueClient {
    client: Client,
    polymarket_url: String,
    kalshi_url: String,
    mode: TradingMode,
}

impl VenueClient {
    pub fn new(
        polymarket_url: &str,
        kalshi_url: &str,
        mode: TradingMode,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build VenueClient HTTP client")?;

        Ok(VenueClient {
            client,
            polymarket_url: polymarket_url.trim_end_matches('/').to_string(),
            kalshi_url: kalshi_url.trim_end_matches('/').to_string(),
            mode,
        })
    }

    #[cfg(test)]
    pub fn with_client(client: Client, base_url: String, mode: TradingMode) -> Self {
        VenueClient {
            client,
            polymarket_url: base_url.clone(),
            kalshi_url: base_url,
            mode,
        }
    }

    fn base_url(&self, venue: Venue) -> &str {
        match venue {
            Venue::Polymarket => &self.polymarket_url,
            Venue::Kalshi => &self.kalshi_url,
        }
    }

    /// All active contracts for (city, date) on a venue. An empty vec is a
    /// valid "no markets" response; ranges that fail the bound invariant or
    /// whose names do not parse are dropped with a warning.
    pub async fn get_markets(&self, city: &City, date: &str, venue: Venue) -> Result<Vec<Range>> {
        let url = format!(
            "{}/markets/daily-high?city={}&date={}",
            self.base_url(venue),
            city.key,
            date
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("{} market request failed", venue))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} markets returned {}: {}", venue, status.as_u16(), body);
        }

        let wire: Vec<WireMarket> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} markets response", venue))?;

        let mut ranges = Vec::new();
        for market in wire {
            for contract in market.contracts {
                let Some((min, max, kind, unit)) = parse_range_name(&contract.name) else {
                    warn!(
                        "Unparseable contract name '{}' on {} {}",
                        contract.name, venue, market.market_id
                    );
                    continue;
                };
                let bid = contract.best_bid.unwrap_or(0.0);
                let ask = contract.best_ask.unwrap_or(0.0);
                let range = Range {
                    venue,
                    market_id: market.market_id.clone(),
                    token_id: contract.token_id,
                    name: contract.name,
                    min,
                    max,
                    kind,
                    unit,
                    bid,
                    ask,
                    spread: (ask - bid).max(0.0),
                    volume: contract.volume.unwrap_or(0.0),
                    bid_depth: contract.bid_depth,
                    ask_depth: contract.ask_depth,
                };
                if let Err(e) = range.validate() {
                    warn!("Dropping invalid range on {}: {}", venue, e);
                    continue;
                }
                ranges.push(range);
            }
        }
        Ok(ranges)
    }

    /// Fresh top-of-book for a single token. None when the venue has no quote.
    pub async fn get_price(&self, venue: Venue, token_id: &str) -> Result<Option<PriceQuote>> {
        let url = format!("{}/price?token_id={}", self.base_url(venue), token_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("{} price request failed", venue))?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} price returned {}: {}", venue, status.as_u16(), body);
        }

        let quote: PriceQuote = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} price response", venue))?;
        Ok(Some(quote))
    }

    /// Place a buy order for `shares` at `price`. Paper mode fills
    /// immediately with a synthetic order id.
    pub async fn execute_buy(
        &self,
        venue: Venue,
        token_id: &str,
        side: &str,
        price: f64,
        shares: f64,
    ) -> Result<ExecutionRecord> {
        if self.mode == TradingMode::Paper {
            let order_id = format!("paper-{}", uuid::Uuid::new_v4());
            info!(
                "PAPER FILL: {} {} {:.0} shares @ {:.2} on {}",
                side, token_id, shares, price, venue
            );
            return Ok(ExecutionRecord {
                order_id,
                status: "filled".to_string(),
                price,
                shares,
                paper: true,
            });
        }

        let request = WireOrderRequest {
            token_id: token_id.to_string(),
            price,
            size: shares,
            side: side.to_string(),
        };

        let resp = self
            .client
            .post(format!("{}/order", self.base_url(venue)))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{} order request failed", venue))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} order returned {}: {}", venue, status.as_u16(), body);
        }

        let order: WireOrderResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} order response", venue))?;

        info!(
            "LIVE FILL: {} {} {:.0} shares @ {:.2} on {} order_id={}",
            side, token_id, shares, price, venue, order.order_id
        );

        Ok(ExecutionRecord {
            order_id: order.order_id,
            status: order.status,
            price,
            shares,
            paper: false,
        })
    }
}
