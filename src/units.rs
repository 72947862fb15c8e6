use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Temperature unit a market settles in. Ensemble arithmetic happens in °F;
/// standard deviations are kept in °C because probabilities are evaluated on
/// the °C scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TempUnit {
    #[serde(rename = "F", alias = "f", alias = "fahrenheit")]
    Fahrenheit,
    #[serde(rename = "C", alias = "c", alias = "celsius")]
    Celsius,
}

impl TempUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            TempUnit::Fahrenheit => "°F",
            TempUnit::Celsius => "°C",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TempUnit::Fahrenheit => "F",
            TempUnit::Celsius => "C",
        }
    }
}

impl FromStr for TempUnit {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "F" | "FAHRENHEIT" => Ok(TempUnit::Fahrenheit),
            "C" | "CELSIUS" => Ok(TempUnit::Celsius),
            _ => anyhow::bail!("Invalid temperature unit: '{}'. Must be 'F' or 'C'", s),
        }
    }
}

impl std::fmt::Display for TempUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Absolute conversion: full affine transform.
pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Absolute conversion: full affine transform.
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Delta conversion: scale only, no offset. Used for biases, spreads and
/// standard deviations.
pub fn delta_c_to_f(dc: f64) -> f64 {
    dc * 9.0 / 5.0
}

/// Delta conversion: scale only, no offset.
pub fn delta_f_to_c(df: f64) -> f64 {
    df * 5.0 / 9.0
}

/// Convert an absolute temperature into °F from the given unit.
pub fn to_fahrenheit(value: f64, unit: TempUnit) -> f64 {
    match unit {
        TempUnit::Fahrenheit => value,
        TempUnit::Celsius => celsius_to_fahrenheit(value),
    }
}

/// Convert an absolute °F temperature into the given unit.
pub fn from_fahrenheit(value_f: f64, unit: TempUnit) -> f64 {
    match unit {
        TempUnit::Fahrenheit => value_f,
        TempUnit::Celsius => fahrenheit_to_celsius(value_f),
    }
}

/// Hours-to-resolution bucket used by the bias cascade and the market
/// calibration tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadBucket {
    Near,
    SameDay,
    NextDay,
    MultiDay,
}

impl LeadBucket {
    pub fn from_hours(hours: f64) -> Self {
        if hours <= 6.0 {
            LeadBucket::Near
        } else if hours <= 24.0 {
            LeadBucket::SameDay
        } else if hours <= 48.0 {
            LeadBucket::NextDay
        } else {
            LeadBucket::MultiDay
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadBucket::Near => "near",
            LeadBucket::SameDay => "same-day",
            LeadBucket::NextDay => "next-day",
            LeadBucket::MultiDay => "multi-day",
        }
    }
}

impl FromStr for LeadBucket {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "near" => Ok(LeadBucket::Near),
            "same-day" => Ok(LeadBucket::SameDay),
            "next-day" => Ok(LeadBucket::NextDay),
            "multi-day" => Ok(LeadBucket::MultiDay),
            _ => anyhow::bail!("Invalid lead bucket: '{}'", s),
        }
    }
}

impl std::fmt::Display for LeadBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Confidence label derived from the disagreement (max − min) of the
/// surviving ensemble sources, in °F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_spread_f(spread_f: f64) -> Self {
        if spread_f <= 2.0 {
            Confidence::High
        } else if spread_f <= 5.0 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
