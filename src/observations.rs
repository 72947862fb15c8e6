use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::City;
use crate::db::{Database, ObservationRow};
use crate::units::TempUnit;
use crate::venue::Venue;

/// A live station reading for (city, date): the running high so far from the
/// primary METAR feed plus the secondary weather-service high.
#[derive(Debug, Clone)]
pub struct Observation {
    pub station_id: String,
    pub running_high_c: Option<f64>,
    pub running_high_f: Option<f64>,
    pub wu_high_c: Option<f64>,
    pub wu_high_f: Option<f64>,
    pub observed_at: String,
    pub observation_count: i64,
}

impl Observation {
    fn from_row(row: ObservationRow) -> Self {
        Observation {
            station_id: row.station_id,
            running_high_c: row.running_high_c,
            running_high_f: row.running_high_f,
            wu_high_c: row.wu_high_c,
            wu_high_f: row.wu_high_f,
            observed_at: row.observed_at,
            observation_count: row.observation_count,
        }
    }

    /// Primary running high in the given unit.
    pub fn running_high(&self, unit: TempUnit) -> Option<f64> {
        match unit {
            TempUnit::Fahrenheit => self.running_high_f,
            TempUnit::Celsius => self.running_high_c,
        }
    }

    /// Secondary-service high in the given unit.
    pub fn secondary_high(&self, unit: TempUnit) -> Option<f64> {
        match unit {
            TempUnit::Fahrenheit => self.wu_high_f,
            TempUnit::Celsius => self.wu_high_c,
        }
    }
}

/// Read side of the observation store. Ingestion is an external collaborator
/// writing `metar_observations`; this only ever queries.
pub struct ObservationFeed {
    db: Arc<Mutex<Database>>,
}

impl ObservationFeed {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        ObservationFeed { db }
    }

    /// Latest observation for (city, date). Dual-station cities must pass a
    /// venue so the read pins to that venue's station and never mixes
    /// readings across stations.
    pub async fn get_latest_observation(
        &self,
        city: &City,
        date: &str,
        venue: Option<Venue>,
    ) -> Result<Option<Observation>> {
        let station = venue.and_then(|v| city.station_for(v));
        let station = match (station, city.dual_station()) {
            (Some(s), _) => Some(s.to_string()),
            (None, true) => {
                // No venue given for a dual-station city: refuse to guess.
                anyhow::bail!(
                    "dual-station city {} requires a venue for observation reads",
                    city.key
                );
            }
            (None, false) => None,
        };

        let db = self.db.lock().await;
        let row = db.get_latest_observation(&city.key, date, station.as_deref())?;
        Ok(row.map(Observation::from_row))
    }
}
