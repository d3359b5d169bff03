//! Rows persisted by the pipeline and the projections read back from the store.
//!
//! Every row type is keyed by its natural key (station id; station + timestamp;
//! city + hour; city + date; date), which is what makes re-runs overwrite instead of
//! duplicate.

use chrono::{DateTime, NaiveDate, Utc};
use num_traits::FromPrimitive;
use serde::Serialize;
use sqlx::types::Decimal;
use std::fmt;
use tracing::warn;

/// The six tracked pollutants, in storage column order.
pub const POLLUTANTS: [&str; 6] = ["pm25", "pm10", "o3", "no2", "so2", "co"];

/// A physical sensor. Coordinates may be unknown on first sight.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StationRecord {
    pub external_id: String,
    pub name: String,
    pub city_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Pollutant concentrations after sub-index conversion.
///
/// PM2.5/PM10 in µg/m³, O3/NO2/SO2 in ppb, CO in ppm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Concentrations {
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub o3: Option<f64>,
    pub no2: Option<f64>,
    pub so2: Option<f64>,
    pub co: Option<f64>,
}

impl Concentrations {
    pub fn get(&self, pollutant: &str) -> Option<f64> {
        match pollutant {
            "pm25" => self.pm25,
            "pm10" => self.pm10,
            "o3" => self.o3,
            "no2" => self.no2,
            "so2" => self.so2,
            "co" => self.co,
            _ => None,
        }
    }

    pub fn set(&mut self, pollutant: &str, value: Option<f64>) {
        match pollutant {
            "pm25" => self.pm25 = value,
            "pm10" => self.pm10 = value,
            "o3" => self.o3 = value,
            "no2" => self.no2 = value,
            "so2" => self.so2 = value,
            "co" => self.co = value,
            _ => {},
        }
    }
}

/// One station's validated measurement at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub station_id: String,
    pub city_id: String,
    /// Timestamp reported by the source.
    pub recorded_at: DateTime<Utc>,
    pub concentrations: Concentrations,
    /// Overall index, absent when missing or error-coded.
    pub aqi: Option<i32>,
    pub dominant_pollutant: Option<String>,
    /// PM2.5 sub-index as the upstream reported it, before conversion.
    pub reported_pm25: Option<f64>,
}

/// A reading structured for storage; concentrations kept as `Decimal` for precision.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReadingRecord {
    pub station_id: String,
    pub recorded_at: DateTime<Utc>,
    pub pm25: Option<Decimal>,
    pub pm10: Option<Decimal>,
    pub o3: Option<Decimal>,
    pub no2: Option<Decimal>,
    pub so2: Option<Decimal>,
    pub co: Option<Decimal>,
    pub aqi: Option<i32>,
    pub dominant_pollutant: Option<String>,
}

fn to_decimal(value: Option<f64>, pollutant: &str, station_id: &str) -> Option<Decimal> {
    value.and_then(|v| {
        let converted = Decimal::from_f64(v);
        if converted.is_none() {
            warn!(
                "Could not convert {} value {} to Decimal for station {}; storing NULL",
                pollutant, v, station_id
            );
        }
        converted
    })
}

impl From<&Reading> for ReadingRecord {
    fn from(r: &Reading) -> Self {
        let c = &r.concentrations;
        Self {
            station_id: r.station_id.clone(),
            recorded_at: r.recorded_at,
            pm25: to_decimal(c.pm25, "pm25", &r.station_id),
            pm10: to_decimal(c.pm10, "pm10", &r.station_id),
            o3: to_decimal(c.o3, "o3", &r.station_id),
            no2: to_decimal(c.no2, "no2", &r.station_id),
            so2: to_decimal(c.so2, "so2", &r.station_id),
            co: to_decimal(c.co, "co", &r.station_id),
            aqi: r.aqi,
            dominant_pollutant: r.dominant_pollutant.clone(),
        }
    }
}

/// Coarse snapshot quality derived from the valid/total station ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotQuality {
    Healthy,
    Degraded,
}

impl SnapshotQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotQuality::Healthy => "healthy",
            SnapshotQuality::Degraded => "degraded",
        }
    }
}

/// Hour-truncated aggregate of a city's station readings. Key: (city, hour).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CitySnapshot {
    pub city_id: String,
    pub hour: DateTime<Utc>,
    pub avg_pm25: f64,
    pub min_pm25: f64,
    pub max_pm25: f64,
    pub median_pm25: f64,
    pub avg_pm10: Option<f64>,
    pub avg_o3: Option<f64>,
    pub avg_no2: Option<f64>,
    pub avg_so2: Option<f64>,
    pub avg_co: Option<f64>,
    pub total_stations: i32,
    pub valid_stations: i32,
    pub dominant_pollutant: Option<String>,
    pub quality: String,
}

/// A city's rollup for one calendar day. Key: (city, date).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DailyAggregate {
    pub city_id: String,
    pub date: NaiveDate,
    pub avg_pm25: f64,
    pub min_pm25: f64,
    pub max_pm25: f64,
    /// Hour of day (0-23) with the largest snapshot average.
    pub peak_hour: i32,
    pub peak_pm25: f64,
    pub avg_pm10: Option<f64>,
    pub avg_o3: Option<f64>,
    pub avg_no2: Option<f64>,
    pub avg_so2: Option<f64>,
    pub avg_co: Option<f64>,
    pub cigarette_equivalent: f64,
    pub years_lost_per_year: f64,
    pub who_violation_factor: f64,
    pub hours_with_data: i32,
}

/// Nation-wide rollup for one calendar day. Key: date.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NationalDailyAggregate {
    pub date: NaiveDate,
    pub avg_pm25: f64,
    pub weighted_avg_pm25: f64,
    pub min_pm25: f64,
    pub max_pm25: f64,
    pub best_city_id: String,
    pub worst_city_id: String,
    pub cities_reporting: i32,
    pub population_covered: i64,
    pub cigarette_equivalent: f64,
    pub years_lost_per_year: f64,
    pub who_violation_factor: f64,
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// Terminal (or, for `Running`, stuck) state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level provenance.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct IngestionRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trigger: String,
    pub cities_processed: i32,
    pub records_processed: i32,
    pub status: String,
    pub error: Option<String>,
}

/// Final counts written once when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub completed_at: DateTime<Utc>,
    pub cities_processed: i32,
    pub records_processed: i32,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Age class of a city's most recent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Offline,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CityFreshness {
    pub city_id: String,
    pub city_name: String,
    pub last_hour: Option<DateTime<Utc>>,
    pub freshness: Freshness,
}

/// Row counts per table for the status view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub stations: i64,
    pub readings: i64,
    pub snapshots: i64,
    pub daily_aggregates: i64,
    pub national_aggregates: i64,
    pub runs: i64,
}
