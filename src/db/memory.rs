//! In-process [`Store`] backed by ordered maps. Used by `ingest --dry-run` and tests.
//!
//! Maps are keyed exactly like the Postgres tables, so upserts overwrite the same way.

use super::Store;
use crate::error::{AppError, Result};
use crate::models::{
    CitySnapshot, DailyAggregate, IngestionRun, NationalDailyAggregate, ReadingRecord,
    RunCompletion, RunStatus, StationRecord, StoreStats, Trigger,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    stations: BTreeMap<String, StationRecord>,
    readings: BTreeMap<(String, DateTime<Utc>), ReadingRecord>,
    snapshots: BTreeMap<(String, DateTime<Utc>), CitySnapshot>,
    daily: BTreeMap<(String, NaiveDate), DailyAggregate>,
    national: BTreeMap<NaiveDate, NationalDailyAggregate>,
    runs: Vec<IngestionRun>,
}

/// Writes the store refuses. Empty outside tests.
#[derive(Debug, Default)]
struct Faults {
    snapshot_cities: HashSet<String>,
    reading_stations: HashSet<String>,
    daily_dates: HashSet<NaiveDate>,
    create_run: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::Storage("memory store lock poisoned".into()))
    }

    pub fn stations(&self) -> Result<Vec<StationRecord>> {
        Ok(self.lock()?.stations.values().cloned().collect())
    }

    pub fn readings(&self) -> Result<Vec<ReadingRecord>> {
        Ok(self.lock()?.readings.values().cloned().collect())
    }

    pub fn snapshots(&self) -> Result<Vec<CitySnapshot>> {
        Ok(self.lock()?.snapshots.values().cloned().collect())
    }

    pub fn dailies(&self) -> Result<Vec<DailyAggregate>> {
        Ok(self.lock()?.daily.values().cloned().collect())
    }

    pub fn nationals(&self) -> Result<Vec<NationalDailyAggregate>> {
        Ok(self.lock()?.national.values().cloned().collect())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Rejects snapshot writes for `cities`.
    pub fn refuse_snapshots(mut self, cities: &[&str]) -> Self {
        self.faults.snapshot_cities = cities.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Rejects reading writes for `stations`.
    pub fn refuse_readings(mut self, stations: &[&str]) -> Self {
        self.faults.reading_stations = stations.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Rejects every daily aggregate dated on one of `dates`.
    pub fn refuse_daily_on(mut self, dates: &[NaiveDate]) -> Self {
        self.faults.daily_dates = dates.iter().copied().collect();
        self
    }

    /// Rejects run creation.
    pub fn refuse_runs(mut self) -> Self {
        self.faults.create_run = true;
        self
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_station(&self, station: &StationRecord) -> Result<()> {
        let mut tables = self.lock()?;
        let merged = match tables.stations.get(&station.external_id) {
            Some(existing) => StationRecord {
                latitude: station.latitude.or(existing.latitude),
                longitude: station.longitude.or(existing.longitude),
                ..station.clone()
            },
            None => station.clone(),
        };
        tables.stations.insert(station.external_id.clone(), merged);
        Ok(())
    }

    async fn upsert_reading(&self, reading: &ReadingRecord) -> Result<()> {
        if self.faults.reading_stations.contains(&reading.station_id) {
            return Err(AppError::Storage(format!(
                "reading write refused for station '{}'",
                reading.station_id
            )));
        }
        let mut tables = self.lock()?;
        if !tables.stations.contains_key(&reading.station_id) {
            return Err(AppError::Storage(format!(
                "reading references unknown station '{}'",
                reading.station_id
            )));
        }
        tables
            .readings
            .insert((reading.station_id.clone(), reading.recorded_at), reading.clone());
        Ok(())
    }

    async fn upsert_snapshot(&self, snapshot: &CitySnapshot) -> Result<()> {
        if self.faults.snapshot_cities.contains(&snapshot.city_id) {
            return Err(AppError::Storage(format!(
                "snapshot write refused for city '{}'",
                snapshot.city_id
            )));
        }
        self.lock()?
            .snapshots
            .insert((snapshot.city_id.clone(), snapshot.hour), snapshot.clone());
        Ok(())
    }

    async fn upsert_daily(&self, daily: &DailyAggregate) -> Result<()> {
        if self.faults.daily_dates.contains(&daily.date) {
            return Err(AppError::Storage(format!(
                "daily write refused for {} on {}",
                daily.city_id, daily.date
            )));
        }
        self.lock()?
            .daily
            .insert((daily.city_id.clone(), daily.date), daily.clone());
        Ok(())
    }

    async fn upsert_national(&self, national: &NationalDailyAggregate) -> Result<()> {
        self.lock()?.national.insert(national.date, national.clone());
        Ok(())
    }

    async fn create_run(&self, trigger: Trigger, started_at: DateTime<Utc>) -> Result<i64> {
        if self.faults.create_run {
            return Err(AppError::Storage("run bookkeeping unavailable".into()));
        }
        let mut tables = self.lock()?;
        let id = tables.runs.len() as i64 + 1;
        tables.runs.push(IngestionRun {
            id,
            started_at,
            completed_at: None,
            trigger: trigger.as_str().to_string(),
            cities_processed: 0,
            records_processed: 0,
            status: RunStatus::Running.as_str().to_string(),
            error: None,
        });
        debug!("Opened in-memory run {}", id);
        Ok(id)
    }

    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> Result<()> {
        let mut tables = self.lock()?;
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| AppError::Storage(format!("no run with id {}", run_id)))?;
        run.completed_at = Some(completion.completed_at);
        run.cities_processed = completion.cities_processed;
        run.records_processed = completion.records_processed;
        run.status = completion.status.as_str().to_string();
        run.error = completion.error.clone();
        Ok(())
    }

    async fn snapshots_for_day(
        &self,
        city_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CitySnapshot>> {
        Ok(self
            .lock()?
            .snapshots
            .values()
            .filter(|s| s.city_id == city_id && s.hour.date_naive() == date)
            .cloned()
            .collect())
    }

    async fn daily_for_date(&self, date: NaiveDate) -> Result<Vec<DailyAggregate>> {
        Ok(self
            .lock()?
            .daily
            .values()
            .filter(|d| d.date == date)
            .cloned()
            .collect())
    }

    async fn latest_snapshots(&self) -> Result<Vec<CitySnapshot>> {
        let tables = self.lock()?;
        let mut latest: BTreeMap<&str, &CitySnapshot> = BTreeMap::new();
        // Keys are (city, hour) ascending, so the last one seen per city wins.
        for snapshot in tables.snapshots.values() {
            latest.insert(snapshot.city_id.as_str(), snapshot);
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn snapshots_since(
        &self,
        city_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CitySnapshot>> {
        Ok(self
            .lock()?
            .snapshots
            .values()
            .filter(|s| s.city_id == city_id && s.hour >= since)
            .cloned()
            .collect())
    }

    async fn daily_since(&self, city_id: &str, since: NaiveDate) -> Result<Vec<DailyAggregate>> {
        Ok(self
            .lock()?
            .daily
            .values()
            .filter(|d| d.city_id == city_id && d.date >= since)
            .cloned()
            .collect())
    }

    async fn national_since(&self, since: NaiveDate) -> Result<Vec<NationalDailyAggregate>> {
        Ok(self.lock()?.national.range(since..).map(|(_, n)| n.clone()).collect())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(self.lock()?.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let tables = self.lock()?;
        Ok(StoreStats {
            stations: tables.stations.len() as i64,
            readings: tables.readings.len() as i64,
            snapshots: tables.snapshots.len() as i64,
            daily_aggregates: tables.daily.len() as i64,
            national_aggregates: tables.national.len() as i64,
            runs: tables.runs.len() as i64,
        })
    }
}
