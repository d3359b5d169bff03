//! Provides the persistence gateway.
//!
//! [`Store`] is the read/write contract between the pipeline and its storage. Every write
//! is an upsert on the row's natural key, so re-running a pass over the same inputs
//! rewrites identical rows instead of adding new ones.
//!
//! Two backends implement it: [`Database`] on PostgreSQL, and [`MemoryStore`] for dry
//! runs and tests.

mod memory;
mod postgres;

pub use memory::*;
pub use postgres::*;

use crate::error::Result;
use crate::models::{
    CitySnapshot, DailyAggregate, IngestionRun, NationalDailyAggregate, ReadingRecord,
    RunCompletion, StationRecord, StoreStats, Trigger,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates a station. Known coordinates are never replaced by absent ones.
    async fn upsert_station(&self, station: &StationRecord) -> Result<()>;

    /// Keyed by (station, recorded_at).
    async fn upsert_reading(&self, reading: &ReadingRecord) -> Result<()>;

    /// Keyed by (city, hour).
    async fn upsert_snapshot(&self, snapshot: &CitySnapshot) -> Result<()>;

    /// Keyed by (city, date).
    async fn upsert_daily(&self, daily: &DailyAggregate) -> Result<()>;

    /// Keyed by date.
    async fn upsert_national(&self, national: &NationalDailyAggregate) -> Result<()>;

    /// Opens a provenance row in the `running` state and returns its id.
    async fn create_run(&self, trigger: Trigger, started_at: DateTime<Utc>) -> Result<i64>;

    /// Closes a provenance row with its final counts and status.
    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> Result<()>;

    /// Snapshots of `city_id` whose hour falls on `date` (UTC), ordered by hour.
    async fn snapshots_for_day(&self, city_id: &str, date: NaiveDate)
        -> Result<Vec<CitySnapshot>>;

    /// Every city's daily aggregate for `date`, ordered by city id.
    async fn daily_for_date(&self, date: NaiveDate) -> Result<Vec<DailyAggregate>>;

    /// Most recent snapshot per city, ordered by city id.
    async fn latest_snapshots(&self) -> Result<Vec<CitySnapshot>>;

    /// Snapshots of `city_id` at or after `since`, ordered by hour.
    async fn snapshots_since(
        &self,
        city_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CitySnapshot>>;

    /// Daily aggregates of `city_id` on or after `since`, ordered by date.
    async fn daily_since(&self, city_id: &str, since: NaiveDate) -> Result<Vec<DailyAggregate>>;

    /// National aggregates on or after `since`, ordered by date.
    async fn national_since(&self, since: NaiveDate) -> Result<Vec<NationalDailyAggregate>>;

    /// Newest runs first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>>;

    async fn stats(&self) -> Result<StoreStats>;
}
