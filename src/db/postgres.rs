//! Provides the PostgreSQL [`Store`] using `sqlx`.
//!
//! Includes connection pooling, idempotent schema creation, the natural-key upserts and
//! the read accessors behind the status and history views.
//! Also contains integration tests (requires the `integration-tests` feature).

use super::Store;
use crate::error::{AppError, Result};
use crate::models::{
    CitySnapshot, DailyAggregate, IngestionRun, NationalDailyAggregate, ReadingRecord,
    RunCompletion, RunStatus, StationRecord, StoreStats, Trigger,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use tracing::{debug, error, info};

/// Tables created by [`Database::init_schema`], in dependency order.
const TABLES: [&str; 6] = [
    "stations",
    "readings",
    "city_snapshots",
    "daily_aggregates",
    "national_daily_aggregates",
    "ingestion_runs",
];

const SCHEMA: [&str; 9] = [
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        external_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        city_id TEXT NOT NULL,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        station_id TEXT NOT NULL REFERENCES stations(external_id),
        recorded_at TIMESTAMPTZ NOT NULL,
        pm25 NUMERIC,
        pm10 NUMERIC,
        o3 NUMERIC,
        no2 NUMERIC,
        so2 NUMERIC,
        co NUMERIC,
        aqi INTEGER,
        dominant_pollutant TEXT,
        ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (station_id, recorded_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS city_snapshots (
        city_id TEXT NOT NULL,
        hour TIMESTAMPTZ NOT NULL,
        avg_pm25 DOUBLE PRECISION NOT NULL,
        min_pm25 DOUBLE PRECISION NOT NULL,
        max_pm25 DOUBLE PRECISION NOT NULL,
        median_pm25 DOUBLE PRECISION NOT NULL,
        avg_pm10 DOUBLE PRECISION,
        avg_o3 DOUBLE PRECISION,
        avg_no2 DOUBLE PRECISION,
        avg_so2 DOUBLE PRECISION,
        avg_co DOUBLE PRECISION,
        total_stations INTEGER NOT NULL,
        valid_stations INTEGER NOT NULL CHECK (valid_stations <= total_stations),
        dominant_pollutant TEXT,
        quality TEXT NOT NULL,
        PRIMARY KEY (city_id, hour)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_aggregates (
        city_id TEXT NOT NULL,
        date DATE NOT NULL,
        avg_pm25 DOUBLE PRECISION NOT NULL,
        min_pm25 DOUBLE PRECISION NOT NULL,
        max_pm25 DOUBLE PRECISION NOT NULL,
        peak_hour INTEGER NOT NULL,
        peak_pm25 DOUBLE PRECISION NOT NULL,
        avg_pm10 DOUBLE PRECISION,
        avg_o3 DOUBLE PRECISION,
        avg_no2 DOUBLE PRECISION,
        avg_so2 DOUBLE PRECISION,
        avg_co DOUBLE PRECISION,
        cigarette_equivalent DOUBLE PRECISION NOT NULL,
        years_lost_per_year DOUBLE PRECISION NOT NULL,
        who_violation_factor DOUBLE PRECISION NOT NULL,
        hours_with_data INTEGER NOT NULL CHECK (hours_with_data BETWEEN 0 AND 24),
        PRIMARY KEY (city_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS national_daily_aggregates (
        date DATE PRIMARY KEY,
        avg_pm25 DOUBLE PRECISION NOT NULL,
        weighted_avg_pm25 DOUBLE PRECISION NOT NULL,
        min_pm25 DOUBLE PRECISION NOT NULL,
        max_pm25 DOUBLE PRECISION NOT NULL,
        best_city_id TEXT NOT NULL,
        worst_city_id TEXT NOT NULL,
        cities_reporting INTEGER NOT NULL,
        population_covered BIGINT NOT NULL,
        cigarette_equivalent DOUBLE PRECISION NOT NULL,
        years_lost_per_year DOUBLE PRECISION NOT NULL,
        who_violation_factor DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_runs (
        id BIGSERIAL PRIMARY KEY,
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        trigger TEXT NOT NULL,
        cities_processed INTEGER NOT NULL DEFAULT 0,
        records_processed INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        error TEXT
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_readings_recorded_at ON readings(recorded_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_city_snapshots_hour ON city_snapshots(hour)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_ingestion_runs_started_at ON ingestion_runs(started_at)"#,
];

/// Logs and wraps a `sqlx` failure.
fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| {
        error!("Failed to {}: {}", context, e);
        AppError::Db(e.into())
    }
}

/// Represents the database connection pool and implements [`Store`] on it.
pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    /// Creates a new `Database` instance by establishing a connection pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection pool cannot be established.
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error("connect to database"))?;

        info!("Connected to database successfully");
        Ok(Self { pool })
    }

    /// Creates every table and index if missing. Safe to run repeatedly.
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema (if necessary)...");
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error("apply schema statement"))?;
        }
        info!("Database schema initialized successfully");
        Ok(())
    }

    /// Checks whether every pipeline table exists.
    pub async fn is_schema_initialized(&self) -> Result<bool> {
        debug!("Checking if database schema is initialized...");
        let query = r#"
            SELECT COUNT(*) FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name::text = ANY($1)
        "#;
        let tables: Vec<String> = TABLES.iter().map(|t| t.to_string()).collect();
        let found = sqlx::query_scalar::<_, i64>(query)
            .bind(&tables)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("check schema existence"))?;
        let initialized = found == TABLES.len() as i64;
        debug!("Schema initialized status: {}", initialized);
        Ok(initialized)
    }
}

#[async_trait]
impl Store for Database {
    async fn upsert_station(&self, station: &StationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stations (external_id, name, city_id, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                city_id = EXCLUDED.city_id,
                latitude = COALESCE(EXCLUDED.latitude, stations.latitude),
                longitude = COALESCE(EXCLUDED.longitude, stations.longitude),
                updated_at = NOW()
            "#,
        )
        .bind(&station.external_id)
        .bind(&station.name)
        .bind(&station.city_id)
        .bind(station.latitude)
        .bind(station.longitude)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert station"))?;
        Ok(())
    }

    async fn upsert_reading(&self, r: &ReadingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings
            (station_id, recorded_at, pm25, pm10, o3, no2, so2, co, aqi, dominant_pollutant)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (station_id, recorded_at) DO UPDATE SET
                pm25 = EXCLUDED.pm25,
                pm10 = EXCLUDED.pm10,
                o3 = EXCLUDED.o3,
                no2 = EXCLUDED.no2,
                so2 = EXCLUDED.so2,
                co = EXCLUDED.co,
                aqi = EXCLUDED.aqi,
                dominant_pollutant = EXCLUDED.dominant_pollutant,
                ingested_at = NOW()
            "#,
        )
        .bind(&r.station_id)
        .bind(r.recorded_at)
        .bind(r.pm25)
        .bind(r.pm10)
        .bind(r.o3)
        .bind(r.no2)
        .bind(r.so2)
        .bind(r.co)
        .bind(r.aqi)
        .bind(&r.dominant_pollutant)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert reading"))?;
        Ok(())
    }

    async fn upsert_snapshot(&self, s: &CitySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO city_snapshots
            (city_id, hour, avg_pm25, min_pm25, max_pm25, median_pm25,
             avg_pm10, avg_o3, avg_no2, avg_so2, avg_co,
             total_stations, valid_stations, dominant_pollutant, quality)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (city_id, hour) DO UPDATE SET
                avg_pm25 = EXCLUDED.avg_pm25,
                min_pm25 = EXCLUDED.min_pm25,
                max_pm25 = EXCLUDED.max_pm25,
                median_pm25 = EXCLUDED.median_pm25,
                avg_pm10 = EXCLUDED.avg_pm10,
                avg_o3 = EXCLUDED.avg_o3,
                avg_no2 = EXCLUDED.avg_no2,
                avg_so2 = EXCLUDED.avg_so2,
                avg_co = EXCLUDED.avg_co,
                total_stations = EXCLUDED.total_stations,
                valid_stations = EXCLUDED.valid_stations,
                dominant_pollutant = EXCLUDED.dominant_pollutant,
                quality = EXCLUDED.quality
            "#,
        )
        .bind(&s.city_id)
        .bind(s.hour)
        .bind(s.avg_pm25)
        .bind(s.min_pm25)
        .bind(s.max_pm25)
        .bind(s.median_pm25)
        .bind(s.avg_pm10)
        .bind(s.avg_o3)
        .bind(s.avg_no2)
        .bind(s.avg_so2)
        .bind(s.avg_co)
        .bind(s.total_stations)
        .bind(s.valid_stations)
        .bind(&s.dominant_pollutant)
        .bind(&s.quality)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert city snapshot"))?;
        Ok(())
    }

    async fn upsert_daily(&self, d: &DailyAggregate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_aggregates
            (city_id, date, avg_pm25, min_pm25, max_pm25, peak_hour, peak_pm25,
             avg_pm10, avg_o3, avg_no2, avg_so2, avg_co,
             cigarette_equivalent, years_lost_per_year, who_violation_factor, hours_with_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (city_id, date) DO UPDATE SET
                avg_pm25 = EXCLUDED.avg_pm25,
                min_pm25 = EXCLUDED.min_pm25,
                max_pm25 = EXCLUDED.max_pm25,
                peak_hour = EXCLUDED.peak_hour,
                peak_pm25 = EXCLUDED.peak_pm25,
                avg_pm10 = EXCLUDED.avg_pm10,
                avg_o3 = EXCLUDED.avg_o3,
                avg_no2 = EXCLUDED.avg_no2,
                avg_so2 = EXCLUDED.avg_so2,
                avg_co = EXCLUDED.avg_co,
                cigarette_equivalent = EXCLUDED.cigarette_equivalent,
                years_lost_per_year = EXCLUDED.years_lost_per_year,
                who_violation_factor = EXCLUDED.who_violation_factor,
                hours_with_data = EXCLUDED.hours_with_data
            "#,
        )
        .bind(&d.city_id)
        .bind(d.date)
        .bind(d.avg_pm25)
        .bind(d.min_pm25)
        .bind(d.max_pm25)
        .bind(d.peak_hour)
        .bind(d.peak_pm25)
        .bind(d.avg_pm10)
        .bind(d.avg_o3)
        .bind(d.avg_no2)
        .bind(d.avg_so2)
        .bind(d.avg_co)
        .bind(d.cigarette_equivalent)
        .bind(d.years_lost_per_year)
        .bind(d.who_violation_factor)
        .bind(d.hours_with_data)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert daily aggregate"))?;
        Ok(())
    }

    async fn upsert_national(&self, n: &NationalDailyAggregate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO national_daily_aggregates
            (date, avg_pm25, weighted_avg_pm25, min_pm25, max_pm25, best_city_id, worst_city_id,
             cities_reporting, population_covered,
             cigarette_equivalent, years_lost_per_year, who_violation_factor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (date) DO UPDATE SET
                avg_pm25 = EXCLUDED.avg_pm25,
                weighted_avg_pm25 = EXCLUDED.weighted_avg_pm25,
                min_pm25 = EXCLUDED.min_pm25,
                max_pm25 = EXCLUDED.max_pm25,
                best_city_id = EXCLUDED.best_city_id,
                worst_city_id = EXCLUDED.worst_city_id,
                cities_reporting = EXCLUDED.cities_reporting,
                population_covered = EXCLUDED.population_covered,
                cigarette_equivalent = EXCLUDED.cigarette_equivalent,
                years_lost_per_year = EXCLUDED.years_lost_per_year,
                who_violation_factor = EXCLUDED.who_violation_factor
            "#,
        )
        .bind(n.date)
        .bind(n.avg_pm25)
        .bind(n.weighted_avg_pm25)
        .bind(n.min_pm25)
        .bind(n.max_pm25)
        .bind(&n.best_city_id)
        .bind(&n.worst_city_id)
        .bind(n.cities_reporting)
        .bind(n.population_covered)
        .bind(n.cigarette_equivalent)
        .bind(n.years_lost_per_year)
        .bind(n.who_violation_factor)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert national aggregate"))?;
        Ok(())
    }

    async fn create_run(&self, trigger: Trigger, started_at: DateTime<Utc>) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ingestion_runs (started_at, trigger, status)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(started_at)
        .bind(trigger.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create ingestion run"))?;
        debug!("Opened ingestion run {}", id);
        Ok(id)
    }

    async fn finish_run(&self, run_id: i64, c: &RunCompletion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET completed_at = $2, cities_processed = $3, records_processed = $4,
                status = $5, error = $6
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(c.completed_at)
        .bind(c.cities_processed)
        .bind(c.records_processed)
        .bind(c.status.as_str())
        .bind(&c.error)
        .execute(&self.pool)
        .await
        .map_err(db_error("finish ingestion run"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Storage(format!("no run with id {}", run_id)));
        }
        Ok(())
    }

    async fn snapshots_for_day(
        &self,
        city_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CitySnapshot>> {
        sqlx::query_as::<_, CitySnapshot>(
            r#"
            SELECT * FROM city_snapshots
            WHERE city_id = $1 AND (hour AT TIME ZONE 'UTC')::date = $2
            ORDER BY hour
            "#,
        )
        .bind(city_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch snapshots for day"))
    }

    async fn daily_for_date(&self, date: NaiveDate) -> Result<Vec<DailyAggregate>> {
        sqlx::query_as::<_, DailyAggregate>(
            "SELECT * FROM daily_aggregates WHERE date = $1 ORDER BY city_id",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch daily aggregates for date"))
    }

    async fn latest_snapshots(&self) -> Result<Vec<CitySnapshot>> {
        // DISTINCT ON keeps the first row per city under the ORDER BY, i.e. the newest hour.
        sqlx::query_as::<_, CitySnapshot>(
            r#"
            SELECT DISTINCT ON (city_id) *
            FROM city_snapshots
            ORDER BY city_id, hour DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch latest snapshots"))
    }

    async fn snapshots_since(
        &self,
        city_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CitySnapshot>> {
        sqlx::query_as::<_, CitySnapshot>(
            "SELECT * FROM city_snapshots WHERE city_id = $1 AND hour >= $2 ORDER BY hour",
        )
        .bind(city_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch recent snapshots"))
    }

    async fn daily_since(&self, city_id: &str, since: NaiveDate) -> Result<Vec<DailyAggregate>> {
        sqlx::query_as::<_, DailyAggregate>(
            "SELECT * FROM daily_aggregates WHERE city_id = $1 AND date >= $2 ORDER BY date",
        )
        .bind(city_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch recent daily aggregates"))
    }

    async fn national_since(&self, since: NaiveDate) -> Result<Vec<NationalDailyAggregate>> {
        sqlx::query_as::<_, NationalDailyAggregate>(
            "SELECT * FROM national_daily_aggregates WHERE date >= $1 ORDER BY date",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch recent national aggregates"))
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs ORDER BY started_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("fetch recent runs"))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM stations) AS stations,
                (SELECT COUNT(*) FROM readings) AS readings,
                (SELECT COUNT(*) FROM city_snapshots) AS snapshots,
                (SELECT COUNT(*) FROM daily_aggregates) AS daily_aggregates,
                (SELECT COUNT(*) FROM national_daily_aggregates) AS national_aggregates,
                (SELECT COUNT(*) FROM ingestion_runs) AS runs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count rows"))?;

        Ok(StoreStats {
            stations: row.try_get("stations")?,
            readings: row.try_get("readings")?,
            snapshots: row.try_get("snapshots")?,
            daily_aggregates: row.try_get("daily_aggregates")?,
            national_aggregates: row.try_get("national_aggregates")?,
            runs: row.try_get("runs")?,
        })
    }
}
