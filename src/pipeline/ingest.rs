//! One ingestion run: shard, fetch, validate, write readings, roll up.
//!
//! Failures are contained at the smallest entity that owns them. A station that cannot be
//! fetched or parsed is skipped for the round; a reading that cannot be written is
//! dropped; a city whose snapshot or day cannot be written is marked failed. None of
//! these stop the run, and the run's provenance row is best effort.

use super::aggregate::{city_snapshot, truncate_to_hour};
use super::anomaly::{Anomaly, AnomalyDetector};
use super::rollup::refresh_city_day;
use super::shard::select_cities;
use super::validation::{Severity, Validated, Validator};
use crate::api::{BatchScheduler, WaqiClient};
use crate::config::{CityConfig, Settings};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{
    CitySnapshot, DailyAggregate, Reading, ReadingRecord, RunCompletion, RunStatus,
    StationRecord, Trigger,
};
use chrono::{DateTime, Timelike, Utc};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

/// Checks the credential of a manual run. Scheduled runs and unprotected deployments pass.
pub fn authorize(trigger: Trigger, expected: Option<&str>, presented: Option<&str>) -> Result<()> {
    match (trigger, expected) {
        (Trigger::Scheduled, _) | (Trigger::Manual, None) => Ok(()),
        (Trigger::Manual, Some(expected)) => match presented {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(AppError::Unauthorized("ingest token does not match".into())),
            None => Err(AppError::Unauthorized(
                "manual ingest requires --token when INGEST_TOKEN is set".into(),
            )),
        },
    }
}

/// Per-city data quality for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityReport {
    pub city_id: String,
    pub total_stations: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    /// Payloads that failed structural checks.
    pub rejected: usize,
    /// Readings with a usable PM2.5 value.
    pub valid_stations: usize,
    pub warnings: usize,
    pub errors: usize,
    pub anomalies: Vec<Anomaly>,
}

impl QualityReport {
    fn new(city_id: &str, total_stations: usize) -> Self {
        Self {
            city_id: city_id.to_string(),
            total_stations,
            ..Default::default()
        }
    }

    fn record(&mut self, station_id: &str, validated: &Validated) {
        for issue in &validated.issues {
            match issue.severity {
                Severity::Error | Severity::Warning => warn!("Station {}: {}", station_id, issue),
                Severity::Info => debug!("Station {}: {}", station_id, issue),
            }
        }
        self.warnings += validated.count(Severity::Warning);
        self.errors += validated.count(Severity::Error);
        if validated.is_rejected() {
            self.rejected += 1;
        }
    }

    fn log(&self) {
        info!(
            "Quality {}: {}/{} valid, {} fetched, {} unreachable, {} rejected, {} warnings, {} errors, {} anomalies",
            self.city_id,
            self.valid_stations,
            self.total_stations,
            self.fetched,
            self.fetch_failures,
            self.rejected,
            self.warnings,
            self.errors,
            self.anomalies.len()
        );
        for anomaly in &self.anomalies {
            warn!("Anomaly in {}: {}", self.city_id, anomaly);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CityReport {
    pub quality: QualityReport,
    pub readings_written: usize,
    pub write_failures: usize,
    pub snapshot: Option<CitySnapshot>,
    pub daily: Option<DailyAggregate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CityOutcome {
    /// Snapshot and day written.
    Completed(CityReport),
    /// No station produced a PM2.5 value; nothing rolled up.
    NoData(CityReport),
    Failed(String),
}

impl CityOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CityOutcome::Completed(_) => "ok",
            CityOutcome::NoData(_) => "no data",
            CityOutcome::Failed(_) => "failed",
        }
    }

    pub fn report(&self) -> Option<&CityReport> {
        match self {
            CityOutcome::Completed(r) | CityOutcome::NoData(r) => Some(r),
            CityOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// `None` when the provenance row could not be created.
    pub run_id: Option<i64>,
    pub trigger: Trigger,
    pub hour: DateTime<Utc>,
    pub status: RunStatus,
    /// Per-city outcome, in processing order.
    pub cities: Vec<(String, CityOutcome)>,
    pub cities_processed: usize,
    pub records_processed: usize,
}

impl RunReport {
    fn new(
        run_id: Option<i64>,
        trigger: Trigger,
        hour: DateTime<Utc>,
        cities: Vec<(String, CityOutcome)>,
    ) -> Self {
        let completed = cities
            .iter()
            .filter(|(_, o)| matches!(o, CityOutcome::Completed(_)))
            .count();
        let status = if completed == cities.len() {
            RunStatus::Success
        } else if completed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
        let records_processed = cities
            .iter()
            .filter_map(|(_, o)| o.report())
            .map(|r| r.readings_written)
            .sum();

        Self {
            run_id,
            trigger,
            hour,
            status,
            cities_processed: completed,
            records_processed,
            cities,
        }
    }

    /// Short description of every city that did not complete.
    pub fn error_summary(&self) -> Option<String> {
        let problems: Vec<String> = self
            .cities
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                CityOutcome::Completed(_) => None,
                CityOutcome::NoData(_) => Some(format!("{}: no valid data", id)),
                CityOutcome::Failed(e) => Some(format!("{}: {}", id, e)),
            })
            .collect();
        if problems.is_empty() {
            None
        } else {
            Some(problems.join("; "))
        }
    }

    pub fn completion(&self, completed_at: DateTime<Utc>) -> RunCompletion {
        RunCompletion {
            completed_at,
            cities_processed: self.cities_processed as i32,
            records_processed: self.records_processed as i32,
            status: self.status,
            error: self.error_summary(),
        }
    }
}

pub struct Ingestor<'a, S: Store> {
    settings: &'a Settings,
    client: &'a WaqiClient,
    store: &'a S,
    scheduler: BatchScheduler,
}

impl<'a, S: Store> Ingestor<'a, S> {
    pub fn new(settings: &'a Settings, client: &'a WaqiClient, store: &'a S) -> Self {
        Self {
            settings,
            client,
            store,
            scheduler: BatchScheduler::from_config(&settings.fetch),
        }
    }

    /// Runs one pass for the hour containing `now`.
    pub async fn run(&self, trigger: Trigger, now: DateTime<Utc>) -> RunReport {
        let hour = truncate_to_hour(now);
        let run_id = match self.store.create_run(trigger, now).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not record run start, continuing without provenance: {}", e);
                None
            },
        };

        let cities = select_cities(&self.settings.cities, trigger, hour.hour());
        info!(
            "Starting {} ingestion for {}: {} of {} cities",
            trigger.as_str(),
            hour,
            cities.len(),
            self.settings.cities.len()
        );

        let mut outcomes = Vec::with_capacity(cities.len());
        for city in cities {
            let outcome = match self.process_city(city, hour).await {
                Ok(report) if report.snapshot.is_some() => CityOutcome::Completed(report),
                Ok(report) => CityOutcome::NoData(report),
                Err(e) => {
                    error!("City {} failed: {}", city.id, e);
                    CityOutcome::Failed(e.to_string())
                },
            };
            outcomes.push((city.id.clone(), outcome));
        }

        let report = RunReport::new(run_id, trigger, hour, outcomes);
        if let Some(id) = run_id {
            if let Err(e) = self.store.finish_run(id, &report.completion(Utc::now())).await {
                warn!("Could not record completion of run {}: {}", id, e);
            }
        }
        info!(
            "Ingestion {}: {} cities processed, {} records written",
            report.status, report.cities_processed, report.records_processed
        );
        report
    }

    async fn process_city(&self, city: &CityConfig, hour: DateTime<Utc>) -> Result<CityReport> {
        let station_ids: Vec<String> = city.stations.iter().map(|s| s.id.clone()).collect();
        let batch = self.client.fetch_stations(&station_ids, &self.scheduler).await;
        for (station_id, err) in &batch.failures {
            warn!("No data from station {} this round: {}", station_id, err);
        }

        let mut quality = QualityReport::new(&city.id, station_ids.len());
        quality.fetched = batch.payloads.len();
        quality.fetch_failures = batch.failures.len();

        // Validation is CPU-only; spread it across the rayon pool.
        let validator = Validator::new(&self.settings.validation);
        let validated: Vec<(&String, Validated)> = batch
            .payloads
            .par_iter()
            .map(|(id, feed)| (id, validator.validate(id, &city.id, feed, hour)))
            .collect();

        let mut readings = Vec::with_capacity(validated.len());
        let mut readings_written = 0;
        let mut write_failures = 0;
        for (station_id, result) in validated {
            quality.record(station_id, &result);
            let Some(reading) = result.reading else {
                continue;
            };
            let station = StationRecord {
                external_id: station_id.clone(),
                name: city
                    .stations
                    .iter()
                    .find(|s| &s.id == station_id)
                    .map_or_else(|| station_id.clone(), |s| s.name.clone()),
                city_id: city.id.clone(),
                latitude: result.coordinates.map(|(lat, _)| lat),
                longitude: result.coordinates.map(|(_, lon)| lon),
            };
            match self.write_reading(&station, &reading).await {
                Ok(()) => readings_written += 1,
                Err(e) => {
                    error!("Dropping reading of station {}: {}", station_id, e);
                    write_failures += 1;
                },
            }
            readings.push(reading);
        }

        quality.valid_stations = readings
            .iter()
            .filter(|r| r.concentrations.pm25.is_some())
            .count();
        quality.anomalies = AnomalyDetector::new(&self.settings.anomaly).detect(&readings);
        quality.log();

        let snapshot = city_snapshot(
            &city.id,
            hour,
            &readings,
            city.stations.len(),
            &self.settings.aggregation,
        );
        let Some(snapshot) = snapshot else {
            info!("No valid PM2.5 for {} at {}; snapshot skipped", city.id, hour);
            return Ok(CityReport {
                quality,
                readings_written,
                write_failures,
                snapshot: None,
                daily: None,
            });
        };

        self.store.upsert_snapshot(&snapshot).await?;
        let daily = refresh_city_day(self.store, &city.id, hour.date_naive()).await?;

        Ok(CityReport {
            quality,
            readings_written,
            write_failures,
            snapshot: Some(snapshot),
            daily,
        })
    }

    async fn write_reading(&self, station: &StationRecord, reading: &Reading) -> Result<()> {
        self.store.upsert_station(station).await?;
        self.store.upsert_reading(&ReadingRecord::from(reading)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;
    use crate::db::MemoryStore;
    use crate::pipeline::anomaly::AnomalyKind;
    use chrono::TimeZone;
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 7, 20, 0).unwrap()
    }

    fn ok_body(pm25: i64) -> String {
        json!({
            "status": "ok",
            "data": {
                "aqi": pm25,
                "dominentpol": "pm25",
                "time": {"iso": "2024-03-01T14:00:00+07:00"},
                "iaqi": {"pm25": {"v": pm25}, "pm10": {"v": 30}},
                "city": {"geo": [13.7, 100.5]}
            }
        })
        .to_string()
    }

    async fn serve(server: &mut ServerGuard, station: &str, status: usize, body: String) -> Mock {
        server
            .mock("GET", format!("/feed/{}/", station).as_str())
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body(body)
            .create_async()
            .await
    }

    async fn serve_city(server: &mut ServerGuard, city: &str, values: &[i64]) -> Vec<Mock> {
        let mut mocks = Vec::new();
        for (i, v) in values.iter().enumerate() {
            mocks.push(serve(server, &format!("{}-{}", city, i), 200, ok_body(*v)).await);
        }
        mocks
    }

    fn client(server: &ServerGuard, settings: &Settings) -> WaqiClient {
        WaqiClient::new("token".into(), &server.url(), &settings.fetch).unwrap()
    }

    fn outcome<'r>(report: &'r RunReport, city: &str) -> &'r CityOutcome {
        &report.cities.iter().find(|(id, _)| id == city).unwrap().1
    }

    #[test]
    fn test_authorize_manual_runs() {
        assert!(authorize(Trigger::Scheduled, Some("s"), None).is_ok());
        assert!(authorize(Trigger::Manual, None, None).is_ok());
        assert!(authorize(Trigger::Manual, Some("s"), Some("s")).is_ok());
        assert!(matches!(
            authorize(Trigger::Manual, Some("s"), Some("x")),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize(Trigger::Manual, Some("s"), None),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_station_does_not_block_city() {
        let settings = test_settings(&[("bkk", 100)], 4);
        let mut server = Server::new_async().await;
        let _good_a = serve(&mut server, "bkk-0", 200, ok_body(57)).await;
        let _broken = serve(&mut server, "bkk-1", 200, "{not json".into()).await;
        let _error = serve(
            &mut server,
            "bkk-2",
            200,
            json!({"status": "error", "data": "Unknown station"}).to_string(),
        )
        .await;
        let _good_b = serve(&mut server, "bkk-3", 200, ok_body(80)).await;

        let store = MemoryStore::new();
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        let city = match outcome(&report, "bkk") {
            CityOutcome::Completed(r) => r,
            other => panic!("expected completed city, got {:?}", other),
        };
        assert_eq!(city.quality.fetch_failures, 1);
        assert_eq!(city.quality.rejected, 1);
        assert_eq!(city.readings_written, 2);

        let snapshot = city.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.valid_stations, 2);
        assert_eq!(snapshot.total_stations, 4);
        assert_eq!(snapshot.hour, Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap());
        assert_eq!(store.stations().unwrap().len(), 2);
        assert_eq!(store.dailies().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_rewrites_identical_rows() {
        let settings = test_settings(&[("bkk", 100), ("cnx", 50)], 3);
        let mut server = Server::new_async().await;
        let _bkk = serve_city(&mut server, "bkk", &[57, 62, 70]).await;
        let _cnx = serve_city(&mut server, "cnx", &[120, 135, 150]).await;

        let store = MemoryStore::new();
        let client = client(&server, &settings);
        let ingestor = Ingestor::new(&settings, &client, &store);

        ingestor.run(Trigger::Manual, now()).await;
        let first = (
            store.readings().unwrap(),
            store.snapshots().unwrap(),
            store.dailies().unwrap(),
        );
        let report = ingestor.run(Trigger::Manual, now()).await;
        let second = (
            store.readings().unwrap(),
            store.snapshots().unwrap(),
            store.dailies().unwrap(),
        );

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.records_processed, 6);
        assert_eq!(first, second);
        assert_eq!(second.1.len(), 2);
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_reading_is_flagged_but_counted() {
        let settings = test_settings(&[("bkk", 100)], 3);
        let mut server = Server::new_async().await;
        let _mocks = serve_city(&mut server, "bkk", &[0, 40, 45]).await;

        let store = MemoryStore::new();
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        let city = outcome(&report, "bkk").report().unwrap();
        assert!(city
            .quality
            .anomalies
            .iter()
            .any(|a| a.station_id == "bkk-0" && a.kind == AnomalyKind::ZeroValue));
        let snapshot = city.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.valid_stations, 3);
        assert_eq!(snapshot.min_pm25, 0.0);
    }

    #[tokio::test]
    async fn test_failing_city_makes_run_partial() {
        let settings = test_settings(&[("bkk", 100), ("cnx", 50)], 2);
        let mut server = Server::new_async().await;
        let _bkk = serve_city(&mut server, "bkk", &[57, 62]).await;
        let _cnx = serve_city(&mut server, "cnx", &[90, 95]).await;

        let store = MemoryStore::new().refuse_snapshots(&["cnx"]);
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.cities_processed, 1);
        assert!(matches!(outcome(&report, "bkk"), CityOutcome::Completed(_)));
        assert!(matches!(outcome(&report, "cnx"), CityOutcome::Failed(_)));

        let snapshots = store.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].city_id, "bkk");

        let run = &store.recent_runs(1).await.unwrap()[0];
        assert_eq!(run.status, "partial");
        assert!(run.error.as_deref().unwrap_or_default().contains("cnx"));
    }

    #[tokio::test]
    async fn test_reading_write_failure_is_counted_not_fatal() {
        let settings = test_settings(&[("bkk", 100)], 3);
        let mut server = Server::new_async().await;
        let _mocks = serve_city(&mut server, "bkk", &[50, 55, 60]).await;

        let store = MemoryStore::new().refuse_readings(&["bkk-1"]);
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        let city = match outcome(&report, "bkk") {
            CityOutcome::Completed(r) => r,
            other => panic!("expected completed city, got {:?}", other),
        };
        assert_eq!(city.write_failures, 1);
        assert_eq!(city.readings_written, 2);
        assert_eq!(report.records_processed, 2);
        // The unwritten reading still counts toward the snapshot.
        assert_eq!(city.snapshot.as_ref().unwrap().valid_stations, 3);
        assert_eq!(store.readings().unwrap().len(), 2);
        assert_eq!(store.snapshots().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_continues_without_provenance() {
        let settings = test_settings(&[("bkk", 100)], 2);
        let mut server = Server::new_async().await;
        let _mocks = serve_city(&mut server, "bkk", &[50, 55]).await;

        let store = MemoryStore::new().refuse_runs();
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        assert!(report.run_id.is_none());
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.records_processed, 2);
        assert!(store.recent_runs(10).await.unwrap().is_empty());
        assert_eq!(store.snapshots().unwrap().len(), 1);
        assert_eq!(store.dailies().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_network_fails_run() {
        let settings = test_settings(&[("bkk", 100)], 2);
        let mut server = Server::new_async().await;
        let _a = serve(&mut server, "bkk-0", 404, String::new()).await;
        let _b = serve(&mut server, "bkk-1", 403, String::new()).await;

        let store = MemoryStore::new();
        let client = client(&server, &settings);
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Manual, now())
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(matches!(outcome(&report, "bkk"), CityOutcome::NoData(_)));
        assert!(store.snapshots().unwrap().is_empty());
        assert_eq!(store.recent_runs(1).await.unwrap()[0].status, "failed");
    }

    #[tokio::test]
    async fn test_scheduled_run_processes_one_shard() {
        let settings = test_settings(&[("bkk", 100), ("cnx", 50)], 1);
        let mut server = Server::new_async().await;
        let bkk = server
            .mock("GET", "/feed/bkk-0/")
            .match_query(Matcher::Any)
            .with_body(ok_body(50))
            .expect(0)
            .create_async()
            .await;
        let _cnx = serve_city(&mut server, "cnx", &[60]).await;

        let store = MemoryStore::new();
        let client = client(&server, &settings);
        // 07:20 is an odd hour: second half only.
        let report = Ingestor::new(&settings, &client, &store)
            .run(Trigger::Scheduled, now())
            .await;

        assert_eq!(report.cities.len(), 1);
        assert_eq!(report.cities[0].0, "cnx");
        bkk.assert_async().await;
    }
}
