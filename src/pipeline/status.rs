//! Operational status: row counts, per-city freshness and recent runs.

use crate::config::{FreshnessConfig, Settings};
use crate::db::Store;
use crate::error::Result;
use crate::models::{CityFreshness, CitySnapshot, Freshness, IngestionRun, StoreStats};
use chrono::{DateTime, Duration, NaiveDate, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub stats: StoreStats,
    pub cities: Vec<CityFreshness>,
    pub runs: Vec<IngestionRun>,
}

/// Classifies the age of a city's newest snapshot. Never seen means offline.
pub fn classify(
    last_hour: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &FreshnessConfig,
) -> Freshness {
    let Some(last) = last_hour else {
        return Freshness::Offline;
    };
    let age = now - last;
    if age < Duration::minutes(config.fresh_minutes) {
        Freshness::Fresh
    } else if age < Duration::minutes(config.stale_minutes) {
        Freshness::Stale
    } else {
        Freshness::Offline
    }
}

/// One entry per configured city, in configuration order.
pub fn city_freshness(
    settings: &Settings,
    latest: &[CitySnapshot],
    now: DateTime<Utc>,
) -> Vec<CityFreshness> {
    settings
        .cities
        .iter()
        .map(|city| {
            let last_hour = latest.iter().find(|s| s.city_id == city.id).map(|s| s.hour);
            CityFreshness {
                city_id: city.id.clone(),
                city_name: city.name.clone(),
                last_hour,
                freshness: classify(last_hour, now, &settings.freshness),
            }
        })
        .collect()
}

pub async fn collect<S: Store + ?Sized>(
    store: &S,
    settings: &Settings,
    now: DateTime<Utc>,
    run_limit: i64,
) -> Result<StatusReport> {
    let stats = store.stats().await?;
    let latest = store.latest_snapshots().await?;
    let runs = store.recent_runs(run_limit).await?;
    Ok(StatusReport {
        stats,
        cities: city_freshness(settings, &latest, now),
        runs,
    })
}

/// Start of a window covering the last `hours` hours.
pub fn since_hours(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours.max(0))
}

/// First date of a window of `days` calendar days ending today.
pub fn since_days(now: DateTime<Utc>, days: i64) -> NaiveDate {
    now.date_naive() - Duration::days((days - 1).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;
    use crate::db::MemoryStore;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[rstest]
    #[case(Some(30), Freshness::Fresh)]
    #[case(Some(119), Freshness::Fresh)]
    #[case(Some(120), Freshness::Stale)]
    #[case(Some(359), Freshness::Stale)]
    #[case(Some(360), Freshness::Offline)]
    #[case(None, Freshness::Offline)]
    fn test_classify(#[case] age_minutes: Option<i64>, #[case] expected: Freshness) {
        let last = age_minutes.map(|m| now() - Duration::minutes(m));
        assert_eq!(classify(last, now(), &FreshnessConfig::default()), expected);
    }

    #[test]
    fn test_windows() {
        assert_eq!(since_hours(now(), 24), now() - Duration::hours(24));
        assert_eq!(since_days(now(), 1), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(since_days(now(), 7), NaiveDate::from_ymd_opt(2024, 2, 24).unwrap());
    }

    #[tokio::test]
    async fn test_collect_reports_every_configured_city() {
        let settings = test_settings(&[("a", 1), ("b", 1)], 1);
        let store = MemoryStore::new();
        let snapshot = CitySnapshot {
            city_id: "a".into(),
            hour: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            avg_pm25: 20.0,
            min_pm25: 20.0,
            max_pm25: 20.0,
            median_pm25: 20.0,
            avg_pm10: None,
            avg_o3: None,
            avg_no2: None,
            avg_so2: None,
            avg_co: None,
            total_stations: 1,
            valid_stations: 1,
            dominant_pollutant: None,
            quality: "healthy".into(),
        };
        store.upsert_snapshot(&snapshot).await.unwrap();

        let status = collect(&store, &settings, now(), 5).await.unwrap();
        assert_eq!(status.stats.snapshots, 1);
        assert_eq!(status.cities.len(), 2);
        assert_eq!(status.cities[0].freshness, Freshness::Fresh);
        assert_eq!(status.cities[1].freshness, Freshness::Offline);
        assert_eq!(status.cities[1].last_hour, None);
        assert!(status.runs.is_empty());
    }
}
