//! The three rollup levels: station readings to a city-hour snapshot, snapshots to a
//! city-day aggregate, and city-days to a nation-day aggregate.
//!
//! These functions are pure; the store-facing wrappers live in [`super::rollup`].

use super::health::HealthMetrics;
use crate::config::AggregationConfig;
use crate::models::{
    CitySnapshot, DailyAggregate, NationalDailyAggregate, Reading, SnapshotQuality,
};
use chrono::{DateTime, NaiveDate, Timelike, Utc};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Two-case median: the middle value, or the mean of the two middle values.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

fn min_of(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(f64::INFINITY, f64::min)
}

fn max_of(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(f64::NEG_INFINITY, f64::max)
}

/// Most frequent label; ties go to the label seen first.
fn mode<'a>(labels: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for label in labels {
        match counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, n)) => *n += 1,
            None => counts.push((label, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (label, n) in counts {
        if best.map_or(true, |(_, b)| n > b) {
            best = Some((label, n));
        }
    }
    best.map(|(l, _)| l.to_string())
}

/// Mean of the positive, present values of one pollutant.
fn pollutant_mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let present: Vec<f64> = values.flatten().filter(|v| *v > 0.0).collect();
    mean(&present)
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Builds the `(city, hour)` snapshot from one round of readings.
///
/// Only readings with a PM2.5 value count. Returns `None` when there are none, in which
/// case nothing is written for that city and hour.
pub fn city_snapshot(
    city_id: &str,
    hour: DateTime<Utc>,
    readings: &[Reading],
    total_stations: usize,
    config: &AggregationConfig,
) -> Option<CitySnapshot> {
    let valid: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.concentrations.pm25.is_some())
        .collect();
    let pm25: Vec<f64> = valid.iter().filter_map(|r| r.concentrations.pm25).collect();

    let avg_pm25 = mean(&pm25)?;
    let median_pm25 = median(&pm25)?;

    let valid_stations = valid.len();
    let total_stations = total_stations.max(valid_stations);
    let ratio = valid_stations as f64 / total_stations as f64;
    let quality = if ratio >= config.quality_threshold {
        SnapshotQuality::Healthy
    } else {
        SnapshotQuality::Degraded
    };

    let avg =
        |pollutant: &str| pollutant_mean(valid.iter().map(|r| r.concentrations.get(pollutant)));

    Some(CitySnapshot {
        city_id: city_id.to_string(),
        hour: truncate_to_hour(hour),
        avg_pm25,
        min_pm25: min_of(pm25.iter().copied()),
        max_pm25: max_of(pm25.iter().copied()),
        median_pm25,
        avg_pm10: avg("pm10"),
        avg_o3: avg("o3"),
        avg_no2: avg("no2"),
        avg_so2: avg("so2"),
        avg_co: avg("co"),
        total_stations: total_stations as i32,
        valid_stations: valid_stations as i32,
        dominant_pollutant: mode(valid.iter().filter_map(|r| r.dominant_pollutant.as_deref())),
        quality: quality.as_str().to_string(),
    })
}

/// Rolls a city's snapshots for `date` into a daily aggregate.
///
/// The average is a mean of hourly means so every hour weighs the same regardless of how
/// many stations reported in it. Snapshots outside `date` are ignored.
pub fn daily_aggregate(
    city_id: &str,
    date: NaiveDate,
    snapshots: &[CitySnapshot],
) -> Option<DailyAggregate> {
    let mut day: Vec<&CitySnapshot> = snapshots
        .iter()
        .filter(|s| s.city_id == city_id && s.hour.date_naive() == date)
        .collect();
    day.sort_by_key(|s| s.hour);

    let averages: Vec<f64> = day.iter().map(|s| s.avg_pm25).collect();
    let avg_pm25 = mean(&averages)?;

    let mut peak = day[0];
    for &s in &day[1..] {
        if s.avg_pm25 > peak.avg_pm25 {
            peak = s;
        }
    }

    let health = HealthMetrics::from_pm25(avg_pm25);
    let avg_of = |f: fn(&CitySnapshot) -> Option<f64>| {
        let present: Vec<f64> = day.iter().filter_map(|s| f(*s)).collect();
        mean(&present)
    };

    Some(DailyAggregate {
        city_id: city_id.to_string(),
        date,
        avg_pm25,
        min_pm25: min_of(day.iter().map(|s| s.min_pm25)),
        max_pm25: max_of(day.iter().map(|s| s.max_pm25)),
        peak_hour: peak.hour.hour() as i32,
        peak_pm25: peak.avg_pm25,
        avg_pm10: avg_of(|s: &CitySnapshot| s.avg_pm10),
        avg_o3: avg_of(|s: &CitySnapshot| s.avg_o3),
        avg_no2: avg_of(|s: &CitySnapshot| s.avg_no2),
        avg_so2: avg_of(|s: &CitySnapshot| s.avg_so2),
        avg_co: avg_of(|s: &CitySnapshot| s.avg_co),
        cigarette_equivalent: health.cigarette_equivalent,
        years_lost_per_year: health.years_lost_per_year,
        who_violation_factor: health.who_violation_factor,
        hours_with_data: day.len().min(24) as i32,
    })
}

/// Rolls the cities' daily aggregates for `date` into the nation-day row.
///
/// `population` maps a city id to its weight; a zero total falls back to the simple
/// average. Best and worst city ties keep the first city in `dailies` order.
pub fn national_aggregate(
    date: NaiveDate,
    dailies: &[DailyAggregate],
    population: impl Fn(&str) -> i64,
) -> Option<NationalDailyAggregate> {
    let day: Vec<&DailyAggregate> = dailies.iter().filter(|d| d.date == date).collect();
    let averages: Vec<f64> = day.iter().map(|d| d.avg_pm25).collect();
    let avg_pm25 = mean(&averages)?;

    let populations: Vec<i64> = day.iter().map(|d| population(&d.city_id).max(0)).collect();
    let population_covered: i64 = populations.iter().sum();
    let weighted_avg_pm25 = if population_covered > 0 {
        day.iter()
            .zip(&populations)
            .map(|(d, p)| d.avg_pm25 * *p as f64)
            .sum::<f64>()
            / population_covered as f64
    } else {
        avg_pm25
    };

    let mut best = day[0];
    let mut worst = day[0];
    for &d in &day[1..] {
        if d.avg_pm25 < best.avg_pm25 {
            best = d;
        }
        if d.avg_pm25 > worst.avg_pm25 {
            worst = d;
        }
    }

    let health = HealthMetrics::from_pm25(weighted_avg_pm25);
    Some(NationalDailyAggregate {
        date,
        avg_pm25,
        weighted_avg_pm25,
        min_pm25: min_of(day.iter().map(|d| d.min_pm25)),
        max_pm25: max_of(day.iter().map(|d| d.max_pm25)),
        best_city_id: best.city_id.clone(),
        worst_city_id: worst.city_id.clone(),
        cities_reporting: day.len() as i32,
        population_covered,
        cigarette_equivalent: health.cigarette_equivalent,
        years_lost_per_year: health.years_lost_per_year,
        who_violation_factor: health.who_violation_factor,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Concentrations;
    use chrono::TimeZone;

    pub(crate) fn reading(station: &str, pm25: Option<f64>, dominant: Option<&str>) -> Reading {
        Reading {
            station_id: station.to_string(),
            city_id: "bkk".to_string(),
            recorded_at: Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap(),
            concentrations: Concentrations {
                pm25,
                ..Default::default()
            },
            aqi: None,
            dominant_pollutant: dominant.map(str::to_string),
            reported_pm25: pm25,
        }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn snapshot(h: u32, avg: f64, min: f64, max: f64) -> CitySnapshot {
        let readings = vec![reading("s", Some(avg), Some("pm25"))];
        let mut s = city_snapshot("bkk", hour(h), &readings, 1, &AggregationConfig::default())
            .unwrap();
        s.min_pm25 = min;
        s.max_pm25 = max;
        s
    }

    fn daily(city: &str, avg: f64, min: f64, max: f64) -> DailyAggregate {
        let mut d = daily_aggregate("bkk", date(), &[snapshot(0, avg, min, max)]).unwrap();
        d.city_id = city.to_string();
        d
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[10.0, 20.0, 30.0, 40.0]), Some(25.0));
        assert_eq!(median(&[30.0, 10.0, 20.0]), Some(20.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_mode_ties_keep_first_seen() {
        let labels = ["o3", "pm25", "pm25", "o3", "pm10"];
        assert_eq!(mode(labels.iter().copied()).as_deref(), Some("o3"));
        assert_eq!(mode(std::iter::empty()), None);
    }

    #[test]
    fn test_snapshot_statistics() {
        let mut readings = vec![
            reading("a", Some(10.0), Some("pm25")),
            reading("b", Some(20.0), Some("pm10")),
            reading("c", Some(30.0), Some("pm25")),
            reading("d", Some(40.0), Some("o3")),
            reading("e", None, Some("o3")),
        ];
        readings[0].concentrations.pm10 = Some(50.0);
        readings[1].concentrations.pm10 = Some(0.0);
        readings[2].concentrations.pm10 = Some(70.0);
        // ignored: no PM2.5
        readings[4].concentrations.pm10 = Some(500.0);

        let s = city_snapshot("bkk", hour(7), &readings, 5, &AggregationConfig::default()).unwrap();
        assert_eq!(s.avg_pm25, 25.0);
        assert_eq!(s.median_pm25, 25.0);
        assert_eq!(s.min_pm25, 10.0);
        assert_eq!(s.max_pm25, 40.0);
        assert_eq!(s.avg_pm10, Some(60.0));
        assert_eq!(s.avg_co, None);
        assert_eq!(s.valid_stations, 4);
        assert_eq!(s.total_stations, 5);
        assert_eq!(s.dominant_pollutant.as_deref(), Some("pm25"));
        assert_eq!(s.quality, "healthy");
    }

    #[test]
    fn test_three_of_ten_is_degraded() {
        let mut readings: Vec<Reading> = (0..3)
            .map(|i| reading(&format!("s{}", i), Some(15.0), None))
            .collect();
        readings.extend((3..10).map(|i| reading(&format!("s{}", i), None, None)));

        let s = city_snapshot("bkk", hour(7), &readings, 10, &AggregationConfig::default()).unwrap();
        assert_eq!(s.valid_stations, 3);
        assert_eq!(s.total_stations, 10);
        assert_eq!(s.quality, "degraded");
        assert_eq!(s.dominant_pollutant, None);
    }

    #[test]
    fn test_snapshot_skipped_without_pm25() {
        let readings = vec![reading("a", None, Some("o3"))];
        assert!(city_snapshot("bkk", hour(7), &readings, 1, &AggregationConfig::default()).is_none());
        assert!(city_snapshot("bkk", hour(7), &[], 3, &AggregationConfig::default()).is_none());
    }

    #[test]
    fn test_zero_reading_counts_toward_average() {
        let readings = vec![reading("a", Some(0.0), None), reading("b", Some(20.0), None)];
        let s = city_snapshot("bkk", hour(7), &readings, 2, &AggregationConfig::default()).unwrap();
        assert_eq!(s.avg_pm25, 10.0);
        assert_eq!(s.min_pm25, 0.0);
    }

    #[test]
    fn test_daily_is_mean_of_means_with_first_peak() {
        let snapshots = vec![
            snapshot(3, 40.0, 35.0, 60.0),
            snapshot(1, 10.0, 5.0, 12.0),
            snapshot(2, 40.0, 30.0, 45.0),
        ];
        let d = daily_aggregate("bkk", date(), &snapshots).unwrap();
        assert_eq!(d.avg_pm25, 30.0);
        assert_eq!(d.min_pm25, 5.0);
        assert_eq!(d.max_pm25, 60.0);
        assert_eq!(d.peak_hour, 2);
        assert_eq!(d.peak_pm25, 40.0);
        assert_eq!(d.hours_with_data, 3);
        assert_eq!(d.who_violation_factor, 6.0);
    }

    #[test]
    fn test_daily_ignores_other_dates_and_skips_empty() {
        let mut other_day = snapshot(5, 90.0, 90.0, 90.0);
        other_day.hour = Utc.with_ymd_and_hms(2024, 3, 2, 5, 0, 0).unwrap();
        assert!(daily_aggregate("bkk", date(), &[other_day.clone()]).is_none());

        let d = daily_aggregate("bkk", date(), &[other_day, snapshot(4, 20.0, 20.0, 20.0)]).unwrap();
        assert_eq!(d.hours_with_data, 1);
        assert_eq!(d.avg_pm25, 20.0);
    }

    #[test]
    fn test_national_weighted_average() {
        let dailies = vec![daily("a", 10.0, 8.0, 12.0), daily("b", 30.0, 25.0, 50.0)];
        let n = national_aggregate(date(), &dailies, |id| if id == "a" { 2 } else { 1 }).unwrap();
        assert_eq!(n.avg_pm25, 20.0);
        assert!((n.weighted_avg_pm25 - 16.666_666).abs() < 1e-3);
        assert_eq!(n.min_pm25, 8.0);
        assert_eq!(n.max_pm25, 50.0);
        assert_eq!(n.best_city_id, "a");
        assert_eq!(n.worst_city_id, "b");
        assert_eq!(n.cities_reporting, 2);
        assert_eq!(n.population_covered, 3);
        assert!((n.who_violation_factor - n.weighted_avg_pm25 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_national_zero_population_falls_back_and_ties_keep_first() {
        let dailies = vec![
            daily("a", 20.0, 20.0, 20.0),
            daily("b", 20.0, 20.0, 20.0),
            daily("c", 20.0, 20.0, 20.0),
        ];
        let n = national_aggregate(date(), &dailies, |_| 0).unwrap();
        assert_eq!(n.weighted_avg_pm25, 20.0);
        assert_eq!(n.best_city_id, "a");
        assert_eq!(n.worst_city_id, "a");
        assert!(national_aggregate(date(), &[], |_| 1).is_none());
    }
}
