//! Recomputes city-day and nation-day rows over a date range from stored snapshots.
//!
//! Nothing is re-fetched. Each date is independent: an empty date is skipped, a failing
//! date is counted and the walk moves on.

use super::rollup::{refresh_city_day, refresh_national};
use crate::config::{CityConfig, Settings};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::NationalDailyAggregate;
use chrono::NaiveDate;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub enum DateOutcome {
    Processed(NationalDailyAggregate),
    /// No configured city had data that day; nothing written.
    Skipped,
    Errored(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub city_days_written: usize,
    pub city_days_skipped: usize,
    pub city_days_errored: usize,
}

pub struct Backfill<'a, S: Store> {
    settings: &'a Settings,
    store: &'a S,
}

impl<'a, S: Store> Backfill<'a, S> {
    pub fn new(settings: &'a Settings, store: &'a S) -> Self {
        Self { settings, store }
    }

    /// Walks `from..=to`, optionally limited to one city, reporting each date to
    /// `on_date` as it completes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cli` for a reversed range or an unknown city. Per-date failures
    /// never surface here; they are counted in the report.
    pub async fn run<F>(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        city: Option<&str>,
        mut on_date: F,
    ) -> Result<BackfillReport>
    where
        F: FnMut(NaiveDate, &DateOutcome),
    {
        if from > to {
            return Err(AppError::Cli(format!(
                "backfill range is reversed: {} is after {}",
                from, to
            )));
        }
        let cities: Vec<&CityConfig> = match city {
            Some(id) => vec![self
                .settings
                .city(id)
                .ok_or_else(|| AppError::Cli(format!("unknown city '{}'", id)))?],
            None => self.settings.cities.iter().collect(),
        };

        info!(
            "Backfilling {} to {} for {} cities",
            from,
            to,
            cities.len()
        );

        let mut report = BackfillReport::default();
        for date in from.iter_days().take_while(|d| *d <= to) {
            let mut failures = Vec::new();
            for city in &cities {
                match refresh_city_day(self.store, &city.id, date).await {
                    Ok(Some(_)) => report.city_days_written += 1,
                    Ok(None) => report.city_days_skipped += 1,
                    Err(e) => {
                        error!("Backfill of {} on {} failed: {}", city.id, date, e);
                        report.city_days_errored += 1;
                        failures.push(format!("{}: {}", city.id, e));
                    },
                }
            }

            let outcome = match refresh_national(self.store, self.settings, date).await {
                Ok(_) if !failures.is_empty() => DateOutcome::Errored(failures.join("; ")),
                Ok(Some(national)) => DateOutcome::Processed(national),
                Ok(None) => DateOutcome::Skipped,
                Err(e) => {
                    error!("National rollup for {} failed: {}", date, e);
                    failures.push(format!("national: {}", e));
                    DateOutcome::Errored(failures.join("; "))
                },
            };
            match outcome {
                DateOutcome::Processed(_) => report.processed += 1,
                DateOutcome::Skipped => report.skipped += 1,
                DateOutcome::Errored(_) => report.errored += 1,
            }
            on_date(date, &outcome);
        }

        info!(
            "Backfill done: {} processed, {} skipped, {} errored",
            report.processed, report.skipped, report.errored
        );
        Ok(report)
    }
}
