//! Recomputes day-level rows from what is already stored.
//!
//! Shared by the ingestion run (after each snapshot write) and by backfill.

use super::aggregate::{daily_aggregate, national_aggregate};
use crate::config::Settings;
use crate::db::Store;
use crate::error::Result;
use crate::models::{DailyAggregate, NationalDailyAggregate};
use chrono::NaiveDate;
use tracing::{debug, warn};

/// Rebuilds the `(city, date)` aggregate from stored snapshots.
///
/// Returns `Ok(None)` without writing when the city has no snapshot that day.
pub async fn refresh_city_day<S: Store + ?Sized>(
    store: &S,
    city_id: &str,
    date: NaiveDate,
) -> Result<Option<DailyAggregate>> {
    let snapshots = store.snapshots_for_day(city_id, date).await?;
    let Some(daily) = daily_aggregate(city_id, date, &snapshots) else {
        debug!("No snapshots for {} on {}; day skipped", city_id, date);
        return Ok(None);
    };
    store.upsert_daily(&daily).await?;
    debug!(
        "Daily aggregate for {} on {}: avg {:.1} over {} hours",
        city_id, date, daily.avg_pm25, daily.hours_with_data
    );
    Ok(Some(daily))
}

/// Rebuilds the nation-day row for `date` from stored city-day rows.
///
/// Rows of cities no longer configured are ignored. Returns `Ok(None)` without writing
/// when no configured city has a row that day.
pub async fn refresh_national<S: Store + ?Sized>(
    store: &S,
    settings: &Settings,
    date: NaiveDate,
) -> Result<Option<NationalDailyAggregate>> {
    let mut dailies = store.daily_for_date(date).await?;
    let before = dailies.len();
    dailies.retain(|d| settings.city(&d.city_id).is_some());
    if dailies.len() < before {
        warn!(
            "Ignoring {} daily rows for unconfigured cities on {}",
            before - dailies.len(),
            date
        );
    }

    let Some(national) = national_aggregate(date, &dailies, |id| settings.population_of(id))
    else {
        debug!("No city-day rows on {}; national skipped", date);
        return Ok(None);
    };
    store.upsert_national(&national).await?;
    Ok(Some(national))
}
