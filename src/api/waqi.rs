//! Provides a client for the station feed API (`/feed/{station}/`).
//!
//! Each station is one GET authenticated with a `token` query parameter. Failures are
//! classified per attempt and fed through the [`RetryPolicy`] state machine; a station
//! that still fails is reported back to the caller as "no data this round".

use super::batch::BatchScheduler;
use super::retry::{AttemptFailure, FetchError, RetryPolicy, RetryState};
use crate::config::FetchConfig;
use crate::models::FeedResponse;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Result of fetching a set of stations: whatever succeeded, plus typed failures.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub payloads: BTreeMap<String, FeedResponse>,
    pub failures: BTreeMap<String, FetchError>,
}

/// An asynchronous client for the station feed.
#[derive(Debug, Clone)]
pub struct WaqiClient {
    client: Client,
    token: String,
    base_url: String,
    policy: RetryPolicy,
}

impl WaqiClient {
    /// Creates a client for `base_url` using the retry and timeout settings in `config`.
    pub fn new(token: String, base_url: &str, config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;

        Ok(Self {
            client,
            token,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy: RetryPolicy::from_config(config),
        })
    }

    /// Fetches one station, retrying per the policy.
    pub async fn fetch_station(&self, station_id: &str) -> Result<FeedResponse, FetchError> {
        let mut state: RetryState<FeedResponse> = RetryState::Attempting { attempt: 0 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => match self.attempt(station_id).await {
                    Ok(feed) => RetryState::Succeeded {
                        attempts: attempt + 1,
                        value: feed,
                    },
                    Err(failure) => {
                        debug!(
                            "Attempt {} for station {} failed: {}",
                            attempt + 1,
                            station_id,
                            failure
                        );
                        self.policy
                            .after_failure(station_id, attempt, &failure, rand::random::<f64>())
                    },
                },
                RetryState::BackingOff { attempt, delay } => {
                    debug!(
                        "Backing off {:?} before attempt {} for station {}",
                        delay,
                        attempt + 1,
                        station_id
                    );
                    sleep(delay).await;
                    RetryState::Attempting { attempt }
                },
                RetryState::RateLimited { attempt, wait } => {
                    warn!(
                        "Rate limited on station {}; waiting {:?} as instructed",
                        station_id, wait
                    );
                    sleep(wait).await;
                    RetryState::Attempting { attempt }
                },
                RetryState::Succeeded { attempts, value } => {
                    if attempts > 1 {
                        info!("Station {} succeeded after {} attempts", station_id, attempts);
                    }
                    return Ok(value);
                },
                RetryState::Rejected(err) | RetryState::Exhausted(err) => {
                    warn!("Giving up on station {}: {}", station_id, err);
                    return Err(err);
                },
            };
        }
    }

    /// Fetches every station in `station_ids` through `scheduler`.
    pub async fn fetch_stations(
        &self,
        station_ids: &[String],
        scheduler: &BatchScheduler,
    ) -> FetchBatch {
        let results = scheduler
            .run(station_ids, |id| async move { self.fetch_station(&id).await })
            .await;

        let mut batch = FetchBatch::default();
        for (id, result) in results {
            match result {
                Ok(feed) => {
                    batch.payloads.insert(id, feed);
                },
                Err(err) => {
                    batch.failures.insert(id, err);
                },
            }
        }
        debug!(
            "Fetched {} of {} stations ({} failed)",
            batch.payloads.len(),
            station_ids.len(),
            batch.failures.len()
        );
        batch
    }

    /// One HTTP round trip, classified.
    async fn attempt(&self, station_id: &str) -> Result<FeedResponse, AttemptFailure> {
        let url = format!("{}/feed/{}/", self.base_url, station_id);

        let response = self
            .client
            .get(&url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| AttemptFailure::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptFailure::RateLimited {
                retry_after: retry_after(&response),
            });
        }
        if status.is_server_error() {
            return Err(AttemptFailure::Server {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!("Received {} for station {}. Check WAQI_TOKEN validity.", status, station_id);
            }
            return Err(AttemptFailure::Client {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::Network(e.to_string()))?;
        serde_json::from_str::<FeedResponse>(&body).map_err(|e| AttemptFailure::Decode(e.to_string()))
    }
}

/// Seconds from a `Retry-After` header; HTTP-date forms are ignored.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
