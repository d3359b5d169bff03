use crate::api::{BatchScheduler, FetchError, WaqiClient};
use crate::config::tests::test_settings;
use crate::config::FetchConfig;
use crate::models::FeedPayload;
use mockito::{Matcher, Server};
use serde_json::json;
use std::time::Duration;

const TOKEN: &str = "test_key";

fn fast_fetch_config() -> FetchConfig {
    test_settings(&[("bkk", 1)], 1).fetch
}

fn ok_body(aqi: i64) -> String {
    json!({
        "status": "ok",
        "data": {
            "aqi": aqi,
            "dominentpol": "pm25",
            "time": {"iso": "2024-03-01T14:00:00+07:00"},
            "iaqi": {"pm25": {"v": aqi}}
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_fetch_station_success() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed/A100/")
        .match_query(Matcher::UrlEncoded("token".into(), TOKEN.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(ok_body(57))
        .expect(1)
        .create_async()
        .await;

    let client = WaqiClient::new(TOKEN.into(), &server.url(), &fast_fetch_config()).unwrap();
    let feed = client.fetch_station("A100").await.expect("fetch should succeed");

    assert_eq!(feed.status, "ok");
    assert!(matches!(feed.data, Some(FeedPayload::Station(_))));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed/A404/")
        .match_query(Matcher::Any)
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let client = WaqiClient::new(TOKEN.into(), &server.url(), &fast_fetch_config()).unwrap();
    let err = client.fetch_station("A404").await.unwrap_err();

    assert_eq!(
        err,
        FetchError::ClientError {
            station: "A404".into(),
            status: 404
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_error_exhausts_retry_budget() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed/A500/")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let client = WaqiClient::new(TOKEN.into(), &server.url(), &fast_fetch_config()).unwrap();
    match client.fetch_station("A500").await {
        Err(FetchError::Exhausted { attempts, last, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last, "HTTP 503");
        },
        other => panic!("expected exhausted failure, got {:?}", other),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_is_retried_then_reported() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed/A429/")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "0")
        .expect(3)
        .create_async()
        .await;

    let client = WaqiClient::new(TOKEN.into(), &server.url(), &fast_fetch_config()).unwrap();
    let err = client.fetch_station("A429").await.unwrap_err();

    assert_eq!(
        err,
        FetchError::RateLimited {
            station: "A429".into(),
            attempts: 3
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_malformed_body_is_a_decode_failure() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed/A200/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("<html>maintenance</html>")
        .expect(1)
        .create_async()
        .await;

    let client = WaqiClient::new(TOKEN.into(), &server.url(), &fast_fetch_config()).unwrap();
    let err = client.fetch_station("A200").await.unwrap_err();

    assert!(matches!(err, FetchError::Decode { ref station, .. } if station == "A200"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_host_exhausts() {
    let mut config = fast_fetch_config();
    config.timeout_ms = 500;
    // Bind an ephemeral port, then release it so nothing is listening there.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let client = WaqiClient::new(TOKEN.into(), &format!("http://{}", addr), &config).unwrap();

    let started = std::time::Instant::now();
    let err = client.fetch_station("A1").await.unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_fetch_stations_returns_partial_map() {
    let mut server = Server::new_async().await;
    let _ok = server
        .mock("GET", "/feed/A1/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(ok_body(40))
        .create_async()
        .await;
    let _missing = server
        .mock("GET", "/feed/A2/")
        .match_query(Matcher::Any)
        .with_status(403)
        .create_async()
        .await;
    let _error_status = server
        .mock("GET", "/feed/A3/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"status": "error", "data": "Unknown station"}).to_string())
        .create_async()
        .await;

    let config = fast_fetch_config();
    let client = WaqiClient::new(TOKEN.into(), &server.url(), &config).unwrap();
    let scheduler = BatchScheduler::from_config(&config);
    let ids: Vec<String> = vec!["A1".into(), "A2".into(), "A3".into()];

    let batch = client.fetch_stations(&ids, &scheduler).await;

    // A non-ok envelope is still a parsed payload; validation rejects it later.
    assert_eq!(batch.payloads.len(), 2);
    assert!(batch.payloads.contains_key("A1"));
    assert_eq!(batch.payloads["A3"].status, "error");
    assert!(matches!(
        batch.failures.get("A2"),
        Some(FetchError::ClientError { status: 403, .. })
    ));
}
