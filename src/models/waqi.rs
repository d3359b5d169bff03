//! Data structures for the upstream station feed (`/feed/{station}/`).
//!
//! The feed is loosely typed: `data` is an object on success and a message string on
//! failure, the index may be a number, a numeric string, the placeholder `"-"` or the
//! error code `999`, and every nested block is optional. The raw shapes are kept lenient
//! here and interpreted through [`Field`] so validation can match every case explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Top-level envelope of a feed response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<FeedPayload>,
}

/// The `data` member: a station object, an error message, or something unexpected.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FeedPayload {
    Station(Box<StationData>),
    Message(String),
    Other(Value),
}

/// Station measurement block.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StationData {
    #[serde(default)]
    pub aqi: Option<Value>,
    #[serde(default)]
    pub idx: Option<i64>,
    /// Dominant pollutant (the upstream spelling is kept on the wire).
    #[serde(default)]
    pub dominentpol: Option<String>,
    #[serde(default)]
    pub time: Option<FeedTime>,
    #[serde(default)]
    pub iaqi: BTreeMap<String, SubIndex>,
    #[serde(default)]
    pub city: Option<FeedCity>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeedTime {
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
    #[serde(default)]
    pub iso: Option<String>,
}

/// One pollutant sub-index, `{ "v": 57 }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubIndex {
    pub v: Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeedCity {
    #[serde(default)]
    pub name: Option<String>,
    /// `[latitude, longitude]`
    #[serde(default)]
    pub geo: Option<Vec<Value>>,
}

/// A feed value after interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    /// Present and well-formed.
    Valid(T),
    /// Present but unusable; carries the raw text for the quality report.
    Invalid(String),
    /// Missing, `null`, or the upstream "no data" marker.
    Absent,
}

impl<T> Field<T> {
    pub fn valid(self) -> Option<T> {
        match self {
            Field::Valid(v) => Some(v),
            _ => None,
        }
    }
}

/// Interprets a numeric feed value. `"-"` and empty strings mean no data.
fn numeric_field(value: Option<&Value>) -> Field<f64> {
    match value {
        None | Some(Value::Null) => Field::Absent,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Field::Valid(v),
            _ => Field::Invalid(n.to_string()),
        },
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "-" {
                Field::Absent
            } else {
                match trimmed.parse::<f64>() {
                    Ok(v) if v.is_finite() => Field::Valid(v),
                    _ => Field::Invalid(s.clone()),
                }
            }
        },
        Some(other) => Field::Invalid(other.to_string()),
    }
}

impl StationData {
    /// Overall index value as reported.
    pub fn index(&self) -> Field<f64> {
        numeric_field(self.aqi.as_ref())
    }

    /// Sub-index for `pollutant` (`pm25`, `pm10`, `o3`, `no2`, `so2`, `co`).
    pub fn sub_index(&self, pollutant: &str) -> Field<f64> {
        numeric_field(self.iaqi.get(pollutant).map(|s| &s.v))
    }

    /// Source timestamp from `time.iso`.
    pub fn recorded_at(&self) -> Field<DateTime<Utc>> {
        match self.time.as_ref().and_then(|t| t.iso.as_deref()) {
            None => Field::Absent,
            Some(iso) if iso.trim().is_empty() => Field::Absent,
            Some(iso) => match DateTime::parse_from_rfc3339(iso.trim()) {
                Ok(ts) => Field::Valid(ts.with_timezone(&Utc)),
                Err(_) => Field::Invalid(iso.to_string()),
            },
        }
    }

    /// `(latitude, longitude)` from `city.geo`.
    pub fn coordinates(&self) -> Field<(f64, f64)> {
        let geo = match self.city.as_ref().and_then(|c| c.geo.as_ref()) {
            None => return Field::Absent,
            Some(geo) if geo.is_empty() => return Field::Absent,
            Some(geo) => geo,
        };
        if geo.len() != 2 {
            return Field::Invalid(format!("{:?}", geo));
        }
        match (numeric_field(geo.first()), numeric_field(geo.get(1))) {
            (Field::Valid(lat), Field::Valid(lon))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
            {
                Field::Valid((lat, lon))
            },
            _ => Field::Invalid(format!("{:?}", geo)),
        }
    }

    pub fn dominant_pollutant(&self) -> Option<String> {
        self.dominentpol
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> FeedResponse {
        serde_json::from_value(body).expect("feed envelope should deserialize")
    }

    #[test]
    fn test_ok_payload_fields() {
        let resp = parse(json!({
            "status": "ok",
            "data": {
                "aqi": 57,
                "idx": 1937,
                "dominentpol": "PM25",
                "time": {"s": "2024-03-01 14:00:00", "tz": "+07:00", "iso": "2024-03-01T14:00:00+07:00"},
                "iaqi": {"pm25": {"v": 57}, "pm10": {"v": "21"}, "o3": {"v": "-"}},
                "city": {"name": "Din Daeng, Bangkok", "geo": [13.76, 100.55]},
                "forecast": {"daily": {"pm25": [{"avg": 60, "day": "2024-03-01", "max": 70, "min": 50}]}}
            }
        }));
        let data = match resp.data {
            Some(FeedPayload::Station(data)) => data,
            other => panic!("expected station payload, got {:?}", other),
        };
        assert_eq!(data.index(), Field::Valid(57.0));
        assert_eq!(data.sub_index("pm25"), Field::Valid(57.0));
        assert_eq!(data.sub_index("pm10"), Field::Valid(21.0));
        assert_eq!(data.sub_index("o3"), Field::Absent);
        assert_eq!(data.sub_index("co"), Field::Absent);
        assert_eq!(data.coordinates(), Field::Valid((13.76, 100.55)));
        assert_eq!(data.dominant_pollutant().as_deref(), Some("pm25"));
        let ts = data.recorded_at().valid().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T07:00:00+00:00");
    }

    #[test]
    fn test_error_payload_is_message() {
        let resp = parse(json!({"status": "error", "data": "Unknown station"}));
        assert!(matches!(resp.data, Some(FeedPayload::Message(ref m)) if m == "Unknown station"));
    }

    #[test]
    fn test_placeholder_and_garbage_index() {
        let dash: StationData = serde_json::from_value(json!({"aqi": "-"})).unwrap();
        assert_eq!(dash.index(), Field::Absent);

        let garbage: StationData = serde_json::from_value(json!({"aqi": "n/a"})).unwrap();
        assert_eq!(garbage.index(), Field::Invalid("n/a".to_string()));

        let missing: StationData = serde_json::from_value(json!({})).unwrap();
        assert_eq!(missing.index(), Field::Absent);
        assert_eq!(missing.recorded_at(), Field::Absent);
        assert_eq!(missing.coordinates(), Field::Absent);
    }

    #[test]
    fn test_bad_time_and_geo_are_invalid() {
        let data: StationData = serde_json::from_value(json!({
            "time": {"iso": "yesterday"},
            "city": {"geo": [200.0, 10.0]}
        }))
        .unwrap();
        assert!(matches!(data.recorded_at(), Field::Invalid(_)));
        assert!(matches!(data.coordinates(), Field::Invalid(_)));
    }
}
