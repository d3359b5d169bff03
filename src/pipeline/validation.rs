//! Turns a raw feed payload into a [`Reading`], collecting issues on the way.
//!
//! Structural problems (non-ok status, missing station object) reject the whole
//! payload. Everything else is judged per field: an error drops that field, a warning
//! or info keeps it and annotates the quality report.

use super::aqi;
use crate::config::ValidationConfig;
use crate::models::{Concentrations, FeedPayload, FeedResponse, Field, Reading, POLLUTANTS};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub field: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn new(field: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            field,
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.field, self.message)
    }
}

/// Outcome of validating one station payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    /// `None` when the payload failed structural checks.
    pub reading: Option<Reading>,
    pub coordinates: Option<(f64, f64)>,
    pub issues: Vec<Issue>,
}

impl Validated {
    fn rejected(issue: Issue) -> Self {
        Self {
            reading: None,
            coordinates: None,
            issues: vec![issue],
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.reading.is_none()
    }

    /// Whether this station contributes to the city's PM2.5 statistics.
    pub fn has_pm25(&self) -> bool {
        self.reading
            .as_ref()
            .map_or(false, |r| r.concentrations.pm25.is_some())
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

pub struct Validator<'a> {
    config: &'a ValidationConfig,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a ValidationConfig) -> Self {
        Self { config }
    }

    /// Validates `feed` for `station_id`. Readings without a usable source timestamp
    /// are keyed by `fallback_time`.
    pub fn validate(
        &self,
        station_id: &str,
        city_id: &str,
        feed: &FeedResponse,
        fallback_time: DateTime<Utc>,
    ) -> Validated {
        if feed.status != "ok" {
            let detail = match &feed.data {
                Some(FeedPayload::Message(m)) => format!(": {}", m),
                _ => String::new(),
            };
            return Validated::rejected(Issue::new(
                "status",
                Severity::Error,
                format!("upstream status '{}'{}", feed.status, detail),
            ));
        }
        let data = match &feed.data {
            Some(FeedPayload::Station(data)) => data,
            Some(FeedPayload::Message(m)) => {
                return Validated::rejected(Issue::new(
                    "data",
                    Severity::Error,
                    format!("expected a station object, got message '{}'", m),
                ))
            },
            Some(FeedPayload::Other(_)) | None => {
                return Validated::rejected(Issue::new(
                    "data",
                    Severity::Error,
                    "no station data in payload",
                ))
            },
        };

        let mut issues = Vec::new();

        let aqi = self.check_index(data.index(), &mut issues);

        let recorded_at = match data.recorded_at() {
            Field::Valid(ts) => ts,
            Field::Absent => {
                issues.push(Issue::new("time", Severity::Warning, "missing timestamp"));
                fallback_time
            },
            Field::Invalid(raw) => {
                issues.push(Issue::new(
                    "time",
                    Severity::Warning,
                    format!("unparseable timestamp '{}'", raw),
                ));
                fallback_time
            },
        };

        let coordinates = match data.coordinates() {
            Field::Valid(c) => Some(c),
            Field::Absent => None,
            Field::Invalid(raw) => {
                issues.push(Issue::new(
                    "geo",
                    Severity::Warning,
                    format!("unusable coordinates {}", raw),
                ));
                None
            },
        };

        let mut concentrations = Concentrations::default();
        let mut reported_pm25 = None;
        for pollutant in POLLUTANTS {
            let field = data.sub_index(pollutant);
            if pollutant == "pm25" {
                reported_pm25 = match &field {
                    Field::Valid(v) => Some(*v),
                    _ => None,
                };
            }
            let value = self.check_sub_index(pollutant, field, &mut issues);
            concentrations.set(pollutant, value);
        }
        if let Some(pm25) = concentrations.pm25 {
            concentrations.pm25 = self.check_pm25(pm25, &mut issues);
        }

        Validated {
            reading: Some(Reading {
                station_id: station_id.to_string(),
                city_id: city_id.to_string(),
                recorded_at,
                concentrations,
                aqi,
                dominant_pollutant: data.dominant_pollutant(),
                reported_pm25,
            }),
            coordinates,
            issues,
        }
    }

    fn check_index(&self, field: Field<f64>, issues: &mut Vec<Issue>) -> Option<i32> {
        match field {
            Field::Valid(v) if v == self.config.index_error_code => {
                issues.push(Issue::new(
                    "aqi",
                    Severity::Error,
                    format!("upstream error code {}", v),
                ));
                None
            },
            Field::Valid(v) if v < 0.0 => {
                issues.push(Issue::new("aqi", Severity::Error, format!("negative index {}", v)));
                None
            },
            Field::Valid(v) => {
                if v > self.config.index_max {
                    issues.push(Issue::new(
                        "aqi",
                        Severity::Warning,
                        format!("index {} above {}", v, self.config.index_max),
                    ));
                }
                Some(v.round() as i32)
            },
            Field::Absent => {
                issues.push(Issue::new("aqi", Severity::Warning, "missing index"));
                None
            },
            Field::Invalid(raw) => {
                issues.push(Issue::new(
                    "aqi",
                    Severity::Warning,
                    format!("non-numeric index '{}'", raw),
                ));
                None
            },
        }
    }

    /// Converts a sub-index to a concentration, dropping error-coded or negative values.
    fn check_sub_index(
        &self,
        pollutant: &'static str,
        field: Field<f64>,
        issues: &mut Vec<Issue>,
    ) -> Option<f64> {
        match field {
            Field::Absent => {
                if pollutant == "pm25" {
                    issues.push(Issue::new(pollutant, Severity::Warning, "no PM2.5 reported"));
                }
                None
            },
            Field::Invalid(raw) => {
                issues.push(Issue::new(
                    pollutant,
                    Severity::Error,
                    format!("non-numeric sub-index '{}'", raw),
                ));
                None
            },
            Field::Valid(v) if v == self.config.index_error_code => {
                issues.push(Issue::new(
                    pollutant,
                    Severity::Error,
                    format!("upstream error code {}", v),
                ));
                None
            },
            Field::Valid(v) if v < 0.0 => {
                issues.push(Issue::new(
                    pollutant,
                    Severity::Error,
                    format!("negative sub-index {}", v),
                ));
                None
            },
            Field::Valid(v) => aqi::to_concentration(pollutant, v),
        }
    }

    /// Applies the PM2.5 concentration bounds.
    fn check_pm25(&self, pm25: f64, issues: &mut Vec<Issue>) -> Option<f64> {
        let c = self.config;
        if pm25 > c.pm25_impossible_max {
            issues.push(Issue::new(
                "pm25",
                Severity::Error,
                format!("{:.1} µg/m³ exceeds physical ceiling {}", pm25, c.pm25_impossible_max),
            ));
            return None;
        }
        if pm25 > c.pm25_reasonable_max {
            issues.push(Issue::new(
                "pm25",
                Severity::Warning,
                format!("{:.1} µg/m³ above {}", pm25, c.pm25_reasonable_max),
            ));
        } else if pm25 > 0.0 && pm25 < c.pm25_typical_min {
            issues.push(Issue::new(
                "pm25",
                Severity::Info,
                format!("{:.2} µg/m³ is suspiciously low", pm25),
            ));
        }
        Some(pm25)
    }
}
