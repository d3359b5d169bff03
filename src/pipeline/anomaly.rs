//! Cross-checks sibling stations of one city for outliers and implausible values.
//!
//! Anomalies are advisory. They annotate the quality report and never remove a reading
//! from aggregation.

use super::aggregate::median;
use crate::config::AnomalyConfig;
use crate::models::Reading;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    HighOutlier,
    LowOutlier,
    /// Sensors practically never read exactly zero.
    ZeroValue,
    /// Round hundreds above the floor are typical stuck or filler values.
    PlaceholderValue,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HighOutlier => "high_outlier",
            AnomalyKind::LowOutlier => "low_outlier",
            AnomalyKind::ZeroValue => "zero_value",
            AnomalyKind::PlaceholderValue => "placeholder_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub station_id: String,
    pub kind: AnomalyKind,
    pub value: f64,
    /// City median the value was compared against, for outliers.
    pub median: Option<f64>,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (value {:.1}", self.station_id, self.kind.as_str(), self.value)?;
        if let Some(m) = self.median {
            write!(f, ", median {:.1}", m)?;
        }
        f.write_str(")")
    }
}

pub struct AnomalyDetector<'a> {
    config: &'a AnomalyConfig,
}

impl<'a> AnomalyDetector<'a> {
    pub fn new(config: &'a AnomalyConfig) -> Self {
        Self { config }
    }

    /// Returns every anomaly among `readings`, in reading order.
    pub fn detect(&self, readings: &[Reading]) -> Vec<Anomaly> {
        let values: Vec<(&str, f64)> = readings
            .iter()
            .filter_map(|r| r.concentrations.pm25.map(|v| (r.station_id.as_str(), v)))
            .collect();

        let city_median = if values.len() >= self.config.min_stations {
            let pm25: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
            median(&pm25).filter(|m| *m > 0.0)
        } else {
            None
        };

        let mut anomalies = Vec::new();
        for reading in readings {
            let Some(pm25) = reading.concentrations.pm25 else {
                continue;
            };
            let reported = reading.reported_pm25.unwrap_or(pm25);
            let mut flag = |kind, value, median| {
                anomalies.push(Anomaly {
                    station_id: reading.station_id.clone(),
                    kind,
                    value,
                    median,
                })
            };

            if let Some(m) = city_median {
                if pm25 > m * self.config.high_ratio {
                    flag(AnomalyKind::HighOutlier, pm25, Some(m));
                } else if m > self.config.notable_median && pm25 < m * self.config.low_ratio {
                    flag(AnomalyKind::LowOutlier, pm25, Some(m));
                }
            }
            if reported == 0.0 {
                flag(AnomalyKind::ZeroValue, reported, None);
            }
            if reported > self.config.placeholder_floor && reported % 100.0 == 0.0 {
                flag(AnomalyKind::PlaceholderValue, reported, None);
            }
        }
        anomalies
    }
}
