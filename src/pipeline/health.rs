//! Health metrics derived from an average PM2.5 concentration (µg/m³).

use serde::Serialize;

/// PM2.5 equivalent of one cigarette per day.
const CIGARETTE_PM25: f64 = 22.0;
/// WHO annual guideline.
const WHO_GUIDELINE_PM25: f64 = 5.0;
/// Life expectancy lost per 10 µg/m³ above the guideline, in years.
const YEARS_LOST_PER_10: f64 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub cigarette_equivalent: f64,
    pub years_lost_per_year: f64,
    pub who_violation_factor: f64,
}

impl HealthMetrics {
    pub fn from_pm25(avg_pm25: f64) -> Self {
        Self {
            cigarette_equivalent: avg_pm25 / CIGARETTE_PM25,
            years_lost_per_year: ((avg_pm25 - WHO_GUIDELINE_PM25) / 10.0).max(0.0)
                * YEARS_LOST_PER_10,
            who_violation_factor: avg_pm25 / WHO_GUIDELINE_PM25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        let m = HealthMetrics::from_pm25(25.0);
        assert!((m.cigarette_equivalent - 25.0 / 22.0).abs() < 1e-12);
        assert!((m.years_lost_per_year - 2.0 * 0.98).abs() < 1e-12);
        assert!((m.who_violation_factor - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_years_lost_at_or_below_guideline() {
        for pm in [0.0, 1.0, 4.99, 5.0] {
            assert_eq!(HealthMetrics::from_pm25(pm).years_lost_per_year, 0.0);
        }
        assert!(HealthMetrics::from_pm25(5.01).years_lost_per_year > 0.0);
    }

    #[test]
    fn test_metrics_are_monotonic() {
        let mut previous = HealthMetrics::from_pm25(0.0);
        let mut pm = 0.0;
        while pm <= 600.0 {
            pm += 0.7;
            let current = HealthMetrics::from_pm25(pm);
            assert!(current.cigarette_equivalent >= previous.cigarette_equivalent);
            assert!(current.years_lost_per_year >= previous.years_lost_per_year);
            assert!(current.who_violation_factor >= previous.who_violation_factor);
            previous = current;
        }
    }
}
