//! Sub-index to concentration conversion.
//!
//! The feed reports every pollutant as a 0-500 sub-index. Concentrations are recovered by
//! inverting the US EPA piecewise-linear breakpoint tables. Indices past the last
//! breakpoint are extrapolated along the top segment.

/// `(index_lo, index_hi, conc_lo, conc_hi)`
type Breakpoint = (f64, f64, f64, f64);

/// µg/m³, 24-hour.
const PM25: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 12.0),
    (51.0, 100.0, 12.1, 35.4),
    (101.0, 150.0, 35.5, 55.4),
    (151.0, 200.0, 55.5, 150.4),
    (201.0, 300.0, 150.5, 250.4),
    (301.0, 400.0, 250.5, 350.4),
    (401.0, 500.0, 350.5, 500.4),
];

/// µg/m³, 24-hour.
const PM10: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 54.0),
    (51.0, 100.0, 55.0, 154.0),
    (101.0, 150.0, 155.0, 254.0),
    (151.0, 200.0, 255.0, 354.0),
    (201.0, 300.0, 355.0, 424.0),
    (301.0, 400.0, 425.0, 504.0),
    (401.0, 500.0, 505.0, 604.0),
];

/// ppb; 8-hour table up to 300, 1-hour table above.
const O3: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 54.0),
    (51.0, 100.0, 55.0, 70.0),
    (101.0, 150.0, 71.0, 85.0),
    (151.0, 200.0, 86.0, 105.0),
    (201.0, 300.0, 106.0, 200.0),
    (301.0, 400.0, 405.0, 504.0),
    (401.0, 500.0, 505.0, 604.0),
];

/// ppb, 1-hour.
const NO2: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 53.0),
    (51.0, 100.0, 54.0, 100.0),
    (101.0, 150.0, 101.0, 360.0),
    (151.0, 200.0, 361.0, 649.0),
    (201.0, 300.0, 650.0, 1249.0),
    (301.0, 400.0, 1250.0, 1649.0),
    (401.0, 500.0, 1650.0, 2049.0),
];

/// ppb, 1-hour.
const SO2: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 35.0),
    (51.0, 100.0, 36.0, 75.0),
    (101.0, 150.0, 76.0, 185.0),
    (151.0, 200.0, 186.0, 304.0),
    (201.0, 300.0, 305.0, 604.0),
    (301.0, 400.0, 605.0, 804.0),
    (401.0, 500.0, 805.0, 1004.0),
];

/// ppm, 8-hour.
const CO: [Breakpoint; 7] = [
    (0.0, 50.0, 0.0, 4.4),
    (51.0, 100.0, 4.5, 9.4),
    (101.0, 150.0, 9.5, 12.4),
    (151.0, 200.0, 12.5, 15.4),
    (201.0, 300.0, 15.5, 30.4),
    (301.0, 400.0, 30.5, 40.4),
    (401.0, 500.0, 40.5, 50.4),
];

fn table(pollutant: &str) -> Option<&'static [Breakpoint]> {
    match pollutant {
        "pm25" => Some(&PM25),
        "pm10" => Some(&PM10),
        "o3" => Some(&O3),
        "no2" => Some(&NO2),
        "so2" => Some(&SO2),
        "co" => Some(&CO),
        _ => None,
    }
}

/// Converts a non-negative sub-index to a concentration.
///
/// Returns `None` for unknown pollutants and negative or non-finite indices.
pub fn to_concentration(pollutant: &str, index: f64) -> Option<f64> {
    if !index.is_finite() || index < 0.0 {
        return None;
    }
    let table = table(pollutant)?;
    let segment = table
        .iter()
        .find(|(_, i_hi, _, _)| index <= *i_hi)
        .or_else(|| table.last())?;

    let (i_lo, i_hi, c_lo, c_hi) = *segment;
    // Indices in the gap between two segments (e.g. 50.5) snap to the lower edge.
    let index = index.max(i_lo);
    Some((index - i_lo) / (i_hi - i_lo) * (c_hi - c_lo) + c_lo)
}
