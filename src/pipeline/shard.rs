//! Per-invocation city selection.
//!
//! Manual runs take every configured city. Scheduled runs split the list in two
//! (ceiling division): even hours take the first half, odd hours the rest, so every
//! city is covered at least once every two hours.

use crate::config::CityConfig;
use crate::models::Trigger;

pub fn select_cities(cities: &[CityConfig], trigger: Trigger, hour: u32) -> &[CityConfig] {
    match trigger {
        Trigger::Manual => cities,
        Trigger::Scheduled => {
            let split = (cities.len() + 1) / 2;
            if hour % 2 == 0 {
                &cities[..split]
            } else {
                &cities[split..]
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;
    use rstest::rstest;

    fn ids(cities: &[CityConfig]) -> Vec<&str> {
        cities.iter().map(|c| c.id.as_str()).collect()
    }

    fn five_cities() -> Vec<CityConfig> {
        test_settings(&[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1)], 1).cities
    }

    #[rstest]
    #[case(14, vec!["a", "b", "c"])]
    #[case(15, vec!["d", "e"])]
    #[case(0, vec!["a", "b", "c"])]
    #[case(23, vec!["d", "e"])]
    fn test_scheduled_halves(#[case] hour: u32, #[case] expected: Vec<&str>) {
        let cities = five_cities();
        assert_eq!(ids(select_cities(&cities, Trigger::Scheduled, hour)), expected);
    }

    #[test]
    fn test_manual_selects_everything() {
        let cities = five_cities();
        assert_eq!(select_cities(&cities, Trigger::Manual, 15).len(), 5);
    }

    #[test]
    fn test_two_consecutive_hours_cover_all_cities() {
        let cities = five_cities();
        for hour in 0..23 {
            let mut covered = ids(select_cities(&cities, Trigger::Scheduled, hour));
            covered.extend(ids(select_cities(&cities, Trigger::Scheduled, hour + 1)));
            covered.sort();
            assert_eq!(covered, vec!["a", "b", "c", "d", "e"]);
        }
    }

    #[test]
    fn test_single_city_runs_on_even_hours() {
        let cities = test_settings(&[("only", 1)], 1).cities;
        assert_eq!(select_cities(&cities, Trigger::Scheduled, 2).len(), 1);
        assert!(select_cities(&cities, Trigger::Scheduled, 3).is_empty());
    }
}
