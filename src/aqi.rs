//! US EPA PM2.5 concentration to AQI conversion.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Concentrations above this are clamped before band lookup.
pub const MAX_PM25_CONCENTRATION: f64 = 500.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitiveGroups,
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    Hazardous,
    Unknown,
}

impl AqiCategory {
    pub fn label(self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
            AqiCategory::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "Good" => AqiCategory::Good,
            "Moderate" => AqiCategory::Moderate,
            "Unhealthy for Sensitive Groups" => AqiCategory::UnhealthyForSensitiveGroups,
            "Unhealthy" => AqiCategory::Unhealthy,
            "Very Unhealthy" => AqiCategory::VeryUnhealthy,
            "Hazardous" => AqiCategory::Hazardous,
            _ => AqiCategory::Unknown,
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AqiBand {
    pub c_lo: f64,
    pub c_hi: f64,
    pub i_lo: u16,
    pub i_hi: u16,
    pub category: AqiCategory,
}

impl AqiBand {
    fn contains(&self, concentration: f64) -> bool {
        self.c_lo <= concentration && concentration <= self.c_hi
    }

    fn interpolate(&self, concentration: f64) -> f64 {
        let slope = f64::from(self.i_hi - self.i_lo) / (self.c_hi - self.c_lo);
        slope * (concentration - self.c_lo) + f64::from(self.i_lo)
    }
}

const fn band(c_lo: f64, c_hi: f64, i_lo: u16, i_hi: u16, category: AqiCategory) -> AqiBand {
    AqiBand {
        c_lo,
        c_hi,
        i_lo,
        i_hi,
        category,
    }
}

pub const PM25_BREAKPOINTS: [AqiBand; 7] = [
    band(0.0, 12.0, 0, 50, AqiCategory::Good),
    band(12.1, 35.4, 51, 100, AqiCategory::Moderate),
    band(35.5, 55.4, 101, 150, AqiCategory::UnhealthyForSensitiveGroups),
    band(55.5, 150.4, 151, 200, AqiCategory::Unhealthy),
    band(150.5, 250.4, 201, 300, AqiCategory::VeryUnhealthy),
    band(250.5, 350.4, 301, 400, AqiCategory::Hazardous),
    band(350.5, 500.4, 401, 500, AqiCategory::Hazardous),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AqiReading {
    pub index: Option<u16>,
    pub category: AqiCategory,
}

/// Maps a PM2.5 concentration (µg/m³) to an AQI value and category.
///
/// Input is clamped to `[0, 500.4]`. Bands are tried in table order and
/// the first inclusive match wins. Concentrations falling between two
/// bands (e.g. 12.05) and NaN return `Unknown` with no index. The
/// interpolated value is rounded half to even.
pub fn aqi_for_pm25(concentration: f64) -> AqiReading {
    if concentration.is_nan() {
        return AqiReading {
            index: None,
            category: AqiCategory::Unknown,
        };
    }

    let c = concentration.clamp(0.0, MAX_PM25_CONCENTRATION);
    match PM25_BREAKPOINTS.iter().find(|band| band.contains(c)) {
        Some(band) => AqiReading {
            index: Some(band.interpolate(c).round_ties_even() as u16),
            category: band.category,
        },
        None => AqiReading {
            index: None,
            category: AqiCategory::Unknown,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_bands_are_ordered_and_disjoint() {
        for pair in PM25_BREAKPOINTS.windows(2) {
            assert!(pair[0].c_lo < pair[0].c_hi);
            assert!(pair[0].c_hi < pair[1].c_lo);
            assert!(pair[0].i_hi < pair[1].i_lo);
        }
    }

    #[test]
    fn no_tenth_step_concentration_matches_two_bands() {
        for tenths in 0..=5004 {
            let c = f64::from(tenths) / 10.0;
            let matches = PM25_BREAKPOINTS.iter().filter(|b| b.contains(c)).count();
            assert!(matches <= 1, "{c} matched {matches} bands");
        }
    }

    #[test]
    fn values_between_bands_are_unknown() {
        let reading = aqi_for_pm25(12.05);
        assert_eq!(reading.index, None);
        assert_eq!(reading.category, AqiCategory::Unknown);
        assert_eq!(aqi_for_pm25(f64::NAN).category, AqiCategory::Unknown);
    }

    #[test]
    fn labels_round_trip() {
        for band in PM25_BREAKPOINTS {
            assert_eq!(AqiCategory::from_label(band.category.label()), band.category);
        }
        assert_eq!(AqiCategory::from_label("nope"), AqiCategory::Unknown);
    }
}
