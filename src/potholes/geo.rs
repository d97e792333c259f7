/// Geographic helpers for report placement and merging
use crate::error::{HoleError, HoleResult};
use std::str::FromStr;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Rectangular service area in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    /// Waterloo Region, Ontario
    pub fn waterloo_region() -> Self {
        Self {
            min_lat: 43.32,
            max_lat: 43.53,
            min_lng: -80.59,
            max_lng: -80.22,
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

/// Parses `min_lat,max_lat,min_lng,max_lng`
impl FromStr for GeoBounds {
    type Err = HoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| HoleError::Validation(format!("Invalid geofence: {}", s)))?;

        let [min_lat, max_lat, min_lng, max_lng] = parts[..] else {
            return Err(HoleError::Validation(format!(
                "Geofence needs four values, got {}",
                parts.len()
            )));
        };

        if min_lat >= max_lat || min_lng >= max_lng {
            return Err(HoleError::Validation(
                "Geofence minimums must be below maximums".to_string(),
            ));
        }

        Ok(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }
}

/// Reject non-finite or out-of-range coordinates
pub fn validate_coordinates(lat: f64, lng: f64) -> HoleResult<()> {
    if !lat.is_finite() || !lng.is_finite() {
        return Err(HoleError::Validation("Coordinates must be numbers".to_string()));
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(HoleError::Validation("Coordinates out of range".to_string()));
    }
    Ok(())
}

/// Great-circle distance in metres
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Degree deltas for a square prefilter around a point
///
/// Longitude degrees shrink with latitude, so the longitude delta is widened
/// by `1 / cos(lat)`. The result always covers `radius_m`.
pub fn bounding_deltas(lat: f64, radius_m: f64) -> (f64, f64) {
    let lat_delta = (radius_m / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().abs().max(0.01);
    (lat_delta, lat_delta / cos_lat)
}
