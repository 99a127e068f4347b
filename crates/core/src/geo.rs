//! Station-relative geometry: ground distance and elevation angle.
//!
//! Pure math, no allocation. Distances are great-circle (haversine on the
//! mean earth radius); elevation uses a WGS-84 line of sight so that a
//! sonde near the horizon is not reported as overhead.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// IUGG mean earth radius in meters.
const EARTH_MEAN_RADIUS_M: f64 = 6_371_008.8;

/// WGS-84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;

/// WGS-84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// A fixed receiving station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct StationPosition {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    /// Antenna height above mean sea level, in meters.
    #[serde(default)]
    pub altitude_m: f64,
}

impl StationPosition {
    /// Ground distance in meters from the station to a point.
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        ground_distance_m(self.latitude, self.longitude, latitude, longitude)
    }

    /// Elevation angle in degrees from the station to a point at `altitude`.
    pub fn elevation_to(&self, latitude: f64, longitude: f64, altitude: f64) -> f64 {
        elevation_deg(
            (self.latitude, self.longitude, self.altitude_m),
            (latitude, longitude, altitude),
        )
    }
}

/// Great-circle distance in meters between two points given in degrees.
pub fn ground_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_MEAN_RADIUS_M * c
}

/// Elevation angle in degrees of `target` as seen from `observer`.
///
/// Both points are `(latitude_deg, longitude_deg, altitude_m)`. Coincident
/// points are reported as directly overhead.
pub fn elevation_deg(observer: (f64, f64, f64), target: (f64, f64, f64)) -> f64 {
    let o = to_ecef(observer);
    let t = to_ecef(target);
    let d = [t[0] - o[0], t[1] - o[1], t[2] - o[2]];
    let range = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
    if range < f64::EPSILON {
        return 90.0;
    }

    let (lat, lon) = (observer.0.to_radians(), observer.1.to_radians());
    let up = [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()];
    let dot = d[0] * up[0] + d[1] * up[1] + d[2] * up[2];

    (dot / range).clamp(-1.0, 1.0).asin().to_degrees()
}

/// Geodetic to earth-centred earth-fixed coordinates.
fn to_ecef((lat_deg, lon_deg, alt): (f64, f64, f64)) -> [f64; 3] {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let (lat, lon) = (lat_deg.to_radians(), lon_deg.to_radians());
    let n = WGS84_A / (1.0 - e2 * lat.sin().powi(2)).sqrt();

    [
        (n + alt) * lat.cos() * lon.cos(),
        (n + alt) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + alt) * lat.sin(),
    ]
}
