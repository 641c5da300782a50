use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;
// Rough metres per degree, good enough for small-radius map overlays
const METERS_PER_DEGREE: f64 = 111_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

// Calculate haversine distance between two GPS coordinates (returns km)
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Flat-earth distance in metres.
///
/// Only meant for the live map overlay, where it is recomputed on every
/// vehicle step. Use [`haversine_km`] for anything the user searches on.
pub fn planar_distance_m(a: LatLng, b: LatLng) -> f64 {
    let dlat = b.lat - a.lat;
    let dlng = b.lng - a.lng;
    (dlat * dlat + dlng * dlng).sqrt() * METERS_PER_DEGREE
}

#[cfg(test)]
mod tests {
    use super::*;

    const SULE: LatLng = LatLng { lat: 16.7745, lng: 96.1588 };
    const HLEDAN: LatLng = LatLng { lat: 16.8286, lng: 96.1290 };

    #[test]
    fn haversine_is_symmetric() {
        let ab = haversine_km(SULE, HLEDAN);
        let ba = haversine_km(HLEDAN, SULE);
        assert!((ab - ba).abs() < 1e-9);
        assert!(ab > 6.0 && ab < 7.5, "unexpected distance {ab}");
    }

    #[test]
    fn haversine_of_same_point_is_zero() {
        assert_eq!(haversine_km(SULE, SULE), 0.0);
        assert_eq!(haversine_km(HLEDAN, HLEDAN), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_km(LatLng::new(0.0, 0.0), LatLng::new(1.0, 0.0));
        assert!((d - 111.19).abs() < 0.1);
    }

    #[test]
    fn planar_distance_uses_degree_scale() {
        let d = planar_distance_m(LatLng::new(16.0, 96.0), LatLng::new(16.001, 96.0));
        assert!((d - 111.0).abs() < 1e-6);
    }

    #[test]
    fn non_finite_points_are_detected() {
        assert!(SULE.is_finite());
        assert!(!LatLng::new(f64::NAN, 96.0).is_finite());
        assert!(!LatLng::new(16.0, f64::INFINITY).is_finite());
    }
}
