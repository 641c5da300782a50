use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::geo::{haversine_km, planar_distance_m, LatLng};
use crate::models::{Route, Stop};

pub const DEFAULT_K: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct RankedStop {
    pub stop: Stop,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyStop {
    pub stop: Stop,
    pub distance_km: f64,
    pub routes: Vec<String>,
}

/// Geolocation failure as reported by the client device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeoFailure {
    NotSupported,
    PermissionDenied,
    Timeout,
    Unavailable { message: Option<String> },
}

impl From<GeoFailure> for AppError {
    fn from(failure: GeoFailure) -> Self {
        match failure {
            GeoFailure::NotSupported => {
                AppError::NotSupported("Geolocation not available in this browser.".to_string())
            }
            GeoFailure::PermissionDenied => {
                AppError::PermissionDenied("Unable to get location: permission denied".to_string())
            }
            GeoFailure::Timeout => {
                AppError::Timeout("Unable to get location: request timed out".to_string())
            }
            GeoFailure::Unavailable { message } => AppError::NetworkFailure(format!(
                "Unable to get location: {}",
                message.unwrap_or_else(|| "position unavailable".to_string())
            )),
        }
    }
}

/// Rank stops by great-circle distance from `user`, nearest first.
///
/// Stops without usable coordinates are skipped. Ties keep catalog order.
pub fn find_nearest(user: LatLng, stops: &[Stop], k: usize) -> Vec<RankedStop> {
    let mut ranked: Vec<RankedStop> = stops
        .iter()
        .filter_map(|s| {
            let at = s.coords.filter(LatLng::is_finite)?;
            Some(RankedStop {
                stop: s.clone(),
                distance_km: haversine_km(user, at),
            })
        })
        .collect();
    // sort_by is stable
    ranked.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(k);
    ranked
}

/// Ids of routes with a stop name containing the stop's Myanmar or English name.
pub fn routes_serving(stop: &Stop, routes: &[Route]) -> Vec<String> {
    let name_en = stop.name_en.trim().to_lowercase();
    let name_mm = stop.name_mm.trim().to_lowercase();
    routes
        .iter()
        .filter(|r| {
            r.stops.iter().any(|s| {
                let s = s.to_lowercase();
                (!name_mm.is_empty() && s.contains(&name_mm))
                    || (!name_en.is_empty() && s.contains(&name_en))
            })
        })
        .map(|r| r.id.clone())
        .collect()
}

pub fn nearest_stops_with_routes(
    user: LatLng,
    stops: &[Stop],
    routes: &[Route],
    k: usize,
) -> Vec<NearbyStop> {
    find_nearest(user, stops, k)
        .into_iter()
        .map(|ranked| {
            let routes = routes_serving(&ranked.stop, routes);
            NearbyStop {
                stop: ranked.stop,
                distance_km: ranked.distance_km,
                routes,
            }
        })
        .collect()
}

/// Closest stop by planar distance (metres), for the live map overlay.
pub fn nearest_on_map(user: LatLng, stops: &[Stop]) -> Option<(Stop, f64)> {
    stops
        .iter()
        .filter_map(|s| {
            let at = s.coords.filter(LatLng::is_finite)?;
            Some((s, planar_distance_m(user, at)))
        })
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, d)| (s.clone(), d))
}
