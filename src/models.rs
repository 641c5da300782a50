use serde::{Deserialize, Serialize};

use crate::geo::LatLng;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub name_en: String,
    pub name_mm: String,
    /// `None` when the table row carried non-numeric coordinates.
    #[serde(flatten)]
    pub coords: Option<LatLng>,
}

impl Stop {
    /// Myanmar name first, English as fallback, id as a last resort.
    pub fn display_name(&self) -> &str {
        if !self.name_mm.is_empty() {
            &self.name_mm
        } else if !self.name_en.is_empty() {
            &self.name_en
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub stops: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// One direct-route match with the stops the rider boards and alights at.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub bus_id: String,
    pub from_stop: String,
    pub to_stop: String,
    pub full_route: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteShape {
    pub route_id: String,
    pub ordered_stop_ids: Option<Vec<i64>>,
    pub polyline: Vec<LatLng>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl RouteShape {
    pub fn empty(route_id: &str) -> Self {
        Self {
            route_id: route_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.polyline.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub id: String,
    pub route_id: String,
    pub position_index: usize,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTrip {
    pub from: String,
    pub to: String,
}
