use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::geo::LatLng;
use crate::models::{Route, RouteShape, Stop};

// Upper bound on concurrent document fetches when loading every line
const LOAD_ALL_CONCURRENCY: usize = 8;

/// Route id -> candidate shape documents, tried in order.
#[derive(Debug, Clone, Default)]
pub struct ShapeIndex {
    entries: HashMap<String, Vec<String>>,
}

impl ShapeIndex {
    /// Parse `{"<route id>": "file.json" | ["a.json", "b.json"]}`.
    pub fn from_json(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value
            .as_object()
            .ok_or_else(|| AppError::ParseFailure("shape index must be a JSON object".to_string()))?;
        let mut entries = HashMap::new();
        for (id, files) in obj {
            let names: Vec<String> = match files {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => {
                    return Err(AppError::ParseFailure(format!(
                        "shape index entry for route '{}' must be a string or array",
                        id
                    )))
                }
            };
            entries.insert(id.clone(), names);
        }
        Ok(Self { entries })
    }

    pub async fn from_file(path: &Path) -> AppResult<Self> {
        Self::from_json(&tokio::fs::read_to_string(path).await?)
    }

    pub fn candidates(&self, route_id: &str) -> Vec<String> {
        match self.entries.get(route_id) {
            Some(names) if !names.is_empty() => names.clone(),
            _ => vec![format!("route{}.json", route_id)],
        }
    }
}

#[async_trait]
pub trait ShapeSource: Send + Sync {
    async fn fetch(&self, name: &str) -> AppResult<String>;
}

pub struct FsShapeSource {
    base: PathBuf,
}

impl FsShapeSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl ShapeSource for FsShapeSource {
    async fn fetch(&self, name: &str) -> AppResult<String> {
        let path = self.base.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::NotFound(format!("{}: {}", path.display(), e)))
    }
}

pub struct HttpShapeSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpShapeSource {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl ShapeSource for HttpShapeSource {
    async fn fetch(&self, name: &str) -> AppResult<String> {
        let url = format!("{}/{}", self.base_url, name);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeDocument {
    pub polyline: Vec<LatLng>,
    pub stop_ids: Option<Vec<i64>>,
    pub color: Option<String>,
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stop_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a per-route shape document.
///
/// Source coordinates are `[lng, lat]`; the returned polyline is `(lat, lng)`
/// with non-finite or malformed pairs removed.
pub fn parse_shape_document(text: &str) -> AppResult<ShapeDocument> {
    let doc: Value = serde_json::from_str(text)?;
    if !doc.is_object() {
        return Err(AppError::ParseFailure(
            "shape document must be a JSON object".to_string(),
        ));
    }

    let coords = doc
        .pointer("/shape/geometry/coordinates")
        .or_else(|| doc.pointer("/geometry/coordinates"))
        .and_then(Value::as_array);

    let polyline = coords
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|p| {
                    let pair = p.as_array()?;
                    let lng = number(pair.first()?)?;
                    let lat = number(pair.get(1)?)?;
                    Some(LatLng::new(lat, lng))
                })
                .filter(LatLng::is_finite)
                .collect()
        })
        .unwrap_or_default();

    let stop_ids = doc
        .get("stops")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(stop_id).collect());

    let color = doc.get("color").and_then(Value::as_str).map(|c| {
        if c.starts_with('#') {
            c.to_string()
        } else {
            format!("#{}", c)
        }
    });

    Ok(ShapeDocument {
        polyline,
        stop_ids,
        color,
    })
}

pub struct ShapeLoader {
    index: ShapeIndex,
    source: Arc<dyn ShapeSource>,
}

impl ShapeLoader {
    pub fn new(index: ShapeIndex, source: Arc<dyn ShapeSource>) -> Self {
        Self { index, source }
    }

    /// Try each candidate document until one has a non-empty polyline.
    ///
    /// Failures are logged and skipped; no shape at all is an empty result.
    pub async fn load_shape(&self, route_id: &str) -> RouteShape {
        for name in self.index.candidates(route_id) {
            let text = match self.source.fetch(&name).await {
                Ok(text) => text,
                Err(e) => {
                    debug!("Shape candidate {} for route {} unavailable: {}", name, route_id, e);
                    continue;
                }
            };
            match parse_shape_document(&text) {
                Ok(doc) if !doc.polyline.is_empty() => {
                    return RouteShape {
                        route_id: route_id.to_string(),
                        ordered_stop_ids: doc.stop_ids,
                        polyline: doc.polyline,
                        color: doc.color,
                    };
                }
                Ok(_) => debug!("Shape candidate {} for route {} has no coordinates", name, route_id),
                Err(e) => warn!("Shape candidate {} for route {} is malformed: {}", name, route_id, e),
            }
        }
        RouteShape::empty(route_id)
    }

    /// Shapes for many routes at once, in input order, empty shapes dropped.
    pub async fn load_all(&self, route_ids: &[String]) -> Vec<RouteShape> {
        stream::iter(route_ids.to_vec())
            .map(|id| async move { self.load_shape(&id).await })
            .buffered(LOAD_ALL_CONCURRENCY)
            .filter(|shape| futures_util::future::ready(!shape.is_empty()))
            .collect()
            .await
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Stops to mark on a route's map.
///
/// Ordered stop ids win when any of them resolve; otherwise each stop name is
/// matched exactly, then by substring. Stops without coordinates are dropped.
pub fn resolve_stop_coordinates(route: &Route, stop_ids: Option<&[i64]>, stops: &[Stop]) -> Vec<Stop> {
    if let Some(ids) = stop_ids {
        let by_id: Vec<Stop> = ids
            .iter()
            .filter_map(|id| {
                let key = id.to_string();
                stops.iter().find(|s| s.id == key && s.coords.is_some()).cloned()
            })
            .collect();
        if !by_id.is_empty() {
            return by_id;
        }
    }

    route
        .stops
        .iter()
        .filter_map(|name| {
            let target = normalize(name);
            if target.is_empty() {
                return None;
            }
            let exact = stops
                .iter()
                .find(|s| normalize(&s.name_mm) == target || normalize(&s.name_en) == target);
            let fuzzy = || {
                stops.iter().find(|s| {
                    let mm = normalize(&s.name_mm);
                    let en = normalize(&s.name_en);
                    (!mm.is_empty() && (mm.contains(&target) || target.contains(&mm)))
                        || (!en.is_empty() && en.contains(&target))
                })
            };
            exact.or_else(fuzzy).filter(|s| s.coords.is_some()).cloned()
        })
        .collect()
}
