use std::path::PathBuf;
use std::sync::Arc;

use csv::StringRecord;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::geo::LatLng;
use crate::models::Stop;

const REQUIRED_COLUMNS: [&str; 5] = ["id", "name_en", "name_mm", "lat", "lng"];

/// Where the stop table comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum StopSource {
    File(PathBuf),
    Url(String),
}

impl StopSource {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            StopSource::Url(raw.to_string())
        } else {
            StopSource::File(PathBuf::from(raw))
        }
    }
}

struct Columns {
    id: usize,
    name_en: usize,
    name_mm: usize,
    lat: usize,
    lng: usize,
}

impl Columns {
    fn locate(headers: &StringRecord) -> AppResult<Self> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| AppError::ParseFailure(format!("stop table is missing column '{}'", name)))
        };
        let [id, name_en, name_mm, lat, lng] = REQUIRED_COLUMNS;
        Ok(Self {
            id: find(id)?,
            name_en: find(name_en)?,
            name_mm: find(name_mm)?,
            lat: find(lat)?,
            lng: find(lng)?,
        })
    }
}

fn parse_coord(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse the tab-separated stop table into typed records.
///
/// The header row must name every column in `id, name_en, name_mm, lat, lng`
/// (any order, extra columns ignored). Rows with unusable coordinates are kept
/// with `coords: None` so they can still be shown by name.
pub fn parse_stop_table(text: &str) -> AppResult<Vec<Stop>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = rdr.headers()?.clone();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(AppError::ParseFailure("stop table is empty".to_string()));
    }
    let cols = Columns::locate(&headers)?;

    let mut stops = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let field = |idx: usize| record.get(idx).unwrap_or("").to_string();
        let id = field(cols.id);
        if id.is_empty() {
            continue;
        }
        let coords = match (parse_coord(&field(cols.lat)), parse_coord(&field(cols.lng))) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        };
        stops.push(Stop {
            id,
            name_en: field(cols.name_en),
            name_mm: field(cols.name_mm),
            coords,
        });
    }
    Ok(stops)
}

pub async fn load_stop_table(source: &StopSource, client: &reqwest::Client) -> AppResult<Vec<Stop>> {
    let text = match source {
        StopSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::NetworkFailure(format!("failed to read {}: {}", path.display(), e))
        })?,
        StopSource::Url(url) => {
            client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?
        }
    };
    parse_stop_table(&text)
}

/// Session-wide stop table. Read-only between reloads.
pub struct StopDirectory {
    source: StopSource,
    client: reqwest::Client,
    stops: RwLock<Arc<Vec<Stop>>>,
}

impl StopDirectory {
    pub fn new(source: StopSource, client: reqwest::Client) -> Self {
        Self {
            source,
            client,
            stops: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn from_stops(stops: Vec<Stop>) -> Self {
        Self {
            source: StopSource::File(PathBuf::new()),
            client: reqwest::Client::new(),
            stops: RwLock::new(Arc::new(stops)),
        }
    }

    /// Replace the table from its source. On failure the previous table stays.
    pub async fn reload(&self) -> AppResult<usize> {
        match load_stop_table(&self.source, &self.client).await {
            Ok(stops) => {
                let count = stops.len();
                *self.stops.write().await = Arc::new(stops);
                info!("Loaded {} stops from {:?}", count, self.source);
                Ok(count)
            }
            Err(e) => {
                warn!("Failed to load stop table from {:?}: {}", self.source, e);
                Err(e)
            }
        }
    }

    pub async fn all(&self) -> Arc<Vec<Stop>> {
        self.stops.read().await.clone()
    }

    pub async fn by_id(&self, id: &str) -> Option<Stop> {
        self.stops.read().await.iter().find(|s| s.id == id).cloned()
    }

    /// Map an ordered list of stop ids to display names; unknown ids show as themselves.
    pub async fn display_names(&self, ids: &[i64]) -> Vec<String> {
        let stops = self.all().await;
        ids.iter()
            .map(|id| {
                let key = id.to_string();
                stops
                    .iter()
                    .find(|s| s.id == key)
                    .map(|s| s.display_name().to_string())
                    .unwrap_or(key)
            })
            .collect()
    }
}
