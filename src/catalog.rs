use std::path::Path;

use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::models::Route;

pub const DEFAULT_PAGE_SIZE: usize = 12;
const DEFAULT_OPERATOR: &str = "Yangon Bus Service";

fn route(id: &str, operator: &str, color: &str, stops: &[&str]) -> Route {
    Route {
        id: id.to_string(),
        operator: Some(operator.to_string()),
        stops: stops.iter().map(|s| s.to_string()).collect(),
        color: Some(color.to_string()),
    }
}

/// Static bus lines compiled into the binary.
fn builtin_routes() -> Vec<Route> {
    vec![
        route(
            "1",
            "Yangon Bus Public Co., Ltd.",
            "#e53e3e",
            &["Hlaing Thar Yar", "Insein Road", "Hledan", "Kamaryut", "Myaynigone", "Sule Pagoda"],
        ),
        route(
            "2",
            "Yangon Bus Public Co., Ltd.",
            "#3182ce",
            &["Thanlyin", "Thaketa", "Pazundaung", "Maha Bandoola Park", "Sule Pagoda", "Lanmadaw"],
        ),
        route(
            "8",
            "Shwe Nadi",
            "#38a169",
            &["Dagon University", "North Okkalapa", "Thingangyun", "Bahan", "Myaynigone", "Hledan", "Yangon University"],
        ),
        route(
            "21",
            "Shwe Nadi",
            "#d69e2e",
            &["Mingaladon", "Airport", "Kabaraye Pagoda Road", "Inya Lake", "Hledan", "Kyee Myin Daing"],
        ),
        route(
            "36",
            "Yangon City Bus",
            "#805ad5",
            &["Shwe Pyi Thar", "Insein", "Hledan", "Shwedagon Pagoda", "Sule Pagoda", "Botataung"],
        ),
        route(
            "43",
            "Yangon City Bus",
            "#dd6b20",
            &["South Dagon", "Thingangyun", "Tamwe", "Kandawgyi Lake", "Shwedagon Pagoda", "Myaynigone"],
        ),
        route(
            "61",
            "Parami",
            "#319795",
            &["Hlaing Thar Yar", "Bayint Naung", "Kamaryut", "Hledan", "Shwedagon Pagoda", "Tamwe", "Thuwunna"],
        ),
        route(
            "72",
            "Parami",
            "#b83280",
            &["Dala Jetty", "Pansodan", "Sule Pagoda", "Yankin", "Kaba Aye", "North Dagon"],
        ),
    ]
}

/// Neighbouring lines in catalog order, wrapping at both ends.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbours {
    pub previous: Route,
    pub next: Route,
    /// 1-based position of the current line.
    pub position: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

#[derive(Debug, Clone)]
pub struct RouteCatalog {
    routes: Vec<Route>,
}

impl RouteCatalog {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_routes())
    }

    /// Load a catalog override: a JSON array of `{id, operator?, stops, color?}`.
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let routes: Vec<Route> = serde_json::from_str(&text)?;
        if routes.is_empty() {
            return Err(AppError::ParseFailure(format!(
                "route catalog {} has no routes",
                path.display()
            )));
        }
        Ok(Self::new(routes))
    }

    pub fn all(&self) -> &[Route] {
        &self.routes
    }

    pub fn get(&self, id: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.id == id)
    }

    pub fn operator_of<'a>(&self, route: &'a Route) -> &'a str {
        route.operator.as_deref().unwrap_or(DEFAULT_OPERATOR)
    }

    pub fn neighbours(&self, id: &str) -> Option<Neighbours> {
        let idx = self.routes.iter().position(|r| r.id == id)?;
        let len = self.routes.len();
        let prev = if idx == 0 { len - 1 } else { idx - 1 };
        let next = if idx + 1 == len { 0 } else { idx + 1 };
        Some(Neighbours {
            previous: self.routes[prev].clone(),
            next: self.routes[next].clone(),
            position: idx + 1,
            total: len,
        })
    }

    /// Bus-list filter: line id or any stop name contains the query.
    pub fn filter(&self, query: &str) -> Vec<Route> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return self.routes.clone();
        }
        self.routes
            .iter()
            .filter(|r| {
                r.id.to_lowercase().contains(&q)
                    || r.stops.iter().any(|s| s.to_lowercase().contains(&q))
            })
            .cloned()
            .collect()
    }

    /// "Bus {id}: a - b - c" lines handed to the assistant as route context.
    pub fn context_text(&self) -> String {
        let lines: Vec<String> = self
            .routes
            .iter()
            .map(|r| format!("Bus {}: {}", r.id, r.stops.join(" - ")))
            .collect();
        format!("The following is a list of YBS routes:\n{}", lines.join("\n"))
    }
}

/// 1-based pagination; out-of-range pages come back empty.
pub fn paginate<T: Clone>(items: &[T], page: usize, per_page: usize) -> Page<T> {
    let per_page = per_page.max(1);
    let page = page.max(1);
    let total_items = items.len();
    let total_pages = total_items.div_ceil(per_page);
    let start = (page - 1).saturating_mul(per_page);
    let slice = if start < total_items {
        items[start..(start + per_page).min(total_items)].to_vec()
    } else {
        Vec::new()
    };
    Page {
        items: slice,
        page,
        total_pages,
        total_items,
    }
}
