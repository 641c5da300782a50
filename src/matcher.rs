use crate::models::{Route, RouteResult};

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Index of the first stop whose name contains `needle` (already normalized).
fn first_stop_containing(route: &Route, needle: &str) -> Option<usize> {
    route
        .stops
        .iter()
        .position(|s| s.to_lowercase().contains(needle))
}

fn direct_indices(route: &Route, from: &str, to: &str) -> Option<(usize, usize)> {
    let from_idx = first_stop_containing(route, from)?;
    let to_idx = first_stop_containing(route, to)?;
    (from_idx < to_idx).then_some((from_idx, to_idx))
}

/// Routes whose stop list contains `from` strictly before `to`.
///
/// Matching is case-insensitive substring containment against stop display
/// names. Direction matters: the same line listed once will not match the
/// reverse trip. Catalog order is preserved.
pub fn find_direct_routes(from: &str, to: &str, routes: &[Route]) -> Vec<Route> {
    let f = normalize(from);
    let t = normalize(to);
    if f.is_empty() || t.is_empty() {
        return Vec::new();
    }
    routes
        .iter()
        .filter(|r| direct_indices(r, &f, &t).is_some())
        .cloned()
        .collect()
}

/// Same matching as [`find_direct_routes`], reporting the matched stops.
pub fn describe_direct_routes(from: &str, to: &str, routes: &[Route]) -> Vec<RouteResult> {
    let f = normalize(from);
    let t = normalize(to);
    if f.is_empty() || t.is_empty() {
        return Vec::new();
    }
    routes
        .iter()
        .filter_map(|r| {
            let (from_idx, to_idx) = direct_indices(r, &f, &t)?;
            Some(RouteResult {
                bus_id: r.id.clone(),
                from_stop: r.stops[from_idx].clone(),
                to_stop: r.stops[to_idx].clone(),
                full_route: r.stops.clone(),
            })
        })
        .collect()
}
