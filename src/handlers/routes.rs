use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::{paginate, Neighbours, Page, DEFAULT_PAGE_SIZE};
use crate::errors::{AppError, AppResult};
use crate::feedback::Feedback;
use crate::geo::LatLng;
use crate::learning::{LearningStats, TripPreferences};
use crate::ledger::{CardBalance, CardSettings, CardTransaction, Insights, LowBalance, SettingsPatch, TxKind};
use crate::live::LiveSnapshot;
use crate::matcher::describe_direct_routes;
use crate::models::{Route, RouteResult, RouteShape, SavedTrip, Stop};
use crate::nearest::{nearest_stops_with_routes, GeoFailure, NearbyStop, DEFAULT_K};
use crate::shapes::resolve_stop_coordinates;
use crate::AppState;

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/routes", get(list_routes))
        .route("/routes/{id}", get(get_route))
        .route("/routes/{id}/neighbours", get(get_neighbours))
        .route("/routes/{id}/stops", get(get_route_stops))
        .route("/routes/{id}/shape", get(get_route_shape))
        .route("/shapes", get(get_all_shapes))
        .route("/stops", get(list_stops))
        .route("/stops/reload", post(reload_stops))
        .route("/nearest", get(get_nearest))
        .route("/nearest/error", post(nearest_error))
        .route("/search", post(search))
        .route("/trips", get(list_trips).post(save_trip).delete(clear_trips))
        .route("/live/{route_id}", get(live_snapshot))
        .route("/live/{route_id}/enable", post(live_enable))
        .route("/live/{route_id}/disable", post(live_disable))
        .route("/live/{route_id}/device", post(live_device))
        .route("/live/{route_id}/device-error", post(live_device_error))
        .route("/live/{route_id}/speed", post(live_speed))
        .route("/card/balance", get(card_balance).put(set_card_balance))
        .route("/card/transactions", get(card_transactions).post(card_transaction).delete(clear_card_transactions))
        .route("/card/settings", get(card_settings).patch(update_card_settings))
        .route("/card/low-balance", get(card_low_balance))
        .route("/card/insights", get(card_insights))
        .route("/card/nfc", post(card_nfc))
        .route("/learning/choices", post(learning_choice))
        .route("/learning/skipped", post(learning_skipped))
        .route("/learning/preferences", get(learning_preferences))
        .route("/learning/stats", get(learning_stats))
        .route("/learning", delete(learning_clear))
        .route("/assistant/route", get(assistant_route))
        .route("/assistant/chat", post(assistant_chat))
        .route("/assistant/discovery", get(assistant_discovery))
        .route("/assistant/status", get(assistant_status))
        .route("/assistant/probe", post(assistant_probe))
        .route("/feedback", get(list_feedback).post(submit_feedback))
        .route("/ready", get(readiness_probe))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn list_routes(
    State(app_state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Page<Route>> {
    let routes = app_state.catalog.filter(query.q.as_deref().unwrap_or(""));
    Json(paginate(
        &routes,
        query.page.unwrap_or(1),
        query.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
    ))
}

fn find_route(app_state: &AppState, id: &str) -> AppResult<Route> {
    app_state
        .catalog
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("route {}", id)))
}

#[derive(Debug, Serialize)]
pub struct RouteDetail {
    #[serde(flatten)]
    route: Route,
    operator_name: String,
}

async fn get_route(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RouteDetail>> {
    let route = find_route(&app_state, &id)?;
    let operator_name = app_state.catalog.operator_of(&route).to_string();
    Ok(Json(RouteDetail {
        route,
        operator_name,
    }))
}

async fn get_neighbours(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Neighbours>> {
    let neighbours = app_state
        .catalog
        .neighbours(&id)
        .ok_or_else(|| AppError::NotFound(format!("route {}", id)))?;
    Ok(Json(neighbours))
}

/// Stops to mark on the route map, resolved against the stop directory.
async fn get_route_stops(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<Stop>>> {
    let route = find_route(&app_state, &id)?;
    let shape = app_state.shapes.load_shape(&id).await;
    let stops = app_state.stops.all().await;
    Ok(Json(resolve_stop_coordinates(
        &route,
        shape.ordered_stop_ids.as_deref(),
        &stops,
    )))
}

async fn get_route_shape(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RouteShape>> {
    let route = find_route(&app_state, &id)?;
    let mut shape = app_state.shapes.load_shape(&id).await;
    if shape.color.is_none() {
        shape.color = route.color;
    }
    Ok(Json(shape))
}

async fn get_all_shapes(State(app_state): State<AppState>) -> Json<Vec<RouteShape>> {
    let ids: Vec<String> = app_state.catalog.all().iter().map(|r| r.id.clone()).collect();
    Json(app_state.shapes.load_all(&ids).await)
}

async fn list_stops(State(app_state): State<AppState>) -> Json<Vec<Stop>> {
    Json(app_state.stops.all().await.as_ref().clone())
}

async fn reload_stops(State(app_state): State<AppState>) -> AppResult<Json<Value>> {
    let count = app_state.stops.reload().await?;
    Ok(Json(json!({ "stops": count })))
}

#[derive(Debug, Deserialize)]
pub struct NearestQuery {
    lat: f64,
    lng: f64,
    k: Option<usize>,
}

async fn get_nearest(
    State(app_state): State<AppState>,
    Query(query): Query<NearestQuery>,
) -> AppResult<Json<Vec<NearbyStop>>> {
    let user = LatLng::new(query.lat, query.lng);
    if !user.is_finite() {
        return Err(AppError::BadRequest("lat and lng must be finite".to_string()));
    }
    let stops = app_state.stops.all().await;
    Ok(Json(nearest_stops_with_routes(
        user,
        &stops,
        app_state.catalog.all(),
        query.k.unwrap_or(DEFAULT_K),
    )))
}

/// The device could not locate the rider; answer with the displayable error.
async fn nearest_error(Json(failure): Json<GeoFailure>) -> AppError {
    AppError::from(failure)
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    from: String,
    to: String,
    results: Vec<RouteResult>,
    /// `None` when the assistant did not answer within the search deadline.
    ai_advice: Option<String>,
}

async fn search(
    State(app_state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> AppResult<Json<SearchResponse>> {
    let from = request.from.trim().to_string();
    let to = request.to.trim().to_string();
    let results = describe_direct_routes(&from, &to, app_state.catalog.all());
    if from.is_empty() || to.is_empty() {
        return Ok(Json(SearchResponse {
            from,
            to,
            results,
            ai_advice: None,
        }));
    }
    info!("Search {} -> {}: {} direct routes", from, to, results.len());

    if let Err(e) = app_state
        .trips
        .save(SavedTrip {
            from: from.clone(),
            to: to.clone(),
        })
        .await
    {
        warn!("Failed to save trip {} -> {}: {}", from, to, e);
    }

    let ai_advice = match tokio::time::timeout(
        app_state.search_advice_deadline,
        app_state.advisory.suggest_route(&from, &to),
    )
    .await
    {
        Ok(text) => Some(text),
        Err(_) => {
            warn!(
                "Route advice for {} -> {} missed the {:?} search deadline",
                from, to, app_state.search_advice_deadline
            );
            None
        }
    };

    Ok(Json(SearchResponse {
        from,
        to,
        results,
        ai_advice,
    }))
}

async fn list_trips(State(app_state): State<AppState>) -> Json<Vec<SavedTrip>> {
    Json(app_state.trips.list().await)
}

async fn save_trip(
    State(app_state): State<AppState>,
    Json(trip): Json<SavedTrip>,
) -> AppResult<Json<Vec<SavedTrip>>> {
    Ok(Json(app_state.trips.save(trip).await?))
}

async fn clear_trips(State(app_state): State<AppState>) -> AppResult<Json<Vec<SavedTrip>>> {
    app_state.trips.clear().await?;
    Ok(Json(Vec::new()))
}

async fn live_snapshot(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
) -> AppResult<Json<LiveSnapshot>> {
    let sim = app_state.live.get(&route_id).await?;
    let stops = app_state.stops.all().await;
    Ok(Json(sim.snapshot(&stops).await))
}

async fn live_enable(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
) -> AppResult<Json<LiveSnapshot>> {
    find_route(&app_state, &route_id)?;
    let sim = app_state.live.enable(&route_id, &app_state.shapes).await;
    let stops = app_state.stops.all().await;
    Ok(Json(sim.snapshot(&stops).await))
}

async fn live_disable(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
) -> AppResult<Json<LiveSnapshot>> {
    app_state.live.disable(&route_id).await?;
    live_snapshot(State(app_state), Path(route_id)).await
}

async fn live_device(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
    Json(at): Json<LatLng>,
) -> AppResult<Json<LiveSnapshot>> {
    let sim = app_state.live.get(&route_id).await?;
    sim.device_position(at).await?;
    let stops = app_state.stops.all().await;
    Ok(Json(sim.snapshot(&stops).await))
}

async fn live_device_error(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
    Json(failure): Json<GeoFailure>,
) -> AppResult<Json<LiveSnapshot>> {
    let sim = app_state.live.get(&route_id).await?;
    sim.report_device_error(failure).await;
    let stops = app_state.stops.all().await;
    Ok(Json(sim.snapshot(&stops).await))
}

#[derive(Debug, Deserialize)]
pub struct SpeedRequest {
    interval_ms: u64,
}

async fn live_speed(
    State(app_state): State<AppState>,
    Path(route_id): Path<String>,
    Json(request): Json<SpeedRequest>,
) -> AppResult<Json<LiveSnapshot>> {
    let sim = app_state.live.get(&route_id).await?;
    sim.set_interval(Duration::from_millis(request.interval_ms)).await?;
    let stops = app_state.stops.all().await;
    Ok(Json(sim.snapshot(&stops).await))
}

async fn card_balance(State(app_state): State<AppState>) -> Json<Option<CardBalance>> {
    Json(app_state.ledger.balance().await)
}

#[derive(Debug, Deserialize)]
pub struct SetBalanceRequest {
    balance: f64,
    currency: Option<String>,
}

async fn set_card_balance(
    State(app_state): State<AppState>,
    Json(request): Json<SetBalanceRequest>,
) -> AppResult<Json<CardBalance>> {
    let balance = app_state
        .ledger
        .set_balance(request.balance, request.currency.as_deref())
        .await?;
    Ok(Json(balance))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

async fn card_transactions(
    State(app_state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<CardTransaction>> {
    Json(app_state.ledger.transactions(query.limit).await)
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    amount: f64,
    #[serde(rename = "type")]
    kind: TxKind,
    #[serde(default)]
    description: String,
}

async fn card_transaction(
    State(app_state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> AppResult<Json<Value>> {
    let balance = app_state
        .ledger
        .apply_transaction(request.amount, request.kind, &request.description)
        .await?;
    Ok(Json(json!({ "balance": balance })))
}

async fn clear_card_transactions(State(app_state): State<AppState>) -> AppResult<Json<Value>> {
    app_state.ledger.clear_transactions().await?;
    Ok(Json(json!({ "cleared": true })))
}

async fn card_settings(State(app_state): State<AppState>) -> Json<CardSettings> {
    Json(app_state.ledger.settings().await)
}

async fn update_card_settings(
    State(app_state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> AppResult<Json<CardSettings>> {
    Ok(Json(app_state.ledger.update_settings(patch).await?))
}

async fn card_low_balance(State(app_state): State<AppState>) -> Json<LowBalance> {
    Json(app_state.ledger.low_balance().await)
}

async fn card_insights(State(app_state): State<AppState>) -> Json<Insights> {
    Json(app_state.ledger.insights().await)
}

/// Card reading needs NFC hardware, which a server never has.
async fn card_nfc() -> AppError {
    AppError::NotSupported("NFC is not supported on this device.".to_string())
}

#[derive(Debug, Deserialize)]
pub struct ChoiceRequest {
    from: String,
    to: String,
    selected_route: String,
    ai_suggestion: Option<String>,
}

async fn learning_choice(
    State(app_state): State<AppState>,
    Json(request): Json<ChoiceRequest>,
) -> AppResult<Json<LearningStats>> {
    app_state
        .learning
        .record_choice(
            &request.from,
            &request.to,
            &request.selected_route,
            request.ai_suggestion,
        )
        .await?;
    Ok(Json(app_state.learning.stats().await))
}

#[derive(Debug, Deserialize)]
pub struct SkippedRequest {
    from: String,
    to: String,
    ai_suggestion: String,
}

async fn learning_skipped(
    State(app_state): State<AppState>,
    Json(request): Json<SkippedRequest>,
) -> AppResult<Json<LearningStats>> {
    app_state
        .learning
        .record_skipped(&request.from, &request.to, &request.ai_suggestion)
        .await?;
    Ok(Json(app_state.learning.stats().await))
}

#[derive(Debug, Deserialize)]
pub struct TripQuery {
    from: String,
    to: String,
}

async fn learning_preferences(
    State(app_state): State<AppState>,
    Query(query): Query<TripQuery>,
) -> Json<TripPreferences> {
    Json(app_state.learning.preferences(&query.from, &query.to).await)
}

async fn learning_stats(State(app_state): State<AppState>) -> Json<LearningStats> {
    Json(app_state.learning.stats().await)
}

async fn learning_clear(State(app_state): State<AppState>) -> AppResult<Json<LearningStats>> {
    app_state.learning.clear().await?;
    Ok(Json(app_state.learning.stats().await))
}

async fn assistant_route(
    State(app_state): State<AppState>,
    Query(query): Query<TripQuery>,
) -> Json<Value> {
    let answer = app_state.advisory.suggest_route(&query.from, &query.to).await;
    Json(json!({ "answer": answer }))
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    message: String,
}

async fn assistant_chat(
    State(app_state): State<AppState>,
    Json(request): Json<ChatMessage>,
) -> AppResult<Json<Value>> {
    if request.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is empty".to_string()));
    }
    let answer = app_state.advisory.chat(&request.message).await;
    Ok(Json(json!({ "answer": answer })))
}

async fn assistant_discovery(State(app_state): State<AppState>) -> Json<Value> {
    Json(json!({ "answer": app_state.advisory.discovery().await }))
}

async fn assistant_status(State(app_state): State<AppState>) -> Json<Value> {
    Json(json!({ "available": app_state.advisory.availability().await }))
}

async fn assistant_probe(State(app_state): State<AppState>) -> Json<Value> {
    Json(json!({ "available": app_state.advisory.probe().await }))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    username: Option<String>,
    title: String,
    description: String,
}

async fn submit_feedback(
    State(app_state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> AppResult<Json<Value>> {
    let submitted = app_state
        .feedback
        .submit(request.username.as_deref(), &request.title, &request.description)
        .await?;
    Ok(Json(json!({ "submitted": submitted })))
}

async fn list_feedback(State(app_state): State<AppState>) -> Json<Vec<Feedback>> {
    Json(app_state.feedback.list().await)
}

async fn readiness_probe(State(app_state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "routes": app_state.catalog.all().len(),
        "stops": app_state.stops.all().await.len(),
        "assistant": app_state.advisory.availability().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::tests::ScriptedBackend;
    use crate::advisory::{AdvisoryGateway, ChatBackend};
    use crate::catalog::RouteCatalog;
    use crate::feedback::{FeedbackService, MemoryFeedbackStore};
    use crate::geo::LatLng;
    use crate::learning::LearningService;
    use crate::ledger::CardLedger;
    use crate::live::LiveRegistry;
    use crate::shapes::{ShapeIndex, ShapeLoader, ShapeSource};
    use crate::stops::StopDirectory;
    use crate::store::{MemoryStore, RecordStore};
    use crate::trips::SavedTrips;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoShapes;

    #[async_trait]
    impl ShapeSource for NoShapes {
        async fn fetch(&self, name: &str) -> AppResult<String> {
            Err(AppError::NotFound(name.to_string()))
        }
    }

    fn state(backend: Option<Arc<dyn ChatBackend>>, search_advice_deadline: Duration) -> AppState {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let catalog = Arc::new(RouteCatalog::builtin());
        let learning = Arc::new(LearningService::new(store.clone()));
        let stops = vec![Stop {
            id: "10".to_string(),
            name_en: "Hledan".to_string(),
            name_mm: String::new(),
            coords: Some(LatLng::new(16.8237, 96.1307)),
        }];
        AppState {
            advisory: Arc::new(AdvisoryGateway::new(
                backend,
                catalog.clone(),
                learning.clone(),
                store.clone(),
                Duration::from_secs(20),
            )),
            catalog,
            stops: Arc::new(StopDirectory::from_stops(stops)),
            shapes: Arc::new(ShapeLoader::new(ShapeIndex::default(), Arc::new(NoShapes))),
            live: Arc::new(LiveRegistry::new(Duration::from_millis(1500))),
            trips: Arc::new(SavedTrips::new(store.clone())),
            ledger: Arc::new(CardLedger::new(store)),
            learning,
            feedback: Arc::new(FeedbackService::new(Arc::new(MemoryFeedbackStore::new()))),
            search_advice_deadline,
        }
    }

    fn search_request(from: &str, to: &str) -> Json<SearchRequest> {
        Json(SearchRequest {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    #[tokio::test]
    async fn search_returns_direct_routes_and_saves_trip() {
        let backend: Arc<dyn ChatBackend> = Arc::new(ScriptedBackend::new(vec![Ok("**Take** bus 36".to_string())]));
        let app_state = state(Some(backend), Duration::from_secs(5));
        let Json(res) = search(State(app_state.clone()), search_request("Hledan", "Sule"))
            .await
            .unwrap();
        assert!(!res.results.is_empty());
        assert!(res.results.iter().all(|r| !r.bus_id.is_empty()));
        assert_eq!(res.ai_advice.as_deref(), Some("Take bus 36"));

        let trips = app_state.trips.list().await;
        assert_eq!(
            trips,
            vec![SavedTrip {
                from: "Hledan".to_string(),
                to: "Sule".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_assistant_does_not_hold_back_results() {
        // the assistant answers well inside its own 20s timeout, but after the search deadline
        let backend: Arc<dyn ChatBackend> =
            Arc::new(ScriptedBackend::new(vec![Ok("late".to_string())]).with_delay(Duration::from_secs(15)));
        let deadline = Duration::from_millis(1500);
        let app_state = state(Some(backend), deadline);

        let started = tokio::time::Instant::now();
        let Json(res) = search(State(app_state), search_request("Hledan", "Sule"))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed <= deadline + Duration::from_millis(50), "results took {:?}", elapsed);
        assert!(!res.results.is_empty());
        assert_eq!(res.ai_advice, None);
    }

    #[tokio::test]
    async fn blank_search_is_empty_and_not_saved() {
        let app_state = state(None, Duration::from_secs(1));
        let Json(res) = search(State(app_state.clone()), search_request("  ", "Sule"))
            .await
            .unwrap();
        assert!(res.results.is_empty());
        assert!(res.ai_advice.is_none());
        assert!(app_state.trips.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app_state = state(None, Duration::from_secs(1));
        let err = get_route(State(app_state), Path("999".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn route_list_is_paged() {
        let app_state = state(None, Duration::from_secs(1));
        let Json(page) = list_routes(
            State(app_state),
            Query(ListQuery {
                q: None,
                page: Some(1),
                per_page: Some(3),
            }),
        )
        .await;
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total_items, RouteCatalog::builtin().all().len());
    }

    #[tokio::test]
    async fn nearest_rejects_non_finite_position() {
        let app_state = state(None, Duration::from_secs(1));
        let err = get_nearest(
            State(app_state),
            Query(NearestQuery {
                lat: f64::NAN,
                lng: 96.1,
                k: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn live_mode_without_shape_stays_idle_until_device_reports() {
        let app_state = state(None, Duration::from_secs(1));
        let Json(snap) = live_enable(State(app_state.clone()), Path("36".to_string()))
            .await
            .unwrap();
        assert!(snap.live);
        assert!(snap.vehicles.is_empty());

        let Json(snap) = live_device(
            State(app_state.clone()),
            Path("36".to_string()),
            Json(LatLng::new(16.8238, 96.1308)),
        )
        .await
        .unwrap();
        assert_eq!(snap.vehicles.len(), 1);
        assert_eq!(snap.nearest_stop.map(|n| n.stop.id), Some("10".to_string()));

        live_disable(State(app_state.clone()), Path("36".to_string()))
            .await
            .unwrap();
        assert!(live_snapshot(State(app_state), Path("36".to_string()))
            .await
            .unwrap()
            .0
            .vehicles
            .is_empty());
    }

    #[tokio::test]
    async fn card_overdraft_is_a_conflict() {
        let app_state = state(None, Duration::from_secs(1));
        let err = card_transaction(
            State(app_state),
            Json(TransactionRequest {
                amount: 200.0,
                kind: TxKind::Deduct,
                description: "fare".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailure(_)));
    }
}
