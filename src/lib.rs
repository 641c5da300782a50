pub mod advisory;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod geo;
pub mod handlers;
pub mod learning;
pub mod ledger;
pub mod live;
pub mod matcher;
pub mod models;
pub mod nearest;
pub mod shapes;
pub mod stops;
pub mod store;
pub mod telemetry;
pub mod trips;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::advisory::{AdvisoryGateway, ChatBackend, GeminiBackend};
use crate::catalog::RouteCatalog;
use crate::config::AppConfig;
use crate::feedback::{FeedbackService, FeedbackStore, MemoryFeedbackStore, SupabaseFeedbackStore};
use crate::learning::LearningService;
use crate::ledger::CardLedger;
use crate::live::LiveRegistry;
use crate::shapes::{FsShapeSource, HttpShapeSource, ShapeIndex, ShapeLoader, ShapeSource};
use crate::stops::{StopDirectory, StopSource};
use crate::store::{JsonFileStore, MemoryStore, RecordStore};
use crate::trips::SavedTrips;

/// Services shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<RouteCatalog>,
    pub stops: Arc<StopDirectory>,
    pub shapes: Arc<ShapeLoader>,
    pub live: Arc<LiveRegistry>,
    pub trips: Arc<SavedTrips>,
    pub ledger: Arc<CardLedger>,
    pub learning: Arc<LearningService>,
    pub advisory: Arc<AdvisoryGateway>,
    pub feedback: Arc<FeedbackService>,
    /// How long `POST /search` waits for route advice before answering without it.
    pub search_advice_deadline: Duration,
}

impl AppState {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let catalog = match &config.routes_path {
            Some(path) => RouteCatalog::from_json_file(Path::new(path))
                .with_context(|| format!("Failed to load route catalog from {}", path))?,
            None => RouteCatalog::builtin(),
        };
        info!("Route catalog holds {} routes", catalog.all().len());

        let store: Arc<dyn RecordStore> = match &config.store_path {
            Some(path) => Arc::new(
                JsonFileStore::open(path)
                    .await
                    .with_context(|| format!("Failed to open record store {}", path))?,
            ),
            None => {
                info!("YBS_STORE_PATH not set, records are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let index = match &config.shape_index {
            Some(path) => ShapeIndex::from_file(Path::new(path))
                .await
                .with_context(|| format!("Failed to load shape index {}", path))?,
            None => ShapeIndex::default(),
        };
        let source: Arc<dyn ShapeSource> = if config.shapes_are_remote() {
            Arc::new(HttpShapeSource::new(&config.shapes_base, client.clone()))
        } else {
            Arc::new(FsShapeSource::new(&config.shapes_base))
        };

        let backend: Option<Arc<dyn ChatBackend>> = config.gemini.as_ref().map(|g| {
            Arc::new(GeminiBackend::new(client.clone(), &g.api_key, &g.model, &g.base_url))
                as Arc<dyn ChatBackend>
        });
        if backend.is_none() {
            info!("GEMINI_API_KEY not set, assistant answers use offline fallbacks");
        }

        let feedback_store: Arc<dyn FeedbackStore> = match &config.supabase {
            Some(s) => Arc::new(SupabaseFeedbackStore::new(client.clone(), &s.url, &s.anon_key)),
            None => {
                info!("Supabase not configured, feedback is kept in memory");
                Arc::new(MemoryFeedbackStore::new())
            }
        };

        let catalog = Arc::new(catalog);
        let learning = Arc::new(LearningService::new(store.clone()));
        let advisory = Arc::new(AdvisoryGateway::new(
            backend,
            catalog.clone(),
            learning.clone(),
            store.clone(),
            timeout,
        ));

        Ok(Self {
            catalog,
            stops: Arc::new(StopDirectory::new(StopSource::parse(&config.stops_source), client)),
            shapes: Arc::new(ShapeLoader::new(index, source)),
            live: Arc::new(LiveRegistry::new(Duration::from_millis(config.sim_interval_ms))),
            trips: Arc::new(SavedTrips::new(store.clone())),
            ledger: Arc::new(CardLedger::new(store)),
            learning,
            advisory,
            feedback: Arc::new(FeedbackService::new(feedback_store)),
            search_advice_deadline: Duration::from_millis(config.search_advice_ms),
        })
    }
}
