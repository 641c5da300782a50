//! Live vehicle positions for the route on screen.
//!
//! A session is either idle, stepping synthetic vehicles along the route
//! polyline on a timer, or following a single device-reported position.
//! Exactly one source writes vehicle state at a time: switching to device
//! mode aborts the timer under the same lock that replaces the vehicles, and
//! every timer carries an epoch it must still own before stepping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::geo::LatLng;
use crate::models::{Stop, Vehicle};
use crate::nearest::{nearest_on_map, GeoFailure};
use crate::shapes::ShapeLoader;

pub const MIN_VEHICLES: usize = 2;
pub const MAX_VEHICLES: usize = 8;
const POINTS_PER_VEHICLE: usize = 30;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Inactive,
    Simulating,
    DeviceDriven,
}

pub fn vehicle_count(polyline_len: usize) -> usize {
    (polyline_len / POINTS_PER_VEHICLE).clamp(MIN_VEHICLES, MAX_VEHICLES)
}

fn is_peak_hour(hour: u32) -> bool {
    (7..9).contains(&hour) || (16..19).contains(&hour)
}

/// Tick period for the given local hour: slower in the two peak windows
/// (07:00–09:00, 16:00–19:00), faster otherwise. Never zero.
pub fn interval_for_hour(base: Duration, hour: u32) -> Duration {
    let scaled = if is_peak_hour(hour) {
        base * 3 / 2
    } else {
        base * 3 / 4
    };
    scaled.max(MIN_INTERVAL)
}

fn synthetic_vehicles(route_id: &str, polyline: &[LatLng]) -> Vec<Vehicle> {
    if polyline.is_empty() {
        return Vec::new();
    }
    let n = vehicle_count(polyline.len());
    (0..n)
        .map(|i| {
            let idx = i * polyline.len() / n;
            let at = polyline[idx];
            Vehicle {
                id: format!("{}-sim-{}", route_id, i + 1),
                route_id: route_id.to_string(),
                position_index: idx,
                lat: at.lat,
                lng: at.lng,
            }
        })
        .collect()
}

/// Move every vehicle one point forward, looping at the end of the line.
fn advance(vehicles: &mut [Vehicle], polyline: &[LatLng]) {
    if polyline.is_empty() {
        return;
    }
    for v in vehicles.iter_mut() {
        v.position_index = (v.position_index + 1) % polyline.len();
        let at = polyline[v.position_index];
        v.lat = at.lat;
        v.lng = at.lng;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NearestOverlay {
    pub stop: Stop,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub route_id: String,
    pub live: bool,
    pub state: LiveState,
    pub vehicles: Vec<Vehicle>,
    pub interval_ms: u64,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_stop: Option<NearestOverlay>,
}

struct Inner {
    route_id: String,
    live: bool,
    state: LiveState,
    vehicles: Vec<Vehicle>,
    polyline: Vec<LatLng>,
    interval: Duration,
    last_error: Option<String>,
    timer: Option<JoinHandle<()>>,
    // identifies the timer allowed to step
    epoch: u64,
    // bumped when live mode is switched off; stale shape loads compare against it
    session: u64,
    ticks: u64,
}

impl Inner {
    fn stop_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.epoch += 1;
    }
}

pub struct LiveSimulator {
    inner: Arc<Mutex<Inner>>,
}

fn spawn_timer(inner: Arc<Mutex<Inner>>, epoch: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut guard = inner.lock().await;
            if guard.epoch != epoch || guard.state != LiveState::Simulating {
                debug!("Simulation timer for route {} retired", guard.route_id);
                break;
            }
            let Inner {
                vehicles, polyline, ..
            } = &mut *guard;
            advance(vehicles, polyline);
            guard.ticks += 1;
        }
    })
}

impl LiveSimulator {
    pub fn new(route_id: &str, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                route_id: route_id.to_string(),
                live: false,
                state: LiveState::Inactive,
                vehicles: Vec::new(),
                polyline: Vec::new(),
                interval,
                last_error: None,
                timer: None,
                epoch: 0,
                session: 0,
                ticks: 0,
            })),
        }
    }

    pub async fn route_id(&self) -> String {
        self.inner.lock().await.route_id.clone()
    }

    /// Turn live mode on; returns a token for [`Self::start_simulation`].
    pub async fn switch_on(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.live = true;
        inner.session
    }

    /// Begin stepping synthetic vehicles along `polyline`.
    ///
    /// Ignored when the token is stale (live mode was switched off meanwhile),
    /// when a device stream already drives the session, or when there is no
    /// polyline to follow.
    pub async fn start_simulation(&self, token: u64, polyline: Vec<LatLng>) -> LiveState {
        let mut inner = self.inner.lock().await;
        if !inner.live || inner.session != token {
            debug!("Dropping stale shape for route {}", inner.route_id);
            return inner.state;
        }
        if inner.state != LiveState::Inactive {
            return inner.state;
        }
        if polyline.is_empty() {
            warn!("Route {} has no shape, live mode stays idle", inner.route_id);
            return inner.state;
        }

        inner.vehicles = synthetic_vehicles(&inner.route_id, &polyline);
        inner.polyline = polyline;
        inner.state = LiveState::Simulating;
        inner.stop_timer();
        inner.timer = Some(spawn_timer(self.inner.clone(), inner.epoch, inner.interval));
        info!(
            "Simulating {} vehicles on route {} every {:?}",
            inner.vehicles.len(),
            inner.route_id,
            inner.interval
        );
        inner.state
    }

    /// A real position arrived: drop synthetic vehicles and follow the device.
    pub async fn device_position(&self, at: LatLng) -> AppResult<LiveState> {
        if !at.is_finite() {
            return Err(AppError::BadRequest("device position must be finite".to_string()));
        }
        let mut inner = self.inner.lock().await;
        if !inner.live {
            return Err(AppError::BadRequest(format!(
                "live mode is off for route {}",
                inner.route_id
            )));
        }
        inner.stop_timer();
        if inner.state != LiveState::DeviceDriven {
            info!("Route {} now follows the device position", inner.route_id);
        }
        inner.vehicles = vec![Vehicle {
            id: format!("{}-device", inner.route_id),
            route_id: inner.route_id.clone(),
            position_index: 0,
            lat: at.lat,
            lng: at.lng,
        }];
        inner.state = LiveState::DeviceDriven;
        inner.last_error = None;
        Ok(inner.state)
    }

    /// Record a geolocation failure for display; the state is left as is.
    pub async fn report_device_error(&self, failure: GeoFailure) -> String {
        let message = AppError::from(failure).to_string();
        let mut inner = self.inner.lock().await;
        warn!("Device location failed for route {}: {}", inner.route_id, message);
        inner.last_error = Some(message.clone());
        message
    }

    /// Switch live mode off: no vehicles, no timer.
    pub async fn disable(&self) {
        let mut inner = self.inner.lock().await;
        inner.stop_timer();
        inner.vehicles.clear();
        inner.polyline.clear();
        inner.state = LiveState::Inactive;
        inner.live = false;
        inner.last_error = None;
        inner.session += 1;
    }

    /// Change the tick period, replacing the running timer if any.
    pub async fn set_interval(&self, interval: Duration) -> AppResult<()> {
        if interval.is_zero() {
            return Err(AppError::BadRequest("interval must be positive".to_string()));
        }
        let mut inner = self.inner.lock().await;
        inner.interval = interval;
        if inner.state == LiveState::Simulating {
            inner.stop_timer();
            inner.timer = Some(spawn_timer(self.inner.clone(), inner.epoch, interval));
        }
        Ok(())
    }

    pub async fn state(&self) -> LiveState {
        self.inner.lock().await.state
    }

    pub async fn vehicles(&self) -> Vec<Vehicle> {
        self.inner.lock().await.vehicles.clone()
    }

    pub async fn timer_running(&self) -> bool {
        self.inner.lock().await.timer.is_some()
    }

    pub async fn snapshot(&self, stops: &[Stop]) -> LiveSnapshot {
        let inner = self.inner.lock().await;
        let nearest_stop = inner.vehicles.first().and_then(|v| {
            nearest_on_map(LatLng::new(v.lat, v.lng), stops)
                .map(|(stop, distance_m)| NearestOverlay { stop, distance_m })
        });
        LiveSnapshot {
            route_id: inner.route_id.clone(),
            live: inner.live,
            state: inner.state,
            vehicles: inner.vehicles.clone(),
            interval_ms: inner.interval.as_millis() as u64,
            last_error: inner.last_error.clone(),
            nearest_stop,
        }
    }

    #[cfg(test)]
    async fn ticks(&self) -> u64 {
        self.inner.lock().await.ticks
    }
}

/// The live session for the route currently on screen.
///
/// Showing another route tears the previous session down.
pub struct LiveRegistry {
    base_interval: Duration,
    current: Mutex<Option<Arc<LiveSimulator>>>,
}

impl LiveRegistry {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            current: Mutex::new(None),
        }
    }

    fn interval_now(&self) -> Duration {
        interval_for_hour(self.base_interval, chrono::Local::now().hour())
    }

    async fn session_for(&self, route_id: &str) -> Arc<LiveSimulator> {
        let mut current = self.current.lock().await;
        if let Some(sim) = current.as_ref() {
            if sim.route_id().await == route_id {
                return sim.clone();
            }
            sim.disable().await;
        }
        let sim = Arc::new(LiveSimulator::new(route_id, self.interval_now()));
        *current = Some(sim.clone());
        sim
    }

    pub async fn get(&self, route_id: &str) -> AppResult<Arc<LiveSimulator>> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(sim) if sim.route_id().await == route_id => Ok(sim.clone()),
            _ => Err(AppError::NotFound(format!(
                "no live session for route {}",
                route_id
            ))),
        }
    }

    /// Switch live mode on for a route and start simulating once its shape loads.
    pub async fn enable(&self, route_id: &str, shapes: &ShapeLoader) -> Arc<LiveSimulator> {
        let sim = self.session_for(route_id).await;
        let token = sim.switch_on().await;
        let shape = shapes.load_shape(route_id).await;
        sim.start_simulation(token, shape.polyline).await;
        sim
    }

    pub async fn disable(&self, route_id: &str) -> AppResult<()> {
        let sim = self.get(route_id).await?;
        sim.disable().await;
        Ok(())
    }
}
