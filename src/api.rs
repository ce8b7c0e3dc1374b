//! Reader HTTP boundary.
//!
//! Two stitching entry points per reader session (history request and
//! incremental poll), instrument/config metadata for the UI, and a WebSocket
//! stream of live ticks per instrument.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Json as AxumJson, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::PriceCache;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{Instrument, PriceTick};
use crate::notify::PriceNotifier;
use crate::stitcher::{MergedView, ReaderSession};
use crate::store::DurableStore;

// =============================================================================
// Session registry
// =============================================================================

struct SessionSlot {
    session: ReaderSession,
    last_used: Instant,
}

/// Live reader sessions keyed by id. Each session has its own lock, so two
/// readers never wait on each other.
pub struct ReaderSessions {
    slots: RwLock<HashMap<Uuid, Arc<Mutex<SessionSlot>>>>,
    idle_timeout: Duration,
}

impl ReaderSessions {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Register a session, dropping any that have been idle too long.
    pub fn create(&self, session: ReaderSession) -> Uuid {
        let pruned = self.prune_idle();
        if pruned > 0 {
            debug!(pruned, "Pruned idle reader sessions");
        }

        let id = Uuid::new_v4();
        self.slots.write().insert(
            id,
            Arc::new(Mutex::new(SessionSlot {
                session,
                last_used: Instant::now(),
            })),
        );
        id
    }

    /// Run `f` against a session. `None` when the id is unknown.
    pub fn with_session<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut ReaderSession) -> R,
    ) -> Option<R> {
        let slot = self.slots.read().get(id).cloned()?;
        let mut slot = slot.lock();
        slot.last_used = Instant::now();
        Some(f(&mut slot.session))
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.slots.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_idle(&self) -> usize {
        let idle = self.idle_timeout;
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| slot.lock().last_used.elapsed() < idle);
        before - slots.len()
    }
}

// =============================================================================
// State & router
// =============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<PipelineConfig>,
    pub cache: Arc<dyn PriceCache>,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<PriceNotifier>,
    pub sessions: Arc<ReaderSessions>,
}

impl ApiState {
    fn new_session(&self) -> ReaderSession {
        ReaderSession::new(
            self.cache.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.history_lookback_ms(),
        )
    }

    fn knows_instrument(&self, id: &str) -> bool {
        self.config.instruments.iter().any(|i| i.id == id)
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/instruments", get(get_instruments))
        .route("/api/config", get(get_config))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/history", post(post_history))
        .route("/api/sessions/:id/poll", get(get_poll))
        .route("/ws/prices/:instrument", get(price_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown flag flips.
pub async fn serve(
    state: ApiState,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Reader API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Reader API server error")
}

// =============================================================================
// Handlers
// =============================================================================

type ApiError = (StatusCode, String);

fn pipeline_error(e: PipelineError) -> ApiError {
    let status = match e {
        PipelineError::TransientIo { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::DataShape(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(status = status.as_u16(), error = %e, "Reader request failed");
    (status, e.to_string())
}

fn unknown_session(id: &Uuid) -> ApiError {
    (StatusCode::NOT_FOUND, format!("unknown session {}", id))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn get_instruments(State(state): State<ApiState>) -> Json<Vec<Instrument>> {
    Json(state.config.instruments.clone())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigResponse {
    pub retention_minutes: u64,
    pub tick_period_ms: u64,
    pub sync_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub history_lookback_minutes: u64,
}

async fn get_config(State(state): State<ApiState>) -> Json<ConfigResponse> {
    let c = &state.config;
    Json(ConfigResponse {
        retention_minutes: c.retention_minutes,
        tick_period_ms: c.tick_period_ms,
        sync_interval_secs: c.sync_interval_secs,
        poll_interval_ms: c.poll_interval_ms,
        history_lookback_minutes: c.history_lookback_minutes,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
}

async fn create_session(State(state): State<ApiState>) -> Json<SessionCreated> {
    let session_id = state.sessions.create(state.new_session());
    debug!(session = %session_id, active = state.sessions.len(), "Reader session created");
    Json(SessionCreated { session_id })
}

async fn delete_session(Path(id): Path<Uuid>, State(state): State<ApiState>) -> StatusCode {
    if state.sessions.remove(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub instruments: Vec<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

async fn post_history(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
    AxumJson(req): AxumJson<HistoryRequest>,
) -> Result<Json<MergedView>, ApiError> {
    state
        .sessions
        .with_session(&id, |session| {
            // Reject a range the caller inverted, including one where only
            // `from` was given and it lies past now
            let (from, to) = session.history_window(req.from, req.to);
            if from > to {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("from ({}) is after to ({})", from, to),
                ));
            }
            session
                .load_history(&req.instruments, req.from, req.to)
                .map_err(pipeline_error)
        })
        .ok_or_else(|| unknown_session(&id))?
        .map(Json)
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// Comma separated instrument ids; absent or empty means all.
    pub instruments: Option<String>,
}

impl PollQuery {
    fn instrument_list(&self) -> Vec<String> {
        self.instruments
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

async fn get_poll(
    Path(id): Path<Uuid>,
    Query(query): Query<PollQuery>,
    State(state): State<ApiState>,
) -> Result<Json<MergedView>, ApiError> {
    let instruments = query.instrument_list();
    state
        .sessions
        .with_session(&id, |session| session.poll(&instruments))
        .ok_or_else(|| unknown_session(&id))?
        .map(Json)
        .map_err(pipeline_error)
}

/// Live `{time, value}` ticks for one instrument.
async fn price_stream(
    ws: WebSocketUpgrade,
    Path(instrument): Path<String>,
    State(state): State<ApiState>,
) -> Response {
    if !state.knows_instrument(&instrument) {
        return (StatusCode::NOT_FOUND, format!("unknown instrument {}", instrument))
            .into_response();
    }
    let rx = state.notifier.subscribe(&instrument);
    ws.on_upgrade(move |socket| stream_prices(socket, instrument, rx))
}

async fn stream_prices(
    socket: WebSocket,
    instrument: String,
    mut rx: broadcast::Receiver<PriceTick>,
) {
    debug!(instrument = %instrument, "Live price listener connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            tick = rx.recv() => match tick {
                Ok(tick) => {
                    let msg = match serde_json::to_string(&tick) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to serialize price tick: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(instrument = %instrument, skipped, "Live price listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    let _ = sender.send(Message::Text("pong".to_string())).await;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(instrument = %instrument, "Live price listener disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TimeSeriesCache;
    use crate::clock::ManualClock;
    use crate::models::PriceSample;
    use crate::store::SqlitePriceStore;

    fn test_state(idle: Duration) -> (Arc<ManualClock>, Arc<TimeSeriesCache>, Arc<SqlitePriceStore>, ApiState) {
        let clock = Arc::new(ManualClock::new(10_000));
        let cache = Arc::new(TimeSeriesCache::new(60_000, clock.clone()));
        let store = Arc::new(SqlitePriceStore::open_memory().unwrap());
        let state = ApiState {
            config: Arc::new(PipelineConfig::default()),
            cache: cache.clone(),
            store: store.clone(),
            clock: clock.clone(),
            notifier: Arc::new(PriceNotifier::new(16)),
            sessions: Arc::new(ReaderSessions::new(idle)),
        };
        (clock, cache, store, state)
    }

    #[tokio::test]
    async fn test_history_and_poll_through_handlers() {
        let (clock, cache, store, state) = test_state(Duration::from_secs(60));
        store.insert_ignore(&[PriceSample::new("ticker_999", 9_000, 1)]).unwrap();
        cache.append(PriceSample::new("ticker_999", 9_000, 1)).unwrap();
        cache.append(PriceSample::new("ticker_999", 10_000, 2)).unwrap();

        let Json(created) = create_session(State(state.clone())).await;
        let id = created.session_id;

        let Json(history) = post_history(
            Path(id),
            State(state.clone()),
            AxumJson(HistoryRequest {
                instruments: vec!["ticker_999".to_string()],
                from: None,
                to: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 2);

        clock.set(11_000);
        cache.append(PriceSample::new("ticker_999", 11_000, 3)).unwrap();
        let Json(polled) = get_poll(
            Path(id),
            Query(PollQuery {
                instruments: Some("ticker_999".to_string()),
            }),
            State(state.clone()),
        )
        .await
        .unwrap();
        assert_eq!(polled.len(), 3);
        assert_eq!(polled.cursors["ticker_999"], 11_000);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (_clock, _cache, _store, state) = test_state(Duration::from_secs(60));
        let err = get_poll(Path(Uuid::new_v4()), Query(PollQuery::default()), State(state.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        assert_eq!(delete_session(Path(Uuid::new_v4()), State(state)).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_inverted_range_is_bad_request() {
        let (_clock, _cache, _store, state) = test_state(Duration::from_secs(60));
        let Json(created) = create_session(State(state.clone())).await;
        let err = post_history(
            Path(created.session_id),
            State(state),
            AxumJson(HistoryRequest {
                instruments: vec![],
                from: Some(5),
                to: Some(1),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_future_from_without_to_is_bad_request() {
        let (_clock, _cache, _store, state) = test_state(Duration::from_secs(60));
        let Json(created) = create_session(State(state.clone())).await;
        let err = post_history(
            Path(created.session_id),
            State(state.clone()),
            AxumJson(HistoryRequest {
                instruments: vec!["ticker_999".to_string()],
                from: Some(20_000),
                to: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        // A valid request still goes through on the same session
        let ok = post_history(
            Path(created.session_id),
            State(state),
            AxumJson(HistoryRequest {
                instruments: vec!["ticker_999".to_string()],
                from: None,
                to: Some(5_000),
            }),
        )
        .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_delete_session_empties_registry() {
        let (_clock, _cache, _store, state) = test_state(Duration::from_secs(60));
        assert!(state.sessions.is_empty());

        let Json(created) = create_session(State(state.clone())).await;
        assert!(!state.sessions.is_empty());

        let status = delete_session(Path(created.session_id), State(state.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(pipeline_error(PipelineError::store("down")).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(pipeline_error(PipelineError::DataShape("x".into())).0, StatusCode::BAD_GATEWAY);
        assert_eq!(
            pipeline_error(PipelineError::Configuration("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_idle_sessions_pruned_on_create() {
        let (_clock, _cache, _store, state) = test_state(Duration::ZERO);
        let first = state.sessions.create(state.new_session());
        let second = state.sessions.create(state.new_session());

        assert_eq!(state.sessions.len(), 1);
        assert!(state.sessions.with_session(&first, |_| ()).is_none());
        assert!(state.sessions.with_session(&second, |_| ()).is_some());
    }

    #[test]
    fn test_poll_query_parsing() {
        let q = PollQuery {
            instruments: Some(" a, ,b ".to_string()),
        };
        assert_eq!(q.instrument_list(), vec!["a".to_string(), "b".to_string()]);
        assert!(PollQuery::default().instrument_list().is_empty());
    }
}
