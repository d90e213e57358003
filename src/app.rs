use crate::config::Config;
use crate::consumer::{log_accepted_events, ChannelConsumer, EventConsumer};
use crate::error::AdmissionError;
use crate::idempotency::LeaseStore;
use crate::limiter::TokenBucket;
use crate::metrics::AdmissionMetrics;
use crate::models::{Acceptance, AcceptedEvent, InboundEvent};
use crate::request_headers::{IdempotencyKey, XSignature};
use crate::signature::SignatureVerifier;
use crate::tracker::{PlayerSnapshot, PlayerTracker};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::TypedHeader;
use chrono::Utc;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// Shared stores injected into every handler. Each store owns its own lock.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<SignatureVerifier>,
    pub leases: Arc<LeaseStore>,
    pub limiter: Arc<TokenBucket>,
    pub tracker: Arc<PlayerTracker>,
    pub metrics: Arc<AdmissionMetrics>,
    pub consumer: Arc<dyn EventConsumer>,
    pub forward_sem: Arc<Semaphore>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(config: &Config, consumer: Arc<dyn EventConsumer>) -> Result<Self> {
        Ok(Self {
            verifier: Arc::new(config.verifier.clone()),
            leases: Arc::new(LeaseStore::new(config.idempotency_ttl)),
            limiter: Arc::new(TokenBucket::new(
                config.rate_limit_rps,
                config.rate_limit_burst,
            )),
            tracker: Arc::new(PlayerTracker::new(
                config.policy.clone(),
                config.player_shards,
            )),
            metrics: Arc::new(AdmissionMetrics::new()?),
            consumer,
            forward_sem: Arc::new(Semaphore::new(config.max_concurrent_forwards)),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let (consumer, rx) = ChannelConsumer::new(config.consumer_capacity);
    tokio::spawn(log_accepted_events(rx));

    let state = AppState::new(&config, Arc::new(consumer))?;
    let policy = state.tracker.policy();
    info!(
        anomaly_threshold = policy.anomaly_threshold,
        score_threshold = policy.score_threshold,
        flood_block_secs = policy.flood_block.num_seconds(),
        score_block_secs = policy.score_block.num_seconds(),
        idempotency_ttl_secs = state.leases.ttl().as_secs(),
        rate = config.rate_limit_rps,
        burst = config.rate_limit_burst,
        shards = config.player_shards,
        "Fairness policy loaded"
    );
    let housekeeping =
        spawn_housekeeping(&state, config.housekeeping_interval, config.player_idle_ttl);

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    housekeeping.abort();
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/check-event", post(check_event))
        .route("/blocked-players", get(blocked_players))
        .route("/player/:player_id", get(player_status))
        .route("/unblock/:player_id", put(unblock_player))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drops expired idempotency leases and, when `player_idle_ttl`
/// is set, records of players that have gone quiet.
pub fn spawn_housekeeping(
    state: &AppState,
    every: Duration,
    player_idle_ttl: Option<chrono::Duration>,
) -> JoinHandle<()> {
    let leases = Arc::clone(&state.leases);
    let tracker = Arc::clone(&state.tracker);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = leases.purge_expired(Instant::now());
            let evicted = player_idle_ttl
                .map(|ttl| tracker.evict_idle(Utc::now(), ttl))
                .unwrap_or(0);
            if purged > 0 || evicted > 0 {
                debug!(purged, evicted, "Housekeeping pass");
            }
        }
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn check_event(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    signature: Option<TypedHeader<XSignature>>,
    idempotency_key: Option<TypedHeader<IdempotencyKey>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = signature.map(|TypedHeader(XSignature(s))| s);
    let idempotency_key = idempotency_key.map(|TypedHeader(IdempotencyKey(k))| k);

    match admit(
        &state,
        &method,
        uri.path(),
        &headers,
        signature.as_deref(),
        idempotency_key.as_deref(),
        &body,
    ) {
        Ok(ack) => {
            state.metrics.record_approved();
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(err) => {
            state.metrics.record_rejection(&err);
            warn!(
                error = err.code(),
                idempotency_key = ?idempotency_key,
                "Rejecting event: {}",
                err
            );
            err.into_response()
        }
    }
}

/// Runs the admission pipeline in order: content type, signature,
/// idempotency lease, global limiter, payload validation, fairness check.
/// The lease is held until this function returns, on every path.
fn admit(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    signature: Option<&str>,
    idempotency_key: Option<&str>,
    body: &[u8],
) -> Result<Acceptance, AdmissionError> {
    let content_type_ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        == Some(true);
    if !content_type_ok {
        return Err(AdmissionError::UnsupportedMediaType);
    }

    state
        .verifier
        .verify(signature, method.as_str(), path, body)?;

    let _lease = idempotency_key
        .map(|key| state.leases.try_acquire(key))
        .transpose()?;

    state.limiter.check()?;

    let event = InboundEvent::parse(body)?;
    let admission = state.tracker.check_event(&event)?;

    let ack = Acceptance {
        status: "approved",
        player_id: event.player_id.clone(),
        event_type: event.event_type,
        timestamp: admission.accepted_at.timestamp(),
    };
    forward(
        state,
        AcceptedEvent {
            event,
            accepted_at: ack.timestamp,
            cumulative_score: admission.cumulative_score,
        },
    );
    Ok(ack)
}

fn forward(state: &AppState, accepted: AcceptedEvent) {
    let consumer = Arc::clone(&state.consumer);
    let sem = Arc::clone(&state.forward_sem);
    tokio::spawn(async move {
        let _permit = match sem.acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let player_id = accepted.event.player_id.clone();
        if let Err(err) = consumer.consume(accepted).await {
            error!(player_id = %player_id, "Failed to forward admitted event: {:?}", err);
        }
    });
}

async fn blocked_players(State(state): State<AppState>) -> Json<serde_json::Value> {
    let players: Vec<PlayerSnapshot> = state.tracker.blocked_players();
    let entries: Vec<_> = players
        .iter()
        .map(|p| {
            json!({
                "playerId": p.player_id,
                "blockedUntil": p.blocked_until.map(|t| t.timestamp()),
                "reason": p.block_reason,
                "eventCountInWindow": p.event_count_in_window,
                "cumulativeScore": p.cumulative_score,
            })
        })
        .collect();
    Json(json!({
        "blockedPlayers": entries,
        "count": entries.len(),
    }))
}

async fn player_status(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerSnapshot>, AdmissionError> {
    state
        .tracker
        .snapshot(&player_id)
        .map(Json)
        .ok_or(AdmissionError::NotFound)
}

async fn unblock_player(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<serde_json::Value>, AdmissionError> {
    let snapshot = state.tracker.unblock(&player_id)?;
    Ok(Json(json!({
        "status": "unblocked",
        "playerId": snapshot.player_id,
    })))
}

async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.set_tracked_players(state.tracker.len());
    state.metrics.set_live_leases(state.leases.len());
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!("Failed to encode metrics: {:?}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
