//! Axum HTTP server for the pairing gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    routing::get,
};
use tokio::sync::{RwLock, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{GatewayError, PairingError};
use crate::gateway::types::{CodeQuery, CodeResponse, ErrorResponse, HealthResponse};
use crate::pairing::PairingSessionManager;

/// Maximum accepted request body. `/code` takes its input from the query string.
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Caps how many pairing sessions `/code` may start per window.
///
/// One budget is shared by every caller, so each admitted request costs one
/// session directory and one protocol connection. The budget refills when
/// the window expires.
pub struct RateLimiter {
    /// Sessions `/code` may still start in this window.
    remaining: AtomicU64,
    /// Epoch second the window opened.
    window_start: AtomicU64,
    /// `PAIRING_RATE_LIMIT`.
    max_requests: u64,
    /// `PAIRING_RATE_WINDOW_SECS`.
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            remaining: AtomicU64::new(max_requests),
            window_start: AtomicU64::new(epoch_secs()),
            max_requests,
            window_secs,
        }
    }

    /// Take one session start from the budget. `false` means answer 429.
    pub fn check(&self) -> bool {
        let now = epoch_secs();

        let window = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(window) >= self.window_secs {
            self.window_start.store(now, Ordering::Relaxed);
            self.remaining
                .store(self.max_requests.saturating_sub(1), Ordering::Relaxed);
            return self.max_requests > 0;
        }

        loop {
            let current = self.remaining.load(Ordering::Relaxed);
            if current == 0 {
                return false;
            }
            if self
                .remaining
                .compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub manager: Arc<PairingSessionManager>,
    /// Rate limiter for `/code`.
    pub rate_limiter: RateLimiter,
    /// Shutdown signal sender.
    pub shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(manager: Arc<PairingSessionManager>, rate_limiter: RateLimiter) -> Self {
        Self {
            manager,
            rate_limiter,
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Stop accepting connections. In-flight requests are allowed to finish.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/code", get(code_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<SocketAddr, GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Gateway listening");
    Ok(bound_addr)
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// HTTP status for a failed pairing attempt.
fn error_status(err: &PairingError) -> StatusCode {
    match err {
        PairingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PairingError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        PairingError::ConnectionError(_) | PairingError::PairingRequestFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn code_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<CodeResponse>, ApiError> {
    if !state.rate_limiter.check() {
        return Err(api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Try again shortly.",
        ));
    }

    let number = query.number.unwrap_or_default();
    match state.manager.start_pairing(&number).await {
        Ok(code) => Ok(Json(CodeResponse {
            code: code.to_string(),
        })),
        Err(e) => {
            if e.is_user_error() {
                tracing::debug!(error = %e, "Pairing request rejected");
            } else {
                tracing::error!(error = %e, "Pairing failed");
            }
            Err(api_error(error_status(&e), e.to_string()))
        }
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
