//! Reverse proxy that puts a [`ServiceWorker`] in front of the origin.
//!
//! Every request that is not a control route becomes a fetch event. Control
//! routes live under `/__giftcache/`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::http::{Request, RequestMode, Response};
use crate::message::ControlMessage;
use crate::network::{Network, is_hop_by_hop};
use crate::state::Registration;
use crate::stats::StatsSnapshot;
use crate::store::CacheStorage;
use crate::worker::{CacheListing, MessageOutcome, ServiceWorker};

pub const STATUS_PATH: &str = "/__giftcache/status";
pub const MESSAGE_PATH: &str = "/__giftcache/message";

struct AppState<S, N> {
    worker: Arc<ServiceWorker<S, N>>,
    registration_path: Option<PathBuf>,
    max_body_bytes: usize,
}

impl<S, N> Clone for AppState<S, N> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            registration_path: self.registration_path.clone(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    cache_name: String,
    strategy: String,
    origin: String,
    pending: usize,
    registration: Registration,
    stats: StatsSnapshot,
    caches: Vec<CacheListing>,
}

/// Maps library errors onto HTTP statuses for the control routes.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let status = match self.0 {
            Error::Message(_) | Error::Json(_) | Error::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            Error::NotInstalled => StatusCode::CONFLICT,
            Error::Precache { .. } | Error::Http(_) | Error::Offline => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

/// Decides whether a request is a page navigation.
///
/// Browsers send `Sec-Fetch-Mode: navigate`; older clients are recognised by a
/// `GET` that accepts HTML.
#[must_use]
pub fn request_mode(method: &axum::http::Method, headers: &HeaderMap) -> RequestMode {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(mode) = header("sec-fetch-mode") {
        return if mode.eq_ignore_ascii_case("navigate") {
            RequestMode::Navigate
        } else {
            RequestMode::Subresource
        };
    }
    if method == axum::http::Method::GET && header("accept").is_some_and(|a| a.contains("text/html")) {
        RequestMode::Navigate
    } else {
        RequestMode::Subresource
    }
}

/// Builds the proxy router.
pub fn router<S, N>(
    worker: Arc<ServiceWorker<S, N>>,
    config: &ProxyConfig,
    registration_path: Option<PathBuf>,
) -> Router
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let state = AppState {
        worker,
        registration_path,
        max_body_bytes: config.max_body_bytes,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let control = Router::new()
        .route(STATUS_PATH, get(status::<S, N>))
        .route(MESSAGE_PATH, post(message::<S, N>))
        .layer(cors);

    Router::new()
        .merge(control)
        .fallback(fetch::<S, N>)
        .with_state(state)
}

async fn status<S, N>(
    State(state): State<AppState<S, N>>,
) -> std::result::Result<axum::Json<StatusReport>, ApiError>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let worker = &state.worker;
    Ok(axum::Json(StatusReport {
        cache_name: worker.config().cache_name(),
        strategy: worker.config().strategy.to_string(),
        origin: worker.origin().to_string(),
        pending: worker.pending(),
        registration: worker.registration().await,
        stats: worker.stats(),
        caches: worker.caches().await?,
    }))
}

async fn message<S, N>(
    State(state): State<AppState<S, N>>,
    axum::Json(payload): axum::Json<serde_json::Value>,
) -> std::result::Result<axum::Json<MessageOutcome>, ApiError>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let message = ControlMessage::from_value(payload)?;
    log::info!("Control message {}", message.to_json());
    let outcome = state.worker.post_message(message).await?;
    persist(&state).await;
    Ok(axum::Json(outcome))
}

async fn fetch<S, N>(State(state): State<AppState<S, N>>, request: HttpRequest) -> HttpResponse
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let request = match into_fetch_request(&state, request).await {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Rejected request: {e}");
            return ApiError(e).into_response();
        }
    };
    into_http_response(state.worker.respond(&request).await)
}

async fn into_fetch_request<S, N>(state: &AppState<S, N>, request: HttpRequest) -> Result<Request>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let (parts, body) = request.into_parts();
    let url = crate::url::on_origin(state.worker.origin(), parts.uri.path(), parts.uri.query());
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| Error::Message(format!("request body: {e}")))?;

    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut fetch = Request::new(parts.method.clone(), url)
        .with_mode(request_mode(&parts.method, &parts.headers))
        .with_body(body);
    fetch.headers = headers;
    Ok(fetch)
}

fn into_http_response(response: Response) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, value) in response.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().append(name, value);
        }
    }
    out
}

async fn persist<S, N>(state: &AppState<S, N>)
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    if let Some(path) = &state.registration_path {
        if let Err(e) = state.worker.registration().await.save(path) {
            log::error!("Failed to save registration to {}: {e}", path.display());
        }
    }
}

/// Resolves on SIGINT or SIGTERM (systemd sends SIGTERM).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }
}

/// Serves the proxy until SIGINT/SIGTERM, then waits for pending work and
/// saves the registration.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn serve<S, N>(
    worker: Arc<ServiceWorker<S, N>>,
    config: &ProxyConfig,
    registration_path: Option<PathBuf>,
) -> Result<()>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::InvalidUrl {
            url: format!("{}:{}", config.host, config.port),
            reason: format!("{e}"),
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!(
        "Proxying {} on http://{addr} (cache {})",
        worker.origin(),
        worker.config().cache_name()
    );

    let app = router(Arc::clone(&worker), config, registration_path.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Waiting for {} pending task(s)", worker.pending());
    worker.shutdown().await;
    if let Some(path) = registration_path {
        worker.registration().await.save(&path)?;
    }
    Ok(())
}
