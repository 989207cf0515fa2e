//! Local offline proxy: every request to the server is handed to the active
//! worker as if a controlled page had issued it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use url::Url;
use uuid::Uuid;

use crate::cache::open_storage;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::format::{format_bytes, format_duration, format_percent};
use crate::http::{FetchRequest, RequestMode, is_hop_by_hop};
use crate::network::HttpNetwork;
use crate::registration::Registration;
use crate::worker::FetchOutcome;

/// Response header naming where a proxied response came from.
pub const SOURCE_HEADER: &str = "x-octo-sw-source";

/// Cookie identifying a client page across navigations.
pub const CLIENT_COOKIE: &str = "octo-sw-client";

#[derive(Clone)]
struct AppState {
    registration: Arc<Registration>,
    origin: Url,
    body_limit: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn api_health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_status(State(state): State<AppState>) -> Response {
    match state.registration.status().await {
        Ok(status) => axum::Json(status).into_response(),
        Err(e) => {
            log::error!("Failed to read registration status: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Resolves the request target against the proxied origin.
///
/// Absolute-form targets are accepted only for the proxied origin; the proxy
/// never fetches other hosts.
fn request_url(origin: &Url, uri: &Uri) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string())
            .ok()
            .filter(|url| url.origin() == origin.origin());
    }
    let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
    origin.join(target).ok()
}

/// Detects top-level document loads.
///
/// Browsers send `Sec-Fetch-Mode: navigate`; older clients are recognised by
/// a `GET` that accepts HTML.
fn is_navigation(method: &axum::http::Method, headers: &HeaderMap) -> bool {
    if let Some(mode) = headers.get("sec-fetch-mode") {
        return mode.as_bytes().eq_ignore_ascii_case(b"navigate");
    }
    method == axum::http::Method::GET
        && headers
            .get(axum::http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

/// Extracts the client id cookie.
fn client_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CLIENT_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
}

fn into_response(outcome: FetchOutcome) -> Response {
    let FetchOutcome { response, source } = outcome;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => log::debug!("Dropping unrepresentable header {name}"),
        }
    }
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
    out
}

async fn intercept(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(body) => body,
        Err(e) => {
            log::debug!("Rejected request body: {e}");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    let Some(url) = request_url(&state.origin, &parts.uri) else {
        log::debug!("Rejected request target {}", parts.uri);
        return (StatusCode::BAD_REQUEST, "invalid request target").into_response();
    };
    let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };

    let navigation = is_navigation(&parts.method, &parts.headers);
    let mut fetch = FetchRequest::new(method, url.clone()).with_body(body);
    if navigation {
        fetch.mode = RequestMode::Navigate;
    }
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            fetch = fetch.with_header(name.as_str(), value);
        }
    }

    let clients = state.registration.clients();
    let new_client = if navigation {
        match client_id(&parts.headers) {
            Some(id) if clients.get(id).is_some() => None,
            _ => Some(state.registration.register_client(url)),
        }
    } else {
        None
    };

    let outcome = state.registration.fetch(fetch).await;
    log::debug!(
        "{} {} -> {} ({})",
        parts.method,
        parts.uri,
        outcome.response.status,
        outcome.source
    );

    let mut response = into_response(outcome);
    if let Some(id) = new_client {
        let cookie = format!("{CLIENT_COOKIE}={id}; Path=/; SameSite=Lax");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response
                .headers_mut()
                .append(axum::http::header::SET_COOKIE, value);
        }
    }
    response
}

/// Builds the proxy router.
///
/// `/__octo-sw/health` and `/__octo-sw/status` are answered locally; every
/// other request is resolved against `origin` and fetched through
/// `registration`.
pub fn router(registration: Arc<Registration>, origin: Url, body_limit: usize) -> Router {
    let state = AppState {
        registration,
        origin,
        body_limit,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__octo-sw/health", get(api_health))
        .route("/__octo-sw/status", get(api_status))
        .layer(cors)
        .fallback(intercept)
        .with_state(state)
}

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
                log::warn!("Failed to register SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                log::info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received SIGINT");
    }
}

/// Installs the configured worker and serves the proxy until Ctrl-C or
/// SIGTERM.
///
/// A failed install is logged and the proxy passes requests straight through
/// until a later version installs. Pending cache writes are flushed before
/// returning.
///
/// # Errors
///
/// Returns an error if storage cannot be opened, the HTTP client cannot be
/// built, or the server cannot bind.
pub async fn run(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config.storage).await?;
    let network = Arc::new(HttpNetwork::with_connect_timeout(Duration::from_secs(
        config.server.connect_timeout_secs,
    ))?);
    let registration = Arc::new(Registration::new(storage, network));

    let origin = config.worker.origin.clone();
    let version = config.worker.version.clone();
    if let Err(e) = registration.register(config.worker).await {
        log::error!("Failed to install {version}: {e}");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Proxying {origin} on http://{}", listener.local_addr()?);

    let app = router(
        Arc::clone(&registration),
        origin,
        config.server.body_limit,
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registration.settle().await;
    if let Some(worker) = registration.active() {
        let stats = worker.stats();
        log::info!(
            "Served {} requests in {} ({} without network, {} stored, {} sent)",
            stats.total(),
            format_duration(Duration::from_secs(stats.uptime_secs)),
            format_percent(stats.offline_ratio()),
            stats.stored,
            format_bytes(stats.bytes_served)
        );
    }
    log::info!("Shutdown complete");
    Ok(())
}
