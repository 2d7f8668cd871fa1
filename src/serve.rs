//! Purpose: Provide the HTTP/JSON long-poll server for pollflag.
//! Exports: `ServeConfig`, `serve`, `preflight_config`.
//! Role: Axum-based server exposing new-order long polling and per-channel wait/signal.
//! Invariants: Success bodies are `{status: "success", data}`; error kinds remain stable.
//! Invariants: Loopback-only unless explicitly allowed; non-loopback requires a token file.
//! Invariants: Every wait is bounded by the server's maximum timeout and concurrency cap.
//! Invariants: A poll interval never exceeds the wait timeout it belongs to.
//! Invariants: Shutdown answers open waits immediately with "not signaled".
//! Notes: Pending flags live in the file store so several server processes can share them.

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

use pollflag::api::{
    Error, ErrorKind, FileFlagStore, NEW_ORDER_CHANNEL, Notifier, WaitOptions, WaitOutcome,
};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub store_dir: PathBuf,
    pub token: Option<String>,
    pub token_file_used: bool,
    pub allow_non_loopback: bool,
    pub cors_origins: Vec<String>,
    pub flag_ttl_secs: u64,
    pub wait_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_wait_timeout_secs: u64,
    pub max_concurrent_waits: usize,
}

struct AppState {
    notifier: Notifier,
    token: Option<String>,
    new_order_wait: WaitOptions,
    max_wait_timeout_secs: u64,
    wait_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    fn new(notifier: Notifier, config: &ServeConfig) -> Self {
        Self {
            notifier,
            token: config.token.clone(),
            new_order_wait: WaitOptions::from_secs(
                config.wait_timeout_secs,
                config.poll_interval_secs,
            ),
            max_wait_timeout_secs: config.max_wait_timeout_secs,
            wait_semaphore: Arc::new(Semaphore::new(config.max_concurrent_waits)),
            shutdown: watch::Sender::new(false),
        }
    }

    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Runs a wait that ends early, unsignaled, once shutdown begins.
    async fn bounded_wait(
        &self,
        channel: &str,
        options: WaitOptions,
    ) -> Result<WaitOutcome, Error> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            outcome = self.notifier.await_signal(channel, options) => outcome,
            Ok(()) = async { shutdown.wait_for(|stopping| *stopping).await.map(|_| ()) } => {
                tracing::debug!(channel, "wait ended by shutdown");
                Ok(WaitOutcome::TimedOut)
            }
        }
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    let cors_origins = preflight_config(&config)?;

    init_tracing();

    let notifier = Notifier::new(Arc::new(FileFlagStore::new(&config.store_dir)))
        .with_ttl(Duration::from_secs(config.flag_ttl_secs));
    let state = Arc::new(AppState::new(notifier, &config));
    let app = router(state.clone(), cors_origins);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        store_dir = %config.store_dir.display(),
        "pollflag server listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested; releasing open waits");
            state.begin_shutdown();
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

/// Validates the config and resolves CORS origins without binding.
pub fn preflight_config(config: &ServeConfig) -> Result<Vec<HeaderValue>, Error> {
    validate_config(config)?;
    config
        .cors_origins
        .iter()
        .map(|origin| parse_cors_origin(origin))
        .collect()
}

fn router(state: Arc<AppState>, cors_origins: Vec<HeaderValue>) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/v1/check-new-orders-for-notification",
            get(check_new_orders),
        )
        .route("/v1/orders/created", post(order_created))
        .route(
            "/v1/channels/:channel",
            get(channel_status).delete(clear_channel),
        )
        .route("/v1/channels/:channel/wait", get(wait_channel))
        .route("/v1/channels/:channel/signal", post(signal_channel))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if !cors_origins.is_empty() {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::list(cors_origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app = app.layer(cors);
    }
    app
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    let is_loopback_bind = is_loopback(config.bind.ip());
    if !is_loopback_bind && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if !is_loopback_bind && !config.token_file_used {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires --token-file")
            .with_hint("Order notifications must not be readable without auth off-host."));
    }

    if config.flag_ttl_secs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--flag-ttl-secs must be greater than zero")
            .with_hint("Use a positive value like 300."));
    }

    if config.wait_timeout_secs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--wait-timeout-secs must be greater than zero")
            .with_hint("Use a positive value like 15."));
    }

    if config.poll_interval_secs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--poll-interval-secs must be greater than zero")
            .with_hint("Use a positive value like 1."));
    }

    if config.max_wait_timeout_secs == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-wait-timeout-secs must be greater than zero")
            .with_hint("Use a positive value like 60."));
    }

    if config.wait_timeout_secs > config.max_wait_timeout_secs {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--wait-timeout-secs exceeds --max-wait-timeout-secs")
            .with_hint("Lower the default wait or raise the server maximum."));
    }

    if config.poll_interval_secs > config.wait_timeout_secs {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--poll-interval-secs exceeds --wait-timeout-secs")
            .with_hint("Poll at least once per wait, e.g. --poll-interval-secs 1."));
    }

    if config.max_concurrent_waits == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-concurrent-waits must be greater than zero")
            .with_hint("Use a positive value like 256."));
    }

    Ok(())
}

fn parse_cors_origin(origin: &str) -> Result<HeaderValue, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid --cors-origin {origin:?}"))
            .with_hint("Use an origin like https://shop.example.com (scheme, host, optional port).")
    };
    let url = Url::parse(origin).map_err(|err| invalid().with_source(err))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid());
    }
    let normalized = url.origin().ascii_serialization();
    HeaderValue::from_str(&normalized).map_err(|err| invalid().with_source(err))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    let expected = format!("Bearer {token}");
    if value != expected {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

fn acquire_wait_permit(state: &AppState) -> Result<OwnedSemaphorePermit, Error> {
    state
        .wait_semaphore
        .clone()
        .try_acquire_owned()
        .map_err(|_| {
            Error::new(ErrorKind::Busy)
                .with_message("too many concurrent waits")
                .with_hint("Try again later or raise --max-concurrent-waits.")
        })
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_secs: Option<u64>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderCreatedRequest {
    order_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    status: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
}

async fn healthz() -> Response {
    with_version_header(Json(json!({ "ok": true })).into_response())
}

async fn check_new_orders(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let _permit = match acquire_wait_permit(&state) {
        Ok(permit) => permit,
        Err(err) => return error_response(err),
    };
    match state
        .bounded_wait(NEW_ORDER_CHANNEL, state.new_order_wait)
        .await
    {
        Ok(outcome) => success_response(json!({ "has_new_orders": outcome.is_signaled() })),
        Err(err) => error_response(err),
    }
}

async fn order_created(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let request = match parse_order_created(&body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    match state.notifier.signal(NEW_ORDER_CHANNEL) {
        Ok(()) => {
            tracing::info!(order_id = ?request.order_id, "new order signaled");
            success_response(json!({ "channel": NEW_ORDER_CHANNEL }))
        }
        Err(err) => error_response(err),
    }
}

fn parse_order_created(body: &[u8]) -> Result<OrderCreatedRequest, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(OrderCreatedRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid order-created body")
            .with_hint("Send an empty body or {\"order_id\": <number>}.")
            .with_source(err)
    })
}

async fn wait_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(channel): AxumPath<String>,
    query: Result<Query<WaitQuery>, QueryRejection>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(
                Error::new(ErrorKind::Usage)
                    .with_message(rejection.body_text())
                    .with_hint("Use whole seconds: ?timeout_secs=15&interval_secs=1.")
                    .with_channel(channel),
            );
        }
    };
    let timeout_secs = query
        .timeout_secs
        .unwrap_or(state.new_order_wait.timeout.as_secs());
    if timeout_secs > state.max_wait_timeout_secs {
        return error_response(
            Error::new(ErrorKind::Usage)
                .with_message("wait timeout exceeds server limit")
                .with_hint(format!(
                    "Use timeout_secs <= {}.",
                    state.max_wait_timeout_secs
                ))
                .with_channel(channel),
        );
    }
    let interval_secs = query
        .interval_secs
        .unwrap_or(state.new_order_wait.interval.as_secs());
    if timeout_secs > 0 && interval_secs > timeout_secs {
        return error_response(
            Error::new(ErrorKind::Usage)
                .with_message("poll interval exceeds wait timeout")
                .with_hint(format!("Use interval_secs <= {timeout_secs}."))
                .with_channel(channel),
        );
    }
    let _permit = match acquire_wait_permit(&state) {
        Ok(permit) => permit,
        Err(err) => return error_response(err),
    };
    let options = WaitOptions::from_secs(timeout_secs, interval_secs);
    match state.bounded_wait(&channel, options).await {
        Ok(outcome) => success_response(json!({
            "channel": channel,
            "signaled": outcome.is_signaled(),
        })),
        Err(err) => error_response(err),
    }
}

async fn signal_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(channel): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match state.notifier.signal(&channel) {
        Ok(()) => success_response(json!({ "channel": channel })),
        Err(err) => error_response(err),
    }
}

async fn channel_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(channel): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match state.notifier.pending(&channel) {
        Ok(pending) => success_response(json!({ "channel": channel, "pending": pending })),
        Err(err) => error_response(err),
    }
}

async fn clear_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(channel): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    match state.notifier.clear(&channel) {
        Ok(()) => success_response(json!({ "channel": channel, "cleared": true })),
        Err(err) => error_response(err),
    }
}

fn success_response(data: Value) -> Response {
    with_version_header(Json(json!({ "status": "success", "data": data })).into_response())
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::Busy => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            tracing::warn!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = ErrorEnvelope {
        status: "error",
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            channel: err.channel().map(str::to_string),
        },
    };
    with_version_header((status, Json(body)).into_response())
}

fn with_version_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert("pollflag-version", HeaderValue::from_static("1"));
    response
}
