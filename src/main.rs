use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Local;
use futures_util::{SinkExt, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use subtle::ConstantTimeEq;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, CorsLayer};

use queuecast_server::commands::{self, PlayOptions};
use queuecast_server::models::{redact_rtmp_urls_in, ChannelId, Settings};
use queuecast_server::services::{
    locate_binary, prune_logs, read_recent_logs, rotate_log, DestinationResolver, EncoderCommandBuilder,
    EventNotifier, EventSink, FanoutNotifier, FfmpegSpawner, FsCleaner, InMemoryKeyStore, MediaResolver, Notifier,
    PlaybackCoordinator, PlaybackDeps, SettingsManager, WebhookNotifier, YtDlpResolver, SERVER_LOG_FILE,
};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 300;
const DEFAULT_RECENT_LOG_LINES: usize = 200;

// ============================================================================
// Event System
// ============================================================================

#[derive(Clone, Serialize)]
struct ServerEvent {
    event: String,
    payload: Value,
}

#[derive(Clone)]
struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: Value) {
        let _ = self.sender.send(ServerEvent {
            event: event.to_string(),
            payload,
        });
    }
}

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    coordinator: PlaybackCoordinator,
    media_resolver: Arc<dyn MediaResolver>,
    event_bus: EventBus,
    log_dir: PathBuf,
    media_dir: PathBuf,
    started_at: Instant,
    auth_token: Option<String>,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    data: Option<Value>,
    error: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    event_bus: EventBus,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &std::path::Path, event_bus: EventBus, level: LevelFilter) -> Result<Self, Box<dyn std::error::Error>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(SERVER_LOG_FILE))?;
        Ok(Self {
            file: Mutex::new(file),
            event_bus,
            level,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        // Stream keys never reach the log file or subscribers
        let message = redact_rtmp_urls_in(&record.args().to_string());
        let line = format!("[{date}][{time}][{target}][{level}] {message}");

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }

        let level_number = match level {
            Level::Error => 1,
            Level::Warn => 2,
            Level::Info => 3,
            Level::Debug => 4,
            Level::Trace => 5,
        };

        self.event_bus.emit(
            "log://log",
            json!({ "level": level_number, "message": message, "target": target }),
        );
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

fn init_logger(log_dir: &std::path::Path, event_bus: EventBus, level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(log_dir, event_bus, level)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}

// ============================================================================
// Security Utilities
// ============================================================================

/// Constant-time token comparison to prevent timing attacks
fn verify_token(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Extract bearer token from Authorization header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Errors go back to requesters, so keep them useful but never leak keys or paths
fn sanitize_error(error: &str) -> String {
    let lower = error.to_lowercase();

    if lower.contains("traversal") || lower.contains("outside allowed") {
        return "Invalid path".to_string();
    }
    if lower.contains("permission denied") || lower.contains("access is denied") {
        return "Access denied".to_string();
    }

    redact_rtmp_urls_in(error)
}

// ============================================================================
// CORS Configuration
// ============================================================================

fn build_cors_layer() -> CorsLayer {
    let cors_origins = env::var("QUEUECAST_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:*,http://127.0.0.1:*".to_string());

    let allowed_origins: Vec<String> = cors_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin_str = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };

            allowed_origins.iter().any(|allowed| {
                if allowed.ends_with(":*") {
                    // Wildcard port matching
                    let prefix = allowed.trim_end_matches(":*");
                    origin_str.starts_with(prefix) && origin_str[prefix.len()..].starts_with(':')
                } else {
                    origin_str == allowed
                }
            })
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// ============================================================================
// Middleware
// ============================================================================

/// Bearer token authentication for the invoke API
async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(request).await;
    };

    if bearer_token(&headers).is_some_and(|token| verify_token(expected, token)) {
        return next.run(request).await;
    }

    let response = InvokeResponse {
        ok: false,
        data: None,
        error: Some("Authentication required".to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(response)).into_response()
}

/// Rate limiting middleware
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match state.rate_limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            let response = InvokeResponse {
                ok: false,
                data: None,
                error: Some("Rate limit exceeded. Please try again later.".to_string()),
            };
            (StatusCode::TOO_MANY_REQUESTS, Json(response)).into_response()
        }
    }
}

// ============================================================================
// Request Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> impl IntoResponse {
    // Browsers cannot set headers on WebSocket upgrades, so ?token= is accepted too
    let authenticated = match state.auth_token.as_deref() {
        None => true,
        Some(expected) => bearer_token(&headers)
            .or(query.token.as_deref())
            .is_some_and(|token| verify_token(expected, token)),
    };

    if !authenticated {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state.event_bus.subscribe()))
}

async fn handle_socket(socket: WebSocket, receiver: broadcast::Receiver<ServerEvent>) {
    let (mut sink, mut incoming) = socket.split();
    let mut events = BroadcastStream::new(receiver);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let Ok(payload) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Err(lagged)) => log::debug!("WebSocket subscriber lagging: {lagged}"),
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn invoke(
    Path(command): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match invoke_command(&state, &command, payload).await {
        Ok(data) => {
            let response = InvokeResponse {
                ok: true,
                data: Some(data),
                error: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(error) => {
            log::debug!("Command {command} failed: {error}");
            let response = InvokeResponse {
                ok: false,
                data: None,
                error: Some(sanitize_error(&error)),
            };
            (StatusCode::BAD_REQUEST, Json(response)).into_response()
        }
    }
}

// ============================================================================
// Command Handler
// ============================================================================

async fn invoke_command(state: &AppState, command: &str, payload: Value) -> Result<Value, String> {
    match command {
        "ping" => {
            let channel: Option<ChannelId> = get_opt_arg(&payload, "channelId")?;
            let report = commands::ping(&state.coordinator, state.started_at, channel.as_ref()).await;
            to_value(report)
        }
        "bind_key" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            let key: String = get_arg(&payload, "key")?;
            commands::bind_key(&state.coordinator, &channel, &key)?;
            Ok(json!({ "bound": true }))
        }
        "play_file" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            let path: String = get_arg(&payload, "path")?;
            let delete_after: bool = get_opt_arg(&payload, "deleteAfter")?.unwrap_or(false);
            let options = play_options(&payload)?;
            let outcome =
                commands::play_file(&state.coordinator, &state.media_dir, &channel, &path, &options, delete_after)
                    .await?;
            to_value(outcome)
        }
        "play_url" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            let url: String = get_arg(&payload, "url")?;
            let options = play_options(&payload)?;
            let outcome = commands::play_url(&state.coordinator, &channel, &url, &options).await?;
            to_value(outcome)
        }
        "play_query" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            let query: String = get_arg(&payload, "query")?;
            let options = play_options(&payload)?;
            let outcome =
                commands::play_query(&state.coordinator, &state.media_resolver, &channel, &query, &options).await?;
            to_value(outcome)
        }
        "skip" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            to_value(commands::skip(&state.coordinator, &channel).await)
        }
        "stop" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            to_value(commands::stop(&state.coordinator, &channel).await)
        }
        "queue" => {
            let channel: ChannelId = get_arg(&payload, "channelId")?;
            to_value(commands::queue(&state.coordinator, &channel).await)
        }
        "get_recent_logs" => {
            let max_lines: usize = get_opt_arg(&payload, "maxLines")?.unwrap_or(DEFAULT_RECENT_LOG_LINES);
            let lines = read_recent_logs(&state.log_dir, max_lines)?;
            Ok(json!(lines))
        }
        _ => Err(format!("Unknown command: {command}")),
    }
}

// ============================================================================
// Argument Parsing
// ============================================================================

fn get_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, String> {
    let obj = payload.as_object().ok_or_else(|| "Invalid payload".to_string())?;
    let value = obj.get(key).ok_or_else(|| format!("Missing argument: {key}"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid {key}: {e}"))
}

fn get_opt_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Option<T>, String> {
    let obj = payload.as_object().ok_or_else(|| "Invalid payload".to_string())?;
    let value = match obj.get(key) {
        Some(value) => value.clone(),
        None => return Ok(None),
    };

    if value.is_null() {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| format!("Invalid {key}: {e}"))
}

fn play_options(payload: &Value) -> Result<PlayOptions, String> {
    serde_json::from_value(payload.clone()).map_err(|e| format!("Invalid options: {e}"))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialize response: {e}"))
}

// ============================================================================
// Configuration
// ============================================================================

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Environment variables take precedence over settings.json
fn apply_env_overrides(settings: &mut Settings) {
    if let Some(host) = non_empty_env("QUEUECAST_HOST") {
        settings.backend_host = host;
    }
    if let Some(port) = non_empty_env("QUEUECAST_PORT").and_then(|value| value.parse().ok()) {
        settings.backend_port = port;
    }
    if let Some(token) = non_empty_env("QUEUECAST_API_TOKEN") {
        settings.backend_token = token;
    }
    if let Some(base_url) = non_empty_env("QUEUECAST_RTMP_BASE_URL") {
        settings.rtmp_base_url = base_url;
    }
    if let Some(webhook_url) = non_empty_env("QUEUECAST_WEBHOOK_URL") {
        settings.webhook_url = webhook_url;
    }
}

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn build_notifier(settings: &Settings, events: Arc<dyn EventSink>) -> Arc<dyn Notifier> {
    let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(EventNotifier::new(events))];
    let webhook_url = settings.webhook_url.trim();
    if !webhook_url.is_empty() {
        log::info!("Webhook notifications enabled");
        targets.push(Arc::new(WebhookNotifier::new(
            webhook_url,
            settings.webhook_username.clone(),
        )));
    }
    Arc::new(FanoutNotifier::new(targets))
}

// ============================================================================
// Server Lifecycle
// ============================================================================

/// Graceful shutdown signal handler.
/// Waits for Ctrl+C or SIGTERM, then stops every channel.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping all channels...");
    state.coordinator.stop_all().await;
    log::info!("All channels stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started_at = Instant::now();

    // Load configuration from environment
    let data_dir = PathBuf::from(env::var("QUEUECAST_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let log_dir = env::var("QUEUECAST_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"));
    let log_level = env::var("QUEUECAST_LOG_LEVEL")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&log_dir)?;

    let rotated = rotate_log(&log_dir);
    let event_bus = EventBus::new();
    init_logger(&log_dir, event_bus.clone(), log_level)?;
    match rotated {
        Ok(Some(archived)) => log::info!("Rotated previous log to {}", archived.display()),
        Ok(None) => {}
        Err(e) => log::warn!("Log rotation failed: {e}"),
    }

    let settings_manager = SettingsManager::new(&data_dir);
    let mut settings = settings_manager.load().unwrap_or_else(|e| {
        log::warn!("Failed to load settings, using defaults: {e}");
        Settings::default()
    });
    apply_env_overrides(&mut settings);

    match prune_logs(&log_dir, settings.log_retention_days) {
        Ok(0) => {}
        Ok(removed) => log::info!("Pruned {removed} old log file(s)"),
        Err(e) => log::warn!("Log pruning failed: {e}"),
    }

    let media_dir = PathBuf::from(&settings.media_dir);
    let download_dir = PathBuf::from(&settings.download_dir);
    std::fs::create_dir_all(&media_dir)?;
    std::fs::create_dir_all(&download_dir)?;

    let ffmpeg_path = match locate_binary(&settings.ffmpeg_path, "ffmpeg") {
        Some(path) => path.to_string_lossy().into_owned(),
        None => {
            log::warn!("FFmpeg not found; playback will fail until it is installed");
            "ffmpeg".to_string()
        }
    };
    let cookies_file = Some(settings.cookies_file.trim())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    let media_resolver: Arc<dyn MediaResolver> = Arc::new(YtDlpResolver::new(
        locate_binary(&settings.yt_dlp_path, "yt-dlp"),
        download_dir,
        cookies_file,
    ));

    let events: Arc<dyn EventSink> = Arc::new(event_bus.clone());
    let coordinator = PlaybackCoordinator::new(PlaybackDeps {
        resolver: DestinationResolver::new(settings.rtmp_base_url.clone(), Arc::new(InMemoryKeyStore::new())),
        builder: EncoderCommandBuilder::new(ffmpeg_path),
        spawner: Arc::new(FfmpegSpawner::new()),
        grace_period: Duration::from_secs(settings.stop_grace_seconds),
        notifier: build_notifier(&settings, Arc::clone(&events)),
        cleaner: Arc::new(FsCleaner),
        events,
    });

    // Initialize rate limiter
    let rate_limit = env::var("QUEUECAST_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .and_then(NonZeroU32::new)
        .unwrap_or_else(|| NonZeroU32::new(DEFAULT_RATE_LIMIT_PER_MINUTE).unwrap_or(NonZeroU32::MIN));
    let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rate_limit)));

    let auth_token = Some(settings.backend_token.trim().to_string()).filter(|token| !token.is_empty());

    let state = AppState {
        coordinator,
        media_resolver,
        event_bus,
        log_dir,
        media_dir,
        started_at,
        auth_token,
        rate_limiter,
    };

    // Protected routes (require authentication)
    let protected_routes = Router::new()
        .route("/api/invoke/:command", post(invoke))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Public routes; /ws checks its own token
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(build_cors_layer());

    let address = SocketAddr::new(parse_host(&settings.backend_host), settings.backend_port);
    log::info!("QueueCast backend listening on http://{address}");
    if state.auth_token.is_some() {
        log::info!("  Authentication: enabled");
    } else {
        log::info!("  Authentication: disabled (no token configured)");
    }

    let listener = tokio::net::TcpListener::bind(address).await?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}
