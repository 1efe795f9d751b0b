//! Host build: the same admin surface and device loop as the firmware,
//! backed by a JSON settings file and a reqwest transport. Useful for
//! exercising the OAuth flow and presence polling without hardware; LED
//! writes are logged instead of driven.

use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{RawForm, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use redlight_common::{
    lifecycle::TICK_INTERVAL_MS,
    store::{save_device_config, KeyValueStore, MemStore, StoreError},
    transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError},
    AuthStartError, LedWrite, Now, Supervisor,
};

use crate::pages;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Mutex<Supervisor>>,
    store: Arc<Mutex<FileStore>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = FileStore::open()?;
    let supervisor = Supervisor::from_store(&store);
    info!(
        "settings loaded from {}; boot state {:?}",
        store.path.display(),
        supervisor.state()
    );

    let app_state = AppState {
        supervisor: Arc::new(Mutex::new(supervisor)),
        store: Arc::new(Mutex::new(store)),
    };

    spawn_device_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/config", get(handle_config))
        .route("/save", post(handle_save))
        .route("/status", get(handle_status))
        .route("/login", get(handle_login))
        .route("/update", post(handle_update))
        .route("/restart", post(handle_restart))
        .with_state(app_state);

    let port = std::env::var("REDLIGHT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin server at {addr}"))?;

    info!("admin surface listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_device_loop(state: AppState) {
    thread::Builder::new()
        .name("device-loop".into())
        .spawn(move || {
            let mut transport = match ReqwestTransport::new() {
                Ok(transport) => transport,
                Err(err) => {
                    state
                        .supervisor
                        .lock()
                        .unwrap()
                        .enter_error(format!("http client init failed: {err:#}"));
                    return;
                }
            };

            loop {
                let now = host_now();
                let writes = {
                    let mut supervisor = state.supervisor.lock().unwrap();
                    // Simulated station link: up whenever the host has a
                    // network stack, which we assume it does.
                    supervisor.set_ip_address(Some("127.0.0.1".to_string()));
                    let mut store = state.store.lock().unwrap();
                    supervisor.tick(now, true, &mut transport, &mut *store)
                };
                log_led_writes(&writes);
                thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
            }
        })
        .expect("failed to spawn device loop thread");
}

fn log_led_writes(writes: &[LedWrite]) {
    for write in writes {
        info!("led gpio{} -> {:?}", write.pin, write.level);
    }
}

// ---------------------------------------------------------------------------
// Handlers

async fn handle_index() -> Html<&'static str> {
    Html(pages::INDEX_HTML)
}

async fn handle_config(State(state): State<AppState>) -> Html<String> {
    let supervisor = state.supervisor.lock().unwrap();
    Html(pages::config_page(supervisor.config()))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = state.supervisor.lock().unwrap();
    Json(supervisor.status(host_now()))
}

async fn handle_save(
    State(state): State<AppState>,
    RawForm(body): RawForm,
) -> impl IntoResponse {
    let fields: Vec<(String, String)> = match serde_urlencoded::from_bytes(&body) {
        Ok(fields) => fields,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid form payload").into_response(),
    };

    let mut config = {
        let supervisor = state.supervisor.lock().unwrap();
        supervisor.config().clone()
    };
    config.apply_form_fields(&fields);

    {
        let mut store = state.store.lock().unwrap();
        if let Err(err) = save_device_config(&mut *store, &config) {
            warn!("failed to persist config: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist configuration",
            )
                .into_response();
        }
    }
    state.supervisor.lock().unwrap().apply_config(config);

    info!("configuration saved; restart the process to re-run WiFi provisioning");
    Html(pages::SAVED_HTML).into_response()
}

async fn handle_login(State(state): State<AppState>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || {
        let mut transport = ReqwestTransport::new()
            .map_err(|err| AuthStartError::Transport(TransportError::Failed(err.to_string())))?;
        let now = host_now();
        let mut supervisor = state.supervisor.lock().unwrap();
        let mut store = state.store.lock().unwrap();
        supervisor
            .start_login(now, &mut transport, &mut *store)
            .map(|session| (session, now.wall_ms))
    })
    .await;

    match result {
        Ok(Ok((session, wall_ms))) => Html(pages::login_page(&session, wall_ms)).into_response(),
        Ok(Err(err @ AuthStartError::MissingConfig)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Ok(Err(err)) => (
            StatusCode::BAD_REQUEST,
            format!("Authentication failed: {err}"),
        )
            .into_response(),
        Err(err) => {
            warn!("login task failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Login task failed").into_response()
        }
    }
}

async fn handle_update() -> &'static str {
    "OTA Update not implemented in this version"
}

async fn handle_restart() -> &'static str {
    info!("restart requested; restart the process to apply");
    "Restarting..."
}

// ---------------------------------------------------------------------------
// Persistent store: MemStore serialized to a JSON file

struct FileStore {
    path: PathBuf,
    mem: MemStore,
}

impl FileStore {
    fn open() -> anyhow::Result<Self> {
        let data_dir = std::env::var("REDLIGHT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.redlight"));
        let path = data_dir.join("settings.json");

        let mem = match std::fs::read_to_string(&path) {
            Ok(raw) => MemStore::from_json(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemStore::new(),
            Err(err) => return Err(err).context("failed to read settings file"),
        };

        Ok(Self { path, mem })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let payload = self
            .mem
            .to_json_pretty()
            .map_err(|err| StoreError::new("settings", err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::new("settings", err.to_string()))?;
        }
        std::fs::write(&self.path, payload)
            .map_err(|err| StoreError::new("settings", err.to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get_str(&self, key: &str) -> Option<String> {
        self.mem.get_str(key)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.mem.get_u64(key)
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.mem.get_i32(key)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.mem.get_bool(key)
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mem.put_str(key, value)?;
        self.flush()
    }

    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.mem.put_u64(key, value)?;
        self.flush()
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.mem.put_i32(key, value)?;
        self.flush()
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.mem.put_bool(key, value)?;
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.mem.remove(key)?;
        self.flush()
    }
}

// ---------------------------------------------------------------------------
// Outbound HTTP transport

struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(request.url),
            HttpMethod::Post => self.client.post(request.url),
        };
        for (name, value) in request.headers {
            builder = builder.header(*name, *value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Failed(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| TransportError::Failed(err.to_string()))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// Clocks

fn host_now() -> Now {
    Now {
        mono_ms: monotonic_ms(),
        wall_ms: wall_clock_ms(),
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn wall_clock_ms() -> u64 {
    let ms = Utc::now().timestamp_millis();
    if ms > 0 {
        ms as u64
    } else {
        0
    }
}
