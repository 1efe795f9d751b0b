use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpServerConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use redlight_common::{
    lifecycle::{Now, TICK_INTERVAL_MS, WIFI_CONNECT_TIMEOUT_MS},
    store::{save_device_config, KeyValueStore, StoreError},
    transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError},
    AuthStartError, DeviceConfig, LedLevel, LedWrite, Supervisor,
};

use crate::pages;

const NVS_NAMESPACE: &str = "teamslight";
const NVS_VALUE_BUF: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const AP_SSID: &str = "Teams Red Light";
const AP_PASSWORD: &str = "configure";
const HTTP_TIMEOUT_SECS: u64 = 15;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;

#[derive(Clone)]
struct SharedState {
    supervisor: Arc<Mutex<Supervisor>>,
    store: Arc<Mutex<NvsStore>>,
}

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut supervisor = Supervisor::from_store(&nvs_store);
    let config = supervisor.config().clone();
    info!(
        "config loaded: ssid=`{}`, tenant=`{}`, {} led(s)",
        config.wifi_ssid,
        config.tenant_id,
        config.leds.len()
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut leds = GpioLeds::new(&config);

    let wifi = match connect_wifi(modem, sys_loop.clone(), nvs_partition, &config) {
        Ok(WifiStartup::Connected(wifi)) => {
            info!("wifi connected");
            Some(wifi)
        }
        Ok(WifiStartup::Provisioning(wifi)) => {
            warn!("station connection unavailable; provisioning AP `{AP_SSID}` is up");
            supervisor.enter_ap_mode();
            Some(wifi)
        }
        Err(err) => {
            // Neither station nor AP could start; nothing to recover into.
            supervisor.enter_error(format!("wifi startup failed: {err:#}"));
            None
        }
    };
    if wifi.is_some() {
        disable_wifi_power_save();
    }

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register run loop with watchdog: {err:#}");
    }

    let shared = SharedState {
        supervisor: Arc::new(Mutex::new(supervisor)),
        store: Arc::new(Mutex::new(nvs_store)),
    };

    let server = match create_http_server(shared.clone()) {
        Ok(server) => Some(server),
        Err(err) => {
            shared
                .supervisor
                .lock()
                .unwrap()
                .enter_error(format!("admin server failed: {err:#}"));
            None
        }
    };

    let mut transport: Box<dyn HttpTransport> = match EspTransport::new() {
        Ok(transport) => Box::new(transport),
        Err(err) => {
            warn!("outbound http client unavailable: {err:#}");
            Box::new(UnavailableTransport)
        }
    };

    // Keep the server alive for the program lifetime.
    let _server = server;

    loop {
        feed_watchdog();
        let now = device_now();
        let link_up = is_wifi_station_connected();
        let ip_address = wifi
            .as_ref()
            .filter(|_| link_up)
            .and_then(|wifi| wifi.sta_netif().get_ip_info().ok())
            .map(|ip_info| ip_info.ip.to_string());

        let writes = {
            let mut supervisor = shared.supervisor.lock().unwrap();
            supervisor.set_ip_address(ip_address);
            let mut store = shared.store.lock().unwrap();
            supervisor.tick(now, link_up, transport.as_mut(), &mut *store)
        };
        leds.apply(&writes);

        thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }
}

// ---------------------------------------------------------------------------
// Persistent store

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::new(NVS_NAMESPACE, format!("{err}")))
    }
}

impl KeyValueStore for NvsStore {
    fn get_str(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open().ok()?;
        let mut buffer = vec![0_u8; NVS_VALUE_BUF];
        match nvs.get_str(key, &mut buffer) {
            Ok(Some(value)) => Some(value.to_string()),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open().ok()?;
        nvs.get_u64(key).ok().flatten()
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open().ok()?;
        nvs.get_i32(key).ok().flatten()
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open().ok()?;
        nvs.get_u8(key).ok().flatten().map(|value| value != 0)
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        nvs.set_str(key, value)
            .map_err(|err| StoreError::new(key, format!("{err}")))
    }

    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        nvs.set_u64(key, value)
            .map_err(|err| StoreError::new(key, format!("{err}")))
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        nvs.set_i32(key, value)
            .map_err(|err| StoreError::new(key, format!("{err}")))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        nvs.set_u8(key, u8::from(value))
            .map_err(|err| StoreError::new(key, format!("{err}")))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        nvs.remove(key)
            .map(|_| ())
            .map_err(|err| StoreError::new(key, format!("{err}")))
    }
}

// ---------------------------------------------------------------------------
// Outbound HTTP transport

struct EspTransport {
    client: HttpClient<EspHttpConnection>,
}

impl EspTransport {
    fn new() -> anyhow::Result<Self> {
        let connection = EspHttpConnection::new(&HttpClientConfiguration {
            timeout: Some(Duration::from_secs(HTTP_TIMEOUT_SECS)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        })?;
        Ok(Self {
            client: HttpClient::wrap(connection),
        })
    }
}

fn transport_err<E: core::fmt::Debug>(err: E) -> TransportError {
    TransportError::Failed(format!("{err:?}"))
}

impl HttpTransport for EspTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
        };

        let body = request.body.unwrap_or_default();
        let content_length = body.len().to_string();
        let mut headers: Vec<(&str, &str)> = request.headers.to_vec();
        if request.body.is_some() {
            headers.push(("Content-Length", content_length.as_str()));
        }

        let mut call = self
            .client
            .request(method, request.url, &headers)
            .map_err(transport_err)?;
        if request.body.is_some() {
            call.write_all(body).map_err(transport_err)?;
        }

        let mut response = call.submit().map_err(transport_err)?;
        let status = response.status();

        let mut data = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(transport_err)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse { status, body: data })
    }
}

/// Stand-in when the HTTP client could not be created; every call fails as
/// a transient transport error and the lifecycle retries on its cadence.
struct UnavailableTransport;

impl HttpTransport for UnavailableTransport {
    fn send(&mut self, _request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        Err(TransportError::Failed("http client unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// WiFi bring-up

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &DeviceConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !config.has_wifi_credentials() {
        warn!("wifi credentials missing; starting provisioning AP");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if config.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.wifi_ssid);

    let deadline = Instant::now() + Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS);
    loop {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up");
                return Ok(WifiStartup::Connected(esp_wifi));
            }
            Err(err) if Instant::now() < deadline => {
                warn!("wifi connect attempt failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
            Err(err) => {
                warn!("wifi connect timed out: {err:#}");
                let _ = wifi.disconnect();
                let _ = wifi.stop();
                start_provisioning_ap(&mut wifi)?;
                return Ok(WifiStartup::Provisioning(esp_wifi));
            }
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{AP_SSID}` (password: `{AP_PASSWORD}`)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Admin HTTP server

fn create_http_server(shared: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpServerConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        write_html(req, pages::INDEX_HTML)
    })?;

    {
        let shared = shared.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let page = {
                let supervisor = shared.supervisor.lock().unwrap();
                pages::config_page(supervisor.config())
            };
            write_html(req, &page)
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
            let status = {
                let supervisor = shared.supervisor.lock().unwrap();
                supervisor.status(device_now())
            };
            write_json(req, &status)
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let fields: Vec<(String, String)> = match serde_urlencoded::from_bytes(&body) {
                Ok(fields) => fields,
                Err(_) => return write_error(req, 400, "Invalid form payload"),
            };

            let mut config = {
                let supervisor = shared.supervisor.lock().unwrap();
                supervisor.config().clone()
            };
            config.apply_form_fields(&fields);

            {
                let mut store = shared.store.lock().unwrap();
                save_device_config(&mut *store, &config).context("failed to persist config")?;
            }
            shared.supervisor.lock().unwrap().apply_config(config);

            info!("configuration saved; restarting");
            schedule_restart(1_000);
            write_html(req, pages::SAVED_HTML)
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler::<anyhow::Error, _>("/login", Method::Get, move |req| {
            let mut transport = match EspTransport::new() {
                Ok(transport) => transport,
                Err(err) => {
                    warn!("login transport unavailable: {err:#}");
                    return write_error(req, 500, "HTTP client unavailable");
                }
            };

            let now = device_now();
            let result = {
                let mut supervisor = shared.supervisor.lock().unwrap();
                let mut store = shared.store.lock().unwrap();
                supervisor.start_login(now, &mut transport, &mut *store)
            };

            match result {
                Ok(session) => write_html(req, &pages::login_page(&session, now.wall_ms)),
                Err(err @ AuthStartError::MissingConfig) => {
                    write_error(req, 400, &err.to_string())
                }
                Err(err) => write_error(req, 400, &format!("Authentication failed: {err}")),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |req| {
        write_plain(req, 200, "OTA Update not implemented in this version")
    })?;

    server.fn_handler::<anyhow::Error, _>("/restart", Method::Post, move |req| {
        schedule_restart(500);
        write_plain(req, 200, "Restarting...")
    })?;

    Ok(server)
}

type ServerRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

fn read_request_body(req: &mut ServerRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(mut req: ServerRequest<'_, '_>, html: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(html.as_bytes())?;
    Ok(())
}

fn write_plain(mut req: ServerRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(mut req: ServerRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(mut req: ServerRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

fn schedule_restart(delay_ms: u64) {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

// ---------------------------------------------------------------------------
// LED GPIO driver

struct GpioLeds {
    pins: HashMap<i32, PinDriver<'static, AnyOutputPin, Output>>,
}

impl GpioLeds {
    fn new(config: &DeviceConfig) -> Self {
        let mut pins = HashMap::new();
        for led in &config.leds {
            if pins.contains_key(&led.pin) {
                continue;
            }
            match unsafe { PinDriver::output(AnyOutputPin::new(led.pin)) } {
                Ok(mut driver) => {
                    let _ = driver.set_low();
                    pins.insert(led.pin, driver);
                }
                Err(err) => warn!("LED unavailable on GPIO{}: {err}", led.pin),
            }
        }
        Self { pins }
    }

    fn apply(&mut self, writes: &[LedWrite]) {
        for write in writes {
            let Some(pin) = self.pins.get_mut(&write.pin) else {
                continue;
            };
            // Plain GPIO has no PWM channel; DimSolid degrades to solid.
            let result = match write.level {
                LedLevel::Off => pin.set_low(),
                LedLevel::On | LedLevel::Dim => pin.set_high(),
            };
            if let Err(err) = result {
                warn!("failed to drive GPIO{}: {err}", write.pin);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Clocks and platform glue

fn device_now() -> Now {
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

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
