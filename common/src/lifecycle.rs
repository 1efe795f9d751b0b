//! Device lifecycle state machine.
//!
//! One `Supervisor` owns the whole mutable device context and is driven by
//! the platform run loop: every tick it executes the current state's action
//! and then renders the LEDs, returning the pin writes to apply. All
//! external calls (token endpoint, presence API) go through the bounded
//! blocking transport, so a tick never blocks longer than the transport
//! timeout.

use log::{info, warn};

use crate::config::DeviceConfig;
use crate::led::{self, LedChannel, LedWrite};
use crate::oauth::{self, DeviceCodeSession, OauthTokens, PollOutcome, RefreshOutcome,
    SLOW_DOWN_EXTRA_MS};
use crate::presence::{self, PresenceOutcome, PRESENCE_POLL_INTERVAL_MS};
use crate::store::{self, KeyValueStore};
use crate::transport::HttpTransport;
use crate::types::{DeviceState, LedSummary, Presence, StatusPayload};
use crate::AuthStartError;

pub const TICK_INTERVAL_MS: u64 = 100;
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Tick timestamps: monotonic for cadences, wall-clock epoch for persisted
/// expiries. Both in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Now {
    pub mono_ms: u64,
    pub wall_ms: u64,
}

#[derive(Debug)]
pub struct DeviceContext {
    pub state: DeviceState,
    pub presence: Presence,
    pub config: DeviceConfig,
    pub tokens: Option<OauthTokens>,
    pub session: Option<DeviceCodeSession>,
    pub leds: Vec<LedChannel>,
    pub wifi_connected: bool,
    pub ip_address: Option<String>,
    error_message: Option<String>,
    connect_started_ms: Option<u64>,
    last_presence_check_ms: Option<u64>,
}

pub struct Supervisor {
    ctx: DeviceContext,
}

impl Supervisor {
    pub fn new(
        mut config: DeviceConfig,
        tokens: Option<OauthTokens>,
        session: Option<DeviceCodeSession>,
    ) -> Self {
        config.sanitize();
        let state = if config.has_wifi_credentials() {
            DeviceState::ConnectingWifi
        } else {
            DeviceState::ApMode
        };
        let leds = config.leds.iter().cloned().map(LedChannel::new).collect();

        Self {
            ctx: DeviceContext {
                state,
                presence: Presence::Unknown,
                config,
                tokens,
                session,
                leds,
                wifi_connected: false,
                ip_address: None,
                error_message: None,
                connect_started_ms: None,
                last_presence_check_ms: None,
            },
        }
    }

    /// Boot path: everything comes out of the persistent store.
    pub fn from_store(store: &dyn KeyValueStore) -> Self {
        Self::new(
            store::load_device_config(store),
            store::load_tokens(store),
            store::load_session(store),
        )
    }

    pub fn state(&self) -> DeviceState {
        self.ctx.state
    }

    pub fn presence(&self) -> Presence {
        self.ctx.presence
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.ctx.config
    }

    pub fn session(&self) -> Option<&DeviceCodeSession> {
        self.ctx.session.as_ref()
    }

    pub fn set_ip_address(&mut self, ip: Option<String>) {
        self.ctx.ip_address = ip;
    }

    /// Platform fallback: station connect was exhausted and the
    /// provisioning AP is up.
    pub fn enter_ap_mode(&mut self) {
        self.ctx.state = DeviceState::ApMode;
    }

    /// Unrecoverable init failure; the loop keeps rendering the error blink
    /// but no further transitions happen without external action.
    pub fn enter_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("entering error state: {reason}");
        self.ctx.error_message = Some(reason);
        self.ctx.state = DeviceState::Error;
    }

    /// Replace the live configuration (admin `/save`); LED render state is
    /// rebuilt from scratch.
    pub fn apply_config(&mut self, mut config: DeviceConfig) {
        config.sanitize();
        self.ctx.leds = config.leds.iter().cloned().map(LedChannel::new).collect();
        self.ctx.config = config;
    }

    /// One cooperative tick: run the current state's action, then render.
    pub fn tick(
        &mut self,
        now: Now,
        link_up: bool,
        http: &mut dyn HttpTransport,
        store: &mut dyn KeyValueStore,
    ) -> Vec<LedWrite> {
        self.ctx.wifi_connected = link_up;

        match self.ctx.state {
            DeviceState::ApMode | DeviceState::ConnectingOauth | DeviceState::Error => {}
            DeviceState::ConnectingWifi => self.tick_connecting_wifi(now, link_up, store),
            DeviceState::DeviceCodePending => self.tick_device_code(now, http, store),
            DeviceState::Authenticated => {
                self.ctx.state = DeviceState::Monitoring;
            }
            DeviceState::Monitoring => {
                let due = self
                    .ctx
                    .last_presence_check_ms
                    .map(|last| now.mono_ms.saturating_sub(last) >= PRESENCE_POLL_INTERVAL_MS)
                    .unwrap_or(true);
                if due {
                    self.check_presence(now, http, store);
                }
            }
        }

        led::render_all(&mut self.ctx.leds, self.ctx.state, self.ctx.presence, now.mono_ms)
    }

    /// Admin-triggered start of the device-code flow.
    pub fn start_login(
        &mut self,
        now: Now,
        http: &mut dyn HttpTransport,
        store: &mut dyn KeyValueStore,
    ) -> Result<DeviceCodeSession, AuthStartError> {
        if !self.ctx.config.has_oauth_client() {
            return Err(AuthStartError::MissingConfig);
        }

        let session = oauth::request_device_code(
            http,
            &self.ctx.config.client_id,
            &self.ctx.config.tenant_id,
            now.wall_ms,
        )?;

        if let Err(err) = store::save_session(store, &session) {
            warn!("failed to persist device code session: {err}");
        }
        info!(
            "device code flow started; user code {} at {}",
            session.user_code, session.verification_uri
        );
        self.ctx.session = Some(session.clone());
        self.ctx.state = DeviceState::DeviceCodePending;
        Ok(session)
    }

    pub fn status(&self, now: Now) -> StatusPayload {
        let state = self.ctx.state;
        let message = match state {
            DeviceState::Error => self
                .ctx
                .error_message
                .clone()
                .unwrap_or_else(|| state.status_message().to_string()),
            DeviceState::DeviceCodePending => match &self.ctx.session {
                Some(session) => format!(
                    "Enter code {} at {}",
                    session.user_code, session.verification_uri
                ),
                None => state.status_message().to_string(),
            },
            _ => state.status_message().to_string(),
        };

        StatusPayload {
            state: state.as_str(),
            message,
            presence: state.presence_active().then(|| self.ctx.presence.as_str()),
            wifi_connected: self.ctx.wifi_connected,
            ip_address: self.ctx.ip_address.clone(),
            has_token: self.ctx.tokens.is_some(),
            uptime_seconds: now.mono_ms / 1_000,
            leds: self
                .ctx
                .leds
                .iter()
                .map(|channel| LedSummary {
                    pin: channel.config.pin,
                    enabled: channel.config.enabled,
                    busy_pattern: channel.config.busy_pattern.as_str(),
                    meeting_pattern: channel.config.meeting_pattern.as_str(),
                    idle_pattern: channel.config.idle_pattern.as_str(),
                })
                .collect(),
        }
    }

    fn tick_connecting_wifi(&mut self, now: Now, link_up: bool, store: &mut dyn KeyValueStore) {
        if link_up {
            self.ctx.connect_started_ms = None;

            // A still-valid persisted session resumes polling directly
            // instead of forcing the user through a fresh code.
            if let Some(session) = &self.ctx.session {
                if !session.expired(now.wall_ms) {
                    info!("resuming device code session; user code {}", session.user_code);
                    self.ctx.state = DeviceState::DeviceCodePending;
                    return;
                }
                self.drop_session(store);
            }

            self.ctx.state = if self.ctx.tokens.is_some() {
                DeviceState::Authenticated
            } else {
                DeviceState::ConnectingOauth
            };
            return;
        }

        let started = *self.ctx.connect_started_ms.get_or_insert(now.mono_ms);
        if now.mono_ms.saturating_sub(started) >= WIFI_CONNECT_TIMEOUT_MS {
            warn!("wifi connect timed out; falling back to AP mode");
            self.ctx.connect_started_ms = None;
            self.ctx.state = DeviceState::ApMode;
        }
    }

    fn tick_device_code(
        &mut self,
        now: Now,
        http: &mut dyn HttpTransport,
        store: &mut dyn KeyValueStore,
    ) {
        let Some(session) = self.ctx.session.clone() else {
            self.ctx.state = DeviceState::ConnectingOauth;
            return;
        };

        // The expiry check runs every tick, independent of poll cadence.
        if session.expired(now.wall_ms) {
            warn!("device code session expired");
            self.drop_session(store);
            self.ctx.state = DeviceState::ConnectingOauth;
            return;
        }

        if !session.poll_due(now.mono_ms) {
            return;
        }
        if let Some(live) = self.ctx.session.as_mut() {
            live.last_poll_ms = now.mono_ms;
        }

        let outcome = oauth::poll_device_token(
            http,
            &self.ctx.config.client_id,
            &self.ctx.config.tenant_id,
            &session,
            now.wall_ms,
        );

        match outcome {
            PollOutcome::Authorized(tokens) => {
                info!("device code flow completed; tokens acquired");
                if let Err(err) = store::save_tokens(store, &tokens) {
                    warn!("failed to persist tokens: {err}");
                }
                self.ctx.tokens = Some(tokens);
                self.drop_session(store);
                self.ctx.state = DeviceState::Authenticated;
            }
            PollOutcome::Pending => {}
            PollOutcome::SlowDown => {
                // Flat additional back-off before the next poll.
                if let Some(live) = self.ctx.session.as_mut() {
                    live.last_poll_ms = now.mono_ms.saturating_add(SLOW_DOWN_EXTRA_MS);
                }
            }
            PollOutcome::Declined | PollOutcome::Expired => {
                warn!("device code session ended; user must restart the flow");
                self.drop_session(store);
                self.ctx.state = DeviceState::ConnectingOauth;
            }
            PollOutcome::Retry => {}
        }
    }

    fn check_presence(
        &mut self,
        now: Now,
        http: &mut dyn HttpTransport,
        store: &mut dyn KeyValueStore,
    ) {
        self.ctx.last_presence_check_ms = Some(now.mono_ms);

        let Some(tokens) = self.ctx.tokens.clone() else {
            self.ctx.state = DeviceState::ConnectingOauth;
            return;
        };

        if tokens.refresh_due(now.wall_ms) && !self.refresh(now, http, store) {
            return;
        }

        let access_token = match &self.ctx.tokens {
            Some(tokens) => tokens.access_token.clone(),
            None => return,
        };

        match presence::fetch_presence(http, &access_token) {
            PresenceOutcome::Updated(presence) => {
                if presence != self.ctx.presence {
                    info!(
                        "presence updated: {} -> {}",
                        self.ctx.presence.as_str(),
                        presence.as_str()
                    );
                }
                self.ctx.presence = presence;
            }
            PresenceOutcome::Unauthorized => {
                // Token rejected mid-lifetime; one refresh attempt, presence
                // retried on the next cadence.
                let _ = self.refresh(now, http, store);
            }
            PresenceOutcome::Failed => {}
        }
    }

    /// Returns false when the lifecycle regressed to `ConnectingOauth`.
    fn refresh(
        &mut self,
        now: Now,
        http: &mut dyn HttpTransport,
        store: &mut dyn KeyValueStore,
    ) -> bool {
        let Some(current) = self.ctx.tokens.clone() else {
            self.ctx.state = DeviceState::ConnectingOauth;
            return false;
        };

        match oauth::refresh_tokens(
            http,
            &self.ctx.config.client_id,
            &self.ctx.config.client_secret,
            &self.ctx.config.tenant_id,
            &current,
            now.wall_ms,
        ) {
            RefreshOutcome::Refreshed(tokens) => {
                if let Err(err) = store::save_tokens(store, &tokens) {
                    warn!("failed to persist refreshed tokens: {err}");
                }
                self.ctx.tokens = Some(tokens);
                true
            }
            RefreshOutcome::Invalid => {
                if let Err(err) = store::clear_tokens(store) {
                    warn!("failed to clear stale tokens: {err}");
                }
                self.ctx.tokens = None;
                self.ctx.state = DeviceState::ConnectingOauth;
                false
            }
            RefreshOutcome::Failed => {
                self.ctx.state = DeviceState::ConnectingOauth;
                false
            }
        }
    }

    fn drop_session(&mut self, store: &mut dyn KeyValueStore) {
        if let Err(err) = store::clear_session(store) {
            warn!("failed to clear device code session: {err}");
        }
        self.ctx.session = None;
    }
}
