use serde::Serialize;

/// Top-level phase of the device, from provisioning through steady-state
/// presence monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    ApMode,
    ConnectingWifi,
    ConnectingOauth,
    DeviceCodePending,
    Authenticated,
    Monitoring,
    Error,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::ApMode => "ap_mode",
            DeviceState::ConnectingWifi => "connecting_wifi",
            DeviceState::ConnectingOauth => "connecting_oauth",
            DeviceState::DeviceCodePending => "device_code_pending",
            DeviceState::Authenticated => "authenticated",
            DeviceState::Monitoring => "monitoring",
            DeviceState::Error => "error",
        }
    }

    pub fn status_message(self) -> &'static str {
        match self {
            DeviceState::ApMode => "Configuration mode - Please configure WiFi",
            DeviceState::ConnectingWifi => "Connecting to WiFi",
            DeviceState::ConnectingOauth => "Waiting for OAuth authentication",
            DeviceState::DeviceCodePending => "Waiting for device code authorization",
            DeviceState::Authenticated => "Authenticated, starting monitoring",
            DeviceState::Monitoring => "Monitoring Teams presence",
            DeviceState::Error => "Error occurred",
        }
    }

    /// Presence is only rendered and reported in these states.
    pub fn presence_active(self) -> bool {
        matches!(self, DeviceState::Authenticated | DeviceState::Monitoring)
    }
}

/// Remote user's availability as reported by the presence API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Unknown,
    Available,
    Busy,
    InMeeting,
    Away,
    Offline,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Unknown => "Unknown",
            Presence::Available => "Available",
            Presence::Busy => "Busy",
            Presence::InMeeting => "In Meeting",
            Presence::Away => "Away",
            Presence::Offline => "Offline",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedSummary {
    pub pin: i32,
    pub enabled: bool,
    pub busy_pattern: &'static str,
    pub meeting_pattern: &'static str,
    pub idle_pattern: &'static str,
}

/// Payload served by `GET /status` on both targets.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub state: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<&'static str>,
    pub wifi_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub has_token: bool,
    pub uptime_seconds: u64,
    pub leds: Vec<LedSummary>,
}
