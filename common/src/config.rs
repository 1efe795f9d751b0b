use serde::{Deserialize, Serialize};

use crate::led::Pattern;

pub const MAX_LEDS: usize = 8;
pub const DEFAULT_LED_PIN: i32 = 2;
pub const DEFAULT_TENANT_ID: &str = "common";
pub const DEFAULT_OTA_URL: &str =
    "https://github.com/fchapleau/teams-redlight/releases/latest/download/firmware.bin";

/// Output-capable GPIOs on the classic ESP32. Input-only (34-39) and
/// flash-attached (6-11) pins are rejected.
pub fn is_valid_led_pin(pin: i32) -> bool {
    matches!(pin, 0..=5 | 12..=19 | 21..=23 | 25..=27 | 32 | 33)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfig {
    pub pin: i32,
    pub busy_pattern: Pattern,
    pub meeting_pattern: Pattern,
    pub idle_pattern: Pattern,
    pub enabled: bool,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pin: DEFAULT_LED_PIN,
            busy_pattern: Pattern::Solid,
            meeting_pattern: Pattern::Solid,
            idle_pattern: Pattern::Off,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub user_email: String,
    pub ota_url: String,
    pub leds: Vec<LedConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            user_email: String::new(),
            ota_url: DEFAULT_OTA_URL.to_string(),
            leds: vec![LedConfig::default()],
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        if self.tenant_id.trim().is_empty() {
            self.tenant_id = DEFAULT_TENANT_ID.to_string();
        }

        self.leds.truncate(MAX_LEDS);
        self.leds.retain(|led| is_valid_led_pin(led.pin));
        if self.leds.is_empty() {
            self.leds.push(LedConfig::default());
        }
    }

    pub fn has_wifi_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    /// The device-code flow cannot start without a registered application.
    pub fn has_oauth_client(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.tenant_id.trim().is_empty()
    }

    /// Apply `POST /save` form fields. Blank password/secret fields keep the
    /// stored value; a `led_count` field makes the form authoritative for
    /// the LED list.
    pub fn apply_form_fields(&mut self, fields: &[(String, String)]) {
        let get = |key: &str| {
            fields
                .iter()
                .rev()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };

        if let Some(value) = get("wifi_ssid") {
            self.wifi_ssid = value.trim().to_string();
        }
        if let Some(value) = get("wifi_password") {
            if !value.is_empty() {
                self.wifi_pass = value.to_string();
            }
        }
        if let Some(value) = get("user_email") {
            self.user_email = value.trim().to_string();
        }
        if let Some(value) = get("tenant_id") {
            self.tenant_id = value.trim().to_string();
        }
        if let Some(value) = get("client_id") {
            self.client_id = value.trim().to_string();
        }
        if let Some(value) = get("client_secret") {
            if !value.is_empty() {
                self.client_secret = value.to_string();
            }
        }
        if let Some(value) = get("ota_url") {
            self.ota_url = value.trim().to_string();
        }

        if let Some(count) = get("led_count").and_then(|value| value.parse::<usize>().ok()) {
            let count = count.clamp(1, MAX_LEDS);
            let mut leds = Vec::with_capacity(count);
            for index in 0..count {
                let mut led = self.leds.get(index).cloned().unwrap_or_default();
                if let Some(pin) = get(&format!("led{index}_pin"))
                    .and_then(|value| value.trim().parse::<i32>().ok())
                {
                    led.pin = pin;
                }
                if let Some(pattern) = get(&format!("led{index}_busy")).and_then(parse_pattern) {
                    led.busy_pattern = pattern;
                }
                if let Some(pattern) = get(&format!("led{index}_meeting")).and_then(parse_pattern)
                {
                    led.meeting_pattern = pattern;
                }
                if let Some(pattern) = get(&format!("led{index}_idle")).and_then(parse_pattern) {
                    led.idle_pattern = pattern;
                }
                if let Some(value) = get(&format!("led{index}_enabled")) {
                    led.enabled = matches!(value, "1" | "on" | "true");
                }
                leds.push(led);
            }
            self.leds = leds;
        }

        self.sanitize();
    }
}

fn parse_pattern(value: &str) -> Option<Pattern> {
    value
        .trim()
        .parse::<u8>()
        .ok()
        .and_then(Pattern::from_code)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn form(fields: &[(&str, &str)]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn blank_secret_fields_keep_current_values() {
        let mut config = DeviceConfig {
            wifi_pass: "hunter2".to_string(),
            client_secret: "s3cret".to_string(),
            ..DeviceConfig::default()
        };

        config.apply_form_fields(&form(&[
            ("wifi_ssid", "office"),
            ("wifi_password", ""),
            ("client_id", "abc-123"),
            ("client_secret", ""),
        ]));

        assert_eq!(config.wifi_ssid, "office");
        assert_eq!(config.wifi_pass, "hunter2");
        assert_eq!(config.client_id, "abc-123");
        assert_eq!(config.client_secret, "s3cret");
    }

    #[test]
    fn empty_tenant_falls_back_to_common() {
        let mut config = DeviceConfig::default();
        config.apply_form_fields(&form(&[("tenant_id", "  ")]));
        assert_eq!(config.tenant_id, "common");
    }

    #[test]
    fn led_form_rebuilds_list() {
        let mut config = DeviceConfig::default();
        config.apply_form_fields(&form(&[
            ("led_count", "2"),
            ("led0_pin", "4"),
            ("led0_busy", "3"),
            ("led0_meeting", "1"),
            ("led0_idle", "0"),
            ("led0_enabled", "1"),
            ("led1_pin", "16"),
            ("led1_busy", "5"),
            ("led1_meeting", "5"),
            ("led1_idle", "2"),
            ("led1_enabled", "0"),
        ]));

        assert_eq!(config.leds.len(), 2);
        assert_eq!(config.leds[0].pin, 4);
        assert_eq!(config.leds[0].busy_pattern, Pattern::MediumBlink);
        assert_eq!(config.leds[0].meeting_pattern, Pattern::Solid);
        assert!(config.leds[0].enabled);
        assert_eq!(config.leds[1].pin, 16);
        assert_eq!(config.leds[1].busy_pattern, Pattern::DoubleBlink);
        assert_eq!(config.leds[1].idle_pattern, Pattern::SlowBlink);
        assert!(!config.leds[1].enabled);
    }

    #[test]
    fn invalid_pins_are_dropped_with_default_fallback() {
        let mut config = DeviceConfig {
            leds: vec![
                LedConfig {
                    pin: 34, // input-only
                    ..LedConfig::default()
                },
                LedConfig {
                    pin: 6, // flash
                    ..LedConfig::default()
                },
            ],
            ..DeviceConfig::default()
        };

        config.sanitize();

        assert_eq!(config.leds.len(), 1);
        assert_eq!(config.leds[0].pin, DEFAULT_LED_PIN);
    }

    #[test]
    fn led_list_is_capped() {
        let mut config = DeviceConfig {
            leds: (0..12)
                .map(|_| LedConfig::default())
                .collect(),
            ..DeviceConfig::default()
        };
        config.sanitize();
        assert_eq!(config.leds.len(), MAX_LEDS);
    }
}
