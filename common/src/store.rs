//! Durable key-value persistence.
//!
//! The device stores every setting under an individual string key (NVS on
//! hardware, a JSON file on the host), matching the original firmware's
//! preferences layout. Absent keys are never an error; every load supplies
//! its default.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::{DeviceConfig, LedConfig, DEFAULT_OTA_URL, DEFAULT_TENANT_ID, MAX_LEDS};
use crate::led::Pattern;
use crate::oauth::{DeviceCodeSession, OauthTokens, DEFAULT_POLL_INTERVAL_MS};

pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASS: &str = "wifi_pass";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const TENANT_ID: &str = "tenant_id";
    pub const USER_EMAIL: &str = "user_email";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const TOKEN_EXPIRES: &str = "token_expires";
    pub const DEVICE_CODE: &str = "device_code";
    pub const USER_CODE: &str = "user_code";
    pub const VERIFICATION_URI: &str = "verify_uri";
    pub const DEVICE_CODE_EXPIRES: &str = "dev_code_exp";
    pub const OTA_URL: &str = "ota_url";
    pub const LED_COUNT: &str = "led_count";
}

pub fn led_key(index: usize, field: &str) -> String {
    format!("led{index}_{field}")
}

#[derive(Debug, Error)]
#[error("store write failed for `{key}`: {reason}")]
pub struct StoreError {
    pub key: String,
    pub reason: String,
}

impl StoreError {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Typed, string-keyed durable store. Removing an absent key is a no-op.
pub trait KeyValueStore {
    fn get_str(&self, key: &str) -> Option<String>;
    fn get_u64(&self, key: &str) -> Option<u64>;
    fn get_i32(&self, key: &str) -> Option<i32>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError>;
    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

pub fn load_device_config(store: &dyn KeyValueStore) -> DeviceConfig {
    let mut config = DeviceConfig {
        wifi_ssid: store.get_str(keys::WIFI_SSID).unwrap_or_default(),
        wifi_pass: store.get_str(keys::WIFI_PASS).unwrap_or_default(),
        client_id: store.get_str(keys::CLIENT_ID).unwrap_or_default(),
        client_secret: store.get_str(keys::CLIENT_SECRET).unwrap_or_default(),
        tenant_id: store
            .get_str(keys::TENANT_ID)
            .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
        user_email: store.get_str(keys::USER_EMAIL).unwrap_or_default(),
        ota_url: store
            .get_str(keys::OTA_URL)
            .unwrap_or_else(|| DEFAULT_OTA_URL.to_string()),
        leds: Vec::new(),
    };

    let count = store
        .get_u64(keys::LED_COUNT)
        .map(|count| (count as usize).clamp(1, MAX_LEDS))
        .unwrap_or(1);
    for index in 0..count {
        let defaults = LedConfig::default();
        config.leds.push(LedConfig {
            pin: store
                .get_i32(&led_key(index, "pin"))
                .unwrap_or(defaults.pin),
            busy_pattern: load_pattern(store, index, "busy", defaults.busy_pattern),
            meeting_pattern: load_pattern(store, index, "meeting", defaults.meeting_pattern),
            idle_pattern: load_pattern(store, index, "idle", defaults.idle_pattern),
            enabled: store
                .get_bool(&led_key(index, "enabled"))
                .unwrap_or(defaults.enabled),
        });
    }

    config.sanitize();
    config
}

fn load_pattern(store: &dyn KeyValueStore, index: usize, field: &str, default: Pattern) -> Pattern {
    store
        .get_u64(&led_key(index, field))
        .and_then(|code| u8::try_from(code).ok())
        .and_then(Pattern::from_code)
        .unwrap_or(default)
}

pub fn save_device_config(
    store: &mut dyn KeyValueStore,
    config: &DeviceConfig,
) -> Result<(), StoreError> {
    store.put_str(keys::WIFI_SSID, &config.wifi_ssid)?;
    store.put_str(keys::WIFI_PASS, &config.wifi_pass)?;
    store.put_str(keys::CLIENT_ID, &config.client_id)?;
    store.put_str(keys::CLIENT_SECRET, &config.client_secret)?;
    store.put_str(keys::TENANT_ID, &config.tenant_id)?;
    store.put_str(keys::USER_EMAIL, &config.user_email)?;
    store.put_str(keys::OTA_URL, &config.ota_url)?;

    store.put_u64(keys::LED_COUNT, config.leds.len() as u64)?;
    for (index, led) in config.leds.iter().enumerate() {
        store.put_i32(&led_key(index, "pin"), led.pin)?;
        store.put_u64(&led_key(index, "busy"), u64::from(led.busy_pattern.code()))?;
        store.put_u64(
            &led_key(index, "meeting"),
            u64::from(led.meeting_pattern.code()),
        )?;
        store.put_u64(&led_key(index, "idle"), u64::from(led.idle_pattern.code()))?;
        store.put_bool(&led_key(index, "enabled"), led.enabled)?;
    }
    for index in config.leds.len()..MAX_LEDS {
        for field in ["pin", "busy", "meeting", "idle", "enabled"] {
            store.remove(&led_key(index, field))?;
        }
    }
    Ok(())
}

pub fn load_tokens(store: &dyn KeyValueStore) -> Option<OauthTokens> {
    let access_token = store.get_str(keys::ACCESS_TOKEN)?;
    if access_token.is_empty() {
        return None;
    }
    Some(OauthTokens {
        access_token,
        refresh_token: store.get_str(keys::REFRESH_TOKEN).unwrap_or_default(),
        // 0 reads as already expired, forcing a refresh before first use.
        expires_at_ms: store.get_u64(keys::TOKEN_EXPIRES).unwrap_or(0),
    })
}

pub fn save_tokens(store: &mut dyn KeyValueStore, tokens: &OauthTokens) -> Result<(), StoreError> {
    store.put_str(keys::ACCESS_TOKEN, &tokens.access_token)?;
    store.put_str(keys::REFRESH_TOKEN, &tokens.refresh_token)?;
    store.put_u64(keys::TOKEN_EXPIRES, tokens.expires_at_ms)?;
    Ok(())
}

pub fn clear_tokens(store: &mut dyn KeyValueStore) -> Result<(), StoreError> {
    store.remove(keys::ACCESS_TOKEN)?;
    store.remove(keys::REFRESH_TOKEN)?;
    store.remove(keys::TOKEN_EXPIRES)?;
    Ok(())
}

pub fn load_session(store: &dyn KeyValueStore) -> Option<DeviceCodeSession> {
    let device_code = store.get_str(keys::DEVICE_CODE)?;
    if device_code.is_empty() {
        return None;
    }
    Some(DeviceCodeSession {
        device_code,
        user_code: store.get_str(keys::USER_CODE).unwrap_or_default(),
        verification_uri: store.get_str(keys::VERIFICATION_URI).unwrap_or_default(),
        interval_ms: DEFAULT_POLL_INTERVAL_MS,
        expires_at_ms: store.get_u64(keys::DEVICE_CODE_EXPIRES).unwrap_or(0),
        last_poll_ms: 0,
    })
}

pub fn save_session(
    store: &mut dyn KeyValueStore,
    session: &DeviceCodeSession,
) -> Result<(), StoreError> {
    store.put_str(keys::DEVICE_CODE, &session.device_code)?;
    store.put_str(keys::USER_CODE, &session.user_code)?;
    store.put_str(keys::VERIFICATION_URI, &session.verification_uri)?;
    store.put_u64(keys::DEVICE_CODE_EXPIRES, session.expires_at_ms)?;
    Ok(())
}

pub fn clear_session(store: &mut dyn KeyValueStore) -> Result<(), StoreError> {
    store.remove(keys::DEVICE_CODE)?;
    store.remove(keys::USER_CODE)?;
    store.remove(keys::VERIFICATION_URI)?;
    store.remove(keys::DEVICE_CODE_EXPIRES)?;
    Ok(())
}

/// In-memory store; doubles as the host target's backing (serialized to a
/// JSON file) and as the test store.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    values: BTreeMap<String, serde_json::Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            values: serde_json::from_str(raw)?,
        })
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.values)
    }
}

impl KeyValueStore for MemStore {
    fn get_str(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(|value| value.as_u64())
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.values
            .get(key)
            .and_then(|value| value.as_i64())
            .and_then(|value| i32::try_from(value).ok())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(|value| value.as_bool())
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_keys_yield_defaults() {
        let store = MemStore::new();
        let config = load_device_config(&store);

        assert_eq!(config.wifi_ssid, "");
        assert_eq!(config.tenant_id, "common");
        assert_eq!(config.ota_url, DEFAULT_OTA_URL);
        assert_eq!(config.leds, vec![LedConfig::default()]);
        assert!(load_tokens(&store).is_none());
        assert!(load_session(&store).is_none());
    }

    #[test]
    fn device_config_round_trips() {
        let mut store = MemStore::new();
        let mut config = DeviceConfig {
            wifi_ssid: "office".into(),
            wifi_pass: "hunter2".into(),
            client_id: "abc-123".into(),
            tenant_id: "contoso".into(),
            user_email: "user@contoso.com".into(),
            leds: vec![
                LedConfig {
                    pin: 4,
                    busy_pattern: Pattern::FastBlink,
                    meeting_pattern: Pattern::DoubleBlink,
                    idle_pattern: Pattern::Off,
                    enabled: true,
                },
                LedConfig {
                    pin: 16,
                    enabled: false,
                    ..LedConfig::default()
                },
            ],
            ..DeviceConfig::default()
        };
        config.sanitize();

        save_device_config(&mut store, &config).unwrap();
        assert_eq!(load_device_config(&store), config);
    }

    #[test]
    fn tokens_round_trip_and_clear() {
        let mut store = MemStore::new();
        let tokens = OauthTokens {
            access_token: "eyJ0".into(),
            refresh_token: "0.ARo".into(),
            expires_at_ms: 1_700_000_000_000,
        };

        save_tokens(&mut store, &tokens).unwrap();
        assert_eq!(load_tokens(&store), Some(tokens));

        clear_tokens(&mut store).unwrap();
        assert_eq!(load_tokens(&store), None);
    }

    #[test]
    fn session_round_trips_without_poll_state() {
        let mut store = MemStore::new();
        let session = DeviceCodeSession {
            device_code: "GmRhmhcxhwAzkoEqiMEg_DnyEos".into(),
            user_code: "FJB9-WNXA".into(),
            verification_uri: "https://microsoft.com/devicelogin".into(),
            interval_ms: 5_000,
            expires_at_ms: 1_700_000_900_000,
            last_poll_ms: 42_000,
        };

        save_session(&mut store, &session).unwrap();
        let loaded = load_session(&store).unwrap();

        assert_eq!(loaded.device_code, session.device_code);
        assert_eq!(loaded.user_code, session.user_code);
        assert_eq!(loaded.verification_uri, session.verification_uri);
        assert_eq!(loaded.expires_at_ms, session.expires_at_ms);
        // Poll cadence restarts after a reboot.
        assert_eq!(loaded.last_poll_ms, 0);
    }

    #[test]
    fn empty_access_token_means_no_tokens() {
        let mut store = MemStore::new();
        store.put_str(keys::ACCESS_TOKEN, "").unwrap();
        assert!(load_tokens(&store).is_none());
    }
}
