//! OAuth 2.0 device authorization grant (RFC 8628) against the Microsoft
//! identity platform, plus refresh-token handling.
//!
//! The token endpoint signals pending/denied states through HTTP 400 with an
//! `error` body, so 200/400/401 are the parseable statuses; everything else
//! is a transient transport-level failure and retried on the next poll tick.

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::transport::{HttpRequest, HttpTransport, TransportError};

pub const DEVICE_CODE_SCOPE: &str =
    "https://graph.microsoft.com/Presence.Read offline_access";
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const SLOW_DOWN_EXTRA_MS: u64 = 5_000;
/// A token is due for refresh this long before it expires.
pub const REFRESH_MARGIN_MS: u64 = 300_000;
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3_600;

pub fn device_code_url(tenant_id: &str) -> String {
    format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/devicecode")
}

pub fn token_url(tenant_id: &str) -> String {
    format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OauthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Wall-clock epoch milliseconds.
    pub expires_at_ms: u64,
}

impl OauthTokens {
    pub fn refresh_due(&self, wall_ms: u64) -> bool {
        wall_ms.saturating_add(REFRESH_MARGIN_MS) > self.expires_at_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval_ms: u64,
    /// Wall-clock epoch milliseconds.
    pub expires_at_ms: u64,
    /// Monotonic; not persisted, so polling restarts promptly after reboot.
    pub last_poll_ms: u64,
}

impl DeviceCodeSession {
    pub fn expired(&self, wall_ms: u64) -> bool {
        wall_ms >= self.expires_at_ms
    }

    pub fn poll_due(&self, mono_ms: u64) -> bool {
        self.last_poll_ms == 0 || mono_ms.saturating_sub(self.last_poll_ms) >= self.interval_ms
    }
}

#[derive(Debug, Error)]
pub enum AuthStartError {
    #[error("Client ID and Tenant ID must be configured first")]
    MissingConfig,
    #[error("device code request rejected: HTTP {0}")]
    Rejected(u16),
    #[error("device code response missing required fields")]
    Malformed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of one token-endpoint poll while a device-code session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Authorized(OauthTokens),
    Pending,
    SlowDown,
    Declined,
    Expired,
    /// Transient; no transition, retried on the next poll tick.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(OauthTokens),
    /// The stored grant is no longer trustworthy; retrying cannot succeed.
    Invalid,
    Failed,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

fn form_body(pairs: &[(&str, &str)]) -> Result<String, TransportError> {
    serde_urlencoded::to_string(pairs)
        .map_err(|err| TransportError::Failed(format!("form encoding failed: {err}")))
}

/// Start a device-code session: POST client_id + scope to the devicecode
/// endpoint. Anything but HTTP 200 leaves the caller in its prior state.
pub fn request_device_code(
    http: &mut dyn HttpTransport,
    client_id: &str,
    tenant_id: &str,
    wall_ms: u64,
) -> Result<DeviceCodeSession, AuthStartError> {
    let url = device_code_url(tenant_id);
    let body = form_body(&[("client_id", client_id), ("scope", DEVICE_CODE_SCOPE)])?;
    let response = http.send(&HttpRequest::post_form(&url, body.as_bytes()))?;

    if response.status != 200 {
        warn!(
            "device code request failed: HTTP {} {}",
            response.status,
            response.body_str()
        );
        return Err(AuthStartError::Rejected(response.status));
    }

    let parsed: DeviceCodeResponse = response.json().map_err(|err| {
        warn!("device code response parse failed: {err}");
        AuthStartError::Malformed
    })?;

    Ok(DeviceCodeSession {
        device_code: parsed.device_code,
        user_code: parsed.user_code,
        verification_uri: parsed.verification_uri,
        interval_ms: parsed
            .interval
            .map(|secs| secs * 1_000)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        expires_at_ms: wall_ms.saturating_add(parsed.expires_in * 1_000),
        last_poll_ms: 0,
    })
}

/// One poll of the token endpoint. Public-client flow: no client_secret.
pub fn poll_device_token(
    http: &mut dyn HttpTransport,
    client_id: &str,
    tenant_id: &str,
    session: &DeviceCodeSession,
    wall_ms: u64,
) -> PollOutcome {
    let url = token_url(tenant_id);
    let body = match form_body(&[
        ("grant_type", DEVICE_CODE_GRANT_TYPE),
        ("client_id", client_id),
        ("device_code", &session.device_code),
    ]) {
        Ok(body) => body,
        Err(err) => {
            warn!("token poll request build failed: {err}");
            return PollOutcome::Retry;
        }
    };

    match http.send(&HttpRequest::post_form(&url, body.as_bytes())) {
        Ok(response) => classify_poll_response(response.status, &response.body_str(), wall_ms),
        Err(err) => {
            warn!("token poll transport failure: {err}");
            PollOutcome::Retry
        }
    }
}

pub fn classify_poll_response(status: u16, body: &str, wall_ms: u64) -> PollOutcome {
    if !matches!(status, 200 | 400 | 401) {
        warn!("token poll returned HTTP {status}");
        return PollOutcome::Retry;
    }

    let parsed: TokenResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("token poll response parse failed: {err}");
            return PollOutcome::Retry;
        }
    };

    if let Some(access_token) = parsed.access_token.filter(|token| !token.is_empty()) {
        return PollOutcome::Authorized(OauthTokens {
            access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            expires_at_ms: expires_at(wall_ms, parsed.expires_in),
        });
    }

    match parsed.error.as_deref() {
        Some("authorization_pending") => {
            debug!("device code authorization pending");
            PollOutcome::Pending
        }
        Some("slow_down") => PollOutcome::SlowDown,
        Some("authorization_declined") => PollOutcome::Declined,
        Some("expired_token") => PollOutcome::Expired,
        Some(other) => {
            warn!("token poll error `{other}`");
            PollOutcome::Retry
        }
        None => PollOutcome::Retry,
    }
}

/// Exchange the refresh token for fresh credentials. The scope parameter is
/// required here; omitting it earns an HTTP 401 from the identity platform.
/// `client_secret` is appended only when the application is configured as a
/// confidential client.
pub fn refresh_tokens(
    http: &mut dyn HttpTransport,
    client_id: &str,
    client_secret: &str,
    tenant_id: &str,
    current: &OauthTokens,
    wall_ms: u64,
) -> RefreshOutcome {
    if current.refresh_token.is_empty() {
        return RefreshOutcome::Invalid;
    }

    let mut pairs = vec![("client_id", client_id)];
    if !client_secret.is_empty() {
        pairs.push(("client_secret", client_secret));
    }
    pairs.push(("refresh_token", &current.refresh_token));
    pairs.push(("grant_type", "refresh_token"));
    pairs.push(("scope", DEVICE_CODE_SCOPE));

    let url = token_url(tenant_id);
    let body = match form_body(&pairs) {
        Ok(body) => body,
        Err(err) => {
            warn!("token refresh request build failed: {err}");
            return RefreshOutcome::Failed;
        }
    };

    let response = match http.send(&HttpRequest::post_form(&url, body.as_bytes())) {
        Ok(response) => response,
        Err(err) => {
            warn!("token refresh transport failure: {err}");
            return RefreshOutcome::Failed;
        }
    };

    if response.status == 401 {
        warn!("token refresh unauthorized; stored credentials are stale");
        return RefreshOutcome::Invalid;
    }
    if response.status != 200 {
        warn!("token refresh failed: HTTP {}", response.status);
        return RefreshOutcome::Failed;
    }

    let parsed: TokenResponse = match response.json() {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("token refresh response parse failed: {err}");
            return RefreshOutcome::Failed;
        }
    };

    match parsed.access_token.filter(|token| !token.is_empty()) {
        Some(access_token) => RefreshOutcome::Refreshed(OauthTokens {
            access_token,
            // The platform may rotate the refresh token; keep ours otherwise.
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at_ms: expires_at(wall_ms, parsed.expires_in),
        }),
        None => RefreshOutcome::Failed,
    }
}

fn expires_at(wall_ms: u64, expires_in: Option<u64>) -> u64 {
    wall_ms.saturating_add(expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS) * 1_000)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::scripted::ScriptedHttp;

    const WALL: u64 = 1_700_000_000_000;

    fn session() -> DeviceCodeSession {
        DeviceCodeSession {
            device_code: "GmRhmhcxhwAzkoEqiMEg_DnyEos".into(),
            user_code: "FJB9-WNXA".into(),
            verification_uri: "https://microsoft.com/devicelogin".into(),
            interval_ms: 5_000,
            expires_at_ms: WALL + 900_000,
            last_poll_ms: 0,
        }
    }

    fn tokens() -> OauthTokens {
        OauthTokens {
            access_token: "eyJ0eXAi".into(),
            refresh_token: "0.ARoA".into(),
            expires_at_ms: WALL + 3_600_000,
        }
    }

    #[test]
    fn device_code_request_posts_client_and_scope() {
        let mut http = ScriptedHttp::new().respond(
            200,
            r#"{"device_code":"dc","user_code":"ABCD-1234",
                "verification_uri":"https://microsoft.com/devicelogin",
                "expires_in":900,"interval":5}"#,
        );

        let session = request_device_code(&mut http, "client-1", "contoso", WALL).unwrap();

        let request = &http.requests[0];
        assert_eq!(
            request.url,
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            request.body,
            "client_id=client-1&scope=https%3A%2F%2Fgraph.microsoft.com%2FPresence.Read+offline_access"
        );
        assert_eq!(session.user_code, "ABCD-1234");
        assert_eq!(session.expires_at_ms, WALL + 900_000);
        assert_eq!(session.interval_ms, 5_000);
    }

    #[test]
    fn device_code_request_rejection_is_an_error() {
        let mut http = ScriptedHttp::new().respond(400, r#"{"error":"invalid_client"}"#);
        let err = request_device_code(&mut http, "client-1", "contoso", WALL).unwrap_err();
        assert!(matches!(err, AuthStartError::Rejected(400)));
    }

    #[test]
    fn poll_uses_public_client_grant() {
        let mut http =
            ScriptedHttp::new().respond(400, r#"{"error":"authorization_pending"}"#);

        let outcome = poll_device_token(&mut http, "client-1", "contoso", &session(), WALL);

        assert_eq!(outcome, PollOutcome::Pending);
        let body = &http.requests[0].body;
        assert!(body.contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code"
        ));
        assert!(body.contains("client_id=client-1"));
        assert!(body.contains("device_code=GmRhmhcxhwAzkoEqiMEg_DnyEos"));
        // Public client flow: a secret here earns AADSTS7000218.
        assert!(!body.contains("client_secret"));
    }

    #[test]
    fn poll_success_stores_tokens() {
        let outcome = classify_poll_response(
            200,
            r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#,
            WALL,
        );

        assert_eq!(
            outcome,
            PollOutcome::Authorized(OauthTokens {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                expires_at_ms: WALL + 3_600_000,
            })
        );
    }

    #[test]
    fn poll_classifies_oauth_errors() {
        for (error, expected) in [
            ("authorization_pending", PollOutcome::Pending),
            ("slow_down", PollOutcome::SlowDown),
            ("authorization_declined", PollOutcome::Declined),
            ("expired_token", PollOutcome::Expired),
            ("invalid_grant", PollOutcome::Retry),
        ] {
            let body = format!(r#"{{"error":"{error}"}}"#);
            assert_eq!(classify_poll_response(400, &body, WALL), expected, "{error}");
        }
    }

    #[test]
    fn poll_treats_unexpected_statuses_as_transient() {
        for status in [404, 500, 503] {
            assert_eq!(
                classify_poll_response(status, "Service Unavailable", WALL),
                PollOutcome::Retry
            );
        }
    }

    #[test]
    fn poll_due_respects_interval() {
        let mut session = session();
        session.last_poll_ms = 10_000;
        assert!(!session.poll_due(14_999));
        assert!(session.poll_due(15_000));
    }

    #[test]
    fn refresh_includes_scope_and_secret() {
        let mut http = ScriptedHttp::new().respond(
            200,
            r#"{"access_token":"new-at","expires_in":3600}"#,
        );

        let outcome = refresh_tokens(&mut http, "client-1", "s3cret", "contoso", &tokens(), WALL);

        let body = &http.requests[0].body;
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("client_secret=s3cret"));
        assert!(body.contains("refresh_token=0.ARoA"));
        // Missing scope is the historical cause of refresh 401s.
        assert!(body.contains("scope=https%3A%2F%2Fgraph.microsoft.com%2FPresence.Read+offline_access"));

        // New refresh token absent: the stored one is kept.
        assert_eq!(
            outcome,
            RefreshOutcome::Refreshed(OauthTokens {
                access_token: "new-at".into(),
                refresh_token: "0.ARoA".into(),
                expires_at_ms: WALL + 3_600_000,
            })
        );
    }

    #[test]
    fn refresh_without_secret_omits_it() {
        let mut http = ScriptedHttp::new().respond(
            200,
            r#"{"access_token":"new-at","refresh_token":"new-rt"}"#,
        );

        let outcome = refresh_tokens(&mut http, "client-1", "", "contoso", &tokens(), WALL);

        assert!(!http.requests[0].body.contains("client_secret"));
        match outcome {
            RefreshOutcome::Refreshed(tokens) => {
                assert_eq!(tokens.refresh_token, "new-rt");
                assert_eq!(tokens.expires_at_ms, WALL + 3_600_000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn refresh_unauthorized_invalidates_tokens() {
        let mut http = ScriptedHttp::new().respond(401, r#"{"error":"invalid_grant"}"#);
        let outcome = refresh_tokens(&mut http, "client-1", "", "contoso", &tokens(), WALL);
        assert_eq!(outcome, RefreshOutcome::Invalid);
    }

    #[test]
    fn refresh_server_error_is_transient() {
        let mut http = ScriptedHttp::new().respond(503, "Service Unavailable");
        let outcome = refresh_tokens(&mut http, "client-1", "", "contoso", &tokens(), WALL);
        assert_eq!(outcome, RefreshOutcome::Failed);
    }

    #[test]
    fn refresh_without_refresh_token_cannot_succeed() {
        let mut http = ScriptedHttp::new();
        let mut current = tokens();
        current.refresh_token = String::new();

        let outcome = refresh_tokens(&mut http, "client-1", "", "contoso", &current, WALL);

        assert_eq!(outcome, RefreshOutcome::Invalid);
        assert!(http.requests.is_empty());
    }

    #[test]
    fn refresh_due_honors_margin() {
        let tokens = tokens();
        assert!(!tokens.refresh_due(tokens.expires_at_ms - REFRESH_MARGIN_MS));
        assert!(tokens.refresh_due(tokens.expires_at_ms - REFRESH_MARGIN_MS + 1));
        assert!(tokens.refresh_due(tokens.expires_at_ms));
    }
}
