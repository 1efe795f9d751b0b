//! Presence fetch against the Microsoft Graph API and the mapping from the
//! provider vocabulary to the internal enum.

use log::warn;
use serde::Deserialize;

use crate::transport::{HttpRequest, HttpTransport};
use crate::types::Presence;

pub const PRESENCE_ENDPOINT: &str = "https://graph.microsoft.com/v1.0/me/presence";
pub const PRESENCE_POLL_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct PresenceBody {
    #[serde(default)]
    availability: String,
    #[serde(default)]
    activity: String,
}

/// Activity-based meeting detection is checked before availability: a user
/// can be `Busy`/`InAMeeting` and the meeting wins.
pub fn map_presence(availability: &str, activity: &str) -> Presence {
    match activity {
        "InAMeeting" | "InACall" | "InAConferenceCall" => return Presence::InMeeting,
        _ => {}
    }
    match availability {
        "Busy" | "DoNotDisturb" => Presence::Busy,
        "Available" => Presence::Available,
        "Away" | "BeRightBack" => Presence::Away,
        "Offline" => Presence::Offline,
        other => {
            warn!("unrecognized presence availability `{other}` (activity `{activity}`)");
            Presence::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Updated(Presence),
    /// The bearer token was rejected; the caller decides on a refresh.
    Unauthorized,
    /// Transient; presence stays unchanged and the 30 s cadence retries.
    Failed,
}

pub fn fetch_presence(http: &mut dyn HttpTransport, access_token: &str) -> PresenceOutcome {
    let authorization = format!("Bearer {access_token}");
    let headers = [("Authorization", authorization.as_str())];
    let request = HttpRequest::get(PRESENCE_ENDPOINT, &headers);

    let response = match http.send(&request) {
        Ok(response) => response,
        Err(err) => {
            warn!("presence fetch transport failure: {err}");
            return PresenceOutcome::Failed;
        }
    };

    match response.status {
        200 => match response.json::<PresenceBody>() {
            Ok(body) => PresenceOutcome::Updated(map_presence(&body.availability, &body.activity)),
            Err(err) => {
                warn!("presence response parse failed: {err}");
                PresenceOutcome::Failed
            }
        },
        401 => PresenceOutcome::Unauthorized,
        status => {
            warn!("presence fetch failed: HTTP {status}");
            PresenceOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::scripted::ScriptedHttp;
    use crate::transport::TransportError;

    #[test]
    fn activity_takes_precedence_over_availability() {
        assert_eq!(map_presence("Busy", "InAMeeting"), Presence::InMeeting);
        assert_eq!(map_presence("Available", "InACall"), Presence::InMeeting);
        assert_eq!(
            map_presence("DoNotDisturb", "InAConferenceCall"),
            Presence::InMeeting
        );
    }

    #[test]
    fn availability_mapping_is_total() {
        let cases = [
            ("Busy", Presence::Busy),
            ("DoNotDisturb", Presence::Busy),
            ("Available", Presence::Available),
            ("Away", Presence::Away),
            ("BeRightBack", Presence::Away),
            ("Offline", Presence::Offline),
            ("PresenceUnknown", Presence::Unknown),
            ("", Presence::Unknown),
        ];
        for (availability, expected) in cases {
            assert_eq!(map_presence(availability, ""), expected, "{availability}");
            // A non-meeting activity never changes the availability verdict.
            assert_eq!(
                map_presence(availability, "Presenting"),
                expected,
                "{availability}/Presenting"
            );
        }
    }

    #[test]
    fn fetch_sends_bearer_token() {
        let mut http = ScriptedHttp::new()
            .respond(200, r#"{"availability":"Available","activity":"Available"}"#);

        let outcome = fetch_presence(&mut http, "tok-123");

        assert_eq!(outcome, PresenceOutcome::Updated(Presence::Available));
        let request = &http.requests[0];
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, PRESENCE_ENDPOINT);
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer tok-123".to_string())]
        );
    }

    #[test]
    fn busy_in_a_meeting_maps_to_meeting() {
        let mut http = ScriptedHttp::new()
            .respond(200, r#"{"availability":"Busy","activity":"InAMeeting"}"#);
        assert_eq!(
            fetch_presence(&mut http, "tok"),
            PresenceOutcome::Updated(Presence::InMeeting)
        );
    }

    #[test]
    fn unauthorized_is_surfaced_to_the_caller() {
        let mut http = ScriptedHttp::new().respond(401, "");
        assert_eq!(fetch_presence(&mut http, "tok"), PresenceOutcome::Unauthorized);
    }

    #[test]
    fn other_failures_are_tolerated() {
        let mut http = ScriptedHttp::new().respond(503, "Service Unavailable");
        assert_eq!(fetch_presence(&mut http, "tok"), PresenceOutcome::Failed);

        let mut http = ScriptedHttp::new();
        http.push_error(TransportError::Timeout);
        assert_eq!(fetch_presence(&mut http, "tok"), PresenceOutcome::Failed);
    }
}
