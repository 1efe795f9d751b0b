use thiserror::Error;

/// Blocking HTTP(S) request primitive. The platform layer supplies the real
/// client (EspHttpConnection on device, reqwest on the host); everything in
/// this crate talks to the trait so the protocol logic stays host-testable.
///
/// Implementations must enforce their own bounded timeout; a call that cannot
/// complete returns `TransportError` rather than blocking the run loop.
pub trait HttpTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: Option<&'a [u8]>,
}

pub const FORM_HEADERS: &[(&str, &str)] =
    &[("Content-Type", "application/x-www-form-urlencoded")];

impl<'a> HttpRequest<'a> {
    pub fn get(url: &'a str, headers: &'a [(&'a str, &'a str)]) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers,
            body: None,
        }
    }

    /// Form-encoded POST; the caller provides an already encoded body.
    pub fn post_form(url: &'a str, body: &'a [u8]) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            headers: FORM_HEADERS,
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request timed out")]
    Timeout,
    #[error("http transport failure: {0}")]
    Failed(String),
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;

    use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: &'static str,
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    /// Transport double fed with canned responses, recording every request.
    #[derive(Default)]
    pub struct ScriptedHttp {
        pub requests: Vec<RecordedRequest>,
        responses: VecDeque<Result<HttpResponse, TransportError>>,
    }

    impl ScriptedHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(mut self, status: u16, body: &str) -> Self {
            self.push_response(status, body);
            self
        }

        pub fn push_response(&mut self, status: u16, body: &str) {
            self.responses.push_back(Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }));
        }

        pub fn push_error(&mut self, error: TransportError) {
            self.responses.push_back(Err(error));
        }
    }

    impl HttpTransport for ScriptedHttp {
        fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
            self.requests.push(RecordedRequest {
                method: request.method.as_str(),
                url: request.url.to_string(),
                headers: request
                    .headers
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                body: request
                    .body
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_default(),
            });
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Failed("no scripted response".into())))
        }
    }
}
