//! Production transport over `reqwest`'s blocking client.
//!
//! All network I/O happens on the sender's background thread, so the
//! blocking client is the right tool; the instrumented application never
//! waits on it. Beacon bodies are gzip-compressed before POSTing.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use super::{BeaconTransport, RawResponse, RequestKind, TransportError};
use crate::config::AgentConfiguration;

/// Upper bound on send attempts for one request.
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Pause between retry attempts.
const RETRY_SLEEP: Duration = Duration::from_millis(200);

/// Query parameter carrying the protocol type marker.
const QUERY_TYPE: &str = "type=m";

/// HTTP transport for the beacon protocol.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    application_id: String,
}

impl HttpTransport {
    /// Creates a transport for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidBaseUrl`] when the base URL does not
    /// parse, and [`TransportError::ClientInit`] when the HTTP client cannot
    /// be built.
    pub fn new(config: &AgentConfiguration) -> Result<Self, TransportError> {
        reqwest::Url::parse(&config.base_url).map_err(|error| TransportError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: error.to_string(),
        })?;

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|error| TransportError::ClientInit {
                message: error.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            application_id: config.application_id.clone(),
        })
    }

    fn request_url(&self, kind: RequestKind, server_id: i32) -> String {
        let mut url = format!(
            "{}?{}&srvid={}&app={}",
            self.base_url, QUERY_TYPE, server_id, self.application_id
        );
        if kind == RequestKind::NewSession {
            url.push_str("&ns=1");
        }
        url
    }

    fn execute(&self, kind: RequestKind, url: &str, body: Option<Vec<u8>>) -> RawResponse {
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let request = match &body {
                Some(bytes) => self
                    .client
                    .post(url)
                    .header(reqwest::header::CONTENT_ENCODING, "gzip")
                    .body(bytes.clone()),
                None => self.client.get(url),
            };
            match request.send() {
                Ok(response) => {
                    let code = i32::from(response.status().as_u16());
                    let body = response.text().unwrap_or_default();
                    debug!(%kind, code, "request completed");
                    return RawResponse { code, body };
                }
                Err(error) => {
                    let retryable = error.is_connect() || error.is_timeout();
                    if retryable && attempt < MAX_SEND_ATTEMPTS {
                        debug!(%kind, attempt, %error, "request failed, retrying");
                        std::thread::sleep(RETRY_SLEEP);
                        continue;
                    }
                    warn!(%kind, attempt, %error, "request failed, giving up");
                    return RawResponse::transport_failure();
                }
            }
        }
        RawResponse::transport_failure()
    }

    fn compress(beacon_data: &str) -> Result<Vec<u8>, TransportError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(beacon_data.as_bytes())?;
        Ok(encoder.finish()?)
    }
}

impl BeaconTransport for HttpTransport {
    fn send_status_request(&self, server_id: i32) -> RawResponse {
        let url = self.request_url(RequestKind::Status, server_id);
        self.execute(RequestKind::Status, &url, None)
    }

    fn send_new_session_request(&self, server_id: i32) -> RawResponse {
        let url = self.request_url(RequestKind::NewSession, server_id);
        self.execute(RequestKind::NewSession, &url, None)
    }

    fn send_beacon(&self, server_id: i32, beacon_data: &str) -> RawResponse {
        let url = self.request_url(RequestKind::Beacon, server_id);
        match Self::compress(beacon_data) {
            Ok(body) => self.execute(RequestKind::Beacon, &url, Some(body)),
            Err(error) => {
                // Compression failing means the payload cannot be shipped at
                // all; treat it like a transport failure and let the next
                // cycle retry with freshly extracted data.
                warn!(%error, "beacon compression failed");
                RawResponse::transport_failure()
            }
        }
    }
}
