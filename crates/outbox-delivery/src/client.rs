//! HTTP client for webhook delivery with configurable timeouts.
//!
//! [`DeliveryClient::deliver`] never returns an error: every problem, from an
//! unparsable method to a connection reset, becomes a
//! [`DeliveryOutcome::Failed`] that feeds the backoff policy.

use std::time::{Duration, Instant};

use bytes::Bytes;
use outbox_core::{Headers, MessageId};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method, Response, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Response bodies longer than this are truncated in logs and errors.
const MAX_LOGGED_BODY: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("outbox/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
        }
    }
}

/// One outbound callback.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Destination URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Merged queue and message headers.
    pub headers: Headers,
    /// Request body.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Target answered 2xx.
    Delivered {
        /// HTTP status code.
        status_code: u16,
        /// Round-trip time.
        duration: Duration,
    },
    /// Anything else.
    Failed {
        /// Why the attempt failed.
        error: DeliveryError,
        /// Time spent before failing.
        duration: Duration,
    },
}

impl DeliveryOutcome {
    /// Whether the target accepted the callback.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Status code, if the target answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Delivered { status_code, .. } => Some(*status_code),
            Self::Failed { error: DeliveryError::HttpStatus { status_code, .. }, .. } => {
                Some(*status_code)
            },
            Self::Failed { .. } => None,
        }
    }

    /// Time spent on the attempt.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Delivered { duration, .. } | Self::Failed { duration, .. } => *duration,
        }
    }
}

/// HTTP client for webhook delivery.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the TLS backend cannot
    /// be initialised.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Performs one delivery attempt and classifies the result.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryOutcome {
        let start_time = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            message_id = %request.message_id,
            url = %request.url,
            method = %request.method,
            attempt = request.attempt_number
        );

        async move {
            let http_request = match self.build_request(&request) {
                Ok(http_request) => http_request,
                Err(error) => {
                    warn!(error = %error, "request could not be built");
                    return DeliveryOutcome::Failed { error, duration: start_time.elapsed() };
                },
            };

            let response = match self.client.execute(http_request).await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    let error = if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    };
                    return DeliveryOutcome::Failed { error, duration };
                },
            };

            let status_code = response.status().as_u16();
            if response.status().is_success() {
                let duration = start_time.elapsed();
                debug!(status = status_code, duration_ms = duration.as_millis(), "delivered");
                return DeliveryOutcome::Delivered { status_code, duration };
            }

            let body = read_error_body(response).await;
            let duration = start_time.elapsed();
            warn!(
                status = status_code,
                duration_ms = duration.as_millis(),
                body = body.as_deref().unwrap_or(""),
                "target rejected delivery"
            );

            let error = DeliveryError::http_status(status_code, body);
            DeliveryOutcome::Failed { error, duration }
        }
        .instrument(span)
        .await
    }

    fn build_request(&self, request: &DeliveryRequest) -> Result<reqwest::Request> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            DeliveryError::invalid_request(format!("invalid HTTP method '{}'", request.method))
        })?;
        let url = Url::parse(&request.url).map_err(|e| {
            DeliveryError::invalid_request(format!("invalid callback URL '{}': {e}", request.url))
        })?;

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 2);
        for (key, value) in &request.headers {
            if is_managed_header(key) {
                continue;
            }
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                DeliveryError::invalid_request(format!("invalid header name '{key}'"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                DeliveryError::invalid_request(format!("invalid value for header '{key}'"))
            })?;
            headers.insert(name, value);
        }
        headers.insert(
            HeaderName::from_static("x-outbox-message-id"),
            header_value(&request.message_id.to_string())?,
        );
        headers.insert(
            HeaderName::from_static("x-outbox-attempt"),
            header_value(&request.attempt_number.to_string())?,
        );

        // The body goes out whatever the method, GET included.
        self.client
            .request(method, url)
            .headers(headers)
            .body(request.body.clone())
            .build()
            .map_err(|e| DeliveryError::invalid_request(e.to_string()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| DeliveryError::internal(e.to_string()))
}

/// Reads the body of a rejected response for logging.
///
/// JSON bodies are parsed and bodies typed exactly `text/plain` are read
/// verbatim. Anything else, `text/plain; charset=...` included, is drained
/// and discarded.
async fn read_error_body(response: Response) -> Option<String> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if content_type.starts_with("application/json") {
        match response.json::<serde_json::Value>().await {
            Ok(json) => Some(truncate(json.to_string())),
            Err(e) => {
                debug!(error = %e, "error response declared JSON but did not parse");
                None
            },
        }
    } else if content_type == "text/plain" {
        response.text().await.ok().map(truncate)
    } else {
        let _ = response.bytes().await;
        None
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_LOGGED_BODY {
        let mut cut = MAX_LOGGED_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("... (truncated)");
    }
    body
}

/// Checks if a header is managed by the HTTP client and must not be copied
/// from queue or message headers.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request_to(url: String) -> DeliveryRequest {
        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("X-Original-Header".to_string(), "test-value".to_string());

        DeliveryRequest {
            message_id: MessageId::new(),
            url,
            method: "POST".to_string(),
            headers,
            body: Bytes::from(r#"{"hello":"world"}"#),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::body_string(r#"{"hello":"world"}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(format!("{}/webhook", mock_server.uri()))).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.status_code(), Some(204));
    }

    #[tokio::test]
    async fn server_error_is_failure_with_text_body() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_raw("boom", "text/plain"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        match outcome {
            DeliveryOutcome::Failed {
                error: DeliveryError::HttpStatus { status_code, body }, ..
            } => {
                assert_eq!(status_code, 500);
                assert_eq!(body.as_deref(), Some("boom"));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_error_body_is_parsed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(serde_json::json!({"reason": "nope"})),
            )
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        match outcome {
            DeliveryOutcome::Failed { error: DeliveryError::HttpStatus { body, .. }, .. } => {
                assert_eq!(body.as_deref(), Some(r#"{"reason":"nope"}"#));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_content_types_are_discarded() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_raw("<h1>missing</h1>", "text/html"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        assert_eq!(outcome.status_code(), Some(404));
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: DeliveryError::HttpStatus { body: None, .. }, .. }
        ));
    }

    #[tokio::test]
    async fn text_with_parameters_is_not_read() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_raw("boom", "text/plain; charset=utf-8"),
            )
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        assert_eq!(outcome.status_code(), Some(500));
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: DeliveryError::HttpStatus { body: None, .. }, .. }
        ));
    }

    #[tokio::test]
    async fn get_requests_carry_the_body() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .and(matchers::body_string(r#"{"hello":"world"}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut request = request_to(mock_server.uri());
        request.method = "GET".to_string();

        assert!(client.deliver(request).await.is_success());
    }

    #[tokio::test]
    async fn connection_refused_is_network_failure() {
        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to("http://127.0.0.1:1/webhook".to_string())).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: DeliveryError::NetworkError { .. }, .. }
        ));
        assert_eq!(outcome.status_code(), None);
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let config = ClientConfig { timeout: Duration::from_millis(50), ..ClientConfig::default() };
        let client = DeliveryClient::new(config).unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: DeliveryError::Timeout { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn invalid_method_fails_without_sending() {
        let client = DeliveryClient::with_defaults().unwrap();
        let mut request = request_to("http://127.0.0.1:1/webhook".to_string());
        request.method = "NOT A METHOD".to_string();

        let outcome = client.deliver(request).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: DeliveryError::InvalidRequest { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn custom_and_metadata_headers_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("X-Original-Header", "test-value"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header_exists("x-outbox-message-id"))
            .and(matchers::header("x-outbox-attempt", "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let outcome = client.deliver(request_to(mock_server.uri())).await;

        assert!(outcome.is_success());
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("Host"));
        assert!(!is_managed_header("X-Custom-Header"));
        assert!(!is_managed_header("Authorization"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = truncate("é".repeat(MAX_LOGGED_BODY));
        assert!(body.ends_with("... (truncated)"));
        assert!(body.len() <= MAX_LOGGED_BODY + "... (truncated)".len());
    }
}
