//! HTTP transport for license and provisioning exchanges.
//!
//! License servers routinely answer POSTs with 307/308 redirects to regional
//! endpoints. Generic client redirect handling may drop the body or demote the
//! method, so [`LicenseTransport`] disables it and follows those two codes
//! itself, replaying the original method, headers and body against each new
//! location.
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use reqwest::redirect::Policy;
use reqwest::Method;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::utils::resolve_location;

/// Maximum number of 307/308 redirects followed for a single request.
pub const MAX_MANUAL_REDIRECTS: usize = 5;
/// Per-exchange timeout used when the configuration does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// User agent sent when the asset does not supply one.
pub const DEFAULT_USER_AGENT: &str = concat!("rslicense/", env!("CARGO_PKG_VERSION"));

/// Request headers, name to value.
pub type Headers = HashMap<String, String>;
/// Response headers, name to every value received under that name.
pub type ResponseHeaders = HashMap<String, Vec<String>>;

/// A fully assembled license or provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    pub url: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    /// Advertise gzip support to the server.
    pub allow_gzip: bool,
}

impl OutgoingRequest {
    /// Build a gzip-accepting POST.
    pub fn post(url: impl Into<String>, headers: Headers, body: Option<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            headers,
            body,
            allow_gzip: true,
        }
    }
}

/// Raw answer to a single exchange.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: ResponseHeaders,
    /// Fully drained response body.
    pub body: Vec<u8>,
}

/// Failure of a single exchange, as reported by an [`HttpExecutor`].
#[derive(Debug)]
pub struct ExchangeError {
    /// Headers received before the failure, if any.
    pub headers: ResponseHeaders,
    /// Body bytes read before the failure.
    pub bytes_read: u64,
    pub cause: TransportCause,
}

impl ExchangeError {
    pub fn new(cause: TransportCause) -> Self {
        Self {
            headers: ResponseHeaders::new(),
            bytes_read: 0,
            cause,
        }
    }
}

/// Performs exactly one HTTP exchange.
///
/// Implementations must not follow redirects: a 3xx answer is returned as an
/// ordinary [`HttpResponse`].
pub trait HttpExecutor: Send + Sync {
    fn execute(&self, request: &OutgoingRequest) -> std::result::Result<HttpResponse, ExchangeError>;
}

/// Underlying reason a transport call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportCause {
    /// Terminal non-success status.
    #[error("Unexpected HTTP status {status}")]
    Status { status: u16 },

    /// 307/308 without a usable `Location` header.
    #[error("HTTP {status} redirect without Location header")]
    MissingLocation { status: u16 },

    /// `Location` header that cannot be turned into a URL.
    #[error("Invalid redirect location {location:?}")]
    InvalidLocation { location: String },

    /// The redirect bound was reached.
    #[error("Too many redirects (max {limit})")]
    TooManyRedirects { limit: usize },

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    /// The request could not be built (bad URL, bad header).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Connection or protocol failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Failure while reading the response body.
    #[error("Failed to read response body: {0}")]
    Read(String),
}

/// Diagnostic bundle for a failed [`LicenseTransport::post`].
#[derive(Debug, Error)]
#[error("License request to {last_uri} failed after {bytes_read} bytes: {cause}")]
pub struct TransportError {
    /// The request as first issued, before any redirect.
    pub original_request: OutgoingRequest,
    /// The last URI the transport attempted.
    pub last_uri: String,
    /// Headers of the last response observed.
    pub response_headers: ResponseHeaders,
    /// Bytes read before the failure.
    pub bytes_read: u64,
    #[source]
    pub cause: TransportCause,
}

/// Shared cancellation flag for transport calls.
///
/// Checked before every exchange, including each redirect hop. An exchange
/// already in flight runs until it completes or times out.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// POST client with bounded, body-preserving manual redirects.
#[derive(Clone)]
pub struct LicenseTransport {
    executor: Arc<dyn HttpExecutor>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for LicenseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseTransport")
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LicenseTransport {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            executor,
            cancellation: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel calls made through this transport.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// POST `body` to `url` and return the response body.
    pub fn post(
        &self,
        url: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        self.send(OutgoingRequest::post(url, headers, body))
    }

    /// Execute `request`, following up to [`MAX_MANUAL_REDIRECTS`] 307/308
    /// redirects.
    ///
    /// Any other non-2xx status, a redirect without `Location`, or one
    /// redirect too many ends the call with a [`TransportError`] that keeps
    /// `request` as its original request.
    pub fn send(&self, request: OutgoingRequest) -> std::result::Result<Vec<u8>, TransportError> {
        let mut current = request.clone();
        let mut redirects = 0usize;

        loop {
            if self.cancellation.is_cancelled() {
                return Err(fail(
                    request,
                    current.url,
                    ResponseHeaders::new(),
                    0,
                    TransportCause::Cancelled,
                ));
            }

            debug!("{} {} (redirects: {})", current.method, current.url, redirects);
            let response = match self.executor.execute(&current) {
                Ok(response) => response,
                Err(e) => {
                    return Err(fail(request, current.url, e.headers, e.bytes_read, e.cause));
                }
            };

            if (200..300).contains(&response.status) {
                trace!("{} bytes from {}", response.body.len(), current.url);
                return Ok(response.body);
            }

            let cause = match response.status {
                307 | 308 if redirects < MAX_MANUAL_REDIRECTS => {
                    let location =
                        first_header(&response.headers, "Location").map(str::to_string);
                    match location {
                        Some(location) => match resolve_location(&current.url, &location) {
                            Some(next) => {
                                redirects += 1;
                                debug!("Following HTTP {} redirect to {}", response.status, next);
                                current.url = next;
                                continue;
                            }
                            None => TransportCause::InvalidLocation { location },
                        },
                        None => TransportCause::MissingLocation {
                            status: response.status,
                        },
                    }
                }
                307 | 308 => TransportCause::TooManyRedirects {
                    limit: MAX_MANUAL_REDIRECTS,
                },
                status => {
                    debug!(
                        "Error response body: {}",
                        String::from_utf8_lossy(&response.body)
                    );
                    TransportCause::Status { status }
                }
            };
            return Err(fail(request, current.url, response.headers, 0, cause));
        }
    }
}

fn fail(
    original_request: OutgoingRequest,
    last_uri: String,
    response_headers: ResponseHeaders,
    bytes_read: u64,
    cause: TransportCause,
) -> TransportError {
    warn!("License request to {} failed: {}", last_uri, cause);
    TransportError {
        original_request,
        last_uri,
        response_headers,
        bytes_read,
        cause,
    }
}

/// First value of a header, matching the name case-insensitively.
#[must_use]
pub fn first_header<'a>(headers: &'a ResponseHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

/// Settings of the HTTP data source an asset plays through.
///
/// License exchanges for the asset go through the same settings, so the
/// asset's headers and user agent reach the license server too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDataSourceConfig {
    pub user_agent: Option<String>,
    pub default_headers: Headers,
    /// Whether the engine's media data source may follow http <-> https
    /// redirects. Engine-facing only: [`ReqwestExecutor`] never follows
    /// redirects itself, and [`LicenseTransport`] only follows 307/308.
    pub allow_cross_protocol_redirects: bool,
    pub timeout: Option<Duration>,
}

impl Default for HttpDataSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            default_headers: Headers::new(),
            allow_cross_protocol_redirects: false,
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

/// Builds executors for a data source configuration.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &HttpDataSourceConfig) -> Result<Arc<dyn HttpExecutor>>;
}

/// [`Connector`] producing [`ReqwestExecutor`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestConnector;

impl Connector for ReqwestConnector {
    fn connect(&self, config: &HttpDataSourceConfig) -> Result<Arc<dyn HttpExecutor>> {
        Ok(Arc::new(ReqwestExecutor::new(config)?))
    }
}

/// [`HttpExecutor`] backed by a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    /// Build a client with redirects disabled, gzip enabled, and the data
    /// source's default headers, user agent and timeout.
    pub fn new(config: &HttpDataSourceConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::InvalidConfiguration(format!("Invalid header name {:?}: {}", name, e))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::InvalidConfiguration(format!("Invalid value for header {:?}: {}", name, e))
            })?;
            headers.insert(header_name, header_value);
        }

        let user_agent = config
            .user_agent
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .unwrap_or(DEFAULT_USER_AGENT);

        let client = Client::builder()
            .redirect(Policy::none())
            .gzip(true)
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute(&self, request: &OutgoingRequest) -> std::result::Result<HttpResponse, ExchangeError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.allow_gzip {
            builder = builder.header(ACCEPT_ENCODING, "identity");
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let mut response = builder
            .send()
            .map_err(|e| ExchangeError::new(cause_from_reqwest(&e)))?;

        let status = response.status().as_u16();
        let mut headers = ResponseHeaders::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let mut body = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let cause = if is_read_timeout(&e) {
                        TransportCause::Timeout
                    } else {
                        TransportCause::Read(e.to_string())
                    };
                    return Err(ExchangeError {
                        headers,
                        bytes_read: body.len() as u64,
                        cause,
                    });
                }
            }
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// The blocking body reader reports its deadline as an `io::Error` wrapping a
// `reqwest::Error`, not as `ErrorKind::TimedOut`.
fn is_read_timeout(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        error.get_ref().map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(err) = source {
        if let Some(reqwest_error) = err.downcast_ref::<reqwest::Error>() {
            if reqwest_error.is_timeout() {
                return true;
            }
        } else if let Some(io_error) = err.downcast_ref::<io::Error>() {
            if io_error.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn cause_from_reqwest(error: &reqwest::Error) -> TransportCause {
    if error.is_timeout() {
        TransportCause::Timeout
    } else if error.is_builder() {
        TransportCause::InvalidRequest(error.to_string())
    } else {
        TransportCause::Network(error.to_string())
    }
}
