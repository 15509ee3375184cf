//! License and provisioning requests on behalf of the DRM subsystem.
use base64::Engine;
use uuid::Uuid;

use crate::custom_data::CustomDataBuilder;
use crate::error::{Error, Result};
use crate::properties::RequestPropertyStore;
use crate::transport::{Headers, LicenseTransport, OutgoingRequest};
use crate::utils::append_raw_query;

/// Content type of every key request body.
pub const KEY_REQUEST_CONTENT_TYPE: &str = "application/octet-stream";
/// Header carrying the base64 custom data document.
pub const CUSTOM_DATA_HEADER: &str = "custom-data";

/// Provisioning challenge produced by the DRM subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Provisioning endpoint suggested by the DRM subsystem.
    pub default_url: String,
    /// Signed request; sent as text in the `signedRequest` query parameter.
    pub data: Vec<u8>,
}

/// Key (license) challenge produced by the DRM subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub data: Vec<u8>,
    /// License URL embedded in the content, empty when there is none.
    pub license_server_url: String,
}

/// Interface the DRM subsystem calls to reach the license server.
pub trait MediaDrmCallback: Send + Sync {
    /// Execute a provisioning request and return the raw response.
    fn execute_provision_request(&self, scheme: Uuid, request: &ProvisionRequest)
        -> Result<Vec<u8>>;

    /// Execute a key request and return the license bytes.
    fn execute_key_request(&self, scheme: Uuid, request: &KeyRequest) -> Result<Vec<u8>>;
}

/// [`MediaDrmCallback`] speaking the JSON-wrapped license protocol.
///
/// Key requests carry `Content-Type: application/octet-stream`, a
/// `custom-data` header and any registered key request properties; the
/// response is a JSON object whose `license` field holds the base64 license.
/// Provisioning requests are forwarded as-is.
#[derive(Debug)]
pub struct DrmCallback {
    transport: LicenseTransport,
    default_license_url: Option<String>,
    force_default_license_url: bool,
    key_request_properties: RequestPropertyStore,
    custom_data: CustomDataBuilder,
}

impl DrmCallback {
    /// Create a callback.
    ///
    /// `default_license_url` is used for key requests that carry no URL of
    /// their own, or for every key request when `force_default_license_url`
    /// is set. Forcing without a non-empty default is rejected with
    /// [`Error::InvalidConfiguration`].
    pub fn new(
        default_license_url: Option<String>,
        force_default_license_url: bool,
        transport: LicenseTransport,
        custom_data: CustomDataBuilder,
    ) -> Result<Self> {
        let default_license_url = default_license_url.filter(|url| !url.is_empty());
        if force_default_license_url && default_license_url.is_none() {
            return Err(Error::InvalidConfiguration(
                "forcing the default license URL requires a non-empty default".to_string(),
            ));
        }

        Ok(Self {
            transport,
            default_license_url,
            force_default_license_url,
            key_request_properties: RequestPropertyStore::new(),
            custom_data,
        })
    }

    /// Set a header for key requests made by the callback.
    pub fn set_key_request_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.key_request_properties.set(name, value);
    }

    /// Clear a header for key requests made by the callback.
    pub fn clear_key_request_property(&self, name: &str) {
        self.key_request_properties.remove(name);
    }

    /// Clear all headers for key requests made by the callback.
    pub fn clear_all_key_request_properties(&self) {
        self.key_request_properties.clear_all();
    }

    /// Shared handle to the key request headers.
    pub fn key_request_properties(&self) -> &RequestPropertyStore {
        &self.key_request_properties
    }

    pub fn default_license_url(&self) -> Option<&str> {
        self.default_license_url.as_deref()
    }

    /// Pick the URL a key request goes to.
    pub fn resolve_license_url(&self, request: &KeyRequest) -> Result<String> {
        let url = if self.force_default_license_url || request.license_server_url.is_empty() {
            self.default_license_url.as_deref()
        } else {
            Some(request.license_server_url.as_str())
        };
        url.map(str::to_string).ok_or(Error::NoLicenseUrl)
    }

    /// Assemble the request a key exchange sends, without sending it.
    ///
    /// Registered key request properties are applied last and replace the
    /// built-in `Content-Type` and `custom-data` headers when their names
    /// match (ignoring case).
    pub fn build_key_request(&self, request: &KeyRequest) -> Result<OutgoingRequest> {
        let url = self.resolve_license_url(request)?;

        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), KEY_REQUEST_CONTENT_TYPE.to_string());
        headers.insert(
            CUSTOM_DATA_HEADER.to_string(),
            self.custom_data.build(&request.data)?,
        );
        for (name, value) in self.key_request_properties.snapshot() {
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            headers.insert(name, value);
        }

        Ok(OutgoingRequest::post(url, headers, Some(request.data.clone())))
    }
}

impl MediaDrmCallback for DrmCallback {
    fn execute_provision_request(
        &self,
        scheme: Uuid,
        request: &ProvisionRequest,
    ) -> Result<Vec<u8>> {
        let signed_request = String::from_utf8_lossy(&request.data);
        let url = append_raw_query(&request.default_url, "signedRequest", &signed_request);
        debug!("[{}] Provisioning request to {}", scheme, request.default_url);

        let response = self.transport.post(&url, Headers::new(), None)?;
        info!("[{}] Provisioning response: {} bytes", scheme, response.len());
        Ok(response)
    }

    fn execute_key_request(&self, scheme: Uuid, request: &KeyRequest) -> Result<Vec<u8>> {
        let outgoing = self.build_key_request(request)?;
        debug!(
            "[{}] License request body: {}",
            scheme,
            base64::engine::general_purpose::STANDARD.encode(&request.data)
        );
        info!("[{}] License request to {}", scheme, outgoing.url);

        let response = self.transport.send(outgoing)?;
        debug!(
            "[{}] License response: {}",
            scheme,
            String::from_utf8_lossy(&response)
        );

        let license = parse_license_response(&response)?;
        info!("[{}] License received: {} bytes", scheme, license.len());
        Ok(license)
    }
}

/// Extract the license bytes from a JSON license response.
///
/// The body must be a JSON object with a string `license` field holding
/// standard, padded base64.
pub fn parse_license_response(body: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::LicenseResponseMalformed(format!("Invalid license JSON: {}", e)))?;
    let license = value
        .as_object()
        .and_then(|object| object.get("license"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            Error::LicenseResponseMalformed("Missing string field `license`".to_string())
        })?;
    base64::engine::general_purpose::STANDARD
        .decode(license.trim())
        .map_err(|e| Error::LicenseResponseMalformed(format!("Invalid license base64: {}", e)))
}
