//! `custom-data` header construction.
//!
//! The license server authorizes key requests with a base64-encoded JSON
//! object carrying the application's identity together with the request id
//! and device info embedded in the DRM challenge.
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Boxed error returned by a [`DrmPacker`].
pub type PackerError = Box<dyn std::error::Error + Send + Sync>;

/// Identifiers of the current application session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Identity {
    pub merchant_id: String,
    pub app_id: String,
    pub user_id: String,
    pub session_id: String,
}

/// Source of the identity fields sent with every key request.
///
/// Implementations may change their answer over time (e.g. after a new
/// login); the value is read once per key request.
pub trait SessionIdentity: Send + Sync {
    fn identity(&self) -> Identity;
}

impl SessionIdentity for Identity {
    fn identity(&self) -> Identity {
        self.clone()
    }
}

/// Fields the packer extracts from a key-request challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub request_id: String,
    pub device_info: String,
}

/// Parser for opaque DRM key-request payloads.
pub trait DrmPacker: Send + Sync {
    fn request_info(&self, payload: &[u8]) -> std::result::Result<RequestInfo, PackerError>;
}

/// Packer that reports the same [`RequestInfo`] for every non-empty payload.
#[derive(Debug, Clone, Default)]
pub struct StaticRequestInfo(pub RequestInfo);

impl DrmPacker for StaticRequestInfo {
    fn request_info(&self, payload: &[u8]) -> std::result::Result<RequestInfo, PackerError> {
        if payload.is_empty() {
            return Err("empty key request payload".into());
        }
        Ok(self.0.clone())
    }
}

/// JSON document carried (base64-encoded) in the `custom-data` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub merchant_id: String,
    pub app_id: String,
    pub user_id: String,
    pub session_id: String,
    pub req_id: String,
    pub device_info: String,
}

/// Builds `custom-data` header values.
#[derive(Clone)]
pub struct CustomDataBuilder {
    identity: Arc<dyn SessionIdentity>,
    packer: Arc<dyn DrmPacker>,
}

impl std::fmt::Debug for CustomDataBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomDataBuilder").finish_non_exhaustive()
    }
}

impl CustomDataBuilder {
    pub fn new(identity: Arc<dyn SessionIdentity>, packer: Arc<dyn DrmPacker>) -> Self {
        Self { identity, packer }
    }

    /// Assemble the custom data document for a key-request payload.
    ///
    /// Fails with [`Error::MalformedDrmPayload`] when the packer rejects the
    /// payload.
    pub fn custom_data(&self, payload: &[u8]) -> Result<CustomData> {
        let info = self
            .packer
            .request_info(payload)
            .map_err(|e| Error::MalformedDrmPayload(e.to_string()))?;
        let identity = self.identity.identity();

        Ok(CustomData {
            merchant_id: identity.merchant_id,
            app_id: identity.app_id,
            user_id: identity.user_id,
            session_id: identity.session_id,
            req_id: info.request_id,
            device_info: info.device_info,
        })
    }

    /// Header value: standard base64 (padded, single line) of the JSON
    /// document.
    pub fn build(&self, payload: &[u8]) -> Result<String> {
        let data = self.custom_data(payload)?;
        let json = serde_json::to_vec(&data)
            .map_err(|e| Error::MalformedDrmPayload(format!("Failed to encode custom data: {}", e)))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        debug!("Custom Data: {}", encoded);
        Ok(encoded)
    }
}
