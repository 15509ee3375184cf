//! Error types for rslicense.

use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

/// Main error type for rslicense operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A component was constructed or configured in a way that can never work.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The HTTP exchange with the license server failed.
    ///
    /// Carries the full diagnostic bundle (original request, last URI,
    /// response headers, bytes read).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No license URL could be resolved for a key request.
    #[error("No license URL available for key request")]
    NoLicenseUrl,

    /// The DRM packer could not parse the opaque request payload.
    #[error("Malformed DRM payload: {0}")]
    MalformedDrmPayload(String),

    /// The license server answered, but the body is unusable.
    #[error("Malformed license response: {0}")]
    LicenseResponseMalformed(String),

    /// The platform cannot run the requested DRM scheme.
    #[error("DRM scheme {0} is not supported on this platform")]
    DrmUnsupported(Uuid),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Transport diagnostics, if this is a transport failure.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for rslicense operations.
pub type Result<T> = std::result::Result<T, Error>;
