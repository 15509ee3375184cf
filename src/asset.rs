//! Playback source resolution.
//!
//! A [`VideoAsset`] turns a source description into what the playback engine
//! needs: a [`PlaybackDescriptor`] (URI and MIME hint) and a
//! [`SourceConfiguration`] (how to fetch media, and whether a decryption
//! session backed by [`DrmCallback`] is attached). Nothing here touches the
//! network; license exchanges only happen once the engine asks a
//! [`DrmSessionFactory`] for a session and the DRM subsystem starts using it.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callback::DrmCallback;
use crate::config::{ClientConfig, DEFAULT_LICENSE_SERVER_URL};
use crate::custom_data::{CustomDataBuilder, DrmPacker, SessionIdentity};
use crate::error::{Error, Result};
use crate::transport::{
    Connector, Headers, HttpDataSourceConfig, LicenseTransport, ReqwestConnector,
    DEFAULT_REQUEST_TIMEOUT,
};

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// DRM option naming the asset's license server.
pub const LICENSE_SERVER_URL_KEY: &str = "licenseServerUrl";

/// MIME type of Smooth Streaming manifests.
pub const APPLICATION_SS: &str = "application/vnd.ms-sstr+xml";
/// MIME type of DASH manifests.
pub const APPLICATION_MPD: &str = "application/dash+xml";
/// MIME type of HLS playlists.
pub const APPLICATION_M3U8: &str = "application/x-mpegURL";

/// Streaming format of a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingFormat {
    Smooth,
    DynamicAdaptive,
    HttpLive,
    Rtsp,
    /// Progressive or unknown; the engine sniffs the container.
    #[default]
    Unknown,
}

impl StreamingFormat {
    /// Container hint handed to the engine.
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            StreamingFormat::Smooth => Some(APPLICATION_SS),
            StreamingFormat::DynamicAdaptive => Some(APPLICATION_MPD),
            StreamingFormat::HttpLive => Some(APPLICATION_M3U8),
            StreamingFormat::Rtsp | StreamingFormat::Unknown => None,
        }
    }
}

impl FromStr for StreamingFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ss" | "smooth" => Ok(StreamingFormat::Smooth),
            "dash" => Ok(StreamingFormat::DynamicAdaptive),
            "hls" => Ok(StreamingFormat::HttpLive),
            "rtsp" => Ok(StreamingFormat::Rtsp),
            "" | "other" => Ok(StreamingFormat::Unknown),
            _ => Err(Error::InvalidConfiguration(format!(
                "Unknown streaming format '{}'",
                s
            ))),
        }
    }
}

/// Description of a playback source as supplied by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetDescriptor {
    pub uri: Option<String>,
    pub format: StreamingFormat,
    pub http_headers: HashMap<String, String>,
    pub drm_configuration: HashMap<String, String>,
    pub user_agent: Option<String>,
}

/// What the engine plays: a URI and an optional MIME hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackDescriptor {
    pub uri: Option<String>,
    pub mime_type: Option<&'static str>,
}

/// DRM settings the engine keeps on the current media item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalDrmConfiguration {
    /// Key set persisted by an earlier offline download.
    pub key_set_id: Option<Vec<u8>>,
}

/// DRM settings resolved for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmConfiguration {
    pub license_url: String,
    pub offline_key_set_id: Option<Vec<u8>>,
}

impl DrmConfiguration {
    /// Resolve the license URL (asset option, else `default_license_url`) and
    /// recover any offline key set id from the media item.
    pub fn resolve(
        options: &HashMap<String, String>,
        default_license_url: &str,
        local: Option<&LocalDrmConfiguration>,
    ) -> Self {
        let license_url = options
            .get(LICENSE_SERVER_URL_KEY)
            .filter(|url| !url.is_empty())
            .cloned()
            .unwrap_or_else(|| default_license_url.to_string());
        let offline_key_set_id = local.and_then(|l| l.key_set_id.clone());

        Self {
            license_url,
            offline_key_set_id,
        }
    }
}

/// How the DRM session handles licenses.
///
/// Read by the engine's DRM subsystem. Sessions built by
/// [`DrmSessionFactory`] are always `Playback`; `Download` names the mode an
/// engine's offline downloader requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Acquire (or restore) a license for immediate playback.
    Playback,
    /// Acquire a persistent license for offline playback.
    Download,
}

/// Decryption session handed to the DRM subsystem.
#[derive(Debug, Clone)]
pub struct DrmSession {
    pub scheme: Uuid,
    pub mode: SessionMode,
    /// Whether one session may serve several key systems/tracks at once.
    pub multi_session: bool,
    pub license_url: String,
    pub offline_key_set_id: Option<Vec<u8>>,
    pub callback: Arc<DrmCallback>,
}

/// Platform query: can this device run DRM scheme `scheme`?
pub trait DrmCapability: Send + Sync {
    fn supports_scheme(&self, scheme: Uuid) -> bool;
}

impl<F> DrmCapability for F
where
    F: Fn(Uuid) -> bool + Send + Sync,
{
    fn supports_scheme(&self, scheme: Uuid) -> bool {
        self(scheme)
    }
}

/// Collaborators and process-wide settings used when resolving assets.
#[derive(Clone)]
pub struct PlatformContext {
    capability: Arc<dyn DrmCapability>,
    identity: Arc<dyn SessionIdentity>,
    packer: Arc<dyn DrmPacker>,
    connector: Arc<dyn Connector>,
    default_license_url: String,
    default_user_agent: Option<String>,
    request_timeout: Option<Duration>,
}

impl fmt::Debug for PlatformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformContext")
            .field("default_license_url", &self.default_license_url)
            .field("default_user_agent", &self.default_user_agent)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl PlatformContext {
    /// Context with every DRM scheme supported, real HTTP, and the built-in
    /// default license server.
    pub fn new(identity: Arc<dyn SessionIdentity>, packer: Arc<dyn DrmPacker>) -> Self {
        Self {
            capability: Arc::new(|_: Uuid| true),
            identity,
            packer,
            connector: Arc::new(ReqwestConnector),
            default_license_url: DEFAULT_LICENSE_SERVER_URL.to_string(),
            default_user_agent: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Context using the identity, license URL, user agent and timeout of
    /// `config`.
    pub fn from_config(config: &ClientConfig, packer: Arc<dyn DrmPacker>) -> Self {
        let mut context = Self::new(Arc::new(config.identity.clone()), packer);
        context.default_license_url = config.default_license_url.clone();
        context.default_user_agent = config.user_agent.clone();
        context.request_timeout = config.request_timeout();
        context
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl DrmCapability + 'static) -> Self {
        self.capability = Arc::new(capability);
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn with_default_license_url(mut self, url: impl Into<String>) -> Self {
        self.default_license_url = url.into();
        self
    }

    pub fn default_license_url(&self) -> &str {
        &self.default_license_url
    }

    pub fn supports_scheme(&self, scheme: Uuid) -> bool {
        self.capability.supports_scheme(scheme)
    }
}

/// Creates DRM sessions for one asset on demand.
///
/// Building the factory is free; each [`create_session`](Self::create_session)
/// builds an HTTP client and a fresh [`DrmCallback`] but sends nothing.
pub struct DrmSessionFactory {
    scheme: Uuid,
    drm_options: HashMap<String, String>,
    data_source: HttpDataSourceConfig,
    default_license_url: String,
    identity: Arc<dyn SessionIdentity>,
    packer: Arc<dyn DrmPacker>,
    connector: Arc<dyn Connector>,
}

impl fmt::Debug for DrmSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmSessionFactory")
            .field("scheme", &self.scheme)
            .field("drm_options", &self.drm_options)
            .field("default_license_url", &self.default_license_url)
            .finish_non_exhaustive()
    }
}

impl DrmSessionFactory {
    pub fn scheme(&self) -> Uuid {
        self.scheme
    }

    pub fn drm_configuration(&self, local: Option<&LocalDrmConfiguration>) -> DrmConfiguration {
        DrmConfiguration::resolve(&self.drm_options, &self.default_license_url, local)
    }

    /// Create a playback session for the media item carrying `local`.
    pub fn create_session(&self, local: Option<&LocalDrmConfiguration>) -> Result<DrmSession> {
        let drm = self.drm_configuration(local);
        let executor = self.connector.connect(&self.data_source)?;
        let callback = DrmCallback::new(
            Some(drm.license_url.clone()),
            false,
            LicenseTransport::new(executor),
            CustomDataBuilder::new(self.identity.clone(), self.packer.clone()),
        )?;

        info!(
            "Created {} DRM session for {} (offline key set: {})",
            self.scheme,
            drm.license_url,
            drm.offline_key_set_id
                .as_deref()
                .map(hex::encode)
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(DrmSession {
            scheme: self.scheme,
            mode: SessionMode::Playback,
            multi_session: true,
            license_url: drm.license_url,
            offline_key_set_id: drm.offline_key_set_id,
            callback: Arc::new(callback),
        })
    }
}

/// Decryption part of a [`SourceConfiguration`].
#[derive(Debug, Clone)]
pub enum DrmSessionProvider {
    /// The source is never encrypted.
    Absent,
    /// The platform cannot run the scheme; protected playback will fail.
    Unsupported(Uuid),
    Factory(Arc<DrmSessionFactory>),
}

impl DrmSessionProvider {
    /// Session for the media item carrying `local`, if the source uses DRM.
    ///
    /// Fails with [`Error::DrmUnsupported`] for the unsupported sentinel.
    pub fn acquire(&self, local: Option<&LocalDrmConfiguration>) -> Result<Option<DrmSession>> {
        match self {
            DrmSessionProvider::Absent => Ok(None),
            DrmSessionProvider::Unsupported(scheme) => Err(Error::DrmUnsupported(*scheme)),
            DrmSessionProvider::Factory(factory) => factory.create_session(local).map(Some),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, DrmSessionProvider::Absent)
    }
}

/// Media source factory supplied by the engine; opaque to this crate.
pub trait MediaSourceFactory: Send + Sync + fmt::Debug {}

/// How the engine builds the media source.
#[derive(Debug, Clone)]
pub enum MediaSourceKind {
    /// Default source over HTTP with these settings.
    Default(HttpDataSourceConfig),
    Rtsp,
    Custom(Arc<dyn MediaSourceFactory>),
}

#[derive(Debug, Clone)]
pub struct SourceConfiguration {
    pub media_source: MediaSourceKind,
    pub drm: DrmSessionProvider,
}

/// Capabilities shared by every asset kind.
pub trait AssetSource {
    /// URI and MIME hint. Pure.
    fn playback_descriptor(&self) -> PlaybackDescriptor;

    /// Media source and DRM wiring. May query the platform, never performs
    /// network I/O.
    fn source_configuration(&self, platform: &PlatformContext) -> SourceConfiguration;
}

/// HTTP(S) asset: progressive, DASH, HLS or Smooth Streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpVideoAsset {
    pub uri: String,
    pub format: StreamingFormat,
    pub http_headers: HashMap<String, String>,
    pub drm_configuration: HashMap<String, String>,
    pub user_agent: Option<String>,
}

impl HttpVideoAsset {
    /// Data source settings; license requests for the asset use them too.
    pub fn data_source_config(&self, platform: &PlatformContext) -> HttpDataSourceConfig {
        let user_agent = self
            .user_agent
            .clone()
            .filter(|ua| !ua.is_empty())
            .or_else(|| platform.default_user_agent.clone());
        let default_headers: Headers = self.http_headers.clone();

        HttpDataSourceConfig {
            user_agent,
            default_headers,
            allow_cross_protocol_redirects: true,
            timeout: platform.request_timeout,
        }
    }
}

impl AssetSource for HttpVideoAsset {
    fn playback_descriptor(&self) -> PlaybackDescriptor {
        PlaybackDescriptor {
            uri: Some(self.uri.clone()),
            mime_type: self.format.mime_type(),
        }
    }

    fn source_configuration(&self, platform: &PlatformContext) -> SourceConfiguration {
        let data_source = self.data_source_config(platform);
        let drm = if platform.supports_scheme(WIDEVINE_UUID) {
            DrmSessionProvider::Factory(Arc::new(DrmSessionFactory {
                scheme: WIDEVINE_UUID,
                drm_options: self.drm_configuration.clone(),
                data_source: data_source.clone(),
                default_license_url: platform.default_license_url.clone(),
                identity: platform.identity.clone(),
                packer: platform.packer.clone(),
                connector: platform.connector.clone(),
            }))
        } else {
            warn!("Widevine is not supported on this platform");
            DrmSessionProvider::Unsupported(WIDEVINE_UUID)
        };

        SourceConfiguration {
            media_source: MediaSourceKind::Default(data_source),
            drm,
        }
    }
}

/// RTSP asset. Never encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspVideoAsset {
    pub uri: String,
}

impl AssetSource for RtspVideoAsset {
    fn playback_descriptor(&self) -> PlaybackDescriptor {
        PlaybackDescriptor {
            uri: Some(self.uri.clone()),
            mime_type: None,
        }
    }

    fn source_configuration(&self, _platform: &PlatformContext) -> SourceConfiguration {
        SourceConfiguration {
            media_source: MediaSourceKind::Rtsp,
            drm: DrmSessionProvider::Absent,
        }
    }
}

/// Asset whose configuration is supplied by the caller, for tests.
#[derive(Debug, Clone)]
pub struct FakeVideoAsset {
    pub uri: Option<String>,
    pub configuration: SourceConfiguration,
}

impl AssetSource for FakeVideoAsset {
    fn playback_descriptor(&self) -> PlaybackDescriptor {
        PlaybackDescriptor {
            uri: self.uri.clone(),
            mime_type: None,
        }
    }

    fn source_configuration(&self, _platform: &PlatformContext) -> SourceConfiguration {
        self.configuration.clone()
    }
}

/// Every supported playback source.
#[derive(Debug, Clone)]
pub enum VideoAsset {
    Http(HttpVideoAsset),
    Rtsp(RtspVideoAsset),
    Fake(FakeVideoAsset),
}

impl VideoAsset {
    /// Pick the asset kind for a descriptor.
    ///
    /// RTSP is chosen for the RTSP format tag or an `rtsp://` URI; everything
    /// else is treated as HTTP. A URI is required.
    pub fn from_descriptor(descriptor: AssetDescriptor) -> Result<Self> {
        let uri = descriptor
            .uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| Error::InvalidConfiguration("Asset URI is required".to_string()))?;

        let is_rtsp = descriptor.format == StreamingFormat::Rtsp
            || uri
                .get(..7)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsp://"));
        if is_rtsp {
            return Ok(VideoAsset::Rtsp(RtspVideoAsset { uri }));
        }

        Ok(VideoAsset::Http(HttpVideoAsset {
            uri,
            format: descriptor.format,
            http_headers: descriptor.http_headers,
            drm_configuration: descriptor.drm_configuration,
            user_agent: descriptor.user_agent,
        }))
    }

    pub fn fake(uri: Option<String>, configuration: SourceConfiguration) -> Self {
        VideoAsset::Fake(FakeVideoAsset { uri, configuration })
    }
}

impl AssetSource for VideoAsset {
    fn playback_descriptor(&self) -> PlaybackDescriptor {
        match self {
            VideoAsset::Http(asset) => asset.playback_descriptor(),
            VideoAsset::Rtsp(asset) => asset.playback_descriptor(),
            VideoAsset::Fake(asset) => asset.playback_descriptor(),
        }
    }

    fn source_configuration(&self, platform: &PlatformContext) -> SourceConfiguration {
        match self {
            VideoAsset::Http(asset) => asset.source_configuration(platform),
            VideoAsset::Rtsp(asset) => asset.source_configuration(platform),
            VideoAsset::Fake(asset) => asset.source_configuration(platform),
        }
    }
}
