#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, LevelFilter};

use rslicense::asset::{
    AssetDescriptor, AssetSource, DrmSessionProvider, MediaSourceKind, PlatformContext,
    StreamingFormat, VideoAsset, WIDEVINE_UUID,
};
use rslicense::callback::{DrmCallback, KeyRequest, MediaDrmCallback, ProvisionRequest};
use rslicense::config::ClientConfig;
use rslicense::custom_data::{CustomDataBuilder, RequestInfo, StaticRequestInfo};
use rslicense::transport::{HttpDataSourceConfig, LicenseTransport, ReqwestExecutor};

#[cfg(feature = "chrono")]
use chrono::Datelike;

#[derive(Parser)]
#[command(name = "rslicense", version, disable_version_flag = true, about = "rslicense CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Send a key request and print or save the license.
    ///
    /// The payload is the base64-encoded key request challenge.
    License {
        payload: String,
        #[arg(short = 'u', long = "url")]
        url: Option<String>,
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Extra key request header, `name:value`. Repeatable.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(long = "req-id", default_value = "")]
        req_id: String,
        #[arg(long = "device-info", default_value = "")]
        device_info: String,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
    },
    /// Send a provisioning request.
    Provision {
        endpoint: String,
        /// Base64-encoded provisioning request data.
        payload: String,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
    },
    /// Show how a source would be played.
    Resolve {
        uri: String,
        #[arg(short = 'f', long = "format", default_value = "other")]
        format: String,
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(level).init();

    let current_year = current_year();
    let copyright_years = format!("2025-{}", current_year);
    let version = env!("CARGO_PKG_VERSION");

    info!("rslicense version {} Copyright (c) {}", version, copyright_years);

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::License {
            payload,
            url,
            config,
            headers,
            req_id,
            device_info,
            out,
        }) => run_license(
            &payload,
            url,
            config.as_deref(),
            &headers,
            RequestInfo {
                request_id: req_id,
                device_info,
            },
            out.as_deref(),
        ),
        Some(Commands::Provision {
            endpoint,
            payload,
            out,
        }) => run_provision(&endpoint, &payload, out.as_deref()),
        Some(Commands::Resolve {
            uri,
            format,
            config,
        }) => run_resolve(&uri, &format, config.as_deref()),
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2025) as i64
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

fn decode_payload(payload: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("Payload is not valid base64")
}

fn write_output(bytes: &[u8], out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("[+] Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => println!("{}", base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
    Ok(())
}

fn data_source_config(config: &ClientConfig) -> HttpDataSourceConfig {
    HttpDataSourceConfig {
        user_agent: config.user_agent.clone(),
        timeout: config.request_timeout(),
        ..Default::default()
    }
}

fn run_license(
    payload: &str,
    url: Option<String>,
    config_path: Option<&Path>,
    headers: &[String],
    request_info: RequestInfo,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let data = decode_payload(payload)?;

    let executor = ReqwestExecutor::new(&data_source_config(&config))
        .context("Failed to build HTTP client")?;
    let callback = DrmCallback::new(
        Some(config.default_license_url.clone()),
        false,
        LicenseTransport::new(Arc::new(executor)),
        CustomDataBuilder::new(
            Arc::new(config.identity.clone()),
            Arc::new(StaticRequestInfo(request_info)),
        ),
    )?;

    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header {:?} is not name:value", header))?;
        callback.set_key_request_property(name.trim(), value.trim());
    }

    let request = KeyRequest {
        data,
        license_server_url: url.unwrap_or_default(),
    };
    info!(
        "[+] Sending key request to {}",
        callback.resolve_license_url(&request)?
    );

    let license = match callback.execute_key_request(WIDEVINE_UUID, &request) {
        Ok(license) => license,
        Err(e) => {
            if let Some(transport) = e.transport() {
                error!(
                    "[-] Key request failed at {} after {} bytes: {}",
                    transport.last_uri, transport.bytes_read, transport.cause
                );
            }
            return Err(e).context("Failed to acquire license");
        }
    };
    info!("[+] Received license ({} bytes)", license.len());

    write_output(&license, out)
}

fn run_provision(endpoint: &str, payload: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let config = ClientConfig::default();
    let executor = ReqwestExecutor::new(&data_source_config(&config))
        .context("Failed to build HTTP client")?;
    let callback = DrmCallback::new(
        None,
        false,
        LicenseTransport::new(Arc::new(executor)),
        CustomDataBuilder::new(
            Arc::new(config.identity.clone()),
            Arc::new(StaticRequestInfo::default()),
        ),
    )?;

    let request = ProvisionRequest {
        default_url: endpoint.to_string(),
        data: decode_payload(payload)?,
    };
    let response = callback
        .execute_provision_request(WIDEVINE_UUID, &request)
        .context("Provisioning request failed")?;
    info!("[+] Received provisioning response ({} bytes)", response.len());

    write_output(&response, out)
}

fn run_resolve(uri: &str, format: &str, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let format: StreamingFormat = format.parse()?;
    let asset = VideoAsset::from_descriptor(AssetDescriptor {
        uri: Some(uri.to_string()),
        format,
        ..Default::default()
    })?;

    let platform = PlatformContext::from_config(&config, Arc::new(StaticRequestInfo::default()));
    let descriptor = asset.playback_descriptor();
    let source = asset.source_configuration(&platform);

    println!("uri:          {}", descriptor.uri.as_deref().unwrap_or("-"));
    println!("mime type:    {}", descriptor.mime_type.unwrap_or("-"));
    let media_source = match source.media_source {
        MediaSourceKind::Default(_) => "http",
        MediaSourceKind::Rtsp => "rtsp",
        MediaSourceKind::Custom(_) => "custom",
    };
    println!("media source: {}", media_source);
    match &source.drm {
        DrmSessionProvider::Absent => println!("drm:          none"),
        DrmSessionProvider::Unsupported(scheme) => println!("drm:          unsupported ({})", scheme),
        DrmSessionProvider::Factory(factory) => println!(
            "drm:          {} via {}",
            factory.scheme(),
            factory.drm_configuration(None).license_url
        ),
    }
    Ok(())
}
