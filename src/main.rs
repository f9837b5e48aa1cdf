use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};

use wagate_core::security::AdminToken;
use wagate_engine::{EngineConfig, InstanceDefaults, InstanceManager, SandboxConnector};
use wagate_server::ServerConfig;
use wagate_settings::WagateSettings;
use wagate_store::{Database, InstanceRepo};
use wagate_telemetry::TelemetryConfig;
use wagate_transcription::{AudioConverter, WhisperClient, WhisperConfig};

#[derive(Debug, Parser)]
#[command(name = "wagate", version, about = "Multi-tenant messaging gateway")]
struct Cli {
    /// Settings file (defaults to ~/.wagate/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Overrides server.port.
    #[arg(long)]
    port: Option<u16>,

    /// Sandbox only: complete pairing for unlinked instances with this phone.
    #[arg(long, value_name = "PHONE")]
    sandbox_pair: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => wagate_settings::load_settings_from_path(path),
        None => wagate_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    settings.validate().context("invalid settings")?;

    let telemetry = wagate_telemetry::init_telemetry(telemetry_config(&settings));
    info!(version = env!("CARGO_PKG_VERSION"), "starting wagate");

    let db_path = Path::new(&settings.storage.db_path);
    let db = Database::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    let connector = match &cli.sandbox_pair {
        Some(phone) => SandboxConnector::with_auto_pair(phone.clone(), Duration::from_secs(2)),
        None => SandboxConnector::new(),
    };
    let transcriber = WhisperClient::new(whisper_config(&settings));

    let manager = Arc::new(InstanceManager::new(
        Arc::new(connector),
        InstanceRepo::new(db),
        Some(Arc::new(transcriber)),
        engine_config(&settings),
    ));
    let loaded = manager.load_from_store().context("failed to load instances")?;
    info!(count = loaded, "instances loaded");

    let handle = wagate_server::start(server_config(&settings), manager.clone(), telemetry.logs())
        .await
        .context("failed to start server")?;
    info!(port = handle.port(), "wagate ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    info!("shutting down");

    manager.shutdown().await;
    handle.stop().await;
    Ok(())
}

fn telemetry_config(settings: &WagateSettings) -> TelemetryConfig {
    let log_level = Level::from_str(&settings.logging.level).unwrap_or_else(|_| {
        eprintln!("wagate: unknown log level {:?}, using info", settings.logging.level);
        Level::INFO
    });
    TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist,
        log_db_path: PathBuf::from(&settings.storage.log_db_path),
        ..TelemetryConfig::default()
    }
}

fn engine_config(settings: &WagateSettings) -> EngineConfig {
    let lifecycle = &settings.lifecycle;
    let defaults = &settings.instance_defaults;
    EngineConfig {
        keepalive_interval: Duration::from_secs(lifecycle.keepalive_interval_secs),
        settle_delay: Duration::from_secs(lifecycle.settle_delay_secs),
        presence_pause: Duration::from_millis(lifecycle.presence_pause_ms),
        subscriber_capacity: lifecycle.subscriber_capacity,
        webhook_timeout: Duration::from_secs(settings.webhook.timeout_secs),
        defaults: InstanceDefaults {
            transcription_enabled: defaults.transcription_enabled,
            typing_delay_min: defaults.typing_delay_min,
            typing_delay_max: defaults.typing_delay_max,
        },
    }
}

fn whisper_config(settings: &WagateSettings) -> WhisperConfig {
    let t = &settings.transcription;
    let converter = if t.ffmpeg_path.is_empty() {
        warn!("transcription.ffmpegPath is empty; audio is uploaded unconverted");
        AudioConverter::Passthrough
    } else {
        AudioConverter::Ffmpeg {
            program: t.ffmpeg_path.clone(),
        }
    };
    WhisperConfig {
        base_url: t.base_url.clone(),
        language: t.language.clone(),
        timeout: Duration::from_secs(t.timeout_secs),
        converter,
    }
}

fn server_config(settings: &WagateSettings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        admin_token: settings.server.admin_token.clone().map(AdminToken::new),
        request_timeout: Duration::from_secs(settings.server.request_timeout_secs),
        ..ServerConfig::default()
    }
}
