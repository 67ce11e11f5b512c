use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chameleon::certificate::{self, CertAuthority, CertStore};
use chameleon::channel::ChannelManager;
use chameleon::config::{AppConfig, LogConfig};
use chameleon::convert::{self, Registry};
use chameleon::hosts::HostsFile;
use chameleon::server::{AppState, ProxyServer};
use chameleon::statistics::StatsManager;

const UPSTREAM_TIMEOUT_SECS: u64 = 180;

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHAMELEON_DATA_DIR") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("com", "chameleon", "Chameleon")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn init_logging(config: &LogConfig, data_dir: &std::path::Path) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level.to_filter());

    if !config.console && config.file {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join("chameleon.log"))
        {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    let _ = builder.try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let config = AppConfig::load_or_default(&data_dir.join("config.toml"))?;
    init_logging(&config.log, &data_dir);

    let authority = Arc::new(CertAuthority::ensure(&data_dir)?);
    let pem_path = authority.export_pem(&data_dir)?;
    log::info!("root certificate exported to {}", pem_path.display());

    let channels = Arc::new(ChannelManager::new(&data_dir));
    channels.load_from_file()?;

    let stats = Arc::new(StatsManager::new(&data_dir));
    stats.load();

    let converters = Arc::new(Registry::new());
    convert::register_all(&converters, stats.clone())?;

    let cert_store = Arc::new(CertStore::new());
    let tls_config = certificate::server_config(authority.clone(), cert_store.clone())?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .build()?;

    let state = Arc::new(AppState {
        channels,
        converters,
        stats,
        authority,
        cert_store,
        tls_config,
        http_client,
    });

    let proxy = ProxyServer::new(state, HostsFile::system());
    proxy.start(config.proxy.mode, config.proxy.port).await?;

    let status = proxy.status().await;
    log::info!(
        "chameleon running mode={:?} port={}",
        status.mode,
        status.port
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    proxy.stop().await?;
    Ok(())
}
