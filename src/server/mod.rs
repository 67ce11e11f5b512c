//! Proxy lifecycle: start/stop with graceful drain, status reporting, and
//! hosts-file bracketing for Host mode.

pub mod host;
pub mod mitm;
pub mod pipeline;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::config::ProxyMode;
use crate::error::AppError;
use crate::hosts::HostsFile;
pub use pipeline::AppState;

struct Running {
    mode: ProxyMode,
    port: u16,
    start_time: SystemTime,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub start_time: Option<String>,
    pub uptime_secs: u64,
    pub port: u16,
    pub mode: Option<ProxyMode>,
    pub total_requests: u64,
}

pub struct ProxyServer {
    state: Arc<AppState>,
    hosts_file: HostsFile,
    inner: RwLock<Option<Running>>,
}

impl ProxyServer {
    pub fn new(state: Arc<AppState>, hosts_file: HostsFile) -> Self {
        Self {
            state,
            hosts_file,
            inner: RwLock::new(None),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Start the configured mode. Errors if already running. In Host mode
    /// the hosts file is rewritten first; a failure there aborts startup.
    pub async fn start(&self, mode: ProxyMode, port: u16) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Err(AppError::AlreadyRunning);
        }

        let listen_port = match mode {
            ProxyMode::Http => port,
            ProxyMode::Host => 443,
        };

        if mode == ProxyMode::Host {
            let endpoints = self.state.channels.enabled_endpoints();
            self.hosts_file.add_hosts(&endpoints)?;
        }

        let listener = match TcpListener::bind(("127.0.0.1", listen_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                if mode == ProxyMode::Host {
                    let _ = self.hosts_file.remove_hosts();
                }
                return Err(AppError::Io(e));
            }
        };

        let (shutdown, receiver) = broadcast::channel(1);
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            match mode {
                ProxyMode::Http => mitm::serve(listener, state, receiver).await,
                ProxyMode::Host => host::serve(listener, state, receiver).await,
            }
        });

        log::info!("proxy server started mode={:?} port={}", mode, listen_port);
        *guard = Some(Running {
            mode,
            port: listen_port,
            start_time: SystemTime::now(),
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Graceful stop with a 10 second deadline, then hosts-file revert for
    /// Host mode. Errors if not running.
    pub async fn stop(&self) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        let running = guard.take().ok_or(AppError::NotRunning)?;

        let _ = running.shutdown.send(());
        if tokio::time::timeout(Duration::from_secs(10), running.handle)
            .await
            .is_err()
        {
            log::warn!("proxy server did not stop within the deadline");
        }

        if running.mode == ProxyMode::Host {
            self.hosts_file.remove_hosts()?;
        }

        log::info!("proxy server stopped");
        Ok(())
    }

    pub async fn status(&self) -> ServerStatus {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(running) => ServerStatus {
                running: true,
                start_time: Some(DateTime::<Utc>::from(running.start_time).to_rfc3339()),
                uptime_secs: running
                    .start_time
                    .elapsed()
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                port: running.port,
                mode: Some(running.mode),
                total_requests: self.state.stats.total_requests(),
            },
            None => ServerStatus {
                running: false,
                start_time: None,
                uptime_secs: 0,
                port: 0,
                mode: None,
                total_requests: self.state.stats.total_requests(),
            },
        }
    }
}
