//! Host mode: an HTTPS-terminating server on 127.0.0.1:443 reached through
//! hosts-file redirection. The pipeline is identical to proxy mode.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::server::pipeline::{self, AppState};

const SHUTDOWN_GRACE_SECS: u64 = 10;

pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("[host-proxy] accepted connection from {}", peer);
                        let state = state.clone();
                        connections.spawn(handle_connection(stream, state));
                    }
                    Err(e) => log::warn!("[host-proxy] accept failed: {}", e),
                }
            }
            _ = shutdown.recv() => break,
        }
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS), drain)
        .await
        .is_err()
    {
        log::warn!("[host-proxy] shutdown grace period elapsed, aborting connections");
        connections.abort_all();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) {
    let acceptor = TlsAcceptor::from(state.tls_config.clone());
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            log::debug!("[host-proxy] TLS handshake failed: {}", e);
            return;
        }
    };

    let service = service_fn({
        let state = state.clone();
        move |req: http::Request<Incoming>| {
            let state = state.clone();
            let host = request_host(&req);
            async move { Ok::<_, Infallible>(pipeline::handle(req, host, state).await) }
        }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        log::debug!("[host-proxy] connection ended: {}", e);
    }
}

/// The redirected endpoint: the Host header, stripped of any port.
fn request_host(req: &http::Request<Incoming>) -> String {
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default()
}
