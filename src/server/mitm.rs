//! HTTP proxy mode: CONNECT interception with on-the-fly TLS termination
//! for configured endpoints, transparent tunneling for everything else.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::error::AppError;
use crate::server::pipeline::{self, empty_body, error_response, AppState, PipelineBody};

const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Accept loop for proxy mode. One task per connection; on shutdown the
/// listener closes and in-flight connections get a grace period to drain.
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
                        log::debug!("[http-proxy] accepted connection from {}", peer);
                        let state = state.clone();
                        connections.spawn(handle_connection(stream, state));
                    }
                    Err(e) => log::warn!("[http-proxy] accept failed: {}", e),
                }
            }
            _ = shutdown.recv() => break,
        }
        // Reap finished connection tasks as we go.
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
        log::warn!("[http-proxy] shutdown grace period elapsed, aborting connections");
        connections.abort_all();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) {
    let service = service_fn({
        let state = state.clone();
        move |req| proxy_request(req, state.clone())
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        log::debug!("[http-proxy] connection ended: {}", e);
    }
}

async fn proxy_request(
    req: http::Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<PipelineBody>, Infallible> {
    if req.method() == Method::CONNECT {
        let authority = match req.uri().authority().cloned() {
            Some(authority) => authority,
            None => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires an authority".into(),
                ))
            }
        };
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);
        let intercept = port == 443 && state.channels.is_intercept_endpoint(&host);

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let result = if intercept {
                        log::debug!("[http-proxy] intercepting host={}", host);
                        serve_mitm(upgraded, host.clone(), state).await
                    } else {
                        log::debug!("[http-proxy] tunneling host={}:{}", host, port);
                        tunnel(upgraded, &host, port).await
                    };
                    if let Err(e) = result {
                        log::debug!("[http-proxy] connect session ended host={}: {}", host, e);
                    }
                }
                Err(e) => log::debug!("[http-proxy] upgrade failed: {}", e),
            }
        });

        // hyper sends this 200 and then completes the upgrade.
        return Ok(Response::new(empty_body()));
    }

    // Plain absolute-form proxy request.
    let host = req.uri().host().unwrap_or_default().to_string();
    Ok(pipeline::handle(req, host, state).await)
}

/// Terminate TLS toward the client with a leaf signed for the SNI, then
/// serve the decrypted requests through the conversion pipeline.
async fn serve_mitm(upgraded: Upgraded, host: String, state: Arc<AppState>) -> Result<(), AppError> {
    let acceptor = TlsAcceptor::from(state.tls_config.clone());
    let tls = acceptor.accept(TokioIo::new(upgraded)).await?;

    let service = service_fn({
        let state = state.clone();
        let host = host.clone();
        move |req| {
            let state = state.clone();
            let host = host.clone();
            async move { Ok::<_, Infallible>(pipeline::handle(req, host, state).await) }
        }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))
}

/// Transparent TCP tunnel for unconfigured hosts; bytes flow both ways
/// unmodified.
async fn tunnel(upgraded: Upgraded, host: &str, port: u16) -> Result<(), AppError> {
    let mut upstream = TcpStream::connect((host, port)).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}
