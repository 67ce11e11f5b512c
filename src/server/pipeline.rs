//! The request/response pipeline shared by both proxy modes: channel
//! selection, request conversion, upstream dispatch and response rewriting.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::certificate::{CertAuthority, CertStore};
use crate::channel::ChannelManager;
use crate::convert::sse::SseFramer;
use crate::convert::{
    ConvertContext, ProxyRequest, Registry, StreamRewriter, ORIGINAL_MODEL_HEADER,
};
use crate::error::AppError;
use crate::statistics::StatsManager;

pub type PipelineBody = BoxBody<Bytes, io::Error>;

/// Headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared state threaded through every connection task.
pub struct AppState {
    pub channels: Arc<ChannelManager>,
    pub converters: Arc<Registry>,
    pub stats: Arc<StatsManager>,
    pub authority: Arc<CertAuthority>,
    pub cert_store: Arc<CertStore>,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub http_client: reqwest::Client,
}

pub fn empty_body() -> PipelineBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: Bytes) -> PipelineBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn channel_body() -> (mpsc::Sender<Result<Frame<Bytes>, io::Error>>, PipelineBody) {
    let (tx, rx) = mpsc::channel(32);
    let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)));
    (tx, body)
}

pub fn error_response(status: StatusCode, message: String) -> Response<PipelineBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(message)))
        .unwrap()
}

/// Entry point for one decrypted (or plain) HTTP request addressed to
/// `host`. Errors surface to the client as a 500 with the error text.
pub async fn handle(
    req: http::Request<Incoming>,
    host: String,
    state: Arc<AppState>,
) -> Response<PipelineBody> {
    match process(req, &host, state).await {
        Ok(response) => response,
        Err(e) => {
            log::error!("[pipeline] request failed host={} err={}", host, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn process(
    req: http::Request<Incoming>,
    host: &str,
    state: Arc<AppState>,
) -> Result<Response<PipelineBody>, AppError> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| AppError::Io(io::Error::other(e)))?
        .to_bytes();

    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let request = ProxyRequest {
        method: parts.method.clone(),
        url: format!("https://{}{}", host, path_and_query),
        path,
        headers: parts.headers,
        body,
    };

    // Hosts without an active group are forwarded byte-for-byte.
    if !state.channels.is_active_group(host) {
        log::debug!("[pipeline] passthrough host={} path={}", host, request.path);
        let upstream = dispatch(&state, &request).await?;
        return Ok(passthrough_response(upstream));
    }

    let channel = state.channels.select_channel(host)?;
    log::info!(
        "[{}] handling request method={} url={}",
        channel.name,
        request.method,
        request.url
    );

    let converter = state.converters.get(&channel.converter_name)?;
    let method = request.method.clone();
    let converted = converter.convert_request(request, &channel)?;

    let ctx = ConvertContext {
        original_model: converted
            .headers
            .get(ORIGINAL_MODEL_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        channel_name: channel.name.clone(),
        request_path: converted.path.clone(),
    };

    let upstream = dispatch(&state, &converted).await?;
    let status = upstream.status();

    // Non-2xx goes back verbatim but counts as a failure sample; the
    // channel is not demoted here.
    if !status.is_success() {
        log::warn!(
            "[{}] upstream returned {} url={}",
            channel.name,
            status,
            converted.url
        );
        state.stats.update(&channel.name, false, 0, 0);
        return Ok(passthrough_response(upstream));
    }

    if method == Method::GET {
        return Ok(passthrough_response(upstream));
    }

    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.contains("text/event-stream") {
        let rewriter = converter.stream_rewriter(&ctx);
        log::debug!("[{}] rewriting event stream url={}", channel.name, converted.url);
        return Ok(rewritten_stream_response(upstream, rewriter));
    }

    let headers = upstream.headers().clone();
    let body = upstream.bytes().await?;
    if body.is_empty() {
        let mut response = Response::builder().status(status);
        copy_headers(response.headers_mut().unwrap(), &headers, false);
        return Ok(response.body(empty_body()).unwrap());
    }

    let rewritten = converter.convert_response(&body, &ctx)?;
    log::info!("[{}] response converted status={}", channel.name, status);

    let mut response = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    copy_headers(response.headers_mut().unwrap(), &headers, true);
    Ok(response.body(full_body(Bytes::from(rewritten))).unwrap())
}

/// Send the (possibly converted) request upstream on the shared client.
async fn dispatch(state: &AppState, request: &ProxyRequest) -> Result<reqwest::Response, AppError> {
    let mut builder = state
        .http_client
        .request(request.method.clone(), request.url.as_str());

    let mut headers = HeaderMap::new();
    copy_headers(&mut headers, &request.headers, true);
    builder = builder.headers(headers);

    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    builder
        .send()
        .await
        .map_err(|e| AppError::UpstreamTransport(e.to_string()))
}

fn copy_headers(target: &mut HeaderMap, source: &HeaderMap, skip_content_length: bool) {
    for (name, value) in source {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) {
            continue;
        }
        if skip_content_length && lowered == "content-length" {
            continue;
        }
        target.insert(name.clone(), value.clone());
    }
}

/// Stream an upstream response back unmodified.
fn passthrough_response(upstream: reqwest::Response) -> Response<PipelineBody> {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let (tx, body) = channel_body();
    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(Frame::data(bytes))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("[pipeline] upstream body ended: {}", e);
                    break;
                }
            }
        }
    });

    let mut response = Response::builder().status(status);
    copy_headers(response.headers_mut().unwrap(), &headers, false);
    response.body(body).unwrap()
}

/// Producer task: read the upstream SSE body chunk by chunk, feed the
/// rewriter, and push rewritten blocks into the response body pipe so data
/// flows end-to-end without buffering the full response.
fn rewritten_stream_response(
    upstream: reqwest::Response,
    mut rewriter: Box<dyn StreamRewriter>,
) -> Response<PipelineBody> {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let (tx, body) = channel_body();
    tokio::spawn(async move {
        let mut framer = SseFramer::new();
        let mut stream = upstream.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::debug!("[pipeline] upstream stream ended: {}", e);
                    break;
                }
            };
            for data in framer.push(&chunk) {
                for block in rewriter.on_event(&data) {
                    if tx.send(Ok(Frame::data(Bytes::from(block)))).await.is_err() {
                        break 'read;
                    }
                }
            }
        }

        for data in framer.finish() {
            for block in rewriter.on_event(&data) {
                if tx.send(Ok(Frame::data(Bytes::from(block)))).await.is_err() {
                    return;
                }
            }
        }
        for block in rewriter.finish() {
            if tx.send(Ok(Frame::data(Bytes::from(block)))).await.is_err() {
                return;
            }
        }
    });

    let mut response = Response::builder()
        .status(status)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache");
    copy_headers(response.headers_mut().unwrap(), &headers, true);
    response.body(body).unwrap()
}
