//! Bidirectional dialect converters and their registry.
//!
//! A converter is addressed by `"<from>-><to>"` over the anthropic, openai
//! and gemini wire formats. Identity converters still rewrite URL, auth
//! headers and the model name.

pub mod sse;

mod anthropic_openai;
mod gemini;
mod identity;
mod openai_anthropic;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::channel::Channel;
use crate::error::AppError;
use crate::statistics::StatsManager;

pub const ANTHROPIC2OPENAI: &str = "anthropic->openai";
pub const OPENAI2ANTHROPIC: &str = "openai->anthropic";
pub const ANTHROPIC2ANTHROPIC: &str = "anthropic->anthropic";
pub const OPENAI2OPENAI: &str = "openai->openai";
pub const ANTHROPIC2GEMINI: &str = "anthropic->gemini";
pub const GEMINI2ANTHROPIC: &str = "gemini->anthropic";

/// Header carrying the client's model name across the upstream round trip,
/// so the response converter can restore it.
pub const ORIGINAL_MODEL_HEADER: &str = "original_model";

/// An HTTP request as it moves through the conversion pipeline.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Absolute URL; converters replace it with the upstream target.
    pub url: String,
    /// The URL path, kept in sync with `url`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Context carried from request conversion to response conversion.
#[derive(Debug, Clone)]
pub struct ConvertContext {
    pub original_model: String,
    pub channel_name: String,
    /// The upstream request path, for endpoints that skip body transforms.
    pub request_path: String,
}

/// Chunk-at-a-time SSE rewriting. `on_event` receives one upstream `data:`
/// payload and yields zero or more complete outbound SSE blocks; `finish`
/// runs at upstream EOF.
pub trait StreamRewriter: Send {
    fn on_event(&mut self, data: &str) -> Vec<String>;
    fn finish(&mut self) -> Vec<String>;
}

pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite URL, auth headers and body toward the channel's dialect, and
    /// stamp the original model into the forwarded headers.
    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError>;

    /// Translate a unary upstream response body back into the client dialect.
    fn convert_response(&self, body: &[u8], ctx: &ConvertContext) -> Result<Vec<u8>, AppError>;

    /// State machine translating the upstream SSE stream.
    fn stream_rewriter(&self, ctx: &ConvertContext) -> Box<dyn StreamRewriter>;
}

/// Named converter registry; registration is duplicate-rejecting.
pub struct Registry {
    converters: RwLock<HashMap<String, Arc<dyn Converter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            converters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, converter: Arc<dyn Converter>) -> Result<(), AppError> {
        let name = converter.name().to_string();
        let mut converters = self.converters.write().unwrap();
        if converters.contains_key(&name) {
            return Err(AppError::ConverterRegistrationConflict(name));
        }
        log::info!("registered converter name={}", name);
        converters.insert(name, converter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Converter>, AppError> {
        let converters = self.converters.read().unwrap();
        converters
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::ConverterMissing(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let converters = self.converters.read().unwrap();
        let mut names: Vec<String> = converters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the full converter set. The statistics sink is injected into
/// the converters that report token usage.
pub fn register_all(registry: &Registry, stats: Arc<StatsManager>) -> Result<(), AppError> {
    registry.register(Arc::new(anthropic_openai::AnthropicToOpenAi::new(stats.clone())))?;
    registry.register(Arc::new(openai_anthropic::OpenAiToAnthropic::new(stats)))?;
    registry.register(Arc::new(identity::AnthropicIdentity))?;
    registry.register(Arc::new(identity::OpenAiIdentity))?;
    registry.register(Arc::new(gemini::AnthropicToGemini))?;
    registry.register(Arc::new(gemini::GeminiToAnthropic))?;
    Ok(())
}

// ---- shared helpers ----

/// Rewrite an incoming path against the channel base URL. The source
/// dialect's canonical endpoint maps to the target's; any other path keeps
/// its shape, with the `/v1/` prefix stripped when the base already ends in
/// a slash. Returns (url, upstream path).
pub(crate) fn rewrite_url(
    channel_url: &str,
    request_path: &str,
    source_canonical: &str,
    target_canonical: &str,
) -> (String, String) {
    let path = if request_path == source_canonical {
        target_canonical.to_string()
    } else {
        request_path.to_string()
    };
    let url = if channel_url.ends_with('/') {
        format!("{}{}", channel_url, path.trim_start_matches("/v1/"))
    } else {
        format!("{}{}", channel_url, path)
    };
    (url, path)
}

/// Replace authentication headers with the target dialect's.
pub(crate) fn apply_auth(headers: &mut HeaderMap, provider: &str, api_key: &str) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    match provider {
        "anthropic" => {
            set(headers, "x-api-key", api_key.to_string());
            set(headers, "authorization", format!("Bearer {}", api_key));
            set(headers, "anthropic-version", "2023-06-01".to_string());
        }
        "gemini" => {
            set(headers, "x-goog-api-key", api_key.to_string());
        }
        // openai and everything else: bearer token.
        _ => {
            set(headers, "authorization", format!("Bearer {}", api_key));
        }
    }
    headers.insert("content-type", HeaderValue::from_static("application/json"));
}

pub(crate) fn stamp_original_model(headers: &mut HeaderMap, model: &str) {
    if let Ok(value) = HeaderValue::from_str(model) {
        headers.insert(ORIGINAL_MODEL_HEADER, value);
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn random_chunk_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

pub(crate) fn openai_finish_to_anthropic(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "content_filter" => "stop_sequence",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

pub(crate) fn anthropic_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "stop_sequence" => "stop",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Strip a trailing half-escape from a streamed JSON argument fragment:
/// a dangling `\`, or a truncated `\u` unicode escape.
pub(crate) fn clean_json_fragment(fragment: &str) -> String {
    for suffix in ["\\u00", "\\u0", "\\u"] {
        if fragment.ends_with(suffix) {
            return fragment[..fragment.len() - suffix.len()].to_string();
        }
    }
    if fragment.ends_with('\\') && !fragment.ends_with("\\\\") {
        return fragment[..fragment.len() - 1].to_string();
    }
    fragment.to_string()
}

/// The one well-formed chunk a stream rewriter emits when the upstream
/// produced nothing at all.
pub(crate) fn synthetic_error_chunk(model: &str) -> String {
    let chunk = serde_json::json!({
        "id": "chatcmpl-error",
        "object": "chat.completion.chunk",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"content": "Error: No response received from AI service."},
            "finish_reason": "stop",
        }],
    });
    format!("data: {}\n\n", chunk)
}

pub(crate) fn parse_json(body: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::ConversionFailed(e.to_string()))
}
