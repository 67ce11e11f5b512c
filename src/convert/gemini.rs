//! Gemini converter pair. URL, auth and model rewriting are complete; the
//! body and stream transforms are open slots and pass data through.

use serde_json::Value;

use crate::channel::Channel;
use crate::convert::{
    apply_auth, parse_json, stamp_original_model, synthetic_error_chunk, ConvertContext,
    Converter, ProxyRequest, StreamRewriter,
};
use crate::error::AppError;

fn gemini_generate_path(model: &str) -> String {
    format!("/v1beta/models/{}:generateContent", model)
}

/// Pull the model out of `/v1beta/models/<model>:generateContent`.
fn model_from_gemini_path(path: &str) -> Option<&str> {
    path.strip_prefix("/v1beta/models/")?.split(':').next()
}

struct PassthroughStream {
    model: String,
    saw_chunk: bool,
}

impl PassthroughStream {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            saw_chunk: false,
        }
    }
}

impl StreamRewriter for PassthroughStream {
    fn on_event(&mut self, data: &str) -> Vec<String> {
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        self.saw_chunk = true;
        vec![format!("data: {}\n\n", data)]
    }

    fn finish(&mut self) -> Vec<String> {
        if !self.saw_chunk {
            return vec![synthetic_error_chunk(&self.model)];
        }
        Vec::new()
    }
}

pub struct AnthropicToGemini;

impl Converter for AnthropicToGemini {
    fn name(&self) -> &'static str {
        crate::convert::ANTHROPIC2GEMINI
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        let (original_model, body) = if request.body.is_empty() {
            (String::new(), Vec::new())
        } else {
            let data = parse_json(&request.body)?;
            let model = data["model"].as_str().unwrap_or_default().to_string();
            (model, request.body.to_vec())
        };
        let mapped = channel.mapper.map_model(&original_model);

        let path = if request.path == "/v1/messages" {
            gemini_generate_path(&mapped)
        } else {
            request.path.clone()
        };
        let url = if channel.url.ends_with('/') {
            format!("{}{}", channel.url, path.trim_start_matches('/'))
        } else {
            format!("{}{}", channel.url, path)
        };

        let mut headers = http::HeaderMap::new();
        apply_auth(&mut headers, "gemini", &channel.api_key);
        stamp_original_model(&mut headers, &original_model);

        Ok(ProxyRequest {
            method: request.method,
            url,
            path,
            headers,
            body: body.into(),
        })
    }

    fn convert_response(&self, body: &[u8], _ctx: &ConvertContext) -> Result<Vec<u8>, AppError> {
        Ok(body.to_vec())
    }

    fn stream_rewriter(&self, ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(PassthroughStream::new(&ctx.original_model))
    }
}

pub struct GeminiToAnthropic;

impl Converter for GeminiToAnthropic {
    fn name(&self) -> &'static str {
        crate::convert::GEMINI2ANTHROPIC
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        let original_model = model_from_gemini_path(&request.path)
            .unwrap_or_default()
            .to_string();
        let mapped = channel.mapper.map_model(&original_model);

        let path = if request.path.starts_with("/v1beta/models/") {
            "/v1/messages".to_string()
        } else {
            request.path.clone()
        };
        let url = if channel.url.ends_with('/') {
            format!("{}{}", channel.url, path.trim_start_matches("/v1/"))
        } else {
            format!("{}{}", channel.url, path)
        };

        let mut headers = http::HeaderMap::new();
        apply_auth(&mut headers, "anthropic", &channel.api_key);
        stamp_original_model(&mut headers, &original_model);

        // Open slot: the body passes through with the mapped model stamped in
        // when the payload is JSON.
        let body = if request.body.is_empty() {
            Vec::new()
        } else {
            let mut data = parse_json(&request.body)?;
            if let Value::Object(ref mut map) = data {
                map.insert("model".into(), Value::String(mapped));
            }
            serde_json::to_vec(&data)?
        };

        Ok(ProxyRequest {
            method: request.method,
            url,
            path,
            headers,
            body: body.into(),
        })
    }

    fn convert_response(&self, body: &[u8], _ctx: &ConvertContext) -> Result<Vec<u8>, AppError> {
        Ok(body.to_vec())
    }

    fn stream_rewriter(&self, ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(PassthroughStream::new(&ctx.original_model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model_mapping::ModelMapper;
    use crate::channel::Status;
    use serde_json::json;
    use std::collections::HashMap;

    fn channel(provider: &str, url: &str) -> Channel {
        let mut mapper = ModelMapper::new();
        mapper.add_rule("claude-3-sonnet", "gemini-2.0-flash");
        mapper.add_rule("gemini-2.0-flash", "claude-3-5-sonnet");
        Channel {
            name: "g".into(),
            enabled: true,
            priority: 0,
            url: url.into(),
            api_key: "g-key".into(),
            provider: provider.into(),
            model_mapping: HashMap::new(),
            status: Status::Normal,
            test_model: String::new(),
            converter_name: String::new(),
            mapper,
            models: Vec::new(),
        }
    }

    #[test]
    fn anthropic_request_targets_generate_content() {
        let channel = channel("gemini", "https://generativelanguage.googleapis.com");
        let request = ProxyRequest {
            method: http::Method::POST,
            url: "https://api.anthropic.com/v1/messages".into(),
            path: "/v1/messages".into(),
            headers: http::HeaderMap::new(),
            body: serde_json::to_vec(&json!({"model": "claude-3-sonnet"})).unwrap().into(),
        };
        let out = AnthropicToGemini.convert_request(request, &channel).unwrap();
        assert_eq!(
            out.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(out.headers["x-goog-api-key"], "g-key");
        assert_eq!(out.headers["original_model"], "claude-3-sonnet");
    }

    #[test]
    fn gemini_request_extracts_model_from_path() {
        let channel = channel("anthropic", "https://api.anthropic.com");
        let request = ProxyRequest {
            method: http::Method::POST,
            url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".into(),
            path: "/v1beta/models/gemini-2.0-flash:generateContent".into(),
            headers: http::HeaderMap::new(),
            body: serde_json::to_vec(&json!({"contents": []})).unwrap().into(),
        };
        let out = GeminiToAnthropic.convert_request(request, &channel).unwrap();
        assert_eq!(out.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(out.headers["x-api-key"], "g-key");
        assert_eq!(out.headers["original_model"], "gemini-2.0-flash");
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet");
    }

    #[test]
    fn empty_stream_produces_synthetic_error() {
        let mut rewriter = PassthroughStream::new("gemini-2.0-flash");
        let events = rewriter.finish();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("chatcmpl-error"));
    }

    #[test]
    fn nonempty_stream_passes_through() {
        let mut rewriter = PassthroughStream::new("gemini-2.0-flash");
        let events = rewriter.on_event(r#"{"candidates":[]}"#);
        assert_eq!(events, vec!["data: {\"candidates\":[]}\n\n"]);
        assert!(rewriter.finish().is_empty());
    }
}
