//! Identity converters: same dialect on both sides, but URL, auth headers
//! and the model name are still rewritten.

use serde_json::Value;

use crate::channel::Channel;
use crate::convert::{
    apply_auth, parse_json, rewrite_url, stamp_original_model, ConvertContext, Converter,
    ProxyRequest, StreamRewriter,
};
use crate::error::AppError;

fn map_model_in_body(body: &[u8], channel: &Channel) -> Result<(String, Vec<u8>), AppError> {
    let mut data = parse_json(body)?;
    let original_model = data["model"].as_str().unwrap_or_default().to_string();
    if !original_model.is_empty() {
        data["model"] = Value::String(channel.mapper.map_model(&original_model));
    }
    Ok((original_model, serde_json::to_vec(&data)?))
}

fn identity_request(
    request: ProxyRequest,
    channel: &Channel,
    provider: &str,
    canonical: &str,
) -> Result<ProxyRequest, AppError> {
    let (url, path) = rewrite_url(&channel.url, &request.path, canonical, canonical);

    let mut headers = http::HeaderMap::new();
    apply_auth(&mut headers, provider, &channel.api_key);

    // GET requests (model lists) carry no body to rewrite.
    let (model, body) = if request.method == http::Method::GET || request.body.is_empty() {
        (String::new(), request.body.to_vec())
    } else {
        map_model_in_body(&request.body, channel)?
    };
    stamp_original_model(&mut headers, &model);

    Ok(ProxyRequest {
        method: request.method,
        url,
        path,
        headers,
        body: body.into(),
    })
}

/// Passes anthropic events through, re-framing `event:` lines from the
/// payload type.
struct AnthropicPassthrough;

impl StreamRewriter for AnthropicPassthrough {
    fn on_event(&mut self, data: &str) -> Vec<String> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Vec::new();
        }
        let event = serde_json::from_str::<Value>(data)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_else(|| "message".to_string());
        vec![format!("event: {}\ndata: {}\n\n", event, data)]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }
}

struct OpenAiPassthrough;

impl StreamRewriter for OpenAiPassthrough {
    fn on_event(&mut self, data: &str) -> Vec<String> {
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        vec![format!("data: {}\n\n", data)]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub struct AnthropicIdentity;

impl Converter for AnthropicIdentity {
    fn name(&self) -> &'static str {
        crate::convert::ANTHROPIC2ANTHROPIC
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        identity_request(request, channel, "anthropic", "/v1/messages")
    }

    fn convert_response(&self, body: &[u8], _ctx: &ConvertContext) -> Result<Vec<u8>, AppError> {
        Ok(body.to_vec())
    }

    fn stream_rewriter(&self, _ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(AnthropicPassthrough)
    }
}

pub struct OpenAiIdentity;

impl Converter for OpenAiIdentity {
    fn name(&self) -> &'static str {
        crate::convert::OPENAI2OPENAI
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        identity_request(request, channel, "openai", "/v1/chat/completions")
    }

    fn convert_response(&self, body: &[u8], _ctx: &ConvertContext) -> Result<Vec<u8>, AppError> {
        Ok(body.to_vec())
    }

    fn stream_rewriter(&self, _ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(OpenAiPassthrough)
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
        mapper.add_rule("claude-3-sonnet", "claude-3-5-sonnet");
        mapper.add_rule("gpt-4o", "gpt-4o-mini");
        Channel {
            name: "relay".into(),
            enabled: true,
            priority: 0,
            url: url.into(),
            api_key: "sk-relay".into(),
            provider: provider.into(),
            model_mapping: HashMap::new(),
            status: Status::Normal,
            test_model: String::new(),
            converter_name: String::new(),
            mapper,
            models: Vec::new(),
        }
    }

    fn request(path: &str, body: Value) -> ProxyRequest {
        ProxyRequest {
            method: http::Method::POST,
            url: format!("https://upstream.example.com{}", path),
            path: path.into(),
            headers: http::HeaderMap::new(),
            body: serde_json::to_vec(&body).unwrap().into(),
        }
    }

    #[test]
    fn anthropic_identity_still_maps_model_and_auth() {
        let channel = channel("anthropic", "https://relay.example.com");
        let out = AnthropicIdentity
            .convert_request(
                request("/v1/messages", json!({"model": "claude-3-sonnet", "messages": []})),
                &channel,
            )
            .unwrap();

        assert_eq!(out.url, "https://relay.example.com/v1/messages");
        assert_eq!(out.headers["x-api-key"], "sk-relay");
        assert_eq!(out.headers["original_model"], "claude-3-sonnet");
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet");
    }

    #[test]
    fn openai_identity_rewrites_canonical_path() {
        let channel = channel("openai", "https://relay.example.com/openai/");
        let out = OpenAiIdentity
            .convert_request(
                request("/v1/chat/completions", json!({"model": "gpt-4o", "messages": []})),
                &channel,
            )
            .unwrap();
        assert_eq!(out.url, "https://relay.example.com/openai/chat/completions");
        assert_eq!(out.headers["authorization"], "Bearer sk-relay");
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn get_requests_pass_body_through() {
        let channel = channel("anthropic", "https://relay.example.com");
        let mut req = request("/v1/models", json!({}));
        req.method = http::Method::GET;
        req.body = bytes::Bytes::new();
        let out = AnthropicIdentity.convert_request(req, &channel).unwrap();
        assert_eq!(out.url, "https://relay.example.com/v1/models");
        assert!(out.body.is_empty());
    }

    #[test]
    fn response_is_untouched() {
        let ctx = ConvertContext {
            original_model: "m".into(),
            channel_name: "relay".into(),
            request_path: "/v1/messages".into(),
        };
        let body = br#"{"id":"msg_1","content":[]}"#;
        assert_eq!(
            AnthropicIdentity.convert_response(body, &ctx).unwrap(),
            body.to_vec()
        );
    }

    #[test]
    fn anthropic_passthrough_reframes_events() {
        let mut rewriter = AnthropicPassthrough;
        let out = rewriter.on_event(r#"{"type":"message_start","message":{}}"#);
        assert_eq!(
            out,
            vec!["event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n"]
        );
    }

    #[test]
    fn openai_passthrough_keeps_done() {
        let mut rewriter = OpenAiPassthrough;
        assert_eq!(rewriter.on_event("[DONE]"), vec!["data: [DONE]\n\n"]);
    }
}
