//! openai -> anthropic: an OpenAI Chat Completions client talking to an
//! Anthropic Messages upstream.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::channel::Channel;
use crate::convert::{
    anthropic_stop_to_openai, apply_auth, parse_json, random_chunk_id, rewrite_url,
    stamp_original_model, synthetic_error_chunk, unix_now, ConvertContext, Converter,
    ProxyRequest, StreamRewriter,
};
use crate::error::AppError;
use crate::statistics::StatsManager;

pub struct OpenAiToAnthropic {
    stats: Arc<StatsManager>,
}

impl OpenAiToAnthropic {
    pub fn new(stats: Arc<StatsManager>) -> Self {
        Self { stats }
    }

    fn convert_request_body(&self, body: &[u8], channel: &Channel) -> Result<(String, Vec<u8>), AppError> {
        let data = parse_json(body)?;
        let mut result = Map::new();

        let original_model = data["model"].as_str().unwrap_or_default().to_string();
        result.insert("model".into(), json!(channel.mapper.map_model(&original_model)));

        let mut messages: Vec<Value> = Vec::new();
        let mut system: Option<Value> = None;
        if let Some(list) = data.get("messages").and_then(Value::as_array) {
            for msg in list {
                match msg["role"].as_str().unwrap_or_default() {
                    // System prompts move to the top-level field.
                    "system" | "developer" => {
                        system = msg.get("content").cloned();
                    }
                    "user" => {
                        messages.push(json!({
                            "role": "user",
                            "content": msg.get("content").cloned().unwrap_or(Value::Null),
                        }));
                    }
                    "assistant" => {
                        if let Some(tool_calls) = msg.get("tool_calls").and_then(Value::as_array) {
                            let content: Vec<Value> = tool_calls
                                .iter()
                                .filter(|call| call["type"].as_str() == Some("function"))
                                .map(|call| {
                                    let arguments =
                                        call.pointer("/function/arguments").and_then(Value::as_str);
                                    let input: Value = arguments
                                        .and_then(|a| serde_json::from_str(a).ok())
                                        .unwrap_or(json!({}));
                                    json!({
                                        "type": "tool_use",
                                        "id": call["id"].as_str().unwrap_or_default(),
                                        "name": call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
                                        "input": input,
                                    })
                                })
                                .collect();
                            messages.push(json!({"role": "assistant", "content": content}));
                        } else {
                            messages.push(json!({
                                "role": "assistant",
                                "content": msg.get("content").cloned().unwrap_or(Value::Null),
                            }));
                        }
                    }
                    "tool" => {
                        messages.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": msg["tool_call_id"].as_str().unwrap_or_default(),
                                "content": msg.get("content").cloned().unwrap_or(Value::Null),
                            }],
                        }));
                    }
                    _ => {}
                }
            }
        }
        result.insert("messages".into(), Value::Array(messages));
        if let Some(system) = system {
            result.insert("system".into(), system);
        }

        // Anthropic requires max_tokens.
        let max_tokens = data.get("max_tokens").and_then(Value::as_u64).unwrap_or(32000);
        result.insert("max_tokens".into(), json!(max_tokens));

        for key in ["temperature", "top_p", "stream"] {
            if let Some(value) = data.get(key) {
                result.insert(key.into(), value.clone());
            }
        }
        if let Some(stop) = data.get("stop") {
            let sequences = match stop {
                Value::Array(_) => stop.clone(),
                other => json!([other]),
            };
            result.insert("stop_sequences".into(), sequences);
        }

        if let Some(tools) = data.get("tools").and_then(Value::as_array) {
            let tools: Vec<Value> = tools
                .iter()
                .filter(|tool| tool["type"].as_str() == Some("function"))
                .map(|tool| {
                    json!({
                        "name": tool.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
                        "description": tool.pointer("/function/description").and_then(Value::as_str).unwrap_or_default(),
                        "input_schema": tool.pointer("/function/parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect();
            result.insert("tools".into(), Value::Array(tools));
        }

        // max_completion_tokens marks a reasoning request; the effort tier
        // picks the thinking budget.
        if data.get("max_completion_tokens").is_some() {
            let budget = match data.get("reasoning_effort").and_then(Value::as_str) {
                Some("low") => 2048,
                Some("high") => 16384,
                _ => 8192,
            };
            result.insert(
                "thinking".into(),
                json!({"type": "enabled", "budget_tokens": budget}),
            );
        }

        Ok((original_model, serde_json::to_vec(&Value::Object(result))?))
    }
}

impl Converter for OpenAiToAnthropic {
    fn name(&self) -> &'static str {
        crate::convert::OPENAI2ANTHROPIC
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        let (url, path) = rewrite_url(
            &channel.url,
            &request.path,
            "/v1/chat/completions",
            "/v1/messages",
        );

        let mut headers = http::HeaderMap::new();
        apply_auth(&mut headers, "anthropic", &channel.api_key);

        let (model, body) = if request.body.is_empty() {
            (String::new(), Vec::new())
        } else {
            self.convert_request_body(&request.body, channel)?
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

    fn convert_response(&self, body: &[u8], ctx: &ConvertContext) -> Result<Vec<u8>, AppError> {
        if ctx.request_path.ends_with("/models") {
            return Ok(body.to_vec());
        }

        let data = parse_json(body)?;

        let mut text = String::new();
        let mut thinking = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        if let Some(blocks) = data.get("content").and_then(Value::as_array) {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                    Some("thinking") => {
                        thinking.push_str(block["thinking"].as_str().unwrap_or_default())
                    }
                    Some("tool_use") => {
                        let arguments = block
                            .get("input")
                            .map(|input| input.to_string())
                            .unwrap_or_else(|| "{}".to_string());
                        tool_calls.push(json!({
                            "id": block["id"].as_str().unwrap_or_default(),
                            "type": "function",
                            "function": {
                                "name": block["name"].as_str().unwrap_or_default(),
                                "arguments": arguments,
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }

        // Thinking segments travel inside <thinking> tags ahead of the prose.
        let content = if thinking.is_empty() {
            text
        } else {
            format!("<thinking>\n{}\n</thinking>\n\n{}", thinking, text)
        };

        let mut message = json!({"role": "assistant", "content": content});
        let finish = if tool_calls.is_empty() {
            anthropic_stop_to_openai(data["stop_reason"].as_str().unwrap_or_default()).to_string()
        } else {
            message["tool_calls"] = Value::Array(tool_calls);
            "tool_calls".to_string()
        };

        let input_tokens = data.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = data
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let result = json!({
            "id": format!("chatcmpl-{}", random_chunk_id()),
            "object": "chat.completion",
            "created": unix_now(),
            "model": ctx.original_model,
            "choices": [{"index": 0, "message": message, "finish_reason": finish}],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
        });

        self.stats
            .update(&ctx.channel_name, true, input_tokens, output_tokens);

        Ok(serde_json::to_vec(&result)?)
    }

    fn stream_rewriter(&self, ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(AnthropicToOpenAiChunks::new(&ctx.original_model))
    }
}

/// Translates Anthropic stream events into OpenAI chunks: every inbound
/// event yields exactly one outbound chunk, and the final `message_stop`
/// yields its chunk followed by `[DONE]`.
struct AnthropicToOpenAiChunks {
    id: String,
    model: String,
    saw_chunk: bool,
    done_sent: bool,
}

impl AnthropicToOpenAiChunks {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", random_chunk_id()),
            model: model.to_string(),
            saw_chunk: false,
            done_sent: false,
        }
    }

    fn base_chunk(&self) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": unix_now(),
            "model": self.model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": null}],
        })
    }
}

impl StreamRewriter for AnthropicToOpenAiChunks {
    fn on_event(&mut self, data: &str) -> Vec<String> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            self.done_sent = true;
            return vec!["data: [DONE]\n\n".to_string()];
        }

        let parsed: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        self.saw_chunk = true;

        let mut chunk = self.base_chunk();
        let mut emit_done = false;

        match parsed["type"].as_str().unwrap_or_default() {
            "message_start" => {
                chunk["choices"][0]["delta"] = json!({"role": "assistant"});
            }
            "content_block_start" => {
                let block = &parsed["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    chunk["choices"][0]["delta"] = json!({
                        "tool_calls": [{
                            "index": parsed["index"].as_u64().unwrap_or(0),
                            "id": block["id"].as_str().unwrap_or_default(),
                            "type": "function",
                            "function": {"name": block["name"].as_str().unwrap_or_default()},
                        }],
                    });
                }
            }
            "content_block_delta" => {
                let delta = &parsed["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        chunk["choices"][0]["delta"] =
                            json!({"content": delta["text"].as_str().unwrap_or_default()});
                    }
                    "thinking_delta" => {
                        chunk["choices"][0]["delta"] = json!({
                            "reasoning_content": delta["thinking"].as_str().unwrap_or_default(),
                        });
                    }
                    "input_json_delta" => {
                        chunk["choices"][0]["delta"] = json!({
                            "tool_calls": [{
                                "index": parsed["index"].as_u64().unwrap_or(0),
                                "function": {
                                    "arguments": delta["partial_json"].as_str().unwrap_or_default(),
                                },
                            }],
                        });
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                let stop = parsed
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                chunk["choices"][0]["finish_reason"] = json!(anthropic_stop_to_openai(stop));
                let input = parsed.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0);
                let output = parsed
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                chunk["usage"] = json!({
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                });
            }
            "message_stop" => {
                chunk["choices"][0]["finish_reason"] = json!("stop");
                emit_done = true;
            }
            // content_block_stop, ping and unknown events still produce one
            // well-formed chunk with an empty delta.
            _ => {}
        }

        let mut out = vec![format!("data: {}\n\n", chunk)];
        if emit_done {
            self.done_sent = true;
            out.push("data: [DONE]\n\n".to_string());
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        if !self.saw_chunk {
            return vec![
                synthetic_error_chunk(&self.model),
                "data: [DONE]\n\n".to_string(),
            ];
        }
        if !self.done_sent {
            self.done_sent = true;
            return vec!["data: [DONE]\n\n".to_string()];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model_mapping::ModelMapper;
    use crate::channel::Status;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn converter() -> (TempDir, OpenAiToAnthropic) {
        let dir = TempDir::new().unwrap();
        let stats = Arc::new(StatsManager::new(dir.path()));
        (dir, OpenAiToAnthropic::new(stats))
    }

    fn channel() -> Channel {
        let mut mapper = ModelMapper::new();
        mapper.add_rule("gpt-4o", "claude-3-5-sonnet");
        Channel {
            name: "claude".into(),
            enabled: true,
            priority: 0,
            url: "https://api.anthropic.com".into(),
            api_key: "sk-ant".into(),
            provider: "anthropic".into(),
            model_mapping: HashMap::new(),
            status: Status::Normal,
            test_model: String::new(),
            converter_name: "openai->anthropic".into(),
            mapper,
            models: Vec::new(),
        }
    }

    fn request(body: Value) -> ProxyRequest {
        ProxyRequest {
            method: http::Method::POST,
            url: "https://api.openai.com/v1/chat/completions".into(),
            path: "/v1/chat/completions".into(),
            headers: http::HeaderMap::new(),
            body: serde_json::to_vec(&body).unwrap().into(),
        }
    }

    fn ctx() -> ConvertContext {
        ConvertContext {
            original_model: "gpt-4o".into(),
            channel_name: "claude".into(),
            request_path: "/v1/messages".into(),
        }
    }

    #[test]
    fn request_lifts_system_and_defaults_max_tokens() {
        let (_dir, converter) = converter();
        let out = converter
            .convert_request(
                request(json!({
                    "model": "gpt-4o",
                    "messages": [
                        {"role": "system", "content": "be terse"},
                        {"role": "user", "content": "hi"},
                    ],
                })),
                &channel(),
            )
            .unwrap();

        assert_eq!(out.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(out.headers["x-api-key"], "sk-ant");
        assert_eq!(out.headers["anthropic-version"], "2023-06-01");
        assert_eq!(out.headers["original_model"], "gpt-4o");

        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], 32000);
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn tool_turns_are_translated() {
        let (_dir, converter) = converter();
        let out = converter
            .convert_request(
                request(json!({
                    "model": "gpt-4o",
                    "messages": [
                        {"role": "assistant", "tool_calls": [
                            {"id": "t1", "type": "function", "function": {"name": "add", "arguments": "{\"a\":1}"}},
                        ]},
                        {"role": "tool", "tool_call_id": "t1", "content": "2"},
                    ],
                    "tools": [{"type": "function", "function": {"name": "add", "parameters": {"type": "object"}}}],
                })),
                &channel(),
            )
            .unwrap();

        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(
            body["messages"][0]["content"],
            json!([{"type": "tool_use", "id": "t1", "name": "add", "input": {"a": 1}}])
        );
        assert_eq!(
            body["messages"][1]["content"],
            json!([{"type": "tool_result", "tool_use_id": "t1", "content": "2"}])
        );
        assert_eq!(body["tools"][0]["name"], "add");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn stop_becomes_stop_sequences() {
        let (_dir, converter) = converter();
        let out = converter
            .convert_request(
                request(json!({"model": "gpt-4o", "messages": [], "stop": "END"})),
                &channel(),
            )
            .unwrap();
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn reasoning_effort_maps_to_thinking_budget() {
        let (_dir, converter) = converter();
        for (effort, budget) in [
            (json!("low"), 2048),
            (json!("medium"), 8192),
            (json!("high"), 16384),
        ] {
            let out = converter
                .convert_request(
                    request(json!({
                        "model": "gpt-4o",
                        "messages": [],
                        "max_completion_tokens": 4000,
                        "reasoning_effort": effort,
                    })),
                    &channel(),
                )
                .unwrap();
            let body: Value = serde_json::from_slice(&out.body).unwrap();
            assert_eq!(body["thinking"]["type"], "enabled");
            assert_eq!(body["thinking"]["budget_tokens"], budget);
        }
    }

    #[test]
    fn response_concatenates_blocks_and_maps_usage() {
        let (_dir, converter) = converter();
        let upstream = json!({
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "hello"},
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2},
        });
        let out = converter
            .convert_response(&serde_json::to_vec(&upstream).unwrap(), &ctx())
            .unwrap();
        let out: Value = serde_json::from_slice(&out).unwrap();

        assert!(out["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(
            out["choices"][0]["message"]["content"],
            "<thinking>\nhmm\n</thinking>\n\nhello"
        );
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            out["usage"],
            json!({"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5})
        );
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let (_dir, converter) = converter();
        let upstream = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "add", "input": {"a": 1}}],
            "stop_reason": "tool_use",
        });
        let out = converter
            .convert_response(&serde_json::to_vec(&upstream).unwrap(), &ctx())
            .unwrap();
        let out: Value = serde_json::from_slice(&out).unwrap();
        let call = &out["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["id"], "t1");
        assert_eq!(call["function"]["name"], "add");
        assert_eq!(call["function"]["arguments"], "{\"a\":1}");
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }

    fn payload(chunk: &str) -> Value {
        serde_json::from_str(chunk.trim_start_matches("data: ").trim()).unwrap()
    }

    #[test]
    fn stream_every_event_yields_one_chunk() {
        let mut rewriter = AnthropicToOpenAiChunks::new("gpt-4o");

        let start = rewriter.on_event(r#"{"type":"message_start","message":{"id":"m1"}}"#);
        assert_eq!(start.len(), 1);
        assert_eq!(payload(&start[0])["choices"][0]["delta"]["role"], "assistant");

        let text = rewriter.on_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        assert_eq!(payload(&text[0])["choices"][0]["delta"]["content"], "hi");

        let thinking = rewriter.on_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"deep"}}"#,
        );
        assert_eq!(
            payload(&thinking[0])["choices"][0]["delta"]["reasoning_content"],
            "deep"
        );

        let stop = rewriter.on_event(r#"{"type":"content_block_stop","index":0}"#);
        assert_eq!(stop.len(), 1);

        let delta = rewriter.on_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":3,"output_tokens":2}}"#,
        );
        let parsed = payload(&delta[0]);
        assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
        assert_eq!(parsed["usage"]["total_tokens"], 5);

        let end = rewriter.on_event(r#"{"type":"message_stop"}"#);
        assert_eq!(end.len(), 2);
        assert_eq!(payload(&end[0])["choices"][0]["finish_reason"], "stop");
        assert_eq!(end[1], "data: [DONE]\n\n");

        assert!(rewriter.finish().is_empty());
    }

    #[test]
    fn stream_tool_events_carry_ids_then_arguments() {
        let mut rewriter = AnthropicToOpenAiChunks::new("gpt-4o");

        let start = rewriter.on_event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"add","input":{}}}"#,
        );
        let call = &payload(&start[0])["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "t1");
        assert_eq!(call["index"], 1);
        assert_eq!(call["function"]["name"], "add");

        let args = rewriter.on_event(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}"#,
        );
        let call = &payload(&args[0])["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["arguments"], "{\"a\":1}");
    }

    #[test]
    fn stream_ids_are_stable_within_a_stream() {
        let mut rewriter = AnthropicToOpenAiChunks::new("gpt-4o");
        let a = rewriter.on_event(r#"{"type":"message_start","message":{}}"#);
        let b = rewriter.on_event(r#"{"type":"message_stop"}"#);
        let id_a = payload(&a[0])["id"].as_str().unwrap().to_string();
        let id_b = payload(&b[0])["id"].as_str().unwrap().to_string();
        assert_eq!(id_a, id_b);
        assert!(id_a.starts_with("chatcmpl-"));
        assert_eq!(id_a.len(), "chatcmpl-".len() + 12);
    }

    #[test]
    fn empty_stream_yields_error_chunk_and_done() {
        let mut rewriter = AnthropicToOpenAiChunks::new("gpt-4o");
        let events = rewriter.finish();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("chatcmpl-error"));
        assert_eq!(events[1], "data: [DONE]\n\n");
    }

    #[test]
    fn truncated_stream_is_closed_with_done() {
        let mut rewriter = AnthropicToOpenAiChunks::new("gpt-4o");
        rewriter.on_event(r#"{"type":"message_start","message":{}}"#);
        let events = rewriter.finish();
        assert_eq!(events, vec!["data: [DONE]\n\n".to_string()]);
    }
}
