//! anthropic -> openai: an Anthropic Messages client talking to an OpenAI
//! Chat Completions upstream.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::channel::Channel;
use crate::convert::{
    apply_auth, clean_json_fragment, openai_finish_to_anthropic, parse_json, rewrite_url,
    stamp_original_model, synthetic_error_chunk, unix_now, ConvertContext, Converter,
    ProxyRequest, StreamRewriter,
};
use crate::error::AppError;
use crate::statistics::StatsManager;

pub struct AnthropicToOpenAi {
    stats: Arc<StatsManager>,
}

impl AnthropicToOpenAi {
    pub fn new(stats: Arc<StatsManager>) -> Self {
        Self { stats }
    }

    fn convert_request_body(&self, body: &[u8], channel: &Channel) -> Result<(String, Vec<u8>), AppError> {
        let data = parse_json(body)?;
        let mut result = Map::new();

        let original_model = data["model"].as_str().unwrap_or_default().to_string();
        result.insert("model".into(), json!(channel.mapper.map_model(&original_model)));

        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = data.get("system").and_then(Value::as_str) {
            messages.push(json!({"role": "system", "content": system}));
        }
        if let Some(list) = data.get("messages").and_then(Value::as_array) {
            for msg in list {
                let role = msg["role"].as_str().unwrap_or_default();
                if role != "user" && role != "assistant" {
                    continue;
                }
                match msg.get("content") {
                    Some(Value::String(text)) => {
                        messages.push(json!({"role": role, "content": text}));
                    }
                    Some(Value::Array(items)) => {
                        convert_array_content(role, items, &mut messages);
                    }
                    _ => {}
                }
            }
        }
        result.insert("messages".into(), Value::Array(messages));

        if let Some(tools) = data.get("tools").and_then(Value::as_array) {
            result.insert("tool_choice".into(), json!("auto"));
            let tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool["name"].as_str().unwrap_or_default(),
                            "description": tool["description"].as_str().unwrap_or_default(),
                            "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                        },
                    })
                })
                .collect();
            result.insert("tools".into(), Value::Array(tools));
        }

        // "enable" and "enabled" both activate thinking; the budget picks the
        // effort tier, and max_token moves to max_completion_tokens.
        let thinking_on = matches!(
            data.pointer("/thinking/type").and_then(Value::as_str),
            Some("enable") | Some("enabled")
        );
        if thinking_on {
            let effort = match data.pointer("/thinking/budget_tokens").and_then(Value::as_u64) {
                None => "high",
                Some(budget) if budget <= 2048 => "low",
                Some(budget) if budget <= 16384 => "medium",
                Some(_) => "high",
            };
            result.insert("reasoning_effort".into(), json!(effort));
            if let Some(max_token) = data.get("max_token").and_then(Value::as_u64) {
                result.insert("max_completion_tokens".into(), json!(max_token));
            }
        } else if let Some(max_token) = data.get("max_token") {
            result.insert("max_token".into(), max_token.clone());
        }

        for key in ["temperature", "top_p", "stop_sequences", "stream"] {
            if let Some(value) = data.get(key) {
                result.insert(key.into(), value.clone());
            }
        }

        Ok((original_model, serde_json::to_vec(&Value::Object(result))?))
    }
}

/// Translate one array-content message per the tool_result / tool_use /
/// text-and-image rules.
fn convert_array_content(role: &str, items: &[Value], messages: &mut Vec<Value>) {
    let has_tool_results = role == "user"
        && items
            .iter()
            .any(|item| item["type"].as_str() == Some("tool_result"));
    if has_tool_results {
        for item in items {
            if item["type"].as_str() != Some("tool_result") {
                continue;
            }
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .or_else(|| item.get("tool_use_id").and_then(Value::as_str))
                .unwrap_or_default();
            let content = match item.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            messages.push(json!({"role": "tool", "tool_call_id": id, "content": content}));
        }
        let parts = convert_parts(items);
        if !parts.is_empty() {
            messages.push(part_message(role, parts));
        }
        return;
    }

    let first_is_tool_use = role == "assistant"
        && items
            .first()
            .map(|item| item["type"].as_str() == Some("tool_use"))
            .unwrap_or(false);
    if first_is_tool_use {
        let first = &items[0];
        let id = first
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| first.get("tool_use_id").and_then(Value::as_str))
            .unwrap_or_default();
        let arguments = first
            .get("input")
            .map(|input| input.to_string())
            .unwrap_or_else(|| "{}".to_string());
        messages.push(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": id,
                "type": "function",
                "function": {
                    "name": first["name"].as_str().unwrap_or_default(),
                    "arguments": arguments,
                },
            }],
        }));
        return;
    }

    let parts = convert_parts(items);
    if !parts.is_empty() {
        messages.push(part_message(role, parts));
    }
}

/// A single text part collapses to a bare string `content`.
fn part_message(role: &str, parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        if let Some(text) = parts[0].get("text") {
            return json!({"role": role, "content": text});
        }
    }
    json!({"role": role, "content": parts})
}

fn convert_parts(items: &[Value]) -> Vec<Value> {
    let mut parts = Vec::new();
    for item in items {
        match item["type"].as_str() {
            Some("text") => {
                parts.push(json!({"type": "text", "text": item["text"].as_str().unwrap_or_default()}));
            }
            Some("image") => {
                let source = &item["source"];
                if source["type"].as_str() == Some("base64") {
                    let media = source["media_type"].as_str().unwrap_or("image/jpeg");
                    let data = source["data"].as_str().unwrap_or_default();
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media, data)},
                    }));
                }
            }
            _ => {}
        }
    }
    parts
}

impl Converter for AnthropicToOpenAi {
    fn name(&self) -> &'static str {
        crate::convert::ANTHROPIC2OPENAI
    }

    fn convert_request(
        &self,
        request: ProxyRequest,
        channel: &Channel,
    ) -> Result<ProxyRequest, AppError> {
        let (url, path) = rewrite_url(
            &channel.url,
            &request.path,
            "/v1/messages",
            "/v1/chat/completions",
        );

        let mut headers = http::HeaderMap::new();
        apply_auth(&mut headers, "openai", &channel.api_key);

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
        // Model lists pass through untouched.
        if ctx.request_path.ends_with("/models") {
            return Ok(body.to_vec());
        }

        let data = parse_json(body)?;
        if data.get("error").is_some() {
            self.stats.update(&ctx.channel_name, false, 0, 0);
            return Ok(body.to_vec());
        }

        let mut content: Vec<Value> = Vec::new();
        let choice = &data["choices"][0];
        let message = &choice["message"];

        if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in tool_calls {
                let function = &call["function"];
                let arguments = function["arguments"].as_str().unwrap_or("{}");
                let input: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
                content.push(json!({
                    "type": "tool_use",
                    "id": call["id"].as_str().unwrap_or_default(),
                    "name": function["name"].as_str().unwrap_or_default(),
                    "input": input,
                }));
            }
        }

        if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
            content.push(json!({"type": "thinking", "thinking": reasoning}));
        }

        if let Some(text) = message.get("content").and_then(Value::as_str) {
            extract_thinking_blocks(text, &mut content);
        }

        let finish = choice["finish_reason"].as_str().unwrap_or("stop");
        let mut result = json!({
            "id": data["id"].as_str().unwrap_or("msg_openai"),
            "type": "message",
            "role": "assistant",
            "content": content,
            "model": ctx.original_model,
            "stop_reason": openai_finish_to_anthropic(finish),
            "usage": {},
        });

        let input_tokens = data.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = data
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        result["usage"] = json!({"input_tokens": input_tokens, "output_tokens": output_tokens});

        self.stats
            .update(&ctx.channel_name, true, input_tokens, output_tokens);

        Ok(serde_json::to_vec(&result)?)
    }

    fn stream_rewriter(&self, ctx: &ConvertContext) -> Box<dyn StreamRewriter> {
        Box::new(OpenAiToAnthropicEvents::new(&ctx.original_model))
    }
}

/// Split inline `<thinking>...</thinking>` segments into thinking blocks,
/// keeping surrounding prose as text blocks in textual order.
fn extract_thinking_blocks(text: &str, content: &mut Vec<Value>) {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"(?s)<thinking>\s*(.*?)\s*</thinking>").unwrap());

    let mut last = 0;
    let mut found = false;
    for captures in pattern.captures_iter(text) {
        found = true;
        let whole = captures.get(0).unwrap();
        let before = text[last..whole.start()].trim();
        if !before.is_empty() {
            content.push(json!({"type": "text", "text": before}));
        }
        let thinking = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if !thinking.is_empty() {
            content.push(json!({"type": "thinking", "thinking": thinking}));
        }
        last = whole.end();
    }

    if !found {
        content.push(json!({"type": "text", "text": text}));
        return;
    }
    let after = text[last..].trim();
    if !after.is_empty() {
        content.push(json!({"type": "text", "text": after}));
    }
}

/// State machine converting OpenAI chunk deltas into the Anthropic event
/// stream. Index 0 is reserved for the thinking block; text and tool blocks
/// take strictly increasing indices from 1, never reused.
struct OpenAiToAnthropicEvents {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    thinking_open: bool,
    content_open: bool,
    content_index: usize,
    next_index: usize,
    tool_blocks: HashMap<u64, usize>,
    saw_chunk: bool,
}

impl OpenAiToAnthropicEvents {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", unix_now()),
            started: false,
            finished: false,
            thinking_open: false,
            content_open: false,
            content_index: 0,
            next_index: 1,
            tool_blocks: HashMap::new(),
            saw_chunk: false,
        }
    }

    fn event(name: &str, payload: Value) -> String {
        format!("event: {}\ndata: {}\n\n", name, payload)
    }

    fn message_stop(&mut self) -> String {
        self.finished = true;
        Self::event("message_stop", json!({"type": "message_stop"}))
    }
}

impl StreamRewriter for OpenAiToAnthropicEvents {
    fn on_event(&mut self, data: &str) -> Vec<String> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            if self.finished {
                return Vec::new();
            }
            return vec![self.message_stop()];
        }

        let parsed: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        let choice = match parsed.pointer("/choices/0") {
            Some(choice) => choice,
            None => return Vec::new(),
        };
        self.saw_chunk = true;

        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(Self::event(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                }),
            ));
        }

        let delta = &choice["delta"];

        if let Some(thinking) = delta.get("reasoning_content").and_then(Value::as_str) {
            if !self.thinking_open {
                self.thinking_open = true;
                events.push(Self::event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": {"type": "thinking", "thinking": ""},
                    }),
                ));
            }
            events.push(Self::event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "thinking_delta", "thinking": thinking},
                }),
            ));
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !self.content_open {
                if self.thinking_open {
                    self.thinking_open = false;
                    events.push(Self::event(
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": 0}),
                    ));
                }
                self.content_open = true;
                self.content_index = self.next_index;
                self.next_index += 1;
                events.push(Self::event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.content_index,
                        "content_block": {"type": "text", "text": ""},
                    }),
                ));
            }
            events.push(Self::event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": self.content_index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            ));
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in tool_calls {
                let call_index = call["index"].as_u64().unwrap_or(0);
                if !self.tool_blocks.contains_key(&call_index) {
                    let block_index = self.next_index;
                    self.next_index += 1;
                    self.tool_blocks.insert(call_index, block_index);

                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| format!("call_{}_{}", unix_now(), call_index));
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| format!("tool_{}", call_index));

                    events.push(Self::event(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                        }),
                    ));
                }

                if let Some(arguments) = call.pointer("/function/arguments").and_then(Value::as_str)
                {
                    let fragment = clean_json_fragment(arguments);
                    if !fragment.is_empty() {
                        let block_index = self.tool_blocks[&call_index];
                        events.push(Self::event(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": {"type": "input_json_delta", "partial_json": fragment},
                            }),
                        ));
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            let mut tool_indices: Vec<usize> = self.tool_blocks.values().copied().collect();
            tool_indices.sort_unstable();
            for block_index in tool_indices {
                events.push(Self::event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": block_index}),
                ));
            }
            if self.content_open {
                self.content_open = false;
                events.push(Self::event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": self.content_index}),
                ));
            }
            if self.thinking_open {
                self.thinking_open = false;
                events.push(Self::event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": 0}),
                ));
            }

            events.push(Self::event(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": openai_finish_to_anthropic(reason),
                        "stop_sequence": null,
                    },
                    "usage": {
                        "input_tokens": parsed.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                        "output_tokens": parsed.pointer("/usage/completion_tokens").and_then(Value::as_u64).unwrap_or(0),
                    },
                }),
            ));
            events.push(self.message_stop());
        }

        events
    }

    fn finish(&mut self) -> Vec<String> {
        if !self.saw_chunk {
            return vec![synthetic_error_chunk(&self.model)];
        }
        if !self.finished {
            return vec![self.message_stop()];
        }
        Vec::new()
    }
}
