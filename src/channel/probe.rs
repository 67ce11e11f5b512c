//! Provider-native model listing and channel health probes.

use serde_json::Value;

use crate::channel::Channel;
use crate::error::AppError;
use crate::statistics::StatsManager;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROBE_PROMPT: &str = "Who are you?";

fn join_url(base: &str, v1_path: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, v1_path.trim_start_matches('/').trim_start_matches("v1/"))
    } else {
        format!("{}{}", base, v1_path)
    }
}

fn gemini_join(base: &str, path: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, path.trim_start_matches('/'))
    } else {
        format!("{}{}", base, path)
    }
}

async fn read_ok_json(response: reqwest::Response) -> Result<Value, AppError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::UpstreamNon2xx {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

fn collect_ids(data: &Value, list_key: &str, id_key: &str) -> Vec<String> {
    data.get(list_key)
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get(id_key).and_then(Value::as_str))
                .map(|id| id.trim_start_matches("models/").to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Fetch the provider's model-list endpoint for this channel.
pub async fn fetch_models(
    client: &reqwest::Client,
    channel: &Channel,
) -> Result<Vec<String>, AppError> {
    let models = match channel.provider.as_str() {
        "anthropic" => {
            let url = join_url(&channel.url, "/v1/models");
            let response = client
                .get(url.as_str())
                .header("x-api-key", &channel.api_key)
                .header("Authorization", format!("Bearer {}", channel.api_key))
                .header("anthropic-version", ANTHROPIC_VERSION)
                .send()
                .await?;
            collect_ids(&read_ok_json(response).await?, "data", "id")
        }
        "openai" => {
            let url = join_url(&channel.url, "/v1/models");
            let response = client
                .get(url.as_str())
                .header("Authorization", format!("Bearer {}", channel.api_key))
                .send()
                .await?;
            collect_ids(&read_ok_json(response).await?, "data", "id")
        }
        "gemini" => {
            let url = format!(
                "{}?key={}",
                gemini_join(&channel.url, "/v1beta/models"),
                channel.api_key
            );
            let response = client
                .get(url.as_str())
                .header("x-goog-api-key", &channel.api_key)
                .send()
                .await?;
            collect_ids(&read_ok_json(response).await?, "models", "name")
        }
        other => {
            return Err(AppError::ConverterMissing(format!(
                "no model-list endpoint for provider {}",
                other
            )))
        }
    };

    log::info!(
        "fetched model list channel={} count={}",
        channel.name,
        models.len()
    );
    Ok(models)
}

/// Issue the minimal "who are you" probe in the channel's native dialect.
/// Token usage from a successful probe is recorded in statistics.
pub async fn test_channel(
    client: &reqwest::Client,
    channel: &Channel,
    stats: &StatsManager,
) -> Result<String, AppError> {
    let model = if !channel.test_model.is_empty() {
        channel.test_model.clone()
    } else if let Some(first) = channel.models.first() {
        first.clone()
    } else {
        return Err(AppError::EntityNotFound(format!(
            "channel {} has no models to test with",
            channel.name
        )));
    };

    let (data, input_key, output_key, text) = match channel.provider.as_str() {
        "anthropic" => {
            let url = join_url(&channel.url, "/v1/messages");
            let body = serde_json::json!({
                "model": model,
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": PROBE_PROMPT}],
            });
            let response = client
                .post(url.as_str())
                .header("x-api-key", &channel.api_key)
                .header("Authorization", format!("Bearer {}", channel.api_key))
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await?;
            let data = read_ok_json(response).await?;
            let text = data["content"][0]["text"].as_str().unwrap_or_default().to_string();
            (data, "/usage/input_tokens", "/usage/output_tokens", text)
        }
        "openai" => {
            let url = join_url(&channel.url, "/v1/chat/completions");
            let body = serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": PROBE_PROMPT}],
            });
            let response = client
                .post(url.as_str())
                .header("Authorization", format!("Bearer {}", channel.api_key))
                .json(&body)
                .send()
                .await?;
            let data = read_ok_json(response).await?;
            let text = data["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            (data, "/usage/prompt_tokens", "/usage/completion_tokens", text)
        }
        "gemini" => {
            let url = gemini_join(
                &channel.url,
                &format!("/v1beta/models/{}:generateContent", model),
            );
            let body = serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": PROBE_PROMPT}]}],
            });
            let response = client
                .post(url.as_str())
                .header("x-goog-api-key", &channel.api_key)
                .json(&body)
                .send()
                .await?;
            let data = read_ok_json(response).await?;
            let text = data["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            (
                data,
                "/usageMetadata/promptTokenCount",
                "/usageMetadata/candidatesTokenCount",
                text,
            )
        }
        other => {
            return Err(AppError::ConverterMissing(format!(
                "no probe for provider {}",
                other
            )))
        }
    };

    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream reported an error")
            .to_string();
        stats.update(&channel.name, false, 0, 0);
        return Err(AppError::UpstreamTransport(message));
    }

    let input = data.pointer(input_key).and_then(Value::as_u64).unwrap_or(0);
    let output = data.pointer(output_key).and_then(Value::as_u64).unwrap_or(0);
    stats.update(&channel.name, true, input, output);

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_respects_trailing_slash() {
        assert_eq!(
            join_url("https://api.openai.com", "/v1/models"),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            join_url("https://relay.example.com/v1/", "/v1/models"),
            "https://relay.example.com/v1/models"
        );
        assert_eq!(
            gemini_join("https://generativelanguage.googleapis.com", "/v1beta/models"),
            "https://generativelanguage.googleapis.com/v1beta/models"
        );
    }

    #[test]
    fn gemini_model_names_are_stripped() {
        let data = serde_json::json!({
            "models": [
                {"name": "models/gemini-2.0-flash"},
                {"name": "models/gemini-2.5-pro"},
            ]
        });
        let ids = collect_ids(&data, "models", "name");
        assert_eq!(ids, vec!["gemini-2.0-flash", "gemini-2.5-pro"]);
    }

    #[test]
    fn openai_model_ids_are_collected() {
        let data = serde_json::json!({"data": [{"id": "gpt-4o"}, {"id": "o3-mini"}]});
        assert_eq!(collect_ids(&data, "data", "id"), vec!["gpt-4o", "o3-mini"]);
    }
}
