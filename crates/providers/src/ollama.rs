//! Ollama-native adapter.
//!
//! Speaks Ollama's own `/api/chat`, `/api/generate`, and `/api/embed`
//! dialect rather than the OpenAI-compatible shim Ollama also exposes, so
//! we get native streaming (`message.content` deltas, line-delimited JSON)
//! and the `message.thinking` field some models expose for their reasoning
//! trace.

use crate::ndjson::ndjson_response_stream;
use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::from_reqwest;
use jarvis_domain::capability::LlmCapabilities;
use jarvis_domain::config::{AuthMode, ProviderConfig};
use jarvis_domain::error::{Error, Result};
use jarvis_domain::stream::{BoxStream, StreamEvent, Usage};
use jarvis_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OllamaProvider {
    id: String,
    base_url: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    /// Set when `auth.mode == ApiKey` — most local Ollama installs run with
    /// no auth at all, but some deployments sit behind a reverse proxy.
    auth_header: Option<(String, String)>,
}

impl OllamaProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "llama3.1".into());

        let capabilities = LlmCapabilities {
            supports_tools: jarvis_domain::capability::ToolSupport::Basic,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: false,
            context_window_tokens: Some(128_000),
            max_output_tokens: None,
        };

        let auth_header = if cfg.auth.mode == AuthMode::ApiKey {
            let key = crate::util::resolve_api_key(&cfg.auth)?;
            let header = cfg.auth.header.clone().unwrap_or_else(|| "Authorization".into());
            let prefix = cfg.auth.prefix.clone().unwrap_or_else(|| "Bearer ".into());
            Some((header, format!("{prefix}{key}")))
        } else {
            None
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            default_model,
            capabilities,
            client,
            auth_header,
        })
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        if let Some((header, value)) = &self.auth_header {
            builder = builder.header(header, value);
        }
        builder
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_ollama).collect();
        let model = self.effective_model(req);

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_ollama).collect();
            body["tools"] = Value::Array(tools);
        }
        if req.json_mode {
            body["format"] = Value::String("json".into());
        }

        let mut options = serde_json::Map::new();
        if let Some(temp) = req.temperature {
            options.insert("temperature".into(), serde_json::json!(temp));
        }
        if let Some(max) = req.max_tokens {
            options.insert("num_predict".into(), serde_json::json!(max));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_ollama(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_ollama(msg),
        Role::Assistant => assistant_to_ollama(msg),
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_ollama(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { name, input, .. } => {
                        tool_calls.push(serde_json::json!({
                            "function": { "name": name, "arguments": input }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    obj["content"] = Value::String(text_parts.join("\n"));
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_ollama(msg: &Message) -> Value {
    let text = msg.content.extract_all_text();
    serde_json::json!({ "role": "tool", "content": text })
}

fn tool_to_ollama(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_ollama_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let arguments = func.get("arguments").cloned().unwrap_or(Value::Null);
            Some(ToolCall {
                call_id: format!("ollama-{i}"),
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_ollama_usage(v: &Value) -> Option<Usage> {
    let prompt_tokens = v.get("prompt_eval_count")?.as_u64()? as u32;
    let completion_tokens = v.get("eval_count")?.as_u64()? as u32;
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

fn parse_chat_response(body: &Value, model: &str) -> Result<ChatResponse> {
    let message = body.get("message").ok_or_else(|| Error::Provider {
        provider: "ollama".into(),
        message: "no 'message' field in response".into(),
    })?;

    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let tool_calls = parse_ollama_tool_calls(message);
    let usage = parse_ollama_usage(body);
    let finish_reason = if body.get("done").and_then(|v| v.as_bool()).unwrap_or(true) {
        Some("stop".to_string())
    } else {
        None
    };

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NDJSON streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_ndjson_line(line: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let mut events = Vec::new();
    let message = v.get("message");

    if let Some(thinking) = message.and_then(|m| m.get("thinking")).and_then(|t| t.as_str()) {
        if !thinking.is_empty() {
            events.push(Ok(StreamEvent::Thinking { text: thinking.to_string() }));
        }
    }

    if let Some(text) = message.and_then(|m| m.get("content")).and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token { text: text.to_string() }));
        }
    }

    if let Some(message) = message {
        let calls = parse_ollama_tool_calls(message);
        for call in calls {
            events.push(Ok(StreamEvent::ToolCallStarted {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
            }));
            events.push(Ok(StreamEvent::ToolCallDelta {
                call_id: call.call_id.clone(),
                delta: call.arguments.to_string(),
            }));
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id: call.call_id,
                tool_name: call.tool_name,
                arguments: call.arguments,
            }));
        }
    }

    if v.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        events.push(Ok(StreamEvent::Done {
            usage: parse_ollama_usage(&v),
            finish_reason: v
                .get("done_reason")
                .and_then(|r| r.as_str())
                .map(String::from)
                .or_else(|| Some("stop".into())),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let model = self.effective_model(req);
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, url = %url, model = %model, "ollama chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json, &model)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_chat_body(req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "ollama stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: provider_id,
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        Ok(ndjson_response_stream(resp, parse_ndjson_line))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "nomic-embed-text".into());
        let url = format!("{}/api/embed", self.base_url);
        let body = serde_json::json!({ "model": model, "input": req.input });

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let embeddings: Vec<Vec<f32>> = resp_json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|vec| {
                        vec.as_array()
                            .map(|inner| inner.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(EmbeddingsResponse { embeddings })
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_response_extracts_content_and_usage() {
        let body = serde_json::json!({
            "model": "llama3.1",
            "message": { "role": "assistant", "content": "hi there" },
            "done": true,
            "prompt_eval_count": 10,
            "eval_count": 5
        });
        let resp = parse_chat_response(&body, "llama3.1").unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_chat_response_missing_message_errors() {
        let body = serde_json::json!({ "done": true });
        assert!(parse_chat_response(&body, "llama3.1").is_err());
    }

    #[test]
    fn parse_ndjson_line_emits_token() {
        let line = r#"{"message":{"role":"assistant","content":"hel"},"done":false}"#;
        let events = parse_ndjson_line(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Token { .. })));
    }

    #[test]
    fn parse_ndjson_line_emits_thinking() {
        let line = r#"{"message":{"role":"assistant","content":"","thinking":"pondering"},"done":false}"#;
        let events = parse_ndjson_line(line);
        assert!(matches!(events[0], Ok(StreamEvent::Thinking { .. })));
    }

    #[test]
    fn parse_ndjson_line_done_emits_usage() {
        let line = r#"{"done":true,"prompt_eval_count":3,"eval_count":2,"done_reason":"stop"}"#;
        let events = parse_ndjson_line(line);
        let last = events.last().unwrap();
        assert!(matches!(last, Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn parse_ndjson_line_with_tool_call() {
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"search","arguments":{"q":"rust"}}}]},"done":false}"#;
        let events = parse_ndjson_line(line);
        assert!(events.iter().any(|e| matches!(e, Ok(StreamEvent::ToolCallStarted { tool_name, .. }) if tool_name == "search")));
    }
}
