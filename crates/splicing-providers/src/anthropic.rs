use std::collections::HashMap;
use std::str;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use splicing_types::{Message, MessageRole, ModelInfo, ProviderInfo, ToolCall};

use crate::sse::drain_data_payloads;
use crate::{
    provider_api_key_env_hint, truncate_for_error, AssistantTurn, ChunkStream, Provider,
    StreamChunk, TokenUsage, ToolBinding,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    pub(crate) api_key: Option<String>,
    pub(crate) base_url: String,
    pub(crate) default_model: String,
    pub(crate) client: Client,
}

impl AnthropicProvider {
    fn request_body(
        &self,
        messages: &[Message],
        binding: Option<&ToolBinding>,
        stream: bool,
    ) -> Value {
        let (system, wire) = wire_messages(messages);
        let mut body = json!({
            "model": self.default_model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0,
            "messages": wire,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(binding) = binding.filter(|binding| !binding.tools.is_empty()) {
            body["tools"] = Value::Array(
                binding
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.input_schema,
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!({
                "type": "auto",
                "disable_parallel_tool_use": !binding.parallel_tool_calls,
            });
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!(
                "provider authentication failed ({}) for `anthropic`. Verify the API key (set `{}` or store it in the LLM settings) and retry.",
                status,
                provider_api_key_env_hint("anthropic")
            );
        }
        anyhow::bail!(
            "provider request failed with status {}: {}",
            status,
            truncate_for_error(&text, 500)
        );
    }
}

/// Splits system prompts out of the thread and converts the rest into content
/// blocks. Consecutive messages that map to the same role are merged, since
/// the API requires alternating roles.
pub(crate) fn wire_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system = Vec::new();
    let mut wire: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in messages {
        let (role, blocks) = match message.role {
            MessageRole::System => {
                system.push(message.content.clone());
                continue;
            }
            MessageRole::User => ("user", vec![text_block(&message.content)]),
            MessageRole::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(text_block(&message.content));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.args,
                    }));
                }
                ("assistant", blocks)
            }
            MessageRole::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                })],
            ),
        };
        if blocks.is_empty() {
            continue;
        }
        match wire.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => {
                last_blocks.extend(blocks);
                continue;
            }
            _ => {}
        }
        wire.push((role, blocks));
    }
    let wire = wire
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system.join("\n\n"), wire)
}

fn text_block(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

pub(crate) fn parse_message(value: &Value) -> anyhow::Result<AssistantTurn> {
    if let Some(detail) = value.pointer("/error/message").and_then(Value::as_str) {
        anyhow::bail!(detail.to_string());
    }
    let Some(blocks) = value.get("content").and_then(Value::as_array) else {
        anyhow::bail!(
            "provider returned no message content (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let mut turn = AssistantTurn::default();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                turn.content
                    .push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
            }
            Some("tool_use") => turn.tool_calls.push(ToolCall {
                id: block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                args: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => {}
        }
    }
    turn.usage = extract_usage(value.get("usage"));
    Ok(turn)
}

/// Translates one streamed event into chunks. Tool blocks are tracked by
/// content-block index between start, delta and stop events.
pub(crate) fn stream_event_chunks(
    value: &Value,
    tool_blocks: &mut HashMap<u64, String>,
) -> anyhow::Result<Vec<StreamChunk>> {
    let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
    let mut chunks = Vec::new();
    match value.get("type").and_then(Value::as_str).unwrap_or_default() {
        "error" => {
            let detail = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("provider stream error");
            anyhow::bail!(detail.to_string());
        }
        "content_block_start" => {
            let block = value.get("content_block").cloned().unwrap_or_default();
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                tool_blocks.insert(index, id.clone());
                chunks.push(StreamChunk::ToolCallStart { id, name });
            }
        }
        "content_block_delta" => {
            let delta = value.get("delta").cloned().unwrap_or_default();
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        chunks.push(StreamChunk::TextDelta(text.to_string()));
                    }
                }
                Some("input_json_delta") => {
                    let partial = delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if let (Some(id), false) = (tool_blocks.get(&index), partial.is_empty()) {
                        chunks.push(StreamChunk::ToolCallDelta {
                            id: id.clone(),
                            args_delta: partial.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            if let Some(id) = tool_blocks.remove(&index) {
                chunks.push(StreamChunk::ToolCallEnd { id });
            }
        }
        "message_delta" => {
            if let Some(reason) = value.pointer("/delta/stop_reason").and_then(Value::as_str) {
                let finish_reason = if reason == "tool_use" {
                    "tool_calls"
                } else {
                    reason
                };
                chunks.push(StreamChunk::Done {
                    finish_reason: finish_reason.to_string(),
                    usage: extract_usage(value.get("usage")),
                });
            }
        }
        _ => {}
    }
    Ok(chunks)
}

fn extract_usage(usage: Option<&Value>) -> Option<TokenUsage> {
    let usage = usage?;
    let prompt_tokens = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: "anthropic".to_string(),
                display_name: self.default_model.clone(),
                context_window: 200_000,
            }],
        }
    }

    async fn invoke(
        &self,
        messages: &[Message],
        binding: Option<&ToolBinding>,
    ) -> anyhow::Result<AssistantTurn> {
        let body = self.request_body(messages, binding, false);
        let value: Value = self.send(&body).await?.json().await?;
        parse_message(&value)
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        binding: Option<ToolBinding>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let body = self.request_body(&messages, binding.as_ref(), true);
        let resp = self.send(&body).await?;
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut tool_blocks = HashMap::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());
                for payload in drain_data_payloads(&mut buffer) {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    for out in stream_event_chunks(&value, &mut tool_blocks)? {
                        yield out;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
