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
    parse_tool_args, provider_api_key_env_hint, truncate_for_error, AssistantTurn, ChunkStream,
    Provider, StreamChunk, TokenUsage, ToolBinding,
};

/// Chat-completions provider for OpenAI and compatible endpoints.
pub struct OpenAICompatibleProvider {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) default_model: String,
    pub(crate) client: Client,
}

impl OpenAICompatibleProvider {
    fn request_body(
        &self,
        messages: &[Message],
        binding: Option<&ToolBinding>,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.default_model,
            "messages": wire_messages(messages),
            "temperature": 0,
            "stream": stream,
        });
        if let Some(binding) = binding.filter(|binding| !binding.tools.is_empty()) {
            body["tools"] = Value::Array(
                binding
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.input_schema,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
            body["parallel_tool_calls"] = json!(binding.parallel_tool_calls);
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!(
                "provider authentication failed ({}) for `{}`. Verify the API key (set `{}` or store it in the LLM settings) and retry.",
                status,
                self.id,
                provider_api_key_env_hint(&self.id)
            );
        }
        anyhow::bail!(
            "provider request failed with status {}: {}",
            status,
            truncate_for_error(&text, 500)
        );
    }
}

pub(crate) fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message.role {
            MessageRole::Assistant if !message.tool_calls.is_empty() => {
                let content = if message.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(message.content.clone())
                };
                let tool_calls = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.args.to_string()},
                        })
                    })
                    .collect::<Vec<_>>();
                json!({"role": "assistant", "content": content, "tool_calls": tool_calls})
            }
            MessageRole::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content,
            }),
            MessageRole::User if message.hidden => json!({
                "role": "user",
                "name": "hidden",
                "content": message.content,
            }),
            role => json!({"role": role.as_str(), "content": message.content}),
        })
        .collect()
}

pub(crate) fn parse_completion(value: &Value) -> anyhow::Result<AssistantTurn> {
    if let Some(detail) = extract_openai_error(value) {
        anyhow::bail!(detail);
    }
    let Some(message) = value.pointer("/choices/0/message") else {
        anyhow::bail!(
            "provider returned no completion choices (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id").and_then(Value::as_str)?;
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(Value::as_str)?;
                    let args = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Some(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        args: parse_tool_args(args),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(AssistantTurn {
        content,
        tool_calls,
        usage: extract_usage(value),
    })
}

/// Translates one streamed completion payload into chunks. Tool-call deltas
/// after the first carry only an index, so ids are remembered per index.
pub(crate) fn stream_payload_chunks(
    value: &Value,
    call_ids: &mut HashMap<u64, String>,
) -> anyhow::Result<Vec<StreamChunk>> {
    if let Some(detail) = extract_openai_error(value) {
        anyhow::bail!(detail);
    }
    let mut chunks = Vec::new();
    let choices = value
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for choice in choices {
        let delta = choice.get("delta").cloned().unwrap_or_default();
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                chunks.push(StreamChunk::TextDelta(text.to_string()));
            }
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let function = call.get("function").cloned().unwrap_or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
                call_ids.insert(index, id.to_string());
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                chunks.push(StreamChunk::ToolCallStart {
                    id: id.to_string(),
                    name,
                });
            }
            let Some(id) = call_ids.get(&index).cloned() else {
                continue;
            };
            if let Some(args_delta) = function
                .get("arguments")
                .and_then(Value::as_str)
                .filter(|args| !args.is_empty())
            {
                chunks.push(StreamChunk::ToolCallDelta {
                    id,
                    args_delta: args_delta.to_string(),
                });
            }
        }
        if let Some(reason) = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .filter(|reason| !reason.is_empty())
        {
            let mut ended = call_ids.drain().collect::<Vec<_>>();
            ended.sort();
            for (_, id) in ended {
                chunks.push(StreamChunk::ToolCallEnd { id });
            }
            chunks.push(StreamChunk::Done {
                finish_reason: reason.to_string(),
                usage: extract_usage(value),
            });
        }
    }
    Ok(chunks)
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
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
        parse_completion(&value)
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
            let mut call_ids = HashMap::new();
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
                    if payload == "[DONE]" {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    for out in stream_payload_chunks(&value, &mut call_ids)? {
                        yield out;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolBinding;
    use splicing_types::ToolSchema;

    fn provider() -> OpenAICompatibleProvider {
        OpenAICompatibleProvider {
            id: "openai".to_string(),
            name: "OpenAI".to_string(),
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            default_model: "gpt-4o-mini".to_string(),
            client: Client::new(),
        }
    }

    #[test]
    fn bound_tools_are_sequential() {
        let binding = ToolBinding::sequential(vec![ToolSchema {
            name: "generate_code".to_string(),
            description: "Generate code".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }]);
        let body = provider().request_body(&[Message::user("hi")], Some(&binding), false);
        assert_eq!(body["parallel_tool_calls"], json!(false));
        assert_eq!(body["tools"][0]["function"]["name"], "generate_code");
        assert_eq!(body["temperature"], json!(0));

        let unbound = provider().request_body(&[Message::user("hi")], None, false);
        assert!(unbound.get("tools").is_none());
        assert!(unbound.get("parallel_tool_calls").is_none());
    }

    #[test]
    fn wire_messages_carry_tool_call_linkage() {
        let call = ToolCall {
            id: "call_9".to_string(),
            name: "generate_code".to_string(),
            args: json!({}),
        };
        let messages = vec![
            Message::system("sys"),
            Message::hidden_user("context"),
            Message::assistant("").with_tool_calls(vec![call]),
            Message::tool_result("call_9", "done"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["name"], "hidden");
        assert_eq!(wire[2]["content"], Value::Null);
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(wire[3]["tool_call_id"], "call_9");
    }

    #[test]
    fn completion_with_tool_call_is_parsed() {
        let value = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "generate_code", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        });
        let turn = parse_completion(&value).expect("turn");
        assert!(turn.content.is_empty());
        assert_eq!(turn.tool_calls[0].name, "generate_code");
        assert_eq!(turn.usage.expect("usage").total_tokens, 12);
    }

    #[test]
    fn error_payload_is_reported() {
        let err = parse_completion(&json!({"error": {"message": "quota exceeded"}}))
            .expect_err("error");
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn streamed_tool_arguments_follow_the_call_index() {
        let mut ids = HashMap::new();
        let first = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "generate_code", "arguments": ""}}
        ]}}]});
        let second = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"x\":1}"}}
        ]}}]});
        let last = json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]});

        let mut chunks = stream_payload_chunks(&first, &mut ids).expect("first");
        chunks.extend(stream_payload_chunks(&second, &mut ids).expect("second"));
        chunks.extend(stream_payload_chunks(&last, &mut ids).expect("last"));

        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCallStart {
                    id: "call_1".to_string(),
                    name: "generate_code".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "call_1".to_string(),
                    args_delta: "{\"x\":1}".to_string()
                },
                StreamChunk::ToolCallEnd {
                    id: "call_1".to_string()
                },
                StreamChunk::Done {
                    finish_reason: "tool_calls".to_string(),
                    usage: None
                },
            ]
        );
    }
}
