use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use splicing_types::{Message, ProviderInfo, ToolCall, ToolSchema};

mod anthropic;
mod openai;
mod sse;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAICompatibleProvider;

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Connection settings for one provider. Field aliases accept the shape of
/// stored LLM settings (`apiKey`, `model`, `url`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "model")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Fields set in `other` win over fields set in `self`.
    pub fn overlay(&self, other: &ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            api_key: other.api_key.clone().or_else(|| self.api_key.clone()),
            url: other.url.clone().or_else(|| self.url.clone()),
            default_model: other
                .default_model
                .clone()
                .or_else(|| self.default_model.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Tools offered to the model for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolBinding {
    pub tools: Vec<ToolSchema>,
    pub parallel_tool_calls: bool,
}

impl ToolBinding {
    /// Binding that asks the model for at most one tool call per response.
    pub fn sequential(tools: Vec<ToolSchema>) -> Self {
        Self {
            tools,
            parallel_tool_calls: false,
        }
    }
}

/// A complete assistant response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Folds stream chunks into an [`AssistantTurn`]. Tool arguments arrive as
/// JSON text fragments and are parsed once the stream is complete.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    content: String,
    calls: Vec<(String, String, String)>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
}

impl TurnAccumulator {
    pub fn push(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta(text) => self.content.push_str(text),
            StreamChunk::ToolCallStart { id, name } => {
                if !self.calls.iter().any(|(call_id, _, _)| call_id == id) {
                    self.calls.push((id.clone(), name.clone(), String::new()));
                }
            }
            StreamChunk::ToolCallDelta { id, args_delta } => {
                if let Some((_, _, args)) =
                    self.calls.iter_mut().find(|(call_id, _, _)| call_id == id)
                {
                    args.push_str(args_delta);
                }
            }
            StreamChunk::ToolCallEnd { .. } => {}
            StreamChunk::Done {
                finish_reason,
                usage,
            } => {
                self.finish_reason = Some(finish_reason.clone());
                if usage.is_some() {
                    self.usage = usage.clone();
                }
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.content
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn finish(self) -> AssistantTurn {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(id, name, raw_args)| ToolCall {
                id,
                name,
                args: parse_tool_args(&raw_args),
            })
            .collect();
        AssistantTurn {
            content: self.content,
            tool_calls,
            usage: self.usage,
        }
    }
}

pub(crate) fn parse_tool_args(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn invoke(
        &self,
        messages: &[Message],
        binding: Option<&ToolBinding>,
    ) -> anyhow::Result<AssistantTurn>;

    /// Streams the response. The default implementation invokes the model and
    /// replays the finished turn as chunks.
    async fn stream(
        &self,
        messages: Vec<Message>,
        binding: Option<ToolBinding>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        if cancel.is_cancelled() {
            anyhow::bail!("provider stream cancelled before start");
        }
        let turn = self.invoke(&messages, binding.as_ref()).await?;
        Ok(Box::pin(futures::stream::iter(
            turn_to_chunks(turn).into_iter().map(Ok),
        )))
    }
}

pub fn turn_to_chunks(turn: AssistantTurn) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if !turn.content.is_empty() {
        chunks.push(StreamChunk::TextDelta(turn.content));
    }
    let finish_reason = if turn.tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };
    for call in turn.tool_calls {
        chunks.push(StreamChunk::ToolCallStart {
            id: call.id.clone(),
            name: call.name,
        });
        chunks.push(StreamChunk::ToolCallDelta {
            id: call.id.clone(),
            args_delta: call.args.to_string(),
        });
        chunks.push(StreamChunk::ToolCallEnd { id: call.id });
    }
    chunks.push(StreamChunk::Done {
        finish_reason: finish_reason.to_string(),
        usage: turn.usage,
    });
    chunks
}

struct RegisteredProvider {
    config: ProviderConfig,
    provider: Arc<dyn Provider>,
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<BTreeMap<String, RegisteredProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            providers: Arc::new(RwLock::new(build_providers(&config))),
        }
    }

    /// Returns the provider for `id` built from `config`, rebuilding it only
    /// when the configuration changed since the last call.
    pub async fn configure(
        &self,
        id: &str,
        config: ProviderConfig,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        if let Some(entry) = self.providers.read().await.get(id) {
            if entry.config == config {
                return Ok(entry.provider.clone());
            }
        }
        let provider = build_provider(id, &config)?;
        tracing::debug!(provider = id, "provider configured");
        self.providers.write().await.insert(
            id.to_string(),
            RegisteredProvider {
                config,
                provider: provider.clone(),
            },
        );
        Ok(provider)
    }
}

fn build_providers(config: &ProvidersConfig) -> BTreeMap<String, RegisteredProvider> {
    let mut providers = BTreeMap::new();
    for (id, entry) in &config.providers {
        match build_provider(id, entry) {
            Ok(provider) => {
                providers.insert(
                    id.clone(),
                    RegisteredProvider {
                        config: entry.clone(),
                        provider,
                    },
                );
            }
            Err(err) => tracing::warn!(provider = %id, "skipping provider: {err}"),
        }
    }
    providers
}

/// Builds the provider implementation for `id`. Unknown ids are treated as
/// OpenAI-compatible endpoints and must carry a `url`.
pub fn build_provider(id: &str, config: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
    let api_key = config
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(str::to_string)
        .or_else(|| env_api_key_for_provider(id));
    let model = config
        .default_model
        .clone()
        .filter(|model| !model.trim().is_empty());
    match id {
        "anthropic" => Ok(Arc::new(AnthropicProvider {
            api_key,
            base_url: normalize_plain_base(
                config.url.as_deref().unwrap_or("https://api.anthropic.com/v1"),
            ),
            default_model: model.unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        })),
        "openai" => Ok(Arc::new(OpenAICompatibleProvider {
            id: id.to_string(),
            name: "OpenAI".to_string(),
            base_url: normalize_base(config.url.as_deref().unwrap_or("https://api.openai.com/v1")),
            api_key,
            default_model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            client: Client::new(),
        })),
        other => {
            let Some(url) = config.url.as_deref() else {
                anyhow::bail!("provider `{other}` needs a url");
            };
            Ok(Arc::new(OpenAICompatibleProvider {
                id: other.to_string(),
                name: other.to_string(),
                base_url: normalize_base(url),
                api_key,
                default_model: model
                    .ok_or_else(|| anyhow::anyhow!("provider `{other}` needs a model"))?,
                client: Client::new(),
            }))
        }
    }
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => "OPENAI_API_KEY",
        "anthropic" => "ANTHROPIC_API_KEY",
        _ => return None,
    };
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub(crate) fn provider_api_key_env_hint(id: &str) -> &'static str {
    match id {
        "openai" => "OPENAI_API_KEY",
        "anthropic" => "ANTHROPIC_API_KEY",
        _ => "provider API key",
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    struct ScriptedProvider;

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                models: Vec::new(),
            }
        }

        async fn invoke(
            &self,
            _messages: &[Message],
            binding: Option<&ToolBinding>,
        ) -> anyhow::Result<AssistantTurn> {
            let tool_calls = binding
                .and_then(|binding| binding.tools.first())
                .map(|tool| ToolCall {
                    id: "call_1".to_string(),
                    name: tool.name.clone(),
                    args: json!({"note": "x"}),
                })
                .into_iter()
                .collect();
            Ok(AssistantTurn {
                content: "working on it".to_string(),
                tool_calls,
                usage: None,
            })
        }
    }

    fn cfg(ids: &[&str]) -> ProvidersConfig {
        let providers = ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    ProviderConfig {
                        api_key: Some("sk-test".to_string()),
                        url: None,
                        default_model: Some(format!("{id}-model")),
                    },
                )
            })
            .collect();
        ProvidersConfig { providers }
    }

    #[tokio::test]
    async fn configure_reuses_providers_built_at_startup() {
        let config = cfg(&["openai", "anthropic"]);
        let registry = ProviderRegistry::new(config.clone());
        let entry = config.providers["anthropic"].clone();
        let a = registry.configure("anthropic", entry.clone()).await.expect("a");
        let b = registry.configure("anthropic", entry).await.expect("b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.info().id, "anthropic");
        assert_eq!(a.info().models[0].id, "anthropic-model");
    }

    #[tokio::test]
    async fn configure_rebuilds_only_on_change() {
        let registry = ProviderRegistry::default();
        let first = ProviderConfig {
            api_key: Some("k1".to_string()),
            url: None,
            default_model: Some("gpt-4o".to_string()),
        };
        let a = registry.configure("openai", first.clone()).await.expect("a");
        let b = registry.configure("openai", first.clone()).await.expect("b");
        assert!(Arc::ptr_eq(&a, &b));

        let changed = ProviderConfig {
            default_model: Some("gpt-4.1".to_string()),
            ..first
        };
        let c = registry.configure("openai", changed).await.expect("c");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.info().models[0].id, "gpt-4.1");
    }

    #[test]
    fn custom_provider_requires_url() {
        let err = build_provider("local", &ProviderConfig::default())
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("needs a url"));
    }

    #[test]
    fn settings_shape_deserializes_into_provider_config() {
        let config: ProviderConfig =
            serde_json::from_value(json!({"apiKey": "sk-1", "model": "gpt-4o"}))
                .expect("config");
        assert_eq!(config.api_key.as_deref(), Some("sk-1"));
        assert_eq!(config.default_model.as_deref(), Some("gpt-4o"));

        let base = ProviderConfig {
            url: Some("http://proxy".to_string()),
            ..ProviderConfig::default()
        };
        let merged = base.overlay(&config);
        assert_eq!(merged.url.as_deref(), Some("http://proxy"));
        assert_eq!(merged.api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn accumulator_joins_argument_fragments() {
        let mut acc = TurnAccumulator::default();
        for chunk in [
            StreamChunk::TextDelta("Gen".to_string()),
            StreamChunk::TextDelta("erating".to_string()),
            StreamChunk::ToolCallStart {
                id: "call_1".to_string(),
                name: "generate_code".to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: "call_1".to_string(),
                args_delta: "{\"a\":".to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: "call_1".to_string(),
                args_delta: "1}".to_string(),
            },
            StreamChunk::ToolCallEnd {
                id: "call_1".to_string(),
            },
            StreamChunk::Done {
                finish_reason: "tool_calls".to_string(),
                usage: None,
            },
        ] {
            acc.push(&chunk);
        }
        assert_eq!(acc.finish_reason(), Some("tool_calls"));
        let turn = acc.finish();
        assert_eq!(turn.content, "Generating");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].args, json!({"a": 1}));
    }

    #[test]
    fn empty_tool_args_become_an_empty_object() {
        assert_eq!(parse_tool_args("  "), json!({}));
        assert_eq!(parse_tool_args("{oops"), json!("{oops"));
    }

    #[tokio::test]
    async fn default_stream_replays_the_invoked_turn() {
        let provider = ScriptedProvider;
        let binding = ToolBinding::sequential(vec![ToolSchema {
            name: "generate_code".to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }]);
        let mut stream = provider
            .stream(
                vec![Message::user("hi")],
                Some(binding),
                CancellationToken::new(),
            )
            .await
            .expect("stream");
        let mut acc = TurnAccumulator::default();
        while let Some(chunk) = stream.next().await {
            acc.push(&chunk.expect("chunk"));
        }
        let turn = acc.finish();
        assert_eq!(turn.content, "working on it");
        assert_eq!(turn.tool_calls[0].name, "generate_code");
        assert_eq!(turn.tool_calls[0].args, json!({"note": "x"}));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_error("héllo", 2), "h...");
        assert_eq!(truncate_for_error("short", 10), "short");
    }
}
