//! Two-node conversation graph (Chat, Tool) checkpointed per thread.
//!
//! A thread's state lives in one store scalar, so every transition is a
//! single write and a restarted process resumes at the last completed one.
//! The graph pauses before entering Tool; callers inspect the pending call
//! and either resume with `invoke(None)` or rewrite the pending message with
//! `update_state`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use splicing_observability::{emit_event, ObservabilityEvent, ProcessKind};
use splicing_providers::{Provider, StreamChunk, ToolBinding, TurnAccumulator};
use splicing_store::{KeyedStore, KeyedStoreExt, ProjectPath};
use splicing_tools::{validate_tool_schemas, ToolContext, ToolRegistry};
use splicing_types::{Message, MessageRole, ToolCall, TranscriptEntry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::error::TurnCancelled;

pub const NOT_EXECUTED_TOOL_RESULT: &str =
    "Tool call was not executed because the conversation moved on.";
const SKIPPED_TOOL_RESULT: &str = "Tool call was skipped: only one tool call runs per step.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node {
    Chat,
    Tool,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Node::Chat => "chat",
            Node::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub step: u64,
    pub messages: Vec<Message>,
    pub next: Option<Node>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            step: 0,
            messages: Vec::new(),
            next: None,
            updated_at: Utc::now(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// True when the graph stopped before running a requested tool.
    pub fn is_interrupted(&self) -> bool {
        self.next == Some(Node::Tool)
    }

    /// The call Tool would run next, when interrupted.
    pub fn pending_tool_call(&self) -> Option<&ToolCall> {
        if !self.is_interrupted() {
            return None;
        }
        self.last_message().and_then(Message::first_tool_call)
    }

    /// Visible user and assistant messages, in order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.messages
            .iter()
            .filter(|message| message.is_visible() && message.role != MessageRole::System)
            .map(TranscriptEntry::from)
            .collect()
    }

    /// Messages whose id already exists replace that message in place; the
    /// rest are appended in order.
    pub fn merge_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            match self
                .messages
                .iter_mut()
                .find(|existing| existing.id == message.id)
            {
                Some(existing) => *existing = message,
                None => self.messages.push(message),
            }
        }
    }
}

pub async fn load_checkpoint(
    store: &dyn KeyedStore,
    thread_id: &str,
) -> anyhow::Result<Option<Checkpoint>> {
    let key = ProjectPath::new(thread_id)?.thread();
    Ok(store.get_json(&key).await?)
}

/// Text emitted while a graph runs, tagged with the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphDelta {
    pub node: Node,
    pub content: String,
}

enum Drive<'a> {
    Invoke,
    Stream {
        sink: &'a mpsc::Sender<GraphDelta>,
        cancel: &'a CancellationToken,
    },
}

impl Drive<'_> {
    fn cancelled(&self) -> bool {
        matches!(self, Drive::Stream { cancel, .. } if cancel.is_cancelled())
    }
}

/// One thread's graph, bound to a provider and (optionally) a tool set.
pub struct ConversationGraph {
    store: Arc<dyn KeyedStore>,
    provider: Option<Arc<dyn Provider>>,
    tools: ToolRegistry,
    binding: Option<ToolBinding>,
    context: ToolContext,
}

impl ConversationGraph {
    /// A graph without tools: Chat always ends the run.
    pub fn new(
        store: Arc<dyn KeyedStore>,
        provider: Arc<dyn Provider>,
        context: ToolContext,
    ) -> Self {
        Self {
            store,
            provider: Some(provider),
            tools: ToolRegistry::new(),
            binding: None,
            context,
        }
    }

    /// A graph that can read and rewrite its thread but never calls a model.
    pub fn detached(store: Arc<dyn KeyedStore>, context: ToolContext) -> Self {
        Self {
            store,
            provider: None,
            tools: ToolRegistry::new(),
            binding: None,
            context,
        }
    }

    /// Binds every tool in `tools` in sequential mode. An empty registry
    /// leaves the graph unbound.
    pub async fn with_tools(mut self, tools: ToolRegistry) -> anyhow::Result<Self> {
        let schemas = tools.list().await;
        validate_tool_schemas(&schemas)?;
        self.binding = (!schemas.is_empty()).then(|| ToolBinding::sequential(schemas));
        self.tools = tools;
        Ok(self)
    }

    pub fn thread_id(&self) -> &str {
        &self.context.project_id
    }

    pub fn tools_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Current checkpoint, or an empty one for a new thread.
    pub async fn state(&self) -> anyhow::Result<Checkpoint> {
        Ok(load_checkpoint(self.store.as_ref(), self.thread_id())
            .await?
            .unwrap_or_else(|| Checkpoint::new(self.thread_id())))
    }

    /// Merges `messages` into the thread and routes as if `as_node` had just
    /// produced them.
    pub async fn update_state(
        &self,
        messages: Vec<Message>,
        as_node: Node,
    ) -> anyhow::Result<Checkpoint> {
        let mut checkpoint = self.state().await?;
        let replaces_pending = checkpoint
            .last_message()
            .is_some_and(|last| messages.iter().any(|message| message.id == last.id));
        if as_node == Node::Chat && !replaces_pending {
            close_dangling_calls(&mut checkpoint);
        }
        checkpoint.merge_messages(messages);
        checkpoint.next = match as_node {
            Node::Chat => self.route_after_chat(&checkpoint),
            Node::Tool => Some(Node::Chat),
        };
        self.commit(&mut checkpoint).await?;
        Ok(checkpoint)
    }

    /// `Some(input)` starts a new run from Chat. `None` resumes from the
    /// checkpoint, running a pending tool call first.
    pub async fn invoke(&self, input: Option<Message>) -> anyhow::Result<Checkpoint> {
        self.run(input, Drive::Invoke).await
    }

    /// Like [`ConversationGraph::invoke`], forwarding text to `sink` as it
    /// arrives. A cancelled run keeps the last completed transition only.
    pub async fn stream(
        &self,
        input: Option<Message>,
        sink: mpsc::Sender<GraphDelta>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Checkpoint> {
        self.run(
            input,
            Drive::Stream {
                sink: &sink,
                cancel: &cancel,
            },
        )
        .await
    }

    pub async fn delete_thread(&self) -> anyhow::Result<bool> {
        let key = ProjectPath::new(self.thread_id())?.thread();
        Ok(self.store.delete_scalar(&key).await?)
    }

    async fn run(&self, input: Option<Message>, drive: Drive<'_>) -> anyhow::Result<Checkpoint> {
        let mut checkpoint = self.state().await?;
        let mut resume_tool = false;
        match input {
            Some(message) => {
                close_dangling_calls(&mut checkpoint);
                checkpoint.messages.push(message);
                checkpoint.next = Some(Node::Chat);
                self.commit(&mut checkpoint).await?;
            }
            None => resume_tool = checkpoint.is_interrupted(),
        }

        loop {
            match checkpoint.next {
                None => break,
                Some(Node::Tool) if !resume_tool => {
                    tracing::debug!(thread_id = self.thread_id(), "interrupted before tool");
                    break;
                }
                Some(Node::Tool) => {
                    resume_tool = false;
                    let results = self.run_tool(&checkpoint, &drive).await?;
                    checkpoint.messages.extend(results);
                    checkpoint.next = Some(Node::Chat);
                }
                Some(Node::Chat) => {
                    let message = self.run_chat(&checkpoint, &drive).await?;
                    checkpoint.messages.push(message);
                    checkpoint.next = self.route_after_chat(&checkpoint);
                }
            }
            self.commit(&mut checkpoint).await?;
        }
        Ok(checkpoint)
    }

    async fn run_chat(&self, checkpoint: &Checkpoint, drive: &Drive<'_>) -> anyhow::Result<Message> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            anyhow::anyhow!("thread `{}` has no model provider bound", self.thread_id())
        })?;
        let provider_id = provider.info().id;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.start",
                component: "conversation.graph",
                project_id: Some(self.thread_id()),
                provider_id: Some(&provider_id),
                status: Some("start"),
                ..Default::default()
            },
        );
        let turn = match drive {
            Drive::Invoke => {
                provider
                    .invoke(&checkpoint.messages, self.binding.as_ref())
                    .await?
            }
            Drive::Stream { sink, cancel } => {
                if cancel.is_cancelled() {
                    return Err(self.cancelled());
                }
                let mut stream = provider
                    .stream(
                        checkpoint.messages.clone(),
                        self.binding.clone(),
                        (*cancel).clone(),
                    )
                    .await?;
                let mut accumulator = TurnAccumulator::default();
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Err(self.cancelled()),
                        next = stream.next() => next,
                    };
                    let Some(chunk) = next else {
                        break;
                    };
                    let chunk = chunk?;
                    if let StreamChunk::TextDelta(text) = &chunk {
                        let _ = sink
                            .send(GraphDelta {
                                node: Node::Chat,
                                content: text.clone(),
                            })
                            .await;
                    }
                    accumulator.push(&chunk);
                }
                accumulator.finish()
            }
        };
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.finish",
                component: "conversation.graph",
                project_id: Some(self.thread_id()),
                provider_id: Some(&provider_id),
                status: Some(if turn.tool_calls.is_empty() {
                    "stop"
                } else {
                    "tool_calls"
                }),
                ..Default::default()
            },
        );
        Ok(Message::assistant(turn.content).with_tool_calls(turn.tool_calls))
    }

    /// Runs the first requested call. Any further calls in the same message
    /// get a skipped result so the thread stays well formed.
    async fn run_tool(
        &self,
        checkpoint: &Checkpoint,
        drive: &Drive<'_>,
    ) -> anyhow::Result<Vec<Message>> {
        let calls = checkpoint
            .last_message()
            .filter(|message| message.requests_tools())
            .map(|message| message.tool_calls.clone())
            .unwrap_or_default();
        let Some((call, rest)) = calls.split_first() else {
            return Ok(Vec::new());
        };
        tracing::info!(
            thread_id = self.thread_id(),
            tool = %call.name,
            "running tool call"
        );
        let outcome = match drive {
            Drive::Invoke => {
                self.tools
                    .execute(&call.name, call.args.clone(), &self.context)
                    .await
            }
            Drive::Stream { cancel, .. } => {
                self.tools
                    .execute_with_cancel(
                        &call.name,
                        call.args.clone(),
                        &self.context,
                        (*cancel).clone(),
                    )
                    .await
            }
        };
        if drive.cancelled() {
            return Err(self.cancelled());
        }
        let output = match outcome {
            Ok(result) => result.output,
            Err(err) => {
                tracing::warn!(tool = %call.name, "tool call failed: {err:#}");
                format!("Error: {err:#}")
            }
        };
        if let Drive::Stream { sink, .. } = drive {
            let _ = sink
                .send(GraphDelta {
                    node: Node::Tool,
                    content: output.clone(),
                })
                .await;
        }
        let mut results = vec![Message::tool_result(&call.id, output)];
        results.extend(
            rest.iter()
                .map(|skipped| Message::tool_result(&skipped.id, SKIPPED_TOOL_RESULT)),
        );
        Ok(results)
    }

    fn route_after_chat(&self, checkpoint: &Checkpoint) -> Option<Node> {
        let requests_tools = checkpoint
            .last_message()
            .is_some_and(Message::requests_tools);
        (self.tools_bound() && requests_tools).then_some(Node::Tool)
    }

    async fn commit(&self, checkpoint: &mut Checkpoint) -> anyhow::Result<()> {
        checkpoint.step += 1;
        checkpoint.updated_at = Utc::now();
        let key = ProjectPath::new(&checkpoint.thread_id)?.thread();
        self.store.set_json(&key, &*checkpoint).await?;
        Ok(())
    }

    fn cancelled(&self) -> anyhow::Error {
        TurnCancelled {
            thread_id: self.thread_id().to_string(),
        }
        .into()
    }
}

/// Answers every call of an interrupted assistant message that never ran.
fn close_dangling_calls(checkpoint: &mut Checkpoint) {
    if !checkpoint.is_interrupted() {
        return;
    }
    let calls = checkpoint
        .last_message()
        .filter(|message| message.requests_tools())
        .map(|message| message.tool_calls.clone())
        .unwrap_or_default();
    for call in calls {
        checkpoint
            .messages
            .push(Message::tool_result(&call.id, NOT_EXECUTED_TOOL_RESULT));
    }
    checkpoint.next = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use splicing_providers::AssistantTurn;
    use splicing_store::SqliteStore;
    use splicing_tools::Tool;
    use splicing_types::{ProviderInfo, ToolResult, ToolSchema};
    use tokio::sync::Mutex;

    struct ScriptedProvider {
        turns: Mutex<VecDeque<AssistantTurn>>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<AssistantTurn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

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
            messages: &[Message],
            _binding: Option<&ToolBinding>,
        ) -> anyhow::Result<AssistantTurn> {
            self.seen.lock().await.push(messages.len());
            self.turns
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    struct CountingTool {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "lookup".to_string(),
                description: "Looks things up".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, _args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("lookup backend down");
            }
            Ok(ToolResult {
                output: format!("found for {}", ctx.project_id),
                metadata: json!({}),
            })
        }
    }

    fn text(content: &str) -> AssistantTurn {
        AssistantTurn {
            content: content.to_string(),
            ..AssistantTurn::default()
        }
    }

    fn call(id: &str) -> AssistantTurn {
        AssistantTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: "lookup".to_string(),
                args: json!({}),
            }],
            usage: None,
        }
    }

    async fn graph(
        store: Arc<dyn KeyedStore>,
        provider: Arc<ScriptedProvider>,
        tool: Arc<CountingTool>,
    ) -> ConversationGraph {
        let tools = ToolRegistry::new();
        tools.register(tool).await;
        ConversationGraph::new(store, provider, ToolContext::new("p1"))
            .with_tools(tools)
            .await
            .expect("bind tools")
    }

    fn counting_tool(fail: bool) -> Arc<CountingTool> {
        Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    async fn memory_store() -> Arc<dyn KeyedStore> {
        Arc::new(SqliteStore::open_in_memory().await.expect("store"))
    }

    #[tokio::test]
    async fn plain_reply_ends_the_run() {
        let provider = ScriptedProvider::new(vec![text("hello")]);
        let graph = graph(memory_store().await, provider, counting_tool(false)).await;
        let checkpoint = graph
            .invoke(Some(Message::user("hi")))
            .await
            .expect("invoke");
        assert_eq!(checkpoint.next, None);
        assert_eq!(checkpoint.step, 2);
        assert_eq!(checkpoint.messages.len(), 2);
        assert_eq!(checkpoint.transcript()[1].content, "hello");
        assert_eq!(graph.state().await.expect("state"), checkpoint);
    }

    #[tokio::test]
    async fn pauses_before_tool_and_resumes_on_request() {
        let provider = ScriptedProvider::new(vec![call("c1"), text("done")]);
        let tool = counting_tool(false);
        let graph = graph(memory_store().await, provider, tool.clone()).await;

        let paused = graph
            .invoke(Some(Message::user("look it up")))
            .await
            .expect("invoke");
        assert!(paused.is_interrupted());
        assert_eq!(paused.pending_tool_call().map(|c| c.id.as_str()), Some("c1"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);

        let finished = graph.invoke(None).await.expect("resume");
        assert_eq!(finished.next, None);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        let roles = finished
            .messages
            .iter()
            .map(|m| m.role)
            .collect::<Vec<_>>();
        assert_eq!(
            roles,
            [
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(finished.messages[2].content, "found for p1");
    }

    #[tokio::test]
    async fn unbound_graph_never_enters_tool() {
        let provider = ScriptedProvider::new(vec![call("c1")]);
        let graph = ConversationGraph::new(memory_store().await, provider, ToolContext::new("p1"));
        let checkpoint = graph
            .invoke(Some(Message::user("hi")))
            .await
            .expect("invoke");
        assert_eq!(checkpoint.next, None);
        assert!(checkpoint.pending_tool_call().is_none());
    }

    #[tokio::test]
    async fn update_state_replaces_pending_message_in_place() {
        let provider = ScriptedProvider::new(vec![call("c1")]);
        let tool = counting_tool(false);
        let graph = graph(memory_store().await, provider, tool.clone()).await;
        let paused = graph
            .invoke(Some(Message::user("go")))
            .await
            .expect("invoke");
        let pending_id = paused.last_message().expect("last").id.clone();

        let replaced = graph
            .update_state(
                vec![Message::assistant("not now").with_id(pending_id.clone())],
                Node::Chat,
            )
            .await
            .expect("update");
        assert_eq!(replaced.messages.len(), paused.messages.len());
        assert_eq!(replaced.next, None);
        let last = replaced.last_message().expect("last");
        assert_eq!(last.id, pending_id);
        assert_eq!(last.content, "not now");
        assert!(last.tool_calls.is_empty());

        let resumed = graph.invoke(None).await.expect("resume");
        assert_eq!(resumed.step, replaced.step);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_input_closes_dangling_call() {
        let provider = ScriptedProvider::new(vec![call("c1"), text("ok")]);
        let tool = counting_tool(false);
        let graph = graph(memory_store().await, provider, tool.clone()).await;
        graph
            .invoke(Some(Message::user("go")))
            .await
            .expect("invoke");
        let checkpoint = graph
            .invoke(Some(Message::user("never mind")))
            .await
            .expect("invoke");
        assert_eq!(checkpoint.messages[2].role, MessageRole::Tool);
        assert_eq!(checkpoint.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(checkpoint.messages[2].content, NOT_EXECUTED_TOOL_RESULT);
        assert_eq!(checkpoint.messages[3].content, "never mind");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn appending_context_while_paused_answers_the_call() {
        let provider = ScriptedProvider::new(vec![call("c1")]);
        let graph = graph(memory_store().await, provider, counting_tool(false)).await;
        graph
            .invoke(Some(Message::user("go")))
            .await
            .expect("invoke");
        let checkpoint = graph
            .update_state(vec![Message::hidden_user("[context] switched")], Node::Chat)
            .await
            .expect("update");
        assert_eq!(checkpoint.next, None);
        assert_eq!(checkpoint.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert!(checkpoint.messages[3].hidden);
    }

    #[tokio::test]
    async fn tool_failure_becomes_tool_result() {
        let provider = ScriptedProvider::new(vec![call("c1"), text("sorry")]);
        let graph = graph(memory_store().await, provider, counting_tool(true)).await;
        graph
            .invoke(Some(Message::user("go")))
            .await
            .expect("invoke");
        let checkpoint = graph.invoke(None).await.expect("resume");
        assert!(checkpoint.messages[2]
            .content
            .contains("lookup backend down"));
        assert_eq!(checkpoint.last_message().expect("last").content, "sorry");
    }

    #[tokio::test]
    async fn stream_forwards_text_and_commits_the_full_message() {
        let provider = ScriptedProvider::new(vec![text("streamed reply")]);
        let graph = graph(memory_store().await, provider, counting_tool(false)).await;
        let (tx, mut rx) = mpsc::channel(16);
        let checkpoint = graph
            .stream(Some(Message::user("hi")), tx, CancellationToken::new())
            .await
            .expect("stream");
        let delta = rx.recv().await.expect("delta");
        assert_eq!(delta.node, Node::Chat);
        assert_eq!(delta.content, "streamed reply");
        assert_eq!(
            checkpoint.last_message().expect("last").content,
            "streamed reply"
        );
    }

    #[tokio::test]
    async fn cancelled_stream_keeps_only_completed_transitions() {
        let provider = ScriptedProvider::new(vec![text("never seen")]);
        let graph = graph(memory_store().await, provider.clone(), counting_tool(false)).await;
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = graph
            .stream(Some(Message::user("hi")), tx, cancel)
            .await
            .expect_err("cancelled");
        assert!(err.downcast_ref::<TurnCancelled>().is_some());
        let state = graph.state().await.expect("state");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.next, Some(Node::Chat));
        assert!(provider.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_thread_forgets_state() {
        let store = memory_store().await;
        let provider = ScriptedProvider::new(vec![text("hello")]);
        let graph = graph(store.clone(), provider, counting_tool(false)).await;
        graph
            .invoke(Some(Message::user("hi")))
            .await
            .expect("invoke");
        assert!(graph.delete_thread().await.expect("delete"));
        assert!(load_checkpoint(store.as_ref(), "p1")
            .await
            .expect("load")
            .is_none());
        assert_eq!(graph.state().await.expect("state").step, 0);
    }
}
