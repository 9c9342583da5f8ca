//! Per-project conversation turns and the block operations that feed them.
//!
//! Every operation that may touch a project's thread holds that project's
//! turn lock for its whole duration.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use splicing_observability::{emit_event, ObservabilityEvent, ProcessKind};
use splicing_store::codec;
use splicing_tools::{Tool, ToolContext, ToolRegistry};
use splicing_types::{
    BlockMetadata, BlockSetup, EngineEvent, ExecuteResult, GenerateResult, Message,
    ProjectMetadata, ProjectSetup, SectionMetadata, SectionType, ToolResult, ToolSchema,
    TranscriptEntry, TransformationGenerateResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::collaborators::{
    CodeExecutor, CodeGenerator, DatasetSchema, ExecuteRequest, GenerateRequest,
    ModelCodeGenerator, ProviderSource, PythonScriptExecutor, RecommendRequest,
};
use crate::config::DEFAULT_MAX_TOOL_CYCLES;
use crate::error::ToolLoopExhausted;
use crate::event_bus::EventBus;
use crate::graph::{load_checkpoint, Checkpoint, ConversationGraph, GraphDelta, Node};
use crate::pipeline::{Datasets, PipelineStore, LAST_WORKED_SECTION_ID};
use crate::prompts::PromptLibrary;
use crate::synchronizer::{ContextSynchronizer, SyncRequest};
use crate::turn_locks::TurnLocks;

pub const GENERATE_CODE_TOOL: &str = "generate_code";
pub const GUIDANCE_MESSAGE: &str = "Please select a block or complete setup of the current block before asking for code generation.";

#[derive(Debug, Clone, Default)]
pub struct ConverseRequest {
    pub message: String,
    pub current_section_id: Option<String>,
}

impl ConverseRequest {
    pub fn new(message: impl Into<String>, current_section_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            current_section_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub result: ExecuteResult,
    pub datasets: Datasets,
}

/// What storing a block setup produced besides the setup itself.
#[derive(Debug, Clone, Default)]
pub struct SetupOutcome {
    pub recommendations: Vec<String>,
    /// The assistant message listing `recommendations`, when there are any.
    pub recommendation: Option<Message>,
}

type DeltaSink = (mpsc::Sender<GraphDelta>, CancellationToken);

/// What a turn knows about the user's position in the pipeline.
#[derive(Debug, Default)]
struct TurnScope {
    section: Option<SectionMetadata>,
    block_id: Option<String>,
    setup: Option<BlockSetup>,
}

impl TurnScope {
    fn generation_ready(&self) -> bool {
        self.block_id.is_some() && self.setup.as_ref().is_some_and(BlockSetup::is_complete)
    }
}

pub struct ConversationService {
    pipeline: PipelineStore,
    providers: Arc<dyn ProviderSource>,
    prompts: Arc<PromptLibrary>,
    synchronizer: ContextSynchronizer,
    workflow: BlockWorkflow,
    locks: TurnLocks,
    events: EventBus,
    max_tool_cycles: usize,
}

impl ConversationService {
    /// Generates code with the project's model and runs it with a local
    /// Python interpreter unless other collaborators are supplied.
    pub fn new(
        pipeline: PipelineStore,
        providers: Arc<dyn ProviderSource>,
        prompts: Arc<PromptLibrary>,
    ) -> Self {
        let generator = Arc::new(ModelCodeGenerator::new(providers.clone(), prompts.clone()));
        Self {
            synchronizer: ContextSynchronizer::new(pipeline.clone(), prompts.clone()),
            workflow: BlockWorkflow {
                pipeline: pipeline.clone(),
                generator,
                executor: Arc::new(PythonScriptExecutor::default()),
            },
            pipeline,
            providers,
            prompts,
            locks: TurnLocks::new(),
            events: EventBus::new(),
            max_tool_cycles: DEFAULT_MAX_TOOL_CYCLES,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.workflow.generator = generator;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.workflow.executor = executor;
        self
    }

    pub fn with_max_tool_cycles(mut self, cycles: usize) -> Self {
        self.max_tool_cycles = cycles;
        self
    }

    pub fn pipeline(&self) -> &PipelineStore {
        &self.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- projects and threads ----

    /// Creates the project and seeds its thread with the greeting messages.
    pub async fn start_project(&self, setup: ProjectSetup) -> anyhow::Result<ProjectMetadata> {
        let project = self.pipeline.create_project(setup).await?;
        let _guard = self.locks.acquire(&project.id).await;
        self.detached_graph(&project.id, None, None)
            .update_state(self.initial_messages()?, Node::Chat)
            .await?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "project.created",
                component: "conversation.service",
                project_id: Some(&project.id),
                status: Some("ok"),
                ..Default::default()
            },
        );
        self.events.publish(EngineEvent::new(
            "project.created",
            json!({"projectId": project.id, "title": project.title}),
        ));
        Ok(project)
    }

    /// Deletes the project with its sections, blocks and thread.
    pub async fn close_project(&self, project_id: &str) -> anyhow::Result<bool> {
        let guard = self.locks.acquire(project_id).await;
        let deleted = self.pipeline.delete_project(project_id).await?;
        drop(guard);
        self.locks.forget(project_id).await;
        if deleted {
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "project.deleted",
                    component: "conversation.service",
                    project_id: Some(project_id),
                    status: Some("ok"),
                    ..Default::default()
                },
            );
            self.events.publish(EngineEvent::new(
                "project.deleted",
                json!({"projectId": project_id}),
            ));
        }
        Ok(deleted)
    }

    /// Drops the thread and starts over from the greeting. Returns the new
    /// thread, or `None` for an unknown project.
    pub async fn reset_conversation(&self, project_id: &str) -> anyhow::Result<Option<Vec<Message>>> {
        let _guard = self.locks.acquire(project_id).await;
        if self.pipeline.get_project(project_id).await?.is_none() {
            return Ok(None);
        }
        let graph = self.detached_graph(project_id, None, None);
        graph.delete_thread().await?;
        self.pipeline
            .delete_project_attribute(project_id, LAST_WORKED_SECTION_ID)
            .await?;
        let messages = self.initial_messages()?;
        graph.update_state(messages.clone(), Node::Chat).await?;
        tracing::info!(project_id, "conversation reset");
        Ok(Some(messages))
    }

    /// Visible transcript of the project's thread.
    pub async fn history(&self, project_id: &str) -> anyhow::Result<Vec<TranscriptEntry>> {
        Ok(load_checkpoint(self.pipeline.store().as_ref(), project_id)
            .await?
            .map(|checkpoint| checkpoint.transcript())
            .unwrap_or_default())
    }

    // ---- turns ----

    /// Runs one user turn and returns the final assistant message.
    pub async fn converse(
        &self,
        project_id: &str,
        request: ConverseRequest,
    ) -> anyhow::Result<Message> {
        self.run_turn(project_id, request, None).await
    }

    /// Like [`ConversationService::converse`], sending text to `sink` as the
    /// model produces it.
    pub async fn converse_stream(
        &self,
        project_id: &str,
        request: ConverseRequest,
        sink: mpsc::Sender<GraphDelta>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Message> {
        self.run_turn(project_id, request, Some((sink, cancel))).await
    }

    async fn run_turn(
        &self,
        project_id: &str,
        request: ConverseRequest,
        streaming: Option<DeltaSink>,
    ) -> anyhow::Result<Message> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self
            .pipeline
            .get_project(project_id)
            .await?
            .with_context(|| format!("project `{project_id}` not found"))?;
        let scope = self
            .turn_scope(project_id, request.current_section_id.as_deref())
            .await?;
        let graph = self.turn_graph(&project, &scope).await?;

        if let Some(section) = &scope.section {
            let plan = self
                .synchronizer
                .plan(SyncRequest {
                    project_id,
                    section_id: &section.id,
                    block_id: scope.block_id.as_deref(),
                    setup_changed: false,
                })
                .await?;
            self.synchronizer.apply(&graph, project_id, plan).await?;
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.start",
                component: "conversation.service",
                project_id: Some(project_id),
                section_id: scope.section.as_ref().map(|section| section.id.as_str()),
                block_id: scope.block_id.as_deref(),
                status: Some("start"),
                ..Default::default()
            },
        );

        let input = Message::user(request.message);
        let mut checkpoint = drive(&graph, Some(input), &streaming).await?;
        let mut resumes = 0;
        while let Some(call) = checkpoint.pending_tool_call().cloned() {
            if call.name == GENERATE_CODE_TOOL && !scope.generation_ready() {
                tracing::info!(project_id, "code generation requested without a ready block");
                checkpoint =
                    replace_pending(&graph, &checkpoint, GUIDANCE_MESSAGE, &streaming).await?;
                break;
            }
            if resumes >= self.max_tool_cycles {
                let notice = self.prompts.render(
                    "conversation",
                    "tool_loop_stop_message",
                    &[("cycles", &resumes.to_string())],
                )?;
                replace_pending(&graph, &checkpoint, &notice, &streaming).await?;
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "turn.finish",
                        component: "conversation.service",
                        project_id: Some(project_id),
                        status: Some("error"),
                        error_code: Some("TOOL_LOOP_EXHAUSTED"),
                        ..Default::default()
                    },
                );
                return Err(ToolLoopExhausted {
                    project_id: project_id.to_string(),
                    cycles: resumes,
                }
                .into());
            }
            resumes += 1;
            checkpoint = drive(&graph, None, &streaming).await?;
        }

        let reply = checkpoint
            .last_message()
            .cloned()
            .context("thread is empty after the turn")?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.finish",
                component: "conversation.service",
                project_id: Some(project_id),
                message_id: Some(&reply.id),
                status: Some("ok"),
                ..Default::default()
            },
        );
        self.events.publish(EngineEvent::new(
            "turn.finished",
            json!({"projectId": project_id, "messageId": reply.id, "toolCycles": resumes}),
        ));
        Ok(reply)
    }

    async fn turn_scope(
        &self,
        project_id: &str,
        section_id: Option<&str>,
    ) -> anyhow::Result<TurnScope> {
        let Some(section_id) = section_id else {
            return Ok(TurnScope::default());
        };
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            tracing::debug!(project_id, section_id, "turn names an unknown section");
            return Ok(TurnScope::default());
        };
        let block_id = self
            .pipeline
            .current_block_id(project_id, section_id)
            .await?;
        let setup = match &block_id {
            Some(block_id) => {
                self.pipeline
                    .get_setup(project_id, section_id, block_id)
                    .await?
            }
            None => None,
        };
        Ok(TurnScope {
            section: Some(section),
            block_id,
            setup,
        })
    }

    /// The model graph for a turn. Code generation is offered only when the
    /// turn is about a section.
    async fn turn_graph(
        &self,
        project: &ProjectMetadata,
        scope: &TurnScope,
    ) -> anyhow::Result<ConversationGraph> {
        let provider = self.providers.provider_for(project).await?;
        let context = ToolContext::new(&project.id)
            .with_section(scope.section.as_ref().map(|section| section.id.clone()))
            .with_block(scope.block_id.clone());
        let graph = ConversationGraph::new(self.pipeline.store().clone(), provider, context);
        let Some(section) = &scope.section else {
            return Ok(graph);
        };
        let tools = ToolRegistry::new();
        tools
            .register(Arc::new(GenerateCodeTool {
                section_type: section.section_type,
                workflow: self.workflow.clone(),
            }))
            .await;
        graph.with_tools(tools).await
    }

    fn detached_graph(
        &self,
        project_id: &str,
        section_id: Option<&str>,
        block_id: Option<&str>,
    ) -> ConversationGraph {
        let context = ToolContext::new(project_id)
            .with_section(section_id.map(str::to_string))
            .with_block(block_id.map(str::to_string));
        ConversationGraph::detached(self.pipeline.store().clone(), context)
    }

    fn initial_messages(&self) -> anyhow::Result<Vec<Message>> {
        Ok(vec![
            Message::system(
                self.prompts
                    .render("conversation", "initial_system_message", &[])?,
            ),
            Message::assistant(
                self.prompts
                    .render("conversation", "initial_assistant_message", &[])?,
            ),
        ])
    }

    // ---- blocks ----

    /// Points the section at `block_id` (or clears the pointer) and tells the
    /// model about the new scope. `false` when the section or block is gone.
    pub async fn select_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let _guard = self.locks.acquire(project_id).await;
        self.sync_scope(project_id, section_id, block_id, false)
            .await
    }

    /// Appends a block. The first block of a section becomes its current one.
    pub async fn add_block(
        &self,
        project_id: &str,
        section_id: &str,
        num_rows: u64,
    ) -> anyhow::Result<Option<BlockMetadata>> {
        let _guard = self.locks.acquire(project_id).await;
        let Some(block) = self
            .pipeline
            .add_block(project_id, section_id, num_rows)
            .await?
        else {
            return Ok(None);
        };
        if self.pipeline.list_blocks(project_id, section_id).await?.len() == 1 {
            self.sync_scope(project_id, section_id, Some(&block.id), false)
                .await?;
        }
        Ok(Some(block))
    }

    /// Stores the setup and re-sends the block's context to the model.
    ///
    /// Cleaning and transformation setups that ask for it first get technique
    /// recommendations for the upstream data, posted to the thread as an
    /// assistant message. A failed recommendation never fails the setup.
    /// `None` when the section or block is gone.
    pub async fn setup_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        setup: &BlockSetup,
    ) -> anyhow::Result<Option<SetupOutcome>> {
        let _guard = self.locks.acquire(project_id).await;
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            return Ok(None);
        };
        if !self
            .pipeline
            .set_setup(project_id, section_id, block_id, setup)
            .await?
        {
            return Ok(None);
        }

        let mut outcome = SetupOutcome::default();
        if setup.wants_recommendations() {
            let recommendations = match self.workflow.recommend(project_id, section_id, setup).await
            {
                Ok(recommendations) => recommendations,
                Err(err) => {
                    tracing::warn!(project_id, block_id, "recommendation failed: {err:#}");
                    Vec::new()
                }
            };
            self.pipeline
                .set_recommendations(project_id, section_id, block_id, &recommendations)
                .await?;
            if !recommendations.is_empty() {
                let message =
                    self.recommendation_message(section.section_type, &recommendations)?;
                self.detached_graph(project_id, Some(section_id), Some(block_id))
                    .update_state(vec![message.clone()], Node::Chat)
                    .await?;
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "block.recommend",
                        component: "conversation.service",
                        project_id: Some(project_id),
                        section_id: Some(section_id),
                        block_id: Some(block_id),
                        message_id: Some(&message.id),
                        status: Some("ok"),
                        ..Default::default()
                    },
                );
                self.events.publish(EngineEvent::new(
                    "block.recommended",
                    json!({
                        "projectId": project_id,
                        "sectionId": section_id,
                        "blockId": block_id,
                        "count": recommendations.len(),
                    }),
                ));
                outcome.recommendation = Some(message);
            }
            outcome.recommendations = recommendations;
        }

        if !self
            .sync_scope(project_id, section_id, Some(block_id), true)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(outcome))
    }

    fn recommendation_message(
        &self,
        section_type: SectionType,
        recommendations: &[String],
    ) -> anyhow::Result<Message> {
        let listed = recommendations
            .iter()
            .enumerate()
            .map(|(idx, item)| format!("{}. {item}", idx + 1))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Message::assistant(self.prompts.render(
            "recommend",
            "assistant_message",
            &[
                ("section_type", section_type.lowercase()),
                ("recommendations", listed.as_str()),
            ],
        )?))
    }

    pub async fn generate_block_code(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let _guard = self.locks.acquire(project_id).await;
        if !self
            .sync_scope(project_id, section_id, Some(block_id), false)
            .await?
        {
            return Ok(None);
        }
        let result = self
            .workflow
            .generate(project_id, section_id, block_id)
            .await?;
        if result.is_some() {
            self.events.publish(EngineEvent::new(
                "block.generated",
                json!({"projectId": project_id, "sectionId": section_id, "blockId": block_id}),
            ));
        }
        Ok(result)
    }

    /// Replaces the code of the block's generated artifact with `code`.
    pub async fn save_block_code(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        code: &str,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let _guard = self.locks.acquire(project_id).await;
        self.workflow
            .save_code(project_id, section_id, block_id, code)
            .await
    }

    /// Runs the block's code, optionally saving edited `code` first.
    pub async fn execute_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        code: Option<&str>,
    ) -> anyhow::Result<Option<ExecuteOutcome>> {
        let _guard = self.locks.acquire(project_id).await;
        if !self
            .sync_scope(project_id, section_id, Some(block_id), false)
            .await?
        {
            return Ok(None);
        }
        if let Some(code) = code {
            if self
                .workflow
                .save_code(project_id, section_id, block_id, code)
                .await?
                .is_none()
            {
                anyhow::bail!("block `{block_id}` has no generated code to replace");
            }
        }
        let outcome = self
            .workflow
            .execute(project_id, section_id, block_id)
            .await?;
        if let Some(outcome) = &outcome {
            self.events.publish(EngineEvent::new(
                "block.executed",
                json!({
                    "projectId": project_id,
                    "sectionId": section_id,
                    "blockId": block_id,
                    "error": outcome.result.error,
                }),
            ));
        }
        Ok(outcome)
    }

    /// Caller holds the project's turn lock.
    async fn sync_scope(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: Option<&str>,
        setup_changed: bool,
    ) -> anyhow::Result<bool> {
        if self
            .pipeline
            .get_section(project_id, section_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        if let Some(block_id) = block_id {
            if !self
                .workflow
                .has_block(project_id, section_id, block_id)
                .await?
            {
                return Ok(false);
            }
        }
        let plan = self
            .synchronizer
            .plan(SyncRequest {
                project_id,
                section_id,
                block_id,
                setup_changed,
            })
            .await?;
        let graph = self.detached_graph(project_id, Some(section_id), block_id);
        self.synchronizer.apply(&graph, project_id, plan).await?;
        Ok(true)
    }
}

async fn drive(
    graph: &ConversationGraph,
    input: Option<Message>,
    streaming: &Option<DeltaSink>,
) -> anyhow::Result<Checkpoint> {
    match streaming {
        Some((sink, cancel)) => graph.stream(input, sink.clone(), cancel.clone()).await,
        None => graph.invoke(input).await,
    }
}

/// Rewrites the interrupted assistant message (same id) as plain `text`,
/// which ends the turn without running its tool call.
async fn replace_pending(
    graph: &ConversationGraph,
    checkpoint: &Checkpoint,
    text: &str,
    streaming: &Option<DeltaSink>,
) -> anyhow::Result<Checkpoint> {
    let pending = checkpoint
        .last_message()
        .context("interrupted thread has no messages")?;
    let replacement = Message::assistant(text).with_id(pending.id.clone());
    let checkpoint = graph.update_state(vec![replacement], Node::Chat).await?;
    if let Some((sink, _)) = streaming {
        let _ = sink
            .send(GraphDelta {
                node: Node::Chat,
                content: text.to_string(),
            })
            .await;
    }
    Ok(checkpoint)
}

/// Code generation and execution for one block, without turn locking or
/// thread writes. Shared by the service and the `generate_code` tool.
#[derive(Clone)]
struct BlockWorkflow {
    pipeline: PipelineStore,
    generator: Arc<dyn CodeGenerator>,
    executor: Arc<dyn CodeExecutor>,
}

impl BlockWorkflow {
    async fn has_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        Ok(self
            .pipeline
            .list_blocks(project_id, section_id)
            .await?
            .iter()
            .any(|block| block.id == block_id))
    }

    async fn generate(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let Some(project) = self.pipeline.get_project(project_id).await? else {
            return Ok(None);
        };
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            return Ok(None);
        };
        if !self.has_block(project_id, section_id, block_id).await? {
            return Ok(None);
        }
        let setup = self
            .pipeline
            .get_setup(project_id, section_id, block_id)
            .await?
            .with_context(|| format!("block `{block_id}` has no setup"))?;

        let dag = match section.section_type {
            SectionType::Orchestration => Some(self.pipeline.build_dag(project_id).await?),
            _ => None,
        };
        let datasets = self
            .source_schemas(project_id, section.section_type, &setup)
            .await?;
        let context = load_checkpoint(self.pipeline.store().as_ref(), project_id)
            .await?
            .map(|checkpoint| checkpoint.transcript())
            .unwrap_or_default();

        let request = GenerateRequest {
            project,
            section_id: section_id.to_string(),
            block_id: block_id.to_string(),
            section_type: section.section_type,
            setup,
            context,
            datasets,
            dag,
        };
        let result = self
            .generator
            .generate(&request)
            .await
            .with_context(|| format!("generating code for block `{block_id}`"))?;
        self.pipeline
            .set_generate_result(project_id, section_id, block_id, &result)
            .await?;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "block.generate",
                component: "conversation.workflow",
                project_id: Some(project_id),
                section_id: Some(section_id),
                block_id: Some(block_id),
                status: Some("ok"),
                detail: Some(if result.is_dbt() { "dbt" } else { "python" }),
                ..Default::default()
            },
        );
        Ok(Some(result))
    }

    /// Asks the generator what to do with the upstream datasets. Empty when
    /// the setup does not ask or there is no data to look at.
    async fn recommend(
        &self,
        project_id: &str,
        section_id: &str,
        setup: &BlockSetup,
    ) -> anyhow::Result<Vec<String>> {
        if !setup.wants_recommendations() {
            return Ok(Vec::new());
        }
        let Some(project) = self.pipeline.get_project(project_id).await? else {
            return Ok(Vec::new());
        };
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            return Ok(Vec::new());
        };
        let datasets = self
            .source_schemas(project_id, section.section_type, setup)
            .await?;
        if datasets.is_empty() {
            tracing::debug!(project_id, section_id, "no upstream data to recommend from");
            return Ok(Vec::new());
        }
        let request = RecommendRequest {
            project,
            section_type: section.section_type,
            datasets,
        };
        self.generator
            .recommend(&request)
            .await
            .context("recommending techniques")
    }

    /// Column layouts of the upstream block's datasets, for sections whose
    /// code reads them.
    async fn source_schemas(
        &self,
        project_id: &str,
        section_type: SectionType,
        setup: &BlockSetup,
    ) -> anyhow::Result<BTreeMap<String, DatasetSchema>> {
        let reads_datasets = matches!(
            section_type,
            SectionType::Cleaning | SectionType::Transformation
        );
        let Some((source_section, source_block)) = setup.source_link().filter(|_| reads_datasets)
        else {
            return Ok(BTreeMap::new());
        };
        Ok(self
            .pipeline
            .get_datasets(project_id, source_section, source_block)
            .await?
            .unwrap_or_default()
            .iter()
            .map(|(name, batch)| (name.clone(), codec::table_schema(batch)))
            .collect())
    }

    async fn save_code(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        code: &str,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let Some(mut result) = self
            .pipeline
            .get_generate_result(project_id, section_id, block_id)
            .await?
        else {
            return Ok(None);
        };
        match &mut result {
            GenerateResult::Movement(python)
            | GenerateResult::Cleaning(python)
            | GenerateResult::Transformation(TransformationGenerateResult::Python(python)) => {
                python.code = code.to_string();
            }
            GenerateResult::Transformation(TransformationGenerateResult::Dbt(dbt)) => {
                dbt.model = code.to_string();
            }
            GenerateResult::Orchestration(dag) => dag.code = code.to_string(),
        }
        self.pipeline
            .set_generate_result(project_id, section_id, block_id, &result)
            .await?;
        Ok(Some(result))
    }

    /// Executor failures become the result's `error`; they never fail the
    /// call.
    async fn execute(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<ExecuteOutcome>> {
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            return Ok(None);
        };
        if !self.has_block(project_id, section_id, block_id).await? {
            return Ok(None);
        }
        let setup = self
            .pipeline
            .get_setup(project_id, section_id, block_id)
            .await?
            .with_context(|| format!("block `{block_id}` has no setup"))?;
        let generate_result = self
            .pipeline
            .get_generate_result(project_id, section_id, block_id)
            .await?
            .with_context(|| format!("block `{block_id}` has no generated code"))?;
        let inputs = match setup.source_link() {
            Some((source_section, source_block)) => self
                .pipeline
                .get_datasets(project_id, source_section, source_block)
                .await?
                .unwrap_or_default(),
            None => Datasets::new(),
        };
        let request = ExecuteRequest {
            project_id: project_id.to_string(),
            section_id: section_id.to_string(),
            block_id: block_id.to_string(),
            section_type: section.section_type,
            setup,
            generate_result,
            project_dir: self.pipeline.resolve_project_directory(project_id).await?,
            inputs,
        };

        let (result, datasets) = match self.executor.execute(&request).await {
            Ok(output) => {
                let return_value = if output.datasets.is_empty() {
                    output.return_value
                } else {
                    None
                };
                (
                    ExecuteResult {
                        return_value,
                        error: None,
                    },
                    output.datasets,
                )
            }
            Err(err) => {
                tracing::warn!(project_id, block_id, "block execution failed: {err:#}");
                (
                    ExecuteResult {
                        return_value: None,
                        error: Some(format!("{err:#}")),
                    },
                    Datasets::new(),
                )
            }
        };
        self.pipeline
            .set_datasets(project_id, section_id, block_id, &datasets)
            .await?;
        self.pipeline
            .set_execute_result(project_id, section_id, block_id, &result)
            .await?;
        emit_event(
            if result.error.is_some() {
                Level::WARN
            } else {
                Level::INFO
            },
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "block.execute",
                component: "conversation.workflow",
                project_id: Some(project_id),
                section_id: Some(section_id),
                block_id: Some(block_id),
                status: Some(if result.error.is_some() { "error" } else { "ok" }),
                ..Default::default()
            },
        );
        Ok(Some(ExecuteOutcome { result, datasets }))
    }
}

/// Generates code for the block selected when the turn started.
struct GenerateCodeTool {
    section_type: SectionType,
    workflow: BlockWorkflow,
}

#[async_trait]
impl Tool for GenerateCodeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: GENERATE_CODE_TOOL.to_string(),
            description: format!(
                "Generates code for performing data {} tasks",
                self.section_type.lowercase()
            ),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(
        &self,
        _args: serde_json::Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult> {
        let section_id = ctx.section_id.as_deref().context("no section is selected")?;
        let block_id = ctx.block_id.as_deref().context("no block is selected")?;
        let result = self
            .workflow
            .generate(&ctx.project_id, section_id, block_id)
            .await?
            .with_context(|| format!("block `{block_id}` no longer exists"))?;
        Ok(ToolResult {
            output: result.to_value()?.to_string(),
            metadata: json!({"sectionId": section_id, "blockId": block_id}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExecutionOutput;
    use splicing_store::SqliteStore;
    use splicing_types::{CleaningSetup, DagGenerateResult, LlmType, PythonGenerateResult};

    struct FixedGenerator;

    #[async_trait]
    impl CodeGenerator for FixedGenerator {
        async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResult> {
            Ok(match request.section_type {
                SectionType::Orchestration => GenerateResult::Orchestration(DagGenerateResult {
                    dag_name: "daily".to_string(),
                    code: "dag = None".to_string(),
                }),
                _ => GenerateResult::Cleaning(PythonGenerateResult {
                    function_name: "clean".to_string(),
                    function_args: serde_json::Map::new(),
                    return_value: None,
                    code: "def clean(): return 1".to_string(),
                    packages: None,
                }),
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl CodeExecutor for FailingExecutor {
        async fn execute(&self, _request: &ExecuteRequest) -> anyhow::Result<ExecutionOutput> {
            anyhow::bail!("NameError: name 'pd' is not defined")
        }
    }

    async fn workflow_with_block() -> (BlockWorkflow, String, String, String) {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let pipeline = PipelineStore::new(Arc::new(store), "/tmp/splicing-tests");
        let project = pipeline
            .create_project(ProjectSetup {
                title: "Orders".to_string(),
                llm: LlmType::OpenAi,
                project_dir: String::new(),
            })
            .await
            .expect("project");
        let section = pipeline
            .add_section(&project.id, "Clean", SectionType::Cleaning)
            .await
            .expect("add")
            .expect("section");
        let block = pipeline
            .add_block(&project.id, &section.id, 5)
            .await
            .expect("add")
            .expect("block");
        pipeline
            .set_setup(
                &project.id,
                &section.id,
                &block.id,
                &BlockSetup::Cleaning(CleaningSetup {
                    source: "python".to_string(),
                    tool: "pandas".to_string(),
                    source_section_id: String::new(),
                    source_block_id: String::new(),
                    source_details: String::new(),
                    provide_recommendation: false,
                }),
            )
            .await
            .expect("setup");
        let workflow = BlockWorkflow {
            pipeline,
            generator: Arc::new(FixedGenerator),
            executor: Arc::new(FailingExecutor),
        };
        (workflow, project.id, section.id, block.id)
    }

    #[tokio::test]
    async fn executor_failure_is_stored_as_error() {
        let (workflow, project_id, section_id, block_id) = workflow_with_block().await;
        workflow
            .generate(&project_id, &section_id, &block_id)
            .await
            .expect("generate")
            .expect("result");
        let outcome = workflow
            .execute(&project_id, &section_id, &block_id)
            .await
            .expect("execute")
            .expect("outcome");
        assert_eq!(
            outcome.result.error_text(),
            Some("NameError: name 'pd' is not defined")
        );
        assert!(outcome.datasets.is_empty());
        let stored = workflow
            .pipeline
            .get_execute_result(&project_id, &section_id, &block_id)
            .await
            .expect("read")
            .expect("stored");
        assert_eq!(stored, outcome.result);
    }

    #[tokio::test]
    async fn save_code_rewrites_only_the_code() {
        let (workflow, project_id, section_id, block_id) = workflow_with_block().await;
        assert!(workflow
            .save_code(&project_id, &section_id, &block_id, "x")
            .await
            .expect("save")
            .is_none());
        workflow
            .generate(&project_id, &section_id, &block_id)
            .await
            .expect("generate");
        let saved = workflow
            .save_code(&project_id, &section_id, &block_id, "def clean(): return 2")
            .await
            .expect("save")
            .expect("result");
        match saved {
            GenerateResult::Cleaning(python) => {
                assert_eq!(python.function_name, "clean");
                assert_eq!(python.code, "def clean(): return 2");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_requires_a_selected_block() {
        let (workflow, project_id, section_id, _) = workflow_with_block().await;
        let tool = GenerateCodeTool {
            section_type: SectionType::Cleaning,
            workflow,
        };
        assert_eq!(
            tool.schema().description,
            "Generates code for performing data cleaning tasks"
        );
        let ctx = ToolContext::new(project_id).with_section(Some(section_id));
        let err = tool
            .execute(json!({}), &ctx)
            .await
            .expect_err("no block");
        assert!(err.to_string().contains("no block"));
    }
}
