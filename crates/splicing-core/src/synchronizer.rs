//! Turns pipeline-state changes into hidden conversation messages.
//!
//! Planning reads the store and decides what to inject; applying appends the
//! messages to the thread first and only then flips flags and pointers. A
//! crash between the two steps re-plans the same delivery messages with the
//! same ids, and merging by id keeps them single. Ids carry the flag's arming
//! token, so re-arming with an identical payload appends a fresh message.

use std::sync::Arc;

use splicing_observability::short_hash;
use splicing_types::{
    BlockSetup, DeliveryState, ExecuteResult, GenerateResult, Message, SectionType,
    TransformationGenerateResult,
};

use crate::graph::{ConversationGraph, Node};
use crate::pipeline::PipelineStore;
use crate::prompts::PromptLibrary;

/// The scope a turn or selection change is about.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    pub project_id: &'a str,
    pub section_id: &'a str,
    pub block_id: Option<&'a str>,
    /// The block setup was just written and the model should see it again.
    pub setup_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommit {
    LastWorkedSection {
        section_id: String,
    },
    CurrentBlock {
        section_id: String,
        block_id: Option<String>,
    },
    GenerateResultDelivered {
        section_id: String,
        block_id: String,
    },
    ExecutionErrorDelivered {
        section_id: String,
        block_id: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub messages: Vec<Message>,
    pub commits: Vec<SyncCommit>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.commits.is_empty()
    }
}

#[derive(Clone)]
pub struct ContextSynchronizer {
    pipeline: PipelineStore,
    prompts: Arc<PromptLibrary>,
}

impl ContextSynchronizer {
    pub fn new(pipeline: PipelineStore, prompts: Arc<PromptLibrary>) -> Self {
        Self { pipeline, prompts }
    }

    pub async fn plan(&self, request: SyncRequest<'_>) -> anyhow::Result<SyncPlan> {
        let SyncRequest {
            project_id,
            section_id,
            block_id,
            setup_changed,
        } = request;
        let mut plan = SyncPlan::default();
        let Some(section) = self.pipeline.get_section(project_id, section_id).await? else {
            return Ok(plan);
        };

        let last_worked = self.pipeline.last_worked_section_id(project_id).await?;
        let current_block = self
            .pipeline
            .current_block_id(project_id, section_id)
            .await?;
        let scope_changed = last_worked.as_deref() != Some(section_id)
            || current_block.as_deref() != block_id
            || setup_changed;
        if scope_changed {
            let setup = match block_id {
                Some(block_id) => {
                    self.pipeline
                        .get_setup(project_id, section_id, block_id)
                        .await?
                }
                None => None,
            };
            plan.messages
                .push(self.context_update_message(section.section_type, setup.as_ref())?);
            plan.commits.push(SyncCommit::LastWorkedSection {
                section_id: section_id.to_string(),
            });
            plan.commits.push(SyncCommit::CurrentBlock {
                section_id: section_id.to_string(),
                block_id: block_id.map(str::to_string),
            });
        }

        let Some(block_id) = block_id else {
            return Ok(plan);
        };
        let Some(block) = self
            .pipeline
            .get_block(project_id, section_id, block_id)
            .await?
        else {
            return Ok(plan);
        };

        if block.generate_result_delivery == Some(DeliveryState::Pending) && block.setup.is_some()
        {
            if let Some(result) = &block.generate_result {
                let arming = delivery_key(block.generate_result_arming.as_deref(), || {
                    Ok(result.to_value()?.to_string())
                })?;
                plan.messages
                    .push(self.generation_message(block_id, &arming, result)?);
                plan.commits.push(SyncCommit::GenerateResultDelivered {
                    section_id: section_id.to_string(),
                    block_id: block_id.to_string(),
                });
            }
        }

        if block.execution_error_delivery == Some(DeliveryState::Pending) {
            if let Some(error) = block
                .execute_result
                .as_ref()
                .and_then(ExecuteResult::error_text)
            {
                let arming = delivery_key(block.execution_error_arming.as_deref(), || {
                    Ok(error.to_string())
                })?;
                plan.messages.push(self.execution_error_message(
                    section.section_type,
                    block_id,
                    &arming,
                    error,
                )?);
                plan.commits.push(SyncCommit::ExecutionErrorDelivered {
                    section_id: section_id.to_string(),
                    block_id: block_id.to_string(),
                });
            }
        }

        tracing::debug!(
            project_id,
            section_id,
            block_id,
            messages = plan.messages.len(),
            "context sync planned"
        );
        Ok(plan)
    }

    /// Appends the plan's messages to the thread, then applies its commits.
    pub async fn apply(
        &self,
        graph: &ConversationGraph,
        project_id: &str,
        plan: SyncPlan,
    ) -> anyhow::Result<()> {
        if !plan.messages.is_empty() {
            graph.update_state(plan.messages, Node::Chat).await?;
        }
        self.commit(project_id, &plan.commits).await
    }

    pub async fn commit(&self, project_id: &str, commits: &[SyncCommit]) -> anyhow::Result<()> {
        for commit in commits {
            match commit {
                SyncCommit::LastWorkedSection { section_id } => {
                    self.pipeline
                        .set_last_worked_section_id(project_id, section_id)
                        .await?;
                }
                SyncCommit::CurrentBlock {
                    section_id,
                    block_id: Some(block_id),
                } => {
                    self.pipeline
                        .set_current_block_id(project_id, section_id, block_id)
                        .await?;
                }
                SyncCommit::CurrentBlock {
                    section_id,
                    block_id: None,
                } => {
                    self.pipeline
                        .clear_current_block_id(project_id, section_id)
                        .await?;
                }
                SyncCommit::GenerateResultDelivered {
                    section_id,
                    block_id,
                } => {
                    self.pipeline
                        .mark_generate_result_delivered(project_id, section_id, block_id)
                        .await?;
                }
                SyncCommit::ExecutionErrorDelivered {
                    section_id,
                    block_id,
                } => {
                    self.pipeline
                        .mark_execution_error_delivered(project_id, section_id, block_id)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn context_update_message(
        &self,
        section_type: SectionType,
        setup: Option<&BlockSetup>,
    ) -> anyhow::Result<Message> {
        let lines = match setup {
            Some(setup) => setup.context_lines()?,
            None => Vec::new(),
        };
        let context = if lines.is_empty() {
            String::new()
        } else {
            format!(
                "Here is some information about current data engineering tasks:\n{}",
                lines.join("\n")
            )
        };
        let content = self.prompts.render(
            "conversation",
            "context_update_user_message",
            &[("section_type", section_type.lowercase()), ("context", &context)],
        )?;
        Ok(Message::hidden_user(content))
    }

    fn generation_message(
        &self,
        block_id: &str,
        arming: &str,
        result: &GenerateResult,
    ) -> anyhow::Result<Message> {
        let content = match result {
            GenerateResult::Movement(python)
            | GenerateResult::Cleaning(python)
            | GenerateResult::Transformation(TransformationGenerateResult::Python(python)) => {
                let args = serde_json::to_string(&python.function_args)?;
                let packages = python
                    .packages
                    .as_deref()
                    .map(|packages| packages.join(", "))
                    .unwrap_or_default();
                self.prompts.render(
                    "conversation",
                    "generate_python_code_user_message",
                    &[
                        ("section_type", result.section_type().lowercase()),
                        ("functionName", &python.function_name),
                        ("functionArgs", &args),
                        ("returnValue", python.return_value.as_deref().unwrap_or("")),
                        ("packages", &packages),
                        ("code", &python.code),
                    ],
                )?
            }
            GenerateResult::Transformation(TransformationGenerateResult::Dbt(dbt)) => {
                self.prompts.render(
                    "conversation",
                    "generate_dbt_code_user_message",
                    &[
                        ("modelName", &dbt.model_name),
                        ("model", &dbt.model),
                        ("properties", &dbt.properties),
                    ],
                )?
            }
            GenerateResult::Orchestration(dag) => self.prompts.render(
                "conversation",
                "generate_dag_code_user_message",
                &[("dagName", &dag.dag_name), ("code", &dag.code)],
            )?,
        };
        Ok(Message::hidden_user(content).with_id(format!("gen-{block_id}-{arming}")))
    }

    fn execution_error_message(
        &self,
        section_type: SectionType,
        block_id: &str,
        arming: &str,
        error: &str,
    ) -> anyhow::Result<Message> {
        let content = self.prompts.render(
            "conversation",
            "execution_error_user_message",
            &[("section_type", section_type.lowercase()), ("error", error)],
        )?;
        Ok(Message::hidden_user(content).with_id(format!("err-{block_id}-{arming}")))
    }
}

/// The arming token, or a payload hash for flags armed before tokens existed.
fn delivery_key(
    arming: Option<&str>,
    payload: impl FnOnce() -> anyhow::Result<String>,
) -> anyhow::Result<String> {
    match arming {
        Some(token) => Ok(token.to_string()),
        None => Ok(short_hash(&payload()?)),
    }
}
