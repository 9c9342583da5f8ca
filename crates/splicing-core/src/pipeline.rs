//! Projects, sections, blocks and settings laid out over the keyed store.
//!
//! Reads of a missing entity return `None`; writes to a missing entity return
//! `false` / `None` and leave the store untouched. Every write under a project
//! refreshes the project's `modifiedOn` after the entity value is written.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use splicing_store::{
    codec, BlockPath, KeyPath, KeyedStore, KeyedStoreExt, ProjectPath, SectionPath, SwapDirection,
};
use splicing_types::{
    generate_id, BlockMetadata, BlockSetup, DeliveryState, ExecuteResult, GenerateResult,
    LlmType, MoveDirection, ProjectMetadata, ProjectSetup, SectionMetadata, SectionType,
    SettingsEntry, SettingsSectionType, TranscriptEntry,
};

use crate::graph::load_checkpoint;

pub const LAST_WORKED_SECTION_ID: &str = "last_worked_section_id";
const DBT_PROFILES_DIR: &str = "dbt_profiles";

/// Named tabular outputs of a block execution.
pub type Datasets = BTreeMap<String, RecordBatch>;

#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub title: Option<String>,
    pub llm: Option<LlmType>,
    pub project_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub metadata: BlockMetadata,
    pub setup: Option<BlockSetup>,
    pub generate_result: Option<GenerateResult>,
    pub execute_result: Option<ExecuteResult>,
    pub recommendations: Option<Vec<String>>,
    pub datasets: Datasets,
    pub generate_result_delivery: Option<DeliveryState>,
    pub execution_error_delivery: Option<DeliveryState>,
    /// Changes on every re-arm of the matching flag, so a repeated payload
    /// still counts as a new delivery.
    pub generate_result_arming: Option<String>,
    pub execution_error_arming: Option<String>,
}

/// Blocks with generated code outside orchestration sections, and the edges
/// from each upstream block to the blocks reading from it.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PipelineDag {
    pub node_definitions: BTreeMap<String, Map<String, Value>>,
    pub adj_list: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    #[serde(flatten)]
    pub metadata: BlockMetadata,
    pub setup: Option<BlockSetup>,
    pub generate_result: Option<GenerateResult>,
    pub execute_result: Option<ExecuteResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    /// First `numRows` rows of each dataset, as JSON row objects.
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionView {
    #[serde(flatten)]
    pub metadata: SectionMetadata,
    pub current_block_id: Option<String>,
    pub blocks: Vec<BlockView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    #[serde(flatten)]
    pub metadata: ProjectMetadata,
    pub sections: Vec<SectionView>,
    pub messages: Vec<TranscriptEntry>,
    pub last_worked_section_id: Option<String>,
}

#[derive(Clone)]
pub struct PipelineStore {
    store: Arc<dyn KeyedStore>,
    app_dir: PathBuf,
}

impl PipelineStore {
    pub fn new(store: Arc<dyn KeyedStore>, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            app_dir: app_dir.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyedStore> {
        &self.store
    }

    pub fn app_dir(&self) -> &PathBuf {
        &self.app_dir
    }

    // ---- projects ----

    pub async fn create_project(&self, setup: ProjectSetup) -> anyhow::Result<ProjectMetadata> {
        let now = Utc::now();
        let metadata = ProjectMetadata {
            id: generate_id(),
            title: setup.title,
            created_on: now,
            modified_on: now,
            llm: setup.llm,
            project_dir: setup.project_dir,
        };
        let project = ProjectPath::new(&metadata.id)?;
        self.store.set_json(&project.metadata(), &metadata).await?;
        self.store
            .add_to_set(&KeyPath::projects(), &metadata.id)
            .await?;
        tracing::debug!(project_id = %metadata.id, "project created");
        Ok(metadata)
    }

    pub async fn get_project(&self, project_id: &str) -> anyhow::Result<Option<ProjectMetadata>> {
        let project = ProjectPath::new(project_id)?;
        Ok(self.store.get_json(&project.metadata()).await?)
    }

    /// Most recently modified first.
    pub async fn list_projects(&self) -> anyhow::Result<Vec<ProjectMetadata>> {
        let mut projects = Vec::new();
        for id in self.store.list_set(&KeyPath::projects()).await? {
            if let Some(metadata) = self.get_project(&id).await? {
                projects.push(metadata);
            }
        }
        projects.sort_by(|a, b| b.modified_on.cmp(&a.modified_on));
        Ok(projects)
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> anyhow::Result<Option<ProjectMetadata>> {
        let project = ProjectPath::new(project_id)?;
        let Some(mut metadata) = self
            .store
            .get_json::<ProjectMetadata>(&project.metadata())
            .await?
        else {
            return Ok(None);
        };
        if let Some(title) = update.title {
            metadata.title = title;
        }
        if let Some(llm) = update.llm {
            metadata.llm = llm;
        }
        if let Some(project_dir) = update.project_dir {
            metadata.project_dir = project_dir;
        }
        metadata.modified_on = Utc::now();
        self.store.set_json(&project.metadata(), &metadata).await?;
        Ok(Some(metadata))
    }

    /// Removes every key under the project, its conversation thread included,
    /// then the index entry.
    pub async fn delete_project(&self, project_id: &str) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let removed = self.store.delete_by_prefix(project.prefix()).await?;
        let indexed = self
            .store
            .remove_from_set(&KeyPath::projects(), project_id)
            .await?;
        tracing::debug!(project_id, removed, "project deleted");
        Ok(removed > 0 || indexed)
    }

    pub async fn get_project_attribute(
        &self,
        project_id: &str,
        name: &str,
    ) -> anyhow::Result<Option<Value>> {
        let key = ProjectPath::new(project_id)?.attribute(name)?;
        Ok(self.store.get_json(&key).await?)
    }

    pub async fn set_project_attribute(
        &self,
        project_id: &str,
        name: &str,
        value: &Value,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        if !self.project_exists(&project).await? {
            return Ok(false);
        }
        self.store.set_json(&project.attribute(name)?, value).await?;
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn delete_project_attribute(
        &self,
        project_id: &str,
        name: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let removed = self.store.delete_scalar(&project.attribute(name)?).await?;
        if removed {
            self.touch(&project).await?;
        }
        Ok(removed)
    }

    pub async fn last_worked_section_id(&self, project_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .get_project_attribute(project_id, LAST_WORKED_SECTION_ID)
            .await?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    pub async fn set_last_worked_section_id(
        &self,
        project_id: &str,
        section_id: &str,
    ) -> anyhow::Result<bool> {
        self.set_project_attribute(
            project_id,
            LAST_WORKED_SECTION_ID,
            &Value::String(section_id.to_string()),
        )
        .await
    }

    /// Working directory for a project: its own `projectDir` when set, the
    /// application directory otherwise.
    pub async fn resolve_project_directory(&self, project_id: &str) -> anyhow::Result<PathBuf> {
        let configured = self
            .get_project(project_id)
            .await?
            .map(|metadata| metadata.project_dir)
            .filter(|dir| !dir.trim().is_empty());
        Ok(configured
            .map(PathBuf::from)
            .unwrap_or_else(|| self.app_dir.clone()))
    }

    // ---- sections ----

    pub async fn add_section(
        &self,
        project_id: &str,
        title: &str,
        section_type: SectionType,
    ) -> anyhow::Result<Option<SectionMetadata>> {
        let project = ProjectPath::new(project_id)?;
        if !self.project_exists(&project).await? {
            return Ok(None);
        }
        let metadata = SectionMetadata {
            id: generate_id(),
            title: title.to_string(),
            section_type,
        };
        let section = project.section(&metadata.id)?;
        self.store.set_json(&section.metadata(), &metadata).await?;
        self.store
            .append_to_list(&project.sections(), &metadata.id)
            .await?;
        self.touch(&project).await?;
        Ok(Some(metadata))
    }

    pub async fn get_section(
        &self,
        project_id: &str,
        section_id: &str,
    ) -> anyhow::Result<Option<SectionMetadata>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        Ok(self.store.get_json(&section.metadata()).await?)
    }

    pub async fn list_sections(&self, project_id: &str) -> anyhow::Result<Vec<SectionMetadata>> {
        let project = ProjectPath::new(project_id)?;
        let mut sections = Vec::new();
        for id in self.store.list_all(&project.sections()).await? {
            if let Some(metadata) = self.get_section(project_id, &id).await? {
                sections.push(metadata);
            }
        }
        Ok(sections)
    }

    pub async fn rename_section(
        &self,
        project_id: &str,
        section_id: &str,
        title: &str,
    ) -> anyhow::Result<Option<SectionMetadata>> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let Some(mut metadata) = self
            .store
            .get_json::<SectionMetadata>(&section.metadata())
            .await?
        else {
            return Ok(None);
        };
        metadata.title = title.to_string();
        self.store.set_json(&section.metadata(), &metadata).await?;
        self.touch(&project).await?;
        Ok(Some(metadata))
    }

    /// Swaps the section with its neighbour. Returns false at either end of
    /// the list or when the section is unknown.
    pub async fn move_section(
        &self,
        project_id: &str,
        section_id: &str,
        direction: MoveDirection,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let direction = match direction {
            MoveDirection::Up => SwapDirection::Up,
            MoveDirection::Down => SwapDirection::Down,
        };
        let moved = self
            .store
            .swap_adjacent(&project.sections(), section_id, direction)
            .await?;
        if moved {
            self.touch(&project).await?;
        }
        Ok(moved)
    }

    pub async fn delete_section(&self, project_id: &str, section_id: &str) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let removed = self.store.delete_by_prefix(section.prefix()).await?;
        let listed = self
            .store
            .remove_first_occurrence(&project.sections(), section_id)
            .await?;
        if self.last_worked_section_id(project_id).await?.as_deref() == Some(section_id) {
            self.store
                .delete_scalar(&project.attribute(LAST_WORKED_SECTION_ID)?)
                .await?;
        }
        let deleted = removed > 0 || listed;
        if deleted {
            self.touch(&project).await?;
        }
        Ok(deleted)
    }

    pub async fn current_block_id(
        &self,
        project_id: &str,
        section_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        Ok(self.store.get_json(&section.current_block_id()).await?)
    }

    /// Points the section at one of its own blocks.
    pub async fn set_current_block_id(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        if !self.block_exists(&section.block(block_id)?).await? {
            return Ok(false);
        }
        self.store
            .set_json(&section.current_block_id(), block_id)
            .await?;
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn clear_current_block_id(
        &self,
        project_id: &str,
        section_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let cleared = self.store.delete_scalar(&section.current_block_id()).await?;
        if cleared {
            self.touch(&project).await?;
        }
        Ok(cleared)
    }

    // ---- blocks ----

    pub async fn add_block(
        &self,
        project_id: &str,
        section_id: &str,
        num_rows: u64,
    ) -> anyhow::Result<Option<BlockMetadata>> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        if self.section_type(&section).await?.is_none() {
            return Ok(None);
        }
        let metadata = BlockMetadata {
            id: generate_id(),
            num_rows,
        };
        let block = section.block(&metadata.id)?;
        self.store.set_json(&block.metadata(), &metadata).await?;
        self.store
            .append_to_list(&section.blocks(), &metadata.id)
            .await?;
        self.touch(&project).await?;
        Ok(Some(metadata))
    }

    pub async fn get_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<BlockRecord>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        let block = section.block(block_id)?;
        let Some(metadata) = self.store.get_json::<BlockMetadata>(&block.metadata()).await? else {
            return Ok(None);
        };
        let Some(section_type) = self.section_type(&section).await? else {
            return Ok(None);
        };
        Ok(Some(BlockRecord {
            metadata,
            setup: self.read_setup(&block, section_type).await?,
            generate_result: self.read_generate_result(&block, section_type).await?,
            execute_result: self.store.get_json(&block.execute_result()).await?,
            recommendations: self.store.get_json(&block.recommendations()).await?,
            datasets: self.read_datasets(&block).await?.unwrap_or_default(),
            generate_result_delivery: self.read_flag(&block.generate_result_delivered()).await?,
            execution_error_delivery: self.read_flag(&block.execution_error_delivered()).await?,
            generate_result_arming: self.store.get_json(&block.generate_result_arming()).await?,
            execution_error_arming: self.store.get_json(&block.execution_error_arming()).await?,
        }))
    }

    pub async fn list_blocks(
        &self,
        project_id: &str,
        section_id: &str,
    ) -> anyhow::Result<Vec<BlockMetadata>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        let mut blocks = Vec::new();
        for id in self.store.list_all(&section.blocks()).await? {
            if let Some(metadata) = self
                .store
                .get_json::<BlockMetadata>(&section.block(&id)?.metadata())
                .await?
            {
                blocks.push(metadata);
            }
        }
        Ok(blocks)
    }

    /// Removes the block and everything stored for it. Clears the section's
    /// current-block pointer when it pointed here.
    pub async fn delete_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let block = section.block(block_id)?;
        let removed = self.store.delete_by_prefix(block.prefix()).await?;
        let listed = self
            .store
            .remove_first_occurrence(&section.blocks(), block_id)
            .await?;
        let current: Option<String> = self.store.get_json(&section.current_block_id()).await?;
        if current.as_deref() == Some(block_id) {
            self.store.delete_scalar(&section.current_block_id()).await?;
        }
        let deleted = removed > 0 || listed;
        if deleted {
            self.touch(&project).await?;
        }
        Ok(deleted)
    }

    /// Drops setup, results, datasets and delivery flags. Metadata stays.
    pub async fn reset_block(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        let Some(metadata) = self.store.get_json::<BlockMetadata>(&block.metadata()).await? else {
            return Ok(false);
        };
        self.store.delete_by_prefix(block.prefix()).await?;
        self.store.set_json(&block.metadata(), &metadata).await?;
        self.touch(&project).await?;
        Ok(true)
    }

    /// Stores the setup. The variant must match the owning section's type.
    pub async fn set_setup(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        setup: &BlockSetup,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let block = section.block(block_id)?;
        let Some(section_type) = self.section_type(&section).await? else {
            return Ok(false);
        };
        if !self.block_exists(&block).await? {
            return Ok(false);
        }
        if setup.section_type() != section_type {
            anyhow::bail!(
                "{} setup cannot be stored on a block of a {} section",
                setup.section_type(),
                section_type
            );
        }
        self.store.set_json(&block.setup(), &setup.to_value()?).await?;
        self.touch(&project).await?;
        Ok(true)
    }

    /// Replaces the techniques recommended for the block's setup.
    pub async fn set_recommendations(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        recommendations: &[String],
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        if !self.block_exists(&block).await? {
            return Ok(false);
        }
        self.store
            .set_json(&block.recommendations(), recommendations)
            .await?;
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn get_setup(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<BlockSetup>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        let Some(section_type) = self.section_type(&section).await? else {
            return Ok(None);
        };
        self.read_setup(&section.block(block_id)?, section_type)
            .await
    }

    pub async fn clear_setup(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        let cleared = self.store.delete_scalar(&block.setup()).await?;
        if cleared {
            self.touch(&project).await?;
        }
        Ok(cleared)
    }

    /// Stores a new generation result and re-arms its delivery flag.
    pub async fn set_generate_result(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        result: &GenerateResult,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let section = project.section(section_id)?;
        let block = section.block(block_id)?;
        let Some(section_type) = self.section_type(&section).await? else {
            return Ok(false);
        };
        if !self.block_exists(&block).await? {
            return Ok(false);
        }
        if result.section_type() != section_type {
            anyhow::bail!(
                "{} result cannot be stored on a block of a {} section",
                result.section_type(),
                section_type
            );
        }
        self.store
            .set_json(&block.generate_result(), &result.to_value()?)
            .await?;
        self.rearm(&block.generate_result_arming(), &block.generate_result_delivered())
            .await?;
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn get_generate_result(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let section = ProjectPath::new(project_id)?.section(section_id)?;
        let Some(section_type) = self.section_type(&section).await? else {
            return Ok(None);
        };
        self.read_generate_result(&section.block(block_id)?, section_type)
            .await
    }

    /// Stores the latest execution outcome. The error delivery flag is
    /// re-armed only when the outcome carries an error.
    pub async fn set_execute_result(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        result: &ExecuteResult,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        if !self.block_exists(&block).await? {
            return Ok(false);
        }
        self.store.set_json(&block.execute_result(), result).await?;
        if result.error_text().is_some() {
            self.rearm(&block.execution_error_arming(), &block.execution_error_delivered())
                .await?;
        }
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn get_execute_result(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<ExecuteResult>> {
        let block = ProjectPath::new(project_id)?
            .section(section_id)?
            .block(block_id)?;
        Ok(self.store.get_json(&block.execute_result()).await?)
    }

    /// Replaces the block's datasets. An empty map clears them.
    pub async fn set_datasets(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
        datasets: &Datasets,
    ) -> anyhow::Result<bool> {
        if datasets.is_empty() {
            return self.clear_datasets(project_id, section_id, block_id).await;
        }
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        if !self.block_exists(&block).await? {
            return Ok(false);
        }
        let mut encoded = Map::new();
        for (name, batch) in datasets {
            let payload = codec::encode_table(batch)
                .with_context(|| format!("encoding dataset `{name}`"))?;
            encoded.insert(name.clone(), Value::String(payload));
        }
        self.store
            .set_json(&block.data(), &Value::Object(encoded))
            .await?;
        self.touch(&project).await?;
        Ok(true)
    }

    pub async fn get_datasets(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<Datasets>> {
        let block = ProjectPath::new(project_id)?
            .section(section_id)?
            .block(block_id)?;
        self.read_datasets(&block).await
    }

    pub async fn clear_datasets(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        let cleared = self.store.delete_scalar(&block.data()).await?;
        if cleared {
            self.touch(&project).await?;
        }
        Ok(cleared)
    }

    pub async fn generate_result_delivery(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<DeliveryState>> {
        let block = ProjectPath::new(project_id)?
            .section(section_id)?
            .block(block_id)?;
        self.read_flag(&block.generate_result_delivered()).await
    }

    pub async fn execution_error_delivery(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<Option<DeliveryState>> {
        let block = ProjectPath::new(project_id)?
            .section(section_id)?
            .block(block_id)?;
        self.read_flag(&block.execution_error_delivered()).await
    }

    pub async fn mark_generate_result_delivered(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        self.mark_delivered(&project, &block, block.generate_result_delivered())
            .await
    }

    pub async fn mark_execution_error_delivered(
        &self,
        project_id: &str,
        section_id: &str,
        block_id: &str,
    ) -> anyhow::Result<bool> {
        let project = ProjectPath::new(project_id)?;
        let block = project.section(section_id)?.block(block_id)?;
        self.mark_delivered(&project, &block, block.execution_error_delivered())
            .await
    }

    // ---- settings ----

    pub async fn set_settings(
        &self,
        section_type: SettingsSectionType,
        key: &str,
        value: &Value,
    ) -> anyhow::Result<()> {
        let path = KeyPath::settings(section_type.as_str(), key)?;
        self.store.set_json(&path, value).await?;
        Ok(())
    }

    pub async fn get_settings(
        &self,
        section_type: SettingsSectionType,
        key: &str,
    ) -> anyhow::Result<Option<Value>> {
        let path = KeyPath::settings(section_type.as_str(), key)?;
        Ok(self.store.get_json(&path).await?)
    }

    pub async fn list_settings(
        &self,
        section_type: SettingsSectionType,
    ) -> anyhow::Result<Vec<SettingsEntry>> {
        let prefix = KeyPath::settings_prefix(Some(section_type.as_str()))?;
        let mut entries = Vec::new();
        for path in self.store.keys_with_prefix(&prefix).await? {
            if let Some(value) = self.store.get_json::<Value>(&path).await? {
                entries.push(SettingsEntry {
                    section_type,
                    key: path.leaf().to_string(),
                    value,
                });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub async fn list_all_settings(&self) -> anyhow::Result<Vec<SettingsEntry>> {
        let mut entries = self.list_settings(SettingsSectionType::Llm).await?;
        entries.extend(self.list_settings(SettingsSectionType::Integration).await?);
        Ok(entries)
    }

    pub async fn delete_settings(
        &self,
        section_type: SettingsSectionType,
        key: &str,
    ) -> anyhow::Result<bool> {
        let path = KeyPath::settings(section_type.as_str(), key)?;
        Ok(self.store.delete_scalar(&path).await?)
    }

    // ---- aggregate reads ----

    /// Pipeline graph over every non-orchestration block that has both a
    /// setup and generated code. Orchestration code generation uses it as
    /// context.
    pub async fn build_dag(&self, project_id: &str) -> anyhow::Result<PipelineDag> {
        let mut dag = PipelineDag::default();
        for section in self.list_sections(project_id).await? {
            if section.section_type == SectionType::Orchestration {
                continue;
            }
            let section_file_name = standardize_name(&format!(
                "{}_{}",
                section.section_type.lowercase(),
                section.title
            ));
            for block in self.list_blocks(project_id, &section.id).await? {
                let setup = self.get_setup(project_id, &section.id, &block.id).await?;
                let result = self
                    .get_generate_result(project_id, &section.id, &block.id)
                    .await?;
                let (Some(setup), Some(result)) = (setup, result) else {
                    continue;
                };
                let mut node = result.node_fields()?;
                node.insert("tool".to_string(), Value::String(setup.tool().to_string()));
                if setup.is_dbt() {
                    for key in ["project_name", "project_dir", "profile_name"] {
                        node.insert(key.to_string(), Value::String(section_file_name.clone()));
                    }
                    node.insert(
                        "profile_dir".to_string(),
                        Value::String(DBT_PROFILES_DIR.to_string()),
                    );
                    node.insert(
                        "target".to_string(),
                        Value::String(standardize_name(setup.source().unwrap_or_default())),
                    );
                } else {
                    node.insert(
                        "file".to_string(),
                        Value::String(format!("{section_file_name}.py")),
                    );
                }
                if let Some((_, source_block_id)) = setup.source_link() {
                    dag.adj_list
                        .entry(source_block_id.to_string())
                        .or_default()
                        .push(block.id.clone());
                }
                dag.node_definitions.insert(block.id, node);
            }
        }
        for node in dag.node_definitions.keys() {
            dag.adj_list.entry(node.clone()).or_default();
        }
        tracing::debug!(
            project_id,
            nodes = dag.node_definitions.len(),
            "pipeline dag built"
        );
        Ok(dag)
    }

    /// Everything a client needs to render a project in one read.
    pub async fn project_view(&self, project_id: &str) -> anyhow::Result<Option<ProjectView>> {
        let Some(metadata) = self.get_project(project_id).await? else {
            return Ok(None);
        };
        let mut sections = Vec::new();
        for section in self.list_sections(project_id).await? {
            let mut blocks = Vec::new();
            for block in self.list_blocks(project_id, &section.id).await? {
                let Some(record) = self.get_block(project_id, &section.id, &block.id).await?
                else {
                    continue;
                };
                let rows = usize::try_from(record.metadata.num_rows).unwrap_or(usize::MAX);
                let mut data = BTreeMap::new();
                for (name, batch) in &record.datasets {
                    data.insert(name.clone(), codec::table_preview(batch, rows)?);
                }
                blocks.push(BlockView {
                    metadata: record.metadata,
                    setup: record.setup,
                    generate_result: record.generate_result,
                    execute_result: record.execute_result,
                    recommendations: record.recommendations,
                    data,
                });
            }
            sections.push(SectionView {
                current_block_id: self.current_block_id(project_id, &section.id).await?,
                metadata: section,
                blocks,
            });
        }
        let messages = load_checkpoint(self.store.as_ref(), project_id)
            .await?
            .map(|checkpoint| checkpoint.transcript())
            .unwrap_or_default();
        Ok(Some(ProjectView {
            last_worked_section_id: self.last_worked_section_id(project_id).await?,
            metadata,
            sections,
            messages,
        }))
    }

    // ---- helpers ----

    async fn project_exists(&self, project: &ProjectPath) -> anyhow::Result<bool> {
        Ok(self
            .store
            .get_scalar(&project.metadata())
            .await?
            .is_some())
    }

    async fn block_exists(&self, block: &BlockPath) -> anyhow::Result<bool> {
        Ok(self.store.get_scalar(&block.metadata()).await?.is_some())
    }

    async fn section_type(&self, section: &SectionPath) -> anyhow::Result<Option<SectionType>> {
        Ok(self
            .store
            .get_json::<SectionMetadata>(&section.metadata())
            .await?
            .map(|metadata| metadata.section_type))
    }

    async fn read_setup(
        &self,
        block: &BlockPath,
        section_type: SectionType,
    ) -> anyhow::Result<Option<BlockSetup>> {
        let Some(raw) = self.store.get_json::<Value>(&block.setup()).await? else {
            return Ok(None);
        };
        let setup = BlockSetup::from_value(section_type, raw)
            .with_context(|| format!("decoding setup at {}", block.setup()))?;
        Ok(Some(setup))
    }

    async fn read_generate_result(
        &self,
        block: &BlockPath,
        section_type: SectionType,
    ) -> anyhow::Result<Option<GenerateResult>> {
        let Some(raw) = self
            .store
            .get_json::<Value>(&block.generate_result())
            .await?
        else {
            return Ok(None);
        };
        let result = GenerateResult::from_value(section_type, raw)
            .with_context(|| format!("decoding generate result at {}", block.generate_result()))?;
        Ok(Some(result))
    }

    async fn read_datasets(&self, block: &BlockPath) -> anyhow::Result<Option<Datasets>> {
        let Some(raw) = self
            .store
            .get_json::<BTreeMap<String, String>>(&block.data())
            .await?
        else {
            return Ok(None);
        };
        let mut datasets = Datasets::new();
        for (name, payload) in raw {
            let batch = codec::decode_table(&payload)
                .with_context(|| format!("decoding dataset `{name}`"))?;
            datasets.insert(name, batch);
        }
        Ok(Some(datasets))
    }

    async fn read_flag(&self, key: &KeyPath) -> anyhow::Result<Option<DeliveryState>> {
        Ok(self
            .store
            .get_json::<bool>(key)
            .await?
            .map(DeliveryState::from_flag))
    }

    /// Writes a fresh arming token, then flips the flag back to pending.
    async fn rearm(&self, arming: &KeyPath, flag: &KeyPath) -> anyhow::Result<()> {
        self.store.set_json(arming, &generate_id()).await?;
        self.store
            .set_json(flag, &DeliveryState::Pending.as_flag())
            .await?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        project: &ProjectPath,
        block: &BlockPath,
        flag: KeyPath,
    ) -> anyhow::Result<bool> {
        if !self.block_exists(block).await? {
            return Ok(false);
        }
        self.store
            .set_json(&flag, &DeliveryState::Delivered.as_flag())
            .await?;
        self.touch(project).await?;
        Ok(true)
    }

    async fn touch(&self, project: &ProjectPath) -> anyhow::Result<()> {
        let key = project.metadata();
        let Some(mut metadata) = self.store.get_json::<ProjectMetadata>(&key).await? else {
            return Ok(());
        };
        metadata.modified_on = Utc::now();
        self.store.set_json(&key, &metadata).await?;
        Ok(())
    }
}

pub(crate) fn standardize_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use serde_json::json;
    use splicing_store::SqliteStore;
    use splicing_types::{
        CleaningSetup, DbtGenerateResult, OrchestrationSetup, PythonGenerateResult,
        TransformationGenerateResult, TransformationSetup,
    };

    async fn pipeline() -> PipelineStore {
        let store = SqliteStore::open_in_memory().await.expect("store");
        PipelineStore::new(Arc::new(store), "/srv/splicing")
    }

    async fn project(pipeline: &PipelineStore) -> ProjectMetadata {
        pipeline
            .create_project(ProjectSetup {
                title: "Orders".to_string(),
                llm: LlmType::OpenAi,
                project_dir: String::new(),
            })
            .await
            .expect("project")
    }

    fn python_result(name: &str) -> PythonGenerateResult {
        PythonGenerateResult {
            function_name: name.to_string(),
            function_args: Map::new(),
            return_value: None,
            code: format!("def {name}(df):\n    return df"),
            packages: None,
        }
    }

    fn cleaning_setup(source_section: &str, source_block: &str) -> BlockSetup {
        BlockSetup::Cleaning(CleaningSetup {
            source: "python".to_string(),
            tool: "pandas".to_string(),
            source_section_id: source_section.to_string(),
            source_block_id: source_block.to_string(),
            source_details: String::new(),
            provide_recommendation: true,
        })
    }

    fn orders_batch() -> RecordBatch {
        let columns: Vec<(&str, ArrayRef)> = vec![
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3]))),
            ("status", Arc::new(StringArray::from(vec!["new", "paid", "sent"]))),
        ];
        RecordBatch::try_from_iter(columns).expect("batch")
    }

    #[tokio::test]
    async fn missing_entities_read_as_none() {
        let pipeline = pipeline().await;
        assert!(pipeline.get_project("nope").await.expect("get").is_none());
        assert!(pipeline.get_section("nope", "s").await.expect("get").is_none());
        assert!(pipeline
            .get_block("nope", "s", "b")
            .await
            .expect("get")
            .is_none());
        assert!(pipeline
            .add_section("nope", "Load", SectionType::Movement)
            .await
            .expect("add")
            .is_none());
        assert!(pipeline.project_view("nope").await.expect("view").is_none());
    }

    #[tokio::test]
    async fn sections_keep_creation_order_and_move_by_swap() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        let mut ids = Vec::new();
        for (title, kind) in [
            ("Load", SectionType::Movement),
            ("Clean", SectionType::Cleaning),
            ("Model", SectionType::Transformation),
        ] {
            let section = pipeline
                .add_section(&project.id, title, kind)
                .await
                .expect("add")
                .expect("section");
            ids.push(section.id);
        }
        let titles = |sections: Vec<SectionMetadata>| {
            sections.into_iter().map(|s| s.title).collect::<Vec<_>>()
        };
        assert_eq!(
            titles(pipeline.list_sections(&project.id).await.expect("list")),
            ["Load", "Clean", "Model"]
        );

        assert!(!pipeline
            .move_section(&project.id, &ids[0], MoveDirection::Up)
            .await
            .expect("move"));
        assert!(pipeline
            .move_section(&project.id, &ids[2], MoveDirection::Up)
            .await
            .expect("move"));
        assert_eq!(
            titles(pipeline.list_sections(&project.id).await.expect("list")),
            ["Load", "Model", "Clean"]
        );

        pipeline
            .set_last_worked_section_id(&project.id, &ids[1])
            .await
            .expect("last worked");
        assert!(pipeline
            .delete_section(&project.id, &ids[1])
            .await
            .expect("delete"));
        assert_eq!(
            titles(pipeline.list_sections(&project.id).await.expect("list")),
            ["Load", "Model"]
        );
        assert!(pipeline
            .last_worked_section_id(&project.id)
            .await
            .expect("last worked")
            .is_none());
    }

    #[tokio::test]
    async fn deleting_current_block_clears_pointer() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        let section = pipeline
            .add_section(&project.id, "Clean", SectionType::Cleaning)
            .await
            .expect("add")
            .expect("section");
        let first = pipeline
            .add_block(&project.id, &section.id, 10)
            .await
            .expect("add")
            .expect("block");
        let second = pipeline
            .add_block(&project.id, &section.id, 10)
            .await
            .expect("add")
            .expect("block");
        assert!(pipeline
            .set_current_block_id(&project.id, &section.id, &second.id)
            .await
            .expect("select"));
        assert!(!pipeline
            .set_current_block_id(&project.id, &section.id, "ghost")
            .await
            .expect("select"));

        assert!(pipeline
            .delete_block(&project.id, &section.id, &second.id)
            .await
            .expect("delete"));
        assert!(pipeline
            .current_block_id(&project.id, &section.id)
            .await
            .expect("current")
            .is_none());
        let remaining = pipeline
            .list_blocks(&project.id, &section.id)
            .await
            .expect("list");
        assert_eq!(remaining, vec![first]);
    }

    #[tokio::test]
    async fn setup_variant_must_match_section_type() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        let section = pipeline
            .add_section(&project.id, "Model", SectionType::Transformation)
            .await
            .expect("add")
            .expect("section");
        let block = pipeline
            .add_block(&project.id, &section.id, 10)
            .await
            .expect("add")
            .expect("block");

        let err = pipeline
            .set_setup(&project.id, &section.id, &block.id, &cleaning_setup("", ""))
            .await
            .expect_err("mismatch");
        assert!(err.to_string().contains("Cleaning setup"));

        let setup = BlockSetup::Transformation(TransformationSetup {
            source: "duckdb".to_string(),
            tool: "dbt".to_string(),
            source_section_id: String::new(),
            source_block_id: String::new(),
            source_details: "orders table".to_string(),
            provide_recommendation: false,
        });
        assert!(pipeline
            .set_setup(&project.id, &section.id, &block.id, &setup)
            .await
            .expect("setup"));
        assert_eq!(
            pipeline
                .get_setup(&project.id, &section.id, &block.id)
                .await
                .expect("get"),
            Some(setup)
        );
    }

    #[tokio::test]
    async fn results_arm_delivery_flags() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        let section = pipeline
            .add_section(&project.id, "Clean", SectionType::Cleaning)
            .await
            .expect("add")
            .expect("section");
        let block = pipeline
            .add_block(&project.id, &section.id, 10)
            .await
            .expect("add")
            .expect("block");
        let (p, s, b) = (&project.id, &section.id, &block.id);

        assert_eq!(pipeline.generate_result_delivery(p, s, b).await.expect("flag"), None);
        let result = GenerateResult::Cleaning(python_result("clean"));
        pipeline
            .set_generate_result(p, s, b, &result)
            .await
            .expect("result");
        assert_eq!(
            pipeline.generate_result_delivery(p, s, b).await.expect("flag"),
            Some(DeliveryState::Pending)
        );
        pipeline
            .mark_generate_result_delivered(p, s, b)
            .await
            .expect("mark");
        assert_eq!(
            pipeline.generate_result_delivery(p, s, b).await.expect("flag"),
            Some(DeliveryState::Delivered)
        );
        let first_arming = pipeline
            .get_block(p, s, b)
            .await
            .expect("get")
            .expect("block")
            .generate_result_arming
            .expect("arming");
        pipeline
            .set_generate_result(p, s, b, &result)
            .await
            .expect("result");
        assert_eq!(
            pipeline.generate_result_delivery(p, s, b).await.expect("flag"),
            Some(DeliveryState::Pending)
        );
        let second_arming = pipeline
            .get_block(p, s, b)
            .await
            .expect("get")
            .expect("block")
            .generate_result_arming
            .expect("arming");
        assert_ne!(first_arming, second_arming);

        pipeline
            .set_execute_result(p, s, b, &ExecuteResult::default())
            .await
            .expect("execute");
        assert_eq!(pipeline.execution_error_delivery(p, s, b).await.expect("flag"), None);
        pipeline
            .set_execute_result(
                p,
                s,
                b,
                &ExecuteResult {
                    return_value: None,
                    error: Some("boom".to_string()),
                },
            )
            .await
            .expect("execute");
        assert_eq!(
            pipeline.execution_error_delivery(p, s, b).await.expect("flag"),
            Some(DeliveryState::Pending)
        );
    }

    #[tokio::test]
    async fn reset_block_keeps_only_metadata() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
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
        let (p, s, b) = (&project.id, &section.id, &block.id);
        pipeline
            .set_setup(p, s, b, &cleaning_setup("", ""))
            .await
            .expect("setup");
        pipeline
            .set_generate_result(p, s, b, &GenerateResult::Cleaning(python_result("f")))
            .await
            .expect("result");
        pipeline
            .set_datasets(p, s, b, &Datasets::from([("result".to_string(), orders_batch())]))
            .await
            .expect("datasets");

        assert!(pipeline.reset_block(p, s, b).await.expect("reset"));
        let record = pipeline
            .get_block(p, s, b)
            .await
            .expect("get")
            .expect("block");
        assert_eq!(record.metadata, block);
        assert!(record.setup.is_none());
        assert!(record.generate_result.is_none());
        assert!(record.datasets.is_empty());
        assert!(record.generate_result_delivery.is_none());
    }

    #[tokio::test]
    async fn project_view_previews_datasets_and_dag_links_blocks() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        let load = pipeline
            .add_section(&project.id, "Load Orders", SectionType::Movement)
            .await
            .expect("add")
            .expect("section");
        let model = pipeline
            .add_section(&project.id, "Model", SectionType::Transformation)
            .await
            .expect("add")
            .expect("section");
        let orchestrate = pipeline
            .add_section(&project.id, "Schedule", SectionType::Orchestration)
            .await
            .expect("add")
            .expect("section");
        let load_block = pipeline
            .add_block(&project.id, &load.id, 2)
            .await
            .expect("add")
            .expect("block");
        let model_block = pipeline
            .add_block(&project.id, &model.id, 2)
            .await
            .expect("add")
            .expect("block");
        let dag_block = pipeline
            .add_block(&project.id, &orchestrate.id, 2)
            .await
            .expect("add")
            .expect("block");

        let movement = BlockSetup::from_value(
            SectionType::Movement,
            json!({"tool": "python", "source": "s3", "destination": "python"}),
        )
        .expect("movement setup");
        pipeline
            .set_setup(&project.id, &load.id, &load_block.id, &movement)
            .await
            .expect("setup");
        pipeline
            .set_generate_result(
                &project.id,
                &load.id,
                &load_block.id,
                &GenerateResult::Movement(python_result("load")),
            )
            .await
            .expect("result");
        pipeline
            .set_datasets(
                &project.id,
                &load.id,
                &load_block.id,
                &Datasets::from([("result".to_string(), orders_batch())]),
            )
            .await
            .expect("datasets");

        let dbt = BlockSetup::Transformation(TransformationSetup {
            source: "DuckDB".to_string(),
            tool: "dbt".to_string(),
            source_section_id: load.id.clone(),
            source_block_id: load_block.id.clone(),
            source_details: String::new(),
            provide_recommendation: true,
        });
        pipeline
            .set_setup(&project.id, &model.id, &model_block.id, &dbt)
            .await
            .expect("setup");
        pipeline
            .set_generate_result(
                &project.id,
                &model.id,
                &model_block.id,
                &GenerateResult::Transformation(TransformationGenerateResult::Dbt(
                    DbtGenerateResult {
                        model_name: "orders_clean".to_string(),
                        model: "select 1".to_string(),
                        properties: "version: 2".to_string(),
                    },
                )),
            )
            .await
            .expect("result");
        pipeline
            .set_setup(
                &project.id,
                &orchestrate.id,
                &dag_block.id,
                &BlockSetup::Orchestration(OrchestrationSetup {
                    tool: "airflow".to_string(),
                    description: "daily".to_string(),
                }),
            )
            .await
            .expect("setup");

        let dag = pipeline.build_dag(&project.id).await.expect("dag");
        assert_eq!(dag.node_definitions.len(), 2);
        assert_eq!(dag.adj_list[&load_block.id], vec![model_block.id.clone()]);
        assert!(dag.adj_list[&model_block.id].is_empty());
        let load_node = &dag.node_definitions[&load_block.id];
        assert_eq!(load_node["file"], json!("movement_load_orders.py"));
        assert!(load_node.get("code").is_none());
        let model_node = &dag.node_definitions[&model_block.id];
        assert_eq!(model_node["target"], json!("duckdb"));
        assert_eq!(model_node["profile_dir"], json!("dbt_profiles"));
        assert!(model_node.get("model").is_none());

        let view = pipeline
            .project_view(&project.id)
            .await
            .expect("view")
            .expect("project");
        assert_eq!(view.sections.len(), 3);
        let preview = &view.sections[0].blocks[0].data["result"];
        assert_eq!(preview.as_array().map(Vec::len), Some(2));
        assert_eq!(preview[0]["status"], json!("new"));
        assert!(view.messages.is_empty());
    }

    #[tokio::test]
    async fn scoped_writes_refresh_modified_on() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pipeline
            .add_section(&project.id, "Load", SectionType::Movement)
            .await
            .expect("add");
        let refreshed = pipeline
            .get_project(&project.id)
            .await
            .expect("get")
            .expect("project");
        assert!(refreshed.modified_on > project.modified_on);
        assert_eq!(refreshed.created_on, project.created_on);
    }

    #[tokio::test]
    async fn project_directory_falls_back_to_app_dir() {
        let pipeline = pipeline().await;
        let project = project(&pipeline).await;
        assert_eq!(
            pipeline
                .resolve_project_directory(&project.id)
                .await
                .expect("dir"),
            PathBuf::from("/srv/splicing")
        );
        pipeline
            .update_project(
                &project.id,
                ProjectUpdate {
                    project_dir: Some("/work/orders".to_string()),
                    ..ProjectUpdate::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(
            pipeline
                .resolve_project_directory(&project.id)
                .await
                .expect("dir"),
            PathBuf::from("/work/orders")
        );
    }

    #[tokio::test]
    async fn settings_are_listed_per_section_type() {
        let pipeline = pipeline().await;
        pipeline
            .set_settings(
                SettingsSectionType::Llm,
                "OpenAI",
                &json!({"apiKey": "sk-1", "model": "gpt-4o"}),
            )
            .await
            .expect("set");
        pipeline
            .set_settings(SettingsSectionType::Integration, "DuckDB", &json!({"path": "db"}))
            .await
            .expect("set");

        let llm = pipeline
            .list_settings(SettingsSectionType::Llm)
            .await
            .expect("list");
        assert_eq!(llm.len(), 1);
        assert_eq!(llm[0].key, "OpenAI");
        assert_eq!(llm[0].value["model"], json!("gpt-4o"));
        assert_eq!(pipeline.list_all_settings().await.expect("all").len(), 2);

        assert!(pipeline
            .delete_settings(SettingsSectionType::Llm, "OpenAI")
            .await
            .expect("delete"));
        assert!(pipeline
            .get_settings(SettingsSectionType::Llm, "OpenAI")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn delete_project_removes_index_entry() {
        let pipeline = pipeline().await;
        let keep = project(&pipeline).await;
        let drop = project(&pipeline).await;
        pipeline
            .add_section(&drop.id, "Load", SectionType::Movement)
            .await
            .expect("add");
        assert!(pipeline.delete_project(&drop.id).await.expect("delete"));
        let ids = pipeline
            .list_projects()
            .await
            .expect("list")
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![keep.id]);
        assert!(!pipeline.delete_project(&drop.id).await.expect("again"));
    }
}
