//! Seams to the systems the engine drives but does not implement: model
//! providers, code generation and code execution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use splicing_observability::redact_text;
use splicing_providers::{Provider, ProviderConfig, ProviderRegistry, ProvidersConfig};
use splicing_store::codec;
use splicing_types::{
    BlockSetup, GenerateResult, Message, ProjectMetadata, SectionType, SettingsSectionType,
    TranscriptEntry, TransformationGenerateResult,
};
use tokio::process::Command;

use crate::pipeline::{standardize_name, Datasets, PipelineDag, PipelineStore};
use crate::prompts::PromptLibrary;

/// Resolves the model provider a project talks to.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    async fn provider_for(&self, project: &ProjectMetadata) -> anyhow::Result<Arc<dyn Provider>>;
}

/// Builds providers from engine config overlaid with the stored LLM settings
/// for the project's model family.
#[derive(Clone)]
pub struct SettingsProviders {
    registry: ProviderRegistry,
    pipeline: PipelineStore,
    base: ProvidersConfig,
}

impl SettingsProviders {
    pub fn new(registry: ProviderRegistry, pipeline: PipelineStore, base: ProvidersConfig) -> Self {
        Self {
            registry,
            pipeline,
            base,
        }
    }
}

#[async_trait]
impl ProviderSource for SettingsProviders {
    async fn provider_for(&self, project: &ProjectMetadata) -> anyhow::Result<Arc<dyn Provider>> {
        let provider_id = project.llm.provider_id();
        let base = self
            .base
            .providers
            .get(provider_id)
            .cloned()
            .unwrap_or_default();
        let stored = match self
            .pipeline
            .get_settings(SettingsSectionType::Llm, project.llm.as_str())
            .await?
        {
            Some(value) => serde_json::from_value::<ProviderConfig>(value).with_context(|| {
                format!("invalid {} settings", project.llm.as_str())
            })?,
            None => ProviderConfig::default(),
        };
        self.registry
            .configure(provider_id, base.overlay(&stored))
            .await
            .with_context(|| format!("configuring provider for project `{}`", project.id))
    }
}

/// Column layout of a dataset: `(name, data type, nullable)`.
pub type DatasetSchema = Vec<(String, String, bool)>;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub project: ProjectMetadata,
    pub section_id: String,
    pub block_id: String,
    pub section_type: SectionType,
    pub setup: BlockSetup,
    /// Visible conversation so far.
    pub context: Vec<TranscriptEntry>,
    /// Schemas of the upstream block's datasets, when the block reads one.
    pub datasets: BTreeMap<String, DatasetSchema>,
    /// Present for orchestration blocks only.
    pub dag: Option<PipelineDag>,
}

#[derive(Debug, Clone)]
pub struct RecommendRequest {
    pub project: ProjectMetadata,
    pub section_type: SectionType,
    /// Schemas of the upstream block's datasets. Never empty.
    pub datasets: BTreeMap<String, DatasetSchema>,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResult>;

    /// Techniques worth applying to the request's datasets. Generators
    /// without an opinion recommend nothing.
    async fn recommend(&self, _request: &RecommendRequest) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub project_id: String,
    pub section_id: String,
    pub block_id: String,
    pub section_type: SectionType,
    pub setup: BlockSetup,
    pub generate_result: GenerateResult,
    pub project_dir: PathBuf,
    /// Datasets of the upstream block, when linked.
    pub inputs: Datasets,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub return_value: Option<String>,
    pub datasets: Datasets,
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> anyhow::Result<ExecutionOutput>;
}

/// Asks the project's model for a JSON object shaped like the section's
/// generation result.
pub struct ModelCodeGenerator {
    providers: Arc<dyn ProviderSource>,
    prompts: Arc<PromptLibrary>,
}

impl ModelCodeGenerator {
    pub fn new(providers: Arc<dyn ProviderSource>, prompts: Arc<PromptLibrary>) -> Self {
        Self { providers, prompts }
    }

    fn messages(&self, request: &GenerateRequest) -> anyhow::Result<Vec<Message>> {
        let system = self.prompts.render(
            "generate",
            "system_message",
            &[
                ("section_type", request.section_type.lowercase()),
                (
                    "result_shape",
                    result_shape(request.section_type, request.setup.is_dbt()),
                ),
            ],
        )?;
        let setup = serde_json::to_string_pretty(&request.setup.to_value()?)?;
        let context = request
            .context
            .iter()
            .filter(|entry| !entry.content.trim().is_empty())
            .map(|entry| format!("{}: {}", entry.role.as_str(), entry.content))
            .collect::<Vec<_>>()
            .join("\n");
        let datasets = describe_datasets(&request.datasets);
        let dag = match &request.dag {
            Some(dag) => serde_json::to_string_pretty(dag)?,
            None => "none".to_string(),
        };
        let user = self.prompts.render(
            "generate",
            "user_message",
            &[
                ("setup", &setup),
                ("context", &context),
                ("datasets", &datasets),
                ("dag", &dag),
            ],
        )?;
        Ok(vec![Message::system(system), Message::user(user)])
    }
}

#[derive(Debug, Deserialize)]
struct RecommendReply {
    recommendations: Option<Vec<String>>,
}

#[async_trait]
impl CodeGenerator for ModelCodeGenerator {
    async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResult> {
        let provider = self.providers.provider_for(&request.project).await?;
        let messages = self.messages(request)?;
        let turn = provider.invoke(&messages, None).await?;
        let value = reply_object(&turn.content)?;
        let result = GenerateResult::from_value(request.section_type, value)
            .context("model response does not match the generation result shape")?;
        if request.setup.is_dbt() != result.is_dbt() {
            anyhow::bail!(
                "model returned a {} result for a {} block",
                if result.is_dbt() { "dbt" } else { "python" },
                request.setup.tool()
            );
        }
        Ok(result)
    }

    async fn recommend(&self, request: &RecommendRequest) -> anyhow::Result<Vec<String>> {
        let provider = self.providers.provider_for(&request.project).await?;
        let section_type = request.section_type.lowercase();
        let datasets = describe_datasets(&request.datasets);
        let messages = vec![
            Message::system(self.prompts.render(
                "recommend",
                "system_message",
                &[("section_type", section_type)],
            )?),
            Message::user(self.prompts.render(
                "recommend",
                "user_message",
                &[
                    ("section_type", section_type),
                    ("datasets", datasets.as_str()),
                ],
            )?),
        ];
        let turn = provider.invoke(&messages, None).await?;
        let value = reply_object(&turn.content)?;
        let reply: RecommendReply = serde_json::from_value(value)
            .context("model response does not list recommendations")?;
        Ok(reply
            .recommendations
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }
}

fn result_shape(section_type: SectionType, dbt: bool) -> &'static str {
    match section_type {
        SectionType::Transformation if dbt => {
            r#"{"modelName": string, "model": string (dbt SQL), "properties": string (dbt properties YAML)}"#
        }
        SectionType::Orchestration => r#"{"dagName": string, "code": string}"#,
        SectionType::Movement | SectionType::Cleaning | SectionType::Transformation => {
            r#"{"functionName": string, "functionArgs": object, "returnValue": string | null, "code": string, "packages": [string] | null}"#
        }
    }
}

/// One `name:` line per dataset followed by its columns, or `none`.
fn describe_datasets(datasets: &BTreeMap<String, DatasetSchema>) -> String {
    if datasets.is_empty() {
        return "none".to_string();
    }
    datasets
        .iter()
        .map(|(name, columns)| {
            let columns = columns
                .iter()
                .map(|(column, data_type, nullable)| {
                    let null = if *nullable { " (nullable)" } else { "" };
                    format!("  - {column}: {data_type}{null}")
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("name: {name}\n{columns}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The JSON object in a model reply. The reply itself is logged only in
/// redacted form.
fn reply_object(content: &str) -> anyhow::Result<Value> {
    extract_json_object(content)
        .inspect_err(|_| {
            tracing::warn!(reply = %redact_text(content), "model reply is not a JSON object");
        })
        .context("model response did not contain a JSON object")
}

/// First `{` through last `}` of `raw`, parsed. Tolerates code fences and
/// surrounding prose.
fn extract_json_object(raw: &str) -> anyhow::Result<Value> {
    let start = raw.find('{').context("no `{` in response")?;
    let end = raw.rfind('}').context("no `}` in response")?;
    anyhow::ensure!(end > start, "unbalanced JSON object");
    Ok(serde_json::from_str(&raw[start..=end])?)
}

/// Runs generated Python functions with a local interpreter inside the
/// project directory. The first upstream dataset is handed to the function as
/// a pandas DataFrame named `df`; a returned DataFrame or Series becomes the
/// `result` dataset, anything else is captured through its `repr`. dbt models
/// and DAGs are not run.
#[derive(Debug, Clone)]
pub struct PythonScriptExecutor {
    interpreter: String,
}

impl Default for PythonScriptExecutor {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

impl PythonScriptExecutor {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

/// Dataset name a returned DataFrame is stored under.
const RESULT_DATASET: &str = "result";

const SCRIPT_RUNNER: &str = r#"

if __name__ == "__main__":
    import json as _json
    import sys as _sys
    _args = _json.loads(_sys.argv[1])
    if _sys.argv[2]:
        import pandas as _pd
        _args["df"] = _pd.read_parquet(_sys.argv[2])
    _result = FUNCTION_NAME(**_args)
    if type(_result).__name__ == "Series":
        _result = _result.to_frame()
    if type(_result).__name__ == "DataFrame":
        _result.to_parquet(_sys.argv[3])
    else:
        print(repr(_result))
"#;

/// File stem for a generated function's script. Only `[a-z0-9_]` survive, so
/// the files always land directly inside the project directory.
fn script_stem(function_name: &str) -> String {
    let stem = standardize_name(function_name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>();
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "block".to_string()
    } else {
        stem.to_string()
    }
}

#[async_trait]
impl CodeExecutor for PythonScriptExecutor {
    async fn execute(&self, request: &ExecuteRequest) -> anyhow::Result<ExecutionOutput> {
        let python = match &request.generate_result {
            GenerateResult::Movement(python)
            | GenerateResult::Cleaning(python)
            | GenerateResult::Transformation(TransformationGenerateResult::Python(python)) => {
                python
            }
            GenerateResult::Transformation(TransformationGenerateResult::Dbt(dbt)) => {
                anyhow::bail!("dbt model `{}` cannot be run as a script", dbt.model_name)
            }
            GenerateResult::Orchestration(dag) => {
                anyhow::bail!("DAG `{}` cannot be run as a script", dag.dag_name)
            }
        };
        tokio::fs::create_dir_all(&request.project_dir)
            .await
            .with_context(|| format!("creating {}", request.project_dir.display()))?;
        let stem = script_stem(&python.function_name);
        let script_path = request.project_dir.join(format!("{stem}.py"));
        let input_path = request.project_dir.join(format!("{stem}_input.parquet"));
        let output_path = request.project_dir.join(format!("{stem}_output.parquet"));
        let script = format!(
            "{}{}",
            python.code,
            SCRIPT_RUNNER.replace("FUNCTION_NAME", &python.function_name)
        );
        tokio::fs::write(&script_path, script)
            .await
            .with_context(|| format!("writing {}", script_path.display()))?;
        // Generated Python functions take a single frame.
        let input_arg = match request.inputs.values().next() {
            Some(batch) => {
                tokio::fs::write(&input_path, codec::table_to_parquet(batch)?)
                    .await
                    .with_context(|| format!("writing {}", input_path.display()))?;
                input_path.display().to_string()
            }
            None => String::new(),
        };
        remove_stale(&output_path).await?;

        let args = Value::Object(python.function_args.clone()).to_string();
        let output = Command::new(&self.interpreter)
            .arg(&script_path)
            .arg(args)
            .arg(&input_arg)
            .arg(&output_path)
            .current_dir(&request.project_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawning `{}`", self.interpreter))?;
        if !input_arg.is_empty() {
            remove_stale(&input_path).await?;
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no output");
            anyhow::bail!("{last}");
        }

        let mut datasets = Datasets::new();
        if let Some(bytes) = read_if_exists(&output_path).await? {
            let batch = codec::table_from_parquet(bytes)
                .with_context(|| format!("reading {}", output_path.display()))?;
            datasets.insert(RESULT_DATASET.to_string(), batch);
            remove_stale(&output_path).await?;
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ExecutionOutput {
            return_value: (!stdout.is_empty()).then_some(stdout),
            datasets,
        })
    }
}

async fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn remove_stale(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}
