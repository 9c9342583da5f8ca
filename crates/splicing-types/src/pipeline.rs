use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DBT_TOOL: &str = "dbt";

const LINKAGE_FIELDS: [&str; 2] = ["sourceSectionId", "sourceBlockId"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SectionType {
    Movement,
    Cleaning,
    Transformation,
    Orchestration,
}

impl SectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Movement => "Movement",
            SectionType::Cleaning => "Cleaning",
            SectionType::Transformation => "Transformation",
            SectionType::Orchestration => "Orchestration",
        }
    }

    pub fn lowercase(self) -> &'static str {
        match self {
            SectionType::Movement => "movement",
            SectionType::Cleaning => "cleaning",
            SectionType::Transformation => "transformation",
            SectionType::Orchestration => "orchestration",
        }
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "movement" => Ok(SectionType::Movement),
            "cleaning" => Ok(SectionType::Cleaning),
            "transformation" => Ok(SectionType::Transformation),
            "orchestration" => Ok(SectionType::Orchestration),
            other => Err(format!("unknown section type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LlmType {
    #[serde(rename = "OpenAI")]
    OpenAi,
    Anthropic,
}

impl LlmType {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmType::OpenAi => "OpenAI",
            LlmType::Anthropic => "Anthropic",
        }
    }

    /// Identifier of the provider registered for this model family.
    pub fn provider_id(self) -> &'static str {
        match self {
            LlmType::OpenAi => "openai",
            LlmType::Anthropic => "anthropic",
        }
    }
}

impl FromStr for LlmType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmType::OpenAi),
            "anthropic" => Ok(LlmType::Anthropic),
            other => Err(format!("unknown llm `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SettingsSectionType {
    #[serde(rename = "LLM")]
    Llm,
    Integration,
}

impl SettingsSectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingsSectionType::Llm => "LLM",
            SettingsSectionType::Integration => "Integration",
        }
    }
}

impl FromStr for SettingsSectionType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "llm" => Ok(SettingsSectionType::Llm),
            "integration" => Ok(SettingsSectionType::Integration),
            other => Err(format!("unknown settings section `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

impl FromStr for MoveDirection {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(MoveDirection::Up),
            "down" => Ok(MoveDirection::Down),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub id: String,
    pub title: String,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub llm: LlmType,
    #[serde(default)]
    pub project_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSetup {
    pub title: String,
    pub llm: LlmType,
    #[serde(default)]
    pub project_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SectionMetadata {
    pub id: String,
    pub title: String,
    pub section_type: SectionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    pub id: String,
    pub num_rows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MovementSetup {
    pub tool: String,
    pub source: String,
    #[serde(default)]
    pub source_section_id: String,
    #[serde(default)]
    pub source_block_id: String,
    #[serde(default)]
    pub source_details: String,
    pub destination: String,
    #[serde(default)]
    pub destination_details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleaningSetup {
    pub source: String,
    pub tool: String,
    #[serde(default)]
    pub source_section_id: String,
    #[serde(default)]
    pub source_block_id: String,
    #[serde(default)]
    pub source_details: String,
    #[serde(default = "default_true")]
    pub provide_recommendation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformationSetup {
    pub source: String,
    pub tool: String,
    #[serde(default)]
    pub source_section_id: String,
    #[serde(default)]
    pub source_block_id: String,
    #[serde(default)]
    pub source_details: String,
    #[serde(default = "default_true")]
    pub provide_recommendation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSetup {
    pub tool: String,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

/// Block setup, one variant per section type. The stored JSON carries no tag;
/// the owning section's type selects the variant when decoding.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BlockSetup {
    Movement(MovementSetup),
    Cleaning(CleaningSetup),
    Transformation(TransformationSetup),
    Orchestration(OrchestrationSetup),
}

impl BlockSetup {
    pub fn from_value(section_type: SectionType, value: Value) -> serde_json::Result<Self> {
        Ok(match section_type {
            SectionType::Movement => BlockSetup::Movement(serde_json::from_value(value)?),
            SectionType::Cleaning => BlockSetup::Cleaning(serde_json::from_value(value)?),
            SectionType::Transformation => {
                BlockSetup::Transformation(serde_json::from_value(value)?)
            }
            SectionType::Orchestration => {
                BlockSetup::Orchestration(serde_json::from_value(value)?)
            }
        })
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn section_type(&self) -> SectionType {
        match self {
            BlockSetup::Movement(_) => SectionType::Movement,
            BlockSetup::Cleaning(_) => SectionType::Cleaning,
            BlockSetup::Transformation(_) => SectionType::Transformation,
            BlockSetup::Orchestration(_) => SectionType::Orchestration,
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            BlockSetup::Movement(setup) => &setup.tool,
            BlockSetup::Cleaning(setup) => &setup.tool,
            BlockSetup::Transformation(setup) => &setup.tool,
            BlockSetup::Orchestration(setup) => &setup.tool,
        }
    }

    pub fn is_dbt(&self) -> bool {
        matches!(self, BlockSetup::Transformation(setup) if setup.tool.eq_ignore_ascii_case(DBT_TOOL))
    }

    /// Cleaning and transformation setups may ask for technique
    /// recommendations when they are stored.
    pub fn wants_recommendations(&self) -> bool {
        match self {
            BlockSetup::Cleaning(setup) => setup.provide_recommendation,
            BlockSetup::Transformation(setup) => setup.provide_recommendation,
            BlockSetup::Movement(_) | BlockSetup::Orchestration(_) => false,
        }
    }

    /// True when every field the code generator depends on is filled in.
    pub fn is_complete(&self) -> bool {
        let filled = |value: &str| !value.trim().is_empty();
        match self {
            BlockSetup::Movement(setup) => {
                filled(&setup.tool) && filled(&setup.source) && filled(&setup.destination)
            }
            BlockSetup::Cleaning(setup) => filled(&setup.tool) && filled(&setup.source),
            BlockSetup::Transformation(setup) => filled(&setup.tool) && filled(&setup.source),
            BlockSetup::Orchestration(setup) => filled(&setup.tool),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            BlockSetup::Movement(setup) => Some(&setup.source),
            BlockSetup::Cleaning(setup) => Some(&setup.source),
            BlockSetup::Transformation(setup) => Some(&setup.source),
            BlockSetup::Orchestration(_) => None,
        }
    }

    /// Upstream `(section_id, block_id)` this block reads from, when linked.
    pub fn source_link(&self) -> Option<(&str, &str)> {
        let (section_id, block_id) = match self {
            BlockSetup::Movement(setup) => (&setup.source_section_id, &setup.source_block_id),
            BlockSetup::Cleaning(setup) => (&setup.source_section_id, &setup.source_block_id),
            BlockSetup::Transformation(setup) => {
                (&setup.source_section_id, &setup.source_block_id)
            }
            BlockSetup::Orchestration(_) => return None,
        };
        if section_id.is_empty() || block_id.is_empty() {
            return None;
        }
        Some((section_id.as_str(), block_id.as_str()))
    }

    /// `key: value` lines describing the setup, without block linkage fields.
    pub fn context_lines(&self) -> serde_json::Result<Vec<String>> {
        let Value::Object(fields) = self.to_value()? else {
            return Ok(Vec::new());
        };
        Ok(fields
            .iter()
            .filter(|(key, _)| !LINKAGE_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| match value {
                Value::String(text) => format!("{key}: {text}"),
                other => format!("{key}: {other}"),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PythonGenerateResult {
    pub function_name: String,
    #[serde(default)]
    pub function_args: Map<String, Value>,
    #[serde(default)]
    pub return_value: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbtGenerateResult {
    pub model_name: String,
    pub model: String,
    pub properties: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DagGenerateResult {
    pub dag_name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TransformationGenerateResult {
    Dbt(DbtGenerateResult),
    Python(PythonGenerateResult),
}

/// Generated artifact for a block, one variant per section type.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum GenerateResult {
    Movement(PythonGenerateResult),
    Cleaning(PythonGenerateResult),
    Transformation(TransformationGenerateResult),
    Orchestration(DagGenerateResult),
}

impl GenerateResult {
    pub fn from_value(section_type: SectionType, value: Value) -> serde_json::Result<Self> {
        Ok(match section_type {
            SectionType::Movement => GenerateResult::Movement(serde_json::from_value(value)?),
            SectionType::Cleaning => GenerateResult::Cleaning(serde_json::from_value(value)?),
            SectionType::Transformation => {
                GenerateResult::Transformation(serde_json::from_value(value)?)
            }
            SectionType::Orchestration => {
                GenerateResult::Orchestration(serde_json::from_value(value)?)
            }
        })
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn section_type(&self) -> SectionType {
        match self {
            GenerateResult::Movement(_) => SectionType::Movement,
            GenerateResult::Cleaning(_) => SectionType::Cleaning,
            GenerateResult::Transformation(_) => SectionType::Transformation,
            GenerateResult::Orchestration(_) => SectionType::Orchestration,
        }
    }

    pub fn is_dbt(&self) -> bool {
        matches!(
            self,
            GenerateResult::Transformation(TransformationGenerateResult::Dbt(_))
        )
    }

    pub fn packages(&self) -> &[String] {
        let python = match self {
            GenerateResult::Movement(result) | GenerateResult::Cleaning(result) => result,
            GenerateResult::Transformation(TransformationGenerateResult::Python(result)) => result,
            _ => return &[],
        };
        python.packages.as_deref().unwrap_or_default()
    }

    /// Fields kept in a DAG node definition: everything except the code bodies.
    pub fn node_fields(&self) -> serde_json::Result<Map<String, Value>> {
        let Value::Object(mut fields) = self.to_value()? else {
            return Ok(Map::new());
        };
        let dropped: &[&str] = if self.is_dbt() {
            &["model", "properties"]
        } else {
            &["code"]
        };
        for key in dropped {
            fields.remove(*key);
        }
        Ok(fields)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    #[serde(default)]
    pub return_value: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecuteResult {
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }
}

/// Delivery state of a one-shot conversation notice. Absence of the flag
/// (`Option::None` around this type) means there is nothing to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
}

impl DeliveryState {
    pub fn from_flag(flag: bool) -> Self {
        if flag {
            DeliveryState::Delivered
        } else {
            DeliveryState::Pending
        }
    }

    pub fn as_flag(self) -> bool {
        matches!(self, DeliveryState::Delivered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsEntry {
    pub section_type: SettingsSectionType,
    pub key: String,
    pub value: Value,
}
