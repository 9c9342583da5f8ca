//! Typed builders for the logical key layout.
//!
//! ```text
//! projects                                              set of project ids
//! project:{pid}:metadata | :{attr} | :sections | :thread
//! project:{pid}:section:{sid}:metadata | :blocks | :current_block_id
//! project:{pid}:section:{sid}:block:{bid}:{field}
//! settings:{section_type}:{key}
//! ```

use std::fmt;

use crate::error::{StoreError, StoreResult};

const SEPARATOR: char = ':';

/// A full key or a key prefix. Prefixes end with the separator so that
/// `project:ab:` never matches keys of project `abc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(String);

impl KeyPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn projects() -> Self {
        Self("projects".to_string())
    }

    pub fn settings(section_type: &str, key: &str) -> StoreResult<Self> {
        Ok(Self(format!(
            "settings:{}:{}",
            segment(section_type)?,
            segment(key)?
        )))
    }

    pub fn settings_prefix(section_type: Option<&str>) -> StoreResult<Self> {
        Ok(match section_type {
            Some(section_type) => Self(format!("settings:{}:", segment(section_type)?)),
            None => Self("settings:".to_string()),
        })
    }

    /// Last segment of the key (the settings key for a settings path).
    pub fn leaf(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    /// Segment at `index`, counting from zero.
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.0.split(SEPARATOR).nth(index)
    }

    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    fn child(&self, leaf: &str) -> Self {
        Self(format!("{}{leaf}", self.0))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn segment(raw: &str) -> StoreResult<&str> {
    if raw.is_empty() || raw.contains(SEPARATOR) || raw.contains('/') {
        return Err(StoreError::InvalidKey(raw.to_string()));
    }
    Ok(raw)
}

#[derive(Debug, Clone)]
pub struct ProjectPath {
    prefix: KeyPath,
}

impl ProjectPath {
    pub fn new(project_id: &str) -> StoreResult<Self> {
        Ok(Self {
            prefix: KeyPath(format!("project:{}:", segment(project_id)?)),
        })
    }

    pub fn prefix(&self) -> &KeyPath {
        &self.prefix
    }

    pub fn metadata(&self) -> KeyPath {
        self.prefix.child("metadata")
    }

    pub fn attribute(&self, name: &str) -> StoreResult<KeyPath> {
        Ok(self.prefix.child(segment(name)?))
    }

    pub fn sections(&self) -> KeyPath {
        self.prefix.child("sections")
    }

    pub fn thread(&self) -> KeyPath {
        self.prefix.child("thread")
    }

    pub fn section(&self, section_id: &str) -> StoreResult<SectionPath> {
        Ok(SectionPath {
            prefix: self.prefix.child(&format!("section:{}:", segment(section_id)?)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SectionPath {
    prefix: KeyPath,
}

impl SectionPath {
    pub fn prefix(&self) -> &KeyPath {
        &self.prefix
    }

    pub fn metadata(&self) -> KeyPath {
        self.prefix.child("metadata")
    }

    pub fn blocks(&self) -> KeyPath {
        self.prefix.child("blocks")
    }

    pub fn current_block_id(&self) -> KeyPath {
        self.prefix.child("current_block_id")
    }

    pub fn block(&self, block_id: &str) -> StoreResult<BlockPath> {
        Ok(BlockPath {
            prefix: self.prefix.child(&format!("block:{}:", segment(block_id)?)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlockPath {
    prefix: KeyPath,
}

impl BlockPath {
    pub fn prefix(&self) -> &KeyPath {
        &self.prefix
    }

    pub fn metadata(&self) -> KeyPath {
        self.prefix.child("metadata")
    }

    pub fn setup(&self) -> KeyPath {
        self.prefix.child("setup")
    }

    pub fn generate_result(&self) -> KeyPath {
        self.prefix.child("generate_result")
    }

    pub fn execute_result(&self) -> KeyPath {
        self.prefix.child("execute_result")
    }

    pub fn recommendations(&self) -> KeyPath {
        self.prefix.child("recommendations")
    }

    pub fn data(&self) -> KeyPath {
        self.prefix.child("data")
    }

    pub fn generate_result_delivered(&self) -> KeyPath {
        self.prefix
            .child("is_generate_result_added_to_conversation")
    }

    pub fn execution_error_delivered(&self) -> KeyPath {
        self.prefix
            .child("is_execution_error_added_to_conversation")
    }

    /// Token written each time the generation flag is re-armed.
    pub fn generate_result_arming(&self) -> KeyPath {
        self.prefix.child("generate_result_arming")
    }

    pub fn execution_error_arming(&self) -> KeyPath {
        self.prefix.child("execution_error_arming")
    }
}
