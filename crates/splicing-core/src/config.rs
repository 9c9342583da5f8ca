use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use splicing_providers::{ProviderConfig, ProvidersConfig};
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_TOOL_CYCLES: usize = 8;
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 14;
const APP_DIR_NAME: &str = ".splicing";
const STORE_FILE_NAME: &str = "splicing.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fallback working directory for projects without their own `projectDir`.
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_max_tool_cycles")]
    pub max_tool_cycles: usize,
    #[serde(default)]
    pub prompts_path: Option<PathBuf>,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            state_dir: None,
            store_path: None,
            max_tool_cycles: DEFAULT_MAX_TOOL_CYCLES,
            prompts_path: None,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            providers: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.app_dir.join("state"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join(STORE_FILE_NAME))
    }

    pub fn logs_dir(&self) -> PathBuf {
        splicing_observability::canonical_logs_dir_from_root(&self.state_dir())
    }

    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
        }
    }
}

fn default_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn default_max_tool_cycles() -> usize {
    DEFAULT_MAX_TOOL_CYCLES
}

fn default_log_retention_days() -> u64 {
    DEFAULT_LOG_RETENTION_DAYS
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment and
/// command-line overrides, merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();
        let global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_else(|err| {
            tracing::warn!("invalid engine config, using defaults: {err}");
            EngineConfig::default()
        })
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SPLICING_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("splicing").join("config.json"));
    }
    Ok(PathBuf::from(".splicing/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(dir) = non_empty("SPLICING_APP_DIR") {
        deep_merge(&mut root, &json!({ "app_dir": dir }));
    }
    if let Some(dir) = non_empty("SPLICING_STATE_DIR") {
        deep_merge(&mut root, &json!({ "state_dir": dir }));
    }
    if let Some(path) = non_empty("SPLICING_PROMPTS") {
        deep_merge(&mut root, &json!({ "prompts_path": path }));
    }
    if let Some(raw) = non_empty("SPLICING_MAX_TOOL_CYCLES") {
        match raw.trim().parse::<usize>() {
            Ok(cycles) => deep_merge(&mut root, &json!({ "max_tool_cycles": cycles })),
            Err(_) => tracing::warn!("ignoring SPLICING_MAX_TOOL_CYCLES={raw}: not a number"),
        }
    }
    if let Some(raw) = non_empty("SPLICING_LOG_RETENTION_DAYS") {
        if let Ok(days) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "log_retention_days": days }));
        }
    }
    root
}

pub(crate) fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_skips_null_overlay_values() {
        let mut base = json!({"providers": {"openai": {"api_key": "a", "url": "u"}}});
        deep_merge(
            &mut base,
            &json!({"providers": {"openai": {"api_key": null, "default_model": "m"}}}),
        );
        assert_eq!(
            base,
            json!({"providers": {"openai": {"api_key": "a", "url": "u", "default_model": "m"}}})
        );
    }

    #[test]
    fn env_layer_reads_splicing_overrides() {
        let env = HashMap::from([
            ("SPLICING_APP_DIR", "/srv/app"),
            ("SPLICING_MAX_TOOL_CYCLES", "3"),
            ("SPLICING_PROMPTS", " "),
        ]);
        let layer = env_layer_from(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(layer, json!({"app_dir": "/srv/app", "max_tool_cycles": 3}));
    }

    #[test]
    fn env_layer_ignores_unparseable_cycles() {
        let layer = env_layer_from(|key| {
            (key == "SPLICING_MAX_TOOL_CYCLES").then(|| "many".to_string())
        });
        assert_eq!(layer, empty_object());
    }

    #[test]
    fn derived_paths_follow_app_dir() {
        let config: EngineConfig =
            serde_json::from_value(json!({"app_dir": "/data/splicing"})).expect("config");
        assert_eq!(config.state_dir(), PathBuf::from("/data/splicing/state"));
        assert_eq!(
            config.store_path(),
            PathBuf::from("/data/splicing/state/splicing.db")
        );
        assert_eq!(config.max_tool_cycles, DEFAULT_MAX_TOOL_CYCLES);
    }

    #[tokio::test]
    async fn layers_merge_in_order_and_project_patch_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        fs::write(
            &global,
            r#"{"max_tool_cycles": 4, "providers": {"openai": {"default_model": "gpt-4o"}}}"#,
        )
        .await
        .expect("write global");
        fs::write(&project, r#"{"max_tool_cycles": 6}"#)
            .await
            .expect("write project");

        let store = ConfigStore::with_global_path(
            &project,
            &global,
            Some(json!({"log_retention_days": 2})),
        )
        .await
        .expect("config store");
        let config = store.get().await;
        assert_eq!(config.max_tool_cycles, 6);
        assert_eq!(config.log_retention_days, 2);
        assert_eq!(
            config.providers["openai"].default_model.as_deref(),
            Some("gpt-4o")
        );

        store
            .patch_project(json!({"prompts_path": "/tmp/prompts.yaml"}))
            .await
            .expect("patch");
        let raw = fs::read_to_string(&project).await.expect("read project");
        let persisted: Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(persisted["prompts_path"], json!("/tmp/prompts.yaml"));
        assert_eq!(persisted["max_tool_cycles"], json!(6));
    }
}
