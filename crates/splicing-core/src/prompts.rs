use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context};

const EMBEDDED_PROMPTS: &str = include_str!("prompts.yaml");

/// Prompt templates grouped by purpose (`conversation`, `generate`, `recommend`). Loaded
/// once per process and shared by reference.
///
/// Placeholders use `${name}`. Rendering fails when a placeholder has no value,
/// so a template edit cannot silently send a literal `${...}` to a model.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    groups: HashMap<String, HashMap<String, String>>,
}

impl PromptLibrary {
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_yaml(EMBEDDED_PROMPTS).context("embedded prompt templates")
    }

    /// Reads templates from `path`, or the built-in set when `path` is `None`.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Self::embedded();
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading prompt templates from {}", path.display()))?;
        let library = Self::from_yaml(&raw)
            .with_context(|| format!("parsing prompt templates in {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded prompt templates");
        Ok(library)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let groups: HashMap<String, HashMap<String, String>> = serde_yaml::from_str(raw)?;
        Ok(Self { groups })
    }

    pub fn template(&self, group: &str, name: &str) -> anyhow::Result<&str> {
        self.groups
            .get(group)
            .and_then(|templates| templates.get(name))
            .map(String::as_str)
            .ok_or_else(|| anyhow!("prompt template `{group}.{name}` not found"))
    }

    pub fn render(&self, group: &str, name: &str, vars: &[(&str, &str)]) -> anyhow::Result<String> {
        let template = self.template(group, name)?;
        substitute(template, vars).with_context(|| format!("rendering `{group}.{name}`"))
    }
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> anyhow::Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            anyhow::bail!("unterminated placeholder");
        };
        let name = &after[..end];
        let value = vars
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| anyhow!("no value for placeholder `{name}`"))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_templates_cover_conversation_prompts() {
        let prompts = PromptLibrary::embedded().expect("embedded");
        for name in [
            "initial_system_message",
            "initial_assistant_message",
            "context_update_user_message",
            "generate_python_code_user_message",
            "generate_dbt_code_user_message",
            "generate_dag_code_user_message",
            "execution_error_user_message",
            "tool_loop_stop_message",
        ] {
            prompts.template("conversation", name).expect(name);
        }
        prompts.template("generate", "system_message").expect("generate");
        for name in ["system_message", "user_message", "assistant_message"] {
            prompts.template("recommend", name).expect(name);
        }
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let prompts = PromptLibrary::embedded().expect("embedded");
        let text = prompts
            .render(
                "conversation",
                "execution_error_user_message",
                &[("section_type", "cleaning"), ("error", "KeyError: 'id'")],
            )
            .expect("render");
        assert!(text.contains("data cleaning block"));
        assert!(text.contains("KeyError: 'id'"));
        assert!(!text.contains("${"));
    }

    #[test]
    fn missing_value_is_an_error() {
        let prompts = PromptLibrary::from_yaml("g:\n  t: \"hello ${who}\"\n").expect("yaml");
        let err = prompts.render("g", "t", &[]).expect_err("missing");
        assert!(format!("{err:#}").contains("who"));
        assert_eq!(
            prompts.render("g", "t", &[("who", "there")]).expect("render"),
            "hello there"
        );
    }

    #[test]
    fn unknown_template_is_reported() {
        let prompts = PromptLibrary::embedded().expect("embedded");
        let err = prompts.template("conversation", "nope").expect_err("unknown");
        assert!(err.to_string().contains("conversation.nope"));
    }

    #[tokio::test]
    async fn load_reads_override_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prompts.yaml");
        tokio::fs::write(&path, "conversation:\n  initial_system_message: custom\n")
            .await
            .expect("write");
        let prompts = PromptLibrary::load(Some(&path)).await.expect("load");
        assert_eq!(
            prompts
                .render("conversation", "initial_system_message", &[])
                .expect("render"),
            "custom"
        );
    }
}
