//! Worker instructions and prompt rendering.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::WorkItem;

const INSTRUCTIONS_TEMPLATE: &str = include_str!("prompts/instructions.md");
const PROMPT_TEMPLATE: &str = include_str!("prompts/prompt.md");

/// File written at the root of every workspace.
pub const INSTRUCTIONS_FILE: &str = "WORKER_INSTRUCTIONS.md";

/// Everything the templates may reference.
#[derive(Debug, Clone, Copy)]
pub struct InstructionInputs<'a> {
    pub item: &'a WorkItem,
    pub branch: &'a str,
    pub context: Option<&'a str>,
}

struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("instructions", INSTRUCTIONS_TEMPLATE)
            .expect("instructions template should be valid");
        env.add_template("prompt", PROMPT_TEMPLATE)
            .expect("prompt template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, inputs: &InstructionInputs<'_>) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(context! {
                item => inputs.item,
                branch => inputs.branch,
                context => inputs.context.map(str::trim).filter(|s| !s.is_empty()),
                instructions_file => INSTRUCTIONS_FILE,
            })
            .with_context(|| format!("render {name} template"))?;
        Ok(rendered)
    }
}

pub fn render_instructions(inputs: &InstructionInputs<'_>) -> Result<String> {
    TemplateEngine::new().render("instructions", inputs)
}

pub fn render_prompt(inputs: &InstructionInputs<'_>) -> Result<String> {
    let prompt = TemplateEngine::new().render("prompt", inputs)?;
    Ok(prompt.trim().to_string())
}

/// Write the instructions file into `workspace`.
pub async fn write_instructions(workspace: &Path, contents: &str) -> Result<PathBuf> {
    let path = workspace.join(INSTRUCTIONS_FILE);
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), "wrote worker instructions");
    Ok(path)
}

/// Append `pattern` to a git exclude file unless a line already matches.
pub async fn ensure_excluded(exclude_path: &Path, pattern: &str) -> Result<bool> {
    let existing = match tokio::fs::read_to_string(exclude_path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", exclude_path.display()));
        }
    };
    if existing.lines().any(|line| line.trim() == pattern) {
        return Ok(false);
    }
    if let Some(parent) = exclude_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(pattern);
    updated.push('\n');
    tokio::fs::write(exclude_path, updated)
        .await
        .with_context(|| format!("write {}", exclude_path.display()))?;
    debug!(path = %exclude_path.display(), pattern, "added exclude pattern");
    Ok(true)
}
