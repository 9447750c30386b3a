use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::ai::{extract_json, AiClient, AiRequest};
use crate::models::{CodeGenResult, FileOperation, Task, TaskType};

const CODEGEN_INSTRUCTION: &str = r#"You are a code generator for an accounting application. Implement the task below as a list of complete file operations.

Respond with valid JSON only (no markdown, no explanation): an array matching this schema:
[
  {
    "path": "src/relative/path.rs",
    "operation": "create" | "modify" | "delete",
    "content": "full resulting file content (omit for delete)",
    "explanation": "one sentence describing the change"
  }
]

Rules:
- Always return the FULL resulting content of each file, never a fragment or diff.
- Paths are relative to the repository root.
- Only touch files relevant to the task."#;

/// Calls the AI codegen service per task and applies the resulting file
/// operations to the working tree.
pub struct CodeGenerator {
    ai: Arc<dyn AiClient>,
}

impl CodeGenerator {
    pub fn new(ai: Arc<dyn AiClient>) -> Self {
        Self { ai }
    }

    /// Generate file operations for one task. Existing file content is read
    /// by the caller and supplied only for `modify` tasks.
    pub async fn generate(
        &self,
        task: &Task,
        existing_content: Option<&str>,
        codebase_context: Option<&str>,
    ) -> Result<Vec<CodeGenResult>> {
        let instruction = format!(
            "{}\n\n## Task\n**Title:** {}\n**Type:** {}\n**Description:** {}\n**Target files:** {}",
            CODEGEN_INSTRUCTION,
            task.title,
            task.task_type.as_str(),
            task.description,
            task.target_files.join(", "),
        );
        let mut request = AiRequest::new(instruction);
        if let Some(content) = existing_content {
            request = request.with_existing_content(content);
        }
        if let Some(context) = codebase_context {
            request = request.with_context(context);
        }
        let response = self
            .ai
            .complete(&request)
            .await
            .context("Codegen service call failed")?;
        parse_results(&response)
    }

    /// Read the first existing target file of a `modify` task, for inclusion
    /// in the codegen request. Non-modify tasks never read the tree.
    pub fn existing_content(root: &Path, task: &Task) -> Option<String> {
        if task.task_type != TaskType::Modify {
            return None;
        }
        for target in &task.target_files {
            let path = match resolve_path(root, target) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Some(content);
            }
        }
        None
    }
}

/// Parse service output into an ordered list of file operations.
pub fn parse_results(raw: &str) -> Result<Vec<CodeGenResult>> {
    let results: Vec<CodeGenResult> = serde_json::from_str(extract_json(raw))
        .context("Failed to parse codegen response as file operations")?;
    anyhow::ensure!(!results.is_empty(), "Codegen returned no file operations");
    for result in &results {
        if matches!(result.operation, FileOperation::Create | FileOperation::Modify) {
            anyhow::ensure!(
                result.content.is_some(),
                "Codegen result for {} has no content",
                result.path
            );
        }
    }
    Ok(results)
}

/// Reject absolute paths and any traversal that could escape the workspace.
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    anyhow::ensure!(
        candidate.is_relative(),
        "Refusing absolute path from codegen: {}",
        relative
    );
    for component in candidate.components() {
        anyhow::ensure!(
            !matches!(component, Component::ParentDir),
            "Refusing path traversal from codegen: {}",
            relative
        );
    }
    Ok(root.join(candidate))
}

/// Apply operations in order. Creates parent directories as needed; deleting
/// an already-absent file is a no-op and is not reported as applied. Returns
/// the touched paths (workspace-relative) in application order.
pub fn apply_results(root: &Path, results: &[CodeGenResult]) -> Result<Vec<PathBuf>> {
    let mut applied = Vec::new();
    for result in results {
        let path = resolve_path(root, &result.path)?;
        match result.operation {
            FileOperation::Create | FileOperation::Modify => {
                let content = result
                    .content
                    .as_deref()
                    .with_context(|| format!("No content for {}", result.path))?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directories for {}", result.path))?;
                }
                std::fs::write(&path, content)
                    .with_context(|| format!("Failed to write {}", result.path))?;
                debug!(path = %result.path, op = ?result.operation, "applied file operation");
                applied.push(PathBuf::from(&result.path));
            }
            FileOperation::Delete => {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to delete {}", result.path))?;
                    applied.push(PathBuf::from(&result.path));
                } else {
                    warn!(path = %result.path, "delete target already absent, skipping");
                }
            }
        }
    }
    Ok(applied)
}
