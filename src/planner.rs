use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::ai::{extract_json, AiClient, AiRequest};
use crate::models::Plan;

const PLANNING_INSTRUCTION: &str = r#"You are a software engineering planner for an accounting application. Break the enhancement below into an ordered implementation plan.

Respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "tasks": [
    {
      "id": 1,
      "title": "Short task name",
      "description": "Detailed instruction for the code generator",
      "type": "create" | "modify" | "delete" | "test" | "config",
      "target_files": ["src/path/to/file.rs"],
      "depends_on": []
    }
  ],
  "risks": [
    {"description": "...", "severity": "low" | "medium" | "high", "mitigation": "..."}
  ],
  "estimated_files": ["src/path/to/file.rs"],
  "summary": "One-paragraph summary of the approach",
  "estimated_effort": "e.g. 2-3 hours"
}

Rules:
- Tasks are executed strictly in the order listed; list prerequisites before dependents.
- Task ids must be unique integers.
- depends_on references task ids, not array indices.
- For simple requests, return a single task."#;

impl Plan {
    /// Parse service output into a Plan. The output may be wrapped in
    /// markdown fences or prose; anything that does not contain a valid Plan
    /// object is a hard error for the enhancement.
    pub fn parse(raw: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(extract_json(raw))
            .context("Failed to parse planner response as a Plan")?;
        let mut seen = HashSet::new();
        for task in &plan.tasks {
            anyhow::ensure!(
                seen.insert(task.id),
                "Plan contains duplicate task id {}",
                task.id
            );
        }
        anyhow::ensure!(!plan.tasks.is_empty(), "Plan contains no tasks");
        Ok(plan)
    }
}

/// Turns an enhancement title/description into a structured Plan via the AI
/// planning service. Does not validate dependency acyclicity or file-path
/// safety; execution follows list order as emitted.
pub struct Planner {
    ai: Arc<dyn AiClient>,
}

impl Planner {
    pub fn new(ai: Arc<dyn AiClient>) -> Self {
        Self { ai }
    }

    pub async fn plan(
        &self,
        title: &str,
        description: &str,
        codebase_context: Option<&str>,
    ) -> Result<Plan> {
        let instruction = format!(
            "{}\n\n## Enhancement\n**Title:** {}\n**Description:** {}",
            PLANNING_INSTRUCTION, title, description
        );
        let mut request = AiRequest::new(instruction);
        if let Some(context) = codebase_context {
            request = request.with_context(context);
        }
        let response = self
            .ai
            .complete(&request)
            .await
            .context("Planning service call failed")?;
        Plan::parse(&response)
    }
}
