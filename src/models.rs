use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of an enhancement as it moves through the pipeline.
///
/// `Failed` is reachable from every non-terminal state; `Completed` and
/// `Failed` are terminal. Every transition stamps `updated_at` on the row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStatus {
    Pending,
    Processing,
    Planning,
    Implementing,
    Reviewing,
    CopilotReviewing,
    PrCreated,
    Completed,
    Failed,
}

impl EnhancementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::CopilotReviewing => "copilot_reviewing",
            Self::PrCreated => "pr_created",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// An enhancement currently being worked on: claimed but not yet finished.
    /// Used for the concurrent-jobs capacity check.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Pending)
    }
}

impl FromStr for EnhancementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "planning" => Ok(Self::Planning),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "copilot_reviewing" => Ok(Self::CopilotReviewing),
            "pr_created" => Ok(Self::PrCreated),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid enhancement status: {}", s)),
        }
    }
}

/// A tracked change request. The intake side inserts rows; after that the
/// store is the sole writer and every status transition is a single-row
/// conditional update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enhancement {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: EnhancementStatus,
    pub priority: i64,
    pub requested_by: String,
    pub assigned_to: Option<String>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub plan_json: Option<String>,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Create,
    Modify,
    Delete,
    Test,
    Config,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Test => "test",
            Self::Config => "config",
        }
    }
}

/// One unit of work inside a plan. Tasks are executed strictly in the order
/// the planner emitted them; `depends_on` is recorded for visibility but is
/// not used to reorder execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Risk {
    pub description: String,
    pub severity: RiskSeverity,
    #[serde(default)]
    pub mitigation: String,
}

/// Structured output of the planning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub risks: Vec<Risk>,
    #[serde(default)]
    pub estimated_files: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub estimated_effort: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

/// One file-level operation produced by the code generator. `content` carries
/// the full resulting file and is absent for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenResult {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: RiskSeverity,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
}

/// Verdict of the internal AI review pass. Advisory: surfaced as a PR
/// comment, never a hard failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "deployed" => Ok(Self::Deployed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// A scheduled merge of an enhancement's pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub enhancement_id: i64,
    pub scheduled_date: String,
    pub status: DeploymentStatus,
    pub deployed_at: Option<String>,
    pub notes: Option<String>,
}

/// Row of the `deployment_queue` join view: a deployment plus the parent
/// enhancement's fields the scheduler and operators need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentQueueItem {
    pub id: i64,
    pub enhancement_id: i64,
    pub scheduled_date: String,
    pub status: DeploymentStatus,
    pub deployed_at: Option<String>,
    pub notes: Option<String>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub description: String,
    pub requested_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        let all = [
            EnhancementStatus::Pending,
            EnhancementStatus::Processing,
            EnhancementStatus::Planning,
            EnhancementStatus::Implementing,
            EnhancementStatus::Reviewing,
            EnhancementStatus::CopilotReviewing,
            EnhancementStatus::PrCreated,
            EnhancementStatus::Completed,
            EnhancementStatus::Failed,
        ];
        for status in all {
            let parsed: EnhancementStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_rejects_unknown_string() {
        assert!("in_review".parse::<EnhancementStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EnhancementStatus::Completed.is_terminal());
        assert!(EnhancementStatus::Failed.is_terminal());
        assert!(!EnhancementStatus::PrCreated.is_terminal());
        assert!(!EnhancementStatus::Pending.is_terminal());
    }

    #[test]
    fn test_active_excludes_pending_and_terminal() {
        assert!(!EnhancementStatus::Pending.is_active());
        assert!(!EnhancementStatus::Completed.is_active());
        assert!(!EnhancementStatus::Failed.is_active());
        assert!(EnhancementStatus::Processing.is_active());
        assert!(EnhancementStatus::Implementing.is_active());
        assert!(EnhancementStatus::PrCreated.is_active());
    }

    #[test]
    fn test_deployment_status_round_trips() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::InProgress,
            DeploymentStatus::Deployed,
            DeploymentStatus::Failed,
        ] {
            let parsed: DeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_task_deserializes_with_type_field() {
        let json = r#"{
            "id": 1,
            "title": "Add validation",
            "description": "Validate the invoice form",
            "type": "modify",
            "target_files": ["src/invoice.rs"],
            "depends_on": []
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_type, TaskType::Modify);
        assert_eq!(task.target_files, vec!["src/invoice.rs"]);
    }

    #[test]
    fn test_codegen_result_delete_has_no_content() {
        let json = r#"{
            "path": "src/stale.rs",
            "operation": "delete",
            "explanation": "No longer referenced"
        }"#;
        let result: CodeGenResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.operation, FileOperation::Delete);
        assert!(result.content.is_none());
    }

    #[test]
    fn test_review_result_defaults_empty_lists() {
        let json = r#"{"approved": true}"#;
        let result: ReviewResult = serde_json::from_str(json).unwrap();
        assert!(result.approved);
        assert!(result.issues.is_empty());
        assert!(result.suggestions.is_empty());
    }
}
