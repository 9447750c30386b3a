//! End-to-end pipeline tests: a queued enhancement flows through planning,
//! code generation, branch/commit/push, review, and PR creation against a
//! local filesystem git remote with scripted AI and host fakes, after which the
//! deployment scheduler merges it and closes it out.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use git2::{BranchType, Repository, Signature};
use tempfile::TempDir;

use conveyor::ai::{AiClient, AiRequest};
use conveyor::codegen::CodeGenerator;
use conveyor::config::Config;
use conveyor::deploy::DeploymentScheduler;
use conveyor::errors::HostError;
use conveyor::host::{
    CheckRun, HostClient, IssueComment, MergeOutcome, PullRequest, PullRequestState,
    PullRequestStatus,
};
use conveyor::models::{DeploymentStatus, EnhancementStatus};
use conveyor::notify::Notifier;
use conveyor::pipeline::Orchestrator;
use conveyor::planner::Planner;
use conveyor::review::ReviewOrchestrator;
use conveyor::store::{DbHandle, NewEnhancement, PipelineDb};
use conveyor::workspace::WorkspaceManager;

/// AI fake that answers each call with the next scripted response.
struct ScriptedAi {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedAi {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl AiClient for ScriptedAi {
    async fn complete(&self, _request: &AiRequest) -> Result<String> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("AI service unavailable"))
    }
}

/// Host fake: hands out PR #42, records comments and labels, and serves a
/// configurable live status for the merge gate.
struct FakeHost {
    comment_seq: AtomicI64,
    pull_requests: Mutex<Vec<(String, String)>>,
    comments: Mutex<Vec<String>>,
    labels: Mutex<Vec<String>>,
    merges: Mutex<Vec<i64>>,
    status: Mutex<PullRequestStatus>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            comment_seq: AtomicI64::new(1),
            pull_requests: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
            labels: Mutex::new(Vec::new()),
            merges: Mutex::new(Vec::new()),
            status: Mutex::new(PullRequestStatus {
                state: PullRequestState::Open,
                merged: false,
                mergeable: Some(true),
                head_sha: "abc123".to_string(),
                checks: vec![CheckRun {
                    name: "ci".to_string(),
                    status: "completed".to_string(),
                    conclusion: Some("success".to_string()),
                }],
            }),
        }
    }
}

#[async_trait]
impl HostClient for FakeHost {
    async fn create_pull_request(
        &self,
        head: &str,
        _base: &str,
        title: &str,
        _body: &str,
    ) -> Result<PullRequest, HostError> {
        self.pull_requests
            .lock()
            .unwrap()
            .push((head.to_string(), title.to_string()));
        Ok(PullRequest {
            number: 42,
            html_url: "https://example.test/pull/42".to_string(),
        })
    }

    async fn post_comment(&self, _number: i64, body: &str) -> Result<IssueComment, HostError> {
        let id = self.comment_seq.fetch_add(1, Ordering::SeqCst);
        self.comments.lock().unwrap().push(body.to_string());
        Ok(IssueComment {
            id,
            body: body.to_string(),
            author_login: "conveyor".to_string(),
            author_is_bot: false,
        })
    }

    async fn add_labels(&self, _number: i64, labels: &[&str]) -> Result<(), HostError> {
        self.labels
            .lock()
            .unwrap()
            .extend(labels.iter().map(|l| l.to_string()));
        Ok(())
    }

    async fn list_comments(&self, _number: i64) -> Result<Vec<IssueComment>, HostError> {
        Ok(vec![])
    }

    async fn pull_request_status(&self, _number: i64) -> Result<PullRequestStatus, HostError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn merge(&self, number: i64) -> Result<MergeOutcome, HostError> {
        self.merges.lock().unwrap().push(number);
        self.status.lock().unwrap().merged = true;
        Ok(MergeOutcome {
            merged: true,
            sha: Some("cafebabe".to_string()),
        })
    }
}

/// A working copy with one commit on main, pushed to a bare filesystem
/// origin so fetch and push work without a network.
fn setup_workspace() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let origin_path = dir.path().join("origin.git");
    let work_path = dir.path().join("work");

    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main").bare(true);
    Repository::init_opts(&origin_path, &opts).unwrap();

    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(&work_path, &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    drop(config);

    std::fs::write(work_path.join("README.md"), "# fixture\n").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();

    repo.remote("origin", origin_path.to_str().unwrap()).unwrap();
    let mut remote = repo.find_remote("origin").unwrap();
    remote
        .push(&["refs/heads/main:refs/heads/main"], None)
        .unwrap();
    drop(remote);
    drop(tree);
    drop(repo);

    (dir, work_path)
}

fn test_config(workspace_path: &std::path::Path) -> Config {
    Config {
        github_token: "test-token".to_string(),
        github_repo: "acme/app".to_string(),
        ai_service_url: "http://localhost:0".to_string(),
        ai_service_key: None,
        database_path: ":memory:".to_string(),
        workspace_path: workspace_path.display().to_string(),
        base_branch: "main".to_string(),
        poll_interval: Duration::from_millis(10),
        max_concurrent_jobs: 1,
        dry_run: false,
        copilot_review_enabled: false,
        copilot_reviewer: "copilot".to_string(),
        copilot_poll_attempts: 1,
        copilot_poll_interval: Duration::from_millis(10),
        notify_webhook_url: None,
        notify_email_url: None,
        notify_email_from: "conveyor@localhost".to_string(),
    }
}

const PLAN_RESPONSE: &str = r#"{
  "tasks": [
    {
      "id": 1,
      "title": "Add dark mode module",
      "description": "Introduce the dark mode toggle",
      "type": "create",
      "target_files": ["src/dark_mode.rs"]
    }
  ],
  "risks": [
    {"description": "Contrast regressions", "severity": "low", "mitigation": "manual check"}
  ],
  "estimated_files": ["src/dark_mode.rs"],
  "summary": "Add a dark mode toggle",
  "estimated_effort": "1 hour"
}"#;

const CODEGEN_RESPONSE: &str = r#"[
  {
    "path": "src/dark_mode.rs",
    "operation": "create",
    "content": "pub fn dark_mode_enabled() -> bool {\n    true\n}\n"
  }
]"#;

const REVIEW_RESPONSE: &str = r#"{
  "approved": true,
  "issues": [],
  "suggestions": ["Consider persisting the preference"],
  "summary": "Small, well-scoped change"
}"#;

struct Harness {
    _dir: TempDir,
    work_path: PathBuf,
    db: DbHandle,
    host: Arc<FakeHost>,
    orchestrator: Orchestrator,
}

fn setup_pipeline(ai_responses: Vec<&str>, dry_run: bool) -> Harness {
    let (dir, work_path) = setup_workspace();
    let mut config = test_config(&work_path);
    config.dry_run = dry_run;

    let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
    let ai: Arc<dyn AiClient> = Arc::new(ScriptedAi::new(ai_responses));
    let host = Arc::new(FakeHost::new());
    let host_dyn: Arc<dyn HostClient> = host.clone();
    let workspace = WorkspaceManager::new(&work_path, "main", None).unwrap();
    let review = ReviewOrchestrator::new(
        ai.clone(),
        host_dyn.clone(),
        &config.copilot_reviewer,
        config.copilot_poll_attempts,
        config.copilot_poll_interval,
    );
    let orchestrator = Orchestrator::new(
        db.clone(),
        config,
        Planner::new(ai.clone()),
        CodeGenerator::new(ai),
        review,
        host_dyn,
        Arc::new(tokio::sync::Mutex::new(workspace)),
        Arc::new(Notifier::disabled()),
    );

    Harness {
        _dir: dir,
        work_path,
        db,
        host,
        orchestrator,
    }
}

fn enqueue(db: &DbHandle, title: &str) -> i64 {
    db.lock_sync()
        .unwrap()
        .create_enhancement(&NewEnhancement {
            title: title.to_string(),
            description: "As requested by the dashboard team".to_string(),
            priority: 7,
            requested_by: "alice".to_string(),
        })
        .unwrap()
        .id
}

#[tokio::test]
async fn test_enhancement_flows_from_pending_to_pr_created() {
    let harness = setup_pipeline(
        vec![PLAN_RESPONSE, CODEGEN_RESPONSE, REVIEW_RESPONSE],
        false,
    );
    let id = enqueue(&harness.db, "Add dark mode to dashboard");

    let processed = harness.orchestrator.tick().await.unwrap();
    assert!(processed);

    let row = harness
        .db
        .lock_sync()
        .unwrap()
        .get_enhancement(id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EnhancementStatus::PrCreated);
    assert_eq!(
        row.branch_name.as_deref(),
        Some("enhancement/1-add-dark-mode-to-dashboard")
    );
    assert_eq!(row.pr_number, Some(42));
    assert_eq!(row.pr_url.as_deref(), Some("https://example.test/pull/42"));
    assert!(row.plan_json.is_some());
    assert!(row.started_at.is_some());
    assert!(row.error_message.is_none());

    // The branch reached the origin with the generated file committed.
    let origin = Repository::open(harness._dir.path().join("origin.git")).unwrap();
    let branch_ref = origin
        .find_reference("refs/heads/enhancement/1-add-dark-mode-to-dashboard")
        .unwrap();
    let tree = branch_ref.peel_to_commit().unwrap().tree().unwrap();
    assert!(tree.get_path(std::path::Path::new("src/dark_mode.rs")).is_ok());

    // The working copy actually holds the generated content.
    let generated =
        std::fs::read_to_string(harness.work_path.join("src/dark_mode.rs")).unwrap();
    assert!(generated.contains("dark_mode_enabled"));

    // PR opened from the branch, labelled, with the review as a comment.
    let prs = harness.host.pull_requests.lock().unwrap();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].0, "enhancement/1-add-dark-mode-to-dashboard");
    let labels = harness.host.labels.lock().unwrap();
    assert!(labels.contains(&"automated".to_string()));
    assert!(labels.contains(&"enhancement".to_string()));
    let comments = harness.host.comments.lock().unwrap();
    assert!(comments.iter().any(|c| c.contains("Small, well-scoped change")));
}

#[tokio::test]
async fn test_planning_failure_marks_enhancement_failed_and_cleans_workspace() {
    let harness = setup_pipeline(vec!["this is not json at all"], false);
    let id = enqueue(&harness.db, "Broken request");

    let processed = harness.orchestrator.tick().await.unwrap();
    assert!(processed);

    let row = harness
        .db
        .lock_sync()
        .unwrap()
        .get_enhancement(id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EnhancementStatus::Failed);
    let error = row.error_message.unwrap();
    assert!(error.contains("Planning failed"), "error: {}", error);

    // Workspace is back on a clean base; no stray branch exists.
    let repo = Repository::open(&harness.work_path).unwrap();
    assert_eq!(repo.head().unwrap().shorthand(), Some("main"));
    assert!(repo
        .branches(Some(BranchType::Local))
        .unwrap()
        .filter_map(|b| b.ok())
        .all(|(b, _)| b.name().unwrap() == Some("main")));
}

#[tokio::test]
async fn test_codegen_failure_records_error_and_drops_branch() {
    // Plan parses, then the AI runs out of scripted responses mid-codegen.
    let harness = setup_pipeline(vec![PLAN_RESPONSE], false);
    let id = enqueue(&harness.db, "Half-finished work");

    harness.orchestrator.tick().await.unwrap();

    let row = harness
        .db
        .lock_sync()
        .unwrap()
        .get_enhancement(id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EnhancementStatus::Failed);
    assert!(row.error_message.unwrap().contains("task 1"));

    // The half-done branch was abandoned and the tree is clean again.
    let repo = Repository::open(&harness.work_path).unwrap();
    assert_eq!(repo.head().unwrap().shorthand(), Some("main"));
    assert!(repo
        .find_branch("enhancement/1-half-finished-work", BranchType::Local)
        .is_err());
    assert!(!harness.work_path.join("src/dark_mode.rs").exists());
}

#[tokio::test]
async fn test_dry_run_stops_after_planning() {
    let harness = setup_pipeline(vec![PLAN_RESPONSE], true);
    let id = enqueue(&harness.db, "Plan only");

    harness.orchestrator.tick().await.unwrap();

    let row = harness
        .db
        .lock_sync()
        .unwrap()
        .get_enhancement(id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, EnhancementStatus::Completed);
    assert!(row.plan_json.is_some());
    assert!(row.branch_name.is_none());
    assert!(row.pr_number.is_none());
    assert!(row.notes.unwrap().contains("Dry run"));
    assert!(harness.host.pull_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tick_respects_capacity_and_priority_order() {
    let harness = setup_pipeline(vec![PLAN_RESPONSE, CODEGEN_RESPONSE, REVIEW_RESPONSE], false);
    {
        let guard = harness.db.lock_sync().unwrap();
        guard
            .create_enhancement(&NewEnhancement {
                title: "Low priority".to_string(),
                description: String::new(),
                priority: 2,
                requested_by: "bob".to_string(),
            })
            .unwrap();
        let urgent = guard
            .create_enhancement(&NewEnhancement {
                title: "Urgent fix".to_string(),
                description: String::new(),
                priority: 9,
                requested_by: "alice".to_string(),
            })
            .unwrap();
        assert_eq!(urgent.id, 2);
    }

    // One tick processes exactly one enhancement: the urgent one, despite
    // its later id.
    harness.orchestrator.tick().await.unwrap();

    // The finished-but-undeployed enhancement still occupies the single job
    // slot, so the next tick declines to claim.
    let processed = harness.orchestrator.tick().await.unwrap();
    assert!(!processed);

    let guard = harness.db.lock_sync().unwrap();
    let urgent = guard.get_enhancement(2).unwrap().unwrap();
    assert_eq!(urgent.status, EnhancementStatus::PrCreated);
    let low = guard.get_enhancement(1).unwrap().unwrap();
    assert_eq!(low.status, EnhancementStatus::Pending);
}

#[tokio::test]
async fn test_scheduler_merges_pr_and_completes_enhancement() {
    let harness = setup_pipeline(
        vec![PLAN_RESPONSE, CODEGEN_RESPONSE, REVIEW_RESPONSE],
        false,
    );
    let id = enqueue(&harness.db, "Add dark mode to dashboard");
    harness.orchestrator.tick().await.unwrap();

    let deployment_id = {
        let guard = harness.db.lock_sync().unwrap();
        guard
            .create_deployment(id, "2020-01-01T00:00:00+00:00")
            .unwrap()
            .id
    };

    let host_dyn: Arc<dyn HostClient> = harness.host.clone();
    let scheduler =
        DeploymentScheduler::new(harness.db.clone(), host_dyn, Arc::new(Notifier::disabled()));
    let summary = scheduler.run_once(Utc::now()).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(*harness.host.merges.lock().unwrap(), vec![42]);

    let guard = harness.db.lock_sync().unwrap();
    let deployment = guard.get_deployment(deployment_id).unwrap().unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Deployed);
    assert!(deployment.notes.unwrap().contains("cafebabe"));
    let row = guard.get_enhancement(id).unwrap().unwrap();
    assert_eq!(row.status, EnhancementStatus::Completed);
    assert!(row.completed_at.is_some());
}
