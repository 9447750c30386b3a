//! The per-enhancement state machine and the long-running poll loop.
//!
//! One worker at a time drives a claimed enhancement through
//! planning -> implementing -> reviewing -> (copilot_reviewing) -> pr_created.
//! Any error at any phase is caught once at the outer boundary of `process`:
//! the row is marked failed with the error text, the workspace branch is
//! abandoned, and a failure notification goes out. Phase errors never stop
//! the loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::codegen::{apply_results, CodeGenerator};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::host::HostClient;
use crate::models::{Enhancement, EnhancementStatus, FileOperation, Plan};
use crate::notify::{Event, Notifier};
use crate::planner::Planner;
use crate::review::{format_review_comment, ReviewOrchestrator};
use crate::store::DbHandle;
use crate::workspace::{branch_name, WorkspaceManager};

pub struct Orchestrator {
    db: DbHandle,
    config: Config,
    planner: Planner,
    codegen: CodeGenerator,
    review: ReviewOrchestrator,
    host: Arc<dyn HostClient>,
    /// The single shared working copy; the mutex makes the one-job-at-a-time
    /// invariant enforceable in code rather than only in configuration.
    workspace: Arc<Mutex<WorkspaceManager>>,
    notifier: Arc<Notifier>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbHandle,
        config: Config,
        planner: Planner,
        codegen: CodeGenerator,
        review: ReviewOrchestrator,
        host: Arc<dyn HostClient>,
        workspace: Arc<Mutex<WorkspaceManager>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            config,
            planner,
            codegen,
            review,
            host,
            workspace,
            notifier,
        }
    }

    /// The long-running poll loop. Sleeps a fixed interval between
    /// iterations; only process-level signals stop it.
    pub async fn run_loop(&self) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            dry_run = self.config.dry_run,
            "orchestrator started"
        );
        loop {
            match self.tick().await {
                Ok(true) => {} // processed one; poll again immediately-ish
                Ok(false) => {}
                Err(e) => error!(error = %e, "poll iteration failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One poll iteration: capacity check, candidate selection, claim, and
    /// processing. Returns whether an enhancement was processed.
    pub async fn tick(&self) -> Result<bool> {
        let active = self.db.call(|db| db.active_count()).await?;
        if active >= self.config.max_concurrent_jobs {
            info!(active, "at capacity, waiting");
            return Ok(false);
        }

        let Some(candidate) = self.db.call(|db| db.next_pending()).await? else {
            return Ok(false);
        };

        let id = candidate.id;
        let claimed = self.db.call(move |db| db.claim(id)).await?;
        if !claimed {
            // Another worker won; pick a new candidate next iteration.
            info!(id, "lost claim race");
            return Ok(false);
        }

        info!(id, title = %candidate.title, "claimed enhancement");
        self.notifier
            .enhancement_event(Event::EnhancementStarted, &candidate, "Processing started")
            .await;
        self.process(candidate).await;
        Ok(true)
    }

    /// Drive one claimed enhancement to a terminal-or-pr_created state. This
    /// is the single error boundary for the whole pipeline run.
    pub async fn process(&self, enhancement: Enhancement) {
        let id = enhancement.id;
        if let Err(e) = self.run_phases(&enhancement).await {
            let message = format!("{:#}", anyhow::Error::from(e));
            error!(id, error = %message, "enhancement failed");

            if let Err(store_err) = self
                .db
                .call({
                    let message = message.clone();
                    move |db| db.mark_failed(id, &message)
                })
                .await
            {
                error!(id, error = %store_err, "failed to record failure");
            }

            self.cleanup_workspace(id).await;

            if let Ok(Some(failed)) = self.db.call(move |db| db.get_enhancement(id)).await {
                self.notifier
                    .enhancement_event(Event::EnhancementFailed, &failed, &message)
                    .await;
            }
        }
    }

    /// Discard any half-done branch so the next claim starts clean. The
    /// branch name comes from the row: it was persisted before any commit.
    async fn cleanup_workspace(&self, id: i64) {
        let branch = match self.db.call(move |db| db.get_enhancement(id)).await {
            Ok(Some(row)) => row.branch_name,
            _ => None,
        };
        let workspace = self.workspace.lock().await;
        if let Err(e) = workspace.abandon(branch.as_deref()) {
            error!(id, error = %e, "workspace cleanup failed; next job will re-clean");
        }
    }

    async fn set_status(&self, id: i64, status: EnhancementStatus) -> Result<()> {
        self.db.call(move |db| db.set_status(id, status)).await
    }

    async fn run_phases(&self, enhancement: &Enhancement) -> Result<(), PipelineError> {
        let id = enhancement.id;

        // Planning
        self.set_status(id, EnhancementStatus::Planning).await?;
        let plan = self
            .planner
            .plan(&enhancement.title, &enhancement.description, None)
            .await
            .map_err(PipelineError::Planning)?;
        let plan_json =
            serde_json::to_string(&plan).map_err(|e| PipelineError::Other(e.into()))?;
        self.db
            .call(move |db| db.set_plan(id, &plan_json))
            .await?;
        info!(id, tasks = plan.tasks.len(), "plan stored");

        if self.config.dry_run {
            self.db
                .call(move |db| db.mark_completed(id, Some("Dry run: stopped after planning")))
                .await?;
            info!(id, "dry run, stopping after planning");
            if let Ok(Some(row)) = self.db.call(move |db| db.get_enhancement(id)).await {
                self.notifier
                    .enhancement_event(Event::EnhancementCompleted, &row, "Dry run")
                    .await;
            }
            return Ok(());
        }

        // Implementing
        self.set_status(id, EnhancementStatus::Implementing).await?;
        let branch = branch_name(id, &enhancement.title);
        let generated = {
            let workspace = self.workspace.lock().await;
            workspace.ensure_clean()?;
            workspace.sync_base()?;
            workspace.create_branch(&branch)?;
            {
                let branch = branch.clone();
                self.db.call(move |db| db.set_branch(id, &branch)).await?;
            }

            let mut generated: Vec<(String, String)> = Vec::new();
            let mut touched = Vec::new();
            for task in &plan.tasks {
                let existing = CodeGenerator::existing_content(workspace.path(), task);
                let results = self
                    .codegen
                    .generate(task, existing.as_deref(), None)
                    .await
                    .map_err(|source| PipelineError::CodeGen {
                        task_id: task.id,
                        source,
                    })?;
                let applied = apply_results(workspace.path(), &results).map_err(|source| {
                    PipelineError::CodeGen {
                        task_id: task.id,
                        source,
                    }
                })?;
                touched.extend(applied);
                for result in &results {
                    if let (FileOperation::Create | FileOperation::Modify, Some(content)) =
                        (result.operation, result.content.as_ref())
                    {
                        generated.push((result.path.clone(), content.clone()));
                    }
                }
                info!(id, task = task.id, "task applied");
            }

            let message = format!("Enhancement #{}: {}", id, enhancement.title);
            workspace.commit_paths(&touched, &message)?;
            workspace.push(&branch)?;
            generated
        };

        // Reviewing, then the PR itself
        self.set_status(id, EnhancementStatus::Reviewing).await?;
        let internal = self
            .review
            .internal_review(enhancement, &generated)
            .await?;

        let pr = self
            .host
            .create_pull_request(
                &branch,
                &self.config.base_branch,
                &enhancement.title,
                &build_pr_body(enhancement, &plan),
            )
            .await?;
        {
            let url = pr.html_url.clone();
            self.db
                .call(move |db| db.set_pull_request(id, pr.number, &url))
                .await?;
        }
        info!(id, pr_number = pr.number, "pull request created");

        // Advisory only: review findings become a comment, never a failure.
        if let Err(e) = self
            .host
            .post_comment(
                pr.number,
                &format!(
                    "**Automated review**\n\n{}\n\n{}",
                    internal.summary,
                    format_review_comment(&internal)
                ),
            )
            .await
        {
            warn!(id, error = %e, "failed to post internal review comment");
        }
        if let Err(e) = self
            .host
            .add_labels(pr.number, &["automated", "enhancement"])
            .await
        {
            warn!(id, error = %e, "failed to add labels");
        }

        // External review, feature-flagged
        if self.config.copilot_review_enabled {
            self.set_status(id, EnhancementStatus::CopilotReviewing)
                .await?;
            let outcome = self.review.external_review(pr.number, &internal).await;
            info!(
                id,
                responded = outcome.responded,
                approved = outcome.approved,
                "review phase complete"
            );
        }

        // Hand off to the deployment scheduler
        self.set_status(id, EnhancementStatus::PrCreated).await?;
        if let Ok(Some(row)) = self.db.call(move |db| db.get_enhancement(id)).await {
            self.notifier
                .enhancement_event(Event::PrCreated, &row, &pr.html_url)
                .await;
        }
        Ok(())
    }
}

/// Render the PR description from the enhancement and its plan.
pub fn build_pr_body(enhancement: &Enhancement, plan: &Plan) -> String {
    let mut body = format!(
        "## Summary\n\nAutomated implementation for: **{}**\n\n{}\n\n{}\n",
        enhancement.title,
        if enhancement.description.is_empty() {
            "No description provided."
        } else {
            &enhancement.description
        },
        plan.summary,
    );
    body.push_str("\n## Tasks\n");
    for task in &plan.tasks {
        body.push_str(&format!(
            "- [{}] {} ({})\n",
            task.id,
            task.title,
            task.task_type.as_str()
        ));
    }
    if !plan.risks.is_empty() {
        body.push_str("\n## Risks\n");
        for risk in &plan.risks {
            body.push_str(&format!(
                "- **{:?}**: {} ({})\n",
                risk.severity, risk.description, risk.mitigation
            ));
        }
    }
    if !plan.estimated_effort.is_empty() {
        body.push_str(&format!("\n_Estimated effort: {}_\n", plan.estimated_effort));
    }
    body.push_str("\n---\n*Created by the conveyor pipeline*\n");
    body
}
