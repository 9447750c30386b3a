//! Deployment scheduler: merges approved pull requests on their scheduled
//! date, strictly one at a time.
//!
//! A deployment is only eligible once its scheduled date has arrived. The
//! merge gate re-checks everything at merge time; nothing is trusted from
//! earlier phases. A deployment that cannot merge is marked failed with a
//! human-readable reason and never blocks the rest of the batch.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::host::{HostClient, PullRequestState, PullRequestStatus};
use crate::models::{Deployment, DeploymentStatus, Enhancement};
use crate::notify::{Event, Notifier};
use crate::store::DbHandle;

pub struct DeploymentScheduler {
    db: DbHandle,
    host: Arc<dyn HostClient>,
    notifier: Arc<Notifier>,
}

/// Counts for one scheduler run; the CLI exits non-zero when `failed > 0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeploySummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// What the merge gate decided for one pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Someone merged it by hand; record success without calling merge.
    AlreadyMerged,
    /// Everything checks out: squash-merge now.
    Merge,
    /// Cannot merge; the reason goes verbatim into the deployment notes.
    Blocked(String),
}

/// Pure merge-gate policy: a PR merges iff it is open, mergeable, and has no
/// failing or cancelled check run.
pub fn evaluate_merge_gate(status: &PullRequestStatus) -> GateDecision {
    if status.merged {
        return GateDecision::AlreadyMerged;
    }
    if status.state == PullRequestState::Closed {
        return GateDecision::Blocked(
            "pull request was closed without being merged".to_string(),
        );
    }
    if status.mergeable != Some(true) {
        return GateDecision::Blocked(
            "pull request is not mergeable (merge conflict or unknown state)".to_string(),
        );
    }
    if let Some(check) = status.checks.iter().find(|c| c.is_blocking()) {
        return GateDecision::Blocked(format!(
            "check '{}' concluded '{}'",
            check.name,
            check.conclusion.as_deref().unwrap_or("unknown")
        ));
    }
    GateDecision::Merge
}

impl DeploymentScheduler {
    pub fn new(db: DbHandle, host: Arc<dyn HostClient>, notifier: Arc<Notifier>) -> Self {
        Self { db, host, notifier }
    }

    /// Process every deployment due at `now`, sequentially. One deployment's
    /// failure never aborts the batch.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DeploySummary> {
        let cutoff = now.to_rfc3339();
        let due = self
            .db
            .call(move |db| db.due_deployments(&cutoff))
            .await
            .context("Failed to load due deployments")?;

        let mut summary = DeploySummary::default();
        info!(due = due.len(), "deployment scheduler run");

        for deployment in due {
            let id = deployment.id;
            let claimed = self.db.call(move |db| db.claim_deployment(id)).await?;
            if !claimed {
                // Another scheduler got there first.
                continue;
            }
            summary.processed += 1;

            match self.deploy_one(&deployment, now).await {
                Ok(()) => summary.succeeded += 1,
                Err(reason) => {
                    summary.failed += 1;
                    error!(deployment = id, reason = %reason, "deployment failed");
                    if let Err(e) = self
                        .db
                        .call({
                            let reason = reason.clone();
                            move |db| {
                                db.finish_deployment(id, DeploymentStatus::Failed, None, &reason)
                            }
                        })
                        .await
                    {
                        error!(deployment = id, error = %e, "failed to record deployment failure");
                    }
                    self.notify(&deployment, Event::DeploymentFailed, &reason)
                        .await;
                }
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "deployment scheduler run finished"
        );
        Ok(summary)
    }

    /// Run the merge gate and merge for a single claimed deployment. The
    /// `Err` variant carries the failure reason for the deployment notes.
    async fn deploy_one(
        &self,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let enhancement_id = deployment.enhancement_id;
        let enhancement = self
            .db
            .call(move |db| db.get_enhancement(enhancement_id))
            .await
            .map_err(|e| format!("store error: {:#}", e))?
            .ok_or_else(|| format!("enhancement {} not found", enhancement_id))?;

        let Some(pr_number) = enhancement.pr_number else {
            return Err("no pull request recorded for this enhancement".to_string());
        };

        let status = self
            .host
            .pull_request_status(pr_number)
            .await
            .map_err(|e| format!("Host API error: {}", e))?;

        let deployed_at = now.to_rfc3339();
        let id = deployment.id;
        match evaluate_merge_gate(&status) {
            GateDecision::AlreadyMerged => {
                info!(deployment = id, pr_number, "already merged");
                self.record_success(deployment, &deployed_at, "already merged")
                    .await
            }
            GateDecision::Blocked(reason) => Err(reason),
            GateDecision::Merge => {
                let outcome = self
                    .host
                    .merge(pr_number)
                    .await
                    .map_err(|e| format!("merge failed: {}", e))?;
                let sha = outcome.sha.as_deref().unwrap_or("unknown").to_string();
                info!(deployment = id, pr_number, sha = %sha, "merged");
                self.record_success(deployment, &deployed_at, &format!("Merged as {}", sha))
                    .await
            }
        }
    }

    async fn record_success(
        &self,
        deployment: &Deployment,
        deployed_at: &str,
        notes: &str,
    ) -> std::result::Result<(), String> {
        let id = deployment.id;
        let enhancement_id = deployment.enhancement_id;
        self.db
            .call({
                let deployed_at = deployed_at.to_string();
                let notes = notes.to_string();
                move |db| {
                    db.finish_deployment(
                        id,
                        DeploymentStatus::Deployed,
                        Some(&deployed_at),
                        &notes,
                    )?;
                    // A merged PR closes out the enhancement itself.
                    db.mark_completed(enhancement_id, Some(&notes))
                }
            })
            .await
            .map_err(|e| format!("store error: {:#}", e))?;
        self.notify(deployment, Event::DeploymentSucceeded, notes)
            .await;
        Ok(())
    }

    async fn notify(&self, deployment: &Deployment, event: Event, detail: &str) {
        let enhancement_id = deployment.enhancement_id;
        let enhancement: Option<Enhancement> = match self
            .db
            .call(move |db| db.get_enhancement(enhancement_id))
            .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "could not load enhancement for notification");
                None
            }
        };
        self.notifier
            .deployment_event(
                event,
                deployment,
                enhancement.as_ref().map(|e| e.requested_by.as_str()),
                detail,
            )
            .await;
    }
}
