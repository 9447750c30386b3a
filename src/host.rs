//! Thin contract wrapper over the repository hosting API.
//!
//! Everything here is idempotent enough to retry at the caller's discretion
//! except `merge`, which the Deployment Scheduler only invokes after freshly
//! re-verifying mergeability and check status.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::HostError;

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub html_url: String,
}

/// A comment on a pull request's issue thread, with enough author identity to
/// detect a review bot's reply.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: i64,
    pub body: String,
    pub author_login: String,
    pub author_is_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

impl CheckRun {
    /// A check that should block a merge: failed or was cancelled.
    pub fn is_blocking(&self) -> bool {
        matches!(self.conclusion.as_deref(), Some("failure") | Some("cancelled"))
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestStatus {
    pub state: PullRequestState,
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub head_sha: String,
    pub checks: Vec<CheckRun>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: bool,
    pub sha: Option<String>,
}

#[async_trait]
pub trait HostClient: Send + Sync {
    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, HostError>;

    async fn post_comment(&self, number: i64, body: &str) -> Result<IssueComment, HostError>;

    async fn add_labels(&self, number: i64, labels: &[&str]) -> Result<(), HostError>;

    async fn list_comments(&self, number: i64) -> Result<Vec<IssueComment>, HostError>;

    /// Live PR state including check runs for the head commit.
    async fn pull_request_status(&self, number: i64) -> Result<PullRequestStatus, HostError>;

    /// Squash-merge. Only call after the merge gate has been re-verified.
    async fn merge(&self, number: i64) -> Result<MergeOutcome, HostError>;
}

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "conveyor-pipeline";

// Wire shapes for the GitHub REST API (subset of fields we care about).

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
    #[serde(rename = "type")]
    user_type: String,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: i64,
    body: Option<String>,
    user: ApiUser,
}

impl ApiComment {
    fn into_comment(self) -> IssueComment {
        IssueComment {
            id: self.id,
            body: self.body.unwrap_or_default(),
            author_is_bot: self.user.user_type.eq_ignore_ascii_case("bot"),
            author_login: self.user.login,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    state: PullRequestState,
    merged: bool,
    mergeable: Option<bool>,
    head: ApiRef,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRuns {
    check_runs: Vec<CheckRun>,
}

/// Merge response body. The 405/409 rejection shape has only `message` and
/// `documentation_url`, so `merged` must default rather than be required.
#[derive(Debug, Deserialize)]
struct ApiMerge {
    #[serde(default)]
    merged: bool,
    sha: Option<String>,
    message: Option<String>,
}

/// GitHub REST implementation of the hosting contract.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    repo: String,
    token: String,
}

impl GitHubClient {
    pub fn new(repo: &str, token: &str) -> Self {
        Self::with_api_url(GITHUB_API_URL, repo, token)
    }

    /// Point the client at a non-default API root (tests, GitHub Enterprise).
    pub fn with_api_url(api_url: &str, repo: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn check_runs(&self, head_sha: &str) -> Result<Vec<CheckRun>, HostError> {
        let url = self.url(&format!("commits/{}/check-runs", head_sha));
        let runs: ApiCheckRuns = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to send check-runs request")?
            .error_for_status()
            .map_err(|e| HostError::Api(format!("check-runs request failed: {}", e)))?
            .json()
            .await
            .context("Failed to parse check-runs response")?;
        Ok(runs.check_runs)
    }
}

#[async_trait]
impl HostClient for GitHubClient {
    async fn create_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, HostError> {
        let url = self.url("pulls");
        let pr: PullRequest = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "head": head, "base": base, "title": title, "body": body }))
            .send()
            .await
            .context("Failed to send create-PR request")?
            .error_for_status()
            .map_err(|e| HostError::Api(format!("create-PR request failed: {}", e)))?
            .json()
            .await
            .context("Failed to parse create-PR response")?;
        Ok(pr)
    }

    async fn post_comment(&self, number: i64, body: &str) -> Result<IssueComment, HostError> {
        let url = self.url(&format!("issues/{}/comments", number));
        let comment: ApiComment = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("Failed to send comment request")?
            .error_for_status()
            .map_err(|e| HostError::Api(format!("comment request failed: {}", e)))?
            .json()
            .await
            .context("Failed to parse comment response")?;
        Ok(comment.into_comment())
    }

    async fn add_labels(&self, number: i64, labels: &[&str]) -> Result<(), HostError> {
        let url = self.url(&format!("issues/{}/labels", number));
        self.request(reqwest::Method::POST, &url)
            .json(&json!({ "labels": labels }))
            .send()
            .await
            .context("Failed to send labels request")?
            .error_for_status()
            .map_err(|e| HostError::Api(format!("labels request failed: {}", e)))?;
        Ok(())
    }

    async fn list_comments(&self, number: i64) -> Result<Vec<IssueComment>, HostError> {
        let url = self.url(&format!("issues/{}/comments", number));
        let comments: Vec<ApiComment> = self
            .request(reqwest::Method::GET, &url)
            .query(&[("per_page", "100")])
            .send()
            .await
            .context("Failed to send list-comments request")?
            .error_for_status()
            .map_err(|e| HostError::Api(format!("list-comments request failed: {}", e)))?
            .json()
            .await
            .context("Failed to parse comments response")?;
        Ok(comments.into_iter().map(ApiComment::into_comment).collect())
    }

    async fn pull_request_status(&self, number: i64) -> Result<PullRequestStatus, HostError> {
        let url = self.url(&format!("pulls/{}", number));
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to send PR status request")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(HostError::PullRequestNotFound { number });
        }
        let pr: ApiPullRequest = response
            .error_for_status()
            .map_err(|e| HostError::Api(format!("PR status request failed: {}", e)))?
            .json()
            .await
            .context("Failed to parse PR status response")?;

        let checks = self.check_runs(&pr.head.sha).await?;
        Ok(PullRequestStatus {
            state: pr.state,
            merged: pr.merged,
            mergeable: pr.mergeable,
            head_sha: pr.head.sha,
            checks,
        })
    }

    async fn merge(&self, number: i64) -> Result<MergeOutcome, HostError> {
        let url = self.url(&format!("pulls/{}/merge", number));
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&json!({ "merge_method": "squash" }))
            .send()
            .await
            .context("Failed to send merge request")?;

        // 405/409 carry a structured reason (dirty state, head moved).
        let status = response.status();
        let outcome: ApiMerge = response
            .json()
            .await
            .context("Failed to parse merge response")?;
        if !status.is_success() || !outcome.merged {
            return Err(HostError::MergeRejected {
                number,
                message: outcome
                    .message
                    .unwrap_or_else(|| format!("merge returned HTTP {}", status)),
            });
        }
        Ok(MergeOutcome {
            merged: outcome.merged,
            sha: outcome.sha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_comment_maps_bot_identity() {
        let json = r#"{
            "id": 10,
            "body": "LGTM",
            "user": {"login": "copilot-pull-request-reviewer[bot]", "type": "Bot"}
        }"#;
        let comment: ApiComment = serde_json::from_str(json).unwrap();
        let comment = comment.into_comment();
        assert!(comment.author_is_bot);
        assert_eq!(comment.author_login, "copilot-pull-request-reviewer[bot]");
        assert_eq!(comment.body, "LGTM");
    }

    #[test]
    fn test_api_comment_null_body_becomes_empty() {
        let json = r#"{"id": 1, "body": null, "user": {"login": "alice", "type": "User"}}"#;
        let comment: ApiComment = serde_json::from_str(json).unwrap();
        let comment = comment.into_comment();
        assert!(!comment.author_is_bot);
        assert_eq!(comment.body, "");
    }

    #[test]
    fn test_api_pull_request_deserializes() {
        let json = r#"{
            "state": "open",
            "merged": false,
            "mergeable": true,
            "head": {"sha": "abc123"}
        }"#;
        let pr: ApiPullRequest = serde_json::from_str(json).unwrap();
        assert_eq!(pr.state, PullRequestState::Open);
        assert_eq!(pr.mergeable, Some(true));
        assert_eq!(pr.head.sha, "abc123");
    }

    #[test]
    fn test_api_pull_request_unknown_mergeable_is_none() {
        let json = r#"{"state": "open", "merged": false, "mergeable": null, "head": {"sha": "x"}}"#;
        let pr: ApiPullRequest = serde_json::from_str(json).unwrap();
        assert!(pr.mergeable.is_none());
    }

    #[test]
    fn test_check_run_blocking_conclusions() {
        let failing = CheckRun {
            name: "ci".into(),
            status: "completed".into(),
            conclusion: Some("failure".into()),
        };
        let cancelled = CheckRun {
            name: "ci".into(),
            status: "completed".into(),
            conclusion: Some("cancelled".into()),
        };
        let passing = CheckRun {
            name: "ci".into(),
            status: "completed".into(),
            conclusion: Some("success".into()),
        };
        let running = CheckRun {
            name: "ci".into(),
            status: "in_progress".into(),
            conclusion: None,
        };
        assert!(failing.is_blocking());
        assert!(cancelled.is_blocking());
        assert!(!passing.is_blocking());
        assert!(!running.is_blocking());
    }

    #[test]
    fn test_merge_success_body_deserializes() {
        let json = r#"{"merged": true, "sha": "cafebabe", "message": "Pull Request successfully merged"}"#;
        let outcome: ApiMerge = serde_json::from_str(json).unwrap();
        assert!(outcome.merged);
        assert_eq!(outcome.sha.as_deref(), Some("cafebabe"));
    }

    #[test]
    fn test_merge_rejection_body_keeps_reason() {
        // GitHub's 405/409 bodies carry no "merged" or "sha" key at all.
        let json = r#"{
            "message": "Pull Request is not mergeable",
            "documentation_url": "https://docs.github.com/rest/pulls/pulls#merge-a-pull-request"
        }"#;
        let outcome: ApiMerge = serde_json::from_str(json).unwrap();
        assert!(!outcome.merged);
        assert!(outcome.sha.is_none());
        assert_eq!(outcome.message.as_deref(), Some("Pull Request is not mergeable"));
    }

    #[test]
    fn test_url_building() {
        let client = GitHubClient::with_api_url("https://api.github.com/", "owner/repo", "t");
        assert_eq!(
            client.url("pulls/42/merge"),
            "https://api.github.com/repos/owner/repo/pulls/42/merge"
        );
    }
}
