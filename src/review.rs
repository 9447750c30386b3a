//! Two-tier review: an internal AI pass that always runs, and an optional
//! external review bot polled through PR comments.
//!
//! Classification of the bot's free-text reply is a keyword heuristic with a
//! conservative bias (issue keywords override approval keywords). It is
//! advisory only: the review phase gates visibility, never mergeability;
//! the Deployment Scheduler's structural gate remains authoritative.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::ai::{extract_json, AiClient, AiRequest};
use crate::host::{HostClient, IssueComment};
use crate::models::{Enhancement, ReviewResult};

const REVIEW_INSTRUCTION: &str = r#"You are a code reviewer for an accounting application. Review the generated changes below.

Respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "approved": true,
  "issues": [
    {"severity": "low" | "medium" | "high", "file": "src/path.rs", "line": 10, "message": "..."}
  ],
  "suggestions": ["..."],
  "summary": "One-paragraph review summary"
}"#;

const APPROVAL_PHRASES: &[&str] = &[
    "looks good",
    "lgtm",
    "approved",
    "no issues found",
    "no concerns",
    "ship it",
    "well implemented",
];

const ISSUE_PHRASES: &[&str] = &[
    "issue",
    "bug",
    "vulnerability",
    "security",
    "problem",
    "incorrect",
    "suggest",
    "consider",
    "recommend",
    "should be",
    "missing",
];

/// Verdict extracted from an external reviewer's reply.
#[derive(Debug, Clone, PartialEq)]
pub struct BotVerdict {
    pub approved: bool,
    pub suggestions: Vec<String>,
}

/// Outcome of polling for the external reviewer's reply.
#[derive(Debug, Clone)]
pub struct CopilotPollResult {
    pub responded: bool,
    pub approved: bool,
    pub suggestions: Vec<String>,
}

impl CopilotPollResult {
    fn no_response() -> Self {
        Self {
            responded: false,
            approved: false,
            suggestions: Vec::new(),
        }
    }
}

/// Classify a reviewer reply. Pure function: an explicit approval phrase with
/// no issue phrase means approved; any issue phrase wins over approval.
/// Approval phrases are cut out before the issue scan, otherwise "no issues
/// found" would trip the "issue" keyword it contains.
pub fn classify_reply(body: &str) -> BotVerdict {
    let lower = body.to_lowercase();
    let has_approval = APPROVAL_PHRASES.iter().any(|p| lower.contains(p));
    let mut remainder = lower.clone();
    for phrase in APPROVAL_PHRASES {
        remainder = remainder.replace(phrase, " ");
    }
    let has_issue = ISSUE_PHRASES.iter().any(|p| remainder.contains(p));
    BotVerdict {
        approved: has_approval && !has_issue,
        suggestions: extract_suggestions(body),
    }
}

/// Pull actionable lines out of a reply: bullet or numbered lines, plus whole
/// lines that carry a suggestion keyword without any marker.
pub fn extract_suggestions(body: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let marked = trimmed.starts_with('-')
            || trimmed.starts_with('*')
            || trimmed.starts_with('•')
            || trimmed
                .split_once(['.', ')'])
                .map(|(head, _)| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
        let lower = trimmed.to_lowercase();
        let keyword = ["suggest", "consider", "recommend"]
            .iter()
            .any(|k| lower.contains(k));
        if marked || keyword {
            let text = trimmed
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')'])
                .trim();
            if !text.is_empty() {
                suggestions.push(text.to_string());
            }
        }
    }
    suggestions
}

/// Does a comment author match the reviewer identity we are waiting for?
/// Exact login match, or a bot-typed account whose login contains the
/// reviewer's name (case-insensitive).
pub fn author_matches_reviewer(comment: &IssueComment, reviewer: &str) -> bool {
    let login = comment.author_login.to_lowercase();
    let reviewer = reviewer.to_lowercase();
    login == reviewer || (comment.author_is_bot && login.contains(&reviewer))
}

/// Runs the internal AI review and, when enabled, the external bot flow.
pub struct ReviewOrchestrator {
    ai: Arc<dyn AiClient>,
    host: Arc<dyn HostClient>,
    reviewer: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl ReviewOrchestrator {
    pub fn new(
        ai: Arc<dyn AiClient>,
        host: Arc<dyn HostClient>,
        reviewer: &str,
        poll_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ai,
            host,
            reviewer: reviewer.to_string(),
            poll_attempts,
            poll_interval,
        }
    }

    /// Always-run internal review over the generated file set. The verdict is
    /// surfaced as a PR comment; open issues never block the pipeline.
    pub async fn internal_review(
        &self,
        enhancement: &Enhancement,
        files: &[(String, String)],
    ) -> Result<ReviewResult> {
        let mut listing = String::new();
        for (path, content) in files {
            listing.push_str(&format!("### {}\n```\n{}\n```\n\n", path, content));
        }
        let instruction = format!(
            "{}\n\n## Enhancement\n**Title:** {}\n**Description:** {}\n\n## Changed files\n{}",
            REVIEW_INSTRUCTION, enhancement.title, enhancement.description, listing
        );
        let response = self
            .ai
            .complete(&AiRequest::new(instruction))
            .await
            .context("Review service call failed")?;
        serde_json::from_str(extract_json(&response))
            .context("Failed to parse review response as a ReviewResult")
    }

    /// Post the review-request comment. Returns its id so the poll can ignore
    /// everything at or before it.
    pub async fn request_copilot_review(&self, pr_number: i64) -> Result<i64> {
        let comment = self
            .host
            .post_comment(
                pr_number,
                &format!(
                    "@{} please review this pull request for correctness, security, and style.",
                    self.reviewer
                ),
            )
            .await
            .context("Failed to post review-request comment")?;
        Ok(comment.id)
    }

    /// Poll the PR's comment stream for a reply from the reviewer identity,
    /// up to the configured attempt budget. A timeout is not an error: the
    /// caller falls back to the internal verdict.
    pub async fn poll_for_copilot_response(
        &self,
        pr_number: i64,
        after_comment_id: i64,
    ) -> Result<CopilotPollResult> {
        for attempt in 1..=self.poll_attempts {
            let comments = self
                .host
                .list_comments(pr_number)
                .await
                .context("Failed to list PR comments while polling")?;

            let reply = comments
                .iter()
                .filter(|c| c.id > after_comment_id)
                .find(|c| author_matches_reviewer(c, &self.reviewer));

            if let Some(reply) = reply {
                let verdict = classify_reply(&reply.body);
                info!(pr_number, attempt, approved = verdict.approved, "external reviewer replied");
                return Ok(CopilotPollResult {
                    responded: true,
                    approved: verdict.approved,
                    suggestions: verdict.suggestions,
                });
            }

            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        warn!(pr_number, attempts = self.poll_attempts, "external reviewer did not reply in time");
        Ok(CopilotPollResult::no_response())
    }

    /// Full external flow with deterministic fallback: request, poll, and on
    /// timeout or API error post the internal verdict as a labelled fallback
    /// comment. The phase always completes.
    pub async fn external_review(
        &self,
        pr_number: i64,
        internal: &ReviewResult,
    ) -> CopilotPollResult {
        let poll_outcome = match self.request_copilot_review(pr_number).await {
            Ok(request_id) => self.poll_for_copilot_response(pr_number, request_id).await,
            Err(e) => Err(e),
        };

        match poll_outcome {
            Ok(result) if result.responded => result,
            Ok(_) => self.fallback_to_internal(pr_number, internal, "no reply").await,
            Err(e) => {
                warn!(pr_number, error = %e, "external review failed, falling back");
                self.fallback_to_internal(pr_number, internal, "API error").await
            }
        }
    }

    async fn fallback_to_internal(
        &self,
        pr_number: i64,
        internal: &ReviewResult,
        reason: &str,
    ) -> CopilotPollResult {
        let body = format!(
            "**Automated review (fallback, external reviewer: {})**\n\n{}\n\n{}",
            reason,
            internal.summary,
            format_review_comment(internal),
        );
        if let Err(e) = self.host.post_comment(pr_number, &body).await {
            warn!(pr_number, error = %e, "failed to post fallback review comment");
        }
        CopilotPollResult {
            responded: false,
            approved: internal.approved,
            suggestions: internal.suggestions.clone(),
        }
    }
}

/// Render an internal review for a PR comment.
pub fn format_review_comment(review: &ReviewResult) -> String {
    let mut out = String::new();
    if review.issues.is_empty() {
        out.push_str("No issues found.\n");
    } else {
        out.push_str("**Issues:**\n");
        for issue in &review.issues {
            match issue.line {
                Some(line) => out.push_str(&format!(
                    "- [{:?}] {}:{}: {}\n",
                    issue.severity, issue.file, line, issue.message
                )),
                None => out.push_str(&format!(
                    "- [{:?}] {}: {}\n",
                    issue.severity, issue.file, issue.message
                )),
            }
        }
    }
    if !review.suggestions.is_empty() {
        out.push_str("\n**Suggestions:**\n");
        for suggestion in &review.suggestions {
            out.push_str(&format!("- {}\n", suggestion));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HostError;
    use crate::host::{MergeOutcome, PullRequest, PullRequestStatus};
    use std::sync::Mutex;

    // classify_reply

    #[test]
    fn test_lgtm_is_approved() {
        let verdict = classify_reply("LGTM! The code looks good.");
        assert!(verdict.approved);
    }

    #[test]
    fn test_suggestion_overrides_approval() {
        let verdict = classify_reply("I suggest adding error handling here.");
        assert!(!verdict.approved);
        assert!(verdict.suggestions.len() >= 1);
    }

    #[test]
    fn test_no_issues_found_is_approved() {
        // "issue" is a substring of this approval phrase; it must not count
        // against the verdict.
        let verdict = classify_reply("No issues found.");
        assert!(verdict.approved);
    }

    #[test]
    fn test_no_issues_found_with_trailing_suggestion_is_not_approved() {
        let verdict = classify_reply("No issues found, though I suggest renaming the helper.");
        assert!(!verdict.approved);
    }

    #[test]
    fn test_approval_with_issue_keyword_is_not_approved() {
        let verdict = classify_reply("Looks good overall, but there is one issue with the loop.");
        assert!(!verdict.approved);
    }

    #[test]
    fn test_plain_text_without_phrases_is_not_approved() {
        let verdict = classify_reply("Thanks for the ping, I'll get to this later.");
        assert!(!verdict.approved);
        assert!(verdict.suggestions.is_empty());
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        assert!(classify_reply("APPROVED, no concerns.").approved);
        assert!(!classify_reply("VULNERABILITY found in auth path").approved);
    }

    // extract_suggestions

    #[test]
    fn test_extracts_bulleted_lines() {
        let body = "Some notes:\n- use a typed error\n* avoid unwrap\n• tighten the loop";
        let suggestions = extract_suggestions(body);
        assert_eq!(
            suggestions,
            vec!["use a typed error", "avoid unwrap", "tighten the loop"]
        );
    }

    #[test]
    fn test_extracts_numbered_lines() {
        let body = "1. rename the field\n2) add a test";
        let suggestions = extract_suggestions(body);
        assert_eq!(suggestions, vec!["rename the field", "add a test"]);
    }

    #[test]
    fn test_extracts_keyword_lines_without_markers() {
        let suggestions = extract_suggestions("I suggest adding error handling here.");
        assert_eq!(suggestions, vec!["I suggest adding error handling here."]);
    }

    #[test]
    fn test_ignores_prose_lines() {
        let suggestions = extract_suggestions("This is fine.\nNothing to add.");
        assert!(suggestions.is_empty());
    }

    // author matching

    fn comment(id: i64, login: &str, is_bot: bool, body: &str) -> IssueComment {
        IssueComment {
            id,
            body: body.to_string(),
            author_login: login.to_string(),
            author_is_bot: is_bot,
        }
    }

    #[test]
    fn test_author_exact_match() {
        let c = comment(1, "copilot", false, "");
        assert!(author_matches_reviewer(&c, "copilot"));
        assert!(author_matches_reviewer(&c, "Copilot"));
    }

    #[test]
    fn test_author_bot_substring_match() {
        let c = comment(1, "copilot-pull-request-reviewer[bot]", true, "");
        assert!(author_matches_reviewer(&c, "copilot"));
    }

    #[test]
    fn test_author_substring_requires_bot_type() {
        let c = comment(1, "copilot-fanclub-user", false, "");
        assert!(!author_matches_reviewer(&c, "copilot"));
    }

    // polling

    struct FakeHost {
        comments: Mutex<Vec<IssueComment>>,
    }

    impl FakeHost {
        fn with_comments(comments: Vec<IssueComment>) -> Self {
            Self {
                comments: Mutex::new(comments),
            }
        }
    }

    #[async_trait::async_trait]
    impl HostClient for FakeHost {
        async fn create_pull_request(
            &self,
            _head: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<PullRequest, HostError> {
            unimplemented!("not used in review tests")
        }

        async fn post_comment(&self, _number: i64, body: &str) -> Result<IssueComment, HostError> {
            let mut comments = self.comments.lock().unwrap();
            let id = comments.iter().map(|c| c.id).max().unwrap_or(0) + 1;
            let c = comment(id, "conveyor", false, body);
            comments.push(c.clone());
            Ok(c)
        }

        async fn add_labels(&self, _number: i64, _labels: &[&str]) -> Result<(), HostError> {
            Ok(())
        }

        async fn list_comments(&self, _number: i64) -> Result<Vec<IssueComment>, HostError> {
            Ok(self.comments.lock().unwrap().clone())
        }

        async fn pull_request_status(&self, number: i64) -> Result<PullRequestStatus, HostError> {
            Err(HostError::PullRequestNotFound { number })
        }

        async fn merge(&self, _number: i64) -> Result<MergeOutcome, HostError> {
            unimplemented!("not used in review tests")
        }
    }

    struct NoopAi;

    #[async_trait::async_trait]
    impl AiClient for NoopAi {
        async fn complete(&self, _request: &AiRequest) -> Result<String> {
            Ok(r#"{"approved": true, "summary": "fine"}"#.to_string())
        }
    }

    fn orchestrator(host: Arc<FakeHost>, attempts: u32) -> ReviewOrchestrator {
        ReviewOrchestrator::new(
            Arc::new(NoopAi),
            host,
            "copilot",
            attempts,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_poll_one_attempt_no_match_reports_no_response() {
        let host = Arc::new(FakeHost::with_comments(vec![comment(
            1, "alice", false, "unrelated chatter",
        )]));
        let review = orchestrator(host, 1);
        let result = review.poll_for_copilot_response(42, 1).await.unwrap();
        assert!(!result.responded);
        assert!(!result.approved);
        assert!(result.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_poll_finds_bot_reply_after_request() {
        let host = Arc::new(FakeHost::with_comments(vec![
            comment(1, "conveyor", false, "@copilot please review"),
            comment(2, "copilot[bot]", true, "LGTM, no concerns."),
        ]));
        let review = orchestrator(host, 3);
        let result = review.poll_for_copilot_response(42, 1).await.unwrap();
        assert!(result.responded);
        assert!(result.approved);
    }

    #[tokio::test]
    async fn test_poll_ignores_comments_at_or_before_request() {
        // The reviewer's stale comment predates the request; must not count.
        let host = Arc::new(FakeHost::with_comments(vec![
            comment(1, "copilot[bot]", true, "old approval, looks good"),
            comment(2, "conveyor", false, "@copilot please review"),
        ]));
        let review = orchestrator(host, 1);
        let result = review.poll_for_copilot_response(42, 2).await.unwrap();
        assert!(!result.responded);
    }

    #[tokio::test]
    async fn test_external_review_falls_back_to_internal_verdict() {
        let host = Arc::new(FakeHost::with_comments(vec![]));
        let review = orchestrator(Arc::clone(&host), 1);
        let internal = ReviewResult {
            approved: true,
            issues: vec![],
            suggestions: vec!["tighten the loop".to_string()],
            summary: "fine".to_string(),
        };
        let result = review.external_review(42, &internal).await;
        assert!(!result.responded);
        assert!(result.approved);
        assert_eq!(result.suggestions, vec!["tighten the loop"]);

        // The fallback comment was posted and labelled as such.
        let comments = host.comments.lock().unwrap();
        assert!(comments.iter().any(|c| c.body.contains("fallback")));
    }

    #[tokio::test]
    async fn test_format_review_comment_lists_issues() {
        let review = ReviewResult {
            approved: false,
            issues: vec![crate::models::ReviewIssue {
                severity: crate::models::RiskSeverity::High,
                file: "src/auth.rs".to_string(),
                line: Some(12),
                message: "token logged in plaintext".to_string(),
            }],
            suggestions: vec![],
            summary: String::new(),
        };
        let body = format_review_comment(&review);
        assert!(body.contains("src/auth.rs:12"));
        assert!(body.contains("token logged in plaintext"));
    }
}
