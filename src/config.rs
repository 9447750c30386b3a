use std::time::Duration;

use anyhow::{Context, Result};

/// Process configuration, read once from the environment at startup.
///
/// Constructed in `main` and passed into every component constructor; nothing
/// reads environment variables after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the repository hosting API. Required.
    pub github_token: String,
    /// `owner/repo` slug of the target repository. Required.
    pub github_repo: String,
    /// Base URL of the AI planning/codegen/review service. Required.
    pub ai_service_url: String,
    /// Optional bearer key for the AI service.
    pub ai_service_key: Option<String>,
    pub database_path: String,
    /// Path of the single shared working copy of the source tree.
    pub workspace_path: String,
    pub base_branch: String,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: i64,
    /// Stop after planning, without touching the source tree.
    pub dry_run: bool,
    pub copilot_review_enabled: bool,
    /// Reviewer identity the external review poll looks for.
    pub copilot_reviewer: String,
    pub copilot_poll_attempts: u32,
    pub copilot_poll_interval: Duration,
    pub notify_webhook_url: Option<String>,
    pub notify_email_url: Option<String>,
    pub notify_email_from: String,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("Missing required environment variable {}", name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_u64_var(name: &str, default: u64) -> Result<u64> {
    match optional(name) {
        Some(v) => v
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, v)),
        None => Ok(default),
    }
}

impl Config {
    /// Read configuration from the environment. Missing credentials are fatal:
    /// the caller exits before entering the poll loop.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            github_token: required("GITHUB_TOKEN")?,
            github_repo: required("GITHUB_REPO")?,
            ai_service_url: required("AI_SERVICE_URL")?,
            ai_service_key: optional("AI_SERVICE_KEY"),
            database_path: optional("DATABASE_PATH").unwrap_or_else(|| "conveyor.db".to_string()),
            workspace_path: optional("WORKSPACE_PATH").unwrap_or_else(|| ".".to_string()),
            base_branch: optional("BASE_BRANCH").unwrap_or_else(|| "main".to_string()),
            poll_interval: Duration::from_secs(parse_u64_var("POLL_INTERVAL_SECS", 30)?),
            max_concurrent_jobs: parse_u64_var("MAX_CONCURRENT_JOBS", 1)? as i64,
            dry_run: optional("DRY_RUN").map(|v| parse_bool(&v)).unwrap_or(false),
            copilot_review_enabled: optional("COPILOT_REVIEW_ENABLED")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            copilot_reviewer: optional("COPILOT_REVIEWER")
                .unwrap_or_else(|| "copilot".to_string()),
            copilot_poll_attempts: parse_u64_var("COPILOT_POLL_ATTEMPTS", 10)? as u32,
            copilot_poll_interval: Duration::from_secs(parse_u64_var(
                "COPILOT_POLL_INTERVAL_SECS",
                30,
            )?),
            notify_webhook_url: optional("NOTIFY_WEBHOOK_URL"),
            notify_email_url: optional("NOTIFY_EMAIL_URL"),
            notify_email_from: optional("NOTIFY_EMAIL_FROM")
                .unwrap_or_else(|| "conveyor@localhost".to_string()),
        })
    }
}
