use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reviewsync_core::lease::{GateConfig, DEFAULT_COALESCE_WINDOW, DEFAULT_STALE_AFTER};
use reviewsync_core::pull::DEFAULT_WIP_LABEL;
use reviewsync_core::reconcile::{DEFAULT_REVIEW_TYPE_NAME, DEFAULT_REVIEW_TYPE_PREFIX};
use reviewsync_core::{EngineSettings, ReviewTypeNaming};

use crate::github::GitHubAuth;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_TRACKER_API_URL: &str = "https://www.pivotaltracker.com/services/v5";
pub const STATE_DB_FILE: &str = "reviewsync-state.db";

#[derive(Clone)]
pub struct Config {
    pub github_auth: GitHubAuth,
    pub github_api_url: String,
    /// Only needed by the webhook server.
    pub github_webhook_secret: Option<String>,
    pub tracker_api_token: String,
    pub tracker_api_url: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub gate: GateConfig,
    pub engine: EngineSettings,
}

impl Config {
    /// Configuration for the webhook server; the webhook secret is required.
    pub fn from_env() -> Result<Self> {
        let config = Self::from_env_for_cli()?;
        if config.github_webhook_secret.is_none() {
            bail!("GITHUB_WEBHOOK_SECRET environment variable is required");
        }
        Ok(config)
    }

    /// Configuration for one-off command line runs.
    pub fn from_env_for_cli() -> Result<Self> {
        let github_auth = parse_github_auth(
            non_empty(env::var("GITHUB_TOKEN").ok()),
            non_empty(env::var("GITHUB_APP_ID").ok()),
            non_empty(env::var("GITHUB_PRIVATE_KEY").ok()),
        )?;

        let github_api_url = env::var("GITHUB_API_URL")
            .map(|url| trim_base_url(&url))
            .unwrap_or_else(|_| DEFAULT_GITHUB_API_URL.to_string());

        let github_webhook_secret = non_empty(env::var("GITHUB_WEBHOOK_SECRET").ok());

        let tracker_api_token = env::var("TRACKER_API_TOKEN")
            .context("TRACKER_API_TOKEN environment variable is required")?;

        let tracker_api_url = env::var("TRACKER_API_URL")
            .map(|url| trim_base_url(&url))
            .unwrap_or_else(|_| DEFAULT_TRACKER_API_URL.to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let stale_after = match env::var("LEASE_STALE_AFTER_SECS") {
            Ok(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .context("LEASE_STALE_AFTER_SECS must be a valid number")?,
            ),
            Err(_) => DEFAULT_STALE_AFTER,
        };

        let coalesce_window = parse_coalesce_window(env::var("COALESCE_WINDOW_MS").ok())?;

        let naming = ReviewTypeNaming {
            overrides: parse_review_type_overrides(
                &env::var("REVIEW_TYPE_OVERRIDES").unwrap_or_default(),
            )?,
            prefix: env::var("REVIEW_TYPE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_REVIEW_TYPE_PREFIX.to_string()),
            default_type: env::var("DEFAULT_REVIEW_TYPE")
                .unwrap_or_else(|_| DEFAULT_REVIEW_TYPE_NAME.to_string()),
        };

        let wip_label = env::var("WIP_LABEL").unwrap_or_else(|_| DEFAULT_WIP_LABEL.to_string());

        Ok(Config {
            github_auth,
            github_api_url,
            github_webhook_secret,
            tracker_api_token,
            tracker_api_url,
            port,
            state_dir,
            gate: GateConfig {
                stale_after,
                coalesce_window,
            },
            engine: EngineSettings { naming, wip_label },
        })
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE)
    }
}

/// A static token wins over App credentials when both are present.
pub fn parse_github_auth(
    token: Option<String>,
    app_id: Option<String>,
    private_key: Option<String>,
) -> Result<GitHubAuth> {
    if let Some(token) = token {
        return Ok(GitHubAuth::Token(token));
    }

    match (app_id, private_key) {
        (Some(app_id), Some(private_key)) => Ok(GitHubAuth::App {
            app_id: app_id
                .parse::<u64>()
                .context("GITHUB_APP_ID must be a valid number")?,
            private_key: private_key.replace("\\n", "\n"),
        }),
        _ => Err(anyhow!(
            "Either GITHUB_TOKEN or both GITHUB_APP_ID and GITHUB_PRIVATE_KEY must be set"
        )),
    }
}

/// Missing means the default window; `0` disables coalescing.
pub fn parse_coalesce_window(value: Option<String>) -> Result<Option<Duration>> {
    let Some(value) = value else {
        return Ok(Some(DEFAULT_COALESCE_WINDOW));
    };

    let millis = value
        .trim()
        .parse::<u64>()
        .context("COALESCE_WINDOW_MS must be a valid number")?;

    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

/// Parse `repo=Review Type,other-repo=Other` into a map.
pub fn parse_review_type_overrides(value: &str) -> Result<HashMap<String, String>> {
    let mut overrides = HashMap::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (repo, review_type) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid REVIEW_TYPE_OVERRIDES entry '{}'", entry))?;

        let (repo, review_type) = (repo.trim(), review_type.trim());
        if repo.is_empty() || review_type.is_empty() {
            bail!("Invalid REVIEW_TYPE_OVERRIDES entry '{}'", entry);
        }
        overrides.insert(repo.to_string(), review_type.to_string());
    }

    Ok(overrides)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn trim_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
