pub mod config;
pub mod github;
pub mod http;
pub mod sqlite;
pub mod tracker;
pub mod webhook;

use std::sync::Arc;

use reviewsync_core::{CoordinationGate, EngineSettings, GateConfig, LeaseStore, SyncEngine};

pub use github::{GitHubAuth, GitHubClient, InstallationScope};
pub use http::CorrelationId;
pub use sqlite::SqliteLeaseStore;
pub use tracker::TrackerClient;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(git_hash: &str) -> String {
    git_hash.get(..8).unwrap_or(git_hash).to_string()
}

pub fn get_service_version() -> String {
    // Release builds pass the git hash in; cargo builds fall back to built's git detection
    if let Some(git_hash) = option_env!("REVIEWSYNC_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

pub struct AppState {
    pub github_client: GitHubClient,
    pub tracker_client: TrackerClient,
    pub lease_store: Arc<dyn LeaseStore>,
    pub gate_config: GateConfig,
    pub engine_settings: EngineSettings,
    pub webhook_secret: String,
}

impl AppState {
    /// Engine for one trigger, tagging every outgoing call with `correlation_id`.
    pub fn engine(&self, installation_id: Option<u64>, correlation_id: CorrelationId) -> SyncEngine {
        SyncEngine::new(
            Arc::new(
                self.github_client
                    .scoped(installation_id, Some(correlation_id.clone())),
            ),
            Arc::new(self.tracker_client.with_correlation_id(correlation_id)),
            CoordinationGate::new(self.lease_store.clone(), self.gate_config),
            self.engine_settings.clone(),
        )
    }
}
