pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod queue;
pub mod reconciliation;
pub mod service;
pub mod status;
pub mod store;
pub mod worker;

use std::sync::Arc;

use tokio::sync::watch;

pub use error::ServiceError;
pub use service::ReviewService;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_version() -> String {
    // Explicit hash from the release build environment wins
    if let Some(git_hash) = option_env!("ARCHREVIEW_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        built_info::PKG_VERSION.to_string()
    }
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub service: Arc<ReviewService>,
    /// Bearer token for operator endpoints. `None` disables them.
    pub ops_auth_token: Option<String>,
    /// Flips to `true` at shutdown; open event streams end when it does.
    pub shutdown: watch::Receiver<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "01234567");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn test_version_is_never_empty() {
        assert!(!get_version().is_empty());
    }
}
