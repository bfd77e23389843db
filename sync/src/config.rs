//! # Synchronization configuration
//!
//! Module dedicated to the synchronization configuration. The main
//! structure is [`SyncConfig`], carried by every session; the
//! [`SyncPolicy`] decides whether local changes are pushed back to
//! the remote account.

use std::{fmt, sync::Arc, time::Duration};

/// Decision taken for one folder path by a [`PathMapper`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathMapping {
    /// Do not synchronize this folder at all.
    Ignore,

    /// Synchronize it under the given path on the other side.
    Path(String),
}

/// User-supplied folder path remapping.
///
/// Consulted before the built-in delimiter translation; returning
/// `None` falls back to it.
pub trait PathMapper: Send + Sync {
    fn to_local(&self, remote_path: &str) -> Option<PathMapping>;
    fn to_remote(&self, local_path: &str) -> Option<PathMapping>;
}

/// The synchronization policy.
///
/// `ImportOnly` pulls remote state but never mutates the remote
/// account (no folder create/rename/delete, no append, no flag push,
/// no remote expunge).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncPolicy {
    #[default]
    Bidirectional,
    ImportOnly,
}

impl SyncPolicy {
    /// Whether local changes may be pushed to the remote account.
    pub fn pushes_changes(&self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

/// The configuration of one synchronized account.
#[derive(Clone)]
pub struct SyncConfig {
    /// Account name, used for logging and error counter scoping.
    pub account: String,

    pub policy: SyncPolicy,

    /// Local path every synchronized folder lives under. Empty for
    /// the local mailbox root.
    pub local_root: String,

    /// Restrict the session to INBOX (no folder reconciliation
    /// besides it).
    pub sync_inbox_only: bool,

    /// Keep going with the remaining folders when one folder pass
    /// fails on a connection error.
    pub tolerate_partial_failure: bool,

    /// Consecutive failures after which one item is given up on.
    pub max_item_errors: u32,

    /// Distinct failed items after which folder synchronization is
    /// disabled for the account.
    pub max_total_errors: u32,

    /// How many messages a body fetch asks for at once.
    pub fetch_batch_size: usize,

    /// Upper bound on SEARCH results examined by the append
    /// deduplication fallback.
    pub search_fallback_limit: usize,

    /// Timeout hint applied around known-slow commands (the SEARCH
    /// fallback), restored afterwards.
    pub slow_command_timeout: Option<Duration>,

    pub path_mapper: Option<Arc<dyn PathMapper>>,
}

impl SyncConfig {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            policy: SyncPolicy::default(),
            local_root: String::new(),
            sync_inbox_only: false,
            tolerate_partial_failure: true,
            max_item_errors: 3,
            max_total_errors: 10,
            fetch_batch_size: 100,
            search_fallback_limit: 200,
            slow_command_timeout: None,
            path_mapper: None,
        }
    }

    pub fn set_policy(&mut self, policy: SyncPolicy) {
        self.policy = policy;
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    pub fn set_local_root(&mut self, root: impl Into<String>) {
        self.local_root = root.into();
    }

    pub fn with_local_root(mut self, root: impl Into<String>) -> Self {
        self.set_local_root(root);
        self
    }

    pub fn set_sync_inbox_only(&mut self, inbox_only: bool) {
        self.sync_inbox_only = inbox_only;
    }

    pub fn with_sync_inbox_only(mut self, inbox_only: bool) -> Self {
        self.set_sync_inbox_only(inbox_only);
        self
    }

    pub fn set_path_mapper(&mut self, mapper: impl PathMapper + 'static) {
        self.path_mapper = Some(Arc::new(mapper));
    }

    pub fn with_path_mapper(mut self, mapper: impl PathMapper + 'static) -> Self {
        self.set_path_mapper(mapper);
        self
    }

    pub fn with_slow_command_timeout(mut self, timeout: Duration) -> Self {
        self.slow_command_timeout = Some(timeout);
        self
    }

    /// Remote to local translation, mapper first, then the built-in
    /// delimiter translation.
    pub fn map_remote_path(&self, remote: &str, delimiter: char) -> PathMapping {
        if let Some(mapping) = self
            .path_mapper
            .as_ref()
            .and_then(|m| m.to_local(remote))
        {
            return mapping;
        }
        PathMapping::Path(crate::folder::local_path_from_remote(
            remote,
            delimiter,
            &self.local_root,
        ))
    }

    /// Local to remote translation. `Ignore` also covers local
    /// folders outside the sync root.
    pub fn map_local_path(&self, local: &str, delimiter: char) -> PathMapping {
        if let Some(mapping) = self.path_mapper.as_ref().and_then(|m| m.to_remote(local)) {
            return mapping;
        }
        match crate::folder::remote_path_from_local(local, &self.local_root, delimiter) {
            Some(path) => PathMapping::Path(path),
            None => PathMapping::Ignore,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("account", &self.account)
            .field("policy", &self.policy)
            .field("local_root", &self.local_root)
            .field("sync_inbox_only", &self.sync_inbox_only)
            .field("tolerate_partial_failure", &self.tolerate_partial_failure)
            .field("max_item_errors", &self.max_item_errors)
            .field("max_total_errors", &self.max_total_errors)
            .field("fetch_batch_size", &self.fetch_batch_size)
            .field("search_fallback_limit", &self.search_fallback_limit)
            .field("slow_command_timeout", &self.slow_command_timeout)
            .field("path_mapper", &self.path_mapper.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefixer;

    impl PathMapper for Prefixer {
        fn to_local(&self, remote_path: &str) -> Option<PathMapping> {
            match remote_path {
                "Lists" => Some(PathMapping::Ignore),
                "Archive" => Some(PathMapping::Path("Mail/Old".into())),
                _ => None,
            }
        }

        fn to_remote(&self, local_path: &str) -> Option<PathMapping> {
            match local_path {
                "Mail/Old" => Some(PathMapping::Path("Archive".into())),
                _ => None,
            }
        }
    }

    #[test]
    fn mapper_takes_precedence_over_delimiter_translation() {
        let config = SyncConfig::new("test")
            .with_local_root("Mail")
            .with_path_mapper(Prefixer);

        assert_eq!(config.map_remote_path("Lists", '.'), PathMapping::Ignore);
        assert_eq!(
            config.map_remote_path("Archive", '.'),
            PathMapping::Path("Mail/Old".into())
        );
        assert_eq!(
            config.map_remote_path("Work.Reports", '.'),
            PathMapping::Path("Mail/Work/Reports".into())
        );
    }

    #[test]
    fn local_folders_outside_the_root_are_ignored() {
        let config = SyncConfig::new("test").with_local_root("Mail");
        assert_eq!(config.map_local_path("Notes/Todo", '.'), PathMapping::Ignore);
        assert_eq!(
            config.map_local_path("Mail/Work/Reports", '.'),
            PathMapping::Path("Work.Reports".into())
        );
    }
}
