//! # Backend module
//!
//! Module dedicated to the two store abstractions the engine drives:
//! [`RemoteMailStore`], the remote IMAP account, and
//! [`LocalMailStore`], the local mailbox storage. The engine never
//! speaks the wire protocol nor touches storage directly, it only
//! goes through these traits.
//!
//! Both traits return the module's own [`Result`], whose [`Error`]
//! carries the continuable/fatal distinction the error budgets rely
//! on.

pub mod local;
pub mod remote;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    flag::Flags,
    folder::{Folder, ListingEntry},
    message::{LocalMessage, MessageContent, MessageEnvelope, RemoteMessage, SearchQuery},
};

/// A remote message UID. `0` is never a valid UID and marks an
/// unresolved append.
pub type Uid = u64;

/// The UID sentinel of a tracker whose append could not be resolved.
pub const UID_UNASSIGNED: Uid = 0;

/// A local message identifier.
pub type ItemId = u32;

/// A local folder identifier.
pub type FolderId = u32;

/// Error dedicated to store operations.
///
/// The variant decides how the engine reacts: command failures and
/// benign local conflicts are counted against the error budgets and
/// skipped, connection losses abort the folder pass, consistency
/// violations abort the session.
#[derive(Debug, Error)]
pub enum Error {
    /// A single command failed but the session can go on.
    #[error("cannot execute store command: {0}")]
    CommandFailedError(String),

    /// The connection to the store is gone.
    #[error("cannot reach store: {0}")]
    ConnectionError(String),

    /// The addressed item does not exist (anymore).
    #[error("cannot find store item")]
    NotFoundError,

    /// A local write conflicted with an identical concurrent write.
    #[error("cannot insert duplicate row")]
    DuplicateRowError,

    #[error(transparent)]
    OtherError(#[from] anyhow::Error),
}

impl Error {
    /// Whether the session may continue after this error.
    pub fn can_continue(&self) -> bool {
        matches!(
            self,
            Self::CommandFailedError(_) | Self::NotFoundError | Self::DuplicateRowError
        )
    }

    /// Whether the error reflects a state already converged (the item
    /// is gone or the row already exists) rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NotFoundError | Self::DuplicateRowError)
    }
}

/// The `Result` alias of store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The STATUS summary of one remote folder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MailboxStatus {
    pub uid_validity: u64,
    pub uid_next: Uid,
    pub exists: u32,
    pub unseen: u32,
    pub read_only: bool,
}

/// Capabilities of the remote store, probed once per session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCapabilities {
    /// UIDPLUS: COPY and APPEND report the resulting UID.
    pub uid_plus: bool,

    /// Whether SEARCH is usable for the append fallback.
    pub search: bool,

    /// Lower-cased server vendor hint, when advertised (ID command).
    pub vendor: Option<String>,
}

impl RemoteCapabilities {
    fn vendor_is(&self, name: &str) -> bool {
        self.vendor.as_deref() == Some(name)
    }

    /// Whether COPY reports the destination UID.
    pub fn has_copy_uid(&self) -> bool {
        // Yahoo reports COPYUID without advertising UIDPLUS.
        self.uid_plus || self.vendor_is("yahoo")
    }

    /// Whether APPEND reports the new UID.
    pub fn has_append_uid(&self) -> bool {
        self.uid_plus || self.vendor_is("yahoo")
    }

    /// Whether the vendor is known to keep UIDNEXT strictly
    /// monotonic, making an inconsistent UIDNEXT a corruption sign.
    pub fn has_reliable_uid_next(&self) -> bool {
        self.vendor_is("yahoo")
    }
}

/// One batch of local changes, drained from the local change log.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocalChanges {
    pub added_folders: Vec<FolderId>,
    pub deleted_folders: Vec<FolderId>,
    pub modified_folders: Vec<FolderId>,
    pub added_messages: Vec<ItemId>,
    pub updated_messages: Vec<ItemId>,
    pub deleted_messages: Vec<ItemId>,

    /// The change sequence these entries run up to (inclusive).
    pub seq: u64,
}

impl LocalChanges {
    pub fn is_empty(&self) -> bool {
        self.added_folders.is_empty()
            && self.deleted_folders.is_empty()
            && self.modified_folders.is_empty()
            && self.added_messages.is_empty()
            && self.updated_messages.is_empty()
            && self.deleted_messages.is_empty()
    }
}

/// The remote IMAP account, as the engine sees it.
///
/// Paths are remote paths. Implementations own connection management,
/// literals and encoding; the engine only sequences commands.
#[async_trait]
pub trait RemoteMailStore: Send + Sync {
    async fn capabilities(&self) -> Result<RemoteCapabilities>;

    /// Lists folders matching the given pattern (`*` for all).
    async fn list_folders(&self, pattern: &str) -> Result<Vec<ListingEntry>>;

    /// SELECTs the folder and returns its status.
    async fn select(&self, path: &str) -> Result<MailboxStatus>;

    /// Returns the STATUS of the folder without selecting it.
    async fn status(&self, path: &str) -> Result<MailboxStatus>;

    async fn folder_exists(&self, path: &str) -> Result<bool>;
    async fn create_folder(&self, path: &str) -> Result<()>;
    async fn delete_folder(&self, path: &str) -> Result<()>;
    async fn rename_folder(&self, from: &str, to: &str) -> Result<()>;

    /// CLOSEs the folder, expunging messages marked `\Deleted`.
    async fn close(&self, path: &str) -> Result<()>;

    /// Fetches flags for the UID range `first..=last`.
    async fn fetch_flags(&self, path: &str, first: Uid, last: Uid) -> Result<Vec<RemoteMessage>>;

    /// Lists UIDs in the range `first..=last` (`0` for an unbounded
    /// upper end).
    async fn list_uids(&self, path: &str, first: Uid, last: Uid) -> Result<Vec<Uid>>;

    /// Fetches full messages for the given UIDs. UIDs the server did
    /// not answer for are simply absent from the result.
    async fn fetch_messages(&self, path: &str, uids: &[Uid])
        -> Result<Vec<(Uid, MessageContent)>>;

    /// Fetches one message.
    async fn fetch_message(&self, path: &str, uid: Uid) -> Result<MessageContent>;

    /// Fetches envelope summaries for the given UIDs.
    async fn fetch_envelopes(&self, path: &str, uids: &[Uid]) -> Result<Vec<MessageEnvelope>>;

    /// APPENDs a message and returns its UID when the server reports
    /// it (UIDPLUS), `None` otherwise.
    async fn append(
        &self,
        path: &str,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> Result<Option<Uid>>;

    /// COPYs a message to another folder and returns the destination
    /// UID when the server reports it.
    async fn copy_message(&self, path: &str, uid: Uid, dest: &str) -> Result<Option<Uid>>;

    /// STOREs flag changes on the given UIDs, selectively.
    async fn store_flags(&self, path: &str, uids: &[Uid], add: Flags, remove: Flags) -> Result<()>;

    /// Marks the given UIDs `\Deleted` and expunges them.
    async fn expunge(&self, path: &str, uids: &[Uid]) -> Result<()>;

    /// SEARCHes the folder, returning matching UIDs.
    async fn search(&self, path: &str, query: &SearchQuery) -> Result<Vec<Uid>>;

    /// Hints the desired per-command timeout, `None` to restore the
    /// default. Advisory, implementations may ignore it.
    async fn set_timeout_hint(&self, timeout: Option<Duration>) -> Result<()>;
}

/// The local mailbox storage, as the engine sees it.
#[async_trait]
pub trait LocalMailStore: Send + Sync {
    /// Lists all folders, parents before children.
    async fn list_folders(&self) -> Result<Vec<Folder>>;

    async fn folder(&self, id: FolderId) -> Result<Option<Folder>>;
    async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>>;

    /// Creates the folder (and missing ancestors) and returns it.
    async fn create_folder(&self, path: &str) -> Result<Folder>;

    /// Deletes the folder and its contents.
    async fn delete_folder(&self, id: FolderId) -> Result<()>;

    /// Enables or disables synchronization for the folder.
    async fn set_sync_enabled(&self, id: FolderId, enabled: bool) -> Result<()>;

    async fn list_message_ids(&self, folder: FolderId) -> Result<Vec<ItemId>>;
    async fn message(&self, id: ItemId) -> Result<Option<LocalMessage>>;
    async fn message_body(&self, id: ItemId) -> Result<Vec<u8>>;

    /// Stores a new message and returns its id.
    async fn add_message(
        &self,
        folder: FolderId,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> Result<ItemId>;

    async fn set_flags(&self, id: ItemId, flags: Flags) -> Result<()>;
    async fn delete_message(&self, id: ItemId) -> Result<()>;

    /// Deletes every message of the folder, keeping the folder.
    async fn empty_folder(&self, folder: FolderId) -> Result<()>;

    /// The current change sequence of the local change log.
    async fn change_seq(&self) -> Result<u64>;

    /// Drains changes recorded after `seq` from the change log.
    async fn changes_since(&self, seq: u64) -> Result<LocalChanges>;

    /// The lock serializing local mutations with user activity.
    /// Change-log reads and the writes derived from them happen under
    /// this lock so the sequence snapshot stays consistent.
    fn mailbox_lock(&self) -> Arc<Mutex<()>>;
}
