//! # Synchronization reports
//!
//! Module dedicated to the final synchronization report. The main
//! structure of this module is [`SyncReport`], returned by a
//! [`super::SyncSession`] run, aggregating folder-level counters,
//! per-pass message statistics and the non-fatal errors collected
//! along the way.

use std::fmt;

use crate::backend::ItemId;

/// Per-folder message counters of one pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FolderStats {
    pub flags_updated_locally: u32,
    pub flags_updated_remotely: u32,
    pub messages_added_locally: u32,
    pub messages_added_remotely: u32,
    pub messages_deleted_locally: u32,
    pub messages_deleted_remotely: u32,
    pub messages_copied_remotely: u32,
}

impl FolderStats {
    pub fn merge(&mut self, other: &FolderStats) {
        self.flags_updated_locally += other.flags_updated_locally;
        self.flags_updated_remotely += other.flags_updated_remotely;
        self.messages_added_locally += other.messages_added_locally;
        self.messages_added_remotely += other.messages_added_remotely;
        self.messages_deleted_locally += other.messages_deleted_locally;
        self.messages_deleted_remotely += other.messages_deleted_remotely;
        self.messages_copied_remotely += other.messages_copied_remotely;
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for FolderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flags updated: {} local / {} remote, added: {} local / {} remote, \
             deleted: {} local / {} remote, copied remotely: {}",
            self.flags_updated_locally,
            self.flags_updated_remotely,
            self.messages_added_locally,
            self.messages_added_remotely,
            self.messages_deleted_locally,
            self.messages_deleted_remotely,
            self.messages_copied_remotely,
        )
    }
}

/// One non-fatal error recorded during the session.
#[derive(Debug)]
pub struct ErrorReport {
    /// The local item involved, when the error is item-scoped.
    pub item: Option<ItemId>,

    /// Human-readable context of the failure.
    pub message: String,

    /// The underlying error.
    pub cause: crate::Error,
}

/// The report of one account synchronization.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub folders_created_locally: u32,
    pub folders_created_remotely: u32,
    pub folders_renamed_remotely: u32,
    pub folders_deleted_locally: u32,
    pub folders_deleted_remotely: u32,
    pub folders_synced: u32,
    pub folders_skipped: u32,
    pub messages: FolderStats,
    pub errors: Vec<ErrorReport>,
}

impl SyncReport {
    /// Whether the session changed nothing on either side.
    pub fn is_noop(&self) -> bool {
        self.folders_created_locally == 0
            && self.folders_created_remotely == 0
            && self.folders_renamed_remotely == 0
            && self.folders_deleted_locally == 0
            && self.folders_deleted_remotely == 0
            && self.messages.is_noop()
    }
}
