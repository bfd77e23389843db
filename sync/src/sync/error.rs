//! # Synchronization errors
//!
//! Module dedicated to the errors of the synchronization engine
//! proper, and to the [`ErrorCounters`] registry that backs the
//! per-item and per-session error budgets.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use thiserror::Error;

use crate::backend::{ItemId, Uid};

/// Error dedicated to the synchronization engine.
#[derive(Debug, Error)]
pub enum Error {
    /// UIDNEXT went backwards relative to the tracked high-water
    /// mark without a UIDVALIDITY change.
    #[error("cannot trust folder {folder}: uid next {uid_next} below tracked uid {last_uid}")]
    InconsistentUidNextError {
        folder: String,
        uid_next: Uid,
        last_uid: Uid,
    },

    /// The remote folder state is corrupted beyond repair for this
    /// session (vendor guarantees UIDNEXT monotonicity).
    #[error("cannot sync corrupted remote folder {0}")]
    CorruptedMailboxError(String),

    /// The session error budget is exhausted.
    #[error("cannot continue syncing account {0}: too many errors")]
    TooManyErrorsError(String),

    /// The session got cancelled by its handler.
    #[error("cannot continue syncing: cancelled")]
    CancelledError,
}

/// What an error budget entry is keyed on.
///
/// Local items are keyed by their id; remote messages not (yet)
/// associated with a local item are keyed by UIDVALIDITY and UID so a
/// mailbox reset restarts their budget.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKey {
    Item(ItemId),
    Remote { uid_validity: u64, uid: Uid },
}

/// Consecutive-failure counters, scoped by account.
///
/// One registry is shared across the sessions of a supervisor, so an
/// item keeps its failure history between runs of the same process.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: Mutex<HashMap<(String, ErrorKey), u32>>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more failure and returns the new count.
    pub fn increment(&self, account: &str, key: ErrorKey) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry((account.to_owned(), key)).or_insert(0);
        *count += 1;
        *count
    }

    /// Forgets the failure history of an item after it succeeded.
    pub fn clear(&self, account: &str, key: &ErrorKey) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.remove(&(account.to_owned(), key.clone()));
    }

    pub fn count(&self, account: &str, key: &ErrorKey) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts
            .get(&(account.to_owned(), key.clone()))
            .copied()
            .unwrap_or_default()
    }
}
