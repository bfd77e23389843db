//! # Local change detection
//!
//! Module dedicated to the incremental side of message
//! reconciliation: [`ChangeDetector`] drains the local change log and
//! classifies each entry against the folder's message trackers, so
//! the reconciler knows what to push without listing the whole
//! folder.

use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
    backend::{self, FolderId, ItemId, LocalChanges, LocalMailStore},
    message::LocalMessage,
    tracker::MessageTrackers,
};

/// The classified local changes of one folder.
#[derive(Debug, Default)]
pub struct DetectedChanges {
    /// Untracked messages now living in the folder, to append
    /// remotely.
    pub new_items: Vec<ItemId>,

    /// Tracked messages still in the folder whose flags may have
    /// changed.
    pub flag_changes: Vec<LocalMessage>,

    /// Tracked messages moved to another local folder, with their
    /// destination.
    pub moved_out: Vec<(ItemId, FolderId)>,

    /// Tracked messages deleted locally, to delete remotely.
    pub deleted_items: Vec<ItemId>,

    /// The change sequence consumed up to (inclusive).
    pub seq: u64,
}

impl DetectedChanges {
    pub fn is_empty(&self) -> bool {
        self.new_items.is_empty()
            && self.flag_changes.is_empty()
            && self.moved_out.is_empty()
            && self.deleted_items.is_empty()
    }
}

/// Classifies drained change-log entries for one folder.
pub struct ChangeDetector {
    store: Arc<dyn LocalMailStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn LocalMailStore>) -> Self {
        Self { store }
    }

    /// Drains changes recorded after `since` and classifies the ones
    /// concerning `folder`. Returns `None` when the log holds nothing
    /// new.
    ///
    /// Callers must hold the local mailbox lock across this call and
    /// the pushes derived from it, so the returned sequence stays a
    /// consistent snapshot.
    pub async fn detect(
        &self,
        folder: FolderId,
        trackers: &MessageTrackers,
        since: u64,
    ) -> backend::Result<Option<DetectedChanges>> {
        let changes = self.store.changes_since(since).await?;
        if changes.is_empty() && changes.seq <= since {
            return Ok(None);
        }

        let mut messages = HashMap::new();
        for &id in changes
            .added_messages
            .iter()
            .chain(changes.updated_messages.iter())
        {
            if let Some(msg) = self.store.message(id).await? {
                messages.insert(id, msg);
            }
        }

        let detected = classify(&changes, folder, trackers, &messages);
        debug!(
            "detected local changes for folder {folder}: {} new, {} flagged, {} moved, {} deleted",
            detected.new_items.len(),
            detected.flag_changes.len(),
            detected.moved_out.len(),
            detected.deleted_items.len(),
        );
        Ok(Some(detected))
    }
}

/// The pure classification core of [`ChangeDetector::detect`].
///
/// For each added or updated item, four cases apply: tracked and
/// still in the folder means a flag change; tracked but found in
/// another folder means a move out; untracked and in the folder means
/// a new message; untracked elsewhere is none of this folder's
/// business. An item missing from `messages` was deleted between the
/// log write and now and is handled like a logged deletion.
fn classify(
    changes: &LocalChanges,
    folder: FolderId,
    trackers: &MessageTrackers,
    messages: &HashMap<ItemId, LocalMessage>,
) -> DetectedChanges {
    let mut detected = DetectedChanges {
        seq: changes.seq,
        ..Default::default()
    };

    for &id in changes
        .added_messages
        .iter()
        .chain(changes.updated_messages.iter())
    {
        let tracked = trackers.get_by_item(id).is_some();
        match messages.get(&id) {
            Some(msg) if msg.folder_id == folder => {
                if tracked {
                    detected.flag_changes.push(msg.clone());
                } else {
                    detected.new_items.push(id);
                }
            }
            Some(msg) => {
                if tracked {
                    detected.moved_out.push((id, msg.folder_id));
                }
            }
            None => {
                if tracked {
                    detected.deleted_items.push(id);
                }
            }
        }
    }

    for &id in &changes.deleted_messages {
        if trackers.get_by_item(id).is_some() {
            detected.deleted_items.push(id);
        }
    }

    detected
}
