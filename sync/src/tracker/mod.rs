//! # Tracker module
//!
//! Module dedicated to the persisted synchronization state: folder
//! associations ([`FolderTracker`]), message associations
//! ([`MessageTracker`]) and per-folder resume points
//! ([`SyncCheckpoint`]). Persistence itself lives behind the
//! [`TrackerStore`] trait; the engine works on the in-memory
//! [`FolderTrackers`] and [`MessageTrackers`] collections loaded from
//! it.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    backend::{self, FolderId, ItemId, Uid, UID_UNASSIGNED},
    flag::Flags,
};

/// The persisted association between a local folder and a remote
/// folder.
///
/// A tracker with `uid_validity == 0` marks an unselectable remote
/// folder: the association is remembered but message reconciliation
/// is skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FolderTracker {
    pub folder_id: FolderId,
    pub local_path: String,
    pub remote_path: String,
    pub uid_validity: u64,
}

impl FolderTracker {
    pub fn is_selectable(&self) -> bool {
        self.uid_validity != 0
    }
}

/// The persisted association between a local message and a remote
/// UID, with the flag state as of the last reconciliation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageTracker {
    pub item_id: ItemId,
    pub folder_id: FolderId,
    pub uid: Uid,
    pub flags: Flags,
}

impl MessageTracker {
    /// Whether the tracker awaits its UID from a past append that
    /// could not be resolved.
    pub fn is_unresolved(&self) -> bool {
        self.uid == UID_UNASSIGNED
    }
}

/// The per-folder resume point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncCheckpoint {
    /// Highest UID reconciled so far.
    pub last_uid: Uid,

    /// UIDNEXT observed at the end of the last pass.
    pub uid_next: Uid,

    /// Local change sequence consumed up to (inclusive).
    pub last_change_seq: u64,
}

impl SyncCheckpoint {
    /// Raises the high-water mark, never lowers it.
    pub fn update_last_uid(&mut self, uid: Uid) {
        if uid > self.last_uid {
            self.last_uid = uid;
        }
    }
}

/// Persistence of trackers and checkpoints.
///
/// Implementations must make tracker writes durable before the
/// corresponding checkpoint write, so a crash re-reconciles instead
/// of losing associations.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn folder_trackers(&self) -> backend::Result<Vec<FolderTracker>>;
    async fn upsert_folder_tracker(&self, tracker: &FolderTracker) -> backend::Result<()>;
    async fn delete_folder_tracker(&self, folder: FolderId) -> backend::Result<()>;

    async fn message_trackers(&self, folder: FolderId) -> backend::Result<Vec<MessageTracker>>;
    async fn upsert_message_tracker(&self, tracker: &MessageTracker) -> backend::Result<()>;
    async fn delete_message_tracker(&self, folder: FolderId, item: ItemId)
        -> backend::Result<()>;

    /// Deletes every message tracker of the folder.
    async fn delete_message_trackers(&self, folder: FolderId) -> backend::Result<()>;

    async fn checkpoint(&self, folder: FolderId) -> backend::Result<Option<SyncCheckpoint>>;
    async fn save_checkpoint(
        &self,
        folder: FolderId,
        checkpoint: &SyncCheckpoint,
    ) -> backend::Result<()>;
    async fn clear_checkpoint(&self, folder: FolderId) -> backend::Result<()>;
}

/// The folder trackers of one account, indexed for the folder pass.
#[derive(Debug, Default)]
pub struct FolderTrackers {
    by_id: HashMap<FolderId, FolderTracker>,
}

impl FolderTrackers {
    pub fn new(trackers: Vec<FolderTracker>) -> Self {
        Self {
            by_id: trackers.into_iter().map(|t| (t.folder_id, t)).collect(),
        }
    }

    pub fn get_by_id(&self, id: FolderId) -> Option<&FolderTracker> {
        self.by_id.get(&id)
    }

    pub fn get_by_remote_path(&self, path: &str) -> Option<&FolderTracker> {
        self.by_id.values().find(|t| t.remote_path == path)
    }

    pub fn get_by_local_path(&self, path: &str) -> Option<&FolderTracker> {
        self.by_id.values().find(|t| t.local_path == path)
    }

    pub fn insert(&mut self, tracker: FolderTracker) {
        self.by_id.insert(tracker.folder_id, tracker);
    }

    pub fn remove(&mut self, id: FolderId) -> Option<FolderTracker> {
        self.by_id.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FolderTracker> {
        self.by_id.values()
    }
}

/// The message trackers of one folder, indexed by UID and by local
/// item id.
#[derive(Debug, Default)]
pub struct MessageTrackers {
    by_item: HashMap<ItemId, MessageTracker>,
    by_uid: HashMap<Uid, ItemId>,
}

impl MessageTrackers {
    pub fn new(trackers: Vec<MessageTracker>) -> Self {
        let mut collection = Self::default();
        for tracker in trackers {
            collection.insert(tracker);
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_item.is_empty()
    }

    pub fn get_by_item(&self, item: ItemId) -> Option<&MessageTracker> {
        self.by_item.get(&item)
    }

    pub fn get_by_uid(&self, uid: Uid) -> Option<&MessageTracker> {
        self.by_uid.get(&uid).and_then(|item| self.by_item.get(item))
    }

    pub fn contains_uid(&self, uid: Uid) -> bool {
        self.by_uid.contains_key(&uid)
    }

    /// Item ids of trackers still waiting for their UID.
    pub fn unresolved_items(&self) -> Vec<ItemId> {
        self.by_item
            .values()
            .filter(|t| t.is_unresolved())
            .map(|t| t.item_id)
            .collect()
    }

    /// Highest tracked UID, `0` when nothing is tracked.
    pub fn last_uid(&self) -> Uid {
        self.by_uid.keys().copied().max().unwrap_or(UID_UNASSIGNED)
    }

    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.by_item.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageTracker> {
        self.by_item.values()
    }

    pub fn insert(&mut self, tracker: MessageTracker) {
        if let Some(old) = self.by_item.insert(tracker.item_id, tracker) {
            self.by_uid.remove(&old.uid);
        }
        if !tracker.is_unresolved() {
            self.by_uid.insert(tracker.uid, tracker.item_id);
        }
    }

    pub fn remove_by_item(&mut self, item: ItemId) -> Option<MessageTracker> {
        let tracker = self.by_item.remove(&item)?;
        self.by_uid.remove(&tracker.uid);
        Some(tracker)
    }

    pub fn remove_by_uid(&mut self, uid: Uid) -> Option<MessageTracker> {
        let item = self.by_uid.remove(&uid)?;
        self.by_item.remove(&item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(item: ItemId, uid: Uid) -> MessageTracker {
        MessageTracker {
            item_id: item,
            folder_id: 1,
            uid,
            flags: Flags::empty(),
        }
    }

    #[test]
    fn unresolved_trackers_stay_out_of_the_uid_index() {
        let mut trackers = MessageTrackers::default();
        trackers.insert(tracker(10, UID_UNASSIGNED));
        trackers.insert(tracker(11, 42));

        assert!(trackers.get_by_uid(UID_UNASSIGNED).is_none());
        assert_eq!(trackers.get_by_uid(42).map(|t| t.item_id), Some(11));
        assert_eq!(trackers.unresolved_items(), [10]);
        assert_eq!(trackers.last_uid(), 42);
    }

    #[test]
    fn resolving_a_tracker_reindexes_it() {
        let mut trackers = MessageTrackers::default();
        trackers.insert(tracker(10, UID_UNASSIGNED));
        trackers.insert(tracker(10, 7));

        assert_eq!(trackers.len(), 1);
        assert_eq!(trackers.get_by_uid(7).map(|t| t.item_id), Some(10));
        assert!(trackers.unresolved_items().is_empty());
    }

    #[test]
    fn checkpoint_high_water_mark_never_goes_down() {
        let mut cp = SyncCheckpoint::default();
        cp.update_last_uid(9);
        cp.update_last_uid(4);
        assert_eq!(cp.last_uid, 9);
    }
}
