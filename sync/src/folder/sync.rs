//! # Folder synchronization
//!
//! Module dedicated to the folder half of a synchronization pass: the
//! [`FolderReconciler`] walks the remote listing and the local folder
//! tree, maintains [`FolderTracker`] associations, and emits one
//! [`FolderPair`] per associated selectable folder for the message
//! reconciler to work on.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::{
    backend::{FolderId, MailboxStatus},
    config::PathMapping,
    folder::{Folder, FolderKind, ListingEntry},
    sync::{SessionContext, SyncEvent},
    tracker::{FolderTracker, FolderTrackers},
};

/// One associated folder, ready for message reconciliation.
#[derive(Clone, Debug)]
pub struct FolderPair {
    pub tracker: FolderTracker,
    pub local: Folder,

    /// Ignore any persisted checkpoint for this pass.
    pub force_full: bool,
}

/// Reconciles the remote folder listing with the local folder tree.
pub struct FolderReconciler<'a> {
    ctx: &'a SessionContext,
    matched: HashSet<FolderId>,
}

impl<'a> FolderReconciler<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        Self {
            ctx,
            matched: HashSet::new(),
        }
    }

    /// Whether the given local folder got matched by the remote pass.
    pub fn is_matched(&self, folder: FolderId) -> bool {
        self.matched.contains(&folder)
    }

    /// Reconciles one remote listing entry.
    ///
    /// `status` is the folder STATUS, absent for unselectable
    /// entries. Returns the folder pair when the folder takes part in
    /// message reconciliation.
    pub async fn sync_remote_folder(
        &mut self,
        entry: &ListingEntry,
        status: Option<&MailboxStatus>,
        trackers: &mut FolderTrackers,
    ) -> crate::Result<Option<FolderPair>> {
        match trackers.get_by_remote_path(&entry.path).cloned() {
            Some(tracker) => {
                self.sync_tracked_remote_folder(entry, tracker, trackers)
                    .await
            }
            None => self.sync_new_remote_folder(entry, status, trackers).await,
        }
    }

    async fn sync_tracked_remote_folder(
        &mut self,
        entry: &ListingEntry,
        mut tracker: FolderTracker,
        trackers: &mut FolderTrackers,
    ) -> crate::Result<Option<FolderPair>> {
        let ctx = self.ctx;

        let Some(local) = ctx.local.folder(tracker.folder_id).await? else {
            // The local folder is gone, so is the association.
            if ctx.config.policy.pushes_changes() {
                info!(
                    "local folder {} deleted, deleting remote folder {}",
                    tracker.local_path, entry.path
                );
                if let Err(err) = ctx.remote.delete_folder(&entry.path).await {
                    if err.can_continue() {
                        // Tracker retained, retried on the next pass.
                        warn!("cannot delete remote folder {}: {err}", entry.path);
                        ctx.push_error(
                            None,
                            format!("cannot delete remote folder {}", entry.path),
                            err.into(),
                        );
                        return Ok(None);
                    }
                    return Err(err.into());
                }
                ctx.emit(SyncEvent::DeletedRemoteFolder(entry.path.clone()))
                    .await;
                ctx.with_report(|r| r.folders_deleted_remotely += 1);
            }
            self.forget_folder(trackers, tracker.folder_id).await?;
            return Ok(None);
        };

        if local.path != tracker.local_path {
            // The user renamed or moved the local folder.
            match ctx.config.map_local_path(&local.path, entry.delimiter) {
                PathMapping::Path(new_remote) if ctx.config.policy.pushes_changes() => {
                    info!("renaming remote folder {} to {new_remote}", entry.path);
                    ctx.remote.rename_folder(&entry.path, &new_remote).await?;
                    ctx.emit(SyncEvent::RenamedRemoteFolder {
                        from: entry.path.clone(),
                        to: new_remote.clone(),
                    })
                    .await;
                    tracker.remote_path = new_remote;
                    tracker.local_path = local.path.clone();
                    ctx.trackers.upsert_folder_tracker(&tracker).await?;
                    // RENAME invalidates any resume point.
                    ctx.trackers.clear_checkpoint(tracker.folder_id).await?;
                    ctx.with_report(|r| r.folders_renamed_remotely += 1);
                    trackers.insert(tracker.clone());
                    self.matched.insert(tracker.folder_id);
                    if !tracker.is_selectable() {
                        return Ok(None);
                    }
                    return Ok(Some(FolderPair {
                        tracker,
                        local,
                        force_full: true,
                    }));
                }
                PathMapping::Path(_) => {
                    // Import only: keep the association under the new
                    // local path, leave the remote folder alone.
                    tracker.local_path = local.path.clone();
                    ctx.trackers.upsert_folder_tracker(&tracker).await?;
                    trackers.insert(tracker.clone());
                }
                PathMapping::Ignore => {
                    // Moved outside the sync root: the association is
                    // over, the remote folder starts from scratch.
                    debug!(
                        "local folder {} moved out of the sync root, dropping association",
                        local.path
                    );
                    self.forget_folder(trackers, tracker.folder_id).await?;
                    return self.sync_new_remote_folder(entry, None, trackers).await;
                }
            }
        }

        self.matched.insert(tracker.folder_id);
        if !entry.selectable || !tracker.is_selectable() {
            return Ok(None);
        }
        Ok(Some(FolderPair {
            tracker,
            local,
            force_full: false,
        }))
    }

    async fn sync_new_remote_folder(
        &mut self,
        entry: &ListingEntry,
        status: Option<&MailboxStatus>,
        trackers: &mut FolderTrackers,
    ) -> crate::Result<Option<FolderPair>> {
        let ctx = self.ctx;

        let path = match ctx.config.map_remote_path(&entry.path, entry.delimiter) {
            PathMapping::Path(path) => path,
            PathMapping::Ignore => {
                debug!("ignoring remote folder {}", entry.path);
                return Ok(None);
            }
        };

        let local = self.local_folder_for(&path, entry, trackers).await?;
        let uid_validity = if entry.selectable {
            status.map(|s| s.uid_validity).unwrap_or(1)
        } else {
            0
        };
        let tracker = FolderTracker {
            folder_id: local.id,
            local_path: local.path.clone(),
            remote_path: entry.path.clone(),
            uid_validity,
        };
        ctx.trackers.upsert_folder_tracker(&tracker).await?;
        trackers.insert(tracker.clone());
        self.matched.insert(local.id);

        if !entry.selectable {
            return Ok(None);
        }
        Ok(Some(FolderPair {
            tracker,
            local,
            force_full: true,
        }))
    }

    /// Finds or creates the local folder for a new remote folder,
    /// disambiguating with a numeric suffix when the path is already
    /// taken by an unrelated folder.
    async fn local_folder_for(
        &self,
        path: &str,
        entry: &ListingEntry,
        trackers: &FolderTrackers,
    ) -> crate::Result<Folder> {
        let ctx = self.ctx;

        if let Some(existing) = ctx.local.folder_by_path(path).await? {
            let taken = trackers.get_by_id(existing.id).is_some();
            let kind_conflict = existing.system && !kind_matches(&existing, entry);
            if !taken && !kind_conflict {
                return Ok(existing);
            }
            let mut n = 2;
            loop {
                let candidate = format!("{path} {n}");
                if ctx.local.folder_by_path(&candidate).await?.is_none() {
                    warn!("local folder {path} already in use, using {candidate}");
                    return self.create_local_folder(&candidate).await;
                }
                n += 1;
            }
        }
        self.create_local_folder(path).await
    }

    async fn create_local_folder(&self, path: &str) -> crate::Result<Folder> {
        let ctx = self.ctx;
        info!("creating local folder {path}");
        let folder = ctx.local.create_folder(path).await?;
        ctx.emit(SyncEvent::CreatedLocalFolder(path.to_owned())).await;
        ctx.with_report(|r| r.folders_created_locally += 1);
        Ok(folder)
    }

    /// Reconciles one local folder the remote pass did not match.
    pub async fn sync_local_folder(
        &mut self,
        folder: &Folder,
        delimiter: char,
        trackers: &mut FolderTrackers,
    ) -> crate::Result<Option<FolderPair>> {
        let ctx = self.ctx;

        if self.matched.contains(&folder.id) {
            return Ok(None);
        }

        if let Some(tracker) = trackers.get_by_id(folder.id).cloned() {
            // Tracked but absent from the remote listing. Double
            // check before destroying local data, listings have been
            // observed to flicker.
            if ctx.remote.folder_exists(&tracker.remote_path).await? {
                debug!(
                    "remote folder {} missing from listing but still exists, keeping {}",
                    tracker.remote_path, folder.path
                );
                return Ok(None);
            }
            info!(
                "remote folder {} deleted, deleting local folder {}",
                tracker.remote_path, folder.path
            );
            ctx.local.delete_folder(folder.id).await?;
            ctx.emit(SyncEvent::DeletedLocalFolder(folder.path.clone()))
                .await;
            self.forget_folder(trackers, folder.id).await?;
            ctx.with_report(|r| r.folders_deleted_locally += 1);
            return Ok(None);
        }

        // A local folder the remote account has never seen.
        if !ctx.config.policy.pushes_changes() {
            return Ok(None);
        }
        let remote_path = match ctx.config.map_local_path(&folder.path, delimiter) {
            PathMapping::Path(path) => path,
            PathMapping::Ignore => return Ok(None),
        };

        if !ctx.remote.folder_exists(&remote_path).await? {
            info!("creating remote folder {remote_path}");
            ctx.remote.create_folder(&remote_path).await?;
            ctx.emit(SyncEvent::CreatedRemoteFolder(remote_path.clone()))
                .await;
            ctx.with_report(|r| r.folders_created_remotely += 1);
        }
        let status = ctx.remote.status(&remote_path).await?;
        let tracker = FolderTracker {
            folder_id: folder.id,
            local_path: folder.path.clone(),
            remote_path,
            uid_validity: status.uid_validity,
        };
        ctx.trackers.upsert_folder_tracker(&tracker).await?;
        trackers.insert(tracker.clone());
        self.matched.insert(folder.id);

        Ok(Some(FolderPair {
            tracker,
            local: folder.clone(),
            force_full: true,
        }))
    }

    /// Drops every trace of a folder association.
    async fn forget_folder(
        &self,
        trackers: &mut FolderTrackers,
        folder: FolderId,
    ) -> crate::Result<()> {
        let ctx = self.ctx;
        trackers.remove(folder);
        ctx.trackers.delete_message_trackers(folder).await?;
        ctx.trackers.clear_checkpoint(folder).await?;
        ctx.trackers.delete_folder_tracker(folder).await?;
        Ok(())
    }
}

fn kind_matches(folder: &Folder, entry: &ListingEntry) -> bool {
    let leaf = entry
        .path
        .rsplit(entry.delimiter)
        .next()
        .unwrap_or(&entry.path);
    match folder.kind {
        Some(kind) => kind.matches(leaf),
        None => leaf.parse::<FolderKind>().is_err(),
    }
}
