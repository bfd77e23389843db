//! # Message synchronization
//!
//! Module dedicated to the message half of a synchronization pass.
//! One [`MessageReconciler`] converges a single associated folder
//! pair: it verifies UIDVALIDITY, merges flags, pulls new remote
//! messages, pushes local changes, and schedules remote deletions.
//! Appends to the remote side are deferred to [`Self::finish`], which
//! the session calls once every folder has been reconciled, so
//! cross-folder moves find their destination already associated.
//!
//! Failures on individual messages are charged against the per-item
//! and per-folder error budgets instead of aborting the pass; only
//! connection and consistency errors bubble up.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info, trace, warn};

use crate::{
    backend::{
        self, local::LocalFolder, remote::RemoteFolder, FolderId, ItemId, MailboxStatus, Uid,
        UID_UNASSIGNED,
    },
    flag::Flags,
    folder::sync::FolderPair,
    message::{append::{find_match, Appender}, MessageContent},
    sync::{
        change::ChangeDetector,
        error::{Error, ErrorKey},
        report::FolderStats,
        SessionContext,
    },
    tracker::{MessageTracker, MessageTrackers, SyncCheckpoint},
};

/// Reconciles the messages of one associated folder pair.
pub struct MessageReconciler {
    ctx: Arc<SessionContext>,
    tracker: crate::tracker::FolderTracker,
    force_full: bool,
    remote: RemoteFolder,
    local: LocalFolder,
    status: MailboxStatus,
    tracked: MessageTrackers,
    local_ids: HashSet<ItemId>,
    added_uids: Vec<Uid>,
    to_delete: Vec<Uid>,
    checkpoint: SyncCheckpoint,
    had_checkpoint: bool,
    stats: FolderStats,
    total_errors: u32,
    synced: bool,
}

impl MessageReconciler {
    pub async fn new(ctx: Arc<SessionContext>, pair: FolderPair) -> crate::Result<Self> {
        let remote = RemoteFolder::new(ctx.remote.clone(), pair.tracker.remote_path.clone());
        let local = LocalFolder::new(ctx.local.clone(), pair.local.clone());
        let tracked =
            MessageTrackers::new(ctx.trackers.message_trackers(pair.tracker.folder_id).await?);
        let checkpoint = if pair.force_full {
            None
        } else {
            ctx.trackers.checkpoint(pair.tracker.folder_id).await?
        };

        Ok(Self {
            ctx,
            force_full: pair.force_full,
            remote,
            local,
            status: MailboxStatus::default(),
            tracked,
            local_ids: HashSet::new(),
            added_uids: Vec::new(),
            to_delete: Vec::new(),
            had_checkpoint: checkpoint.is_some(),
            checkpoint: checkpoint.unwrap_or_default(),
            tracker: pair.tracker,
            stats: FolderStats::default(),
            total_errors: 0,
            synced: false,
        })
    }

    pub fn folder_id(&self) -> FolderId {
        self.tracker.folder_id
    }

    /// Runs the pass. Returns `false` when the folder had to be
    /// skipped (read-only remote folder).
    pub async fn run(&mut self) -> crate::Result<bool> {
        let mut status = self.remote.select().await?;
        if status.read_only {
            warn!(
                "remote folder {} is read-only, skipping",
                self.remote.path()
            );
            return Ok(false);
        }
        if status.uid_validity == 0 {
            // Servers omitting UIDVALIDITY on SELECT get a fixed one.
            status.uid_validity = 1;
        }
        self.status = status;
        self.check_uid_validity().await?;

        let mut full = self.force_full || !self.had_checkpoint;

        let last_uid = self.tracked.last_uid().max(self.checkpoint.last_uid);
        if self.status.uid_next != 0 && self.status.uid_next <= last_uid {
            let err = Error::InconsistentUidNextError {
                folder: self.remote.path().to_owned(),
                uid_next: self.status.uid_next,
                last_uid,
            };
            if self.ctx.caps.has_reliable_uid_next() {
                return Err(Error::CorruptedMailboxError(self.remote.path().to_owned()).into());
            }
            warn!("{err}, falling back to a full pass");
            self.ctx.push_error(None, err.to_string(), err.into());
            self.ctx
                .trackers
                .clear_checkpoint(self.tracker.folder_id)
                .await?;
            self.checkpoint = SyncCheckpoint::default();
            full = true;
        }

        if full {
            self.full_pass().await?;
        } else {
            self.incremental_pass().await?;
        }
        self.fetch_new_messages().await?;
        self.delete_remote_messages().await?;

        if let Err(err) = self.remote.close().await {
            if !err.can_continue() {
                return Err(err.into());
            }
            warn!("cannot close remote folder {}: {err}", self.remote.path());
        }

        self.synced = true;
        Ok(true)
    }

    /// Verifies the folder UIDVALIDITY against the tracked one and
    /// resets the association when it changed: every UID mapping is
    /// void, the local folder content gets rebuilt from the remote
    /// one. Local messages never pushed are appended first so the
    /// reset does not lose them.
    async fn check_uid_validity(&mut self) -> crate::Result<()> {
        let uid_validity = self.status.uid_validity;
        if self.tracker.uid_validity == uid_validity {
            return Ok(());
        }
        if self.tracker.uid_validity == 0 {
            // First selectable pass over this folder.
            self.tracker.uid_validity = uid_validity;
            self.ctx.trackers.upsert_folder_tracker(&self.tracker).await?;
            return Ok(());
        }

        info!(
            "uid validity of {} changed ({} -> {uid_validity}), resetting folder",
            self.remote.path(),
            self.tracker.uid_validity,
        );

        let ids = self.local.list_message_ids().await?;
        if self.ctx.config.policy.pushes_changes() {
            // Preserve local-only messages, then rebuild from remote.
            for item in ids {
                if self.tracked.get_by_item(item).is_some() {
                    continue;
                }
                if let Err(err) = self.append_before_reset(item).await {
                    self.message_failed(
                        ErrorKey::Item(item),
                        Some(item),
                        format!("cannot preserve local message {item} across uid validity reset"),
                        err,
                    )
                    .await?;
                }
            }
            self.local.empty().await?;
        } else {
            // Import only: drop the pulled copies, keep local-only
            // messages in place.
            for item in ids {
                if self.tracked.get_by_item(item).is_some() {
                    if let Err(err) = self.local.delete_message(item).await {
                        if !err.is_benign() {
                            return Err(err.into());
                        }
                    }
                }
            }
        }

        self.ctx
            .trackers
            .delete_message_trackers(self.tracker.folder_id)
            .await?;
        self.tracked = MessageTrackers::default();
        self.tracker.uid_validity = uid_validity;
        self.ctx.trackers.upsert_folder_tracker(&self.tracker).await?;
        self.ctx
            .trackers
            .clear_checkpoint(self.tracker.folder_id)
            .await?;
        self.checkpoint = SyncCheckpoint::default();
        self.had_checkpoint = false;
        self.force_full = true;
        Ok(())
    }

    async fn append_before_reset(&self, item: ItemId) -> backend::Result<()> {
        let Some(msg) = self.ctx.local.message(item).await? else {
            return Ok(());
        };
        let body = self.ctx.local.message_body(item).await?;
        // No tracker: the folder is emptied right after, the message
        // comes back through the regular fetch.
        Appender::new(&self.remote, &self.ctx.caps, &self.ctx.config)
            .append(&msg, msg.flags, msg.date, &body)
            .await?;
        Ok(())
    }

    /// Full pass: list every remote flag up to the tracked high-water
    /// mark and reconcile against the full local listing.
    async fn full_pass(&mut self) -> crate::Result<()> {
        debug!("running full pass on {}", self.remote.path());

        // Snapshot the local side under the mailbox lock so the
        // change sequence matches the listing.
        let lock = self.ctx.local.mailbox_lock();
        {
            let _guard = lock.lock().await;
            self.checkpoint.last_change_seq = self.ctx.local.change_seq().await?;
            self.local_ids = self
                .local
                .list_message_ids()
                .await?
                .into_iter()
                .collect();
        }

        self.move_departed_messages().await?;

        let last_uid = self.tracked.last_uid();
        if last_uid > 0 {
            self.sync_flags(1, last_uid).await?;
        }

        // Untracked local messages have never been pushed.
        if self.ctx.config.policy.pushes_changes() {
            for item in self.local_ids.iter().copied().collect::<Vec<_>>() {
                if self.tracked.get_by_item(item).is_none() {
                    self.ctx.queue_append(self.tracker.folder_id, item);
                }
            }
        }
        Ok(())
    }

    /// Moves tracked messages now living in another local folder,
    /// before flags are reconciled, so the remote copy travels with
    /// its history instead of being expunged and re-uploaded.
    async fn move_departed_messages(&mut self) -> crate::Result<()> {
        if !self.ctx.config.policy.pushes_changes() {
            return Ok(());
        }
        let departed: Vec<ItemId> = self
            .tracked
            .item_ids()
            .filter(|item| !self.local_ids.contains(item))
            .collect();
        for item in departed {
            let Some(msg) = self.ctx.local.message(item).await? else {
                // Deleted locally, handled by the flag pass.
                continue;
            };
            if msg.folder_id != self.tracker.folder_id {
                self.move_message(item, msg.folder_id).await?;
            }
        }
        Ok(())
    }

    /// Reconciles flags over the UID range `first..=last`.
    async fn sync_flags(&mut self, first: Uid, last: Uid) -> crate::Result<()> {
        let listing = self.remote.fetch_flags(first, last).await?;
        let mut seen = HashSet::with_capacity(listing.len());

        for msg in listing {
            if msg.flags.contains(Flags::DELETED) {
                // About to be expunged on the server, treat as gone.
                trace!("ignoring remote message {} flagged deleted", msg.uid);
                continue;
            }
            match self.tracked.get_by_uid(msg.uid).copied() {
                Some(tracker) => {
                    seen.insert(msg.uid);
                    if self.local_ids.contains(&tracker.item_id) {
                        self.merge_flags(tracker, msg.flags).await?;
                    } else if self.ctx.config.policy.pushes_changes() {
                        // Deleted locally since the last pass.
                        self.to_delete.push(msg.uid);
                    }
                }
                None => {
                    if self.to_delete.contains(&msg.uid) {
                        // Scheduled for expunge (moved away above).
                        continue;
                    }
                    // Old remote message never synced.
                    self.added_uids.push(msg.uid);
                }
            }
        }

        // Tracked messages the listing did not return are gone from
        // the remote folder.
        let gone: Vec<MessageTracker> = self
            .tracked
            .iter()
            .filter(|t| !t.is_unresolved() && t.uid <= last && !seen.contains(&t.uid))
            .copied()
            .collect();
        for tracker in gone {
            debug!(
                "remote message {} is gone, deleting local message {}",
                tracker.uid, tracker.item_id
            );
            if let Err(err) = self.local.delete_message(tracker.item_id).await {
                if !err.is_benign() {
                    self.message_failed(
                        ErrorKey::Item(tracker.item_id),
                        Some(tracker.item_id),
                        format!("cannot delete local message {}", tracker.item_id),
                        err,
                    )
                    .await?;
                    continue;
                }
            }
            self.local_ids.remove(&tracker.item_id);
            self.remove_tracker(tracker.item_id).await?;
            self.stats.messages_deleted_locally += 1;
        }
        Ok(())
    }

    /// Three-way merge of one tracked message's flags.
    async fn merge_flags(
        &mut self,
        tracker: MessageTracker,
        remote_flags: Flags,
    ) -> crate::Result<()> {
        let Some(local_msg) = self.local.message(tracker.item_id).await? else {
            if self.ctx.config.policy.pushes_changes() {
                self.to_delete.push(tracker.uid);
            }
            return Ok(());
        };

        let merged = Flags::merge(local_msg.flags, tracker.flags, remote_flags);
        if merged == local_msg.flags && merged == remote_flags && merged == tracker.flags {
            return Ok(());
        }
        trace!(
            "merging flags of message {} (local {}, tracked {}, remote {}) -> {merged}",
            tracker.item_id,
            local_msg.flags,
            tracker.flags,
            remote_flags,
        );

        if merged.imap_only() != remote_flags.imap_only()
            && self.ctx.config.policy.pushes_changes()
        {
            let (add, remove) = Flags::remote_diff(remote_flags, merged);
            if let Err(err) = self.remote.store_flags(&[tracker.uid], add, remove).await {
                self.message_failed(
                    self.uid_key(tracker.uid),
                    Some(tracker.item_id),
                    format!("cannot update remote flags of message {}", tracker.item_id),
                    err,
                )
                .await?;
                return Ok(());
            }
            self.stats.flags_updated_remotely += 1;
        }
        if merged != local_msg.flags {
            self.local.set_flags(tracker.item_id, merged).await?;
            self.stats.flags_updated_locally += 1;
        }
        if merged != tracker.flags {
            let updated = MessageTracker {
                flags: merged,
                ..tracker
            };
            self.ctx.trackers.upsert_message_tracker(&updated).await?;
            self.tracked.insert(updated);
        }
        Ok(())
    }

    /// Incremental pass: drain the local change log and push.
    async fn incremental_pass(&mut self) -> crate::Result<()> {
        debug!("running incremental pass on {}", self.remote.path());

        let lock = self.ctx.local.mailbox_lock();
        let _guard = lock.lock().await;

        let detector = ChangeDetector::new(self.ctx.local.clone());
        let Some(changes) = detector
            .detect(
                self.tracker.folder_id,
                &self.tracked,
                self.checkpoint.last_change_seq,
            )
            .await?
        else {
            return Ok(());
        };

        if self.ctx.config.policy.pushes_changes() {
            for item in changes.new_items {
                self.ctx.queue_append(self.tracker.folder_id, item);
            }
        }
        for msg in changes.flag_changes {
            self.push_flags(msg).await?;
        }
        for (item, dest) in changes.moved_out {
            self.move_message(item, dest).await?;
        }
        for item in changes.deleted_items {
            let Some(tracker) = self.tracked.get_by_item(item).copied() else {
                continue;
            };
            if self.ctx.config.policy.pushes_changes() && !tracker.is_unresolved() {
                self.to_delete.push(tracker.uid);
            } else {
                self.remove_tracker(item).await?;
            }
        }

        self.checkpoint.last_change_seq = changes.seq;
        Ok(())
    }

    /// Pushes a local flag change, using the tracked flags as the
    /// remote state proxy (no remote fetch on the incremental path).
    async fn push_flags(&mut self, msg: crate::message::LocalMessage) -> crate::Result<()> {
        let Some(tracker) = self.tracked.get_by_item(msg.id).copied() else {
            return Ok(());
        };
        if msg.flags == tracker.flags {
            return Ok(());
        }

        if self.ctx.config.policy.pushes_changes() && !tracker.is_unresolved() {
            let (add, remove) = Flags::remote_diff(tracker.flags, msg.flags);
            if !add.is_empty() || !remove.is_empty() {
                if let Err(err) = self.remote.store_flags(&[tracker.uid], add, remove).await {
                    self.message_failed(
                        self.uid_key(tracker.uid),
                        Some(msg.id),
                        format!("cannot push flags of message {}", msg.id),
                        err,
                    )
                    .await?;
                    return Ok(());
                }
                self.stats.flags_updated_remotely += 1;
            }
        }

        let updated = MessageTracker {
            flags: msg.flags,
            ..tracker
        };
        self.ctx.trackers.upsert_message_tracker(&updated).await?;
        self.tracked.insert(updated);
        Ok(())
    }

    /// Handles a message moved to another local folder. When the
    /// destination is associated and the server reports COPY UIDs,
    /// the move happens as one remote COPY plus a source expunge and
    /// the association follows the message; otherwise the source copy
    /// is deleted and the destination folder appends on its own pass.
    async fn move_message(&mut self, item: ItemId, dest: FolderId) -> crate::Result<()> {
        let Some(tracker) = self.tracked.get_by_item(item).copied() else {
            return Ok(());
        };

        if self.ctx.config.policy.pushes_changes() && !tracker.is_unresolved() {
            let dest_path = self.ctx.association(dest);
            if let Some(dest_path) = dest_path.filter(|_| self.ctx.caps.has_copy_uid()) {
                match self.remote.copy_message(tracker.uid, &dest_path).await {
                    Ok(Some(new_uid)) => {
                        debug!(
                            "moved message {item} to {dest_path} as uid {new_uid} via remote copy"
                        );
                        self.remove_tracker(item).await?;
                        let moved = MessageTracker {
                            item_id: item,
                            folder_id: dest,
                            uid: new_uid,
                            flags: tracker.flags,
                        };
                        self.ctx.trackers.upsert_message_tracker(&moved).await?;
                        // The destination must neither re-append nor
                        // re-fetch the copied message.
                        self.ctx.remove_append(dest, item);
                        self.ctx.bump_uid(dest, new_uid);
                        self.to_delete.push(tracker.uid);
                        self.stats.messages_copied_remotely += 1;
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.message_failed(
                            self.uid_key(tracker.uid),
                            Some(item),
                            format!("cannot copy message {item} to {dest_path}"),
                            err,
                        )
                        .await?;
                        return Ok(());
                    }
                }
            }
            self.to_delete.push(tracker.uid);
        }
        self.remove_tracker(item).await?;
        Ok(())
    }

    /// Pulls remote messages above the high-water mark (plus old
    /// untracked UIDs found by the full pass), newest first.
    async fn fetch_new_messages(&mut self) -> crate::Result<()> {
        let start = self.tracked.last_uid().max(self.checkpoint.last_uid) + 1;
        let mut uids = std::mem::take(&mut self.added_uids);
        uids.extend(self.remote.list_uids(start, 0).await?);
        uids.sort_unstable();
        uids.dedup();

        self.repair_unresolved(&mut uids).await?;

        let planned_max = uids.last().copied().unwrap_or(0);
        uids.retain(|&uid| {
            !self.tracked.contains_uid(uid)
                && !self.uid_skipped(uid)
                && !self.to_delete.contains(&uid)
        });
        uids.reverse();
        self.fetch_uids(uids).await?;

        // Messages that arrived while the queue drained.
        if planned_max > 0 {
            let late: Vec<Uid> = self
                .remote
                .list_uids(planned_max + 1, 0)
                .await?
                .into_iter()
                .filter(|&uid| !self.tracked.contains_uid(uid) && !self.uid_skipped(uid))
                .collect();
            if !late.is_empty() {
                debug!("picking up {} late arrival(s)", late.len());
                self.fetch_uids(late).await?;
            }
        }
        Ok(())
    }

    /// Resolves pending appends from past passes by envelope matching
    /// before the candidate UIDs get pulled as new messages.
    async fn repair_unresolved(&mut self, uids: &mut Vec<Uid>) -> crate::Result<()> {
        let unresolved = self.tracked.unresolved_items();
        if unresolved.is_empty() || uids.is_empty() {
            return Ok(());
        }

        let mut candidates = match self.remote.fetch_envelopes(uids).await {
            Ok(candidates) => candidates,
            Err(err) if err.can_continue() => {
                warn!("cannot fetch envelopes to resolve pending appends: {err}");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        for item in unresolved {
            let Some(msg) = self.ctx.local.message(item).await? else {
                self.remove_tracker(item).await?;
                continue;
            };
            let (matched, rest) = find_match(candidates, msg.size, msg.message_id.as_deref());
            candidates = rest;
            let Some(envelope) = matched else {
                continue;
            };
            debug!("resolved pending append of message {item} to uid {}", envelope.uid);
            let resolved = MessageTracker {
                item_id: item,
                folder_id: self.tracker.folder_id,
                uid: envelope.uid,
                flags: msg.flags,
            };
            self.ctx.trackers.upsert_message_tracker(&resolved).await?;
            self.tracked.insert(resolved);
            self.checkpoint.update_last_uid(envelope.uid);
            uids.retain(|&uid| uid != envelope.uid);
        }
        Ok(())
    }

    async fn fetch_uids(&mut self, uids: Vec<Uid>) -> crate::Result<()> {
        for chunk in uids.chunks(self.ctx.config.fetch_batch_size) {
            self.ctx.check_cancelled()?;
            match self.remote.fetch_messages(chunk).await {
                Ok(fetched) => {
                    let got: HashSet<Uid> = fetched.iter().map(|(uid, _)| *uid).collect();
                    for (uid, content) in fetched {
                        self.store_message(uid, content).await?;
                    }
                    // Unanswered UIDs get a second chance one by one.
                    for &uid in chunk.iter().filter(|uid| !got.contains(*uid)) {
                        self.fetch_single(uid).await?;
                    }
                }
                Err(err) if err.can_continue() => {
                    warn!("batch fetch failed ({err}), falling back to single fetches");
                    for &uid in chunk {
                        self.fetch_single(uid).await?;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn fetch_single(&mut self, uid: Uid) -> crate::Result<()> {
        match self.remote.fetch_message(uid).await {
            Ok(content) => self.store_message(uid, content).await,
            Err(err) => {
                self.message_failed(
                    self.uid_key(uid),
                    None,
                    format!("cannot fetch remote message {uid}"),
                    err,
                )
                .await
            }
        }
    }

    async fn store_message(&mut self, uid: Uid, content: MessageContent) -> crate::Result<()> {
        if content.flags.contains(Flags::DELETED) {
            trace!("skipping remote message {uid} flagged deleted");
            self.checkpoint.update_last_uid(uid);
            return Ok(());
        }

        let item = match self
            .local
            .add_message(content.flags, content.internal_date, &content.body)
            .await
        {
            Ok(item) => item,
            Err(err) => {
                return self
                    .message_failed(
                        self.uid_key(uid),
                        None,
                        format!("cannot store remote message {uid}"),
                        err,
                    )
                    .await;
            }
        };

        let tracker = MessageTracker {
            item_id: item,
            folder_id: self.tracker.folder_id,
            uid,
            flags: content.flags,
        };
        self.ctx.trackers.upsert_message_tracker(&tracker).await?;
        self.tracked.insert(tracker);
        self.checkpoint.update_last_uid(uid);
        self.stats.messages_added_locally += 1;
        self.ctx
            .errors
            .clear(&self.ctx.config.account, &self.uid_key(uid));
        Ok(())
    }

    /// Expunges the messages scheduled for remote deletion.
    async fn delete_remote_messages(&mut self) -> crate::Result<()> {
        if self.to_delete.is_empty() || !self.ctx.config.policy.pushes_changes() {
            self.to_delete.clear();
            return Ok(());
        }
        self.to_delete.sort_unstable();
        self.to_delete.dedup();
        let uids = std::mem::take(&mut self.to_delete);

        match self.remote.expunge(&uids).await {
            Ok(()) => {
                for uid in uids {
                    if let Some(tracker) = self.tracked.remove_by_uid(uid) {
                        self.ctx
                            .trackers
                            .delete_message_tracker(self.tracker.folder_id, tracker.item_id)
                            .await?;
                    }
                    self.stats.messages_deleted_remotely += 1;
                }
            }
            Err(err) if err.can_continue() => {
                // Trackers retained, retried on the next pass.
                warn!("cannot expunge remote messages: {err}");
                self.ctx.push_error(
                    None,
                    format!("cannot expunge messages from {}", self.remote.path()),
                    err.into(),
                );
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Drains the deferred appends of this folder and persists the
    /// checkpoint. Called by the session after every folder ran.
    pub async fn finish(mut self) -> crate::Result<FolderStats> {
        if !self.synced {
            return Ok(self.stats);
        }

        let items = self.ctx.take_appends(self.tracker.folder_id);
        if !items.is_empty() && self.ctx.config.policy.pushes_changes() {
            self.append_pending(items).await?;
        }

        if let Some(uid) = self.ctx.take_uid_bump(self.tracker.folder_id) {
            self.checkpoint.update_last_uid(uid);
        }

        // Capture the final UIDNEXT for the unchanged-folder shortcut
        // of the next session.
        match self.remote.status().await {
            Ok(status) => self.checkpoint.uid_next = status.uid_next,
            Err(err) if err.can_continue() => self.checkpoint.uid_next = self.status.uid_next,
            Err(err) => return Err(err.into()),
        }
        self.ctx
            .trackers
            .save_checkpoint(self.tracker.folder_id, &self.checkpoint)
            .await?;

        if !self.stats.is_noop() {
            debug!("folder {} synced: {}", self.local.path(), self.stats);
        }
        self.ctx.with_report(|r| r.messages.merge(&self.stats));
        Ok(self.stats)
    }

    async fn append_pending(&mut self, items: Vec<ItemId>) -> crate::Result<()> {
        for item in items {
            self.ctx.check_cancelled()?;
            if self.item_skipped(item) {
                trace!("skipping message {item}, error budget exhausted");
                continue;
            }
            let Some(msg) = self.ctx.local.message(item).await? else {
                continue;
            };
            if msg.folder_id != self.tracker.folder_id {
                // Moved elsewhere since it was queued.
                continue;
            }
            if let Some(tracker) = self.tracked.get_by_item(item) {
                if !tracker.is_unresolved() {
                    continue;
                }
            }
            let body = match self.ctx.local.message_body(item).await {
                Ok(body) => body,
                Err(err) if err.is_benign() => continue,
                Err(err) => return Err(err.into()),
            };

            let appended = Appender::new(&self.remote, &self.ctx.caps, &self.ctx.config)
                .append(&msg, msg.flags, msg.date, &body)
                .await;
            match appended {
                Ok(uid) if uid != UID_UNASSIGNED && self.tracked.contains_uid(uid) => {
                    // The append resolved to a message another tracker
                    // already owns: the local copy is a duplicate.
                    warn!("message {item} is a duplicate of uid {uid}, deleting the local copy");
                    if let Err(err) = self.local.delete_message(item).await {
                        if !err.is_benign() {
                            return Err(err.into());
                        }
                    }
                    self.stats.messages_deleted_locally += 1;
                }
                Ok(uid) => {
                    let tracker = MessageTracker {
                        item_id: item,
                        folder_id: self.tracker.folder_id,
                        uid,
                        flags: msg.flags,
                    };
                    self.ctx.trackers.upsert_message_tracker(&tracker).await?;
                    self.tracked.insert(tracker);
                    self.checkpoint.update_last_uid(uid);
                    self.stats.messages_added_remotely += 1;
                    self.ctx
                        .errors
                        .clear(&self.ctx.config.account, &ErrorKey::Item(item));
                }
                Err(err) => {
                    self.message_failed(
                        ErrorKey::Item(item),
                        Some(item),
                        format!("cannot append message {item} to {}", self.remote.path()),
                        err,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn remove_tracker(&mut self, item: ItemId) -> crate::Result<()> {
        self.tracked.remove_by_item(item);
        self.ctx
            .trackers
            .delete_message_tracker(self.tracker.folder_id, item)
            .await?;
        Ok(())
    }

    fn uid_key(&self, uid: Uid) -> ErrorKey {
        ErrorKey::Remote {
            uid_validity: self.tracker.uid_validity,
            uid,
        }
    }

    fn uid_skipped(&self, uid: Uid) -> bool {
        self.ctx
            .errors
            .count(&self.ctx.config.account, &self.uid_key(uid))
            >= self.ctx.config.max_item_errors
    }

    fn item_skipped(&self, item: ItemId) -> bool {
        self.ctx
            .errors
            .count(&self.ctx.config.account, &ErrorKey::Item(item))
            >= self.ctx.config.max_item_errors
    }

    /// Charges one failure against the error budgets. Continuable
    /// errors are recorded and swallowed; exhausting the folder
    /// budget disables synchronization for the folder and aborts.
    async fn message_failed(
        &mut self,
        key: ErrorKey,
        item: Option<ItemId>,
        context: String,
        err: backend::Error,
    ) -> crate::Result<()> {
        if !err.can_continue() {
            return Err(err.into());
        }
        let account = self.ctx.config.account.clone();
        if err.is_benign() {
            debug!("{context}: {err}, already converged");
            self.ctx.errors.clear(&account, &key);
            return Ok(());
        }

        let count = self.ctx.errors.increment(&account, key);
        warn!("{context} (failure {count}): {err}");
        self.ctx.push_error(item, context, err.into());

        if count == 1 {
            self.total_errors += 1;
            if self.total_errors >= self.ctx.config.max_total_errors {
                warn!(
                    "too many failed messages in {}, disabling folder synchronization",
                    self.local.path()
                );
                self.ctx
                    .local
                    .set_sync_enabled(self.local.id(), false)
                    .await?;
                return Err(Error::TooManyErrorsError(account).into());
            }
        }
        Ok(())
    }
}
