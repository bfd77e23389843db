//! # Synchronization
//!
//! Module dedicated to the synchronization of one account. The main
//! structure of this module is [`SyncSession`]: built from the two
//! stores and the tracker persistence, it drives one run from the
//! remote folder listing to the final [`SyncReport`].
//!
//! A run has four stages, in order:
//!
//! 1. remote folder reconciliation over the sorted listing (INBOX
//!    first, children before parents);
//! 2. local folder reconciliation for folders the listing did not
//!    match (children before parents, so deletions cascade);
//! 3. message reconciliation per associated pair;
//! 4. a finish stage draining the deferred remote appends and
//!    persisting checkpoints, once every pair has been reconciled.
//!
//! Progress can be observed through a [`SyncEvent`] handler, and a
//! run can be interrupted from another task via [`CancelToken`].

pub mod change;
pub mod error;
pub mod report;

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::{
    backend::{FolderId, ItemId, LocalMailStore, MailboxStatus, RemoteCapabilities,
        RemoteMailStore, Uid},
    config::SyncConfig,
    folder::{
        self,
        sync::{FolderPair, FolderReconciler},
        INBOX,
    },
    message::sync::MessageReconciler,
    tracker::{FolderTrackers, TrackerStore},
};

pub use self::report::{ErrorReport, FolderStats, SyncReport};

use self::error::{Error, ErrorCounters};

/// The synchronization event handler signature.
pub type SyncEventHandler =
    dyn Fn(SyncEvent) -> BoxFuture<'static, crate::Result<()>> + Send + Sync;

/// The event emitted while a session runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncEvent {
    ListedRemoteFolders(usize),
    CreatedLocalFolder(String),
    CreatedRemoteFolder(String),
    RenamedRemoteFolder { from: String, to: String },
    DeletedLocalFolder(String),
    DeletedRemoteFolder(String),
    SyncedFolder(String),
    SkippedFolder(String),
    Done,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListedRemoteFolders(n) => write!(f, "Listed {n} remote folders"),
            Self::CreatedLocalFolder(path) => write!(f, "Created local folder {path}"),
            Self::CreatedRemoteFolder(path) => write!(f, "Created remote folder {path}"),
            Self::RenamedRemoteFolder { from, to } => {
                write!(f, "Renamed remote folder {from} to {to}")
            }
            Self::DeletedLocalFolder(path) => write!(f, "Deleted local folder {path}"),
            Self::DeletedRemoteFolder(path) => write!(f, "Deleted remote folder {path}"),
            Self::SyncedFolder(path) => write!(f, "Synchronized folder {path}"),
            Self::SkippedFolder(path) => write!(f, "Skipped folder {path}"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// Cancels a running session from another task.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Remote mutations deferred to the finish stage.
#[derive(Default)]
struct PendingOps {
    appends: HashMap<FolderId, Vec<ItemId>>,
    uid_bumps: HashMap<FolderId, Uid>,
}

/// Everything the reconcilers share for one run.
pub struct SessionContext {
    pub(crate) config: SyncConfig,
    pub(crate) remote: Arc<dyn RemoteMailStore>,
    pub(crate) local: Arc<dyn LocalMailStore>,
    pub(crate) trackers: Arc<dyn TrackerStore>,
    pub(crate) errors: Arc<ErrorCounters>,
    pub(crate) caps: RemoteCapabilities,
    handler: Option<Arc<SyncEventHandler>>,
    cancel: CancelToken,
    report: Mutex<SyncReport>,
    pending: Mutex<PendingOps>,
    associations: Mutex<HashMap<FolderId, String>>,
}

impl SessionContext {
    pub(crate) async fn emit(&self, event: SyncEvent) {
        debug!("emitting sync event {event:?}");
        if let Some(handler) = &self.handler {
            if let Err(err) = handler(event).await {
                debug!("error while emitting sync event, skipping it: {err:?}");
            }
        }
    }

    pub(crate) fn check_cancelled(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::CancelledError.into());
        }
        Ok(())
    }

    pub(crate) fn with_report(&self, f: impl FnOnce(&mut SyncReport)) {
        let mut report = self.report.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut report);
    }

    pub(crate) fn push_error(&self, item: Option<ItemId>, message: String, cause: crate::Error) {
        self.with_report(|r| {
            r.errors.push(ErrorReport {
                item,
                message,
                cause,
            })
        });
    }

    pub(crate) fn queue_append(&self, folder: FolderId, item: ItemId) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.appends.entry(folder).or_default().push(item);
    }

    pub(crate) fn take_appends(&self, folder: FolderId) -> Vec<ItemId> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.appends.remove(&folder).unwrap_or_default()
    }

    pub(crate) fn remove_append(&self, folder: FolderId, item: ItemId) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(items) = pending.appends.get_mut(&folder) {
            items.retain(|&i| i != item);
        }
    }

    pub(crate) fn bump_uid(&self, folder: FolderId, uid: Uid) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let bump = pending.uid_bumps.entry(folder).or_default();
        if uid > *bump {
            *bump = uid;
        }
    }

    pub(crate) fn take_uid_bump(&self, folder: FolderId) -> Option<Uid> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.uid_bumps.remove(&folder)
    }

    pub(crate) fn set_association(&self, folder: FolderId, remote_path: String) {
        let mut associations = self.associations.lock().unwrap_or_else(|e| e.into_inner());
        associations.insert(folder, remote_path);
    }

    pub(crate) fn association(&self, folder: FolderId) -> Option<String> {
        let associations = self.associations.lock().unwrap_or_else(|e| e.into_inner());
        associations.get(&folder).cloned()
    }

    fn take_report(&self) -> SyncReport {
        let mut report = self.report.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut report)
    }
}

/// One account synchronization session.
pub struct SyncSession {
    config: SyncConfig,
    remote: Arc<dyn RemoteMailStore>,
    local: Arc<dyn LocalMailStore>,
    trackers: Arc<dyn TrackerStore>,
    errors: Arc<ErrorCounters>,
    handler: Option<Arc<SyncEventHandler>>,
    cancel: CancelToken,
}

impl SyncSession {
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteMailStore>,
        local: Arc<dyn LocalMailStore>,
        trackers: Arc<dyn TrackerStore>,
    ) -> Self {
        Self {
            config,
            remote,
            local,
            trackers,
            errors: Arc::new(ErrorCounters::new()),
            handler: None,
            cancel: CancelToken::default(),
        }
    }

    /// Shares an error counter registry across sessions, so item
    /// failure history survives between runs.
    pub fn with_error_counters(mut self, errors: Arc<ErrorCounters>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_handler<F: Future<Output = crate::Result<()>> + Send + 'static>(
        mut self,
        handler: impl Fn(SyncEvent) -> F + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(move |evt| Box::pin(handler(evt))));
        self
    }

    /// The token cancelling this session from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs one synchronization pass. `full` forces a full pass on
    /// every folder, ignoring persisted checkpoints.
    pub async fn sync(&self, full: bool) -> crate::Result<SyncReport> {
        info!("starting sync of account {}", self.config.account);

        let caps = self.remote.capabilities().await?;
        debug!("remote capabilities: {caps:?}");

        let ctx = Arc::new(SessionContext {
            config: self.config.clone(),
            remote: self.remote.clone(),
            local: self.local.clone(),
            trackers: self.trackers.clone(),
            errors: self.errors.clone(),
            caps,
            handler: self.handler.clone(),
            cancel: self.cancel.clone(),
            report: Mutex::new(SyncReport::default()),
            pending: Mutex::new(PendingOps::default()),
            associations: Mutex::new(HashMap::default()),
        });

        let listed = self.list_remote_folders(&ctx).await?;
        let delimiter = listed
            .iter()
            .map(|(entry, _)| entry.delimiter)
            .next()
            .unwrap_or(folder::LOCAL_SEPARATOR);

        let mut trackers = FolderTrackers::new(ctx.trackers.folder_trackers().await?);
        let mut reconciler = FolderReconciler::new(&ctx);
        let mut pairs: Vec<(FolderPair, Option<MailboxStatus>)> = Vec::new();

        // Stage 1: remote folders.
        for (entry, status) in &listed {
            ctx.check_cancelled()?;
            match reconciler
                .sync_remote_folder(entry, status.as_ref(), &mut trackers)
                .await
            {
                Ok(Some(pair)) => {
                    ctx.set_association(pair.tracker.folder_id, pair.tracker.remote_path.clone());
                    pairs.push((pair, *status));
                }
                Ok(None) => (),
                Err(err) if is_continuable(&err) => {
                    warn!("cannot sync remote folder {}: {err}", entry.path);
                    ctx.push_error(None, format!("cannot sync remote folder {}", entry.path), err);
                    ctx.with_report(|r| r.folders_skipped += 1);
                }
                Err(err) => return Err(err),
            }
        }

        // Stage 2: local folders the listing did not match.
        if !self.config.sync_inbox_only {
            let mut locals = self.local.list_folders().await?;
            folder::sort_children_first(&mut locals);
            for local in &locals {
                ctx.check_cancelled()?;
                if !local.sync_enabled || reconciler.is_matched(local.id) {
                    continue;
                }
                match reconciler
                    .sync_local_folder(local, delimiter, &mut trackers)
                    .await
                {
                    Ok(Some(pair)) => {
                        ctx.set_association(
                            pair.tracker.folder_id,
                            pair.tracker.remote_path.clone(),
                        );
                        pairs.push((pair, None));
                    }
                    Ok(None) => (),
                    Err(err) if is_continuable(&err) => {
                        warn!("cannot sync local folder {}: {err}", local.path);
                        ctx.push_error(
                            None,
                            format!("cannot sync local folder {}", local.path),
                            err,
                        );
                        ctx.with_report(|r| r.folders_skipped += 1);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        drop(reconciler);

        // Stage 3: messages.
        let mut reconcilers = Vec::with_capacity(pairs.len());
        for (mut pair, status) in pairs {
            ctx.check_cancelled()?;
            if !pair.local.sync_enabled {
                debug!("sync disabled for folder {}, skipping", pair.local.path);
                ctx.emit(SyncEvent::SkippedFolder(pair.local.path.clone())).await;
                ctx.with_report(|r| r.folders_skipped += 1);
                continue;
            }
            pair.force_full |= full;
            if !pair.force_full && self.is_unchanged(&ctx, &pair, status.as_ref()).await? {
                debug!("folder {} unchanged, skipping", pair.local.path);
                ctx.emit(SyncEvent::SkippedFolder(pair.local.path.clone())).await;
                ctx.with_report(|r| r.folders_skipped += 1);
                continue;
            }

            let path = pair.local.path.clone();
            let mut rec = MessageReconciler::new(ctx.clone(), pair).await?;
            match rec.run().await {
                Ok(true) => {
                    ctx.emit(SyncEvent::SyncedFolder(path)).await;
                    ctx.with_report(|r| r.folders_synced += 1);
                    reconcilers.push(rec);
                }
                Ok(false) => {
                    ctx.emit(SyncEvent::SkippedFolder(path)).await;
                    ctx.with_report(|r| r.folders_skipped += 1);
                }
                Err(err) if is_continuable(&err) && self.config.tolerate_partial_failure => {
                    warn!("cannot sync folder {path}: {err}");
                    ctx.push_error(None, format!("cannot sync folder {path}"), err);
                    ctx.with_report(|r| r.folders_skipped += 1);
                }
                Err(err) => return Err(err),
            }
        }

        // Stage 4: deferred appends and checkpoints, in stage 3
        // order.
        for rec in reconcilers {
            ctx.check_cancelled()?;
            let folder = rec.folder_id();
            match rec.finish().await {
                Ok(_) => (),
                Err(err) if is_continuable(&err) && self.config.tolerate_partial_failure => {
                    warn!("cannot finish folder {folder}: {err}");
                    ctx.push_error(None, format!("cannot finish folder {folder}"), err);
                }
                Err(err) => return Err(err),
            }
        }

        ctx.emit(SyncEvent::Done).await;
        let report = ctx.take_report();
        info!(
            "sync of account {} done: {} folder(s) synced, {} skipped, {} error(s)",
            self.config.account,
            report.folders_synced,
            report.folders_skipped,
            report.errors.len(),
        );
        Ok(report)
    }

    /// Lists, normalizes and orders the remote folders, with their
    /// STATUS. Folders reporting an unusable STATUS are skipped for
    /// the pass.
    async fn list_remote_folders(
        &self,
        ctx: &SessionContext,
    ) -> crate::Result<Vec<(folder::ListingEntry, Option<MailboxStatus>)>> {
        let pattern = if self.config.sync_inbox_only {
            INBOX
        } else {
            "*"
        };
        let mut entries = folder::dedupe_listing(self.remote.list_folders(pattern).await?);
        folder::sort_listing(&mut entries);
        ctx.emit(SyncEvent::ListedRemoteFolders(entries.len())).await;

        let mut listed = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.selectable {
                listed.push((entry, None));
                continue;
            }
            match self.remote.status(&entry.path).await {
                Ok(status) if status.uid_validity == 0 || status.uid_next == 0 => {
                    warn!(
                        "unusable status for remote folder {} (uid validity {}, uid next {}), skipping",
                        entry.path, status.uid_validity, status.uid_next,
                    );
                    ctx.with_report(|r| r.folders_skipped += 1);
                }
                Ok(status) => listed.push((entry, Some(status))),
                Err(err) if err.can_continue() => {
                    warn!("cannot get status of remote folder {}: {err}", entry.path);
                    ctx.push_error(
                        None,
                        format!("cannot get status of remote folder {}", entry.path),
                        err.into(),
                    );
                    ctx.with_report(|r| r.folders_skipped += 1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(listed)
    }

    /// The unchanged-folder shortcut: nothing arrived remotely since
    /// the checkpoint and the local change log holds nothing new.
    async fn is_unchanged(
        &self,
        ctx: &SessionContext,
        pair: &FolderPair,
        status: Option<&MailboxStatus>,
    ) -> crate::Result<bool> {
        let Some(status) = status else {
            return Ok(false);
        };
        let Some(checkpoint) = ctx.trackers.checkpoint(pair.tracker.folder_id).await? else {
            return Ok(false);
        };
        if status.uid_validity != pair.tracker.uid_validity {
            return Ok(false);
        }
        Ok(checkpoint.uid_next == status.uid_next
            && self.local.change_seq().await? <= checkpoint.last_change_seq)
    }
}

/// Whether the session may go on after this folder-level error.
fn is_continuable(err: &crate::Error) -> bool {
    if let Some(err) = err.downcast_ref::<crate::backend::Error>() {
        return err.can_continue();
    }
    matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TooManyErrorsError(_) | Error::InconsistentUidNextError { .. })
    )
}
