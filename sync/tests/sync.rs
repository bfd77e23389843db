//! End-to-end synchronization scenarios over in-memory stores.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imap_sync::{
    backend::{
        self, FolderId, ItemId, LocalChanges, LocalMailStore, MailboxStatus, RemoteCapabilities,
        RemoteMailStore, Uid, UID_UNASSIGNED,
    },
    folder::{Folder, FolderKind, ListingEntry},
    message::{LocalMessage, MessageContent, MessageEnvelope, RemoteMessage, SearchQuery},
    sync::{CancelToken, SyncEvent},
    tracker::{FolderTracker, MessageTracker, SyncCheckpoint, TrackerStore},
    Flags, SyncConfig, SyncPolicy, SyncSession,
};

fn header(body: &[u8], name: &str) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix(name).map(|v| v.trim().to_owned()))
}

fn message_id(body: &[u8]) -> Option<String> {
    header(body, "Message-ID:")
}

fn body(id: &str, text: &str) -> Vec<u8> {
    format!("Message-ID: <{id}@test>\r\nSubject: {id}\r\n\r\n{text}\r\n").into_bytes()
}

#[derive(Clone)]
struct StoredMessage {
    flags: Flags,
    body: Vec<u8>,
    date: Option<DateTime<Utc>>,
}

struct RemoteFolderState {
    uid_validity: u64,
    uid_next: Uid,
    messages: BTreeMap<Uid, StoredMessage>,
    selectable: bool,
}

impl RemoteFolderState {
    fn new(uid_validity: u64) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            messages: BTreeMap::new(),
            selectable: true,
        }
    }
}

/// In-memory IMAP account.
struct FakeRemote {
    folders: Mutex<HashMap<String, RemoteFolderState>>,
    caps: RemoteCapabilities,
    /// Whether APPEND reports the new UID.
    append_returns_uid: bool,
    /// Server-side deduplication: appending a body the folder already
    /// holds is silently dropped.
    merge_duplicates: bool,
    mutations: AtomicU32,
    closes: AtomicU32,
    deleted_folders: Mutex<Vec<String>>,
    /// Token cancelled by the next body fetch, to interrupt a running
    /// pass from inside the store.
    cancel_on_fetch: Mutex<Option<CancelToken>>,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            folders: Mutex::new(HashMap::new()),
            caps: RemoteCapabilities {
                uid_plus: true,
                search: true,
                vendor: None,
            },
            append_returns_uid: true,
            merge_duplicates: false,
            mutations: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            deleted_folders: Mutex::new(Vec::new()),
            cancel_on_fetch: Mutex::new(None),
        }
    }

    fn without_uidplus(mut self) -> Self {
        self.caps.uid_plus = false;
        self.append_returns_uid = false;
        self
    }

    fn with_merge_duplicates(mut self) -> Self {
        self.merge_duplicates = true;
        self
    }

    fn add_folder(&self, path: &str) {
        let mut folders = self.folders.lock().unwrap();
        folders.insert(path.to_owned(), RemoteFolderState::new(100));
    }

    fn add_message(&self, path: &str, flags: Flags, body: Vec<u8>) -> Uid {
        let mut folders = self.folders.lock().unwrap();
        let folder = folders.get_mut(path).unwrap();
        let uid = folder.uid_next;
        folder.uid_next += 1;
        folder.messages.insert(
            uid,
            StoredMessage {
                flags,
                body,
                date: None,
            },
        );
        uid
    }

    fn remove_message(&self, path: &str, uid: Uid) {
        let mut folders = self.folders.lock().unwrap();
        folders.get_mut(path).unwrap().messages.remove(&uid);
    }

    fn set_flags(&self, path: &str, uid: Uid, flags: Flags) {
        let mut folders = self.folders.lock().unwrap();
        let msg = folders.get_mut(path).unwrap().messages.get_mut(&uid).unwrap();
        msg.flags = flags;
    }

    fn set_uid_validity(&self, path: &str, uid_validity: u64) {
        let mut folders = self.folders.lock().unwrap();
        folders.get_mut(path).unwrap().uid_validity = uid_validity;
    }

    fn message_count(&self, path: &str) -> usize {
        let folders = self.folders.lock().unwrap();
        folders.get(path).map(|f| f.messages.len()).unwrap_or(0)
    }

    fn message_flags(&self, path: &str, uid: Uid) -> Option<Flags> {
        let folders = self.folders.lock().unwrap();
        folders.get(path)?.messages.get(&uid).map(|m| m.flags)
    }

    fn has_folder(&self, path: &str) -> bool {
        self.folders.lock().unwrap().contains_key(path)
    }

    fn mutations(&self) -> u32 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    fn cancel_on_first_fetch(&self, token: CancelToken) {
        *self.cancel_on_fetch.lock().unwrap() = Some(token);
    }

    fn deletion_log(&self) -> Vec<String> {
        self.deleted_folders.lock().unwrap().clone()
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn status_of(state: &RemoteFolderState) -> MailboxStatus {
        MailboxStatus {
            uid_validity: state.uid_validity,
            uid_next: state.uid_next,
            exists: state.messages.len() as u32,
            unseen: 0,
            read_only: false,
        }
    }
}

#[async_trait]
impl RemoteMailStore for FakeRemote {
    async fn capabilities(&self) -> backend::Result<RemoteCapabilities> {
        Ok(self.caps.clone())
    }

    async fn list_folders(&self, pattern: &str) -> backend::Result<Vec<ListingEntry>> {
        let folders = self.folders.lock().unwrap();
        Ok(folders
            .iter()
            .filter(|(path, _)| pattern == "*" || path.as_str() == pattern)
            .map(|(path, state)| ListingEntry {
                path: path.clone(),
                delimiter: '/',
                selectable: state.selectable,
                no_inferiors: false,
            })
            .collect())
    }

    async fn select(&self, path: &str) -> backend::Result<MailboxStatus> {
        self.status(path).await
    }

    async fn status(&self, path: &str) -> backend::Result<MailboxStatus> {
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        Ok(Self::status_of(state))
    }

    async fn folder_exists(&self, path: &str) -> backend::Result<bool> {
        Ok(self.folders.lock().unwrap().contains_key(path))
    }

    async fn create_folder(&self, path: &str) -> backend::Result<()> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        folders
            .entry(path.to_owned())
            .or_insert_with(|| RemoteFolderState::new(100));
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> backend::Result<()> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        folders.remove(path).ok_or(backend::Error::NotFoundError)?;
        self.deleted_folders.lock().unwrap().push(path.to_owned());
        Ok(())
    }

    async fn rename_folder(&self, from: &str, to: &str) -> backend::Result<()> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        let state = folders.remove(from).ok_or(backend::Error::NotFoundError)?;
        folders.insert(to.to_owned(), state);
        Ok(())
    }

    async fn close(&self, _path: &str) -> backend::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_flags(
        &self,
        path: &str,
        first: Uid,
        last: Uid,
    ) -> backend::Result<Vec<RemoteMessage>> {
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        if first > last {
            return Ok(Vec::new());
        }
        Ok(state
            .messages
            .range(first..=last)
            .map(|(&uid, msg)| RemoteMessage {
                uid,
                flags: msg.flags,
            })
            .collect())
    }

    async fn list_uids(&self, path: &str, first: Uid, last: Uid) -> backend::Result<Vec<Uid>> {
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        let last = if last == 0 { Uid::MAX } else { last };
        if first > last {
            return Ok(Vec::new());
        }
        Ok(state.messages.range(first..=last).map(|(&uid, _)| uid).collect())
    }

    async fn fetch_messages(
        &self,
        path: &str,
        uids: &[Uid],
    ) -> backend::Result<Vec<(Uid, MessageContent)>> {
        if let Some(token) = self.cancel_on_fetch.lock().unwrap().take() {
            token.cancel();
        }
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                state.messages.get(uid).map(|msg| {
                    (
                        *uid,
                        MessageContent {
                            body: msg.body.clone(),
                            flags: msg.flags,
                            internal_date: msg.date,
                        },
                    )
                })
            })
            .collect())
    }

    async fn fetch_message(&self, path: &str, uid: Uid) -> backend::Result<MessageContent> {
        self.fetch_messages(path, &[uid])
            .await?
            .pop()
            .map(|(_, content)| content)
            .ok_or(backend::Error::NotFoundError)
    }

    async fn fetch_envelopes(
        &self,
        path: &str,
        uids: &[Uid],
    ) -> backend::Result<Vec<MessageEnvelope>> {
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                state.messages.get(uid).map(|msg| MessageEnvelope {
                    uid: *uid,
                    size: msg.body.len() as u32,
                    message_id: message_id(&msg.body),
                    subject: header(&msg.body, "Subject:"),
                    date: msg.date,
                })
            })
            .collect())
    }

    async fn append(
        &self,
        path: &str,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> backend::Result<Option<Uid>> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        let state = folders.get_mut(path).ok_or(backend::Error::NotFoundError)?;
        if self.merge_duplicates && state.messages.values().any(|m| m.body == body) {
            return Ok(None);
        }
        let uid = state.uid_next;
        state.uid_next += 1;
        state.messages.insert(
            uid,
            StoredMessage {
                flags,
                body: body.to_vec(),
                date: internal_date,
            },
        );
        Ok(self.append_returns_uid.then_some(uid))
    }

    async fn copy_message(&self, path: &str, uid: Uid, dest: &str) -> backend::Result<Option<Uid>> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        let msg = folders
            .get(path)
            .and_then(|f| f.messages.get(&uid))
            .cloned()
            .ok_or(backend::Error::NotFoundError)?;
        let dest = folders.get_mut(dest).ok_or(backend::Error::NotFoundError)?;
        let new_uid = dest.uid_next;
        dest.uid_next += 1;
        dest.messages.insert(new_uid, msg);
        Ok(self.caps.has_copy_uid().then_some(new_uid))
    }

    async fn store_flags(
        &self,
        path: &str,
        uids: &[Uid],
        add: Flags,
        remove: Flags,
    ) -> backend::Result<()> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        let state = folders.get_mut(path).ok_or(backend::Error::NotFoundError)?;
        for uid in uids {
            if let Some(msg) = state.messages.get_mut(uid) {
                msg.flags = (msg.flags | add) & !remove;
            }
        }
        Ok(())
    }

    async fn expunge(&self, path: &str, uids: &[Uid]) -> backend::Result<()> {
        self.mutated();
        let mut folders = self.folders.lock().unwrap();
        let state = folders.get_mut(path).ok_or(backend::Error::NotFoundError)?;
        for uid in uids {
            state.messages.remove(uid);
        }
        Ok(())
    }

    async fn search(&self, path: &str, _query: &SearchQuery) -> backend::Result<Vec<Uid>> {
        let folders = self.folders.lock().unwrap();
        let state = folders.get(path).ok_or(backend::Error::NotFoundError)?;
        Ok(state.messages.keys().copied().collect())
    }

    async fn set_timeout_hint(&self, _timeout: Option<Duration>) -> backend::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Change {
    AddedMessage(ItemId),
    UpdatedMessage(ItemId),
    DeletedMessage(ItemId),
}

/// In-memory local mailbox store with a change log.
struct FakeLocal {
    folders: Mutex<HashMap<FolderId, Folder>>,
    messages: Mutex<HashMap<ItemId, (LocalMessage, Vec<u8>)>>,
    next_folder: AtomicU32,
    next_item: AtomicU32,
    seq: AtomicU64,
    log: Mutex<Vec<(u64, Change)>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl FakeLocal {
    fn new() -> Self {
        Self {
            folders: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            next_folder: AtomicU32::new(1),
            next_item: AtomicU32::new(1),
            seq: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn record(&self, change: Change) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().unwrap().push((seq, change));
    }

    fn folder_id(&self, path: &str) -> Option<FolderId> {
        let folders = self.folders.lock().unwrap();
        folders.values().find(|f| f.path == path).map(|f| f.id)
    }

    fn message_ids(&self, folder: FolderId) -> Vec<ItemId> {
        let messages = self.messages.lock().unwrap();
        let mut ids: Vec<ItemId> = messages
            .values()
            .filter(|(msg, _)| msg.folder_id == folder)
            .map(|(msg, _)| msg.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Simulates the user renaming a folder (no change-log entry,
    /// folder renames are picked up from the tree itself).
    fn rename_folder(&self, id: FolderId, path: &str) {
        let mut folders = self.folders.lock().unwrap();
        folders.get_mut(&id).unwrap().path = path.to_owned();
    }

    /// Moves a message between folders without a change-log entry,
    /// as seen after a change-log gap.
    fn relocate_message(&self, item: ItemId, folder: FolderId) {
        let mut messages = self.messages.lock().unwrap();
        messages.get_mut(&item).unwrap().0.folder_id = folder;
    }
}

#[async_trait]
impl LocalMailStore for FakeLocal {
    async fn list_folders(&self) -> backend::Result<Vec<Folder>> {
        let folders = self.folders.lock().unwrap();
        let mut all: Vec<Folder> = folders.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }

    async fn folder(&self, id: FolderId) -> backend::Result<Option<Folder>> {
        Ok(self.folders.lock().unwrap().get(&id).cloned())
    }

    async fn folder_by_path(&self, path: &str) -> backend::Result<Option<Folder>> {
        let folders = self.folders.lock().unwrap();
        Ok(folders.values().find(|f| f.path == path).cloned())
    }

    async fn create_folder(&self, path: &str) -> backend::Result<Folder> {
        let id = self.next_folder.fetch_add(1, Ordering::SeqCst);
        let folder = Folder {
            id,
            path: path.to_owned(),
            kind: path
                .rsplit('/')
                .next()
                .and_then(|leaf| leaf.parse::<FolderKind>().ok()),
            system: false,
            sync_enabled: true,
        };
        self.folders.lock().unwrap().insert(id, folder.clone());
        Ok(folder)
    }

    async fn delete_folder(&self, id: FolderId) -> backend::Result<()> {
        self.folders
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(backend::Error::NotFoundError)?;
        let mut messages = self.messages.lock().unwrap();
        messages.retain(|_, (msg, _)| msg.folder_id != id);
        Ok(())
    }

    async fn set_sync_enabled(&self, id: FolderId, enabled: bool) -> backend::Result<()> {
        let mut folders = self.folders.lock().unwrap();
        let folder = folders.get_mut(&id).ok_or(backend::Error::NotFoundError)?;
        folder.sync_enabled = enabled;
        Ok(())
    }

    async fn list_message_ids(&self, folder: FolderId) -> backend::Result<Vec<ItemId>> {
        Ok(self.message_ids(folder))
    }

    async fn message(&self, id: ItemId) -> backend::Result<Option<LocalMessage>> {
        let messages = self.messages.lock().unwrap();
        Ok(messages.get(&id).map(|(msg, _)| msg.clone()))
    }

    async fn message_body(&self, id: ItemId) -> backend::Result<Vec<u8>> {
        let messages = self.messages.lock().unwrap();
        messages
            .get(&id)
            .map(|(_, body)| body.clone())
            .ok_or(backend::Error::NotFoundError)
    }

    async fn add_message(
        &self,
        folder: FolderId,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> backend::Result<ItemId> {
        let id = self.next_item.fetch_add(1, Ordering::SeqCst);
        let msg = LocalMessage {
            id,
            folder_id: folder,
            flags,
            size: body.len() as u32,
            message_id: message_id(body),
            subject: header(body, "Subject:"),
            date: internal_date,
        };
        self.messages
            .lock()
            .unwrap()
            .insert(id, (msg, body.to_vec()));
        self.record(Change::AddedMessage(id));
        Ok(id)
    }

    async fn set_flags(&self, id: ItemId, flags: Flags) -> backend::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        let (msg, _) = messages.get_mut(&id).ok_or(backend::Error::NotFoundError)?;
        msg.flags = flags;
        drop(messages);
        self.record(Change::UpdatedMessage(id));
        Ok(())
    }

    async fn delete_message(&self, id: ItemId) -> backend::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(backend::Error::NotFoundError)?;
        self.record(Change::DeletedMessage(id));
        Ok(())
    }

    async fn empty_folder(&self, folder: FolderId) -> backend::Result<()> {
        for id in self.message_ids(folder) {
            self.messages.lock().unwrap().remove(&id);
            self.record(Change::DeletedMessage(id));
        }
        Ok(())
    }

    async fn change_seq(&self) -> backend::Result<u64> {
        Ok(self.seq.load(Ordering::SeqCst))
    }

    async fn changes_since(&self, seq: u64) -> backend::Result<LocalChanges> {
        let log = self.log.lock().unwrap();
        let mut changes = LocalChanges {
            seq: self.seq.load(Ordering::SeqCst),
            ..Default::default()
        };
        for (s, change) in log.iter() {
            if *s <= seq {
                continue;
            }
            match change {
                Change::AddedMessage(id) => changes.added_messages.push(*id),
                Change::UpdatedMessage(id) => changes.updated_messages.push(*id),
                Change::DeletedMessage(id) => changes.deleted_messages.push(*id),
            }
        }
        Ok(changes)
    }

    fn mailbox_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.lock.clone()
    }
}

/// In-memory tracker persistence.
#[derive(Default)]
struct FakeTrackerStore {
    folders: Mutex<HashMap<FolderId, FolderTracker>>,
    messages: Mutex<HashMap<(FolderId, ItemId), MessageTracker>>,
    checkpoints: Mutex<HashMap<FolderId, SyncCheckpoint>>,
    cleared: Mutex<Vec<FolderId>>,
}

impl FakeTrackerStore {
    fn checkpoint_was_cleared(&self, folder: FolderId) -> bool {
        self.cleared.lock().unwrap().contains(&folder)
    }
}

#[async_trait]
impl TrackerStore for FakeTrackerStore {
    async fn folder_trackers(&self) -> backend::Result<Vec<FolderTracker>> {
        Ok(self.folders.lock().unwrap().values().cloned().collect())
    }

    async fn upsert_folder_tracker(&self, tracker: &FolderTracker) -> backend::Result<()> {
        self.folders
            .lock()
            .unwrap()
            .insert(tracker.folder_id, tracker.clone());
        Ok(())
    }

    async fn delete_folder_tracker(&self, folder: FolderId) -> backend::Result<()> {
        self.folders.lock().unwrap().remove(&folder);
        Ok(())
    }

    async fn message_trackers(&self, folder: FolderId) -> backend::Result<Vec<MessageTracker>> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|((f, _), _)| *f == folder)
            .map(|(_, t)| *t)
            .collect())
    }

    async fn upsert_message_tracker(&self, tracker: &MessageTracker) -> backend::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        // An item can only be tracked in one folder.
        messages.retain(|(_, item), _| *item != tracker.item_id);
        messages.insert((tracker.folder_id, tracker.item_id), *tracker);
        Ok(())
    }

    async fn delete_message_tracker(
        &self,
        folder: FolderId,
        item: ItemId,
    ) -> backend::Result<()> {
        self.messages.lock().unwrap().remove(&(folder, item));
        Ok(())
    }

    async fn delete_message_trackers(&self, folder: FolderId) -> backend::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        messages.retain(|(f, _), _| *f != folder);
        Ok(())
    }

    async fn checkpoint(&self, folder: FolderId) -> backend::Result<Option<SyncCheckpoint>> {
        Ok(self.checkpoints.lock().unwrap().get(&folder).copied())
    }

    async fn save_checkpoint(
        &self,
        folder: FolderId,
        checkpoint: &SyncCheckpoint,
    ) -> backend::Result<()> {
        self.checkpoints.lock().unwrap().insert(folder, *checkpoint);
        Ok(())
    }

    async fn clear_checkpoint(&self, folder: FolderId) -> backend::Result<()> {
        self.checkpoints.lock().unwrap().remove(&folder);
        self.cleared.lock().unwrap().push(folder);
        Ok(())
    }
}

struct TestEnv {
    remote: Arc<FakeRemote>,
    local: Arc<FakeLocal>,
    store: Arc<FakeTrackerStore>,
    config: SyncConfig,
}

impl TestEnv {
    fn new(remote: FakeRemote) -> Self {
        Self {
            remote: Arc::new(remote),
            local: Arc::new(FakeLocal::new()),
            store: Arc::new(FakeTrackerStore::default()),
            config: SyncConfig::new("test"),
        }
    }

    fn session(&self) -> SyncSession {
        SyncSession::new(
            self.config.clone(),
            self.remote.clone(),
            self.local.clone(),
            self.store.clone(),
        )
    }
}

#[test_log::test(tokio::test)]
async fn first_sync_pulls_remote_folders_and_messages() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("Work");
    env.remote.add_message("INBOX", Flags::SEEN, body("a", "hello"));
    env.remote.add_message("INBOX", Flags::empty(), body("b", "world"));

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.folders_created_locally, 2);
    assert_eq!(report.messages.messages_added_locally, 2);
    assert!(report.errors.is_empty());

    let inbox = env.local.folder_id("INBOX").unwrap();
    assert!(env.local.folder_id("Work").is_some());
    assert_eq!(env.local.message_ids(inbox).len(), 2);

    let trackers = env.store.message_trackers(inbox).await.unwrap();
    assert_eq!(trackers.len(), 2);
    assert!(trackers.iter().all(|t| t.uid != UID_UNASSIGNED));

    // Both folders got closed after their pass.
    assert_eq!(env.remote.closes(), 2);
}

#[test_log::test(tokio::test)]
async fn second_run_changes_nothing() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_message("INBOX", Flags::SEEN, body("a", "hello"));

    env.session().sync(false).await.unwrap();
    let mutations = env.remote.mutations();

    let report = env.session().sync(false).await.unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(env.remote.mutations(), mutations);
}

#[test_log::test(tokio::test)]
async fn new_local_message_is_appended_remotely() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    let item = env
        .local
        .add_message(inbox, Flags::SEEN, None, &body("a", "drafted locally"))
        .await
        .unwrap();

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.messages.messages_added_remotely, 1);
    assert_eq!(env.remote.message_count("INBOX"), 1);
    let trackers = env.store.message_trackers(inbox).await.unwrap();
    assert_eq!(trackers.len(), 1);
    assert_eq!(trackers[0].item_id, item);
    assert_ne!(trackers[0].uid, UID_UNASSIGNED);
}

#[test_log::test(tokio::test)]
async fn append_without_uidplus_resolves_by_envelope() {
    let env = TestEnv::new(FakeRemote::new().without_uidplus());
    env.remote.add_folder("INBOX");
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    env.local
        .add_message(inbox, Flags::empty(), None, &body("a", "no uidplus here"))
        .await
        .unwrap();

    env.session().sync(false).await.unwrap();

    let trackers = env.store.message_trackers(inbox).await.unwrap();
    assert_eq!(trackers.len(), 1);
    assert_ne!(trackers[0].uid, UID_UNASSIGNED);
}

#[test_log::test(tokio::test)]
async fn deduplicating_server_keeps_a_single_copy() {
    let env = TestEnv::new(FakeRemote::new().without_uidplus().with_merge_duplicates());
    env.remote.add_folder("INBOX");
    let msg = body("dup", "same bytes");
    env.remote.add_message("INBOX", Flags::empty(), msg.clone());
    env.session().sync(false).await.unwrap();

    // The user drops an identical copy into the local folder; the
    // server silently merges the append into the existing message.
    let inbox = env.local.folder_id("INBOX").unwrap();
    env.local
        .add_message(inbox, Flags::empty(), None, &msg)
        .await
        .unwrap();

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(env.remote.message_count("INBOX"), 1);
    assert_eq!(env.local.message_ids(inbox).len(), 1);
    assert_eq!(env.store.message_trackers(inbox).await.unwrap().len(), 1);
    assert_eq!(report.messages.messages_deleted_locally, 1);
}

#[test_log::test(tokio::test)]
async fn remote_flag_change_is_pulled_on_full_pass() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    let uid = env.remote.add_message("INBOX", Flags::empty(), body("a", "x"));
    env.session().sync(false).await.unwrap();

    env.remote.set_flags("INBOX", uid, Flags::ANSWERED);
    let report = env.session().sync(true).await.unwrap();

    assert_eq!(report.messages.flags_updated_locally, 1);
    let inbox = env.local.folder_id("INBOX").unwrap();
    let item = env.local.message_ids(inbox)[0];
    let msg = env.local.message(item).await.unwrap().unwrap();
    assert!(msg.flags.contains(Flags::ANSWERED));
}

#[test_log::test(tokio::test)]
async fn local_flag_change_is_pushed_incrementally() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    let uid = env.remote.add_message("INBOX", Flags::empty(), body("a", "x"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    let item = env.local.message_ids(inbox)[0];
    env.local.set_flags(item, Flags::SEEN).await.unwrap();

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.messages.flags_updated_remotely, 1);
    assert!(env
        .remote
        .message_flags("INBOX", uid)
        .unwrap()
        .contains(Flags::SEEN));
}

#[test_log::test(tokio::test)]
async fn deletions_propagate_in_both_directions() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    let uid_a = env.remote.add_message("INBOX", Flags::empty(), body("a", "x"));
    let uid_b = env.remote.add_message("INBOX", Flags::empty(), body("b", "y"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    let trackers = env.store.message_trackers(inbox).await.unwrap();
    let item_a = trackers.iter().find(|t| t.uid == uid_a).unwrap().item_id;

    // One side each.
    env.local.delete_message(item_a).await.unwrap();
    env.remote.remove_message("INBOX", uid_b);

    let report = env.session().sync(true).await.unwrap();

    assert_eq!(report.messages.messages_deleted_remotely, 1);
    assert_eq!(report.messages.messages_deleted_locally, 1);
    assert_eq!(env.remote.message_count("INBOX"), 0);
    assert!(env.local.message_ids(inbox).is_empty());
    assert!(env.store.message_trackers(inbox).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn uid_validity_reset_preserves_local_only_messages() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_message("INBOX", Flags::empty(), body("a", "synced"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    env.local
        .add_message(inbox, Flags::empty(), None, &body("b", "local only"))
        .await
        .unwrap();
    env.remote.set_uid_validity("INBOX", 999);

    env.session().sync(false).await.unwrap();

    // Both messages survive, rebuilt from the remote side.
    assert_eq!(env.remote.message_count("INBOX"), 2);
    assert_eq!(env.local.message_ids(inbox).len(), 2);
    let tracker = env
        .store
        .folder_trackers()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.folder_id == inbox)
        .unwrap();
    assert_eq!(tracker.uid_validity, 999);
}

#[test_log::test(tokio::test)]
async fn remote_folders_are_deleted_children_before_parents() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("A");
    env.remote.add_folder("A/B");
    env.remote.add_folder("A/B/C");
    env.session().sync(false).await.unwrap();

    for path in ["A/B/C", "A/B", "A"] {
        let id = env.local.folder_id(path).unwrap();
        env.local.delete_folder(id).await.unwrap();
    }

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.folders_deleted_remotely, 3);
    assert_eq!(env.remote.deletion_log(), ["A/B/C", "A/B", "A"]);
    assert!(!env.remote.has_folder("A"));
}

#[test_log::test(tokio::test)]
async fn local_rename_renames_the_remote_folder_and_forces_a_full_pass() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("Work");
    let uid = env.remote.add_message("Work", Flags::empty(), body("a", "x"));
    env.session().sync(false).await.unwrap();

    let work = env.local.folder_id("Work").unwrap();
    env.local.rename_folder(work, "Work Stuff");
    // A remote flag change only a full pass can see.
    env.remote.set_flags("Work", uid, Flags::ANSWERED);

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.folders_renamed_remotely, 1);
    assert!(env.remote.has_folder("Work Stuff"));
    assert!(!env.remote.has_folder("Work"));
    let tracker = env
        .store
        .folder_trackers()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.folder_id == work)
        .unwrap();
    assert_eq!(tracker.remote_path, "Work Stuff");
    assert_eq!(tracker.local_path, "Work Stuff");

    // The rename invalidated the resume point, so the renamed folder
    // got a full pass that picked the remote flag change up.
    assert!(env.store.checkpoint_was_cleared(work));
    let item = env.local.message_ids(work)[0];
    let msg = env.local.message(item).await.unwrap().unwrap();
    assert!(msg.flags.contains(Flags::ANSWERED));
}

#[test_log::test(tokio::test)]
async fn new_local_folder_is_created_remotely() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.session().sync(false).await.unwrap();

    env.local.create_folder("Projects").await.unwrap();
    let projects = env.local.folder_id("Projects").unwrap();
    env.local
        .add_message(projects, Flags::empty(), None, &body("a", "pushed"))
        .await
        .unwrap();

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.folders_created_remotely, 1);
    assert!(env.remote.has_folder("Projects"));
    assert_eq!(env.remote.message_count("Projects"), 1);
}

#[test_log::test(tokio::test)]
async fn moved_message_is_copied_remotely() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("Archive");
    let uid = env.remote.add_message("INBOX", Flags::SEEN, body("a", "keep me"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    let archive = env.local.folder_id("Archive").unwrap();
    let item = env.local.message_ids(inbox)[0];

    // Simulate the user moving the message between local folders.
    {
        let mut messages = env.local.messages.lock().unwrap();
        messages.get_mut(&item).unwrap().0.folder_id = archive;
    }
    env.local.record(Change::UpdatedMessage(item));

    let report = env.session().sync(false).await.unwrap();

    assert_eq!(report.messages.messages_copied_remotely, 1);
    assert_eq!(env.remote.message_count("INBOX"), 0);
    assert_eq!(env.remote.message_count("Archive"), 1);
    assert!(env.remote.message_flags("INBOX", uid).is_none());
    let trackers = env.store.message_trackers(archive).await.unwrap();
    assert_eq!(trackers.len(), 1);
    assert_eq!(trackers[0].item_id, item);
}

#[test_log::test(tokio::test)]
async fn import_only_policy_never_mutates_the_remote() {
    let mut env = TestEnv::new(FakeRemote::new());
    env.config.set_policy(SyncPolicy::ImportOnly);
    env.remote.add_folder("INBOX");
    env.remote.add_message("INBOX", Flags::SEEN, body("a", "x"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    assert_eq!(env.local.message_ids(inbox).len(), 1);

    // Local changes of every kind.
    let item = env.local.message_ids(inbox)[0];
    env.local.set_flags(item, Flags::FLAGGED).await.unwrap();
    env.local
        .add_message(inbox, Flags::empty(), None, &body("b", "local"))
        .await
        .unwrap();

    env.session().sync(true).await.unwrap();

    assert_eq!(env.remote.mutations(), 0);
    assert_eq!(env.remote.message_count("INBOX"), 1);
}

#[test_log::test(tokio::test)]
async fn full_sync_moves_message_via_remote_copy() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("Archive");
    let uid = env.remote.add_message("INBOX", Flags::SEEN, body("a", "keep me"));
    env.session().sync(false).await.unwrap();

    let inbox = env.local.folder_id("INBOX").unwrap();
    let archive = env.local.folder_id("Archive").unwrap();
    let item = env.local.message_ids(inbox)[0];

    // A move the change log never saw: only the full pass can
    // discover it, by noticing the tracked message left the folder.
    env.local.relocate_message(item, archive);

    let report = env.session().sync(true).await.unwrap();

    assert_eq!(report.messages.messages_copied_remotely, 1);
    assert_eq!(report.messages.messages_added_remotely, 0);
    assert_eq!(env.remote.message_count("INBOX"), 0);
    assert_eq!(env.remote.message_count("Archive"), 1);
    assert!(env.remote.message_flags("INBOX", uid).is_none());
    let trackers = env.store.message_trackers(archive).await.unwrap();
    assert_eq!(trackers.len(), 1);
    assert_eq!(trackers[0].item_id, item);
    assert_eq!(env.local.message_ids(archive), vec![item]);
}

#[test_log::test(tokio::test)]
async fn cancellation_mid_fetch_stops_between_chunks() {
    let mut env = TestEnv::new(FakeRemote::new());
    env.config.fetch_batch_size = 1;
    env.remote.add_folder("INBOX");
    env.remote.add_message("INBOX", Flags::empty(), body("a", "one"));
    env.remote.add_message("INBOX", Flags::empty(), body("b", "two"));
    env.remote.add_message("INBOX", Flags::empty(), body("c", "three"));

    let session = env.session();
    env.remote.cancel_on_first_fetch(session.cancel_token());
    let result = session.sync(false).await;

    assert!(result.is_err());
    // The first chunk landed, the next one never got fetched.
    let inbox = env.local.folder_id("INBOX").unwrap();
    assert_eq!(env.local.message_ids(inbox).len(), 1);
}

#[test_log::test(tokio::test)]
async fn cancelled_session_stops_before_doing_anything() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_message("INBOX", Flags::empty(), body("a", "x"));

    let session = env.session();
    session.cancel_token().cancel();
    let result = session.sync(false).await;

    assert!(result.is_err());
    assert!(env.local.folder_id("INBOX").is_none());
}

#[test_log::test(tokio::test)]
async fn folder_events_report_applied_changes() {
    let env = TestEnv::new(FakeRemote::new());
    env.remote.add_folder("INBOX");
    env.remote.add_folder("Work");
    env.remote.add_folder("Projects");
    env.local.create_folder("Drafts").await.unwrap();
    env.session().sync(false).await.unwrap();

    // One change of every folder kind for the next pass.
    let drafts = env.local.folder_id("Drafts").unwrap();
    let projects = env.local.folder_id("Projects").unwrap();
    env.local.delete_folder(drafts).await.unwrap();
    env.local.rename_folder(projects, "Clients");
    env.remote.delete_folder("Work").await.unwrap();
    env.remote.add_folder("Archive");
    env.local.create_folder("Notes").await.unwrap();

    // Each event must describe a change already visible in the store
    // it names.
    let remote = env.remote.clone();
    let local = env.local.clone();
    let premature: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = premature.clone();
    let session = env.session().with_handler(move |event| {
        let remote = remote.clone();
        let local = local.clone();
        let seen = seen.clone();
        async move {
            let applied = match &event {
                SyncEvent::CreatedRemoteFolder(path) => remote.has_folder(path),
                SyncEvent::DeletedRemoteFolder(path) => !remote.has_folder(path),
                SyncEvent::RenamedRemoteFolder { from, to } => {
                    !remote.has_folder(from) && remote.has_folder(to)
                }
                SyncEvent::CreatedLocalFolder(path) => local.folder_id(path).is_some(),
                SyncEvent::DeletedLocalFolder(path) => local.folder_id(path).is_none(),
                _ => true,
            };
            if !applied {
                seen.lock().unwrap().push(event.to_string());
            }
            Ok(())
        }
    });

    let report = session.sync(false).await.unwrap();

    assert_eq!(report.folders_created_remotely, 1);
    assert_eq!(report.folders_deleted_remotely, 1);
    assert_eq!(report.folders_renamed_remotely, 1);
    assert_eq!(report.folders_created_locally, 1);
    assert_eq!(report.folders_deleted_locally, 1);
    assert!(premature.lock().unwrap().is_empty(), "{premature:?}");
}
