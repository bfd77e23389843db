//! # Remote folder handle
//!
//! A [`RemoteFolder`] binds the remote store to one folder path so
//! the reconcilers do not thread the path through every call.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    flag::Flags,
    message::{MessageContent, MessageEnvelope, RemoteMessage, SearchQuery},
};

use super::{MailboxStatus, RemoteMailStore, Result, Uid};

/// One remote folder, bound to its path.
#[derive(Clone)]
pub struct RemoteFolder {
    store: Arc<dyn RemoteMailStore>,
    path: String,
}

impl RemoteFolder {
    pub fn new(store: Arc<dyn RemoteMailStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn select(&self) -> Result<MailboxStatus> {
        debug!("selecting remote folder {}", self.path);
        self.store.select(&self.path).await
    }

    pub async fn status(&self) -> Result<MailboxStatus> {
        self.store.status(&self.path).await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close(&self.path).await
    }

    pub async fn fetch_flags(&self, first: Uid, last: Uid) -> Result<Vec<RemoteMessage>> {
        self.store.fetch_flags(&self.path, first, last).await
    }

    pub async fn list_uids(&self, first: Uid, last: Uid) -> Result<Vec<Uid>> {
        self.store.list_uids(&self.path, first, last).await
    }

    pub async fn fetch_messages(&self, uids: &[Uid]) -> Result<Vec<(Uid, MessageContent)>> {
        self.store.fetch_messages(&self.path, uids).await
    }

    pub async fn fetch_message(&self, uid: Uid) -> Result<MessageContent> {
        self.store.fetch_message(&self.path, uid).await
    }

    pub async fn fetch_envelopes(&self, uids: &[Uid]) -> Result<Vec<MessageEnvelope>> {
        self.store.fetch_envelopes(&self.path, uids).await
    }

    pub async fn append(
        &self,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> Result<Option<Uid>> {
        self.store
            .append(&self.path, flags, internal_date, body)
            .await
    }

    pub async fn copy_message(&self, uid: Uid, dest: &str) -> Result<Option<Uid>> {
        debug!("copying remote message {uid} from {} to {dest}", self.path);
        self.store.copy_message(&self.path, uid, dest).await
    }

    pub async fn store_flags(&self, uids: &[Uid], add: Flags, remove: Flags) -> Result<()> {
        self.store.store_flags(&self.path, uids, add, remove).await
    }

    pub async fn expunge(&self, uids: &[Uid]) -> Result<()> {
        debug!("expunging {} remote message(s) from {}", uids.len(), self.path);
        self.store.expunge(&self.path, uids).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Uid>> {
        self.store.search(&self.path, query).await
    }

    pub async fn set_timeout_hint(&self, timeout: Option<Duration>) -> Result<()> {
        self.store.set_timeout_hint(timeout).await
    }
}
