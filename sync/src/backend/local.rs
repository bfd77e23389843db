//! # Local folder handle
//!
//! A [`LocalFolder`] binds the local store to one folder id, the
//! local counterpart of [`super::remote::RemoteFolder`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{flag::Flags, folder::Folder, message::LocalMessage};

use super::{FolderId, ItemId, LocalMailStore, Result};

/// One local folder, bound to its id.
#[derive(Clone)]
pub struct LocalFolder {
    store: Arc<dyn LocalMailStore>,
    folder: Folder,
}

impl LocalFolder {
    pub fn new(store: Arc<dyn LocalMailStore>, folder: Folder) -> Self {
        Self { store, folder }
    }

    pub fn id(&self) -> FolderId {
        self.folder.id
    }

    pub fn path(&self) -> &str {
        &self.folder.path
    }

    pub fn folder(&self) -> &Folder {
        &self.folder
    }

    pub async fn list_message_ids(&self) -> Result<Vec<ItemId>> {
        self.store.list_message_ids(self.folder.id).await
    }

    pub async fn message(&self, id: ItemId) -> Result<Option<LocalMessage>> {
        self.store.message(id).await
    }

    pub async fn message_body(&self, id: ItemId) -> Result<Vec<u8>> {
        self.store.message_body(id).await
    }

    pub async fn add_message(
        &self,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> Result<ItemId> {
        self.store
            .add_message(self.folder.id, flags, internal_date, body)
            .await
    }

    pub async fn set_flags(&self, id: ItemId, flags: Flags) -> Result<()> {
        self.store.set_flags(id, flags).await
    }

    pub async fn delete_message(&self, id: ItemId) -> Result<()> {
        debug!("deleting local message {id} from {}", self.folder.path);
        self.store.delete_message(id).await
    }

    pub async fn empty(&self) -> Result<()> {
        debug!("emptying local folder {}", self.folder.path);
        self.store.empty_folder(self.folder.id).await
    }
}
