//! # Message module
//!
//! Module dedicated to message management. It gathers the value types
//! exchanged between the reconciliation engine and the two stores:
//! flag listings, full message contents, envelope summaries used for
//! append deduplication, and local message metadata.
//!
//! The [`sync`] module contains the message reconciler, [`append`]
//! the deferred remote appender.

pub mod append;
pub mod sync;

use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    backend::{FolderId, ItemId, Uid},
    flag::Flags,
};

/// One remote message as returned by a flag listing (UID FETCH of
/// flags only).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteMessage {
    pub uid: Uid,
    pub flags: Flags,
}

/// A full remote message body with its metadata, as returned by a
/// body fetch or passed to an append.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageContent {
    pub body: Vec<u8>,
    pub flags: Flags,
    pub internal_date: Option<DateTime<Utc>>,
}

/// An envelope summary of a remote message, used to match appended
/// messages on servers whose APPEND does not return the new UID.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageEnvelope {
    pub uid: Uid,
    pub size: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// A search query for the bounded SEARCH fallback of the appender.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchQuery {
    /// Match on the Subject header, when the message has one.
    pub subject: Option<String>,

    /// Match on the internal date (SENTON day granularity).
    pub date: Option<NaiveDate>,
}

/// Metadata of one local message, as exposed by the local mail store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalMessage {
    pub id: ItemId,
    pub folder_id: FolderId,
    pub flags: Flags,
    pub size: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
}
