//! Rust library to synchronize mailboxes over IMAP.
//!
//! The main purpose of this library is to reconcile the state of a
//! remote IMAP account with a local mailbox store: folder
//! creation/rename/deletion and message addition/deletion/flag
//! changes are propagated in both directions, and enough state is
//! persisted between runs to resume incrementally after an
//! interruption.
//!
//! The engine itself does not speak the IMAP wire protocol and does
//! not own the local storage. Both sides are consumed through the
//! [`backend::RemoteMailStore`] and [`backend::LocalMailStore`]
//! traits, and persisted associations live behind
//! [`tracker::TrackerStore`]. The entry point is
//! [`sync::SyncSession`], which drives one account synchronization
//! from start to finish:
//!
//! - folder reconciliation ([`folder::sync`]): associate remote
//!   listings with local folders, create/rename/delete on either
//!   side;
//! - message reconciliation ([`message::sync`]): converge message
//!   existence and flags per associated folder pair, either from a
//!   full flag listing or from the local change log;
//! - deferred appends ([`message::append`]): messages new to the
//!   remote side are appended at the end of the session, with
//!   deduplication for servers whose APPEND does not return a UID.

pub mod backend;
pub mod config;
pub mod flag;
pub mod folder;
pub mod message;
pub mod sync;
pub mod tracker;

#[doc(inline)]
pub use crate::{
    config::{SyncConfig, SyncPolicy},
    flag::Flags,
    sync::{SyncReport, SyncSession},
};

/// The global `Error` alias of the library.
pub type Error = anyhow::Error;

/// The global `Result` alias of the library.
pub type Result<T> = anyhow::Result<T>;
