//! # Folder module
//!
//! Module dedicated to folder (as known as mailbox) management.
//!
//! The main entities are [`Folder`], the local side of a folder pair,
//! and [`ListingEntry`], one row of a remote LIST response. The
//! module also owns the ordering and path translation rules the
//! reconciliation engine relies on: INBOX is always processed first
//! and deeper paths before shallower ones, so that folder deletions
//! see children before parents.
//!
//! The [`sync`] module contains the folder reconciler itself.

pub mod sync;

use std::{cmp::Reverse, collections::HashSet, fmt, str::FromStr};

use thiserror::Error;
use tracing::warn;

use crate::backend::FolderId;

pub const INBOX: &str = "INBOX";
pub const SENT: &str = "Sent";
pub const DRAFTS: &str = "Drafts";
pub const TRASH: &str = "Trash";
pub const JUNK: &str = "Junk";

/// The hierarchy separator used by local folder paths.
pub const LOCAL_SEPARATOR: char = '/';

/// Characters a local folder name cannot contain (besides the local
/// hierarchy separator, which is handled by delimiter translation).
const ILLEGAL_LOCAL_CHARS: &[char] = &[':', '"'];

/// Error dedicated to folder kind parsing.
#[derive(Debug, Error)]
#[error("cannot parse folder kind from {0}")]
pub struct ParseFolderKindError(String);

/// The folder kind enumeration.
///
/// Folder kinds categorize the recognized IMAP special-use folders. A
/// remote folder whose translated path collides with a local system
/// folder is only allowed to reuse it when the kinds agree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FolderKind {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
}

impl FolderKind {
    pub fn is_inbox(&self) -> bool {
        matches!(self, FolderKind::Inbox)
    }

    /// Return `true` if the given folder name matches this kind.
    pub fn matches(&self, name: impl AsRef<str>) -> bool {
        name.as_ref()
            .parse::<FolderKind>()
            .map(|kind| kind == *self)
            .unwrap_or_default()
    }
}

impl FromStr for FolderKind {
    type Err = ParseFolderKindError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_lowercase().as_str() {
            "inbox" => Ok(Self::Inbox),
            "sent" | "sent items" | "sent messages" => Ok(Self::Sent),
            "drafts" | "draft" => Ok(Self::Drafts),
            "trash" | "deleted items" => Ok(Self::Trash),
            "junk" | "junk e-mail" | "spam" => Ok(Self::Junk),
            unknown => Err(ParseFolderKindError(unknown.to_owned())),
        }
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox => write!(f, "{INBOX}"),
            Self::Sent => write!(f, "{SENT}"),
            Self::Drafts => write!(f, "{DRAFTS}"),
            Self::Trash => write!(f, "{TRASH}"),
            Self::Junk => write!(f, "{JUNK}"),
        }
    }
}

/// A local folder, as exposed by the local mail store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Folder {
    /// The local store identifier of the folder.
    pub id: FolderId,

    /// The full local path, `/`-separated.
    pub path: String,

    /// The recognized special-use kind, if any.
    pub kind: Option<FolderKind>,

    /// Whether the folder is a system folder the user cannot remove.
    pub system: bool,

    /// Whether synchronization is enabled for this folder. The engine
    /// may flip this to `false` on persistent failure.
    pub sync_enabled: bool,
}

impl Folder {
    /// Returns the leaf name of the folder.
    pub fn name(&self) -> &str {
        self.path
            .rsplit(LOCAL_SEPARATOR)
            .next()
            .unwrap_or(&self.path)
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// One row of a remote folder enumeration (LIST response). Ephemeral,
/// never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListingEntry {
    /// The remote folder path, in the remote hierarchy.
    pub path: String,

    /// The hierarchy delimiter advertised for this entry.
    pub delimiter: char,

    /// Whether the folder can be selected (`false` for `\Noselect`).
    pub selectable: bool,

    /// Whether the folder can hold children (`false` for
    /// `\Noinferiors` is `true` here, inverted).
    pub no_inferiors: bool,
}

/// Normalizes the case of the INBOX prefix of a remote path.
///
/// Some servers return the same folder differing only in the case of
/// the INBOX part; comparing normalized paths keeps such duplicates
/// from being tracked twice.
pub fn normalized_path(path: &str, delimiter: char) -> String {
    // `get` rejects both short paths and paths whose fifth byte falls
    // inside a multibyte character, which cannot be an INBOX prefix.
    let Some(prefix) = path.get(..5) else {
        return path.to_owned();
    };
    if !prefix.eq_ignore_ascii_case(INBOX) {
        return path.to_owned();
    }
    if path.len() == 5 {
        return INBOX.to_owned();
    }
    if path[5..].starts_with(delimiter) {
        format!("{INBOX}{}", &path[5..])
    } else {
        path.to_owned()
    }
}

/// Drops duplicate listing entries after path normalization.
pub fn dedupe_listing(entries: Vec<ListingEntry>) -> Vec<ListingEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut deduped = Vec::with_capacity(entries.len());
    for mut entry in entries {
        entry.path = normalized_path(&entry.path, entry.delimiter);
        if seen.insert(entry.path.clone()) {
            deduped.push(entry);
        } else {
            warn!("ignoring duplicate listing entry {}", entry.path);
        }
    }
    deduped
}

fn listing_rank(entry: &ListingEntry) -> u8 {
    if entry.path == INBOX {
        0
    } else if entry
        .path
        .strip_prefix(INBOX)
        .map(|rest| rest.starts_with(entry.delimiter))
        .unwrap_or_default()
    {
        1
    } else {
        2
    }
}

/// Sorts remote listing entries into processing order: INBOX first,
/// then INBOX's children, then all others, each group lexicographically
/// reversed so deeper paths are visited before shallower ones.
pub fn sort_listing(entries: &mut [ListingEntry]) {
    entries.sort_by(|a, b| {
        listing_rank(a)
            .cmp(&listing_rank(b))
            .then_with(|| Reverse(&a.path).cmp(&Reverse(&b.path)))
    });
}

/// Sorts local folders so children come before their parents.
pub fn sort_children_first(folders: &mut [Folder]) {
    folders.sort_by(|a, b| Reverse(&a.path).cmp(&Reverse(&b.path)));
}

/// Translates a remote path into its local counterpart.
///
/// The remote hierarchy delimiter becomes the local separator; any
/// occurrence of the local separator inside a remote segment is
/// swapped with the delimiter so it cannot fabricate hierarchy, and
/// characters a local folder name cannot contain are stripped. The
/// result is rooted under `root` (empty string for the mailbox root).
pub fn local_path_from_remote(remote: &str, delimiter: char, root: &str) -> String {
    let relative = if delimiter == LOCAL_SEPARATOR {
        remote.to_owned()
    } else {
        remote
            .split(delimiter)
            .map(|segment| {
                segment
                    .chars()
                    .map(|c| if c == LOCAL_SEPARATOR { delimiter } else { c })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join(&LOCAL_SEPARATOR.to_string())
    };
    let relative: String = relative
        .chars()
        .filter(|c| !ILLEGAL_LOCAL_CHARS.contains(c) && !c.is_control())
        .collect();
    let relative = relative.trim_start_matches(LOCAL_SEPARATOR);
    if root.is_empty() {
        relative.to_owned()
    } else {
        format!("{}{LOCAL_SEPARATOR}{relative}", root.trim_end_matches(LOCAL_SEPARATOR))
    }
}

/// Translates a local path into its remote counterpart.
///
/// Returns `None` when the folder lies outside the configured sync
/// root and is therefore not eligible for synchronization. The
/// translation is the exact inverse of [`local_path_from_remote`].
pub fn remote_path_from_local(local: &str, root: &str, delimiter: char) -> Option<String> {
    let relative = if root.is_empty() {
        local
    } else {
        let root = root.trim_end_matches(LOCAL_SEPARATOR);
        match local.strip_prefix(root) {
            Some(rest) if rest.starts_with(LOCAL_SEPARATOR) => &rest[1..],
            _ => return None,
        }
    };
    if relative.is_empty() {
        return None;
    }
    if delimiter == LOCAL_SEPARATOR {
        return Some(relative.to_owned());
    }
    let remote = relative
        .split(LOCAL_SEPARATOR)
        .map(|segment| {
            segment
                .chars()
                .map(|c| if c == delimiter { LOCAL_SEPARATOR } else { c })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(&delimiter.to_string());
    Some(remote)
}
