//! # Remote appender
//!
//! Module dedicated to appending local messages to the remote
//! account. On servers advertising UIDPLUS the APPEND response
//! carries the new UID directly; everywhere else the [`Appender`]
//! resolves it by bracketing UIDNEXT around the append, matching
//! candidate envelopes on size and Message-ID, and falling back to a
//! bounded SEARCH. An append that still cannot be resolved yields
//! [`UID_UNASSIGNED`] and is repaired on a later pass.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    backend::{self, remote::RemoteFolder, RemoteCapabilities, Uid, UID_UNASSIGNED},
    config::SyncConfig,
    flag::Flags,
    message::{LocalMessage, MessageEnvelope, SearchQuery},
};

/// Appends messages to one remote folder and resolves their UIDs.
pub struct Appender<'a> {
    remote: &'a RemoteFolder,
    caps: &'a RemoteCapabilities,
    config: &'a SyncConfig,
}

impl<'a> Appender<'a> {
    pub fn new(
        remote: &'a RemoteFolder,
        caps: &'a RemoteCapabilities,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            remote,
            caps,
            config,
        }
    }

    /// Appends the message and returns its UID, or [`UID_UNASSIGNED`]
    /// when it could not be resolved.
    pub async fn append(
        &self,
        local: &LocalMessage,
        flags: Flags,
        internal_date: Option<DateTime<Utc>>,
        body: &[u8],
    ) -> backend::Result<Uid> {
        if self.caps.has_append_uid() {
            if let Some(uid) = self
                .remote
                .append(flags.imap_only(), internal_date, body)
                .await?
            {
                return Ok(uid);
            }
            // Fall through: the server advertised UIDPLUS but did not
            // report the UID.
        }

        let before = self.remote.status().await?.uid_next;
        self.remote
            .append(flags.imap_only(), internal_date, body)
            .await?;
        let after = self.remote.status().await?.uid_next;

        if after > before {
            let candidates = self
                .remote
                .fetch_envelopes(&self.remote.list_uids(before, after - 1).await?)
                .await?;
            let (matched, _) = find_match(candidates, local.size, local.message_id.as_deref());
            if let Some(envelope) = matched {
                debug!(
                    "resolved appended message {} to uid {} by uid next bracket",
                    local.id, envelope.uid
                );
                return Ok(envelope.uid);
            }
        }

        if self.caps.search {
            if let Some(uid) = self.search_fallback(local).await? {
                return Ok(uid);
            }
        }

        warn!(
            "cannot resolve uid of appended message {}, deferring to a later pass",
            local.id
        );
        Ok(UID_UNASSIGNED)
    }

    /// Bounded SEARCH fallback, with a loosened timeout hint.
    async fn search_fallback(&self, local: &LocalMessage) -> backend::Result<Option<Uid>> {
        let query = SearchQuery {
            subject: local.subject.clone(),
            date: local.date.map(|d| d.date_naive()),
        };

        self.remote
            .set_timeout_hint(self.config.slow_command_timeout)
            .await?;
        let found = self.remote.search(&query).await;
        self.remote.set_timeout_hint(None).await?;
        let mut uids = found?;

        // Most recent candidates only.
        uids.sort_unstable();
        let limit = self.config.search_fallback_limit;
        if uids.len() > limit {
            uids.drain(..uids.len() - limit);
        }

        for batch in uids.rchunks(self.config.fetch_batch_size) {
            let candidates = self.remote.fetch_envelopes(batch).await?;
            let (matched, _) = find_match(candidates, local.size, local.message_id.as_deref());
            if let Some(envelope) = matched {
                debug!(
                    "resolved appended message {} to uid {} by search",
                    local.id, envelope.uid
                );
                return Ok(Some(envelope.uid));
            }
        }

        Ok(None)
    }
}

/// Picks the candidate matching the appended message, returning it
/// and the remaining candidates.
///
/// A candidate matches on exact size; when both sides carry a
/// Message-ID the ids must agree as well. Sizes are as reported by
/// the server, so implementations feeding this must not re-encode
/// bodies between append and fetch.
pub fn find_match(
    candidates: Vec<MessageEnvelope>,
    size: u32,
    message_id: Option<&str>,
) -> (Option<MessageEnvelope>, Vec<MessageEnvelope>) {
    let mut matched = None;
    let mut remaining = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if matched.is_none() && candidate_matches(&candidate, size, message_id) {
            matched = Some(candidate);
        } else {
            remaining.push(candidate);
        }
    }
    (matched, remaining)
}

fn candidate_matches(candidate: &MessageEnvelope, size: u32, message_id: Option<&str>) -> bool {
    if candidate.size != size {
        return false;
    }
    match (candidate.message_id.as_deref(), message_id) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}
