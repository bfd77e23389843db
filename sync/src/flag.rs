//! # Message flags
//!
//! Module dedicated to message flags. The main structure of this
//! module is [`Flags`], a bitmask over the standard IMAP system flags
//! plus room for flags only the local store can represent.
//!
//! The three-way merge used by the synchronization engine lives here
//! as well, see [`Flags::merge`].

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

/// A message flag bitmask.
///
/// The low bits map one-to-one to IMAP system flags; higher bits are
/// reserved for flags the local store tracks but the remote server
/// cannot represent (they survive merges but are never pushed).
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Flags(u32);

impl Flags {
    pub const SEEN: Flags = Flags(1 << 0);
    pub const ANSWERED: Flags = Flags(1 << 1);
    pub const FLAGGED: Flags = Flags(1 << 2);
    pub const DELETED: Flags = Flags(1 << 3);
    pub const DRAFT: Flags = Flags(1 << 4);

    /// Local-only flag: the message has been forwarded. Kept out of
    /// the IMAP mask since `$Forwarded` support is not assumed.
    pub const FORWARDED: Flags = Flags(1 << 8);

    /// The subset of bits the remote server can represent.
    pub const IMAP_MASK: Flags =
        Flags(Self::SEEN.0 | Self::ANSWERED.0 | Self::FLAGGED.0 | Self::DELETED.0 | Self::DRAFT.0);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Projects the bitmask onto the server-representable subset.
    pub const fn imap_only(self) -> Flags {
        Flags(self.0 & Self::IMAP_MASK.0)
    }

    /// Three-way flag merge.
    ///
    /// Given the current `local` flags, the `tracked` flags as of the
    /// last sync, and the current `remote` flags, returns the merged
    /// flag set. A flag present in `tracked` survives only when both
    /// sides still carry it: a removal on either side wins. A flag
    /// absent from `tracked` is adopted from whichever side carries
    /// it.
    ///
    /// Because untracked flags are adopted from either side, a flag
    /// set and cleared again on one side between two passes comes
    /// back from the other side; see the
    /// `merge_readopts_untracked_flag_cleared_on_one_side` test.
    pub fn merge(local: Flags, tracked: Flags, remote: Flags) -> Flags {
        tracked & (local & remote) | !tracked & (local | remote)
    }

    /// Computes the selective STORE operations needed to move the
    /// remote flag set from `remote` to `target`.
    ///
    /// Returns `(to_add, to_remove)`, both restricted to the IMAP
    /// mask. Differences are pushed as separate add/remove STOREs
    /// rather than a blind overwrite so that server-side keywords the
    /// local store does not represent are left untouched.
    pub fn remote_diff(remote: Flags, target: Flags) -> (Flags, Flags) {
        let remote = remote.imap_only();
        let target = target.imap_only();
        (target & !remote, remote & !target)
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl BitAndAssign for Flags {
    fn bitand_assign(&mut self, rhs: Flags) {
        self.0 &= rhs.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl Not for Flags {
    type Output = Flags;

    fn not(self) -> Flags {
        Flags(!self.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SEEN, "\\Seen"),
            (Self::ANSWERED, "\\Answered"),
            (Self::FLAGGED, "\\Flagged"),
            (Self::DELETED, "\\Deleted"),
            (Self::DRAFT, "\\Draft"),
            (Self::FORWARDED, "$Forwarded"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({self})")
    }
}
