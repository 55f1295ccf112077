//! Segment health classification.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Health of a segment, as a set of flags.
///
/// `OK` is the empty set. The state is computed by the checker on every
/// run and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SegmentState(u16);

impl SegmentState {
    /// Nothing to do.
    pub const OK: Self = Self(0);
    /// Holes or out-of-order data that a repack can reclaim.
    pub const DIRTY: Self = Self(0x01);
    /// The index disagrees with the data on disk.
    pub const UNALIGNED: Self = Self(0x02);
    /// Indexed but absent from disk.
    pub const MISSING: Self = Self(0x04);
    /// All data in the segment has been removed.
    pub const DELETED: Self = Self(0x08);
    /// Needs manual intervention.
    pub const CORRUPTED: Self = Self(0x10);
    /// Old enough to be archived.
    pub const ARCHIVE_AGE: Self = Self(0x20);
    /// Old enough to be deleted.
    pub const DELETE_AGE: Self = Self(0x40);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::DIRTY, "DIRTY"),
        (Self::UNALIGNED, "UNALIGNED"),
        (Self::MISSING, "MISSING"),
        (Self::DELETED, "DELETED"),
        (Self::CORRUPTED, "CORRUPTED"),
        (Self::ARCHIVE_AGE, "ARCHIVE_AGE"),
        (Self::DELETE_AGE, "DELETE_AGE"),
    ];

    const STRUCTURAL: u16 = 0x1f;

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns the union of both sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns this set without the flags in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if every flag of `other` is set. `contains(OK)` is
    /// always true.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Returns the state without the age flags.
    #[must_use]
    pub const fn structural(self) -> Self {
        Self(self.0 & Self::STRUCTURAL)
    }

    /// Replaces DIRTY with UNALIGNED.
    ///
    /// A dirty segment is normally safe to repack, but not when the offsets
    /// in the index cannot be trusted.
    #[must_use]
    pub const fn downgrade_dirty(self) -> Self {
        if self.contains(Self::DIRTY) {
            self.difference(Self::DIRTY).union(Self::UNALIGNED)
        } else {
            self
        }
    }
}

impl BitOr for SegmentState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for SegmentState {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("OK");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_empty() {
        assert!(SegmentState::OK.is_ok());
        assert!(SegmentState::DIRTY.contains(SegmentState::OK));
        assert!(!SegmentState::OK.contains(SegmentState::DIRTY));
    }

    #[test]
    fn union_and_difference() {
        let s = SegmentState::DIRTY | SegmentState::ARCHIVE_AGE;
        assert!(s.contains(SegmentState::DIRTY));
        assert!(s.contains(SegmentState::ARCHIVE_AGE));
        assert_eq!(s.difference(SegmentState::DIRTY), SegmentState::ARCHIVE_AGE);
        assert_eq!(s.structural(), SegmentState::DIRTY);
    }

    #[test]
    fn downgrade_replaces_dirty_only() {
        let s = (SegmentState::DIRTY | SegmentState::DELETE_AGE).downgrade_dirty();
        assert_eq!(s, SegmentState::UNALIGNED | SegmentState::DELETE_AGE);
        assert_eq!(SegmentState::OK.downgrade_dirty(), SegmentState::OK);
        assert_eq!(
            SegmentState::CORRUPTED.downgrade_dirty(),
            SegmentState::CORRUPTED
        );
    }

    #[test]
    fn display_lists_flags() {
        assert_eq!(SegmentState::OK.to_string(), "OK");
        assert_eq!(
            (SegmentState::ARCHIVE_AGE | SegmentState::DIRTY).to_string(),
            "DIRTY|ARCHIVE_AGE"
        );
    }
}
