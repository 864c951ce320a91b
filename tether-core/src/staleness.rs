//! Staleness marks for live instances.
//!
//! A live instance is stale when its locally known version is older than
//! the record's current version in the store. Marks are ordered so that
//! applying them is idempotent: merging an equal-or-weaker mark changes
//! nothing, and `Always` absorbs everything else.

use serde::{Deserialize, Serialize};

use crate::RecordVersion;

/// Staleness mark carried by a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Staleness {
    /// The instance's known version matches the latest observed version.
    #[default]
    Fresh,
    /// The store holds `latest`; the instance knows an older version.
    Behind { latest: RecordVersion },
    /// Maximal mark used when cascading to a work-unit delegate, whose own
    /// version is not comparable at this layer. Once set, only a saved
    /// notification resets it.
    Always,
}

impl Staleness {
    /// Construct a `Behind` mark for the given store version.
    pub fn behind(latest: RecordVersion) -> Self {
        Self::Behind { latest }
    }

    /// True for any mark other than `Fresh`.
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }

    /// Merge an incoming mark into this one, returning the stronger of the
    /// two. `Fresh < Behind{v} < Behind{v'} (v < v') < Always`.
    pub fn merged(self, incoming: Staleness) -> Staleness {
        match (self, incoming) {
            (Self::Always, _) | (_, Self::Always) => Self::Always,
            (Self::Fresh, other) | (other, Self::Fresh) => other,
            (Self::Behind { latest: a }, Self::Behind { latest: b }) => Self::Behind {
                latest: a.max(b),
            },
        }
    }

    /// The store version this mark points at, if it carries one.
    pub fn target_version(&self) -> Option<RecordVersion> {
        match self {
            Self::Behind { latest } => Some(*latest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fresh_is_not_stale() {
        assert!(!Staleness::Fresh.is_stale());
        assert!(Staleness::behind(3).is_stale());
        assert!(Staleness::Always.is_stale());
    }

    #[test]
    fn test_merge_keeps_higher_version() {
        let merged = Staleness::behind(3).merged(Staleness::behind(5));
        assert_eq!(merged, Staleness::behind(5));

        let merged = Staleness::behind(5).merged(Staleness::behind(3));
        assert_eq!(merged, Staleness::behind(5));
    }

    #[test]
    fn test_always_absorbs_everything() {
        assert_eq!(Staleness::Always.merged(Staleness::behind(99)), Staleness::Always);
        assert_eq!(Staleness::behind(99).merged(Staleness::Always), Staleness::Always);
        assert_eq!(Staleness::Always.merged(Staleness::Fresh), Staleness::Always);
    }

    #[test]
    fn test_target_version() {
        assert_eq!(Staleness::behind(7).target_version(), Some(7));
        assert_eq!(Staleness::Fresh.target_version(), None);
        assert_eq!(Staleness::Always.target_version(), None);
    }

    fn arb_mark() -> impl Strategy<Value = Staleness> {
        prop_oneof![
            Just(Staleness::Fresh),
            (1i64..1000).prop_map(Staleness::behind),
            Just(Staleness::Always),
        ]
    }

    proptest! {
        /// Merging is idempotent: applying the same mark twice is the same
        /// as applying it once.
        #[test]
        fn prop_merge_idempotent(a in arb_mark(), b in arb_mark()) {
            let once = a.merged(b);
            let twice = a.merged(b).merged(b);
            prop_assert_eq!(once, twice);
        }

        /// Merging never weakens a mark.
        #[test]
        fn prop_merge_monotone(a in arb_mark(), b in arb_mark()) {
            let merged = a.merged(b);
            prop_assert!(merged.is_stale() || (!a.is_stale() && !b.is_stale()));
            if let (Some(before), Some(after)) = (a.target_version(), merged.target_version()) {
                prop_assert!(after >= before);
            }
        }

        /// Merge order does not matter.
        #[test]
        fn prop_merge_commutative(a in arb_mark(), b in arb_mark()) {
            prop_assert_eq!(a.merged(b), b.merged(a));
        }
    }
}
