//! Per-object liveness tracking for a generational semispace collector.
//!
//! The collector has a non-aging nursery (young generation) and a semispace
//! old generation. A minor collection evacuates survivors of the nursery
//! into old to-space; a full collection flips the old semispaces and
//! evacuates the old generation. Outside of an analysis phase every object
//! has exactly one address; during analysis an object may be known by its
//! from-space address, its to-space address, or both, and only the end of
//! the analysis decides whether it survived.
//!
//! Each transition belongs to one kind of collection. A transition reported
//! with the other kind means the tracker and the collector disagree about
//! the heap and is refused as a protocol violation.

use crate::{Address, ObjectStatus, TeleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Minor,
    Full,
}

impl CollectionKind {
    #[inline]
    pub fn from_minor(minor: bool) -> Self {
        if minor {
            CollectionKind::Minor
        } else {
            CollectionKind::Full
        }
    }

    #[inline]
    pub fn is_minor(self) -> bool {
        self == CollectionKind::Minor
    }
}

impl core::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CollectionKind::Minor => write!(f, "minor"),
            CollectionKind::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcPhaseState {
    /// Nursery object, mutating phase.
    YoungLive,
    /// Nursery object during a minor analysis, no copy seen yet.
    YoungUnknown,
    /// Nursery object copied into old to-space; both addresses known.
    Promoted,
    /// Old to-space copy of a promoted object whose nursery address is not
    /// known.
    OldPromoted,
    /// Old object, mutating phase (or untouched by a minor analysis).
    OldLive,
    /// Old object in from-space during analysis, no copy seen yet.
    OldUnknown,
    /// Old to-space copy whose from-space address is not known.
    OldTo,
    /// Old object copied within the old generation; both addresses known.
    OldFromTo,
    Dead,
}

impl GcPhaseState {
    pub fn label(self) -> &'static str {
        match self {
            GcPhaseState::YoungLive => "LIVE(young)",
            GcPhaseState::YoungUnknown => "UNKNOWN(young, analyzing)",
            GcPhaseState::Promoted => "LIVE(promoted, from+to)",
            GcPhaseState::OldPromoted => "LIVE(promoted, to only)",
            GcPhaseState::OldLive => "LIVE(old)",
            GcPhaseState::OldUnknown => "UNKNOWN(old, from only)",
            GcPhaseState::OldTo => "LIVE(old, to only)",
            GcPhaseState::OldFromTo => "LIVE(old, from+to)",
            GcPhaseState::Dead => "DEAD",
        }
    }

    pub fn status(self) -> ObjectStatus {
        match self {
            GcPhaseState::YoungUnknown | GcPhaseState::OldUnknown => {
                ObjectStatus::Unknown
            }
            GcPhaseState::Dead => ObjectStatus::Dead,
            _ => ObjectStatus::Live,
        }
    }

    /// Both a from- and a to-address are known.
    #[inline]
    pub fn is_forwarded(self) -> bool {
        matches!(self, GcPhaseState::Promoted | GcPhaseState::OldFromTo)
    }

    /// Only legal while an analysis phase is in progress.
    #[inline]
    pub fn is_analyzing(self) -> bool {
        !matches!(
            self,
            GcPhaseState::YoungLive | GcPhaseState::OldLive | GcPhaseState::Dead
        )
    }
}

impl core::fmt::Display for GcPhaseState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// State of one object as seen through collector phase notifications.
///
/// All queries are pure projections of the current state.
#[derive(Debug, Clone)]
pub struct GcPhaseTracker {
    state: GcPhaseState,
    // to-space address once known, otherwise the from-space address
    origin: Address,
    // from-space address in the two forwarded states
    alternate: Option<Address>,
    // collection the object is being analyzed under
    analysis: Option<CollectionKind>,
    prior_status: Option<ObjectStatus>,
}

impl GcPhaseTracker {
    fn seed(
        state: GcPhaseState,
        origin: Address,
        alternate: Option<Address>,
        analysis: Option<CollectionKind>,
    ) -> Self {
        Self {
            state,
            origin,
            alternate,
            analysis,
            prior_status: None,
        }
    }

    /// Object first seen while the heap is mutating.
    pub fn create_live(origin: Address, young: bool) -> Self {
        let state = if young {
            GcPhaseState::YoungLive
        } else {
            GcPhaseState::OldLive
        };
        Self::seed(state, origin, None, None)
    }

    /// Object first seen in old to-space during an analysis. A promoted
    /// copy can only appear during a minor collection.
    pub fn create_old_to(
        to: Address,
        promoted: bool,
        kind: CollectionKind,
    ) -> Result<Self, TeleError> {
        if promoted {
            require_minor("create_old_to", kind)?;
            Ok(Self::seed(GcPhaseState::OldPromoted, to, None, Some(kind)))
        } else {
            Ok(Self::seed(GcPhaseState::OldTo, to, None, Some(kind)))
        }
    }

    /// Object first seen at a from-space address with no copy yet.
    pub fn create_from_only(
        from: Address,
        young: bool,
        kind: CollectionKind,
    ) -> Result<Self, TeleError> {
        if young {
            require_minor("create_from_only", kind)?;
            Ok(Self::seed(GcPhaseState::YoungUnknown, from, None, Some(kind)))
        } else {
            Ok(Self::seed(GcPhaseState::OldUnknown, from, None, Some(kind)))
        }
    }

    /// Object first seen after it was already copied.
    pub fn create_from_to(
        from: Address,
        to: Address,
        young: bool,
        kind: CollectionKind,
    ) -> Result<Self, TeleError> {
        if young {
            require_minor("create_from_to", kind)?;
            Ok(Self::seed(GcPhaseState::Promoted, to, Some(from), Some(kind)))
        } else {
            Ok(Self::seed(GcPhaseState::OldFromTo, to, Some(from), Some(kind)))
        }
    }

    // ── Projections ────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> GcPhaseState {
        self.state
    }

    #[inline]
    pub fn status(&self) -> ObjectStatus {
        self.state.status()
    }

    #[inline]
    pub fn prior_status(&self) -> Option<ObjectStatus> {
        self.prior_status
    }

    /// Current address. A dead object keeps its last known address for
    /// diagnostics.
    #[inline]
    pub fn origin(&self) -> Address {
        self.origin
    }

    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.state.is_forwarded()
    }

    /// The from-space address the object was copied from, while known.
    #[inline]
    pub fn forwarded_from(&self) -> Option<Address> {
        if self.state.is_forwarded() {
            self.alternate
        } else {
            None
        }
    }

    /// Every address the object is currently known by.
    pub fn known_origins(&self) -> impl Iterator<Item = Address> + use<> {
        [Some(self.origin), self.forwarded_from()].into_iter().flatten()
    }

    #[inline]
    pub fn analysis(&self) -> Option<CollectionKind> {
        self.analysis
    }

    // ── Transitions ────────────────────────────────────────────────

    pub fn analysis_begins(
        &mut self,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        match (self.state, kind) {
            (GcPhaseState::YoungLive, CollectionKind::Minor) => {
                self.enter(GcPhaseState::YoungUnknown, Some(kind));
            }
            // old objects sit out minor collections
            (GcPhaseState::OldLive, CollectionKind::Minor) => {}
            (GcPhaseState::OldLive, CollectionKind::Full) => {
                self.enter(GcPhaseState::OldUnknown, Some(kind));
            }
            _ => return Err(self.illegal("analysis_begins", kind)),
        }
        Ok(())
    }

    pub fn analysis_ends(
        &mut self,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        match self.state {
            GcPhaseState::OldLive if kind.is_minor() => {}
            GcPhaseState::YoungUnknown | GcPhaseState::OldUnknown
                if self.analyzed_under(kind) =>
            {
                self.alternate = None;
                self.enter(GcPhaseState::Dead, None);
            }
            GcPhaseState::Promoted
            | GcPhaseState::OldPromoted
            | GcPhaseState::OldTo
            | GcPhaseState::OldFromTo
                if self.analyzed_under(kind) =>
            {
                self.alternate = None;
                self.enter(GcPhaseState::OldLive, None);
            }
            _ => return Err(self.illegal("analysis_ends", kind)),
        }
        Ok(())
    }

    /// The collector copied this object to `to`.
    pub fn add_to_origin(
        &mut self,
        to: Address,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        let next = match self.state {
            GcPhaseState::YoungUnknown if self.analyzed_under(kind) => {
                GcPhaseState::Promoted
            }
            GcPhaseState::OldUnknown if self.analyzed_under(kind) => {
                GcPhaseState::OldFromTo
            }
            _ => return Err(self.illegal("add_to_origin", kind)),
        };
        self.alternate = Some(self.origin);
        self.origin = to;
        self.enter(next, self.analysis);
        Ok(())
    }

    /// This object is the copy of the one at `from`.
    pub fn add_from_origin(
        &mut self,
        from: Address,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        let next = match self.state {
            GcPhaseState::OldPromoted if self.analyzed_under(kind) => {
                GcPhaseState::Promoted
            }
            GcPhaseState::OldTo if self.analyzed_under(kind) => {
                GcPhaseState::OldFromTo
            }
            _ => return Err(self.illegal("add_from_origin", kind)),
        };
        self.alternate = Some(from);
        self.enter(next, self.analysis);
        Ok(())
    }

    #[inline]
    fn analyzed_under(&self, kind: CollectionKind) -> bool {
        self.analysis == Some(kind)
    }

    fn enter(&mut self, state: GcPhaseState, analysis: Option<CollectionKind>) {
        self.prior_status = Some(self.state.status());
        self.state = state;
        self.analysis = analysis;
    }

    fn illegal(&self, operation: &'static str, kind: CollectionKind) -> TeleError {
        let during = match self.analysis {
            Some(current) => format!(" (analyzing under {current})"),
            None => String::new(),
        };
        TeleError::violation(
            operation,
            format!(
                "{kind} transition from {} at {}{during}",
                self.state, self.origin
            ),
        )
    }
}

impl core::fmt::Display for GcPhaseTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} origin: {}", self.state, self.origin)?;
        if let Some(alternate) = self.alternate {
            write!(f, " alt: {alternate}")?;
        }
        Ok(())
    }
}

fn require_minor(
    operation: &'static str,
    kind: CollectionKind,
) -> Result<(), TeleError> {
    if kind.is_minor() {
        Ok(())
    } else {
        Err(TeleError::violation(
            operation,
            "young or promoted objects only exist during minor collections",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CollectionKind::{Full, Minor};

    fn addr(raw: u64) -> Address {
        Address::new(raw).expect("non-zero")
    }

    fn assert_violation(result: Result<(), TeleError>) {
        assert!(
            matches!(result, Err(TeleError::ProtocolViolation { .. })),
            "expected protocol violation, got {result:?}"
        );
    }

    #[test]
    fn young_object_promoted_by_minor_collection() {
        let a = addr(0x3000_0000);
        let b = addr(0x4000_0040);
        let mut t = GcPhaseTracker::create_live(a, true);
        assert_eq!(t.state(), GcPhaseState::YoungLive);

        t.analysis_begins(Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::YoungUnknown);
        assert_eq!(t.origin(), a);
        assert_eq!(t.status(), ObjectStatus::Unknown);

        t.add_to_origin(b, Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::Promoted);
        assert_eq!(t.origin(), b);
        assert!(t.is_forwarded());
        assert_eq!(t.forwarded_from(), Some(a));

        t.analysis_ends(Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldLive);
        assert_eq!(t.origin(), b);
        assert!(!t.is_forwarded());
        assert_eq!(t.forwarded_from(), None);
        assert_eq!(t.prior_status(), Some(ObjectStatus::Live));
    }

    #[test]
    fn unforwarded_old_object_dies_and_keeps_origin() {
        let c = addr(0x5000_0080);
        let mut t = GcPhaseTracker::create_from_only(c, false, Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldUnknown);

        t.analysis_ends(Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::Dead);
        assert_eq!(t.status(), ObjectStatus::Dead);
        assert_eq!(t.origin(), c);
    }

    #[test]
    fn old_object_survives_full_collection() {
        let from = addr(0x4000_0000);
        let to = addr(0x5000_0000);
        let mut t = GcPhaseTracker::create_live(from, false);

        t.analysis_begins(Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldUnknown);
        t.add_to_origin(to, Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldFromTo);
        assert_eq!(t.forwarded_from(), Some(from));
        t.analysis_ends(Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldLive);
        assert_eq!(t.origin(), to);
    }

    #[test]
    fn old_object_dies_in_full_collection() {
        let mut t = GcPhaseTracker::create_live(addr(0x4000_0000), false);
        t.analysis_begins(Full).expect("legal");
        t.analysis_ends(Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::Dead);
    }

    #[test]
    fn old_object_sits_out_minor_collection() {
        let o = addr(0x4000_0000);
        let mut t = GcPhaseTracker::create_live(o, false);
        t.analysis_begins(Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldLive);
        t.analysis_ends(Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldLive);
        assert_eq!(t.origin(), o);
    }

    #[test]
    fn to_only_copies_learn_their_from_address() {
        let from = addr(0x3000_0020);
        let to = addr(0x4000_0100);
        let mut t = GcPhaseTracker::create_old_to(to, true, Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldPromoted);
        t.add_from_origin(from, Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::Promoted);
        assert_eq!(t.forwarded_from(), Some(from));
        assert_eq!(t.known_origins().collect::<Vec<_>>(), vec![to, from]);

        let mut t = GcPhaseTracker::create_old_to(to, false, Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldTo);
        t.add_from_origin(from, Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldFromTo);
        t.analysis_ends(Full).expect("legal");
        assert_eq!(t.state(), GcPhaseState::OldLive);
    }

    #[test]
    fn young_constructors_require_minor_collection() {
        let a = addr(0x3000_0000);
        let b = addr(0x4000_0000);
        assert!(GcPhaseTracker::create_old_to(b, true, Full).is_err());
        assert!(GcPhaseTracker::create_from_only(a, true, Full).is_err());
        assert!(GcPhaseTracker::create_from_to(a, b, true, Full).is_err());
        let t = GcPhaseTracker::create_from_to(a, b, true, Minor).expect("legal");
        assert_eq!(t.state(), GcPhaseState::Promoted);
        assert_eq!(t.origin(), b);
    }

    #[test]
    fn young_live_rejects_full_analysis() {
        let mut t = GcPhaseTracker::create_live(addr(0x3000_0000), true);
        assert_violation(t.analysis_begins(Full));
        assert_eq!(t.state(), GcPhaseState::YoungLive);
    }

    #[test]
    fn every_state_rejects_the_wrong_collection_kind() {
        let a = addr(0x3000_0000);
        let b = addr(0x4000_0000);

        let trackers = [
            GcPhaseTracker::create_live(a, true),
            GcPhaseTracker::create_from_only(a, true, Minor).expect("legal"),
            GcPhaseTracker::create_from_to(a, b, true, Minor).expect("legal"),
            GcPhaseTracker::create_old_to(b, true, Minor).expect("legal"),
            GcPhaseTracker::create_from_only(a, false, Full).expect("legal"),
            GcPhaseTracker::create_old_to(b, false, Full).expect("legal"),
            GcPhaseTracker::create_from_to(a, b, false, Full).expect("legal"),
        ];

        for tracker in trackers {
            let wrong = match tracker.analysis() {
                Some(kind) if kind.is_minor() => Full,
                Some(_) => Minor,
                None => Full,
            };
            let mut t = tracker.clone();
            assert_violation(t.analysis_ends(wrong));
            let mut t = tracker.clone();
            assert_violation(t.add_to_origin(b, wrong));
            let mut t = tracker.clone();
            assert_violation(t.add_from_origin(a, wrong));
            if tracker.state().is_analyzing() {
                let mut t = tracker.clone();
                assert_violation(t.analysis_begins(Minor));
                assert_violation(t.analysis_begins(Full));
            }
            assert_eq!(t.state(), tracker.state());
        }

        let mut old = GcPhaseTracker::create_live(b, false);
        assert_violation(old.analysis_ends(Full));
    }

    #[test]
    fn dead_is_terminal() {
        let mut t = GcPhaseTracker::create_from_only(addr(0x40), false, Full).expect("legal");
        t.analysis_ends(Full).expect("legal");
        assert_violation(t.analysis_begins(Minor));
        assert_violation(t.analysis_begins(Full));
        assert_violation(t.analysis_ends(Full));
        assert_violation(t.add_to_origin(addr(0x80), Full));
        assert_eq!(t.state(), GcPhaseState::Dead);
    }

    #[test]
    fn queries_do_not_perturb_state() {
        let t = GcPhaseTracker::create_from_to(addr(0x10), addr(0x20), false, Full)
            .expect("legal");
        for _ in 0..3 {
            assert_eq!(t.status(), ObjectStatus::Live);
            assert_eq!(t.origin(), addr(0x20));
            assert!(t.is_forwarded());
            assert_eq!(t.forwarded_from(), Some(addr(0x10)));
        }
        assert_eq!(t.state(), GcPhaseState::OldFromTo);
        assert_eq!(t.prior_status(), None);
    }
}
