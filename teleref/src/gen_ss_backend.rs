//! Handles for a generational semispace collector, tracked by address.
//!
//! No root table: every handle carries a [`GcPhaseTracker`] and the backend
//! drives it from the collector's phase and relocation announcements. The
//! map is keyed by each handle's current origin; during an analysis the
//! from-space addresses of copied objects are kept in a second map so
//! lookups through stale addresses still find the canonical handle.

use std::collections::{HashMap, HashSet};

use ahash::RandomState;
use log::{debug, trace};

use crate::backend::ReferenceBackend;
use crate::canonical::{Forwarders, canonical_winner};
use crate::reference::{Session, WeakRef};
use crate::{
    Address, CollectionKind, Epoch, GcPhaseTracker, HeapRegion, ObjectStatus,
    ProcessChannel, RemoteRef, TeleError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapPhase {
    Mutating,
    Analyzing(CollectionKind),
}

impl core::fmt::Display for HeapPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapPhase::Mutating => write!(f, "mutating"),
            HeapPhase::Analyzing(kind) => write!(f, "analyzing ({kind})"),
        }
    }
}

pub(crate) struct GenSsBackend {
    session: Session,
    phase: HeapPhase,
    by_origin: HashMap<Address, WeakRef, RandomState>,
    by_from: HashMap<Address, WeakRef, RandomState>,
    forwarders: Forwarders,
    // dead handles debugger code still holds
    retired: Vec<WeakRef>,
    last_epoch: Option<Epoch>,
}

impl GenSsBackend {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            phase: HeapPhase::Mutating,
            by_origin: HashMap::default(),
            by_from: HashMap::default(),
            forwarders: Forwarders::default(),
            retired: Vec::new(),
            last_epoch: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> HeapPhase {
        self.phase
    }

    fn lookup(&self, address: Address) -> Option<RemoteRef> {
        self.by_origin
            .get(&address)
            .or_else(|| self.by_from.get(&address))
            .and_then(RemoteRef::upgrade)
    }

    /// Every canonical handle once, oldest first.
    fn canonical_handles(&self) -> Vec<RemoteRef> {
        let mut seen = HashSet::with_hasher(RandomState::new());
        let mut handles: Vec<RemoteRef> = self
            .by_origin
            .values()
            .chain(self.by_from.values())
            .filter_map(RemoteRef::upgrade)
            .filter(|handle| seen.insert(handle.clone()))
            .collect();
        handles.sort_by_key(|handle| handle.oid());
        handles
    }

    fn require_analysis(
        &self,
        operation: &'static str,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        match self.phase {
            HeapPhase::Analyzing(current) if current == kind => Ok(()),
            phase => Err(TeleError::violation(
                operation,
                format!("{kind} notification while {phase}"),
            )),
        }
    }

    fn prune(&mut self) {
        self.by_origin.retain(|_, weak| weak.strong_count() > 0);
        self.by_from.retain(|_, weak| weak.strong_count() > 0);
        self.retired.retain(|weak| weak.strong_count() > 0);
    }

    fn tracked_handle(&self, tracker: GcPhaseTracker) -> RemoteRef {
        RemoteRef::gen_ss(&self.session, tracker)
    }

    /// Handle for an object seen at a from-space address mid-analysis.
    fn make_from_space(
        &mut self,
        channel: &dyn ProcessChannel,
        address: Address,
        young: bool,
        kind: CollectionKind,
    ) -> Result<RemoteRef, TeleError> {
        let Some(to) = channel.forwarding_address(address)? else {
            let tracker = GcPhaseTracker::create_from_only(address, young, kind)?;
            let handle = self.tracked_handle(tracker);
            self.by_origin.insert(address, handle.downgrade());
            return Ok(handle);
        };

        // the copy may already have a handle of its own
        if let Some(copy) = self.lookup(to) {
            if copy.forwarded_from().is_none() {
                copy.track("make_reference", |t| t.add_from_origin(address, kind))?;
            }
            self.by_from.insert(address, copy.downgrade());
            return Ok(copy);
        }

        let tracker = GcPhaseTracker::create_from_to(address, to, young, kind)?;
        let handle = self.tracked_handle(tracker);
        self.by_origin.insert(to, handle.downgrade());
        self.by_from.insert(address, handle.downgrade());
        Ok(handle)
    }
}

impl ReferenceBackend for GenSsBackend {
    fn name(&self) -> &'static str {
        "gen-ss"
    }

    fn make_reference(
        &mut self,
        channel: &dyn ProcessChannel,
        address: Address,
    ) -> Result<RemoteRef, TeleError> {
        if let Some(existing) = self.lookup(address) {
            return Ok(existing);
        }
        if !channel.validate_origin(address) {
            return Ok(RemoteRef::null(
                &self.session,
                Some("not an object origin".into()),
                Some(address),
            ));
        }

        let region = channel.classify(address);
        let handle = match (self.phase, region) {
            (_, HeapRegion::Fixed) => RemoteRef::constant(&self.session, address),
            (HeapPhase::Mutating, HeapRegion::Nursery) => {
                self.tracked_handle(GcPhaseTracker::create_live(address, true))
            }
            (HeapPhase::Mutating, HeapRegion::OldTo) => {
                self.tracked_handle(GcPhaseTracker::create_live(address, false))
            }
            (HeapPhase::Analyzing(kind), HeapRegion::OldTo) => {
                let tracker =
                    GcPhaseTracker::create_old_to(address, kind.is_minor(), kind)?;
                self.tracked_handle(tracker)
            }
            (HeapPhase::Analyzing(CollectionKind::Minor), HeapRegion::Nursery) => {
                return self.make_from_space(
                    channel,
                    address,
                    true,
                    CollectionKind::Minor,
                );
            }
            (HeapPhase::Analyzing(CollectionKind::Full), HeapRegion::OldFrom) => {
                return self.make_from_space(
                    channel,
                    address,
                    false,
                    CollectionKind::Full,
                );
            }
            (phase, region) => {
                return Ok(RemoteRef::null(
                    &self.session,
                    Some(format!("{region:?} holds no trackable objects while {phase}")),
                    Some(address),
                ));
            }
        };
        trace!("{} created at {address} ({})", handle.oid(), self.phase);
        self.by_origin.insert(address, handle.downgrade());
        Ok(handle)
    }

    fn refresh(
        &mut self,
        _channel: &dyn ProcessChannel,
        epoch: Epoch,
    ) -> Result<bool, TeleError> {
        if self.last_epoch.is_some_and(|last| epoch <= last) {
            return Ok(false);
        }
        self.prune();
        self.forwarders.collapse();
        self.last_epoch = Some(epoch);
        Ok(true)
    }

    fn analysis_begins(&mut self, kind: CollectionKind) -> Result<(), TeleError> {
        if let HeapPhase::Analyzing(current) = self.phase {
            return Err(TeleError::violation(
                "analysis_begins",
                format!("{kind} analysis while {current} analysis is in progress"),
            ));
        }
        self.prune();
        for handle in self.canonical_handles() {
            if handle.gc_phase_state().is_some() {
                handle.track("analysis_begins", |t| t.analysis_begins(kind))?;
            }
        }
        self.phase = HeapPhase::Analyzing(kind);
        debug!("{kind} analysis begins, {} handles", self.by_origin.len());
        Ok(())
    }

    fn analysis_ends(&mut self, kind: CollectionKind) -> Result<(), TeleError> {
        self.require_analysis("analysis_ends", kind)?;

        let handles = self.canonical_handles();
        for handle in &handles {
            if handle.gc_phase_state().is_some() {
                handle.track("analysis_ends", |t| t.analysis_ends(kind))?;
            }
        }

        // survivors are keyed by their final origin
        self.by_origin.clear();
        self.by_from.clear();
        let mut died = 0;
        for handle in handles {
            if handle.status() == ObjectStatus::Dead {
                trace!("{} died in {kind} collection", handle.oid());
                self.retired.push(handle.downgrade());
                died += 1;
                continue;
            }
            let Some(origin) = handle.origin() else {
                continue;
            };
            let winner = match self.by_origin.get(&origin).and_then(RemoteRef::upgrade) {
                Some(existing) => {
                    let (winner, loser) = canonical_winner(existing, handle);
                    loser.forward_to(&winner);
                    self.forwarders.push(&loser);
                    winner
                }
                None => handle,
            };
            self.by_origin.insert(origin, winner.downgrade());
        }
        self.forwarders.collapse();
        self.phase = HeapPhase::Mutating;
        debug!(
            "{kind} analysis ends, {} survivors, {died} died",
            self.by_origin.len()
        );
        Ok(())
    }

    fn object_relocated(
        &mut self,
        from: Address,
        to: Address,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        self.require_analysis("object_relocated", kind)?;

        let at_from = self.by_origin.get(&from).and_then(RemoteRef::upgrade);
        let at_to = self.lookup(to);
        let tracked = match (at_from, at_to) {
            (None, None) => return Ok(()),
            (Some(f), Some(t)) if f == t => return Ok(()),
            (Some(f), Some(t)) => {
                let (winner, loser) = canonical_winner(f.clone(), t);
                if winner == f {
                    f.track("object_relocated", |tr| tr.add_to_origin(to, kind))?;
                } else {
                    winner.track("object_relocated", |tr| {
                        tr.add_from_origin(from, kind)
                    })?;
                }
                loser.forward_to(&winner);
                self.forwarders.push(&loser);
                debug!("{} superseded by {} at {to}", loser.oid(), winner.oid());
                winner
            }
            (Some(f), None) => {
                f.track("object_relocated", |tr| tr.add_to_origin(to, kind))?;
                f
            }
            (None, Some(t)) => {
                if t.forwarded_from() != Some(from) {
                    t.track("object_relocated", |tr| tr.add_from_origin(from, kind))?;
                }
                t
            }
        };

        self.by_origin.remove(&from);
        self.by_origin.insert(to, tracked.downgrade());
        self.by_from.insert(from, tracked.downgrade());
        Ok(())
    }

    fn tracked(&self) -> Vec<RemoteRef> {
        let mut handles = self.canonical_handles();
        handles.extend(self.forwarders.live_handles());
        handles.extend(self.retired.iter().filter_map(RemoteRef::upgrade));
        handles
    }

    fn root_slots_used(&self) -> usize {
        0
    }

    fn detach(&mut self) {
        self.by_origin.clear();
        self.by_from.clear();
        self.forwarders.clear();
        self.retired.clear();
        self.phase = HeapPhase::Mutating;
    }
}
