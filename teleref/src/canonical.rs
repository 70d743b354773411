//! Address to handle canonicalization for root-table handles.
//!
//! The map holds handles weakly. Between refreshes it may contain transient
//! duplicates: a handle created at an object's new address before the root
//! table has caught up with the move. [`CanonicalMap::refresh`] settles them.

use std::collections::HashMap;

use ahash::RandomState;
use log::{debug, trace};

use crate::reference::WeakRef;
use crate::{Address, ProcessChannel, RemoteRef, RootSlot, RootTable};

/// Picks the canonical handle of two handles for the same object. The one
/// with the larger OID wins.
pub(crate) fn canonical_winner(
    a: RemoteRef,
    b: RemoteRef,
) -> (RemoteRef, RemoteRef) {
    if a.oid() > b.oid() { (a, b) } else { (b, a) }
}

/// Superseded handles, kept so forwarding chains can be collapsed.
#[derive(Default)]
pub(crate) struct Forwarders {
    handles: Vec<WeakRef>,
}

impl Forwarders {
    pub(crate) fn push(&mut self, handle: &RemoteRef) {
        self.handles.push(handle.downgrade());
    }

    /// Point every superseded handle straight at the end of its chain and
    /// forget the ones nobody holds anymore.
    pub(crate) fn collapse(&mut self) -> usize {
        let mut retargeted = 0;
        self.handles.retain(|weak| {
            let Some(handle) = RemoteRef::upgrade(weak) else {
                return false;
            };
            let Some(first) = handle.forwarded_to() else {
                return false;
            };
            let mut last = first.clone();
            while let Some(next) = last.forwarded_to() {
                last = next;
            }
            if last != first {
                handle.forward_to(&last);
                retargeted += 1;
            }
            true
        });
        retargeted
    }

    pub(crate) fn live_handles(&self) -> Vec<RemoteRef> {
        self.handles.iter().filter_map(RemoteRef::upgrade).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.handles.clear();
    }
}

struct Entry {
    handle: WeakRef,
    // also kept here so a reclaimed handle's slot can still be released
    slot: Option<RootSlot>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefreshOutcome {
    pub(crate) reclaimed: usize,
    pub(crate) died: usize,
    pub(crate) superseded: usize,
    pub(crate) retargeted: usize,
}

#[derive(Default)]
pub(crate) struct CanonicalMap {
    entries: HashMap<Address, Entry, RandomState>,
    forwarders: Forwarders,
    // dead handles debugger code still holds
    retired: Vec<WeakRef>,
}

impl CanonicalMap {
    pub(crate) fn get(&self, address: Address) -> Option<RemoteRef> {
        self.entries
            .get(&address)
            .and_then(|entry| RemoteRef::upgrade(&entry.handle))
    }

    /// Record `handle` as canonical for `address`. A reclaimed handle still
    /// registered there gives up its slot.
    pub(crate) fn insert(
        &mut self,
        table: &mut RootTable,
        channel: &dyn ProcessChannel,
        address: Address,
        handle: &RemoteRef,
    ) {
        let entry = Entry {
            handle: handle.downgrade(),
            slot: handle.root_slot(),
        };
        if let Some(displaced) = self.entries.insert(address, entry) {
            if let Some(slot) = displaced.slot {
                table.unregister(channel, slot);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Every handle still held by someone, superseded ones included.
    pub(crate) fn live_handles(&self) -> Vec<RemoteRef> {
        let mut handles: Vec<RemoteRef> = self
            .entries
            .values()
            .filter_map(|entry| RemoteRef::upgrade(&entry.handle))
            .collect();
        handles.extend(self.forwarders.live_handles());
        handles.extend(self.retired.iter().filter_map(RemoteRef::upgrade));
        handles
    }

    /// Bring the map in line with a freshly updated root table.
    ///
    /// Reclaimed handles release their slots, handles whose object the
    /// collector cleared release theirs and stay dead, survivors are re-keyed
    /// by their current address, and two handles meeting at one address are
    /// resolved in favor of the larger OID.
    pub(crate) fn refresh(
        &mut self,
        table: &mut RootTable,
        channel: &dyn ProcessChannel,
    ) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        self.retired.retain(|weak| weak.strong_count() > 0);

        // strong references for the whole pass: nothing is reclaimed midway
        let mut survivors = Vec::with_capacity(self.entries.len());
        for (key, entry) in self.entries.drain() {
            match RemoteRef::upgrade(&entry.handle) {
                Some(handle) => survivors.push((key, handle)),
                None => {
                    if let Some(slot) = entry.slot {
                        table.unregister(channel, slot);
                    }
                    outcome.reclaimed += 1;
                }
            }
        }
        // deterministic regardless of hash order
        survivors.sort_by_key(|(_, handle)| handle.oid());

        for (key, handle) in &survivors {
            if handle.is_superseded() {
                continue;
            }
            let slot = handle.root_slot();
            let current = match slot {
                Some(slot) => table.get_raw_reference(slot.index()),
                // constant handles never move
                None => handle.origin(),
            };
            let Some(address) = current else {
                if let Some(slot) = handle.take_slot() {
                    table.unregister(channel, slot);
                }
                trace!("{} died at {key}", handle.oid());
                self.retired.push(handle.downgrade());
                outcome.died += 1;
                continue;
            };

            let existing = self
                .entries
                .get(&address)
                .and_then(|entry| RemoteRef::upgrade(&entry.handle));
            let winner = match existing {
                Some(existing) => {
                    let (winner, loser) =
                        canonical_winner(existing, handle.clone());
                    loser.forward_to(&winner);
                    if let Some(slot) = loser.take_slot() {
                        table.unregister(channel, slot);
                    }
                    self.forwarders.push(&loser);
                    debug!(
                        "{} superseded by {} at {address}",
                        loser.oid(),
                        winner.oid()
                    );
                    outcome.superseded += 1;
                    winner
                }
                None => handle.clone(),
            };
            self.entries.insert(
                address,
                Entry {
                    handle: winner.downgrade(),
                    slot: winner.root_slot(),
                },
            );
        }

        outcome.retargeted = self.forwarders.collapse();
        outcome
    }

    /// Forget everything without touching the target.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.forwarders.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::reference::Session;
    use crate::{CollectorKind, Epoch, HeapRegion, ObjectStatus, SimulatedTarget};

    struct Fixture {
        target: SimulatedTarget,
        table: RootTable,
        map: CanonicalMap,
        session: Session,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let target = SimulatedTarget::new(CollectorKind::Relocating);
            let info = target.target_info().expect("attached");
            let table = RootTable::new(info.root_table, capacity, 8).expect("valid");
            Self {
                target,
                table,
                map: CanonicalMap::default(),
                session: Session::new(),
            }
        }

        fn handle(&mut self, address: Address) -> RemoteRef {
            let slot = self.table.register(&self.target, address).expect("free");
            let handle =
                RemoteRef::mutable(&self.session, Arc::clone(self.table.cache()), slot);
            self.map.insert(&mut self.table, &self.target, address, &handle);
            handle
        }

        fn refresh(&mut self, epoch: u64) -> RefreshOutcome {
            self.table
                .update_cache(&self.target, Epoch(epoch))
                .expect("readable");
            self.map.refresh(&mut self.table, &self.target)
        }
    }

    #[test]
    fn relocated_handle_is_rekeyed() {
        let mut fx = Fixture::new(8);
        let a = fx.target.allocate(HeapRegion::Dynamic);
        let h = fx.handle(a);

        let b = fx.target.relocate(a, HeapRegion::Dynamic);
        fx.target.finish_collection();
        fx.refresh(1);

        assert_eq!(fx.map.get(b), Some(h.clone()));
        assert_eq!(fx.map.get(a), None);
        assert_eq!(h.origin(), Some(b));
    }

    #[test]
    fn duplicate_resolves_to_larger_oid() {
        let mut fx = Fixture::new(8);
        let a = fx.target.allocate(HeapRegion::Dynamic);
        let older = fx.handle(a);
        let b = fx.target.relocate(a, HeapRegion::Dynamic);
        let newer = fx.handle(b);
        assert!(newer.oid() > older.oid());

        let outcome = fx.refresh(1);
        assert_eq!(outcome.superseded, 1);
        assert_eq!(fx.map.get(b), Some(newer.clone()));
        assert_eq!(older.forwarded_to(), Some(newer.clone()));
        assert_eq!(older.status(), ObjectStatus::Obsolete);
        assert_eq!(older.root_slot(), None);
        assert_eq!(fx.table.used(), 1);
    }

    #[test]
    fn cleared_slot_kills_handle_and_frees_index() {
        let mut fx = Fixture::new(8);
        let a = fx.target.allocate(HeapRegion::Dynamic);
        let h = fx.handle(a);
        fx.target.kill(a);
        fx.target.finish_collection();

        let outcome = fx.refresh(1);
        assert_eq!(outcome.died, 1);
        assert_eq!(h.status(), ObjectStatus::Dead);
        assert!(!h.is_forwarded());
        assert_eq!(fx.table.used(), 0);
        assert_eq!(fx.map.len(), 0);
    }

    #[test]
    fn reclaimed_handle_releases_its_slot() {
        let mut fx = Fixture::new(8);
        let a = fx.target.allocate(HeapRegion::Dynamic);
        drop(fx.handle(a));
        assert_eq!(fx.table.used(), 1);

        let outcome = fx.refresh(1);
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(fx.table.used(), 0);
        assert_eq!(fx.target.root_word(0), 0);
    }

    #[test]
    fn chains_collapse_to_one_hop() {
        let session = Session::new();
        let mut forwarders = Forwarders::default();
        let first = RemoteRef::constant(&session, Address::new(0x10).expect("non-zero"));
        let second = RemoteRef::constant(&session, Address::new(0x20).expect("non-zero"));
        let third = RemoteRef::constant(&session, Address::new(0x30).expect("non-zero"));
        first.forward_to(&second);
        second.forward_to(&third);
        forwarders.push(&first);
        forwarders.push(&second);

        assert_eq!(forwarders.collapse(), 1);
        assert_eq!(first.forwarded_to(), Some(third.clone()));
        assert_eq!(third.forwarded_to(), None);
    }

    #[test]
    fn winner_is_independent_of_argument_order() {
        let session = Session::new();
        let a = RemoteRef::constant(&session, Address::new(0x10).expect("non-zero"));
        let b = RemoteRef::constant(&session, Address::new(0x10).expect("non-zero"));
        let (w1, _) = canonical_winner(a.clone(), b.clone());
        let (w2, _) = canonical_winner(b.clone(), a);
        assert_eq!(w1, w2);
        assert_eq!(w1, b);
    }
}
