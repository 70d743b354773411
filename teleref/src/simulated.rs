//! In-memory stand-in for a target process.
//!
//! Models just enough of a target VM to drive the reference schemes: a word
//! addressable memory, the mirrored root array, object origins in a handful
//! of regions, and the few collector actions whose effects a debugger can
//! observe (relocation with forwarding words, death, semispace flips).

use std::collections::{HashMap, HashSet};

use ahash::RandomState;
use parking_lot::Mutex;

use crate::{
    Address, ChannelError, CollectorKind, HeapRegion, MAX_ROOTS,
    ProcessChannel, TargetInfo,
};

pub const ROOT_TABLE_BASE: u64 = 0x0010_0000;
pub const OBJECT_WORDS: u64 = 4;

const WORD: u64 = 8;
const HEADER_MAGIC: u64 = 0x4b45_5454_0000_0000;
const REGION_SIZE: u64 = 0x0100_0000;

const FIXED_BASE: u64 = 0x1000_0000;
const DYNAMIC_BASE: u64 = 0x2000_0000;
const NURSERY_BASE: u64 = 0x3000_0000;
const SEMISPACE_A: u64 = 0x4000_0000;
const SEMISPACE_B: u64 = 0x5000_0000;

#[derive(Debug)]
struct SimState {
    collector: CollectorKind,
    memory: HashMap<u64, u64, RandomState>,
    objects: HashSet<Address, RandomState>,
    forwarding: HashMap<Address, Address, RandomState>,
    // objects that stop being origins at the end of the current collection
    retiring: Vec<Address>,
    cursors: HashMap<u64, u64, RandomState>,
    old_to: u64,
    old_from: u64,
    fail_reads: bool,
    fail_writes: bool,
    detached: bool,
}

#[derive(Debug)]
pub struct SimulatedTarget {
    state: Mutex<SimState>,
}

impl SimulatedTarget {
    pub fn new(collector: CollectorKind) -> Self {
        let state = SimState {
            collector,
            memory: HashMap::default(),
            objects: HashSet::default(),
            forwarding: HashMap::default(),
            retiring: Vec::new(),
            cursors: HashMap::default(),
            old_to: SEMISPACE_A,
            old_from: SEMISPACE_B,
            fail_reads: false,
            fail_writes: false,
            detached: false,
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Allocate a fresh object in `region`.
    ///
    /// # Panics
    ///
    /// Panics if `region` cannot hold objects right now (`Outside`, or
    /// `OldFrom`, which only receives objects through a flip).
    pub fn allocate(&self, region: HeapRegion) -> Address {
        let mut state = self.state.lock();
        state.allocate(region)
    }

    /// Copy the object at `from` into `region`, the way a collector
    /// evacuates it: the old copy keeps a forwarding word until
    /// [`Self::finish_collection`] and every root word is rewritten.
    pub fn relocate(&self, from: Address, region: HeapRegion) -> Address {
        let mut state = self.state.lock();
        let to = state.allocate(region);
        for word in 1..OBJECT_WORDS {
            let value = state
                .memory
                .get(&(from.raw() + word * WORD))
                .copied()
                .unwrap_or(0);
            state.memory.insert(to.raw() + word * WORD, value);
        }
        state.forwarding.insert(from, to);
        state.retiring.push(from);
        state.rewrite_roots(from.raw(), to.raw());
        to
    }

    /// Let the collector reclaim `address`. Root words naming it are
    /// cleared immediately; the origin stays plausible until the collection
    /// finishes.
    pub fn kill(&self, address: Address) {
        let mut state = self.state.lock();
        state.retiring.push(address);
        state.rewrite_roots(address.raw(), 0);
    }

    /// End of the reclaiming phase: evacuated and dead origins disappear.
    pub fn finish_collection(&self) {
        let mut state = self.state.lock();
        let retiring = std::mem::take(&mut state.retiring);
        for address in retiring {
            state.objects.remove(&address);
            state.memory.remove(&address.raw());
        }
        state.forwarding.clear();
    }

    /// Swap the old generation's semispaces at the start of a full
    /// collection.
    pub fn flip_old_spaces(&self) {
        let state = &mut *self.state.lock();
        std::mem::swap(&mut state.old_to, &mut state.old_from);
        let base = state.old_to;
        state.cursors.insert(base, base);
    }

    pub fn write_field(&self, object: Address, word: u64, value: u64) {
        let mut state = self.state.lock();
        state.memory.insert(object.raw() + word * WORD, value);
    }

    pub fn root_word(&self, index: usize) -> u64 {
        let state = self.state.lock();
        let address = ROOT_TABLE_BASE + index as u64 * WORD;
        state.memory.get(&address).copied().unwrap_or(0)
    }

    pub fn set_root_word(&self, index: usize, value: u64) {
        let mut state = self.state.lock();
        state
            .memory
            .insert(ROOT_TABLE_BASE + index as u64 * WORD, value);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn detach(&self) {
        self.state.lock().detached = true;
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }
}

impl SimState {
    fn allocate(&mut self, region: HeapRegion) -> Address {
        let base = match region {
            HeapRegion::Fixed => FIXED_BASE,
            HeapRegion::Dynamic => DYNAMIC_BASE,
            HeapRegion::Nursery => NURSERY_BASE,
            HeapRegion::OldTo => self.old_to,
            HeapRegion::OldFrom | HeapRegion::Outside => {
                panic!("cannot allocate into {region:?}")
            }
        };
        let cursor = self.cursors.entry(base).or_insert(base);
        let raw = *cursor;
        *cursor += OBJECT_WORDS * WORD;
        assert!(raw + OBJECT_WORDS * WORD <= base + REGION_SIZE, "{region:?} is full");

        let Some(address) = Address::new(raw) else {
            unreachable!("region bases are non-zero")
        };
        self.memory.insert(raw, HEADER_MAGIC | OBJECT_WORDS);
        self.objects.insert(address);
        address
    }

    fn rewrite_roots(&mut self, from: u64, to: u64) {
        for index in 0..MAX_ROOTS as u64 {
            let slot = ROOT_TABLE_BASE + index * WORD;
            if let Some(word) = self.memory.get_mut(&slot) {
                if *word == from {
                    *word = to;
                }
            }
        }
    }

    fn classify(&self, raw: u64) -> HeapRegion {
        let within = |base: u64| (base..base + REGION_SIZE).contains(&raw);
        if within(FIXED_BASE) {
            HeapRegion::Fixed
        } else if within(DYNAMIC_BASE) {
            HeapRegion::Dynamic
        } else if within(NURSERY_BASE) {
            HeapRegion::Nursery
        } else if within(self.old_to) {
            HeapRegion::OldTo
        } else if within(self.old_from) {
            HeapRegion::OldFrom
        } else {
            HeapRegion::Outside
        }
    }

    fn check_read(&self, address: Address) -> Result<(), ChannelError> {
        if self.detached {
            return Err(ChannelError::Detached);
        }
        if self.fail_reads {
            return Err(ChannelError::Read { address });
        }
        Ok(())
    }
}

impl ProcessChannel for SimulatedTarget {
    fn read_word(&self, address: Address) -> Result<u64, ChannelError> {
        let state = self.state.lock();
        state.check_read(address)?;
        Ok(state.memory.get(&address.raw()).copied().unwrap_or(0))
    }

    fn read_words(
        &self,
        address: Address,
        count: usize,
    ) -> Result<Vec<u64>, ChannelError> {
        let state = self.state.lock();
        state.check_read(address)?;
        let words = (0..count as u64)
            .map(|i| {
                let raw = address.raw() + i * WORD;
                state.memory.get(&raw).copied().unwrap_or(0)
            })
            .collect();
        Ok(words)
    }

    fn write_word(
        &self,
        address: Address,
        value: u64,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.detached {
            return Err(ChannelError::Detached);
        }
        if state.fail_writes {
            return Err(ChannelError::Write { address });
        }
        state.memory.insert(address.raw(), value);
        Ok(())
    }

    fn validate_origin(&self, address: Address) -> bool {
        let state = self.state.lock();
        !state.detached && state.objects.contains(&address)
    }

    fn classify(&self, address: Address) -> HeapRegion {
        self.state.lock().classify(address.raw())
    }

    fn forwarding_address(
        &self,
        address: Address,
    ) -> Result<Option<Address>, ChannelError> {
        let state = self.state.lock();
        state.check_read(address)?;
        Ok(state.forwarding.get(&address).copied())
    }

    fn target_info(&self) -> Result<TargetInfo, ChannelError> {
        let state = self.state.lock();
        if state.detached {
            return Err(ChannelError::Detached);
        }
        let Some(root_table) = Address::new(ROOT_TABLE_BASE) else {
            unreachable!("root table base is non-zero")
        };
        Ok(TargetInfo {
            collector: state.collector,
            root_table,
            root_capacity: MAX_ROOTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_produces_valid_origins_in_region() {
        let target = SimulatedTarget::new(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let b = target.allocate(HeapRegion::Dynamic);
        assert_ne!(a, b);
        assert!(target.validate_origin(a));
        assert_eq!(target.classify(a), HeapRegion::Dynamic);
        assert_eq!(target.object_count(), 2);
    }

    #[test]
    fn relocation_rewrites_roots_and_leaves_forwarder() {
        let target = SimulatedTarget::new(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        target.set_root_word(3, a.raw());

        let b = target.relocate(a, HeapRegion::Dynamic);
        assert_eq!(target.root_word(3), b.raw());
        assert_eq!(target.forwarding_address(a).expect("readable"), Some(b));
        assert!(target.validate_origin(a));

        target.finish_collection();
        assert!(!target.validate_origin(a));
        assert!(target.validate_origin(b));
        assert_eq!(target.forwarding_address(a).expect("readable"), None);
    }

    #[test]
    fn flip_swaps_old_semispaces() {
        let target = SimulatedTarget::new(CollectorKind::GenerationalSemiSpace);
        let old = target.allocate(HeapRegion::OldTo);
        target.flip_old_spaces();
        assert_eq!(target.classify(old), HeapRegion::OldFrom);
        let copy = target.relocate(old, HeapRegion::OldTo);
        assert_eq!(target.classify(copy), HeapRegion::OldTo);
    }

    #[test]
    fn detached_target_refuses_io() {
        let target = SimulatedTarget::new(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Fixed);
        target.detach();
        assert_eq!(target.read_word(a), Err(ChannelError::Detached));
        assert!(!target.validate_origin(a));
        assert!(target.target_info().is_err());
    }
}
