//! Mirrored root table.
//!
//! A fixed array of words in target memory that the target's collector
//! treats as roots and updates when it relocates objects. The debugger keeps
//! a local copy of the array so handle lookups never touch the channel; the
//! copy is only as fresh as the last [`RootTable::update_cache`].

use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::RwLock;

use crate::{Address, ChannelError, Epoch, ProcessChannel, TeleError};

const BITS: usize = u64::BITS as usize;

/// A claimed root-table index.
///
/// The generation changes every time the index is released, so a stale
/// `RootSlot` can never free an index that has since been handed to a newer
/// holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSlot {
    index: u32,
    generation: u32,
}

impl RootSlot {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Local copy of the remote root array, shared with the handles that read
/// their address out of it.
#[derive(Debug)]
pub struct RootCache {
    slots: RwLock<Box<[Option<Address>]>>,
}

impl RootCache {
    fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity].into_boxed_slice()),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Address> {
        self.slots.read().get(index).copied().flatten()
    }

    fn set(&self, index: usize, address: Option<Address>) {
        if let Some(slot) = self.slots.write().get_mut(index) {
            *slot = address;
        }
    }
}

#[derive(Debug)]
pub struct RootTable {
    base: Address,
    word_size: usize,
    capacity: usize,
    cache: Arc<RootCache>,
    used: Box<[u64]>,
    generations: Box<[u32]>,
    in_use: usize,
    // released slots whose remote word still names the old object
    pending_clears: Vec<RootSlot>,
    last_epoch: Option<Epoch>,
}

impl RootTable {
    pub fn new(
        base: Address,
        capacity: usize,
        word_size: usize,
    ) -> Result<Self, TeleError> {
        let span = capacity
            .checked_mul(word_size)
            .and_then(|bytes| base.raw().checked_add(bytes as u64));
        if span.is_none() || capacity > u32::MAX as usize {
            return Err(TeleError::violation(
                "root_table",
                format!("{capacity} slots at {base} overflow the address space"),
            ));
        }

        Ok(Self {
            base,
            word_size,
            capacity,
            cache: Arc::new(RootCache::new(capacity)),
            used: vec![0; capacity.div_ceil(BITS)].into_boxed_slice(),
            generations: vec![0; capacity].into_boxed_slice(),
            in_use: 0,
            pending_clears: Vec::new(),
            last_epoch: None,
        })
    }

    pub fn cache(&self) -> &Arc<RootCache> {
        &self.cache
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn last_epoch(&self) -> Option<Epoch> {
        self.last_epoch
    }

    /// Claim the lowest free index and mirror `address` into it.
    pub fn register(
        &mut self,
        channel: &dyn ProcessChannel,
        address: Address,
    ) -> Result<RootSlot, TeleError> {
        let Some(index) = self.first_clear() else {
            return Err(TeleError::CapacityExceeded {
                capacity: self.capacity,
            });
        };

        // remote first: a failed write must not leave a claimed index behind
        channel.write_word(self.slot_address(index), address.raw())?;

        self.pending_clears.retain(|pending| pending.index() != index);
        self.set_used(index, true);
        self.in_use += 1;
        self.cache.set(index, Some(address));
        trace!("root[{index}] <- {address}");

        Ok(RootSlot {
            index: index as u32,
            generation: self.generations[index],
        })
    }

    /// Release a slot. Returns `false` if the slot was already released.
    ///
    /// The local side is always cleared. A failed remote clear is queued and
    /// retried by the next [`Self::update_cache`], since until then the
    /// stale word keeps the old object reachable in the target.
    pub fn unregister(
        &mut self,
        channel: &dyn ProcessChannel,
        slot: RootSlot,
    ) -> bool {
        if !self.is_current(slot) {
            return false;
        }
        let index = slot.index();

        let failed = channel.write_word(self.slot_address(index), 0).is_err();

        self.set_used(index, false);
        self.generations[index] = self.generations[index].wrapping_add(1);
        if failed {
            warn!("root[{index}] could not be cleared remotely, will retry");
            self.pending_clears.push(RootSlot {
                index: slot.index,
                generation: self.generations[index],
            });
        }
        self.in_use -= 1;
        self.cache.set(index, None);
        trace!("root[{index}] released");
        true
    }

    /// Whether `slot` still owns its index.
    #[inline]
    pub fn is_current(&self, slot: RootSlot) -> bool {
        let index = slot.index();
        index < self.capacity
            && self.is_used(index)
            && self.generations[index] == slot.generation
    }

    /// Cached address at `index`; `None` for free slots and for objects the
    /// collector has cleared.
    /// Released slots still waiting for their remote word to be cleared.
    #[inline]
    pub fn pending_clears(&self) -> usize {
        self.pending_clears.len()
    }

    #[inline]
    pub fn get_raw_reference(&self, index: usize) -> Option<Address> {
        self.cache.get(index)
    }

    /// Copy the remote array into the cache, once per epoch.
    ///
    /// Returns `Ok(false)` for an epoch that was already applied. On channel
    /// failure nothing changes and the same epoch can be retried. Remote
    /// clears that failed earlier are retried first.
    pub fn update_cache(
        &mut self,
        channel: &dyn ProcessChannel,
        epoch: Epoch,
    ) -> Result<bool, TeleError> {
        if self.last_epoch.is_some_and(|last| epoch <= last) {
            trace!("root table already at {epoch}");
            return Ok(false);
        }
        self.retry_clears(channel);

        let words = channel.read_words(self.base, self.capacity)?;
        if words.len() != self.capacity {
            return Err(ChannelError::ShortRead {
                address: self.base,
                expected: self.capacity,
                got: words.len(),
            }
            .into());
        }

        {
            let mut slots = self.cache.slots.write();
            for (index, word) in words.into_iter().enumerate() {
                // free slots stay empty even if a stale remote word survived
                slots[index] = if self.is_used(index) {
                    Address::from_word(word)
                } else {
                    None
                };
            }
        }
        self.last_epoch = Some(epoch);
        debug!("root table refreshed to {epoch}, {} in use", self.in_use);
        Ok(true)
    }

    /// Forget every slot without touching the target, which is gone.
    pub fn clear_local(&mut self) {
        self.used.fill(0);
        for generation in self.generations.iter_mut() {
            *generation = generation.wrapping_add(1);
        }
        self.in_use = 0;
        self.pending_clears.clear();
        self.cache.slots.write().fill(None);
    }

    fn retry_clears(&mut self, channel: &dyn ProcessChannel) {
        let pending = std::mem::take(&mut self.pending_clears);
        for slot in pending {
            let index = slot.index();
            // a new holder has overwritten the word already
            if self.is_used(index) || self.generations[index] != slot.generation {
                continue;
            }
            match channel.write_word(self.slot_address(index), 0) {
                Ok(()) => trace!("root[{index}] cleared on retry"),
                Err(err) => {
                    warn!("root[{index}] still not cleared: {err}");
                    self.pending_clears.push(slot);
                }
            }
        }
    }

    fn slot_address(&self, index: usize) -> Address {
        debug_assert!(index < self.capacity);
        // checked at construction: base + capacity * word_size fits
        let raw = self.base.raw() + (index * self.word_size) as u64;
        Address::new(raw).unwrap_or(self.base)
    }

    fn first_clear(&self) -> Option<usize> {
        for (word_index, &word) in self.used.iter().enumerate() {
            if word != u64::MAX {
                let index = word_index * BITS + word.trailing_ones() as usize;
                return (index < self.capacity).then_some(index);
            }
        }
        None
    }

    #[inline(always)]
    fn is_used(&self, index: usize) -> bool {
        self.used[index / BITS] & (1 << (index % BITS)) != 0
    }

    #[inline(always)]
    fn set_used(&mut self, index: usize, used: bool) {
        let mask = 1u64 << (index % BITS);
        if used {
            self.used[index / BITS] |= mask;
        } else {
            self.used[index / BITS] &= !mask;
        }
    }
}
