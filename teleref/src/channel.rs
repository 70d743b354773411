//! Interface to the separately running target process.
//!
//! Nothing in this crate talks to a real process; consumers hand the scheme
//! an implementation of [`ProcessChannel`] (a ptrace bridge, a core-dump
//! reader, or [`crate::SimulatedTarget`] in tests).

use crate::{Address, ChannelError};

/// Which part of the target heap contains an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapRegion {
    /// Relocating heap managed through the root table.
    Dynamic,
    /// Boot image, code, or any other region whose objects never move.
    Fixed,
    /// Non-aging nursery of the generational collector.
    Nursery,
    /// Current to-space of the old generation.
    OldTo,
    /// From-space of the old generation. Only populated during a full
    /// collection.
    OldFrom,
    Outside,
}

/// The collector the target was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    /// Any relocating collector; handles go through the root table.
    Relocating,
    /// Generational collector with a non-aging nursery and a semispace old
    /// generation; handles track from/to origins directly.
    GenerationalSemiSpace,
}

/// What the target reports about itself at attach.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub collector: CollectorKind,
    /// Base of the mirrored root array in target memory.
    pub root_table: Address,
    pub root_capacity: usize,
}

pub trait ProcessChannel: Send + Sync {
    fn read_word(&self, address: Address) -> Result<u64, ChannelError>;

    /// Bulk read of `count` consecutive words. Either all words or an error.
    fn read_words(
        &self,
        address: Address,
        count: usize,
    ) -> Result<Vec<u64>, ChannelError>;

    fn write_word(&self, address: Address, value: u64)
    -> Result<(), ChannelError>;

    /// Whether an object header plausibly starts at `address`.
    fn validate_origin(&self, address: Address) -> bool;

    fn classify(&self, address: Address) -> HeapRegion;

    /// The forwarding word stored in the header at `address`, if the
    /// collector has already copied the object during the current analysis.
    fn forwarding_address(
        &self,
        address: Address,
    ) -> Result<Option<Address>, ChannelError>;

    fn target_info(&self) -> Result<TargetInfo, ChannelError>;
}
