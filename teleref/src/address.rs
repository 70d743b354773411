use core::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// The origin of an object in the target's address space.
///
/// Never zero: "no address" is `Option<Address>`, which keeps the null word
/// of the target from masquerading as a location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Address(NonZeroU64);

impl Address {
    #[inline(always)]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }

    /// Decode a word read from the target. The null word decodes to `None`.
    #[inline(always)]
    pub const fn from_word(word: u64) -> Option<Self> {
        Self::new(word)
    }

    /// Encode an optional address as a target word.
    #[inline(always)]
    pub const fn to_word(address: Option<Self>) -> u64 {
        match address {
            Some(address) => address.raw(),
            None => 0,
        }
    }

    /// Byte offset from this address, `None` on overflow or if the result
    /// would be the null word.
    #[inline]
    pub fn offset(self, bytes: i64) -> Option<Self> {
        self.raw().checked_add_signed(bytes).and_then(Self::new)
    }
}

impl core::fmt::Debug for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Address(0x{:x})", self.raw())
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.raw())
    }
}

/// One observed GC cycle of the target. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    #[inline(always)]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for Epoch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Debugger-assigned object identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(u64);

static NEXT_OID: AtomicU64 = AtomicU64::new(1);

impl Oid {
    pub(crate) fn next() -> Self {
        Self(NEXT_OID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Oid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}
