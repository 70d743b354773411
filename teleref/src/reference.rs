//! Debugger-side handles to objects in the target heap.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    Address, GcPhaseState, GcPhaseTracker, Oid, RootCache, RootSlot, TeleError,
};

/// What the debugger currently believes about an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    Live,
    /// Reachability is being decided by an analysis in progress.
    Unknown,
    Dead,
    /// The handle was superseded by another handle for the same object.
    Obsolete,
}

impl ObjectStatus {
    pub fn label(self) -> &'static str {
        match self {
            ObjectStatus::Live => "LIVE",
            ObjectStatus::Unknown => "UNKNOWN",
            ObjectStatus::Dead => "DEAD",
            ObjectStatus::Obsolete => "OBSOLETE",
        }
    }
}

impl core::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Liveness of one inspection session, shared by every handle it created.
#[derive(Debug, Clone)]
pub(crate) struct Session(Arc<AtomicBool>);

impl Session {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline]
    pub(crate) fn is_attached(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) enum ReferenceKind {
    /// Never denotes an object. Annotated nulls remember why.
    Null {
        reason: Option<String>,
        failed_origin: Option<Address>,
    },
    /// Object in a region that never moves.
    Constant { origin: Address },
    /// Object reached through a root-table slot.
    Mutable {
        cache: Arc<RootCache>,
        slot: Mutex<Option<RootSlot>>,
    },
    Local { object: Arc<dyn Any + Send + Sync> },
    /// Object tracked directly through collector phase notifications.
    GenSs { tracker: Mutex<GcPhaseTracker> },
}

pub(crate) struct TeleReference {
    oid: Oid,
    session: Session,
    forwarded: Mutex<Option<RemoteRef>>,
    kind: ReferenceKind,
}

/// A handle to a remote (or local) object.
///
/// Cloning is cheap. Equality is handle identity: two `RemoteRef`s are equal
/// exactly when they are the same handle, which canonicalization turns into
/// object identity.
#[derive(Clone)]
pub struct RemoteRef(Arc<TeleReference>);

pub(crate) type WeakRef = Weak<TeleReference>;

impl RemoteRef {
    pub(crate) fn new(session: &Session, kind: ReferenceKind) -> Self {
        Self(Arc::new(TeleReference {
            oid: Oid::next(),
            session: session.clone(),
            forwarded: Mutex::new(None),
            kind,
        }))
    }

    pub(crate) fn null(
        session: &Session,
        reason: Option<String>,
        failed_origin: Option<Address>,
    ) -> Self {
        Self::new(
            session,
            ReferenceKind::Null {
                reason,
                failed_origin,
            },
        )
    }

    pub(crate) fn constant(session: &Session, origin: Address) -> Self {
        Self::new(session, ReferenceKind::Constant { origin })
    }

    pub(crate) fn mutable(
        session: &Session,
        cache: Arc<RootCache>,
        slot: RootSlot,
    ) -> Self {
        Self::new(
            session,
            ReferenceKind::Mutable {
                cache,
                slot: Mutex::new(Some(slot)),
            },
        )
    }

    pub(crate) fn local(
        session: &Session,
        object: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self::new(session, ReferenceKind::Local { object })
    }

    pub(crate) fn gen_ss(session: &Session, tracker: GcPhaseTracker) -> Self {
        Self::new(
            session,
            ReferenceKind::GenSs {
                tracker: Mutex::new(tracker),
            },
        )
    }

    pub(crate) fn downgrade(&self) -> WeakRef {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &WeakRef) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    #[inline]
    pub fn oid(&self) -> Oid {
        self.0.oid
    }

    #[inline]
    fn kind(&self) -> &ReferenceKind {
        &self.0.kind
    }

    /// Current origin, following a forwarding hop. `None` for null and local
    /// handles and for table handles whose slot the collector cleared. A
    /// tracked dead object keeps reporting its last known origin.
    pub fn origin(&self) -> Option<Address> {
        if let Some(target) = self.forwarded_to() {
            return target.origin();
        }
        match self.kind() {
            ReferenceKind::Null { .. } | ReferenceKind::Local { .. } => None,
            ReferenceKind::Constant { origin } => Some(*origin),
            ReferenceKind::Mutable { cache, slot } => {
                slot.lock().and_then(|slot| cache.get(slot.index()))
            }
            ReferenceKind::GenSs { tracker } => Some(tracker.lock().origin()),
        }
    }

    pub fn status(&self) -> ObjectStatus {
        if !self.0.session.is_attached() {
            return ObjectStatus::Dead;
        }
        if self.is_superseded() {
            return ObjectStatus::Obsolete;
        }
        match self.kind() {
            ReferenceKind::Null { .. } => ObjectStatus::Dead,
            ReferenceKind::Constant { .. } | ReferenceKind::Local { .. } => {
                ObjectStatus::Live
            }
            ReferenceKind::Mutable { cache, slot } => {
                match slot.lock().and_then(|slot| cache.get(slot.index())) {
                    Some(_) => ObjectStatus::Live,
                    None => ObjectStatus::Dead,
                }
            }
            ReferenceKind::GenSs { tracker } => tracker.lock().status(),
        }
    }

    /// Status before the most recent phase transition, for handles that
    /// track one.
    pub fn prior_status(&self) -> Option<ObjectStatus> {
        match self.kind() {
            ReferenceKind::GenSs { tracker } => tracker.lock().prior_status(),
            _ => None,
        }
    }

    /// Superseded by another handle, or known by both a from- and a
    /// to-space address during an analysis.
    pub fn is_forwarded(&self) -> bool {
        if self.is_superseded() {
            return true;
        }
        match self.kind() {
            ReferenceKind::GenSs { tracker } => tracker.lock().is_forwarded(),
            _ => false,
        }
    }

    pub fn forwarded_to(&self) -> Option<RemoteRef> {
        self.0.forwarded.lock().clone()
    }

    /// From-space address of an object copied during the current analysis.
    pub fn forwarded_from(&self) -> Option<Address> {
        match self.kind() {
            ReferenceKind::GenSs { tracker } => tracker.lock().forwarded_from(),
            _ => None,
        }
    }

    pub fn gc_phase_state(&self) -> Option<GcPhaseState> {
        match self.kind() {
            ReferenceKind::GenSs { tracker } => Some(tracker.lock().state()),
            _ => None,
        }
    }

    pub fn local_object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        match self.kind() {
            ReferenceKind::Local { object } => Some(Arc::clone(object)),
            _ => None,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self.kind(), ReferenceKind::Local { .. })
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.kind(), ReferenceKind::Null { .. })
    }

    /// Why an annotated null handle exists, and the origin that failed.
    pub fn null_annotation(&self) -> Option<(Option<&str>, Option<Address>)> {
        match self.kind() {
            ReferenceKind::Null {
                reason,
                failed_origin,
            } => Some((reason.as_deref(), *failed_origin)),
            _ => None,
        }
    }

    /// The root-table slot this handle still owns.
    pub fn root_slot(&self) -> Option<RootSlot> {
        match self.kind() {
            ReferenceKind::Mutable { slot, .. } => *slot.lock(),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        let body = match self.kind() {
            ReferenceKind::Null {
                reason,
                failed_origin,
            } => {
                let mut text = String::from("null");
                if let Some(origin) = failed_origin {
                    text.push_str(&format!(" @ {origin}"));
                }
                if let Some(reason) = reason {
                    text.push_str(&format!(" ({reason})"));
                }
                text
            }
            ReferenceKind::Constant { origin } => format!("constant @ {origin}"),
            ReferenceKind::Mutable { cache, slot } => match *slot.lock() {
                Some(slot) => match cache.get(slot.index()) {
                    Some(origin) => {
                        format!("mutable root[{}] @ {origin}", slot.index())
                    }
                    None => format!("mutable root[{}] cleared", slot.index()),
                },
                None => String::from("mutable released"),
            },
            ReferenceKind::Local { .. } => String::from("local"),
            ReferenceKind::GenSs { tracker } => {
                format!("gen-ss {}", tracker.lock())
            }
        };
        match self.forwarded_to() {
            Some(target) => format!("{} {body} -> {}", self.oid(), target.oid()),
            None => format!("{} {body}", self.oid()),
        }
    }

    // ── Backend plumbing ───────────────────────────────────────────

    #[inline]
    pub(crate) fn is_superseded(&self) -> bool {
        self.0.forwarded.lock().is_some()
    }

    pub(crate) fn forward_to(&self, target: &RemoteRef) {
        debug_assert!(self != target);
        *self.0.forwarded.lock() = Some(target.clone());
    }

    /// Give up the root slot. Returns it at most once.
    pub(crate) fn take_slot(&self) -> Option<RootSlot> {
        match self.kind() {
            ReferenceKind::Mutable { slot, .. } => slot.lock().take(),
            _ => None,
        }
    }

    /// Run a phase transition on the handle's tracker.
    pub(crate) fn track<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut GcPhaseTracker) -> Result<R, TeleError>,
    ) -> Result<R, TeleError> {
        match self.kind() {
            ReferenceKind::GenSs { tracker } => f(&mut tracker.lock()),
            _ => Err(TeleError::violation(
                operation,
                format!("{} does not track collector phases", self.oid()),
            )),
        }
    }
}

impl PartialEq for RemoteRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RemoteRef {}

impl Hash for RemoteRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl core::fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteRef")
            .field("oid", &self.oid())
            .field("origin", &self.origin())
            .field("status", &self.status())
            .finish()
    }
}

impl core::fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} [{}]", self.description(), self.status())
    }
}
