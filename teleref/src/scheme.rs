//! The session-wide owner of every handle.
//!
//! A `ReferenceScheme` is attached to one target process. All mutation of
//! canonicalization state goes through its lock, so it can be shared between
//! a query thread and a thread that polls the target for completed
//! collections.

use std::any::Any;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::backend::ReferenceBackend;
use crate::gen_ss_backend::GenSsBackend;
use crate::local::LocalReferenceMap;
use crate::reference::Session;
use crate::table_backend::RootTableBackend;
use crate::{
    Address, CollectionKind, CollectorKind, Epoch, ObjectStatus,
    ProcessChannel, RemoteRef, RootTable, TeleCreateInfo, TeleError,
    TeleSettings,
};

/// Handle counts by status at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceStats {
    pub collector: CollectorKind,
    pub live: usize,
    pub unknown: usize,
    pub dead: usize,
    pub obsolete: usize,
    pub local: usize,
    pub root_slots: usize,
    pub last_epoch: Option<Epoch>,
}

impl core::fmt::Display for ReferenceStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let epoch = match self.last_epoch {
            Some(epoch) => epoch.to_string(),
            None => String::from("-"),
        };
        write!(
            f,
            "epoch {epoch}: live {} unknown {} dead {} obsolete {} local {} roots {}",
            self.live,
            self.unknown,
            self.dead,
            self.obsolete,
            self.local,
            self.root_slots
        )
    }
}

struct SchemeState {
    // `None` once detached
    backend: Option<Box<dyn ReferenceBackend>>,
    locals: LocalReferenceMap,
    last_epoch: Option<Epoch>,
}

pub struct ReferenceScheme {
    channel: Arc<dyn ProcessChannel>,
    settings: TeleSettings,
    collector: CollectorKind,
    session: Session,
    null: RemoteRef,
    state: Mutex<SchemeState>,
}

impl ReferenceScheme {
    pub fn attach(
        channel: Arc<dyn ProcessChannel>,
        info: &TeleCreateInfo,
    ) -> Result<Self, TeleError> {
        let settings =
            TeleSettings::from_info(info).map_err(TeleError::InvalidSettings)?;
        let target = channel.target_info()?;
        let collector = settings.collector.unwrap_or(target.collector);
        let session = Session::new();

        let backend: Box<dyn ReferenceBackend> = match collector {
            CollectorKind::Relocating => {
                let capacity = settings.max_roots.min(target.root_capacity);
                let table =
                    RootTable::new(target.root_table, capacity, settings.word_size)?;
                Box::new(RootTableBackend::new(session.clone(), table))
            }
            CollectorKind::GenerationalSemiSpace => {
                Box::new(GenSsBackend::new(session.clone()))
            }
        };
        info!(
            "attached to target, {collector:?} collector, {} backend",
            backend.name()
        );

        Ok(Self {
            null: RemoteRef::null(&session, None, None),
            channel,
            settings,
            collector,
            session,
            state: Mutex::new(SchemeState {
                backend: Some(backend),
                locals: LocalReferenceMap::default(),
                last_epoch: None,
            }),
        })
    }

    #[inline]
    pub fn collector(&self) -> CollectorKind {
        self.collector
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.session.is_attached()
    }

    /// The shared handle for the null word.
    pub fn null_reference(&self) -> RemoteRef {
        self.null.clone()
    }

    /// Canonical handle for `address`. The null word maps to the shared
    /// null handle; addresses that do not denote an object map to annotated
    /// null handles.
    pub fn make_tele_reference(
        &self,
        address: Option<Address>,
    ) -> Result<RemoteRef, TeleError> {
        let Some(address) = address else {
            return Ok(self.null_reference());
        };
        self.with_backend("make_tele_reference", |backend, channel| {
            backend.make_reference(channel, address)
        })
    }

    pub fn make_local_reference(
        &self,
        object: Arc<dyn Any + Send + Sync>,
    ) -> Result<RemoteRef, TeleError> {
        let mut state = self.state.lock();
        if state.backend.is_none() {
            return Err(TeleError::Detached);
        }
        Ok(state.locals.get_or_insert(&self.session, object))
    }

    /// A dead handle that remembers why no real handle could be made.
    pub fn make_zero_reference(
        &self,
        reason: impl Into<String>,
        failed_origin: Option<Address>,
    ) -> RemoteRef {
        RemoteRef::null(&self.session, Some(reason.into()), failed_origin)
    }

    /// Catch up with the target after a completed collection.
    ///
    /// Returns `Ok(false)` for an epoch that was already applied. A channel
    /// failure leaves all state as it was; retry with the same epoch.
    pub fn update_cache(&self, epoch: Epoch) -> Result<bool, TeleError> {
        let mut state = self.state.lock();
        if state.last_epoch.is_some_and(|last| epoch <= last) {
            return Ok(false);
        }
        let applied = self.run(&mut state, "update_cache", |backend, channel| {
            backend.refresh(channel, epoch)
        });
        match applied {
            Ok(applied) => {
                let reclaimed = state.locals.sweep();
                if reclaimed > 0 {
                    debug!("{reclaimed} local handles reclaimed");
                }
                state.last_epoch = Some(epoch);
                Ok(applied)
            }
            Err(err @ TeleError::ChannelFailure(_)) => {
                warn!("refresh to {epoch} failed, will retry: {err}");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn analysis_begins(&self, kind: CollectionKind) -> Result<(), TeleError> {
        self.with_backend("analysis_begins", |backend, _| {
            backend.analysis_begins(kind)
        })
    }

    pub fn analysis_ends(&self, kind: CollectionKind) -> Result<(), TeleError> {
        self.with_backend("analysis_ends", |backend, _| backend.analysis_ends(kind))
    }

    /// The heap scheme reports that the collector copied `from` to `to`.
    pub fn object_relocated(
        &self,
        from: Address,
        to: Address,
        kind: CollectionKind,
    ) -> Result<(), TeleError> {
        self.with_backend("object_relocated", |backend, _| {
            backend.object_relocated(from, to, kind)
        })
    }

    /// Follow one forwarding hop. Handles that were never superseded
    /// resolve to themselves.
    pub fn resolve_forwarding(&self, handle: &RemoteRef) -> RemoteRef {
        let state = self.state.lock();
        match state.backend.as_deref() {
            Some(backend) => backend.resolve_forwarding(handle),
            None => handle.clone(),
        }
    }

    /// Read the word at `index` words past the object's origin.
    pub fn read_word(&self, handle: &RemoteRef, index: usize) -> Result<u64, TeleError> {
        let address = self.element_address(handle, 0, index)?;
        Ok(self.channel.read_word(address)?)
    }

    /// Overwrite the word at `index` words past the object's origin.
    pub fn write_word(
        &self,
        handle: &RemoteRef,
        index: usize,
        value: u64,
    ) -> Result<(), TeleError> {
        let address = self.element_address(handle, 0, index)?;
        Ok(self.channel.write_word(address, value)?)
    }

    /// Read element `index` of an array whose first element sits
    /// `displacement` bytes past the origin.
    pub fn read_element(
        &self,
        handle: &RemoteRef,
        displacement: usize,
        index: usize,
    ) -> Result<u64, TeleError> {
        let address = self.element_address(handle, displacement, index)?;
        Ok(self.channel.read_word(address)?)
    }

    pub fn write_element(
        &self,
        handle: &RemoteRef,
        displacement: usize,
        index: usize,
        value: u64,
    ) -> Result<(), TeleError> {
        let address = self.element_address(handle, displacement, index)?;
        Ok(self.channel.write_word(address, value)?)
    }

    /// Read a reference field and canonicalize what it points to.
    pub fn read_reference(
        &self,
        handle: &RemoteRef,
        index: usize,
    ) -> Result<RemoteRef, TeleError> {
        let word = self.read_word(handle, index)?;
        self.make_tele_reference(Address::from_word(word))
    }

    /// Store `value` into a reference field. Null handles store the null
    /// word; anything else must name a live remote object.
    pub fn write_reference(
        &self,
        handle: &RemoteRef,
        index: usize,
        value: &RemoteRef,
    ) -> Result<(), TeleError> {
        let word = if value.is_null() {
            0
        } else {
            Address::to_word(Some(self.live_origin(value)?))
        };
        self.write_word(handle, index, word)
    }

    pub fn stats(&self) -> ReferenceStats {
        let state = self.state.lock();
        let mut stats = ReferenceStats {
            collector: self.collector,
            live: 0,
            unknown: 0,
            dead: 0,
            obsolete: 0,
            local: 0,
            root_slots: 0,
            last_epoch: state.last_epoch,
        };
        let Some(backend) = state.backend.as_deref() else {
            return stats;
        };
        for handle in backend.tracked() {
            match handle.status() {
                ObjectStatus::Live => stats.live += 1,
                ObjectStatus::Unknown => stats.unknown += 1,
                ObjectStatus::Dead => stats.dead += 1,
                ObjectStatus::Obsolete => stats.obsolete += 1,
            }
        }
        stats.local = state.locals.live_handles().len();
        stats.root_slots = backend.root_slots_used();
        stats
    }

    /// End the session. Every outstanding handle reports dead from now on.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        self.terminate(&mut state);
    }

    /// Origin of the current canonical handle for `handle`, if it can be
    /// dereferenced.
    fn live_origin(&self, handle: &RemoteRef) -> Result<Address, TeleError> {
        if !self.is_attached() {
            return Err(TeleError::Detached);
        }
        let handle = self.resolve_forwarding(handle);
        if handle.is_local() {
            return Err(TeleError::invalid(format!(
                "{} is a local object",
                handle.oid()
            )));
        }
        match handle.status() {
            ObjectStatus::Dead | ObjectStatus::Obsolete => {
                return Err(TeleError::invalid(format!(
                    "{} is {}",
                    handle.oid(),
                    handle.status()
                )));
            }
            ObjectStatus::Live | ObjectStatus::Unknown => {}
        }
        handle
            .origin()
            .ok_or_else(|| TeleError::invalid(format!("{} has no origin", handle.oid())))
    }

    fn element_address(
        &self,
        handle: &RemoteRef,
        displacement: usize,
        index: usize,
    ) -> Result<Address, TeleError> {
        let origin = self.live_origin(handle)?;
        index
            .checked_mul(self.settings.word_size)
            .and_then(|bytes| bytes.checked_add(displacement))
            .and_then(|bytes| i64::try_from(bytes).ok())
            .and_then(|bytes| origin.offset(bytes))
            .ok_or_else(|| {
                TeleError::invalid(format!(
                    "element {index} at +{displacement} past {origin} overflows"
                ))
            })
    }

    fn terminate(&self, state: &mut SchemeState) {
        self.session.detach();
        if let Some(mut backend) = state.backend.take() {
            backend.detach();
            state.locals.clear();
            info!("detached from target");
        }
    }

    fn with_backend<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut dyn ReferenceBackend, &dyn ProcessChannel) -> Result<R, TeleError>,
    ) -> Result<R, TeleError> {
        let mut state = self.state.lock();
        self.run(&mut state, operation, f)
    }

    /// Run `f` against the backend. A protocol violation ends the session
    /// before it is reported.
    fn run<R>(
        &self,
        state: &mut SchemeState,
        operation: &'static str,
        f: impl FnOnce(&mut dyn ReferenceBackend, &dyn ProcessChannel) -> Result<R, TeleError>,
    ) -> Result<R, TeleError> {
        let Some(backend) = state.backend.as_deref_mut() else {
            return Err(TeleError::Detached);
        };
        let result = f(backend, self.channel.as_ref());
        if let Err(err @ TeleError::ProtocolViolation { .. }) = &result {
            error!("{operation}: {err}, terminating session");
            self.terminate(state);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapRegion, SimulatedTarget};

    fn attach(collector: CollectorKind) -> (Arc<SimulatedTarget>, ReferenceScheme) {
        let target = Arc::new(SimulatedTarget::new(collector));
        let scheme = ReferenceScheme::attach(target.clone(), &TeleCreateInfo::default())
            .expect("attached");
        (target, scheme)
    }

    #[test]
    fn null_word_maps_to_shared_dead_handle() {
        let (_target, scheme) = attach(CollectorKind::Relocating);
        let a = scheme.make_tele_reference(None).expect("attached");
        let b = scheme.make_tele_reference(None).expect("attached");
        assert_eq!(a, b);
        assert_eq!(a.status(), ObjectStatus::Dead);
    }

    #[test]
    fn backend_follows_reported_collector() {
        let (_target, scheme) = attach(CollectorKind::GenerationalSemiSpace);
        assert_eq!(scheme.collector(), CollectorKind::GenerationalSemiSpace);

        let target = Arc::new(SimulatedTarget::new(CollectorKind::Relocating));
        let scheme = ReferenceScheme::attach(
            target,
            &TeleCreateInfo {
                collector: Some(CollectorKind::GenerationalSemiSpace),
                ..Default::default()
            },
        )
        .expect("attached");
        assert_eq!(scheme.collector(), CollectorKind::GenerationalSemiSpace);
    }

    #[test]
    fn invalid_settings_refuse_attach() {
        let target = Arc::new(SimulatedTarget::new(CollectorKind::Relocating));
        let result = ReferenceScheme::attach(
            target,
            &TeleCreateInfo {
                max_roots: Some(0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(TeleError::InvalidSettings(_))));
    }

    #[test]
    fn protocol_violation_terminates_session() {
        let (target, scheme) = attach(CollectorKind::GenerationalSemiSpace);
        let a = target.allocate(HeapRegion::Nursery);
        let handle = scheme.make_tele_reference(Some(a)).expect("valid");

        let err = scheme.analysis_begins(CollectionKind::Full).unwrap_err();
        assert!(matches!(err, TeleError::ProtocolViolation { .. }));
        assert!(!scheme.is_attached());
        assert_eq!(handle.status(), ObjectStatus::Dead);
        assert!(matches!(
            scheme.make_tele_reference(Some(a)),
            Err(TeleError::Detached)
        ));
    }

    #[test]
    fn read_word_goes_through_the_channel() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        target.write_field(a, 2, 0xfeed);
        let handle = scheme.make_tele_reference(Some(a)).expect("valid");
        assert_eq!(scheme.read_word(&handle, 2).expect("readable"), 0xfeed);
    }

    #[test]
    fn read_reference_canonicalizes_the_field() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let b = target.allocate(HeapRegion::Dynamic);
        target.write_field(a, 1, b.raw());
        let ha = scheme.make_tele_reference(Some(a)).expect("valid");
        let hb = scheme.make_tele_reference(Some(b)).expect("valid");

        assert_eq!(scheme.read_reference(&ha, 1).expect("readable"), hb);
        assert!(scheme.read_reference(&ha, 3).expect("readable").is_null());
    }

    #[test]
    fn write_word_lands_in_the_target() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let handle = scheme.make_tele_reference(Some(a)).expect("valid");

        scheme.write_word(&handle, 2, 0xbeef).expect("writable");
        assert_eq!(target.read_word(a.offset(16).expect("in range")), Ok(0xbeef));
        assert_eq!(scheme.read_word(&handle, 2).expect("readable"), 0xbeef);
    }

    #[test]
    fn write_reference_stores_origin_or_null() {
        let (target, scheme) = attach(CollectorKind::GenerationalSemiSpace);
        let a = target.allocate(HeapRegion::OldTo);
        let b = target.allocate(HeapRegion::OldTo);
        let ha = scheme.make_tele_reference(Some(a)).expect("valid");
        let hb = scheme.make_tele_reference(Some(b)).expect("valid");

        scheme.write_reference(&ha, 1, &hb).expect("writable");
        assert_eq!(scheme.read_reference(&ha, 1).expect("readable"), hb);

        scheme
            .write_reference(&ha, 1, &scheme.null_reference())
            .expect("writable");
        assert!(scheme.read_reference(&ha, 1).expect("readable").is_null());
    }

    #[test]
    fn write_reference_refuses_local_values() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let ha = scheme.make_tele_reference(Some(a)).expect("valid");
        let local = scheme.make_local_reference(Arc::new("x")).expect("attached");

        assert!(matches!(
            scheme.write_reference(&ha, 1, &local),
            Err(TeleError::InvalidReference { .. })
        ));
        assert!(matches!(
            scheme.write_word(&local, 0, 1),
            Err(TeleError::InvalidReference { .. })
        ));
    }

    #[test]
    fn elements_are_addressed_past_the_displacement() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let handle = scheme.make_tele_reference(Some(a)).expect("valid");

        // one header word, then elements
        scheme.write_element(&handle, 8, 1, 0x77).expect("writable");
        assert_eq!(scheme.read_word(&handle, 2).expect("readable"), 0x77);
        assert_eq!(scheme.read_element(&handle, 8, 1).expect("readable"), 0x77);
        assert!(matches!(
            scheme.read_element(&handle, 8, usize::MAX),
            Err(TeleError::InvalidReference { .. })
        ));
    }

    #[test]
    fn local_handles_cannot_be_read_remotely() {
        let (_target, scheme) = attach(CollectorKind::Relocating);
        let local = scheme.make_local_reference(Arc::new(3_i32)).expect("attached");
        assert!(matches!(
            scheme.read_word(&local, 0),
            Err(TeleError::InvalidReference { .. })
        ));
    }

    #[test]
    fn zero_reference_is_annotated() {
        let (_target, scheme) = attach(CollectorKind::Relocating);
        let at = Address::new(0x7777_0000).expect("non-zero");
        let zero = scheme.make_zero_reference("unreadable header", Some(at));
        assert_eq!(zero.status(), ObjectStatus::Dead);
        assert_eq!(zero.null_annotation(), Some((Some("unreadable header"), Some(at))));
        assert_ne!(zero, scheme.null_reference());
    }

    #[test]
    fn stats_count_by_status() {
        let (target, scheme) = attach(CollectorKind::Relocating);
        let a = target.allocate(HeapRegion::Dynamic);
        let b = target.allocate(HeapRegion::Dynamic);
        let _ha = scheme.make_tele_reference(Some(a)).expect("valid");
        let hb = scheme.make_tele_reference(Some(b)).expect("valid");
        let _local = scheme.make_local_reference(Arc::new(())).expect("attached");

        target.kill(b);
        target.finish_collection();
        scheme.update_cache(Epoch(1)).expect("readable");

        let stats = scheme.stats();
        assert_eq!(hb.status(), ObjectStatus::Dead);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.local, 1);
        assert_eq!(stats.root_slots, 1);
        assert_eq!(stats.last_epoch, Some(Epoch(1)));
    }
}
