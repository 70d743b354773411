//! Handles for any relocating collector, anchored in the mirrored root table.

use std::sync::Arc;

use log::{debug, trace};

use crate::backend::ReferenceBackend;
use crate::canonical::CanonicalMap;
use crate::reference::Session;
use crate::{
    Address, CollectionKind, Epoch, HeapRegion, ProcessChannel, RemoteRef,
    RootTable, TeleError,
};

pub(crate) struct RootTableBackend {
    session: Session,
    table: RootTable,
    map: CanonicalMap,
}

impl RootTableBackend {
    pub(crate) fn new(session: Session, table: RootTable) -> Self {
        Self {
            session,
            table,
            map: CanonicalMap::default(),
        }
    }
}

impl ReferenceBackend for RootTableBackend {
    fn name(&self) -> &'static str {
        "root-table"
    }

    fn make_reference(
        &mut self,
        channel: &dyn ProcessChannel,
        address: Address,
    ) -> Result<RemoteRef, TeleError> {
        if let Some(existing) = self.map.get(address) {
            return Ok(existing);
        }
        if !channel.validate_origin(address) {
            return Ok(RemoteRef::null(
                &self.session,
                Some("not an object origin".into()),
                Some(address),
            ));
        }

        let handle = match channel.classify(address) {
            HeapRegion::Fixed => RemoteRef::constant(&self.session, address),
            HeapRegion::Dynamic => {
                let slot = self.table.register(channel, address)?;
                RemoteRef::mutable(
                    &self.session,
                    Arc::clone(self.table.cache()),
                    slot,
                )
            }
            region => {
                return Ok(RemoteRef::null(
                    &self.session,
                    Some(format!("{region:?} is not managed by the root table")),
                    Some(address),
                ));
            }
        };
        trace!("{} created at {address}", handle.oid());
        self.map.insert(&mut self.table, channel, address, &handle);
        Ok(handle)
    }

    fn refresh(
        &mut self,
        channel: &dyn ProcessChannel,
        epoch: Epoch,
    ) -> Result<bool, TeleError> {
        if !self.table.update_cache(channel, epoch)? {
            return Ok(false);
        }
        let outcome = self.map.refresh(&mut self.table, channel);
        debug!(
            "canonicalization at {epoch}: {} reclaimed, {} died, {} superseded, {} retargeted",
            outcome.reclaimed, outcome.died, outcome.superseded, outcome.retargeted
        );
        Ok(true)
    }

    // the root table is rewritten by the collector itself; phases carry no
    // information here
    fn analysis_begins(&mut self, kind: CollectionKind) -> Result<(), TeleError> {
        trace!("{kind} analysis begins");
        Ok(())
    }

    fn analysis_ends(&mut self, kind: CollectionKind) -> Result<(), TeleError> {
        trace!("{kind} analysis ends");
        Ok(())
    }

    fn object_relocated(
        &mut self,
        _from: Address,
        _to: Address,
        _kind: CollectionKind,
    ) -> Result<(), TeleError> {
        Ok(())
    }

    fn tracked(&self) -> Vec<RemoteRef> {
        self.map.live_handles()
    }

    fn root_slots_used(&self) -> usize {
        self.table.used()
    }

    fn detach(&mut self) {
        self.map.clear();
        self.table.clear_local();
    }
}
