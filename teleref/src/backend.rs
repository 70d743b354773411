use crate::{
    Address, CollectionKind, Epoch, ProcessChannel, RemoteRef, TeleError,
};

/// A strategy for keeping handles attached to moving objects.
///
/// Chosen once at attach from the collector the target runs. All calls are
/// serialized by the owning [`crate::ReferenceScheme`].
pub(crate) trait ReferenceBackend: Send {
    fn name(&self) -> &'static str;

    /// Canonical handle for a non-null address.
    fn make_reference(
        &mut self,
        channel: &dyn ProcessChannel,
        address: Address,
    ) -> Result<RemoteRef, TeleError>;

    /// Catch up with the target after a collection. `Ok(false)` if `epoch`
    /// was already applied.
    fn refresh(
        &mut self,
        channel: &dyn ProcessChannel,
        epoch: Epoch,
    ) -> Result<bool, TeleError>;

    fn analysis_begins(&mut self, kind: CollectionKind) -> Result<(), TeleError>;

    fn analysis_ends(&mut self, kind: CollectionKind) -> Result<(), TeleError>;

    /// The collector copied the object at `from` to `to`.
    fn object_relocated(
        &mut self,
        from: Address,
        to: Address,
        kind: CollectionKind,
    ) -> Result<(), TeleError>;

    /// One forwarding hop.
    fn resolve_forwarding(&self, handle: &RemoteRef) -> RemoteRef {
        handle.forwarded_to().unwrap_or_else(|| handle.clone())
    }

    /// Handles still held by debugger code.
    fn tracked(&self) -> Vec<RemoteRef>;

    fn root_slots_used(&self) -> usize;

    /// Drop all state without touching the target.
    fn detach(&mut self);
}
