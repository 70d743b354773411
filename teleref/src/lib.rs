mod address;
mod backend;
mod canonical;
mod channel;
mod error;
mod gc_phase;
mod gen_ss_backend;
mod local;
mod reference;
mod root_table;
mod scheme;
mod settings;
mod simulated;
mod table_backend;

pub use address::{Address, Epoch, Oid};
pub use channel::{CollectorKind, HeapRegion, ProcessChannel, TargetInfo};
pub use error::{ChannelError, TeleError};
pub use gc_phase::{CollectionKind, GcPhaseState, GcPhaseTracker};
pub use reference::{ObjectStatus, RemoteRef};
pub use root_table::{RootCache, RootSlot, RootTable};
pub use scheme::{ReferenceScheme, ReferenceStats};
pub use settings::{MAX_ROOTS, TeleCreateInfo, TeleSettings};
pub use simulated::{OBJECT_WORDS, ROOT_TABLE_BASE, SimulatedTarget};
