use thiserror::Error;

use crate::Address;

/// Failures of the process channel. Transient: the next epoch retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("failed to read target memory at {address}")]
    Read { address: Address },

    #[error("failed to write target memory at {address}")]
    Write { address: Address },

    #[error("short read at {address}: expected {expected} words, got {got}")]
    ShortRead {
        address: Address,
        expected: usize,
        got: usize,
    },

    #[error("target process is no longer attached")]
    Detached,
}

#[derive(Debug, Error)]
pub enum TeleError {
    /// Tracker and collector disagree about the heap phase. Fatal.
    #[error("protocol violation in {operation}: {detail}")]
    ProtocolViolation {
        operation: &'static str,
        detail: String,
    },

    #[error(transparent)]
    ChannelFailure(#[from] ChannelError),

    #[error("root table exhausted ({capacity} slots)")]
    CapacityExceeded { capacity: usize },

    #[error("invalid reference: {reason}")]
    InvalidReference { reason: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("inspection session has been detached")]
    Detached,
}

impl TeleError {
    pub(crate) fn violation(
        operation: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        TeleError::ProtocolViolation {
            operation,
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TeleError::InvalidReference {
            reason: reason.into(),
        }
    }

    /// Errors after which the session cannot continue.
    ///
    /// The scheme only detaches on its own for a `ProtocolViolation`. A
    /// `CapacityExceeded` is handed back with the session still attached so
    /// existing handles stay queryable; the caller is expected to `detach()`
    /// once it is done with them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TeleError::ProtocolViolation { .. }
                | TeleError::CapacityExceeded { .. }
                | TeleError::InvalidSettings(_)
                | TeleError::Detached
        )
    }

    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_splits_fatal_from_recoverable() {
        let address = Address::new(0x40).expect("non-zero");
        assert!(TeleError::violation("analysis_begins", "x").is_fatal());
        assert!(TeleError::CapacityExceeded { capacity: 4 }.is_fatal());
        assert!(TeleError::from(ChannelError::Read { address }).is_recoverable());
        assert!(TeleError::invalid("dead").is_recoverable());
    }

    #[test]
    fn channel_error_is_transparent() {
        let address = Address::new(0x40).expect("non-zero");
        let err = TeleError::from(ChannelError::Write { address });
        assert_eq!(err.to_string(), "failed to write target memory at 0x40");
    }
}
