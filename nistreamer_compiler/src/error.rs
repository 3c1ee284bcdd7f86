//! Error types shared by the compiler and the streaming controller.
//!
//! Validation errors ([`StreamerError::Overlap`], [`StreamerError::InvalidRange`],
//! [`StreamerError::DuplicateChannel`], [`StreamerError::SyncConfig`], ...) are raised before
//! any backend call is issued, so the caller can correct the input and retry.
//! [`StreamerError::Backend`] wraps an opaque failure surfaced by the external streaming backend
//! and is never retried.

use thiserror::Error;

/// Opaque failure reported by a [`StreamBackend`](crate::backend::StreamBackend) implementation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{msg}")]
pub struct BackendError {
    pub msg: String,
}

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamerError {
    #[error("channel {chan}: instruction {new} overlaps with existing instruction {existing}")]
    Overlap {
        chan: String,
        new: String,
        existing: String,
    },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("card {0} is already registered")]
    DuplicateCard(String),

    #[error("channel {chan} is already registered on card {card}")]
    DuplicateChannel { card: String, chan: String },

    #[error("expected channel name of format '{expected}' yet received '{name}'")]
    InvalidChannelName { name: String, expected: String },

    #[error("card {name} not found. Registered cards are {registered:?}")]
    UnknownCard {
        name: String,
        registered: Vec<String>,
    },

    #[error("card {card} has no channel {chan}. Registered channels are {registered:?}")]
    UnknownChannel {
        card: String,
        chan: String,
        registered: Vec<String>,
    },

    #[error("channel {card}/{chan} does not accept {instr} instructions")]
    WrongChannelKind {
        card: String,
        chan: String,
        instr: String,
    },

    #[error("not compiled: {0}")]
    NotCompiled(String),

    #[error("invalid synchronization config: {0}")]
    SyncConfig(String),

    #[error("worker for card {card} failed: {msg}")]
    Worker { card: String, msg: String },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, StreamerError>;

#[cfg(test)]
mod test {
    use crate::error::*;

    #[test]
    fn backend_error_converts() {
        fn failing() -> Result<()> {
            Err(BackendError::new("DAQmx -200077"))?;
            Ok(())
        }
        let err = failing().unwrap_err();
        assert_eq!(err, StreamerError::Backend(BackendError::new("DAQmx -200077")));
        assert_eq!(err.to_string(), "backend error: DAQmx -200077");
    }

    #[test]
    fn unknown_card_lists_registered() {
        let err = StreamerError::UnknownCard {
            name: "PXI1Slot9".to_string(),
            registered: vec!["PXI1Slot3".to_string()],
        };
        assert!(err.to_string().contains("PXI1Slot3"));
    }
}
