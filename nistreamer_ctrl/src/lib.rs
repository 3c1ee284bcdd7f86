//! Synchronized multi-card streaming on top of `nistreamer_compiler`.
//!
//! [`Streamer`] is a card registry with the run lifecycle of [`SyncController`]: configure every
//! active card on its own worker thread, start the cards in the required order, stream the
//! requested repetitions and always tear down. [`StreamRunner`] adds cooperative cancellation
//! between repetitions.

pub mod controller;
pub mod runner;
pub mod streamer;
pub mod utils;
pub mod worker;
pub mod worker_cmd_chan;

#[cfg(feature = "python")]
pub mod python;

pub use crate::controller::{RunGuard, RunState, SyncController};
pub use crate::runner::{RunSummary, StreamCfg, StreamRunner};
pub use crate::streamer::Streamer;
pub use crate::utils::{CancelToken, StartLatch};
