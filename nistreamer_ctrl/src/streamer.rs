//! The [`Streamer`] struct: a card registry that also drives runs.
//!
//! It carries the same fields as [`nistreamer_compiler::Experiment`], so every registration,
//! instruction and compile method comes from [`BaseExperiment`]. On top of that it implements
//! [`SyncController`] for the run lifecycle:
//!
//! ```rust
//! use std::sync::Arc;
//! use nistreamer_compiler::*;
//! use nistreamer_ctrl::*;
//!
//! let mut streamer = Streamer::new(Arc::new(RecordingBackend::new()));
//! streamer.add_ao_card("PXI1Slot3", 1e6).unwrap();
//! let ao0 = streamer.add_ao_chan("PXI1Slot3", 0, 0.0).unwrap();
//! streamer.constant(&ao0, 0.0, 1.0, 5.0, false).unwrap();
//! streamer.compile(None).unwrap();
//!
//! let summary = streamer.run(2, 50.0).unwrap();
//! assert_eq!(summary.reps_done, 2);
//! ```

use std::sync::Arc;

use indexmap::IndexMap;

use nistreamer_compiler::*;

use crate::controller::SyncController;

pub struct Streamer {
    cards: IndexMap<String, Card>,
    sync_state: SyncState,
    backend: Arc<dyn StreamBackend>,
    compiled: Option<CompiledProgram>,
}

impl_exp_boilerplate!(Streamer);

impl SyncController for Streamer {}

impl Streamer {
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self {
            cards: IndexMap::new(),
            sync_state: SyncState::default(),
            backend,
            compiled: None,
        }
    }
}
