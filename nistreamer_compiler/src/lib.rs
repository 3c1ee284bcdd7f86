//! Timeline compiler for synchronized NI output cards.
//!
//! Instructions are added per channel through an explicit registry ([`Experiment`] or any type
//! implementing [`BaseExperiment`]), placed on each card's own clock grid, and compiled into a
//! read-only [`CompiledProgram`] that can be sampled with [`BaseExperiment::calc_signal`].
//!
//! Everything that touches the driver goes through a [`StreamBackend`].

pub mod backend;
pub mod card;
pub mod channel;
pub mod error;
pub mod experiment;
pub mod instruction;
pub mod program;
pub mod utils;

pub use backend::*;
pub use card::*;
pub use channel::*;
pub use error::*;
pub use experiment::*;
pub use instruction::*;
pub use program::*;
pub use utils::*;
