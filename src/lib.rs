//! Core library for the observing-block sequencer.
//!
//! This library validates observing blocks and drives them through the
//! configure, execute and cleanup phases against an instrument's device bus,
//! under a cross-process execution lock. It is used by the `obseq` command-line
//! runner and can be embedded in other control software.

pub mod action;
pub mod alert;
pub mod bus;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod ob;
pub mod orchestrator;

pub use error::{FailureKind, SequencerError, SequencerResult};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunReport};
