//! # Chamber Bench Core Library
//!
//! Drives an environmental-chamber test bench: the chamber cycles between a
//! high and a low temperature plateau, and on every plateau the bench sweeps
//! three source voltages across up to ten devices under test, sampling each
//! one through a relay bank and a load analyzer and judging every reading
//! against a tolerance band.
//!
//! ## Crate Structure
//!
//! - **`cycle`**: the run state machine (`CycleRunner`), thermal and timed schedules.
//! - **`sweep`**: one pass over the voltage × device × read matrix (`SweepEngine`).
//! - **`hardware`**: instrument capability traits, serial drivers, the relay
//!   queue, and `DeviceChannel`, which layers retries over all of it.
//! - **`broadcast`**: the event topic observers subscribe to, with a debounced
//!   table stage.
//! - **`report`**: CSV artifacts per sweep, per plateau and per run.
//! - **`bench`**: `TestBench`, the ON/OFF control facade.
//! - **`control`**: `RunControl` run/stop flags and the stop-point vocabulary.
//! - **`config`**: settings snapshot loaded with figment and validated up front.
//! - **`judgment`**, **`matrix`**: G/N classification and the measurement grid.
//! - **`retry`**, **`error`**, **`logging`**: shared plumbing.

pub mod bench;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod cycle;
pub mod error;
pub mod hardware;
pub mod judgment;
pub mod logging;
pub mod matrix;
pub mod report;
pub mod retry;
pub mod sweep;

pub use bench::{ControlCommand, TestBench};
pub use config::BenchSettings;
pub use cycle::{CycleRunner, RunOutcome, ScheduleMode};
pub use error::{BenchError, BenchResult, ChannelError};
