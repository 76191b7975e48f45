//! User-space NUMA-aware runtime optimizer.
//!
//! Observes a target process tree on a multi-socket Linux machine, samples
//! hardware performance counters to learn where each thread runs and where
//! its memory lives, and issues two kinds of corrective actions: migrating
//! threads between CPUs/nodes so their compute cost meets their data, and
//! migrating memory pages between NUMA nodes so their data meets their
//! compute. See `DESIGN.md` for the grounding of each module.

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;

pub mod child;
pub mod config;
pub mod control_loop;
pub mod csv_export;
pub mod error;
pub mod events;
pub mod migration;
pub mod model;
pub mod perf;
pub mod proc;
pub mod raw;
pub mod router;
pub mod strategy;
pub mod tickets;
pub mod topology;
pub mod verbosity;

pub use error::{Error, Result};
