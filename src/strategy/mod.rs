//! Thread- and memory-migration strategies (spec section 4.7, 4.8) plus the
//! CPU/node load-balance pre-step (spec section 4.9) and node-level
//! simulated annealing (spec section 4.7's `ANNEAL_NODE`).

pub mod annealing;
pub mod balance;
pub mod memory;
pub mod thread;

pub use memory::{MemoryMigrationDecision, MemoryStrategyKind};
pub use thread::{ThreadMigrationDecision, ThreadStrategyKind};
