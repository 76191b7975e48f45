//! Process tree (spec section 4.2) and memory-map tracker (spec section 4.4).

pub mod memmap;
pub mod process;

pub use process::{Process, ProcessState, ProcessTree};
