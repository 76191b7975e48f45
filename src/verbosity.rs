//! Per-category verbosity gate, decoupled from the ambient `RUST_LOG`/`log`
//! level (spec section 7: "at verbose level >= 1 each failure category
//! prints a single line... at higher levels full tables and discarded
//! samples are dumped"). Mirrors `utils/verbose.hpp`'s `print_with_lvl` in
//! the original source: a single running threshold compared against a
//! call-site level, rather than the `log` crate's per-module filters.

use std::sync::atomic::{AtomicU8, Ordering};

/// Failure lines and one-line summaries (spec section 7's baseline).
pub const LVL1: u8 = 1;
/// Per-iteration table dumps.
pub const LVL2: u8 = 2;
/// Per-strategy candidate detail.
pub const LVL3: u8 = 3;
/// Discarded/dropped sample detail.
pub const LVL4: u8 = 4;
/// Everything, including raw record dumps.
pub const LVL5: u8 = 5;

static THRESHOLD: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide verbosity threshold from `-v/--verbose` (0..5).
pub fn set_level(level: u8) {
    THRESHOLD.store(level.min(5), Ordering::Relaxed);
}

pub fn level() -> u8 {
    THRESHOLD.load(Ordering::Relaxed)
}

/// True iff `lvl` is at or below the configured threshold, i.e. whether a
/// call site gated at `lvl` should print.
pub fn should_print(lvl: u8) -> bool {
    lvl <= level()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_follows_threshold() {
        set_level(2);
        assert!(should_print(LVL1));
        assert!(should_print(LVL2));
        assert!(!should_print(LVL3));
        set_level(0);
        assert!(!should_print(LVL1));
    }
}
