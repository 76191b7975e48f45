//! The weighted-lottery ticket system shared by every thread-migration
//! strategy (spec section 3, 4.7; `SPEC_FULL.md` section 14 on mutability).
//!
//! Ticket weights are *runtime state*, not compile-time constants, per the
//! original `tickets.cpp`: IMAR2 mutates them after comparing pre/post
//! migration performance. This rebuild scopes that mutable state inside
//! `TicketConstants`, owned by the run's `OptimizerState`, instead of a
//! process-wide global (spec section 9's instruction to avoid globals).

use std::fmt;
use std::fs;
use std::io::Write;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bitmask recording which ticket constants contributed to a `Tickets`
    /// value, per spec section 3.
    pub struct TicketMask: u8 {
        const MEM_CELL_WORSE    = 0b0000_0001;
        const MEM_CELL_NO_DATA  = 0b0000_0010;
        const MEM_CELL_BETTER   = 0b0000_0100;
        const FREE_CORE         = 0b0000_1000;
        const PREF_NODE         = 0b0001_0000;
        const UNDER_PERF        = 0b0010_0000;
    }
}

/// A weighted-lottery score: a real-valued weight plus a mask of which
/// ticket constants contributed. Addition sums weights and ORs masks;
/// subtraction subtracts weights and XORs masks (spec section 3, invariant
/// 4 in section 8: applying `-=` with the same value restores prior state).
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct Tickets {
    value: f64,
    mask: TicketMask,
}

impl Tickets {
    pub fn new(value: f64, mask: TicketMask) -> Self {
        Tickets { value, mask }
    }

    pub fn zero() -> Self {
        Tickets {
            value: 0.0,
            mask: TicketMask::empty(),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn mask(&self) -> TicketMask {
        self.mask
    }
}

impl Add for Tickets {
    type Output = Tickets;
    fn add(self, rhs: Tickets) -> Tickets {
        Tickets {
            value: self.value + rhs.value,
            mask: self.mask | rhs.mask,
        }
    }
}

impl AddAssign for Tickets {
    fn add_assign(&mut self, rhs: Tickets) {
        self.value += rhs.value;
        self.mask |= rhs.mask;
    }
}

impl Sub for Tickets {
    type Output = Tickets;
    fn sub(self, rhs: Tickets) -> Tickets {
        Tickets {
            value: self.value - rhs.value,
            mask: self.mask ^ rhs.mask,
        }
    }
}

impl SubAssign for Tickets {
    fn sub_assign(&mut self, rhs: Tickets) {
        self.value -= rhs.value;
        self.mask ^= rhs.mask;
    }
}

impl fmt::Display for Tickets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Defaults from spec section 6: 1, 2, 4, 2, 4, 3, 0.8, 0.9.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TicketConstants {
    pub mem_cell_worse: f64,
    pub mem_cell_no_data: f64,
    pub mem_cell_better: f64,
    pub free_core: f64,
    pub pref_node: f64,
    pub under_perf: f64,
    pub perf_threshold: f64,
    pub undo_threshold: f64,
}

impl Default for TicketConstants {
    fn default() -> Self {
        TicketConstants {
            mem_cell_worse: 1.0,
            mem_cell_no_data: 2.0,
            mem_cell_better: 4.0,
            free_core: 2.0,
            pref_node: 4.0,
            under_perf: 3.0,
            perf_threshold: 0.8,
            undo_threshold: 0.9,
        }
    }
}

/// Range, as a fraction, of the uniform draw `r` used by `mutate`: ticket
/// constants scale by `(1 + sign(delta) * r)`, `r` in `[0, range)`.
pub const DEFAULT_MUTATION_RANGE: f64 = 0.05;

impl TicketConstants {
    pub fn mem_cell_worse(&self) -> Tickets {
        Tickets::new(self.mem_cell_worse, TicketMask::MEM_CELL_WORSE)
    }

    pub fn mem_cell_no_data(&self) -> Tickets {
        Tickets::new(self.mem_cell_no_data, TicketMask::MEM_CELL_NO_DATA)
    }

    pub fn mem_cell_better(&self) -> Tickets {
        Tickets::new(self.mem_cell_better, TicketMask::MEM_CELL_BETTER)
    }

    pub fn free_core(&self) -> Tickets {
        Tickets::new(self.free_core, TicketMask::FREE_CORE)
    }

    /// Linearly scaled by `local_distance/distance(dst, preferred_node)`
    /// (spec section 4.7); full value only when `dst == preferred_node`.
    pub fn pref_node(&self, distance_to_preferred: u32, local_distance: u32) -> Tickets {
        let scale = if distance_to_preferred == 0 {
            1.0
        } else {
            f64::from(local_distance) / f64::from(distance_to_preferred)
        };
        Tickets::new(self.pref_node * scale, TicketMask::PREF_NODE)
    }

    pub fn under_perf(&self) -> Tickets {
        Tickets::new(self.under_perf, TicketMask::UNDER_PERF)
    }

    /// Mutates the constants whose mask contributed to `mask`, scaling each
    /// by `(1 + sign(improvement) * r)` with `r` drawn uniformly from
    /// `[0, range)`. Only IMAR2 invokes this (spec section 4.7, `SPEC_FULL.md`
    /// section 14).
    pub fn mutate(&mut self, mask: TicketMask, improvement: f64, range: f64, rng: &mut impl Rng) {
        let sign = if improvement > 0.0 {
            1.0
        } else if improvement < 0.0 {
            -1.0
        } else {
            0.0
        };
        let r = rng.gen_range(0.0..range);
        let factor = 1.0 + sign * r;

        if mask.contains(TicketMask::MEM_CELL_WORSE) {
            self.mem_cell_worse *= factor;
        }
        if mask.contains(TicketMask::MEM_CELL_NO_DATA) {
            self.mem_cell_no_data *= factor;
        }
        if mask.contains(TicketMask::MEM_CELL_BETTER) {
            self.mem_cell_better *= factor;
        }
        if mask.contains(TicketMask::FREE_CORE) {
            self.free_core *= factor;
        }
        if mask.contains(TicketMask::PREF_NODE) {
            self.pref_node *= factor;
        }
        if mask.contains(TicketMask::UNDER_PERF) {
            self.under_perf *= factor;
        }
    }

    /// Reads the tickets file (spec section 6: one scalar per line, in
    /// order). On any parse error, defaults are used and a warning logged;
    /// never panics.
    pub fn read_file(path: &Path) -> Self {
        match Self::try_read_file(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("tickets file {:?} unreadable, using defaults: {}", path, e);
                Self::default()
            }
        }
    }

    fn try_read_file(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let mut next = || -> std::io::Result<f64> {
            lines
                .next()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "too few lines"))?
                .trim()
                .parse::<f64>()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        };

        Ok(TicketConstants {
            mem_cell_worse: next()?,
            mem_cell_no_data: next()?,
            mem_cell_better: next()?,
            free_core: next()?,
            pref_node: next()?,
            under_perf: next()?,
            perf_threshold: next()?,
            undo_threshold: next()?,
        })
    }

    /// Overwrites the tickets file with the current in-memory values, in the
    /// same order, at shutdown.
    pub fn write_file(&self, path: &Path) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "{}", self.mem_cell_worse)?;
        writeln!(file, "{}", self.mem_cell_no_data)?;
        writeln!(file, "{}", self.mem_cell_better)?;
        writeln!(file, "{}", self.free_core)?;
        writeln!(file, "{}", self.pref_node)?;
        writeln!(file, "{}", self.under_perf)?;
        writeln!(file, "{}", self.perf_threshold)?;
        writeln!(file, "{}", self.undo_threshold)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_is_commutative_and_associative() {
        let a = Tickets::new(1.0, TicketMask::FREE_CORE);
        let b = Tickets::new(2.0, TicketMask::PREF_NODE);
        let c = Tickets::new(3.0, TicketMask::UNDER_PERF);

        assert_eq!((a + b).value(), (b + a).value());
        assert_eq!((a + b).mask(), (b + a).mask());
        assert_eq!(((a + b) + c).value(), (a + (b + c)).value());
    }

    #[test]
    fn subtraction_restores_prior_state() {
        let a = Tickets::new(5.0, TicketMask::FREE_CORE | TicketMask::PREF_NODE);
        let b = Tickets::new(2.0, TicketMask::PREF_NODE);

        let sum = a + b;
        let restored = sum - b;

        assert_eq!(restored.value(), a.value());
        assert_eq!(restored.mask(), a.mask());
    }

    #[test]
    fn comparison_is_by_weight_only() {
        let a = Tickets::new(5.0, TicketMask::FREE_CORE);
        let b = Tickets::new(5.0, TicketMask::PREF_NODE);
        assert_eq!(a.value(), b.value());
        assert!(!(a.value() < b.value()) && !(b.value() < a.value()));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("tickets-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tickets.opt");
        fs::write(&path, "not-a-number\n").unwrap();

        let constants = TicketConstants::read_file(&path);
        assert_eq!(constants.mem_cell_worse, TicketConstants::default().mem_cell_worse);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn round_trips_through_file() {
        let dir = std::env::temp_dir().join(format!("tickets-test-rt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tickets.opt");

        let mut constants = TicketConstants::default();
        constants.free_core = 7.5;
        constants.write_file(&path).unwrap();

        let read_back = TicketConstants::read_file(&path);
        assert_eq!(read_back.free_core, 7.5);

        fs::remove_dir_all(&dir).ok();
    }
}
