//! Thin re-export of the kernel `perf_event_open(2)` ABI.
//!
//! The upstream `anp-perf_events` crate generated these bindings at build
//! time with `bindgen` against a vendored copy of `linux/perf_event.h`. This
//! rebuild instead depends on `perf-event-open-sys`, the bindings crate the
//! wider perf-event-open ecosystem (see `jimblandy/perf-event` and
//! `Thaumy/perf-event-open`) settled on: it ships the same generated
//! `perf_event_attr`/`perf_event_mmap_page` layout without requiring a
//! C compiler or kernel headers on the build machine.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(unused)]

pub use perf_event_open_sys::bindings::{
    perf_event_attr, perf_event_header, perf_event_mmap_page, perf_event_sample_format,
    perf_event_type, perf_hw_cache_id, perf_hw_cache_op_id, perf_hw_cache_op_result_id,
    perf_hw_id, perf_sw_ids, perf_type_id,
};
pub use perf_event_open_sys::perf_event_open;

/// `PERF_FLAG_*` values for the `flags` argument of `perf_event_open(2)`.
pub mod perf_flag {
    pub const FD_NO_GROUP: libc::c_ulong = 1 << 0;
    pub const FD_OUTPUT: libc::c_ulong = 1 << 1;
    pub const PID_CGROUP: libc::c_ulong = 1 << 2;
    pub const FD_CLOEXEC: libc::c_ulong = 1 << 3;
}

/// Record types found in `perf_event_header.type`. Only the subset this
/// optimizer consumes (per spec section 4.3: samples, lost, throttle,
/// unthrottle, and exit records) is named; anything else is treated as
/// "other" by the decoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    Mmap = 1,
    Lost = 2,
    Comm = 3,
    Exit = 4,
    Throttle = 5,
    Unthrottle = 6,
    Fork = 7,
    Sample = 9,
    Other(u32),
}

impl RecordType {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => RecordType::Mmap,
            2 => RecordType::Lost,
            3 => RecordType::Comm,
            4 => RecordType::Exit,
            5 => RecordType::Throttle,
            6 => RecordType::Unthrottle,
            7 => RecordType::Fork,
            9 => RecordType::Sample,
            other => RecordType::Other(other),
        }
    }
}
