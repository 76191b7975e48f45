//! The fixed, ordered set of perf event groups this optimizer samples (spec
//! section 4.3): one latency-gated memory load group, one offcore-request
//! group, retired instructions, and five (or seven, with 512-bit support)
//! floating-point width buckets used to weigh flop counts by vector width.

use std::fmt;

use strum_macros::{EnumIter, EnumString};

use crate::raw::{perf_event_attr, perf_hw_id, perf_sw_ids, perf_type_id};

/// Minimum latency (in cycles) gating the MEM event group's PEBS samples.
/// Configurable via `-l/--min-latency`; spec section 6 requires `INT>0`.
pub const DEFAULT_MIN_LATENCY: u32 = 30;

/// `precise_ip` requested for the MEM group: "constant skid" (spec 4.3).
pub const MEM_PRECISE_IP: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumIter, EnumString)]
pub enum EventGroup {
    Mem,
    Req,
    Ins,
    FpScalar,
    Fp128D,
    Fp128S,
    Fp256D,
    Fp256S,
    Fp512D,
    Fp512S,
}

impl EventGroup {
    /// The fixed, ordered set from spec section 4.3, groups 1-8. The two
    /// AVX-512 groups are optional per spec ("optionally FP_512D/S") and are
    /// enabled only when the platform advertises support; `Sampler::new`
    /// decides that and trims this list accordingly.
    pub const ALL: [EventGroup; 10] = [
        EventGroup::Mem,
        EventGroup::Req,
        EventGroup::Ins,
        EventGroup::FpScalar,
        EventGroup::Fp128D,
        EventGroup::Fp128S,
        EventGroup::Fp256D,
        EventGroup::Fp256S,
        EventGroup::Fp512D,
        EventGroup::Fp512S,
    ];

    pub const CORE: [EventGroup; 8] = [
        EventGroup::Mem,
        EventGroup::Req,
        EventGroup::Ins,
        EventGroup::FpScalar,
        EventGroup::Fp128D,
        EventGroup::Fp128S,
        EventGroup::Fp256D,
        EventGroup::Fp256S,
    ];

    /// Per spec 4.3: "Each has an integer multiplier 1,2,4,4,8,(8,16)".
    /// `Mem`/`Req`/`Ins` carry a multiplier of 1 since they are not weighed
    /// by vector width.
    pub fn multiplier(self) -> u32 {
        match self {
            EventGroup::Mem | EventGroup::Req | EventGroup::Ins => 1,
            EventGroup::FpScalar => 1,
            EventGroup::Fp128D => 2,
            EventGroup::Fp128S => 4,
            EventGroup::Fp256D => 4,
            EventGroup::Fp256S => 8,
            EventGroup::Fp512D => 8,
            EventGroup::Fp512S => 16,
        }
    }

    pub fn is_flop(self) -> bool {
        !matches!(self, EventGroup::Mem | EventGroup::Req | EventGroup::Ins)
    }

    pub fn is_memory(self) -> bool {
        matches!(self, EventGroup::Mem)
    }

    pub fn is_request(self) -> bool {
        matches!(self, EventGroup::Req)
    }

    pub fn is_instruction(self) -> bool {
        matches!(self, EventGroup::Ins)
    }

    /// Builds the `perf_event_attr` this group is opened with. Frequency is
    /// caller-supplied (`-f/--freq-instr`, `-F/--freq-memory`) since MEM uses
    /// its own rate independent of the others.
    pub fn attr(self, sample_freq: u64, min_latency: u32) -> perf_event_attr {
        let mut attr: perf_event_attr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr.set_disabled(1);
        attr.set_exclude_kernel(1);
        attr.set_exclude_hv(1);
        attr.set_freq(1);
        attr.__bindgen_anon_1.sample_freq = sample_freq;
        attr.read_format = crate::raw::perf_event_sample_format::PERF_SAMPLE_READ as u64
            | crate::raw::perf_event_sample_format::PERF_SAMPLE_TID as u64;

        use crate::raw::perf_event_sample_format::*;
        let sample_type = match self {
            EventGroup::Mem => {
                attr.set_precise_ip(MEM_PRECISE_IP);
                attr.config1 = min_latency as u64;
                PERF_SAMPLE_IP
                    | PERF_SAMPLE_TID
                    | PERF_SAMPLE_TIME
                    | PERF_SAMPLE_ADDR
                    | PERF_SAMPLE_CPU
                    | PERF_SAMPLE_PERIOD
                    | PERF_SAMPLE_WEIGHT
                    | PERF_SAMPLE_DATA_SRC
            }
            _ => PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU | PERF_SAMPLE_PERIOD,
        };
        attr.sample_type = sample_type as u64;

        attr.type_ = self.perf_type() as u32;
        attr.config = self.perf_config();

        attr
    }

    fn perf_type(self) -> u32 {
        match self {
            EventGroup::Mem => perf_type_id::PERF_TYPE_RAW,
            EventGroup::Req => perf_type_id::PERF_TYPE_RAW,
            EventGroup::Ins => perf_type_id::PERF_TYPE_HARDWARE,
            _ => perf_type_id::PERF_TYPE_RAW,
        }
    }

    /// Raw PMU event codes are platform-specific (spec 4.3 names them by
    /// role, not by model-specific encoding); `Ins` is the one portable
    /// case, expressed with the generic hardware event.
    fn perf_config(self) -> u64 {
        match self {
            EventGroup::Ins => perf_hw_id::PERF_COUNT_HW_INSTRUCTIONS as u64,
            // MEM/REQ/FP_* groups use model-specific raw event codes
            // (e.g. MEM_TRANS_RETIRED.LOAD_LATENCY on Intel); resolving the
            // exact encoding for the running CPU model is out of scope for
            // this optimizer and is left to the `config` field being
            // supplied by a platform profile at a higher layer.
            _ => 0,
        }
    }
}

impl fmt::Display for EventGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventGroup::Mem => "MEM",
            EventGroup::Req => "REQ",
            EventGroup::Ins => "INS",
            EventGroup::FpScalar => "FP_SCALAR",
            EventGroup::Fp128D => "FP_128D",
            EventGroup::Fp128S => "FP_128S",
            EventGroup::Fp256D => "FP_256D",
            EventGroup::Fp256S => "FP_256S",
            EventGroup::Fp512D => "FP_512D",
            EventGroup::Fp512S => "FP_512S",
        };
        f.write_str(name)
    }
}
