//! Typed, immutable samples produced by the sample router from decoded
//! ring-buffer records (spec section 3).

use libc::pid_t;

use crate::topology::CpuId;

pub type Tid = pid_t;

/// A single load sample from the latency-gated MEM event group.
#[derive(Clone, Copy, Debug)]
pub struct MemorySample {
    pub cpu: CpuId,
    pub pid: pid_t,
    pub tid: Tid,
    pub time_running_ns: u64,
    pub reqs: f64,
    pub address: u64,
    pub page: u64,
    pub latency: u64,
    pub pagesize: u64,
    pub data_source: u64,
    pub page_node: usize,
}

/// A retired-instruction or floating-point-group sample.
#[derive(Clone, Copy, Debug)]
pub struct InstructionSample {
    pub cpu: CpuId,
    pub pid: pid_t,
    pub tid: Tid,
    pub time_running_ns: u64,
    pub inst_count: u64,
    pub multiplier: u32,
    pub is_flop: bool,
}

/// An offcore memory-request sample.
#[derive(Clone, Copy, Debug)]
pub struct RequestSample {
    pub cpu: CpuId,
    pub pid: pid_t,
    pub tid: Tid,
    pub time_running_ns: u64,
    pub reqs: u64,
}
