//! Opens and polls one `perf_event_open(2)` counter per (tid, event group),
//! decodes their ring buffers, and emits samples tagged by group (spec
//! section 4.3). Grounded on the teacher's counter-opening code
//! (`anp-perf_events`), generalized from a single `PidConfig`/`CpuConfig`
//! pair to the fixed ten-group set in `events::EventGroup`.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use libc::pid_t;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::events::EventGroup;
use crate::perf::record::{decode, Record, SampleLayout};
use crate::perf::ring_buffer::RingBuffer;
use crate::raw::perf_event_open;
use crate::topology::CpuId;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

/// Ring buffer size: 1 header page + 8 data pages, matching the teacher's
/// default (`anp-perf_events`' `CountsBuilder`).
const DATA_PAGES: usize = 8;

/// Number of consecutive open/read failures for a single TID before the
/// sampler gives up on it for this run (spec section 15, Open Question:
/// "MAX_FAILURES is left unquantified by the distillation"; resolved in
/// `DESIGN.md`).
pub const MAX_FAILURES: u32 = 5;

/// One decoded sample, tagged with the event group and CPU it was recorded
/// on. The router resolves page/node membership and feeds the performance
/// tables; the sampler only decodes bytes.
#[derive(Clone, Copy, Debug)]
pub struct DecodedSample {
    pub group: EventGroup,
    pub cpu: CpuId,
    pub pid: pid_t,
    pub tid: pid_t,
    pub time_running_ns: u64,
    pub address: u64,
    pub latency: u64,
    pub data_source: u64,
}

struct OpenCounter {
    fd: RawFd,
    ring: RingBuffer,
    layout: SampleLayout,
    /// True until this counter's first record has been seen and discarded
    /// (spec section 4.3: "the first sample of each type per CPU after
    /// (re)enable is discarded because counter values are cumulative and
    /// the delta against an older baseline is meaningless"). This rebuild
    /// tracks the baseline per (tid, group) rather than per (cpu, group) —
    /// see `DESIGN.md` for why the sampler is organized by tid instead of
    /// by cpu.
    awaiting_baseline: bool,
}

impl Drop for OpenCounter {
    fn drop(&mut self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0);
            libc::close(self.fd);
        }
    }
}

struct TidCounters {
    counters: HashMap<EventGroup, OpenCounter>,
}

pub struct Sampler {
    groups: Vec<EventGroup>,
    freq_instr: u64,
    freq_memory: u64,
    min_latency: u32,
    tids: HashMap<pid_t, TidCounters>,
    failures: HashMap<pid_t, u32>,
    gone: std::collections::HashSet<pid_t>,
    /// Consecutive corrupt-record counts per tid, independent of `failures`
    /// (open/read failures give up on a tid permanently; a run of corrupt
    /// records instead triggers a full tear-down and re-init — spec section
    /// 7's "emergency" category: "failure count for sample decoding exceeds
    /// MAX_FAILURES; the loop tears down the sampler and re-initializes
    /// it", scoped here per-tid since each tid's counters are independent).
    corrupt: HashMap<pid_t, u32>,
    /// Number of hardware counters the platform exposes; when smaller than
    /// `groups.len()` the sampler rotates which groups are enabled on every
    /// `rotate()` call instead of holding every group open at once (spec
    /// section 4.3: "the sampler rotates the enabled set on every tick,
    /// enabling at most HW_COUNTERS groups at a time").
    hw_counters: usize,
    rotation_offset: usize,
    active: Vec<EventGroup>,
}

impl Sampler {
    pub fn new(groups: Vec<EventGroup>, freq_instr: u64, freq_memory: u64, min_latency: u32) -> Self {
        Self::with_hw_counters(groups.clone(), freq_instr, freq_memory, min_latency, groups.len())
    }

    /// As `new`, but caps the number of simultaneously-open groups per tid
    /// at `hw_counters`, rotating the active subset on `rotate()`.
    pub fn with_hw_counters(
        groups: Vec<EventGroup>,
        freq_instr: u64,
        freq_memory: u64,
        min_latency: u32,
        hw_counters: usize,
    ) -> Self {
        let hw_counters = hw_counters.max(1).min(groups.len().max(1));
        let active = groups.iter().take(hw_counters).copied().collect();
        Sampler {
            groups,
            freq_instr,
            freq_memory,
            min_latency,
            tids: HashMap::new(),
            failures: HashMap::new(),
            gone: std::collections::HashSet::new(),
            corrupt: HashMap::new(),
            hw_counters,
            rotation_offset: 0,
            active,
        }
    }

    /// True iff fewer groups fit in hardware than this optimizer wants to
    /// sample, i.e. multiplexing is actually in effect.
    pub fn is_multiplexed(&self) -> bool {
        self.hw_counters < self.groups.len()
    }

    pub fn active_groups(&self) -> &[EventGroup] {
        &self.active
    }

    /// Rotates the enabled group subset by one `hw_counters`-sized window
    /// (spec section 4.3) and re-opens every tracked tid's counters to
    /// match: groups leaving the active set are closed, groups entering it
    /// are opened fresh (and so start `awaiting_baseline`, per the spec's
    /// "first sample after (re)enable is discarded").
    pub fn rotate(&mut self) {
        if !self.is_multiplexed() {
            return;
        }
        self.rotation_offset = (self.rotation_offset + self.hw_counters) % self.groups.len();
        self.active = (0..self.hw_counters)
            .map(|i| self.groups[(self.rotation_offset + i) % self.groups.len()])
            .collect();

        let active = self.active.clone();
        let tids: Vec<pid_t> = self.tids.keys().copied().collect();
        for tid in tids {
            self.sync_active_groups(tid, &active);
        }
    }

    fn sync_active_groups(&mut self, tid: pid_t, active: &[EventGroup]) {
        let freq_instr = self.freq_instr;
        let freq_memory = self.freq_memory;
        let min_latency = self.min_latency;
        let Some(tc) = self.tids.get_mut(&tid) else {
            return;
        };

        tc.counters.retain(|group, _| active.contains(group));

        for &group in active {
            if tc.counters.contains_key(&group) {
                continue;
            }
            let freq = if group.is_memory() { freq_memory } else { freq_instr };
            if let Ok(c) = open_one(tid, group, freq, min_latency) {
                tc.counters.insert(group, c);
            }
        }
    }

    pub fn is_tracked(&self, tid: pid_t) -> bool {
        self.tids.contains_key(&tid)
    }

    pub fn has_given_up(&self, tid: pid_t) -> bool {
        self.gone.contains(&tid)
    }

    /// Opens every enabled event group for `tid`. Per-group failures are
    /// logged and skipped rather than aborting the whole TID (a platform may
    /// lack AVX-512 FP groups, for instance); a TID with zero successfully
    /// opened groups counts as one failure toward `MAX_FAILURES`.
    pub fn track(&mut self, tid: pid_t) {
        if self.tids.contains_key(&tid) || self.gone.contains(&tid) {
            return;
        }

        let mut counters = HashMap::new();
        let active = self.active.clone();
        for &group in &active {
            let freq = if group.is_memory() { self.freq_memory } else { self.freq_instr };
            match open_one(tid, group, freq, self.min_latency) {
                Ok(c) => {
                    counters.insert(group, c);
                }
                Err(e) => {
                    debug!("perf_event_open failed for tid {} group {}: {}", tid, group, e);
                }
            }
        }

        if counters.is_empty() {
            self.note_failure(tid);
            return;
        }

        self.failures.remove(&tid);
        self.tids.insert(tid, TidCounters { counters });
    }

    pub fn untrack(&mut self, tid: pid_t) {
        self.tids.remove(&tid);
        self.failures.remove(&tid);
        self.gone.remove(&tid);
        self.corrupt.remove(&tid);
    }

    fn note_failure(&mut self, tid: pid_t) {
        let count = self.failures.entry(tid).or_insert(0);
        *count += 1;
        if *count >= MAX_FAILURES {
            warn!("tid {} exceeded {} consecutive sampling failures, giving up", tid, MAX_FAILURES);
            self.gone.insert(tid);
            self.failures.remove(&tid);
        }
    }

    /// Drains every tracked ring buffer, decodes its records, and returns the
    /// flattened sample list for this tick. A TID whose ring buffers are all
    /// empty and which reports no lost records is left alone; one whose
    /// `/proc` entry is known gone should be `untrack`-ed by the caller.
    pub fn poll(&mut self) -> Vec<DecodedSample> {
        let mut out = Vec::new();
        let mut needs_reinit: Vec<pid_t> = Vec::new();

        for (&tid, counters) in self.tids.iter_mut() {
            for (&group, counter) in counters.counters.iter_mut() {
                let bytes = counter.ring.drain();
                let mut pos = 0;
                while pos < bytes.len() {
                    match decode(&bytes[pos..], counter.layout) {
                        Some((record, consumed)) => {
                            pos += consumed;
                            match record {
                                Record::Sample(s) => {
                                    // spec section 4.3: "the first sample of
                                    // each type per CPU after (re)enable is
                                    // discarded because counter values are
                                    // cumulative and the delta against an
                                    // older baseline is meaningless" — here
                                    // tracked per (tid, group).
                                    if counter.awaiting_baseline {
                                        counter.awaiting_baseline = false;
                                        continue;
                                    }
                                    out.push(DecodedSample {
                                        group,
                                        cpu: s.cpu as CpuId,
                                        pid: s.pid,
                                        tid: s.tid,
                                        time_running_ns: s.period,
                                        address: s.addr,
                                        latency: s.weight,
                                        data_source: s.data_src,
                                    });
                                }
                                Record::Lost { lost, .. } => {
                                    debug!("tid {} group {} lost {} samples", tid, group, lost);
                                }
                                Record::Throttle { .. } | Record::Unthrottle { .. } | Record::Exit { .. } | Record::Other(_) => {}
                            }
                        }
                        None => {
                            // spec section 5: "partial or corrupt records
                            // are treated as buffer poisoning: the reader
                            // skips to the next page boundary and resets
                            // the per-(CPU,type) baseline." The remainder
                            // of this drain is undecodable, so stop here
                            // rather than risk mis-parsing garbage as a
                            // different record type.
                            warn!("tid {} group {} corrupt record at offset {}, resetting baseline", tid, group, pos);
                            counter.ring.reset_baseline();
                            counter.awaiting_baseline = true;

                            let count = self.corrupt.entry(tid).or_insert(0);
                            *count += 1;
                            if *count > MAX_FAILURES {
                                needs_reinit.push(tid);
                            }
                            break;
                        }
                    }
                }
            }
        }

        // Emergency tear-down and re-init (spec section 7): a tid whose
        // corrupt-record count exceeded MAX_FAILURES gets every one of its
        // counters closed and reopened from scratch.
        for tid in needs_reinit {
            warn!("tid {} exceeded {} consecutive corrupt records, reinitializing its counters", tid, MAX_FAILURES);
            self.corrupt.remove(&tid);
            self.reinit(tid);
        }

        out
    }

    /// Re-opens every counter for `tid` from scratch, discarding whatever
    /// was buffered (spec section 4.3's baseline reset on re-init).
    pub fn reinit(&mut self, tid: pid_t) {
        self.tids.remove(&tid);
        self.track(tid);
    }
}

fn open_one(tid: pid_t, group: EventGroup, freq: u64, min_latency: u32) -> Result<OpenCounter> {
    let mut attr = group.attr(freq, min_latency);
    let fd = unsafe {
        perf_event_open(&mut attr as *mut _, tid, -1, -1, crate::raw::perf_flag::FD_CLOEXEC)
    };
    if fd < 0 {
        return Err(Error::FdOpen {
            inner: nix::Error::last(),
        });
    }

    let ring = RingBuffer::map(fd, DATA_PAGES).map_err(|e| {
        unsafe {
            libc::close(fd);
        }
        e
    })?;

    unsafe {
        libc::ioctl(fd, PERF_EVENT_IOC_RESET, 0);
        libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0);
    }

    Ok(OpenCounter {
        fd,
        ring,
        layout: SampleLayout::for_sample_type(attr.sample_type),
        awaiting_baseline: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_failures_is_a_small_positive_bound() {
        assert!(MAX_FAILURES > 0 && MAX_FAILURES < 100);
    }

    #[test]
    fn note_failure_gives_up_after_max_failures() {
        let mut sampler = Sampler::new(vec![], 100, 100, 30);
        for _ in 0..MAX_FAILURES {
            sampler.note_failure(1234);
        }
        assert!(sampler.has_given_up(1234));
    }

    #[test]
    fn rotation_cycles_through_every_group_on_a_constrained_machine() {
        // 10 groups, 4 hw counters: S5 expects every group to become active
        // at least once within ceil(10/4) = 3 rotations.
        let mut sampler = Sampler::with_hw_counters(EventGroup::ALL.to_vec(), 100, 100, 30, 4);
        assert!(sampler.is_multiplexed());

        let mut seen: std::collections::HashSet<EventGroup> = sampler.active_groups().iter().copied().collect();
        for _ in 0..3 {
            sampler.rotate();
            seen.extend(sampler.active_groups().iter().copied());
        }

        for group in EventGroup::ALL.iter() {
            assert!(seen.contains(group), "group {:?} never became active", group);
        }
    }

    #[test]
    fn unconstrained_machine_is_not_multiplexed() {
        let sampler = Sampler::new(EventGroup::ALL.to_vec(), 100, 100, 30);
        assert!(!sampler.is_multiplexed());
        assert_eq!(sampler.active_groups().len(), EventGroup::ALL.len());
    }
}
