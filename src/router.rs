//! Sample router (spec section 4.5): classifies decoded samples by event
//! group, resolves the NUMA node a memory access actually touched, and feeds
//! the thread and page performance tables with an age weight that favors
//! samples taken closer to the next memory-migration tick.

use std::collections::HashMap;
use std::time::Instant;

use libc::pid_t;
use page_size::get as page_size;

use crate::migration::query_pages;
use crate::model::sample::{InstructionSample, MemorySample, RequestSample};
use crate::model::{PagePerfTable, ThreadPerfTable};
use crate::perf::DecodedSample;
use crate::proc::memmap::MemMapTracker;
use crate::topology::{NodeId, Topology};

pub struct Router {
    min_memory_migration_interval: f64,
    last_memory_migration: Instant,
}

impl Router {
    pub fn new(min_memory_migration_interval: f64) -> Self {
        Router {
            min_memory_migration_interval,
            last_memory_migration: Instant::now(),
        }
    }

    pub fn note_memory_migration(&mut self) {
        self.last_memory_migration = Instant::now();
    }

    /// `1 / (1 + max(0, min_interval - time_since_last_migration))`: weight 1
    /// once the interval has fully elapsed, decaying toward 0 for samples
    /// taken right after a migration just happened (spec section 4.5).
    pub fn age_weight(&self) -> f64 {
        let since = self.last_memory_migration.elapsed().as_secs_f64();
        let gap = (self.min_memory_migration_interval - since).max(0.0);
        1.0 / (1.0 + gap)
    }

    /// Classifies and routes one tick's worth of decoded samples into the
    /// thread and page tables. Memory samples' destination node is resolved
    /// through a per-tick address→node cache populated by one batched
    /// `move_pages(2)` query per PID (spec section 4.5), not a separate
    /// syscall per sample.
    pub fn route(
        &self,
        samples: &[DecodedSample],
        topology: &Topology,
        memmap: &MemMapTracker,
        threads: &mut ThreadPerfTable,
        pages: &mut PagePerfTable,
    ) {
        let weight = self.age_weight();
        let ps = page_size() as u64;

        let node_cache = build_node_cache(samples, ps);

        for s in samples {
            let src_node = safe_node_of_cpu(topology, s.cpu);

            if s.group.is_memory() {
                let page = s.address & !(ps - 1);
                let page_node = node_cache
                    .get(&(s.pid, page))
                    .copied()
                    .unwrap_or_else(|| resolve_fallback_node(memmap, s.pid, s.address, topology));
                let sample = MemorySample {
                    cpu: s.cpu,
                    pid: s.pid,
                    tid: s.tid,
                    time_running_ns: s.time_running_ns,
                    reqs: weight,
                    address: s.address,
                    page,
                    latency: s.latency,
                    pagesize: ps,
                    data_source: s.data_source,
                    page_node,
                };
                threads.add_memory(src_node, sample);
                pages.add_sample(src_node, &sample);
            } else if s.group.is_request() {
                let sample = RequestSample {
                    cpu: s.cpu,
                    pid: s.pid,
                    tid: s.tid,
                    time_running_ns: s.time_running_ns,
                    reqs: 1,
                };
                threads.add_request(src_node, sample);
            } else {
                let sample = InstructionSample {
                    cpu: s.cpu,
                    pid: s.pid,
                    tid: s.tid,
                    time_running_ns: s.time_running_ns,
                    inst_count: 1,
                    multiplier: s.group.multiplier(),
                    is_flop: s.group.is_flop(),
                };
                threads.add_instruction(src_node, sample);
            }
        }
    }
}

/// Builds the address→node cache spec section 4.5 calls for: one
/// `move_pages(2)` "query mode" call per PID covering every distinct page a
/// memory sample touched this tick, rather than a syscall per sample.
/// Addresses whose query failed (the PID raced away mid-tick, or the page
/// has since been unmapped) simply have no entry, and the caller falls back
/// to the region-majority heuristic for those.
fn build_node_cache(samples: &[DecodedSample], page_size: u64) -> HashMap<(pid_t, u64), NodeId> {
    let mut by_pid: HashMap<pid_t, Vec<u64>> = HashMap::new();
    for s in samples {
        if !s.group.is_memory() {
            continue;
        }
        let page = s.address & !(page_size - 1);
        let addrs = by_pid.entry(s.pid).or_default();
        if !addrs.contains(&page) {
            addrs.push(page);
        }
    }

    let mut cache = HashMap::new();
    for (pid, addrs) in by_pid {
        if let Ok(statuses) = query_pages(pid, &addrs) {
            for (addr, status) in addrs.into_iter().zip(statuses) {
                if status >= 0 {
                    cache.insert((pid, addr), status as NodeId);
                }
            }
        }
    }
    cache
}

/// Resolves the node holding the page at `addr` in `pid`'s address space
/// when the batched `move_pages` query (`build_node_cache`) has no entry for
/// it. Falls back to the region's numa_maps majority owner, then to the
/// accessing CPU's own node when no region data covers the address either
/// (e.g. the mapping raced with the memory tick), matching the 3DyRM
/// model's tolerance for an approximate destination (spec section 4.4/4.6).
fn resolve_fallback_node(memmap: &MemMapTracker, pid: libc::pid_t, addr: u64, topology: &Topology) -> usize {
    memmap
        .region_containing(pid, addr)
        .and_then(|r| r.majority_node())
        .unwrap_or_else(|| safe_node_of_cpu(topology, 0))
}

/// A sample's `cpu` field can be `u32::MAX` ("unknown") or stale after a CPU
/// hot-unplug; out-of-range indices fall back to node 0 rather than
/// panicking on the topology's internal index.
fn safe_node_of_cpu(topology: &Topology, cpu: crate::topology::CpuId) -> usize {
    if cpu < topology.n_cpus() {
        topology.node_of_cpu(cpu)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_weight_is_one_once_interval_has_elapsed() {
        let router = Router::new(0.0);
        assert!((router.age_weight() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn age_weight_shrinks_right_after_a_migration() {
        let router = Router::new(1000.0);
        assert!(router.age_weight() < 1.0);
    }
}
