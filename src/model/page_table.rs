//! Per-page access table (spec section 4.6): a histogram of which node last
//! touched each sampled page, used by the memory-migration strategies to
//! decide a page's destination node. Per-node and overall mean latency are
//! tracked alongside the histogram (spec section 3's `PagePerfRow` data
//! model), grounded on `row::add_data` in
//! `examples/original_source/src/migration/performance/mempages_table.hpp`:
//! a simple per-sample running mean, incremented by one per sample rather
//! than weighted by `reqs` (that weighting happens one level up, in the
//! table's node/system averages, matching the original's table-level
//! `node_latencies_`/`av_latency_system_`).

use std::collections::HashMap;
use std::time::Instant;

use libc::pid_t;

use crate::model::sample::MemorySample;
use crate::model::thread_table::DEFAULT_MIN_LATENCY;
use crate::proc::memmap::Addr;
use crate::topology::NodeId;

/// A single page's per-node access histogram plus its cached majority node
/// and that node's share of total accesses.
#[derive(Clone, Debug)]
pub struct PagePerfRow {
    n_nodes: usize,
    accesses: Vec<f64>,
    current_node: NodeId,
    last_seen: Instant,
    dirty: bool,
    cached_majority: NodeId,
    cached_ratio: f64,
    mean_lat: Vec<f64>,
    lat_count: Vec<f64>,
    overall_lat: f64,
    overall_lat_count: f64,
    last_pid: pid_t,
}

impl PagePerfRow {
    fn new(n_nodes: usize, current_node: NodeId) -> Self {
        PagePerfRow {
            n_nodes,
            accesses: vec![0.0; n_nodes],
            current_node,
            last_seen: Instant::now(),
            dirty: true,
            cached_majority: current_node,
            cached_ratio: 0.0,
            mean_lat: vec![0.0; n_nodes],
            lat_count: vec![0.0; n_nodes],
            overall_lat: 0.0,
            overall_lat_count: 0.0,
            last_pid: 0,
        }
    }

    /// Folds one sample's access count into the histogram and its latency
    /// into both the per-node and overall running means. `pid` identifies
    /// the address space the page belongs to, used later to batch
    /// `move_pages` calls per process rather than per page (spec section
    /// 4.8); we source it from `MemorySample.pid`, not `.tid` as the
    /// original's `last_pid_` literally does — see `DESIGN.md`.
    pub fn add_access(&mut self, from_node: NodeId, reqs: f64, latency: f64, pid: pid_t) {
        self.accesses[from_node] += reqs;
        self.last_seen = Instant::now();
        self.dirty = true;

        let prior = self.lat_count[from_node];
        self.mean_lat[from_node] = (self.mean_lat[from_node] * prior + latency) / (prior + 1.0);
        self.lat_count[from_node] += 1.0;

        let prior_overall = self.overall_lat_count;
        self.overall_lat = (self.overall_lat * prior_overall + latency) / (prior_overall + 1.0);
        self.overall_lat_count += 1.0;

        self.last_pid = pid;
    }

    /// Mean latency of accesses that came from `node`, or the sampler's
    /// minimum plausible latency before any sample from that node has
    /// arrived.
    pub fn mean_latency(&self, node: NodeId) -> f64 {
        if self.lat_count[node] <= 0.0 {
            DEFAULT_MIN_LATENCY
        } else {
            self.mean_lat[node]
        }
    }

    /// Mean latency across every access this page has ever recorded.
    pub fn overall_latency(&self) -> f64 {
        if self.overall_lat_count <= 0.0 {
            DEFAULT_MIN_LATENCY
        } else {
            self.overall_lat
        }
    }

    /// PID owning the address space this page lives in, as of the most
    /// recent sample.
    pub fn last_pid(&self) -> pid_t {
        self.last_pid
    }

    /// Halves every node's count (spec section 4.6: pages whose accesses
    /// have gone cold should not keep permanent weight). Called on the same
    /// tick as the memory-migration pass so stale history fades.
    pub fn age(&mut self, factor: f64) {
        for v in &mut self.accesses {
            *v *= factor;
        }
        self.dirty = true;
    }

    pub fn total_accesses(&self) -> f64 {
        self.accesses.iter().sum()
    }

    fn recalc(&mut self) {
        let total = self.total_accesses();
        if total <= 0.0 {
            self.cached_majority = self.current_node;
            self.cached_ratio = 0.0;
        } else {
            let (node, count) = self
                .accesses
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                .unwrap();
            self.cached_majority = node;
            self.cached_ratio = count / total;
        }
        self.dirty = false;
    }

    /// The node that should hold this page, and the fraction of recorded
    /// accesses it accounts for.
    pub fn majority_node(&mut self) -> (NodeId, f64) {
        if self.dirty {
            self.recalc();
        }
        (self.cached_majority, self.cached_ratio)
    }

    pub fn current_node(&self) -> NodeId {
        self.current_node
    }

    pub fn set_current_node(&mut self, node: NodeId) {
        self.current_node = node;
    }

    pub fn accesses_from(&self, node: NodeId) -> f64 {
        self.accesses[node]
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Keyed by page-aligned address, rebuilt incrementally as samples arrive and
/// garbage-collected when a page's owning region disappears (spec section
/// 4.4/4.6). Also keeps the reqs-weighted per-node and system-wide latency
/// averages LMMA needs to find saturated nodes, grounded on
/// `mempages_table::add_data`'s `node_latencies_`/`av_latency_system_` in
/// `examples/original_source/src/migration/performance/mempages_table.hpp`.
pub struct PagePerfTable {
    n_nodes: usize,
    rows: HashMap<Addr, PagePerfRow>,
    node_latency: Vec<f64>,
    node_latency_weight: Vec<f64>,
    system_latency: f64,
    system_latency_weight: f64,
}

impl PagePerfTable {
    pub fn new(n_nodes: usize) -> Self {
        PagePerfTable {
            n_nodes,
            rows: HashMap::new(),
            node_latency: vec![DEFAULT_MIN_LATENCY; n_nodes],
            node_latency_weight: vec![0.0; n_nodes],
            system_latency: DEFAULT_MIN_LATENCY,
            system_latency_weight: 0.0,
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, page: Addr) -> Option<&PagePerfRow> {
        self.rows.get(&page)
    }

    pub fn row_mut(&mut self, page: Addr) -> Option<&mut PagePerfRow> {
        self.rows.get_mut(&page)
    }

    pub fn add_sample(&mut self, from_node: NodeId, sample: &MemorySample) {
        let row = self
            .rows
            .entry(sample.page)
            .or_insert_with(|| PagePerfRow::new(self.n_nodes, sample.page_node));
        let latency = sample.latency as f64;
        row.add_access(from_node, sample.reqs, latency, sample.pid);

        let dst = sample.page_node;
        let reqs = sample.reqs;

        let prior = self.node_latency_weight[dst];
        self.node_latency[dst] = if prior + reqs > 0.0 {
            (self.node_latency[dst] * prior + latency * reqs) / (prior + reqs)
        } else {
            self.node_latency[dst]
        };
        self.node_latency_weight[dst] += reqs;

        let prior_sys = self.system_latency_weight;
        self.system_latency = if prior_sys + reqs > 0.0 {
            (self.system_latency * prior_sys + latency * reqs) / (prior_sys + reqs)
        } else {
            self.system_latency
        };
        self.system_latency_weight += reqs;
    }

    /// Reqs-weighted mean latency of pages currently resident on `node`.
    pub fn node_latency(&self, node: NodeId) -> f64 {
        self.node_latency[node]
    }

    /// Reqs-weighted mean latency across every node.
    pub fn system_latency(&self) -> f64 {
        self.system_latency
    }

    /// True once a node's mean latency exceeds 1.30x the system average —
    /// LMMA's signal that sending more pages there would be counterproductive
    /// (spec section 4.8).
    pub fn is_saturated(&self, node: NodeId) -> bool {
        self.node_latency[node] > 1.30 * self.system_latency
    }

    /// The node with the lowest mean latency, LMMA's fallback destination
    /// when a page's preferred node is saturated.
    pub fn lowest_latency_node(&self) -> NodeId {
        self.node_latency
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Applies exponential aging to every tracked page (spec section 4.6).
    pub fn age_all(&mut self, factor: f64) {
        for row in self.rows.values_mut() {
            row.age(factor);
        }
    }

    /// Drops rows for pages no longer backed by any live region, given a
    /// predicate over page addresses still present in some tracked PID's
    /// `MemMapTracker` regions.
    pub fn gc(&mut self, page_is_live: impl Fn(Addr) -> bool) -> usize {
        let dead: Vec<Addr> = self.rows.keys().copied().filter(|&p| !page_is_live(p)).collect();
        for page in &dead {
            self.rows.remove(page);
        }
        dead.len()
    }

    /// Pages whose majority node differs from their currently-resident node
    /// by at least `min_ratio` share of accesses, i.e. migration candidates
    /// for TMMA/LMMA (spec section 4.8).
    pub fn misplaced_pages(&mut self, min_ratio: f64) -> Vec<(Addr, NodeId, NodeId, f64)> {
        let mut out = Vec::new();
        for (&page, row) in self.rows.iter_mut() {
            let (majority, ratio) = row.majority_node();
            if majority != row.current_node() && ratio >= min_ratio {
                out.push((page, row.current_node(), majority, ratio));
            }
        }
        out
    }

    pub fn pages(&self) -> impl Iterator<Item = Addr> + '_ {
        self.rows.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(page: Addr, page_node: usize, reqs: f64) -> MemorySample {
        MemorySample {
            cpu: 0,
            pid: 1,
            tid: 1,
            time_running_ns: 1,
            reqs,
            address: page,
            page,
            latency: 50,
            pagesize: 4096,
            data_source: 0,
            page_node,
        }
    }

    #[test]
    fn majority_node_tracks_largest_accessor() {
        let mut table = PagePerfTable::new(3);
        table.add_sample(0, &sample(0x1000, 0, 5));
        table.add_sample(1, &sample(0x1000, 0, 20));
        table.add_sample(2, &sample(0x1000, 0, 2));
        let (node, ratio) = table.row_mut(0x1000).unwrap().majority_node();
        assert_eq!(node, 1);
        assert!((ratio - 20.0 / 27.0).abs() < 1e-9);
    }

    #[test]
    fn aging_halves_history_without_changing_majority() {
        let mut table = PagePerfTable::new(2);
        table.add_sample(0, &sample(0x2000, 0, 10));
        table.age_all(0.5);
        let row = table.row(0x2000).unwrap();
        assert_eq!(row.accesses_from(0), 5.0);
    }

    #[test]
    fn gc_drops_pages_failing_the_liveness_predicate() {
        let mut table = PagePerfTable::new(1);
        table.add_sample(0, &sample(0x3000, 0, 1));
        table.add_sample(0, &sample(0x4000, 0, 1));
        let removed = table.gc(|p| p == 0x3000);
        assert_eq!(removed, 1);
        assert!(table.row(0x3000).is_some());
        assert!(table.row(0x4000).is_none());
    }

    #[test]
    fn misplaced_pages_respects_min_ratio_threshold() {
        let mut table = PagePerfTable::new(2);
        table.add_sample(0, &sample(0x5000, 0, 6));
        table.add_sample(1, &sample(0x5000, 0, 4));
        assert!(table.misplaced_pages(0.7).is_empty());
        let found = table.misplaced_pages(0.3);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].2, 0);
    }

    fn sample_lat(page: Addr, page_node: usize, reqs: f64, latency: u64) -> MemorySample {
        MemorySample {
            latency,
            ..sample(page, page_node, reqs)
        }
    }

    #[test]
    fn node_latency_is_reqs_weighted_across_pages() {
        let mut table = PagePerfTable::new(2);
        table.add_sample(0, &sample_lat(0x1000, 0, 1.0, 100));
        table.add_sample(0, &sample_lat(0x2000, 0, 3.0, 200));
        // (1*100 + 3*200) / 4 == 175
        assert!((table.node_latency(0) - 175.0).abs() < 1e-9);
        assert!((table.system_latency() - 175.0).abs() < 1e-9);
    }

    #[test]
    fn saturated_node_is_flagged_above_1_3x_system_average() {
        let mut table = PagePerfTable::new(2);
        table.add_sample(0, &sample_lat(0x1000, 0, 1.0, 1000));
        table.add_sample(0, &sample_lat(0x2000, 1, 1.0, 10));
        assert!(table.is_saturated(0));
        assert!(!table.is_saturated(1));
        assert_eq!(table.lowest_latency_node(), 1);
    }

    #[test]
    fn row_tracks_overall_latency_and_last_pid() {
        let mut table = PagePerfTable::new(1);
        table.add_sample(0, &MemorySample { pid: 42, ..sample_lat(0x3000, 0, 1.0, 30) });
        table.add_sample(0, &MemorySample { pid: 42, ..sample_lat(0x3000, 0, 1.0, 90) });
        let row = table.row(0x3000).unwrap();
        assert!((row.overall_latency() - 60.0).abs() < 1e-9);
        assert_eq!(row.last_pid(), 42);
    }
}
