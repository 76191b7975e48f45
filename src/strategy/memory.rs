//! Memory-migration strategies (spec section 4.8): TMMA (pure ratio
//! threshold), LMMA (latency-driven: pages whose mean latency has drifted
//! 1.30x above the system average move to their preferred node, or to the
//! least-latency node if the preferred one is itself saturated), and RMMA
//! (random subset of TMMA's candidate pool, to random foreign nodes, as a
//! baseline). Grounded on
//! `examples/original_source/src/migration/strategies/memory_strats/{tmma,lmma,rmma}.hpp`.

use libc::pid_t;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::PagePerfTable;
use crate::proc::memmap::Addr;
use crate::topology::NodeId;

/// LMMA's saturation/ranking threshold (spec section 4.8): a page only
/// migrates once its mean latency has drifted 30% above the system average.
const LMMA_LATENCY_RATIO: f64 = 1.30;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryStrategyKind {
    Tmma,
    Lmma,
    Rmma,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryMigrationDecision {
    pub page: Addr,
    pub pid: pid_t,
    pub from: NodeId,
    pub to: NodeId,
    pub ratio: f64,
}

/// Selects which misplaced pages to migrate this tick. `threshold` is the
/// minimum majority-node ratio a page must reach to be considered misplaced
/// at all (spec section 6's implicit TMMA cutoff); `max_fraction` (spec
/// section 6's `-M/--max-memory-migs`) caps how much of the candidate pool
/// is acted on per tick.
pub fn decide_migrations(
    kind: MemoryStrategyKind,
    pages: &mut PagePerfTable,
    threshold: f64,
    max_fraction: f64,
    rng: &mut impl Rng,
) -> Vec<MemoryMigrationDecision> {
    let mut candidates = match kind {
        MemoryStrategyKind::Tmma | MemoryStrategyKind::Rmma => ratio_candidates(pages, threshold),
        MemoryStrategyKind::Lmma => latency_candidates(pages),
    };

    if matches!(kind, MemoryStrategyKind::Rmma) {
        candidates.shuffle(rng);
        let n_nodes = pages.n_nodes();
        for c in &mut candidates {
            c.to = random_foreign_node(n_nodes, c.from, rng);
        }
    }

    // `SPEC_FULL.md` section 14: a fraction of exactly 1.0 migrates every
    // candidate found this tick; anything less truncates to a top-K slice of
    // the (possibly ranked) candidate list.
    if (max_fraction - 1.0).abs() < f64::EPSILON {
        return candidates;
    }

    let cap = ((candidates.len() as f64) * max_fraction.clamp(0.0, 1.0)).ceil() as usize;
    candidates.truncate(cap.max(0));
    candidates
}

/// TMMA/RMMA's candidate pool: pages whose majority node differs from their
/// current node by at least `threshold` share of accesses, in discovery
/// order (`tmma.hpp`'s `min_ratio_to_mig` gate).
fn ratio_candidates(pages: &mut PagePerfTable, threshold: f64) -> Vec<MemoryMigrationDecision> {
    pages
        .misplaced_pages(threshold)
        .into_iter()
        .map(|(page, from, to, ratio)| MemoryMigrationDecision {
            page,
            pid: pages.row(page).map(|r| r.last_pid()).unwrap_or(0),
            from,
            to,
            ratio,
        })
        .collect()
}

/// LMMA's candidate pool (`lmma.hpp`): every page whose mean latency has
/// drifted 1.30x above the system average and whose current node differs
/// from its preferred (majority) node. The destination is the preferred
/// node unless it is itself saturated, in which case the page is redirected
/// to the node with the lowest observed latency instead.
fn latency_candidates(pages: &mut PagePerfTable) -> Vec<MemoryMigrationDecision> {
    let system_latency = pages.system_latency();
    let pages_list: Vec<Addr> = pages.pages().collect();

    let mut out = Vec::new();
    for page in pages_list {
        // Pull everything the row can tell us before borrowing `pages`
        // again to resolve saturation/fallback — the row borrow can't
        // overlap those calls.
        let gate = {
            let Some(row) = pages.row_mut(page) else { continue };
            if row.total_accesses() <= 0.0 {
                continue;
            }
            let rel_latency = if system_latency > 0.0 {
                row.overall_latency() / system_latency
            } else {
                0.0
            };
            if rel_latency <= LMMA_LATENCY_RATIO {
                continue;
            }
            let (preferred, _majority_ratio) = row.majority_node();
            if preferred == row.current_node() {
                continue;
            }
            (row.last_pid(), row.current_node(), preferred, rel_latency)
        };
        let (pid, from, preferred, rel_latency) = gate;

        let to = if pages.is_saturated(preferred) {
            pages.lowest_latency_node()
        } else {
            preferred
        };
        out.push(MemoryMigrationDecision {
            page,
            pid,
            from,
            to,
            ratio: rel_latency,
        });
    }

    // Most-latency-impacted pages first, matching LMMA's ranking when a
    // fractional cap truncates the candidate list.
    out.sort_by(|a, b| b.ratio.partial_cmp(&a.ratio).unwrap());
    out
}

fn random_foreign_node(n_nodes: usize, from: NodeId, rng: &mut impl Rng) -> NodeId {
    if n_nodes <= 1 {
        return from;
    }
    loop {
        let candidate = rng.gen_range(0..n_nodes);
        if candidate != from {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample(page: Addr, page_node: usize, reqs: f64) -> crate::model::sample::MemorySample {
        sample_lat(page, page_node, reqs, 50)
    }

    fn sample_lat(page: Addr, page_node: usize, reqs: f64, latency: u64) -> crate::model::sample::MemorySample {
        crate::model::sample::MemorySample {
            cpu: 0,
            pid: 1,
            tid: 1,
            time_running_ns: 1,
            reqs,
            address: page,
            page,
            latency,
            pagesize: 4096,
            data_source: 0,
            page_node,
        }
    }

    #[test]
    fn tmma_keeps_everything_above_threshold() {
        let mut pages = PagePerfTable::new(2);
        pages.add_sample(0, &sample(0x1000, 1, 10.0));
        let decisions = decide_migrations(MemoryStrategyKind::Tmma, &mut pages, 0.5, 1.0, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn rmma_sends_its_candidate_to_a_different_node_than_its_current_one() {
        let mut pages = PagePerfTable::new(3);
        pages.add_sample(0, &sample(0x1000, 1, 10.0));
        let decisions = decide_migrations(MemoryStrategyKind::Rmma, &mut pages, 0.5, 1.0, &mut rand::rngs::StdRng::seed_from_u64(3));
        assert_eq!(decisions.len(), 1);
        assert_ne!(decisions[0].to, decisions[0].from);
    }

    #[test]
    fn fractional_cap_truncates_candidate_pool() {
        let mut pages = PagePerfTable::new(2);
        for addr in [0x1000u64, 0x2000, 0x3000, 0x4000] {
            pages.add_sample(0, &sample(addr, 1, 10.0));
        }
        let decisions = decide_migrations(MemoryStrategyKind::Tmma, &mut pages, 0.5, 0.5, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn lmma_ignores_pages_whose_latency_has_not_drifted() {
        let mut pages = PagePerfTable::new(2);
        // Every sample shares the same latency, so rel_latency sits at 1.0
        // for every page: nothing should clear the 1.30x gate.
        pages.add_sample(0, &sample(0x1000, 1, 10.0));
        pages.add_sample(1, &sample(0x2000, 0, 10.0));
        let decisions = decide_migrations(MemoryStrategyKind::Lmma, &mut pages, 0.1, 1.0, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert!(decisions.is_empty());
    }

    #[test]
    fn lmma_migrates_a_hot_latency_page_to_its_preferred_node_when_unsaturated() {
        let mut pages = PagePerfTable::new(3);
        // Low-latency baseline traffic elsewhere drags the system average down.
        pages.add_sample(0, &sample_lat(0x9000, 2, 20.0, 10));
        // Target page: resident on node 0, majority of accesses from node 1,
        // latency far above the system average.
        pages.add_sample(1, &sample_lat(0x1000, 0, 1.0, 500));
        pages.add_sample(0, &sample_lat(0x1000, 0, 0.2, 500));

        let decisions = decide_migrations(MemoryStrategyKind::Lmma, &mut pages, 0.1, 1.0, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].page, 0x1000);
        assert_eq!(decisions[0].from, 0);
        assert_eq!(decisions[0].to, 1);
    }

    #[test]
    fn lmma_redirects_to_the_lowest_latency_node_when_preferred_is_saturated() {
        let mut pages = PagePerfTable::new(3);
        // Node 1 is saturated: pages resident there run hot.
        pages.add_sample(1, &sample_lat(0x8000, 1, 5.0, 900));
        // Node 2 stays cold.
        pages.add_sample(2, &sample_lat(0x9000, 2, 5.0, 10));
        // Target page: resident on node 0, majority of accesses from node 1.
        pages.add_sample(1, &sample_lat(0x1000, 0, 1.0, 1500));
        pages.add_sample(0, &sample_lat(0x1000, 0, 0.1, 1500));

        let decisions = decide_migrations(MemoryStrategyKind::Lmma, &mut pages, 0.1, 1.0, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].to, 2);
    }

    #[test]
    fn lmma_orders_multiple_candidates_by_descending_latency_ratio() {
        let mut pages = PagePerfTable::new(3);
        pages.add_sample(0, &sample_lat(0x9000, 2, 50.0, 10));
        pages.add_sample(1, &sample_lat(0x1000, 0, 1.0, 3000));
        pages.add_sample(0, &sample_lat(0x1000, 0, 0.1, 3000));
        pages.add_sample(1, &sample_lat(0x2000, 0, 1.0, 1500));
        pages.add_sample(0, &sample_lat(0x2000, 0, 0.1, 1500));

        let decisions = decide_migrations(MemoryStrategyKind::Lmma, &mut pages, 0.1, 1.0, &mut rand::rngs::StdRng::seed_from_u64(1));
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].ratio >= decisions[1].ratio);
        assert_eq!(decisions[0].page, 0x1000);
    }
}
