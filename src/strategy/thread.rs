//! Thread-migration strategies (spec section 4.7): LBMA, CIMAR, NIMAR,
//! IMAR2, RANDOM, and the node-level ANNEAL_NODE variant (delegated to
//! [`crate::strategy::annealing`]). Each strategy differs in which ticket
//! terms feed the scoring, and every one of them (per spec section 4.7) also
//! scores the best swap partner on a candidate node that has no free core,
//! emitting a pairwise interchange instead of a simple move when that's the
//! only way to get there. CIMAR additionally departs from the shared
//! weighted lottery: it visits its most under-performing TIDs first and
//! only emits a migration when the destination's ticket total strictly
//! exceeds the cost of staying put.

use std::collections::{HashMap, HashSet};

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::migration::ThreadMigration;
use crate::model::sample::Tid;
use crate::model::ThreadPerfTable;
use crate::tickets::{TicketMask, Tickets, TicketConstants};
use crate::topology::{NodeId, Topology, LOCAL_DISTANCE};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadStrategyKind {
    Lbma,
    Cimar,
    Nimar,
    Imar2,
    Random,
    AnnealNode,
}

/// One proposed thread migration plus the combined ticket (spec section 3:
/// "every migration decision records its ticket, including its mask, so
/// IMAR2 can later mutate only the constants that contributed").
#[derive(Clone, Copy, Debug)]
pub struct ThreadMigrationDecision {
    pub tid: Tid,
    pub from: NodeId,
    pub to: NodeId,
    pub tickets: Tickets,
}

fn ticket_for_candidate(
    kind: ThreadStrategyKind,
    table: &ThreadPerfTable,
    topology: &Topology,
    constants: &TicketConstants,
    under_perf_threshold: f64,
    tid: Tid,
    current: NodeId,
    candidate: NodeId,
    cpu_use: f64,
    free_core_on: &impl Fn(NodeId) -> bool,
) -> Tickets {
    if matches!(kind, ThreadStrategyKind::Random) {
        return Tickets::new(1.0, TicketMask::empty());
    }

    let mut total = Tickets::zero();

    let cur_perf = table.raw_performance(tid, current);
    let cand_perf = table.raw_performance(tid, candidate);
    total += if cand_perf < 0.0 {
        constants.mem_cell_no_data()
    } else if cand_perf > cur_perf {
        constants.mem_cell_better()
    } else {
        constants.mem_cell_worse()
    };

    if free_core_on(candidate) {
        total += constants.free_core();
    }

    // PREF_NODE and UNDER_PERF are summed for every CPU-level and node-level
    // strategy alike (spec.md's shared ticket-factor list, referenced by
    // both LBMA's and CIMAR's "same structure" wording): the original's
    // `tickets_cpu`, called from `lbma.hpp` and `cimar.hpp` as well as
    // `nimar.hpp`/`imar2.hpp`, sums rm3d + pref_node + free_core +
    // under_performance unconditionally, with no strategy-specific gating
    // at this layer.
    if let Some(preferred) = table.preferred_node(tid) {
        let distance = topology.distance(candidate, preferred);
        total += constants.pref_node(distance, LOCAL_DISTANCE);
    }
    if table.is_under_performing(tid, current, cpu_use, under_perf_threshold) {
        total += constants.under_perf();
    }

    total
}

/// Scores every occupant of `from_node` for a swap that would send it to
/// `to_node` (the spot the primary TID wants to vacate), and returns the
/// best one, per spec section 4.7: "also score the best candidate TID for
/// swap" whenever the destination has no free core to move onto outright.
/// RANDOM picks an occupant uniformly instead of scoring them.
#[allow(clippy::too_many_arguments)]
fn best_swap_partner(
    kind: ThreadStrategyKind,
    tids_on_node: &HashMap<NodeId, Vec<Tid>>,
    from_node: NodeId,
    to_node: NodeId,
    excluding: Tid,
    committed: &HashSet<Tid>,
    table: &ThreadPerfTable,
    topology: &Topology,
    constants: &TicketConstants,
    under_perf_threshold: f64,
    cpu_use_of: &impl Fn(Tid) -> f64,
    free_core_on: &impl Fn(NodeId) -> bool,
    rng: &mut impl Rng,
) -> Option<Tid> {
    let occupants: Vec<Tid> = tids_on_node
        .get(&from_node)
        .into_iter()
        .flatten()
        .copied()
        .filter(|t| *t != excluding && !committed.contains(t))
        .collect();

    if occupants.is_empty() {
        return None;
    }

    if matches!(kind, ThreadStrategyKind::Random) {
        return occupants.choose(rng).copied();
    }

    occupants
        .into_iter()
        .map(|t| {
            let value = ticket_for_candidate(
                kind,
                table,
                topology,
                constants,
                under_perf_threshold,
                t,
                from_node,
                to_node,
                cpu_use_of(t),
                free_core_on,
            )
            .value();
            (t, value)
        })
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(t, _)| t)
}

struct Candidate {
    migration: ThreadMigration,
    value: f64,
}

/// Runs one round of the chosen strategy over every running TID in `table`.
/// Each TID's candidate destinations are scored; a destination with a free
/// core becomes a simple move, one without becomes a pairwise interchange
/// with its best swap partner (spec section 4.7). LBMA/NIMAR/IMAR2 pick
/// among the resulting options with a weighted lottery; RANDOM picks
/// uniformly; CIMAR visits TIDs ordered by ascending relative performance
/// (worst-off first) and only emits its single best option when that
/// option's ticket total strictly exceeds the ticket total for staying put.
#[allow(clippy::too_many_arguments)]
pub fn decide_migrations(
    kind: ThreadStrategyKind,
    table: &ThreadPerfTable,
    topology: &Topology,
    constants: &TicketConstants,
    under_perf_threshold: f64,
    pinned_node_of: impl Fn(Tid) -> NodeId,
    cpu_use_of: impl Fn(Tid) -> f64,
    free_core_on: impl Fn(NodeId) -> bool,
    rng: &mut impl Rng,
) -> Vec<ThreadMigration> {
    if topology.n_nodes() < 2 || matches!(kind, ThreadStrategyKind::AnnealNode) {
        // ANNEAL_NODE operates on the whole assignment at once; see
        // `strategy::annealing`, invoked separately by the control loop.
        return Vec::new();
    }

    let mut tids: Vec<Tid> = table.tids().collect();
    if matches!(kind, ThreadStrategyKind::Cimar) {
        tids.sort_by(|&a, &b| {
            let pa = table.relative_performance(a, pinned_node_of(a), cpu_use_of(a));
            let pb = table.relative_performance(b, pinned_node_of(b), cpu_use_of(b));
            pa.partial_cmp(&pb).unwrap()
        });
    }

    let mut tids_on_node: HashMap<NodeId, Vec<Tid>> = HashMap::new();
    for &tid in &tids {
        tids_on_node.entry(pinned_node_of(tid)).or_default().push(tid);
    }

    let mut decisions = Vec::new();
    let mut committed: HashSet<Tid> = HashSet::new();

    for tid in tids {
        if committed.contains(&tid) {
            continue;
        }
        let current = pinned_node_of(tid);
        let cpu_use = cpu_use_of(tid);

        let mut options: Vec<Candidate> = Vec::new();
        for c in topology.nodes().filter(|&n| n != current) {
            let move_tickets = ticket_for_candidate(
                kind,
                table,
                topology,
                constants,
                under_perf_threshold,
                tid,
                current,
                c,
                cpu_use,
                &free_core_on,
            );

            if free_core_on(c) {
                options.push(Candidate {
                    value: move_tickets.value(),
                    migration: ThreadMigration::Simple(ThreadMigrationDecision {
                        tid,
                        from: current,
                        to: c,
                        tickets: move_tickets,
                    }),
                });
                continue;
            }

            let partner = best_swap_partner(
                kind,
                &tids_on_node,
                c,
                current,
                tid,
                &committed,
                table,
                topology,
                constants,
                under_perf_threshold,
                &cpu_use_of,
                &free_core_on,
                rng,
            );

            if let Some(partner) = partner {
                let partner_tickets = ticket_for_candidate(
                    kind,
                    table,
                    topology,
                    constants,
                    under_perf_threshold,
                    partner,
                    c,
                    current,
                    cpu_use_of(partner),
                    &free_core_on,
                );
                options.push(Candidate {
                    value: (move_tickets + partner_tickets).value(),
                    migration: ThreadMigration::Interchange(
                        ThreadMigrationDecision {
                            tid,
                            from: current,
                            to: c,
                            tickets: move_tickets,
                        },
                        ThreadMigrationDecision {
                            tid: partner,
                            from: c,
                            to: current,
                            tickets: partner_tickets,
                        },
                    ),
                });
            }
        }

        if options.is_empty() {
            continue;
        }

        let chosen = match kind {
            ThreadStrategyKind::Random => {
                let idx = rng.gen_range(0..options.len());
                options.into_iter().nth(idx)
            }
            ThreadStrategyKind::Cimar => {
                let stay = ticket_for_candidate(
                    kind,
                    table,
                    topology,
                    constants,
                    under_perf_threshold,
                    tid,
                    current,
                    current,
                    cpu_use,
                    &free_core_on,
                )
                .value();
                options
                    .into_iter()
                    .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap())
                    .filter(|best| best.value > stay)
            }
            _ => {
                let weights: Vec<f64> = options.iter().map(|o| o.value.max(0.0) + 1e-6).collect();
                if weights.iter().all(|&w| w <= 1e-6) {
                    None
                } else {
                    match WeightedIndex::new(&weights) {
                        Ok(dist) => options.into_iter().nth(dist.sample(rng)),
                        Err(_) => None,
                    }
                }
            }
        };

        if let Some(chosen) = chosen {
            if let ThreadMigration::Interchange(_, partner) = &chosen.migration {
                committed.insert(partner.tid);
            }
            decisions.push(chosen.migration);
        }
    }

    decisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn random_strategy_ignores_tickets() {
        let table = ThreadPerfTable::new(2);
        let t = ticket_for_candidate(
            ThreadStrategyKind::Random,
            &table,
            &topology_for_test(),
            &TicketConstants::default(),
            0.8,
            1,
            0,
            1,
            1.0,
            &|_| false,
        );
        assert_eq!(t.mask(), TicketMask::empty());
    }

    #[test]
    fn emits_an_interchange_when_destination_has_no_free_core() {
        let mut table = ThreadPerfTable::new(2);
        table.track(1, 1);
        table.track(2, 2);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let decisions = decide_migrations(
            ThreadStrategyKind::Lbma,
            &table,
            &topology_for_test(),
            &TicketConstants::default(),
            0.8,
            |tid| if tid == 1 { 0 } else { 1 },
            |_| 1.0,
            |_| false,
            &mut rng,
        );
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            ThreadMigration::Interchange(a, b) => {
                let tids: Vec<Tid> = vec![a.tid, b.tid];
                assert!(tids.contains(&1) && tids.contains(&2));
            }
            ThreadMigration::Simple(_) => panic!("expected an interchange, both nodes are fully occupied"),
        }
    }

    #[test]
    fn cimar_emits_a_simple_move_when_a_candidate_beats_staying_put() {
        let mut table = ThreadPerfTable::new(2);
        table.track(1, 1);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let decisions = decide_migrations(
            ThreadStrategyKind::Cimar,
            &table,
            &topology_for_test(),
            &TicketConstants::default(),
            0.8,
            |_| 0,
            |_| 1.0,
            |&n| n == 1,
            &mut rng,
        );
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            ThreadMigration::Simple(d) => assert_eq!(d.to, 1),
            ThreadMigration::Interchange(..) => panic!("expected a simple move"),
        }
    }

    #[test]
    fn cimar_refuses_when_no_candidate_beats_staying_put() {
        let mut table = ThreadPerfTable::new(2);
        table.track(1, 1);
        table.track(2, 2);
        let zero_constants = TicketConstants {
            mem_cell_worse: 0.0,
            mem_cell_no_data: 0.0,
            mem_cell_better: 0.0,
            free_core: 0.0,
            pref_node: 0.0,
            under_perf: 0.0,
            perf_threshold: 0.8,
            undo_threshold: 0.9,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let decisions = decide_migrations(
            ThreadStrategyKind::Cimar,
            &table,
            &topology_for_test(),
            &zero_constants,
            0.8,
            |tid| if tid == 1 { 0 } else { 1 },
            |_| 1.0,
            |_| false,
            &mut rng,
        );
        assert!(decisions.is_empty());
    }

    #[test]
    fn no_decisions_when_uma() {
        let table = ThreadPerfTable::new(1);
        let topo = uma_topology();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let decisions = decide_migrations(
            ThreadStrategyKind::Nimar,
            &table,
            &topo,
            &TicketConstants::default(),
            0.8,
            |_| 0,
            |_| 1.0,
            |_| false,
            &mut rng,
        );
        assert!(decisions.is_empty());
    }

    fn uma_topology() -> Topology {
        topology_for_test_n(1)
    }

    fn topology_for_test() -> Topology {
        topology_for_test_n(2)
    }

    // Builds a topology with `n` nodes, one CPU each, for unit tests that
    // don't need real sysfs data.
    fn topology_for_test_n(n: usize) -> Topology {
        crate::topology::test_support::flat(n)
    }
}
