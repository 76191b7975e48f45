//! The single-threaded cooperative control loop (spec section 5, 4.10):
//! owns every piece of state described in the data model and drives one
//! tick at a time, with no locking and no worker threads. Grounded directly
//! on `main_loop()` in `examples/original_source/src/main.cpp` — the same
//! shape (per-subsystem update intervals checked against the current time,
//! a try/catch-equivalent around the body, a sleep to the next tick), built
//! with this workspace's typed collaborators instead of the original's
//! global functions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libc::pid_t;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::child::{Child, ChildSpawnOptions};
use crate::config::RunConfig;
use crate::csv_export::{CsvExporter, MemoryCsvRow, ThreadCsvRow};
use crate::error::Result;
use crate::events::EventGroup;
use crate::migration::{apply_thread_migration, move_pages_batch, ThreadMigration};
use crate::model::sample::Tid;
use crate::model::{PagePerfTable, ThreadPerfTable};
use crate::perf::sampler::Sampler;
use crate::proc::memmap::MemMapTracker;
use crate::proc::process::ProcessTree;
use crate::router::Router;
use crate::strategy::balance::{decide_balance, BalanceCandidate};
use crate::strategy::memory;
use crate::strategy::thread::{self, ThreadStrategyKind};
use crate::tickets::TicketConstants;
use crate::topology::Topology;

/// Recorded immediately after a thread migration is issued, so IMAR2 can
/// compare post-migration performance against the pre-migration baseline
/// once the thread has had a chance to run on its new node (spec section
/// 4.7; exact timing of the comparison is left open by the distillation —
/// here it happens on the next thread-migration tick, see `DESIGN.md`).
/// `from` is kept so a migration whose post-performance turns out worse can
/// be rolled back to where it started (IMAR2's namesake "NIMAR plus
/// rollback").
struct PendingMutation {
    tid: Tid,
    from: crate::topology::NodeId,
    node: crate::topology::NodeId,
    mask: crate::tickets::TicketMask,
    pre_perf: f64,
}

/// Every piece of state the control loop owns, per spec section 9's
/// instruction to keep it in one place rather than scattered statics.
pub struct OptimizerState {
    config: RunConfig,
    topology: Topology,
    tree: ProcessTree,
    sampler: Sampler,
    memmap: MemMapTracker,
    router: Router,
    threads: ThreadPerfTable,
    pages: PagePerfTable,
    constants: TicketConstants,
    child: Child,
    rng: StdRng,

    thread_csv: Option<CsvExporter<ThreadCsvRow>>,
    memory_csv: Option<CsvExporter<MemoryCsvRow>>,

    pending_mutations: Vec<PendingMutation>,

    start: Instant,
    last_proc_update: Instant,
    last_mem_update: Instant,
    last_samples_read: Instant,
    last_chart_export: Instant,
    last_balance: Instant,
    last_thread_migration: Instant,
    last_memory_migration: Instant,
    tick: u64,
}

impl OptimizerState {
    /// Performs every setup step spec section 5 lists as a precondition of
    /// the loop: topology discovery, tickets file read, child launch, and
    /// opening the chart files. Any failure here is setup-fatal (spec
    /// section 7) and propagates to `main`.
    pub fn setup(config: RunConfig) -> Result<Self> {
        let topology = Topology::discover()?;

        let constants = match &config.tickets_read {
            Some(path) => TicketConstants::read_file(path),
            None => TicketConstants::default(),
        };

        let opts = ChildSpawnOptions {
            command: config.child.clone(),
            shell: config.shell,
            stdout: config.stdout_child.clone(),
            stderr: config.stderr_child.clone(),
        };
        let child = Child::spawn(&opts)?;

        if let Some(priority) = config.real_time_priority {
            set_own_scheduler(priority);
        }

        let tree = ProcessTree::start(child.pid, topology.n_cpus())?;

        let groups = available_groups();
        let sampler = Sampler::new(groups, u64::from(config.freq_instr), u64::from(config.freq_memory), config.min_latency);

        let memmap = MemMapTracker::new(config.fake_thp_pages);
        let router = Router::new(config.memory_migration_interval);
        let threads = ThreadPerfTable::new(topology.n_nodes());
        let pages = PagePerfTable::new(topology.n_nodes());

        let thread_csv = if config.chart_threads {
            Some(CsvExporter::create(std::path::Path::new("threads.csv"))?)
        } else {
            None
        };
        let memory_csv = if config.chart_memory {
            Some(CsvExporter::create(std::path::Path::new("memory.csv"))?)
        } else {
            None
        };

        let now = Instant::now();
        Ok(OptimizerState {
            config,
            topology,
            tree,
            sampler,
            memmap,
            router,
            threads,
            pages,
            constants,
            child,
            rng: StdRng::from_entropy(),
            thread_csv,
            memory_csv,
            pending_mutations: Vec::new(),
            start: now,
            last_proc_update: now,
            last_mem_update: now,
            last_samples_read: now,
            last_chart_export: now,
            last_balance: now,
            last_thread_migration: now,
            last_memory_migration: now,
            tick: 0,
        })
    }

    /// Runs the loop until the child exits or `caught_signal` reports a
    /// caught SIGTERM/SIGINT (spec section 5: "SIGTERM/SIGINT/SIGCHLD all
    /// end the loop after the in-flight tick finishes"). Returns the
    /// child's exit code, or 0 if it could not be determined.
    pub fn run(mut self, caught_signal: impl Fn() -> Option<i32>) -> Result<i32> {
        let wait = Duration::from_secs_f64(self.config.wait_before_migration.max(0.0));
        if wait > Duration::ZERO {
            std::thread::sleep(wait);
        }

        let tick_period = Duration::from_secs_f64((1.0 / self.config.rate_sampling).max(0.001));
        let mut received: Option<i32> = None;

        loop {
            received = caught_signal();
            if self.child.poll_exit() || received.is_some() {
                break;
            }

            let iter_start = Instant::now();
            if let Err(e) = self.tick() {
                if e.is_recoverable() {
                    warn!("error in control loop tick: {}", e);
                } else {
                    return Err(e);
                }
            }

            let elapsed = iter_start.elapsed();
            if elapsed < tick_period {
                std::thread::sleep(tick_period - elapsed);
            }
        }

        self.shutdown(received);
        Ok(self.child.exit_code().unwrap_or(0))
    }

    /// One iteration of the 4.10 tick: process-tree refresh, memory-map
    /// refresh, counter rotation, sample poll/route, chart export, balance,
    /// thread and memory migration, in that order.
    fn tick(&mut self) -> Result<()> {
        self.tick += 1;
        let now = Instant::now();

        if seconds_since(self.last_proc_update, now) > self.config.proc_update_period {
            self.last_proc_update = now;
            self.update_process_tree()?;
        }

        if seconds_since(self.last_mem_update, now) > self.config.mem_update_period {
            self.last_mem_update = now;
            let pids: Vec<pid_t> = self.tree.non_lwp_pids().collect();
            self.memmap.refresh(pids.into_iter())?;
        }

        if self.sampler.is_multiplexed() {
            self.sampler.rotate();
        }

        if seconds_since(self.last_samples_read, now) > (1.0 / self.config.rate_sampling) {
            self.last_samples_read = now;
            let samples = self.sampler.poll();
            self.router.route(&samples, &self.topology, &self.memmap, &mut self.threads, &mut self.pages);

            let tree = &self.tree;
            self.threads.update(
                |tid| tree.get(tid).and_then(|p| p.pinned_node).unwrap_or(0),
                |tid| tree.get(tid).map(|p| p.cpu_use).unwrap_or(0.0),
            );
        }

        if self.config.chart_threads || self.config.chart_memory {
            let chart_period = 1.0 / self.config.rate_sampling;
            if seconds_since(self.last_chart_export, now) > chart_period {
                self.last_chart_export = now;
                self.export_charts()?;
            }
        }

        if self.config.max_thread_migrations > 0
            && seconds_since(self.last_balance, now) > self.config.thread_balance_period
        {
            self.last_balance = now;
            self.run_balance()?;
        }

        if self.config.max_thread_migrations > 0
            && seconds_since(self.last_thread_migration, now) > self.config.thread_migration_interval
        {
            self.last_thread_migration = now;
            self.run_thread_migration()?;
        }

        if self.config.max_memory_migrations_fraction > 0.0
            && seconds_since(self.last_memory_migration, now) > self.config.memory_migration_interval
        {
            self.last_memory_migration = now;
            self.run_memory_migration()?;
        }

        Ok(())
    }

    fn update_process_tree(&mut self) -> Result<()> {
        let removed = self.tree.update(self.tree.root())?;
        for pid in &removed {
            self.threads.remove(*pid);
            self.sampler.untrack(*pid);
        }

        for pid in self.tree.pids().collect::<Vec<_>>() {
            if !self.sampler.is_tracked(pid) && !self.sampler.has_given_up(pid) {
                self.sampler.track(pid);
            }
            self.threads.track(pid, self.tree.get(pid).map(|p| p.ppid).unwrap_or(pid));
        }

        if !removed.is_empty() && self.config.max_thread_migrations > 0 {
            self.run_balance()?;
        }

        Ok(())
    }

    fn run_balance(&mut self) -> Result<()> {
        let candidates: Vec<BalanceCandidate> = self
            .tree
            .non_lwp_pids()
            .filter_map(|pid| {
                let p = self.tree.get(pid)?;
                Some(BalanceCandidate {
                    pid,
                    node: p.pinned_node.unwrap_or(0),
                    cpu_use: p.cpu_use,
                    priority: p.priority,
                    migratable: p.is_migratable,
                })
            })
            .collect();

        let decisions = decide_balance(&candidates, &self.topology);
        for d in decisions {
            self.tree.pin_node(d.pid, d.to, &self.topology)?;
        }
        Ok(())
    }

    /// Runs the configured thread-migration strategy, resolving any
    /// pending IMAR2 mutation against this tick's freshly recomputed
    /// performance first (spec section 4.7, `SPEC_FULL.md` section 14).
    fn run_thread_migration(&mut self) -> Result<()> {
        self.resolve_pending_mutations();

        if matches!(self.config.thread_strategy, ThreadStrategyKind::AnnealNode) {
            self.run_anneal_node();
            return Ok(());
        }

        let tree = &self.tree;
        let threads = &self.threads;
        let topology = &self.topology;
        let under_perf_threshold = self.constants.perf_threshold;

        let free_cpu_nodes: std::collections::HashSet<crate::topology::NodeId> = self
            .topology
            .nodes()
            .filter(|&node| {
                let used: f64 = tree
                    .non_lwp_pids()
                    .filter(|&pid| tree.get(pid).and_then(|p| p.pinned_node) == Some(node))
                    .filter_map(|pid| tree.get(pid).map(|p| p.cpu_use))
                    .sum();
                used < self.topology.cpus_of_node(node).len() as f64
            })
            .collect();

        let decisions: Vec<ThreadMigration> = thread::decide_migrations(
            self.config.thread_strategy,
            threads,
            topology,
            &self.constants,
            under_perf_threshold,
            |tid| tree.get(tid).and_then(|p| p.pinned_node).unwrap_or(0),
            |tid| tree.get(tid).map(|p| p.cpu_use).unwrap_or(0.0),
            |node| free_cpu_nodes.contains(&node),
            &mut self.rng,
        );

        let max = self.config.max_thread_migrations as usize;
        let is_imar2 = matches!(self.config.thread_strategy, ThreadStrategyKind::Imar2);

        for migration in decisions.into_iter().take(max) {
            let legs: Vec<&crate::strategy::thread::ThreadMigrationDecision> = match &migration {
                ThreadMigration::Simple(d) => vec![d],
                ThreadMigration::Interchange(a, b) => vec![a, b],
            };
            let pre_perfs: Vec<f64> = legs.iter().map(|d| self.threads.raw_performance(d.tid, d.from)).collect();

            apply_thread_migration(&mut self.tree, &self.topology, &migration)?;

            if is_imar2 {
                for (d, pre_perf) in legs.into_iter().zip(pre_perfs) {
                    self.pending_mutations.push(PendingMutation {
                        tid: d.tid,
                        from: d.from,
                        node: d.to,
                        mask: d.tickets.mask(),
                        pre_perf,
                    });
                }
            }
        }

        Ok(())
    }

    /// Mutates ticket constants by comparing each pending migration's
    /// pre-migration performance against its current (post-migration)
    /// performance, then rolls the migration back entirely if the thread
    /// came out worse off than before it moved — IMAR2's defining feature,
    /// "NIMAR plus rollback" (spec section 4.7). A thread that disappeared
    /// before this tick is dropped silently; one that is still invalid is
    /// left for a later tick.
    fn resolve_pending_mutations(&mut self) {
        if self.pending_mutations.is_empty() {
            return;
        }
        let range = crate::tickets::DEFAULT_MUTATION_RANGE;
        let mut still_pending = Vec::new();

        for pending in self.pending_mutations.drain(..) {
            if !self.tree.is_alive(pending.tid) {
                continue;
            }
            let post_perf = self.threads.raw_performance(pending.tid, pending.node);
            if post_perf < 0.0 {
                still_pending.push(pending);
                continue;
            }
            let improvement = post_perf - pending.pre_perf;
            self.constants.mutate(pending.mask, improvement, range, &mut self.rng);

            if improvement < 0.0 {
                let _ = self.tree.pin_node(pending.tid, pending.from, &self.topology);
            }
        }

        self.pending_mutations = still_pending;
    }

    fn run_anneal_node(&mut self) {
        use crate::strategy::annealing::{anneal, Assignment, AnnealingConfig};

        let tree = &self.tree;
        let tids: Vec<Tid> = self.threads.tids().collect();
        if tids.is_empty() || self.topology.n_nodes() < 2 {
            return;
        }

        let initial: Assignment = tids
            .iter()
            .map(|&tid| (tid, tree.get(tid).and_then(|p| p.pinned_node).unwrap_or(0)))
            .collect();

        let threads = &self.threads;
        let nodes: Vec<crate::topology::NodeId> = self.topology.nodes().collect();
        let config = AnnealingConfig::default();

        let result = anneal(
            &tids,
            &nodes,
            &initial,
            |assignment: &Assignment| -> f64 {
                assignment
                    .iter()
                    .map(|(&tid, &node)| threads.raw_performance(tid, node).max(0.0))
                    .sum()
            },
            &config,
            &mut self.rng,
        );

        if let Some(assignment) = result {
            for (tid, node) in assignment {
                if initial.get(&tid) != Some(&node) {
                    let _ = self.tree.pin_node(tid, node, &self.topology);
                }
            }
        }
    }

    fn run_memory_migration(&mut self) -> Result<()> {
        let decisions = memory::decide_migrations(
            self.config.memory_strategy,
            &mut self.pages,
            0.5,
            self.config.max_memory_migrations_fraction,
            &mut self.rng,
        );

        // Group by owning PID so each process's address space is flushed with
        // a single `move_pages(2)` call instead of one syscall per page (spec
        // section 4.8), matching the batched overload in
        // `examples/original_source/src/system_info/memory_info.hpp`.
        let mut by_pid: HashMap<pid_t, Vec<&memory::MemoryMigrationDecision>> = HashMap::new();
        for d in &decisions {
            by_pid.entry(d.pid).or_default().push(d);
        }

        for (pid, group) in by_pid {
            let addrs: Vec<u64> = group.iter().map(|d| d.page).collect();
            let nodes: Vec<crate::topology::NodeId> = group.iter().map(|d| d.to).collect();

            if let Ok(statuses) = move_pages_batch(pid, &addrs, &nodes) {
                for (d, status) in group.iter().zip(statuses) {
                    if status >= 0 {
                        if let Some(row) = self.pages.row_mut(d.page) {
                            row.set_current_node(d.to);
                        }
                    }
                }
            }
        }

        self.pages.age_all(0.5);
        self.router.note_memory_migration();
        Ok(())
    }

    fn export_charts(&mut self) -> Result<()> {
        let time_s = self.start.elapsed().as_secs_f64();

        if let Some(exporter) = &mut self.thread_csv {
            for tid in self.threads.tids().collect::<Vec<_>>() {
                let pid = self.tree.get(tid).map(|p| p.ppid).unwrap_or(tid);
                let node = self.tree.get(tid).and_then(|p| p.pinned_node).unwrap_or(0);
                let cpu_use = self.tree.get(tid).map(|p| p.cpu_use).unwrap_or(0.0);
                let performance = self.threads.performance(tid, node);
                let relative_performance = self.threads.relative_performance(tid, node, cpu_use);

                exporter.write_row(&ThreadCsvRow {
                    tick: self.tick,
                    time_s,
                    pid,
                    tid,
                    node,
                    cpu_use,
                    performance,
                    relative_performance,
                })?;
            }
        }

        if let Some(exporter) = &mut self.memory_csv {
            for page in self.pages.pages().collect::<Vec<_>>() {
                if let Some(row) = self.pages.row_mut(page) {
                    let (majority_node, ratio) = row.majority_node();
                    exporter.write_row(&MemoryCsvRow {
                        tick: self.tick,
                        time_s,
                        page,
                        current_node: row.current_node(),
                        majority_node,
                        ratio,
                    })?;
                }
            }
        }

        Ok(())
    }

    /// On a caught SIGTERM/SIGINT, forwards that same signal to every
    /// tracked TID before doing anything else, then writes the tickets file
    /// (if configured) and restores the optimizer's own affinity on the
    /// tracked root PID (spec section 5: "on SIGTERM/SIGINT it propagates
    /// the signal to every filtered TID then performs the same shutdown").
    fn shutdown(&mut self, caught_signal: Option<i32>) {
        if let Some(sig) = caught_signal {
            for tid in self.tree.pids() {
                if let Err(e) = signal::kill(Pid::from_raw(tid), Signal::try_from(sig).ok()) {
                    warn!("failed to forward signal {} to tid {}: {}", sig, tid, e);
                }
            }
        }

        if let Some(path) = &self.config.tickets_write {
            if let Err(e) = self.constants.write_file(path) {
                warn!("failed to write tickets file {:?}: {}", path, e);
            }
        }
        let _ = self.tree.unpin(self.tree.root());
    }
}

fn seconds_since(last: Instant, now: Instant) -> f64 {
    now.saturating_duration_since(last).as_secs_f64()
}

/// AVX-512 FP groups are only meaningful on hardware that supports them;
/// the core eight groups are always attempted (spec section 4.3: "optionally
/// FP_512D/S").
fn available_groups() -> Vec<EventGroup> {
    if has_avx512() {
        EventGroup::ALL.to_vec()
    } else {
        EventGroup::CORE.to_vec()
    }
}

fn has_avx512() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::is_x86_feature_detected!("avx512f")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Applies `SCHED_FIFO` at `priority` to the optimizer's own process (spec
/// section 6's `-R/--real-time-sched`). Failure is logged, not fatal: a
/// non-privileged run simply keeps the default scheduler.
fn set_own_scheduler(priority: i32) {
    let param = libc::sched_param { sched_priority: priority };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!("failed to set SCHED_FIFO priority {}: {}", priority, std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_groups_always_includes_the_core_eight() {
        let groups = available_groups();
        for g in EventGroup::CORE.iter() {
            assert!(groups.contains(g));
        }
    }
}
