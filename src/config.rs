//! CLI parsing and the run configuration it produces (spec section 6,
//! expanded per `SPEC_FULL.md` section 10). Built with `clap`'s derive API
//! the same way the `vadv-rpglot` example in this pack builds its CLI: a
//! `#[derive(Parser)]` struct with typed fields and `value_parser` range
//! validation, so an out-of-range flag is a setup-fatal CLI error rather
//! than a silent clamp.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::strategy::memory::MemoryStrategyKind;
use crate::strategy::thread::ThreadStrategyKind;

fn parse_range<T>(s: &str, lo: T, hi: T) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    let v: T = s.parse().map_err(|e: T::Err| e.to_string())?;
    if v < lo || v > hi {
        return Err(format!("must be between {} and {}", lo, hi));
    }
    Ok(v)
}

fn freq_instr(s: &str) -> Result<u32, String> {
    parse_range(s, 1u32, 1000)
}

fn freq_memory(s: &str) -> Result<u32, String> {
    parse_range(s, 1u32, 1000)
}

fn min_latency(s: &str) -> Result<u32, String> {
    let v: u32 = s.parse().map_err(|_| "not an integer".to_string())?;
    if v == 0 {
        return Err("must be > 0".into());
    }
    Ok(v)
}

fn max_memory_migs(s: &str) -> Result<f64, String> {
    parse_range(s, 0.0f64, 1.0)
}

fn positive_real(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| "not a number".to_string())?;
    if v <= 0.0 {
        return Err("must be > 0".into());
    }
    Ok(v)
}

fn nonneg_real(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| "not a number".to_string())?;
    if v < 0.0 {
        return Err("must be >= 0".into());
    }
    Ok(v)
}

fn verbose_level(s: &str) -> Result<u8, String> {
    parse_range(s, 0u8, 5)
}

/// `optimizer [options] -- <child-program> [child-args...]`
#[derive(Parser, Debug, Clone)]
#[command(name = "optimizer", about = "User-space NUMA-aware runtime optimizer")]
pub struct Cli {
    /// Period (seconds) of the CPU/node balance pre-step.
    #[arg(short = 'b', long = "thread-balance", default_value = "1.0", value_parser = positive_real)]
    pub thread_balance: f64,

    /// Export per-iteration thread CSV rows.
    #[arg(short = 'c', long = "chart-threads")]
    pub chart_threads: bool,

    /// Export per-iteration memory CSV rows.
    #[arg(short = 'C', long = "chart-memory")]
    pub chart_memory: bool,

    /// Redirect the child's stderr; bare flag means `/dev/null`.
    #[arg(short = 'e', long = "stderr-child", num_args = 0..=1, default_missing_value = "")]
    pub stderr_child: Option<String>,

    /// Redirect the child's stdout; bare flag means `/dev/null`.
    #[arg(short = 'o', long = "stdout-child", num_args = 0..=1, default_missing_value = "")]
    pub stdout_child: Option<String>,

    /// Sampling frequency (Hz) for the instruction/FP event groups.
    #[arg(short = 'f', long = "freq-instr", default_value = "10", value_parser = freq_instr)]
    pub freq_instr: u32,

    /// Sampling frequency (Hz) for the MEM event group.
    #[arg(short = 'F', long = "freq-memory", default_value = "10", value_parser = freq_memory)]
    pub freq_memory: u32,

    /// Path to read initial ticket weights from.
    #[arg(short = 'i', long = "tickets-read")]
    pub tickets_read: Option<PathBuf>,

    /// Path to write final ticket weights to at shutdown.
    #[arg(short = 'I', long = "tickets-write")]
    pub tickets_write: Option<PathBuf>,

    /// Minimum latency (cycles) gating the MEM group's PEBS samples.
    #[arg(short = 'l', long = "min-latency", default_value = "30", value_parser = min_latency)]
    pub min_latency: u32,

    /// Maximum number of thread migrations attempted per tick.
    #[arg(short = 'm', long = "max-thread-migs", default_value = "1")]
    pub max_thread_migs: u32,

    /// Fraction (0..1) of the page table eligible for memory migration per tick.
    #[arg(short = 'M', long = "max-memory-migs", default_value = "0.25", value_parser = max_memory_migs)]
    pub max_memory_migs: f64,

    /// Number of adjacent pages to prefetch-extend a memory migration candidate by.
    #[arg(short = 'P', long = "memory-prefetch", default_value = "0")]
    pub memory_prefetch: u32,

    /// Base tick-clock rate multiplier.
    #[arg(short = 'r', long = "rate-sampling", default_value = "1.0", value_parser = positive_real)]
    pub rate_sampling: f64,

    /// Run the optimizer under SCHED_FIFO; bare flag means priority 50.
    #[arg(short = 'R', long = "real-time-sched", num_args = 0..=1, default_missing_value = "50")]
    pub real_time_sched: Option<i32>,

    /// Thread migration strategy.
    #[arg(short = 's', long = "thread-strategy", default_value = "nimar")]
    pub thread_strategy: ThreadStrategyArg,

    /// Memory migration strategy.
    #[arg(short = 'S', long = "memory-strategy", default_value = "lmma")]
    pub memory_strategy: MemoryStrategyArg,

    /// Period (seconds) between thread-migration strategy invocations.
    #[arg(short = 't', long = "thread-time", default_value = "1.0", value_parser = positive_real)]
    pub thread_time: f64,

    /// Period (seconds) between memory-migration strategy invocations.
    #[arg(short = 'T', long = "memory-time", default_value = "1.0", value_parser = positive_real)]
    pub memory_time: f64,

    /// Enable fake transparent-huge-page grouping; optional run length in pages.
    #[arg(long = "thp", num_args = 0..=1, default_missing_value = "16")]
    pub thp: Option<u32>,

    /// Run the child through `/bin/sh -c` instead of `execvp`-ing it directly.
    #[arg(long = "shell")]
    pub shell: bool,

    /// Period (seconds) between process-tree refreshes.
    #[arg(short = 'u', long = "sec-update-proc", default_value = "1.0", value_parser = positive_real)]
    pub sec_update_proc: f64,

    /// Period (seconds) between memory-map refreshes.
    #[arg(short = 'U', long = "sec-update-mem", default_value = "1.0", value_parser = positive_real)]
    pub sec_update_mem: f64,

    /// Verbosity (0..5); see spec section 7.
    #[arg(short = 'v', long = "verbose", default_value = "0", value_parser = verbose_level)]
    pub verbose: u8,

    /// Seconds to wait after launching the child before the first migration tick.
    #[arg(short = 'W', long = "wait-before-mig", default_value = "0.0", value_parser = nonneg_real)]
    pub wait_before_mig: f64,

    /// The child program and its arguments, everything after `--`.
    #[arg(trailing_var_arg = true, required = true)]
    pub child: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
#[value(rename_all = "UPPER")]
pub enum ThreadStrategyArg {
    Lbma,
    Cimar,
    Nimar,
    Imar2,
    Random,
    Rm3d,
    AnnealNode,
}

impl From<ThreadStrategyArg> for ThreadStrategyKind {
    fn from(a: ThreadStrategyArg) -> Self {
        match a {
            ThreadStrategyArg::Lbma => ThreadStrategyKind::Lbma,
            ThreadStrategyArg::Cimar => ThreadStrategyKind::Cimar,
            ThreadStrategyArg::Nimar => ThreadStrategyKind::Nimar,
            ThreadStrategyArg::Imar2 => ThreadStrategyKind::Imar2,
            ThreadStrategyArg::Random => ThreadStrategyKind::Random,
            // RM3D has no implementation of its own here: the retrieval pack's
            // original source doesn't include rm3d_strategy.hpp, so there is
            // nothing to port. Routed to NIMAR as the closest available
            // strategy (shares the node-level, non-rollback ticket scoring)
            // rather than silently dropping the CLI value. See DESIGN.md.
            ThreadStrategyArg::Rm3d => ThreadStrategyKind::Nimar,
            ThreadStrategyArg::AnnealNode => ThreadStrategyKind::AnnealNode,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
#[value(rename_all = "UPPER")]
pub enum MemoryStrategyArg {
    Tmma,
    Lmma,
    Rmma,
}

impl From<MemoryStrategyArg> for MemoryStrategyKind {
    fn from(a: MemoryStrategyArg) -> Self {
        match a {
            MemoryStrategyArg::Tmma => MemoryStrategyKind::Tmma,
            MemoryStrategyArg::Lmma => MemoryStrategyKind::Lmma,
            MemoryStrategyArg::Rmma => MemoryStrategyKind::Rmma,
        }
    }
}

/// Fully resolved run configuration, one field per CLI option, handed to the
/// control loop. Kept separate from `Cli` so tests can build one without
/// going through `clap`.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub thread_balance_period: f64,
    pub chart_threads: bool,
    pub chart_memory: bool,
    pub stderr_child: Option<PathBuf>,
    pub stdout_child: Option<PathBuf>,
    pub freq_instr: u32,
    pub freq_memory: u32,
    pub tickets_read: Option<PathBuf>,
    pub tickets_write: Option<PathBuf>,
    pub min_latency: u32,
    pub max_thread_migrations: u32,
    pub max_memory_migrations_fraction: f64,
    pub memory_prefetch_size: u32,
    pub rate_sampling: f64,
    pub real_time_priority: Option<i32>,
    pub thread_strategy: ThreadStrategyKind,
    pub memory_strategy: MemoryStrategyKind,
    pub thread_migration_interval: f64,
    pub memory_migration_interval: f64,
    pub fake_thp_pages: u32,
    pub shell: bool,
    pub proc_update_period: f64,
    pub mem_update_period: f64,
    pub verbose: u8,
    pub wait_before_migration: f64,
    pub child: Vec<String>,
}

impl From<Cli> for RunConfig {
    fn from(cli: Cli) -> Self {
        RunConfig {
            thread_balance_period: cli.thread_balance,
            chart_threads: cli.chart_threads,
            chart_memory: cli.chart_memory,
            stderr_child: cli.stderr_child.map(|s| PathBuf::from(if s.is_empty() { "/dev/null".into() } else { s })),
            stdout_child: cli.stdout_child.map(|s| PathBuf::from(if s.is_empty() { "/dev/null".into() } else { s })),
            freq_instr: cli.freq_instr,
            freq_memory: cli.freq_memory,
            tickets_read: cli.tickets_read,
            tickets_write: cli.tickets_write,
            min_latency: cli.min_latency,
            max_thread_migrations: cli.max_thread_migs,
            max_memory_migrations_fraction: cli.max_memory_migs,
            memory_prefetch_size: cli.memory_prefetch,
            rate_sampling: cli.rate_sampling,
            real_time_priority: cli.real_time_sched,
            thread_strategy: cli.thread_strategy.into(),
            memory_strategy: cli.memory_strategy.into(),
            thread_migration_interval: cli.thread_time,
            memory_migration_interval: cli.memory_time,
            fake_thp_pages: cli.thp.unwrap_or(0),
            shell: cli.shell,
            proc_update_period: cli.sec_update_proc,
            mem_update_period: cli.sec_update_mem,
            verbose: cli.verbose,
            wait_before_migration: cli.wait_before_mig,
            child: cli.child,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["optimizer", "--", "sleep", "1"]);
        let cfg = RunConfig::from(cli);
        assert!(matches!(cfg.thread_strategy, ThreadStrategyKind::Nimar));
        assert!(matches!(cfg.memory_strategy, MemoryStrategyKind::Lmma));
        assert_eq!(cfg.min_latency, 30);
        assert_eq!(cfg.child, vec!["sleep".to_string(), "1".to_string()]);
    }

    #[test]
    fn rejects_out_of_range_frequency() {
        let res = Cli::try_parse_from(["optimizer", "-f", "0", "--", "sleep", "1"]);
        assert!(res.is_err());
    }
}
