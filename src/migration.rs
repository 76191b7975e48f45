//! Migration effectors (spec section 4.7/4.8): applies a thread-migration
//! decision via `sched_setaffinity(2)` (through `ProcessTree::pin_node`) and
//! a memory-migration decision via the raw `move_pages(2)` syscall, which
//! `nix` does not wrap.

use libc::pid_t;

use crate::error::{Error, Result};
use crate::proc::process::ProcessTree;
use crate::strategy::thread::ThreadMigrationDecision;
use crate::topology::{NodeId, Topology};

/// Whether a thread migration moves one TID alone, or swaps two TIDs'
/// node assignments together to avoid transiently unbalancing load (spec
/// section 4.7: "a strategy may propose either a simple move or a pairwise
/// interchange").
#[derive(Clone, Copy, Debug)]
pub enum ThreadMigration {
    Simple(ThreadMigrationDecision),
    Interchange(ThreadMigrationDecision, ThreadMigrationDecision),
}

pub fn apply_thread_migration(tree: &mut ProcessTree, topology: &Topology, migration: &ThreadMigration) -> Result<()> {
    match migration {
        ThreadMigration::Simple(d) => tree.pin_node(d.tid, d.to, topology),
        ThreadMigration::Interchange(a, b) => {
            tree.pin_node(a.tid, a.to, topology)?;
            tree.pin_node(b.tid, b.to, topology)
        }
    }
}

const MPOL_MF_MOVE: libc::c_int = 1 << 1;

/// `nix` has no binding for the raw `move_pages(2)` syscall; `libc::syscall`
/// with `SYS_move_pages` is the documented way to invoke it directly.
///
/// Moves every address in `pages` (same `pid`'s address space) to its
/// matching entry in `nodes` with a single `move_pages(2)` call, returning
/// per-page status codes in the same order. Grounded on the batched
/// `move_pages(const std::vector<addr_t>&, pid_t, const std::vector<int>&)`
/// overload in
/// `examples/original_source/src/system_info/memory_info.hpp`: migration
/// candidates are grouped by PID before being flushed to the kernel, one
/// syscall per PID rather than one per page (spec section 4.8).
pub fn move_pages_batch(pid: pid_t, pages: &[u64], nodes: &[NodeId]) -> Result<Vec<i32>> {
    debug_assert_eq!(pages.len(), nodes.len());

    let mut status: Vec<libc::c_int> = vec![0; pages.len()];
    let ptrs: Vec<*mut libc::c_void> = pages.iter().map(|&a| a as *mut libc::c_void).collect();
    let node_ids: Vec<libc::c_int> = nodes.iter().map(|&n| n as libc::c_int).collect();

    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            pid as libc::c_long,
            pages.len(),
            ptrs.as_ptr(),
            node_ids.as_ptr(),
            status.as_mut_ptr(),
            MPOL_MF_MOVE,
        )
    };

    if ret != 0 {
        return Err(Error::MoveFailed {
            inner: nix::Error::last(),
        });
    }
    Ok(status)
}

/// Queries the current node of each address in `pages` without moving
/// anything, by passing a null `nodes` array (spec section 4.8: used to
/// confirm a prior migration actually landed, and by the page table's
/// garbage collection to re-sync ground truth).
pub fn query_pages(pid: pid_t, pages: &[u64]) -> Result<Vec<i32>> {
    let mut status: Vec<libc::c_int> = vec![0; pages.len()];
    let ptrs: Vec<*mut libc::c_void> = pages.iter().map(|&a| a as *mut libc::c_void).collect();

    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            pid as libc::c_long,
            pages.len(),
            ptrs.as_ptr(),
            std::ptr::null::<libc::c_int>(),
            status.as_mut_ptr(),
            0,
        )
    };

    if ret != 0 {
        return Err(Error::MoveFailed {
            inner: nix::Error::last(),
        });
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpol_mf_move_bit_matches_uapi() {
        assert_eq!(MPOL_MF_MOVE, 2);
    }
}
