//! Node/CPU topology discovery (spec section 4.1).
//!
//! On a real NUMA machine this reads `/sys/devices/system/node/node*` and
//! `/sys/devices/system/cpu/cpu*` to learn which CPUs belong to which node
//! and the kernel-reported distance matrix. On a single-node (UMA) machine
//! there are no `node*` entries under `/sys/devices/system/node` beyond
//! `node0`, in which case a single node synthesized to own every allowed CPU
//! is returned, per spec: "all subsequent code paths treat UMA as the N=1
//! special case".

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub type NodeId = usize;
pub type CpuId = usize;

/// The local distance the kernel reports from a node to itself. Used to
/// normalize `PREF_NODE` ticket scaling (spec section 4.7).
pub const LOCAL_DISTANCE: u32 = 10;

/// Immutable node/CPU layout of the machine the optimizer is running on.
#[derive(Clone, Debug)]
pub struct Topology {
    cpu_node: Vec<NodeId>,
    node_cpus: Vec<Vec<CpuId>>,
    /// `distance[i][j]` = kernel-reported NUMA distance from node i to j.
    distance: Vec<Vec<u32>>,
    /// `by_distance[i]` = nodes sorted by ascending distance from node i;
    /// `by_distance[i][0] == i` always (spec section 3, Node invariant).
    by_distance: Vec<Vec<NodeId>>,
}

impl Topology {
    /// Discovers the topology from sysfs. Falls back to a synthesized
    /// single-node UMA topology if `/sys/devices/system/node` exposes no
    /// NUMA nodes (the common case on a desktop or a container without node
    /// visibility).
    pub fn discover() -> Result<Self> {
        let node_root = Path::new("/sys/devices/system/node");
        let mut node_ids = read_indices(node_root, "node")?;

        if node_ids.is_empty() {
            return Self::synthesize_uma();
        }
        node_ids.sort_unstable();

        let mut node_cpus = vec![Vec::new(); node_ids.len()];
        let mut cpu_node = Vec::new();

        for &node in &node_ids {
            let cpulist_path = node_root.join(format!("node{}", node)).join("cpulist");
            let cpus = read_cpulist(&cpulist_path)?;
            for cpu in cpus {
                if cpu_node.len() <= cpu {
                    cpu_node.resize(cpu + 1, usize::MAX);
                }
                cpu_node[cpu] = node;
                node_cpus[node].push(cpu);
            }
        }

        if cpu_node.iter().any(|&n| n == usize::MAX) {
            return Err(Error::Setup {
                inner: "not every CPU in sysfs is assigned to a NUMA node".into(),
            });
        }

        let mut distance = Vec::with_capacity(node_ids.len());
        for &node in &node_ids {
            let dist_path = node_root.join(format!("node{}", node)).join("distance");
            distance.push(read_distance_row(&dist_path)?);
        }

        let by_distance = (0..node_ids.len())
            .map(|origin| sorted_by_distance(origin, &distance))
            .collect();

        Ok(Self {
            cpu_node,
            node_cpus,
            distance,
            by_distance,
        })
    }

    /// UMA fallback: a single node owning every CPU the process is allowed
    /// to run on (per `sched_getaffinity` of the calling process).
    fn synthesize_uma() -> Result<Self> {
        let n_cpus = allowed_cpu_count()?;
        let node_cpus = vec![(0..n_cpus).collect()];
        let cpu_node = vec![0; n_cpus];
        Ok(Self {
            cpu_node,
            node_cpus,
            distance: vec![vec![LOCAL_DISTANCE]],
            by_distance: vec![vec![0]],
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.node_cpus.len()
    }

    pub fn n_cpus(&self) -> usize {
        self.cpu_node.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        0..self.n_nodes()
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        0..self.n_cpus()
    }

    pub fn node_of_cpu(&self, cpu: CpuId) -> NodeId {
        self.cpu_node[cpu]
    }

    pub fn cpus_of_node(&self, node: NodeId) -> &[CpuId] {
        &self.node_cpus[node]
    }

    pub fn distance(&self, from: NodeId, to: NodeId) -> u32 {
        self.distance[from][to]
    }

    /// Nodes sorted by ascending distance from `origin`; `origin` itself is
    /// first (spec section 3: "first element is itself").
    pub fn nodes_by_distance(&self, origin: NodeId) -> &[NodeId] {
        &self.by_distance[origin]
    }

    pub fn is_uma(&self) -> bool {
        self.n_nodes() == 1
    }
}

fn sorted_by_distance(origin: NodeId, distance: &[Vec<u32>]) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = (0..distance.len()).collect();
    nodes.sort_by_key(|&n| (distance[origin][n], n));
    nodes
}

fn read_indices(root: &Path, prefix: &str) -> Result<Vec<usize>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Ok(id) = rest.parse::<usize>() {
                out.push(id);
            }
        }
    }
    Ok(out)
}

/// Parses a sysfs `cpulist` of the form `"0-3,8,10-11"`.
fn read_cpulist(path: &Path) -> Result<Vec<CpuId>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_cpulist(text.trim()))
}

fn parse_cpulist(text: &str) -> Vec<CpuId> {
    let mut out = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(n) = part.parse::<usize>() {
            out.push(n);
        }
    }
    out
}

fn read_distance_row(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .split_whitespace()
        .filter_map(|t| t.parse::<u32>().ok())
        .collect())
}

fn allowed_cpu_count() -> Result<usize> {
    let set = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0))
        .map_err(|e| Error::Setup {
            inner: format!("sched_getaffinity failed: {}", e),
        })?;
    let mut count = 0;
    for cpu in 0..libc::CPU_SETSIZE as usize {
        if set.is_set(cpu).unwrap_or(false) {
            count = cpu + 1;
        }
    }
    if count == 0 {
        count = 1;
    }
    Ok(count)
}

/// Synthetic topologies for other modules' unit tests, which need a
/// `Topology` value but not real sysfs data.
#[cfg(test)]
pub mod test_support {
    use super::*;

    /// `n` nodes, one CPU each, uniform non-local distance of 21.
    pub fn flat(n: usize) -> Topology {
        let distance: Vec<Vec<u32>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { LOCAL_DISTANCE } else { 21 }).collect())
            .collect();
        let by_distance = (0..n).map(|origin| sorted_by_distance(origin, &distance)).collect();
        Topology {
            cpu_node: (0..n).collect(),
            node_cpus: (0..n).map(|i| vec![i]).collect(),
            distance,
            by_distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpulist_ranges_and_singletons() {
        assert_eq!(parse_cpulist("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpulist("0"), vec![0]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn uma_topology_has_single_node_by_distance_of_itself() {
        let topo = Topology {
            cpu_node: vec![0, 0, 0, 0],
            node_cpus: vec![vec![0, 1, 2, 3]],
            distance: vec![vec![LOCAL_DISTANCE]],
            by_distance: vec![vec![0]],
        };
        assert!(topo.is_uma());
        assert_eq!(topo.nodes_by_distance(0), &[0]);
        assert_eq!(topo.n_cpus(), 4);
    }

    #[test]
    fn nodes_by_distance_sorts_ascending_with_self_first() {
        let distance = vec![
            vec![10, 21, 21],
            vec![21, 10, 21],
            vec![21, 21, 10],
        ];
        assert_eq!(sorted_by_distance(0, &distance), vec![0, 1, 2]);
        assert_eq!(sorted_by_distance(1, &distance), vec![1, 0, 2]);
    }
}
