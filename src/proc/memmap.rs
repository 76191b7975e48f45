//! Memory-map tracker (spec section 4.4): joins `/proc/<pid>/maps` with
//! `/proc/<pid>/numa_maps`, snapshots `/proc/vmstat`, and optionally groups
//! small pages into fixed-size fake-THP runs.

use std::collections::HashMap;
use std::fs;

use libc::pid_t;
use page_size::get as page_size;

use crate::error::Result;
use crate::topology::NodeId;

pub type Addr = u64;

#[derive(Clone, Debug, Default)]
pub struct MemRegion {
    pub begin: Addr,
    pub end: Addr,
    pub flags: String,
    pub file: Option<String>,
    pub heap: bool,
    pub stack: bool,
    pub huge: bool,
    /// Per-node resident page counts from `numa_maps`' `N<id>=<count>` terms.
    pub node_pages: HashMap<NodeId, u64>,
}

impl MemRegion {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_pages(&self) -> u64 {
        self.node_pages.values().sum()
    }

    /// The node holding the most of this region's resident pages (used when
    /// fake-THP groups pages under one region-wide preferred node).
    pub fn majority_node(&self) -> Option<NodeId> {
        self.node_pages
            .iter()
            .max_by_key(|&(_, &count)| count)
            .map(|(&node, _)| node)
    }
}

/// A run of `K` contiguous small pages inside one `MemRegion`, used as a
/// coarser migration unit (spec section 3, 4.4). `page_size * len` gives the
/// byte span.
#[derive(Clone, Debug)]
pub struct FakeThpRun {
    pub region_begin: Addr,
    pub start_page: Addr,
    pub page_count: u32,
}

impl FakeThpRun {
    pub fn start_addr(&self) -> Addr {
        self.start_page * page_size() as u64
    }

    pub fn pages(&self) -> impl Iterator<Item = Addr> + '_ {
        let start = self.start_page;
        (0..self.page_count as u64).map(move |i| start + i)
    }
}

#[derive(Clone, Debug, Default)]
pub struct VmStat {
    pub entries: HashMap<String, u64>,
}

impl VmStat {
    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }
}

/// Tracks memory regions for every non-LWP tracked PID, rebuilt from scratch
/// on every memory tick (spec section 4.4).
pub struct MemMapTracker {
    fake_thp_pages: u32,
    regions: HashMap<pid_t, Vec<MemRegion>>,
    thp_runs: HashMap<pid_t, Vec<FakeThpRun>>,
    vmstat: VmStat,
}

impl MemMapTracker {
    pub fn new(fake_thp_pages: u32) -> Self {
        MemMapTracker {
            fake_thp_pages,
            regions: HashMap::new(),
            thp_runs: HashMap::new(),
            vmstat: VmStat::default(),
        }
    }

    pub fn fake_thp_enabled(&self) -> bool {
        self.fake_thp_pages > 0
    }

    pub fn regions(&self, pid: pid_t) -> &[MemRegion] {
        self.regions.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn thp_runs(&self, pid: pid_t) -> &[FakeThpRun] {
        self.thp_runs.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn vmstat(&self) -> &VmStat {
        &self.vmstat
    }

    /// Refreshes region data for every tracked non-LWP PID and re-snapshots
    /// `/proc/vmstat`. Per-pid failures (PID disappeared) are swallowed:
    /// `Process` removal is handled by the process tree, not here.
    pub fn refresh<'a>(&mut self, pids: impl Iterator<Item = pid_t>) -> Result<()> {
        self.vmstat = read_vmstat()?;

        let mut new_regions = HashMap::new();
        let mut new_runs = HashMap::new();

        for pid in pids {
            if let Ok(regions) = build_regions(pid) {
                if self.fake_thp_enabled() {
                    let runs = regions
                        .iter()
                        .flat_map(|r| partition_into_runs(r, self.fake_thp_pages))
                        .collect();
                    new_runs.insert(pid, runs);
                }
                new_regions.insert(pid, regions);
            }
        }

        self.regions = new_regions;
        self.thp_runs = new_runs;
        Ok(())
    }

    /// Finds the region (if any) containing `addr` for `pid`.
    pub fn region_containing(&self, pid: pid_t, addr: Addr) -> Option<&MemRegion> {
        self.regions(pid)
            .iter()
            .find(|r| addr >= r.begin && addr < r.end)
    }
}

fn partition_into_runs(region: &MemRegion, k: u32) -> Vec<FakeThpRun> {
    if k == 0 {
        return Vec::new();
    }
    let ps = page_size() as u64;
    let start_page = region.begin / ps;
    let end_page = (region.end + ps - 1) / ps;
    let mut runs = Vec::new();
    let mut page = start_page;
    while page < end_page {
        let remaining = end_page - page;
        let count = remaining.min(k as u64) as u32;
        runs.push(FakeThpRun {
            region_begin: region.begin,
            start_page: page,
            page_count: count,
        });
        page += count as u64;
    }
    runs
}

/// Joins `/proc/<pid>/maps` with the matching row of `/proc/<pid>/numa_maps`
/// by start address (spec section 3: "Keyed by begin. Rebuilt from scratch
/// each refresh.").
fn build_regions(pid: pid_t) -> std::io::Result<Vec<MemRegion>> {
    let maps_text = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    let numa_text = fs::read_to_string(format!("/proc/{}/numa_maps", pid)).unwrap_or_default();

    let numa_rows: HashMap<Addr, &str> = numa_text
        .lines()
        .filter_map(|line| {
            let addr_str = line.split_whitespace().next()?;
            let addr = u64::from_str_radix(addr_str, 16).ok()?;
            Some((addr, line))
        })
        .collect();

    let mut regions = Vec::new();
    for line in maps_text.lines() {
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let (begin_str, end_str) = match range.split_once('-') {
            Some(p) => p,
            None => continue,
        };
        let begin = match u64::from_str_radix(begin_str, 16) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let end = u64::from_str_radix(end_str, 16).unwrap_or(begin);
        let flags = fields.next().unwrap_or("").to_string();
        // skip offset, dev, inode
        fields.next();
        fields.next();
        fields.next();
        let file: Option<String> = fields.next().map(|s| s.to_string());

        let stack = file.as_deref() == Some("[stack]");
        let heap = file.as_deref() == Some("[heap]");

        let mut node_pages = HashMap::new();
        let mut huge = false;
        if let Some(numa_line) = numa_rows.get(&begin) {
            for tok in numa_line.split_whitespace() {
                if let Some(rest) = tok.strip_prefix('N') {
                    if let Some((node_str, count_str)) = rest.split_once('=') {
                        if let (Ok(node), Ok(count)) = (node_str.parse::<NodeId>(), count_str.parse::<u64>()) {
                            *node_pages.entry(node).or_insert(0) += count;
                        }
                    }
                } else if tok == "huge" {
                    huge = true;
                }
            }
        }

        regions.push(MemRegion {
            begin,
            end,
            flags,
            file,
            heap,
            stack,
            huge,
            node_pages,
        });
    }

    Ok(regions)
}

fn read_vmstat() -> Result<VmStat> {
    let text = fs::read_to_string("/proc/vmstat")?;
    let mut entries = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(v) = value.parse::<u64>() {
                entries.insert(key.to_string(), v);
            }
        }
    }
    Ok(VmStat { entries })
}

/// Reads `/proc/kpageflags` for the given PFN to test the "huge" bit, used
/// when fake-THP detection needs the kernel's real THP grouping. Bit 17 is
/// `KPF_THP` per `include/uapi/linux/kernel-page-flags.h`.
pub fn pfn_is_huge(pfn: u64) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};
    const KPF_THP_BIT: u64 = 22;

    let mut file = fs::File::open("/proc/kpageflags")?;
    file.seek(SeekFrom::Start(pfn * 8))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    let flags = u64::from_ne_bytes(buf);
    Ok(flags & (1 << KPF_THP_BIT) != 0)
}

/// Reads the PFN for a virtual address from `/proc/<pid>/pagemap`.
pub fn pfn_for_addr(pid: pid_t, vaddr: Addr) -> std::io::Result<u64> {
    use std::io::{Read, Seek, SeekFrom};
    const PFN_MASK: u64 = (1 << 55) - 1;
    const PRESENT_BIT: u64 = 1 << 63;

    let ps = page_size() as u64;
    let mut file = fs::File::open(format!("/proc/{}/pagemap", pid))?;
    file.seek(SeekFrom::Start((vaddr / ps) * 8))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    let entry = u64::from_ne_bytes(buf);
    if entry & PRESENT_BIT == 0 {
        return Ok(0);
    }
    Ok(entry & PFN_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(begin: u64, end: u64) -> MemRegion {
        MemRegion {
            begin,
            end,
            flags: "rw-p".into(),
            file: None,
            heap: false,
            stack: false,
            huge: false,
            node_pages: HashMap::new(),
        }
    }

    #[test]
    fn thp_disabled_when_k_is_zero() {
        let r = region(0, page_size() as u64 * 10);
        assert!(partition_into_runs(&r, 0).is_empty());
    }

    #[test]
    fn thp_runs_partition_region_into_k_sized_chunks() {
        let ps = page_size() as u64;
        let r = region(0, ps * 10);
        let runs = partition_into_runs(&r, 4);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].page_count, 4);
        assert_eq!(runs[1].page_count, 4);
        assert_eq!(runs[2].page_count, 2);
    }

    #[test]
    fn majority_node_picks_the_most_populous() {
        let mut r = region(0, 4096);
        r.node_pages.insert(0, 3);
        r.node_pages.insert(1, 9);
        assert_eq!(r.majority_node(), Some(1));
    }
}
