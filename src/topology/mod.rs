//! Topology model (spec §2 item 1 / §3): logical cores and the cluster ids
//! allocation/monitoring group them by, plus the derived id lists callers
//! need to fan a per-cluster operation out over cores.

use std::collections::BTreeSet;

/// A single logical core and the clusters it belongs to for each
/// allocation/monitoring technology.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Core {
    pub lcore: u32,
    pub socket: u32,
    pub l2_cluster: u32,
    pub l3_cluster: u32,
    pub mba_cluster: u32,
}

/// Cache geometry for one cache level, used by `ClassMask` validation
/// (contiguous bit-run length must fit `num_ways`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub num_ways: u32,
    pub way_size: u64,
    pub line_size: u32,
    pub num_sets: u32,
    pub total_size: u64,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct CpuInfo {
    cores: Vec<Core>,
    pub l2: Option<CacheInfo>,
    pub l3: Option<CacheInfo>,
}

impl CpuInfo {
    pub fn new(cores: Vec<Core>, l2: Option<CacheInfo>, l3: Option<CacheInfo>) -> Self {
        CpuInfo { cores, l2, l3 }
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn core(&self, lcore: u32) -> Option<&Core> {
        self.cores.iter().find(|c| c.lcore == lcore)
    }

    fn unique<F: Fn(&Core) -> u32>(&self, f: F) -> Vec<u32> {
        let set: BTreeSet<u32> = self.cores.iter().map(f).collect();
        set.into_iter().collect()
    }

    pub fn sockets(&self) -> Vec<u32> {
        self.unique(|c| c.socket)
    }

    pub fn l2_clusters(&self) -> Vec<u32> {
        self.unique(|c| c.l2_cluster)
    }

    pub fn l3_clusters(&self) -> Vec<u32> {
        self.unique(|c| c.l3_cluster)
    }

    pub fn mba_clusters(&self) -> Vec<u32> {
        self.unique(|c| c.mba_cluster)
    }

    /// Cores belonging to a given L3-CAT cluster id, ascending.
    pub fn cores_in_l3_cluster(&self, cluster_id: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.l3_cluster == cluster_id)
            .map(|c| c.lcore)
            .collect()
    }

    pub fn cores_in_l2_cluster(&self, cluster_id: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.l2_cluster == cluster_id)
            .map(|c| c.lcore)
            .collect()
    }

    pub fn cores_in_mba_cluster(&self, cluster_id: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.mba_cluster == cluster_id)
            .map(|c| c.lcore)
            .collect()
    }

    pub fn cores_on_socket(&self, socket: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.socket == socket)
            .map(|c| c.lcore)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CpuInfo {
        CpuInfo::new(
            vec![
                Core { lcore: 0, socket: 0, l2_cluster: 0, l3_cluster: 0, mba_cluster: 0 },
                Core { lcore: 1, socket: 0, l2_cluster: 0, l3_cluster: 0, mba_cluster: 0 },
                Core { lcore: 2, socket: 1, l2_cluster: 1, l3_cluster: 1, mba_cluster: 1 },
            ],
            None,
            None,
        )
    }

    #[test]
    fn derived_lists_are_unique_and_sorted() {
        let cpu = sample();
        assert_eq!(cpu.sockets(), vec![0, 1]);
        assert_eq!(cpu.l3_clusters(), vec![0, 1]);
    }

    #[test]
    fn cluster_membership() {
        let cpu = sample();
        assert_eq!(cpu.cores_in_l3_cluster(0), vec![0, 1]);
        assert_eq!(cpu.cores_in_l3_cluster(1), vec![2]);
    }
}
