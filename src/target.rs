//! Physical target registry.
//!
//! Requests address cores, clusters and cgroups by logical ids; the
//! coordinator resolves them to the physical ids actually present on the
//! host before touching any node. The core and cluster layout is probed from
//! the sysfs CPU topology tree once at startup; like the resource catalog it
//! is read-only afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use glob::glob;
use log::{debug, warn};

use crate::resource::ApplyType;

pub struct TargetRegistry {
    /// Logical core index -> physical cpu id.
    cores: Vec<u32>,
    /// Logical cluster index -> physical cluster id.
    clusters: Vec<u32>,
    /// Addressable cgroup ids, identity-mapped.
    cgroups: Vec<u32>,
}

impl TargetRegistry {
    /// Probes `<root>/sys/devices/system/cpu` for the core and cluster
    /// layout. Cgroup ids come from the daemon config; there is no reliable
    /// way to enumerate them generically.
    pub fn probe(sysfs_root: &Path, cgroups: &[u32]) -> Result<Self> {
        let pattern = sysfs_root
            .join("sys/devices/system/cpu/cpu[0-9]*")
            .to_string_lossy()
            .into_owned();

        let mut cores = Vec::new();
        let mut clusters = Vec::new();
        for entry in glob(&pattern).context("Failed to glob CPU topology")? {
            let cpu_dir = match entry {
                Ok(dir) => dir,
                Err(err) => {
                    warn!("Skipping unreadable CPU directory: {}", err);
                    continue;
                }
            };
            let Some(cpu_id) = cpu_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            cores.push(cpu_id);

            // Older kernels have no cluster_id; fall back to the package id
            // so cluster-level resources still resolve somewhere sane.
            let cluster_id = read_topology_id(&cpu_dir, "cluster_id")
                .or_else(|| read_topology_id(&cpu_dir, "physical_package_id"))
                .unwrap_or(0);
            if !clusters.contains(&cluster_id) {
                clusters.push(cluster_id);
            }
        }
        cores.sort_unstable();
        clusters.sort_unstable();

        debug!(
            "Target layout: {} cores, {} clusters, {} cgroups",
            cores.len(),
            clusters.len(),
            cgroups.len()
        );
        Ok(Self {
            cores,
            clusters,
            cgroups: cgroups.to_vec(),
        })
    }

    /// Builds a registry from an explicit layout. Used by embedders that
    /// already know the topology and by tests.
    pub fn with_layout(cores: Vec<u32>, clusters: Vec<u32>, cgroups: Vec<u32>) -> Self {
        Self {
            cores,
            clusters,
            cgroups,
        }
    }

    /// Translates a logical sub-target id to the physical id the applier
    /// should address. `None` means the host has no such target and the
    /// triple should be skipped.
    pub fn translate(&self, apply_type: ApplyType, logical: u32) -> Option<u32> {
        match apply_type {
            ApplyType::Global => Some(0),
            ApplyType::Core => self.cores.get(logical as usize).copied(),
            ApplyType::Cluster => self.clusters.get(logical as usize).copied(),
            ApplyType::CGroup => self
                .cgroups
                .iter()
                .find(|&&id| id == logical)
                .copied(),
        }
    }

    /// Every physical sub-target id a resource of the given type can
    /// address on this host. Used at startup to capture the default value
    /// of each concrete node.
    pub fn physical_targets(&self, apply_type: ApplyType) -> Vec<u32> {
        match apply_type {
            ApplyType::Global => vec![0],
            ApplyType::Core => self.cores.clone(),
            ApplyType::Cluster => self.clusters.clone(),
            ApplyType::CGroup => self.cgroups.clone(),
        }
    }

    /// Number of coordinator slots needed per resource of the given type:
    /// slot vectors are indexed by physical id, so this covers the densest
    /// id present plus one.
    pub fn slot_count(&self, apply_type: ApplyType) -> usize {
        let max_id = |ids: &[u32]| ids.iter().max().map_or(0, |&m| m as usize + 1);
        match apply_type {
            ApplyType::Global => 1,
            ApplyType::Core => max_id(&self.cores),
            ApplyType::Cluster => max_id(&self.clusters),
            ApplyType::CGroup => max_id(&self.cgroups),
        }
    }

    pub fn nr_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn nr_clusters(&self) -> usize {
        self.clusters.len()
    }
}

fn read_topology_id(cpu_dir: &Path, file: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(cpu_dir.join("topology").join(file)).ok()?;
    raw.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_per_apply_type() {
        let reg = TargetRegistry::with_layout(vec![0, 1, 2, 3], vec![0, 1], vec![7]);

        assert_eq!(reg.translate(ApplyType::Global, 99), Some(0));
        assert_eq!(reg.translate(ApplyType::Core, 2), Some(2));
        assert_eq!(reg.translate(ApplyType::Core, 4), None);
        assert_eq!(reg.translate(ApplyType::Cluster, 1), Some(1));
        assert_eq!(reg.translate(ApplyType::CGroup, 7), Some(7));
        assert_eq!(reg.translate(ApplyType::CGroup, 8), None);
    }

    #[test]
    fn slot_counts_cover_sparse_physical_ids() {
        let reg = TargetRegistry::with_layout(vec![0, 2, 5], vec![0, 3], vec![]);
        assert_eq!(reg.slot_count(ApplyType::Global), 1);
        assert_eq!(reg.slot_count(ApplyType::Core), 6);
        assert_eq!(reg.slot_count(ApplyType::Cluster), 4);
        assert_eq!(reg.slot_count(ApplyType::CGroup), 0);
    }

    #[test]
    fn probe_reads_fake_topology_tree() {
        let root = tempfile::tempdir().unwrap();
        for cpu in 0..4 {
            let topo = root
                .path()
                .join(format!("sys/devices/system/cpu/cpu{cpu}/topology"));
            std::fs::create_dir_all(&topo).unwrap();
            std::fs::write(topo.join("cluster_id"), format!("{}\n", cpu / 2)).unwrap();
        }

        let reg = TargetRegistry::probe(root.path(), &[3]).unwrap();
        assert_eq!(reg.nr_cores(), 4);
        assert_eq!(reg.nr_clusters(), 2);
        assert_eq!(reg.translate(ApplyType::Cluster, 1), Some(1));
        assert_eq!(reg.translate(ApplyType::CGroup, 3), Some(3));
    }
}
