/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thin, typed wrappers over the Linux syscall surfaces this benchmark needs:
//! thread pinning, raw ioctls, and NUMA topology discovery from sysfs.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use nix::sched::CpuSet;
use nix::sched::sched_setaffinity;
use nix::unistd::Pid;
use regex::Regex;

/// Pin the calling thread to the given CPU.
///
/// Note this pins the underlying OS thread; the caller must own its thread
/// exclusively for the lifetime of the pinning (no task runtime migration).
pub fn pin_to_cpu(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    // Pid 0 targets the calling thread, per sched_setaffinity(2).
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Issue a raw ioctl. `arg` is passed through verbatim, so it may be either an
/// immediate value or a pointer cast to `c_ulong` depending on the request.
///
/// # Safety
///
/// If the request expects a pointer, `arg` must point to a live, correctly
/// sized and aligned object for the duration of the call.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> nix::Result<()> {
    nix::errno::Errno::result(libc::ioctl(fd, request, arg)).map(drop)
}

const NODE_SYSFS_ROOT: &str = "/sys/devices/system/node";

/// The machine's NUMA layout: which node each CPU belongs to.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    /// Indexed by CPU id; every online CPU has an entry.
    node_of_cpu: Vec<u32>,
    nodes: BTreeMap<u32, Vec<usize>>,
}

impl NumaTopology {
    /// Discover the topology from sysfs. Fails if any CPU in
    /// `[0, online-cpu-count)` is missing from every node's cpulist.
    pub fn detect() -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let node_dir_re = Regex::new(r"^node([0-9]+)$").expect("static regex");
        let entries = fs::read_dir(NODE_SYSFS_ROOT)
            .with_context(|| format!("reading {}", NODE_SYSFS_ROOT))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", NODE_SYSFS_ROOT))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(captures) = node_dir_re.captures(&name) else {
                continue;
            };
            let node: u32 = captures[1].parse().expect("regex only matches digits");
            let cpulist_path = Path::new(NODE_SYSFS_ROOT).join(&*name).join("cpulist");
            let cpulist = fs::read_to_string(&cpulist_path)
                .with_context(|| format!("reading {}", cpulist_path.display()))?;
            let cpus = parse_cpu_list(&cpulist)
                .with_context(|| format!("parsing {}", cpulist_path.display()))?;
            nodes.insert(node, cpus);
        }
        Self::from_nodes(nodes, num_cpus::get())
    }

    /// Build a topology from an explicit node → CPUs map, validating that it
    /// covers every CPU in `[0, online_cpus)`.
    pub fn from_nodes(nodes: BTreeMap<u32, Vec<usize>>, online_cpus: usize) -> Result<Self> {
        let mut node_of_cpu = vec![None; online_cpus];
        for (&node, cpus) in &nodes {
            for &cpu in cpus {
                // CPUs beyond the online range (e.g. possible-but-offline)
                // don't get workers, so they don't need a mapping.
                if let Some(slot) = node_of_cpu.get_mut(cpu) {
                    *slot = Some(node);
                }
            }
        }
        let node_of_cpu = node_of_cpu
            .into_iter()
            .enumerate()
            .map(|(cpu, node)| {
                node.with_context(|| format!("CPU {} not listed in any NUMA node", cpu))
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(Self { node_of_cpu, nodes })
    }

    /// The NUMA node the given CPU belongs to, or `None` for an unknown CPU.
    pub fn node_of(&self, cpu: usize) -> Option<u32> {
        self.node_of_cpu.get(cpu).copied()
    }

    /// Number of online CPUs covered by this topology.
    pub fn cpu_count(&self) -> usize {
        self.node_of_cpu.len()
    }

    /// The node → CPUs map, as read from sysfs.
    pub fn nodes(&self) -> &BTreeMap<u32, Vec<usize>> {
        &self.nodes
    }
}

/// Parse a Linux bitmap list as found in sysfs `cpulist` files: comma
/// separated ranges of the form `a-b` or singletons `a`. Trailing whitespace
/// and empty segments are tolerated.
///
/// See <https://docs.kernel.org/core-api/printk-formats.html> for the format.
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((from, to)) => {
                let from: usize = from
                    .parse()
                    .with_context(|| format!("parsing {:?} (from {:?}) as CPU id", from, part))?;
                let to: usize = to
                    .parse()
                    .with_context(|| format!("parsing {:?} (from {:?}) as CPU id", to, part))?;
                if to < from {
                    bail!("backwards CPU range {:?}", part);
                }
                cpus.extend(from..=to);
            }
            None => {
                let cpu: usize = part
                    .parse()
                    .with_context(|| format!("parsing {:?} as CPU id", part))?;
                cpus.push(cpu);
            }
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_singleton() {
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn parse_mixed() {
        assert_eq!(parse_cpu_list("0-2,5,7-8").unwrap(), vec![0, 1, 2, 5, 7, 8]);
    }

    #[test]
    fn parse_tolerates_whitespace_and_empty_segments() {
        assert_eq!(parse_cpu_list("0-1,\n").unwrap(), vec![0, 1]);
        assert_eq!(parse_cpu_list(" 2 , , 4 ").unwrap(), vec![2, 4]);
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_cpu_list("zero").is_err());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("1-x").is_err());
    }

    #[test]
    fn topology_covers_all_cpus() {
        let nodes = BTreeMap::from([(0, vec![0, 1]), (1, vec![2, 3])]);
        let topology = NumaTopology::from_nodes(nodes, 4).unwrap();
        assert_eq!(topology.cpu_count(), 4);
        assert_eq!(topology.node_of(0), Some(0));
        assert_eq!(topology.node_of(1), Some(0));
        assert_eq!(topology.node_of(2), Some(1));
        assert_eq!(topology.node_of(3), Some(1));
        assert_eq!(topology.node_of(4), None);
    }

    #[test]
    fn topology_rejects_uncovered_cpu() {
        let nodes = BTreeMap::from([(0, vec![0, 1])]);
        let err = NumaTopology::from_nodes(nodes, 4).unwrap_err();
        assert!(err.to_string().contains("CPU 2"), "{}", err);
    }

    #[test]
    fn topology_ignores_offline_cpus() {
        // node lists may mention CPUs beyond the online count.
        let nodes = BTreeMap::from([(0, vec![0, 1, 2, 3, 8, 9])]);
        let topology = NumaTopology::from_nodes(nodes, 4).unwrap();
        assert_eq!(topology.cpu_count(), 4);
    }

    #[test]
    fn pin_to_current_cpu() {
        // CPU 0 is always online.
        pin_to_cpu(0).unwrap();
    }

    #[test]
    fn detect_on_this_machine() {
        // Requires a sysfs NUMA hierarchy; every Linux machine has node0.
        if !Path::new(NODE_SYSFS_ROOT).exists() {
            return;
        }
        let topology = NumaTopology::detect().unwrap();
        assert_eq!(topology.cpu_count(), num_cpus::get());
        assert!(topology.node_of(0).is_some());
    }
}
