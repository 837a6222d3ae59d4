//! NUMA topology discovery and node-local memory placement.
//!
//! The reference C implementation links `libnuma`. This workspace instead
//! reads the same topology straight out of `/sys/devices/system/node/`, the
//! approach `nebula-memory`'s own NUMA platform module takes — it needs no
//! extra system library and degrades to a single-node view the same way the
//! C source's `numa_available() == -1` branch does.

use std::ffi::c_void;
use std::fs;

use crate::error::PlatformError;
use crate::vm;

pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Immutable NUMA topology: node count, CPU count, and the CPU→node map.
#[derive(Debug, Clone)]
pub struct Topology {
    num_nodes: usize,
    num_cpus: usize,
    cpu_to_node: Vec<usize>,
}

impl Topology {
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Node index for a given CPU index; falls back to node 0 when `cpu` is
    /// out of range (mirrors the C source's defensive clamp in
    /// `get_current_numa_node`).
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0)
    }

    fn single_node(num_cpus: usize) -> Self {
        Topology {
            num_nodes: 1,
            num_cpus,
            cpu_to_node: vec![0; num_cpus],
        }
    }

    /// Discovers topology via `/sys/devices/system/node/`, falling back to
    /// a single-node view covering every online CPU when the directory is
    /// absent (non-NUMA machines, containers, non-Linux targets).
    pub fn discover() -> Result<Self, PlatformError> {
        let num_cpus = online_cpu_count();

        #[cfg(target_os = "linux")]
        {
            if let Ok(topology) = Self::discover_from_sysfs(num_cpus) {
                return Ok(topology);
            }
        }

        Ok(Self::single_node(num_cpus))
    }

    #[cfg(target_os = "linux")]
    fn discover_from_sysfs(num_cpus: usize) -> Result<Self, PlatformError> {
        let entries = fs::read_dir("/sys/devices/system/node/")
            .map_err(|_| PlatformError::TopologyUnavailable)?;

        let mut cpu_to_node = vec![0usize; num_cpus];
        let mut num_nodes = 0usize;
        let mut found_any = false;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let node_id = match name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) {
                Some(id) => id,
                None => continue,
            };

            found_any = true;
            num_nodes = num_nodes.max(node_id + 1);

            let cpulist_path = entry.path().join("cpulist");
            if let Ok(cpulist) = fs::read_to_string(cpulist_path) {
                for cpu in parse_cpu_list(&cpulist) {
                    if cpu < cpu_to_node.len() {
                        cpu_to_node[cpu] = node_id;
                    }
                }
            }
        }

        if !found_any || num_nodes == 0 {
            return Err(PlatformError::TopologyUnavailable);
        }

        Ok(Topology {
            num_nodes,
            num_cpus,
            cpu_to_node,
        })
    }
}

#[cfg(target_os = "linux")]
fn parse_cpu_list(cpulist: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in cpulist.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

fn online_cpu_count() -> usize {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        count as usize
    } else {
        1
    }
}

/// The NUMA node of the CPU the calling thread is currently running on.
/// Not "sticky": a thread can migrate between calls. Engines that need a
/// stable binding sample this once at thread-arena creation time.
pub fn current_cpu_node(topology: &Topology) -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return 0;
    }
    topology.node_of_cpu(cpu as usize)
}

/// Reserves and commits `size` bytes intended to live on NUMA node `node`,
/// then touches every page so the kernel's first-touch policy actually
/// places them there, matching `create_node_pool`'s `memset` in the C
/// source. Binds the range with `mbind(MPOL_BIND)` when available.
pub fn map_on_node(node: usize, size: usize) -> Result<*mut u8, PlatformError> {
    let ptr = vm::map_committed(size)?;
    bind_to_node(ptr, size, node);
    unsafe {
        vm::touch_zero(ptr, size);
    }
    Ok(ptr)
}

/// Maps `size` bytes, preferring huge pages when `size` is already a
/// multiple of [`HUGE_PAGE_SIZE`], falling back to regular anonymous pages
/// on failure — mirrors `allocate_large_block`'s huge-page-then-fallback
/// sequence in the C source.
pub fn map_large(node: usize, size: usize) -> Result<*mut u8, PlatformError> {
    let ptr = if size >= HUGE_PAGE_SIZE {
        map_huge(size).or_else(|_| vm::map_committed(size))?
    } else {
        vm::map_committed(size)?
    };
    bind_to_node(ptr, size, node);
    unsafe {
        vm::touch_zero(ptr, size);
    }
    Ok(ptr)
}

fn map_huge(size: usize) -> Result<*mut u8, PlatformError> {
    #[cfg(target_os = "linux")]
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            log::debug!("platform: huge-page mapping of {} bytes failed, falling back", size);
            Err(PlatformError::ReserveFailed)
        } else {
            Ok(ptr as *mut u8)
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = size;
        Err(PlatformError::ReserveFailed)
    }
}

/// Binds `[ptr, ptr+len)` to `node` via `mbind(MPOL_BIND)`. Best-effort: a
/// failure here is logged, not propagated, matching the C source which
/// ignores `mbind`'s return value.
fn bind_to_node(ptr: *mut u8, len: usize, node: usize) {
    #[cfg(target_os = "linux")]
    {
        const MPOL_BIND: libc::c_int = 2;
        let nodemask: libc::c_ulong = 1u64.checked_shl(node as u32).unwrap_or(0) as libc::c_ulong;
        let max_node = node as libc::c_ulong + 1;
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr as *mut c_void,
                len,
                MPOL_BIND,
                &nodemask as *const libc::c_ulong,
                max_node * 8,
                0 as libc::c_ulong,
            )
        };
        if result != 0 {
            log::debug!("platform: mbind to node {} failed, continuing without a hard binding", node);
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ptr, len, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_yields_at_least_one_node_and_cpu() {
        let topology = Topology::discover().expect("topology discovery");
        assert!(topology.num_nodes() >= 1);
        assert!(topology.num_cpus() >= 1);
    }

    #[test]
    fn node_of_cpu_falls_back_to_zero_out_of_range() {
        let topology = Topology::single_node(4);
        assert_eq!(topology.node_of_cpu(0), 0);
        assert_eq!(topology.node_of_cpu(999), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_cpu_list_handles_ranges_and_singletons() {
        assert_eq!(parse_cpu_list("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
    }

    #[test]
    fn map_on_node_zero_is_usable() {
        let size = vm::page_size();
        let ptr = map_on_node(0, size).expect("map_on_node");
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 42;
            assert_eq!(*ptr, 42);
        }
        vm::release(ptr, size).expect("release");
    }
}
