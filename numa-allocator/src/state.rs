//! Process-global allocator state: NUMA topology and per-node backing
//! pools. Guarded by an `RwLock` so the (rare) slow path and thread-arena
//! creation take a cheap shared read lock, while `init`/`cleanup` take the
//! exclusive write lock.

use platform::numa::Topology;
use platform::{vm, Mutex, RwLock};

use std::fmt;

pub(crate) struct NodePool {
    pub node_id: usize,
    pub base: *mut u8,
    pub total_size: usize,
    /// High-water mark of bytes carved out of this pool so far. Written
    /// only while holding this mutex (see the specification's
    /// "Shared Resources" section): the carve itself happens outside the
    /// lock once the reservation succeeds, because the carved span is then
    /// exclusively owned by the caller.
    pub used: Mutex<usize>,
}

// `base` is never mutated after construction and the backing bytes below
// `used` are partitioned exclusively among thread arenas once carved, so
// sharing the pool across threads behind the RwLock is sound.
unsafe impl Send for NodePool {}
unsafe impl Sync for NodePool {}

impl NodePool {
    pub fn create(node_id: usize, size: usize) -> Option<NodePool> {
        let base = platform::numa::map_on_node(node_id, size).ok()?;
        Some(NodePool {
            node_id,
            base,
            total_size: size,
            used: Mutex::new(0),
        })
    }

    pub fn release(self) {
        if let Err(err) = vm::release(self.base, self.total_size) {
            log::warn!("numa: failed to release node {} pool: {err}", self.node_id);
        }
    }

    /// Reserves `total_needed` bytes from this pool's high-water mark,
    /// returning the start of the reserved span. Returns `None` (without
    /// mutating `used`) if the pool is exhausted.
    pub fn reserve(&self, total_needed: usize) -> Option<*mut u8> {
        let mut used = self.used.lock();
        if *used + total_needed > self.total_size {
            log::warn!("numa: node {} pool exhausted", self.node_id);
            return None;
        }
        let start = unsafe { self.base.add(*used) };
        *used += total_needed;
        Some(start)
    }
}

pub(crate) struct NumaState {
    pub topology: Topology,
    pub node_pools: Vec<NodePool>,
}

static STATE: RwLock<Option<NumaState>> = RwLock::new(None);

/// Reasons [`crate::init`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// `init` was already called successfully and `cleanup` hasn't run since.
    AlreadyInitialized,
    /// NUMA topology could not be discovered even via the single-node fallback.
    TopologyUnavailable,
    /// A per-node pool failed to map; carries the node whose pool failed.
    /// Every pool successfully created for an earlier node in this same
    /// call has already been released before this error is returned.
    PoolCreationFailed { node: usize },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlreadyInitialized => write!(f, "NUMA allocator already initialized"),
            InitError::TopologyUnavailable => write!(f, "failed to discover NUMA topology"),
            InitError::PoolCreationFailed { node } => {
                write!(f, "failed to create pool for NUMA node {node}")
            }
        }
    }
}

impl std::error::Error for InitError {}

/// Discovers NUMA topology and reserves a `pool_bytes_per_node`-byte, node-local
/// pool for every node. Fails without mutating any global state if called
/// again before [`crate::cleanup`] undoes a prior successful call.
///
/// If a later node's pool fails to map, every pool already created earlier
/// in this same call is released before returning — resolving the
/// specification's flagged "partial init failure is not rolled back" open
/// question by treating `init` as transactional.
pub fn init(pool_bytes_per_node: usize) -> Result<(), InitError> {
    if STATE.read().is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    let topology = Topology::discover().map_err(|_| InitError::TopologyUnavailable)?;

    let mut pools = Vec::with_capacity(topology.num_nodes());
    for node in 0..topology.num_nodes() {
        match NodePool::create(node, pool_bytes_per_node) {
            Some(pool) => pools.push(pool),
            None => {
                for pool in pools {
                    pool.release();
                }
                return Err(InitError::PoolCreationFailed { node });
            }
        }
    }

    let mut guard = STATE.write();
    if guard.is_some() {
        // Lost a race against a concurrent `init`: release what we built
        // and report the same error a loser would see if it had checked
        // first, rather than leaking the pools we just mapped.
        for pool in pools {
            pool.release();
        }
        return Err(InitError::AlreadyInitialized);
    }

    log::info!(
        "numa: initialized {} node(s), {} cpu(s)",
        topology.num_nodes(),
        topology.num_cpus()
    );
    *guard = Some(NumaState {
        topology,
        node_pools: pools,
    });
    Ok(())
}

/// Unmaps every node pool and drops topology metadata. The caller must
/// ensure no thread is concurrently allocating; this function does not
/// attempt to synchronize with in-flight fast-path accesses beyond taking
/// the exclusive lock that `init` also uses.
pub fn cleanup() {
    let mut guard = STATE.write();
    if let Some(state) = guard.take() {
        for pool in state.node_pools {
            pool.release();
        }
    }
}

/// Runs `f` with a shared reference to the initialized state, or returns
/// `None` (logging at error level) when the allocator hasn't been
/// `init`-ed yet.
pub(crate) fn with_state<R>(f: impl FnOnce(&NumaState) -> R) -> Option<R> {
    let guard = STATE.read();
    match guard.as_ref() {
        Some(state) => Some(f(state)),
        None => {
            log::error!("numa: allocator not initialized; call numa_allocator::init() first");
            None
        }
    }
}

/// A human-readable topology dump, mirroring the reference implementation's
/// `numalloc_print_topology` but returned as a `String` rather than written
/// to stdout — printing from a library is a caller's decision, not this
/// crate's.
pub fn print_topology() -> String {
    with_state(|state| {
        let mut out = String::new();
        out.push_str("=== NUMA Topology ===\n");
        out.push_str(&format!("Nodes: {}\n", state.topology.num_nodes()));
        out.push_str(&format!("CPUs: {}\n", state.topology.num_cpus()));
        out.push_str("\nCPU-to-Node Mapping:\n");
        for cpu in 0..state.topology.num_cpus() {
            out.push_str(&format!("  CPU {:2} -> Node {}\n", cpu, state.topology.node_of_cpu(cpu)));
        }
        out.push_str("====================\n");
        out
    })
    .unwrap_or_else(|| "NUMA allocator not initialized\n".to_string())
}
