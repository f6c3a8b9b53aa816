//! Typed object pools with a soft cap on retained free objects.
//!
//! A pool hands out boxed objects from a free list and takes them back on
//! release, resetting them for reuse. Objects released while the free list
//! is at its retain cap are returned to the allocator instead. Every pool
//! registers its counters in a small process-wide table so diagnostics can
//! enumerate allocation activity across all pools.

mod spin;

pub use spin::{SpinGuard, SpinLock};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Maximum number of pools the process may register.
pub const MAX_POOLS: usize = 8;

/// An object that can live in a pool.
///
/// `reset` restores the object to its freshly-constructed state before it
/// goes back on the free list.
pub trait Poolable: Send {
    fn reset(&mut self);
}

/// Allocation counters shared between a pool and the process registry.
#[derive(Default)]
pub struct PoolCounters {
    /// Total objects ever allocated by this pool.
    max_new: AtomicI64,
    /// Total objects returned to the allocator (released past the cap).
    max_del: AtomicI64,
    /// Objects currently cached on the free list.
    max_now: AtomicI64,
}

impl PoolCounters {
    pub fn allocated(&self) -> i64 {
        self.max_new.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> i64 {
        self.max_del.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> i64 {
        self.max_now.load(Ordering::Relaxed)
    }
}

/// Snapshot of one registered pool, for diagnostics.
#[derive(Debug, Clone)]
pub struct PoolStat {
    pub name: &'static str,
    pub allocated: i64,
    pub released: i64,
    pub cached: i64,
}

struct RegistryEntry {
    name: &'static str,
    counters: Arc<PoolCounters>,
}

static REGISTRY: SpinLock<Vec<RegistryEntry>> = SpinLock::new(Vec::new());

fn register(name: &'static str, counters: Arc<PoolCounters>) {
    let mut table = REGISTRY.lock();
    debug_assert!(table.len() < MAX_POOLS, "pool table full: {name}");
    if table.len() < MAX_POOLS {
        table.push(RegistryEntry { name, counters });
    }
}

/// Enumerate all registered pools.
pub fn pool_stats() -> Vec<PoolStat> {
    REGISTRY
        .lock()
        .iter()
        .map(|e| PoolStat {
            name: e.name,
            allocated: e.counters.allocated(),
            released: e.counters.released(),
            cached: e.counters.cached(),
        })
        .collect()
}

/// A typed free-list pool.
///
/// `take_or_else` pops a recycled object or allocates a fresh one; `put`
/// resets the object and caches it unless the free list is already at
/// `retain_cap`. The free list is guarded by a [`SpinLock`] so pools may
/// be shared across threads.
pub struct ObjectPool<T: Poolable> {
    free: SpinLock<Vec<Box<T>>>,
    retain_cap: usize,
    counters: Arc<PoolCounters>,
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool and register it in the process table.
    pub fn new(name: &'static str, retain_cap: usize) -> Self {
        let counters = Arc::new(PoolCounters::default());
        register(name, counters.clone());
        Self {
            free: SpinLock::new(Vec::new()),
            retain_cap,
            counters,
        }
    }

    /// Take a recycled object, or build one with `init` if the free list
    /// is empty.
    pub fn take_or_else(&self, init: impl FnOnce() -> T) -> Box<T> {
        if let Some(obj) = self.free.lock().pop() {
            self.counters.max_now.fetch_sub(1, Ordering::Relaxed);
            return obj;
        }
        self.counters.max_new.fetch_add(1, Ordering::Relaxed);
        Box::new(init())
    }

    /// Release an object back to the pool.
    pub fn put(&self, mut obj: Box<T>) {
        obj.reset();
        let mut free = self.free.lock();
        if free.len() < self.retain_cap {
            free.push(obj);
            self.counters.max_now.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(free);
            self.counters.max_del.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached object.
    pub fn purge(&self) {
        let mut free = self.free.lock();
        let n = free.len() as i64;
        free.clear();
        drop(free);
        self.counters.max_now.fetch_sub(n, Ordering::Relaxed);
        self.counters.max_del.fetch_add(n, Ordering::Relaxed);
    }

    /// Number of objects currently cached.
    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }
}

impl<T: Poolable + Default> ObjectPool<T> {
    /// Take a recycled object, or a default-constructed one.
    pub fn take(&self) -> Box<T> {
        self.take_or_else(T::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        data: Vec<u8>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn test_take_put_recycles() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("test-recycle", 4);

        let mut obj = pool.take();
        obj.data.extend_from_slice(b"abc");
        pool.put(obj);

        assert_eq!(pool.cached(), 1);

        // The recycled object comes back reset.
        let obj = pool.take();
        assert!(obj.data.is_empty());
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_retain_cap() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("test-cap", 2);

        let a = pool.take();
        let b = pool.take();
        let c = pool.take();
        assert_eq!(pool.counters().allocated(), 3);

        pool.put(a);
        pool.put(b);
        pool.put(c); // past the cap, dropped

        assert_eq!(pool.cached(), 2);
        assert_eq!(pool.counters().released(), 1);
    }

    #[test]
    fn test_purge() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("test-purge", 8);
        for _ in 0..3 {
            let obj = pool.take();
            pool.put(obj);
        }
        // take/put of the same slot leaves one cached
        assert!(pool.cached() >= 1);
        pool.purge();
        assert_eq!(pool.cached(), 0);
        assert_eq!(pool.counters().cached(), 0);
    }

    #[test]
    fn test_registry_enumerates() {
        let _pool: ObjectPool<Scratch> = ObjectPool::new("test-registry", 1);
        let stats = pool_stats();
        assert!(stats.iter().any(|s| s.name == "test-registry"));
    }
}
