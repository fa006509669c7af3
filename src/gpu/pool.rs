// src/gpu/pool.rs
//! Surface pool: recycles render targets by description.
//!
//! Not content addressed. `pop` hands out any idle surface whose description
//! matches (allocating on a miss), `push` returns a surface for reuse. Idle
//! surfaces above `max_idle` are released least-recently-returned first.

use std::collections::HashMap;

use lru::LruCache;

use crate::error::Result;

use super::{GpuBackend, GpuSurface, SurfaceDesc, SurfaceId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub idle: usize,
    pub idle_bytes: usize,
}

pub struct SurfacePool<S> {
    idle: HashMap<SurfaceDesc, Vec<S>>,
    recency: LruCache<SurfaceId, SurfaceDesc>,
    max_idle: usize,
    stats: PoolStats,
}

impl<S: GpuSurface> SurfacePool<S> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: HashMap::new(),
            recency: LruCache::unbounded(),
            max_idle,
            stats: PoolStats::default(),
        }
    }

    /// An idle surface matching `desc`, or a freshly allocated one.
    /// Allocation failures propagate unchanged.
    pub fn pop<B>(&mut self, backend: &B, desc: SurfaceDesc) -> Result<S>
    where
        B: GpuBackend<Surface = S>,
    {
        if let Some(surface) = self.take(&desc) {
            self.stats.hits += 1;
            return Ok(surface);
        }
        self.stats.misses += 1;
        log::debug!(
            "surface pool miss: allocating {}x{} {}",
            desc.width,
            desc.height,
            desc.format
        );
        backend.allocate_surface(&desc)
    }

    /// An idle surface matching `desc`, without allocating.
    pub fn take(&mut self, desc: &SurfaceDesc) -> Option<S> {
        let surface = self.idle.get_mut(desc)?.pop()?;
        self.recency.pop(&surface.id());
        self.stats.idle -= 1;
        self.stats.idle_bytes -= desc.size_bytes();
        Some(surface)
    }

    /// Returns a surface for reuse.
    pub fn push(&mut self, surface: S) {
        let desc = surface.desc();
        if self.recency.contains(&surface.id()) {
            return;
        }
        self.recency.put(surface.id(), desc);
        self.idle.entry(desc).or_default().push(surface);
        self.stats.idle += 1;
        self.stats.idle_bytes += desc.size_bytes();
        self.trim(self.max_idle);
    }

    /// Releases idle surfaces until at most `keep` remain.
    pub fn trim(&mut self, keep: usize) {
        while self.stats.idle > keep {
            let Some((id, desc)) = self.recency.pop_lru() else {
                break;
            };
            if let Some(list) = self.idle.get_mut(&desc) {
                list.retain(|s| s.id() != id);
                if list.is_empty() {
                    self.idle.remove(&desc);
                }
            }
            self.stats.idle -= 1;
            self.stats.idle_bytes -= desc.size_bytes();
            self.stats.evictions += 1;
        }
    }

    /// Drops every idle surface.
    pub fn clear(&mut self) {
        self.trim(0);
    }

    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessBackend;
    use crate::gpu::SurfaceFormat;

    #[test]
    fn test_pop_reuses_matching_surface() {
        let backend = HeadlessBackend::new();
        let mut pool = SurfacePool::new(8);
        let desc = SurfaceDesc::new(16, 8, SurfaceFormat::Rgba16Float);

        let first = pool.pop(&backend, desc).unwrap();
        let first_id = first.id();
        pool.push(first);
        let again = pool.pop(&backend, desc).unwrap();
        assert_eq!(again.id(), first_id);

        // A different description never matches.
        pool.push(again);
        let other = pool.pop(&backend, SurfaceDesc::new(16, 8, SurfaceFormat::Rgba32Float)).unwrap();
        assert_ne!(other.id(), first_id);

        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.idle_bytes, desc.size_bytes());
        assert_eq!(backend.stats().surfaces_allocated, 2);
    }

    #[test]
    fn test_idle_cap_evicts_oldest() {
        let backend = HeadlessBackend::new();
        let mut pool = SurfacePool::new(2);
        let desc = SurfaceDesc::new(4, 4, SurfaceFormat::Rgba8Unorm);
        let a = pool.pop(&backend, desc).unwrap();
        let b = pool.pop(&backend, desc).unwrap();
        let c = pool.pop(&backend, desc).unwrap();
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
        pool.push(a);
        pool.push(b);
        pool.push(c);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.evictions, 1);
        let mut remaining = vec![pool.take(&desc).unwrap().id(), pool.take(&desc).unwrap().id()];
        remaining.sort();
        assert_eq!(remaining, vec![b_id, c_id]);
        assert!(!remaining.contains(&a_id));
        assert!(pool.take(&desc).is_none());
    }

    #[test]
    fn test_double_push_is_ignored() {
        let backend = HeadlessBackend::new();
        let mut pool = SurfacePool::new(4);
        let surface = pool.pop(&backend, SurfaceDesc::new(2, 2, SurfaceFormat::Rgba8Unorm)).unwrap();
        pool.push(surface.clone());
        pool.push(surface);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let backend = HeadlessBackend::with_memory_budget(1024);
        let mut pool = SurfacePool::new(4);
        let err = pool
            .pop(&backend, SurfaceDesc::new(64, 64, SurfaceFormat::Rgba32Float))
            .err()
            .unwrap();
        assert!(err.is_allocation());
    }
}
