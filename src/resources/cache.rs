// src/resources/cache.rs
//! Cache keys and the weak-reference registry behind [`super::ResourceManager`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

use xxhash_rust::xxh3::xxh3_64;

use super::{CachedArgs, Resource, ResourceKind, TypedResource};

/// Hash of a string argument (paths, names).
#[inline]
pub fn hash_str(value: &str) -> u64 {
    xxh3_64(value.as_bytes())
}

/// Hash of a path as spelled by the caller. Keys are process-local, never persisted.
#[inline]
pub fn hash_path(path: &Path) -> u64 {
    xxh3_64(path.as_os_str().as_encoded_bytes())
}

/// `(resource kind, argument tag, content hash)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource: ResourceKind,
    pub args: &'static str,
    pub hash: u64,
}

impl CacheKey {
    pub fn of<A: CachedArgs>(args: &A) -> Self {
        Self {
            resource: <A::Resource as TypedResource>::KIND,
            args: A::TAG,
            hash: args.cache_key(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{:016x}", self.resource.name(), self.args, self.hash)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Keyed entries, live or not yet pruned.
    pub cached_entries: usize,
    /// Direct-load entries, live or not yet pruned.
    pub direct_entries: usize,
    pub live: usize,
    pub footprint: usize,
}

/// Weak-reference bookkeeping. Never extends a resource's lifetime.
#[derive(Default)]
pub(crate) struct Registry {
    cached: HashMap<CacheKey, Weak<dyn Resource>>,
    direct: Vec<Weak<dyn Resource>>,
}

impl Registry {
    /// Live instance for `key`; an expired entry is pruned on the spot.
    pub(crate) fn lookup(&mut self, key: &CacheKey) -> Option<Arc<dyn Resource>> {
        let weak = self.cached.get(key)?;
        match weak.upgrade() {
            Some(strong) => Some(strong),
            None => {
                self.cached.remove(key);
                None
            }
        }
    }

    pub(crate) fn insert_cached(&mut self, key: CacheKey, resource: &Arc<dyn Resource>) {
        self.cached.insert(key, Arc::downgrade(resource));
    }

    pub(crate) fn insert_direct(&mut self, resource: &Arc<dyn Resource>) {
        self.direct.push(Arc::downgrade(resource));
    }

    /// Sums live footprints, pruning expired entries as it goes.
    pub(crate) fn footprint(&mut self) -> usize {
        let mut total = 0;
        self.cached.retain(|_, weak| match weak.upgrade() {
            Some(resource) => {
                total += resource.size();
                true
            }
            None => false,
        });
        self.direct.retain(|weak| match weak.upgrade() {
            Some(resource) => {
                total += resource.size();
                true
            }
            None => false,
        });
        total
    }

    pub(crate) fn purge(&mut self) -> usize {
        let before = self.cached.len() + self.direct.len();
        self.cached.retain(|_, weak| weak.strong_count() > 0);
        self.direct.retain(|weak| weak.strong_count() > 0);
        before - (self.cached.len() + self.direct.len())
    }

    /// Snapshot without pruning, so callers can observe lazy eviction.
    pub(crate) fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            cached_entries: self.cached.len(),
            direct_entries: self.direct.len(),
            ..RegistryStats::default()
        };
        for resource in self.cached.values().chain(self.direct.iter()).filter_map(Weak::upgrade) {
            stats.live += 1;
            stats.footprint += resource.size();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{SamplerFromDescription, TextureFromFile, TextureMapping};

    #[test]
    fn test_key_components() {
        let a = CacheKey::of(&TextureFromFile::new("rock.png"));
        let b = CacheKey::of(&TextureFromFile::new("rock.png"));
        let c = CacheKey::of(&TextureFromFile::new("moss.png"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.resource, ResourceKind::Texture2D);
        assert_eq!(a.args, "TextureFromFile");

        let sampler = CacheKey::of(&SamplerFromDescription::new(TextureMapping::Clamp, 8));
        assert_eq!(sampler.hash, 8 | (1 << 8));
        assert!(sampler.to_string().starts_with("Sampler/SamplerFromDescription#"));
    }
}
