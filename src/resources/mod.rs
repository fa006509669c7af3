// src/resources/mod.rs
//! Resource layer: typed load arguments, a pluggable loader factory and a
//! weak-reference cache with memory accounting.
//!
//! - **Cached loads** ([`ResourceManager::load_cached`]) deduplicate on
//!   `(resource kind, argument tag, content hash)` while any strong reference lives.
//! - **Direct loads** ([`ResourceManager::load_direct`]) always construct; they are
//!   tracked only for footprint accounting.
//! - Whether an argument type is cacheable is decided at compile time by its
//!   [`LoadArgs::Cache`] policy; [`ResourceManager::load`] dispatches on it.
//!
//! The manager never extends a resource's lifetime: the registry only holds
//! [`std::sync::Weak`] references, pruned lazily at lookup and footprint time.

pub mod cache;
pub mod factory;
pub mod material;
pub mod mesh;
pub mod texture;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

pub use cache::{CacheKey, RegistryStats};
pub use factory::ResourceFactory;
pub use material::{Material, MaterialFromFile, MaterialFromProperties, MaterialInstance, MaterialProperties, PropertyValue};
pub use mesh::{Mesh, MeshFromVertices, MeshSubset, Vertex};
pub use texture::{Sampler, SamplerFromDescription, Texture2D, TextureFromFile, TextureFromPixels, TextureMapping};

use cache::Registry;

// ---------- Resource traits ----------

/// Five-level residency priority, `Normal` by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourcePriority {
    Minimum = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl ResourcePriority {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Minimum,
            1 => Self::Low,
            3 => Self::High,
            4 => Self::Critical,
            _ => Self::Normal,
        }
    }
}

/// Stable tag identifying a resource type in cache keys and loader dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture2D,
    Sampler,
    Mesh,
    Material,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Texture2D => "Texture2D",
            Self::Sampler => "Sampler",
            Self::Mesh => "Mesh",
            Self::Material => "Material",
        }
    }
}

/// Upcast helper so `Arc<dyn Resource>` can be downcast to its concrete type.
pub trait IntoAnyArc {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> IntoAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A reference-counted CPU or GPU asset.
pub trait Resource: IntoAnyArc + Send + Sync + 'static {
    /// Memory footprint in bytes.
    fn size(&self) -> usize;

    fn priority(&self) -> ResourcePriority;

    /// Last writer wins.
    fn set_priority(&self, priority: ResourcePriority);

    fn kind(&self) -> ResourceKind;
}

/// Compile-time kind of a concrete resource type.
pub trait TypedResource: Resource + Sized {
    const KIND: ResourceKind;
}

/// Interior-mutable priority shared by all resource types.
#[derive(Debug)]
pub struct PriorityCell(AtomicU8);

impl Default for PriorityCell {
    fn default() -> Self {
        Self::new(ResourcePriority::default())
    }
}

impl PriorityCell {
    pub fn new(priority: ResourcePriority) -> Self {
        Self(AtomicU8::new(priority as u8))
    }

    #[inline]
    pub fn get(&self) -> ResourcePriority {
        ResourcePriority::from_u8(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, priority: ResourcePriority) {
        self.0.store(priority as u8, Ordering::Relaxed);
    }
}

impl Clone for PriorityCell {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

// ---------- Load arguments ----------

/// Typed arguments describing how to build a resource.
pub trait LoadArgs: Any + Send + Sync + Sized {
    type Resource: TypedResource;

    /// Cache policy: [`UseCache`] or [`NoCache`].
    type Cache: CachePolicy<Self>;

    /// Stable tag for the argument type.
    const TAG: &'static str;
}

/// Arguments whose content can be hashed into a reproducible cache key.
pub trait CachedArgs: LoadArgs {
    fn cache_key(&self) -> u64;
}

/// Selects the load entry point for an argument type.
pub trait CachePolicy<A: LoadArgs> {
    fn load(manager: &ResourceManager, args: &A) -> Result<Option<Arc<A::Resource>>>;
}

/// Deduplicate through the registry.
#[derive(Debug)]
pub enum UseCache {}

/// Always construct a fresh instance (e.g. explicit vertex data).
#[derive(Debug)]
pub enum NoCache {}

impl<A: CachedArgs> CachePolicy<A> for UseCache {
    #[inline]
    fn load(manager: &ResourceManager, args: &A) -> Result<Option<Arc<A::Resource>>> {
        manager.load_cached(args)
    }
}

impl<A: LoadArgs> CachePolicy<A> for NoCache {
    #[inline]
    fn load(manager: &ResourceManager, args: &A) -> Result<Option<Arc<A::Resource>>> {
        manager.load_direct(args)
    }
}

// ---------- Manager ----------

/// Orchestrates cached and direct loads and reports the live memory footprint.
pub struct ResourceManager {
    base_dir: PathBuf,
    factory: ResourceFactory,
    registry: Mutex<Registry>,
}

impl ResourceManager {
    pub fn new(base_dir: impl Into<PathBuf>, factory: ResourceFactory) -> Self {
        Self {
            base_dir: base_dir.into(),
            factory,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Manager with every built-in loader registered.
    pub fn with_defaults(base_dir: impl Into<PathBuf>) -> Self {
        Self::new(base_dir, ResourceFactory::with_defaults())
    }

    #[inline]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves a path relative to the asset directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Loads through the entry point selected by the argument's cache policy.
    #[inline]
    pub fn load<A: LoadArgs>(&self, args: &A) -> Result<Option<Arc<A::Resource>>> {
        <A::Cache as CachePolicy<A>>::load(self, args)
    }

    /// Returns the live instance for the argument's cache key, or builds and
    /// registers a new one. `Ok(None)` when no loader handles the type pair.
    pub fn load_cached<A: CachedArgs>(&self, args: &A) -> Result<Option<Arc<A::Resource>>> {
        let key = CacheKey::of(args);

        if let Some(hit) = self.registry.lock().lookup(&key) {
            log::debug!("resource cache hit: {key}");
            return Ok(Some(downcast::<A::Resource>(hit)?));
        }

        log::debug!("resource cache miss: {key}");
        let Some(resource) = self.construct(args)? else {
            return Ok(None);
        };

        // Another loader may have won the race while we were constructing.
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.lookup(&key) {
            return Ok(Some(downcast::<A::Resource>(existing)?));
        }
        registry.insert_cached(key, &resource);
        drop(registry);
        Ok(Some(downcast::<A::Resource>(resource)?))
    }

    /// Always builds a new instance; tracked for footprint accounting only.
    pub fn load_direct<A: LoadArgs>(&self, args: &A) -> Result<Option<Arc<A::Resource>>> {
        let Some(resource) = self.construct(args)? else {
            return Ok(None);
        };
        self.registry.lock().insert_direct(&resource);
        Ok(Some(downcast::<A::Resource>(resource)?))
    }

    fn construct<A: LoadArgs>(&self, args: &A) -> Result<Option<Arc<dyn Resource>>> {
        let kind = <A::Resource as TypedResource>::KIND;
        match self.factory.load(self, kind, A::TAG, args) {
            Ok(None) => {
                log::debug!("no loader registered for {}/{}", kind.name(), A::TAG);
                Ok(None)
            }
            Ok(Some(resource)) => Ok(Some(resource)),
            Err(err) => {
                log::warn!("failed to load {}/{}: {err}", kind.name(), A::TAG);
                Err(err)
            }
        }
    }

    /// Sum of the footprints of every live tracked resource. Prunes expired entries.
    pub fn total_footprint(&self) -> usize {
        self.registry.lock().footprint()
    }

    /// Drops registry entries whose resource has been released.
    pub fn purge_expired(&self) -> usize {
        self.registry.lock().purge()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }
}

fn downcast<R: TypedResource>(resource: Arc<dyn Resource>) -> Result<Arc<R>> {
    let kind = resource.kind();
    resource
        .into_any_arc()
        .downcast::<R>()
        .map_err(|_| crate::error::Error::ArgsMismatch {
            resource: kind.name(),
            args: std::any::type_name::<R>(),
        })
}
