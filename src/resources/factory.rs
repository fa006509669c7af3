// src/resources/factory.rs
//! Loader registry dispatching on `(resource kind, argument tag)`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::{material, mesh, texture, LoadArgs, Resource, ResourceKind, ResourceManager, TypedResource};

type ErasedLoader = Box<dyn Fn(&ResourceManager, &dyn Any) -> Result<Arc<dyn Resource>> + Send + Sync>;

/// Pluggable per-subsystem construction. An unregistered pair is "not found".
#[derive(Default)]
pub struct ResourceFactory {
    loaders: HashMap<(ResourceKind, &'static str), ErasedLoader>,
}

impl ResourceFactory {
    /// Empty factory: every load reports "not found".
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in texture, sampler, mesh and material loaders.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        texture::register_loaders(&mut factory);
        mesh::register_loaders(&mut factory);
        material::register_loaders(&mut factory);
        factory
    }

    /// Registers (or replaces) the loader for `A`.
    pub fn register<A, F>(&mut self, loader: F)
    where
        A: LoadArgs,
        F: Fn(&ResourceManager, &A) -> Result<A::Resource> + Send + Sync + 'static,
    {
        let kind = <A::Resource as TypedResource>::KIND;
        let erased: ErasedLoader = Box::new(move |manager: &ResourceManager, raw: &dyn Any| {
            let args = raw.downcast_ref::<A>().ok_or(Error::ArgsMismatch {
                resource: kind.name(),
                args: A::TAG,
            })?;
            let resource: Arc<dyn Resource> = Arc::new(loader(manager, args)?);
            Ok(resource)
        });
        self.loaders.insert((kind, A::TAG), erased);
    }

    #[inline]
    pub fn supports(&self, kind: ResourceKind, args: &'static str) -> bool {
        self.loaders.contains_key(&(kind, args))
    }

    /// `Ok(None)` when no loader is registered for the pair.
    pub fn load(
        &self,
        manager: &ResourceManager,
        kind: ResourceKind,
        args_tag: &'static str,
        args: &dyn Any,
    ) -> Result<Option<Arc<dyn Resource>>> {
        match self.loaders.get(&(kind, args_tag)) {
            Some(loader) => loader(manager, args).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ResourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self
            .loaders
            .keys()
            .map(|(kind, args)| format!("{}/{}", kind.name(), args))
            .collect();
        pairs.sort();
        f.debug_struct("ResourceFactory").field("loaders", &pairs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{SamplerFromDescription, TextureFromFile};

    #[test]
    fn test_defaults_cover_builtin_pairs() {
        let factory = ResourceFactory::with_defaults();
        assert!(factory.supports(ResourceKind::Texture2D, "TextureFromFile"));
        assert!(factory.supports(ResourceKind::Texture2D, "TextureFromPixels"));
        assert!(factory.supports(ResourceKind::Sampler, "SamplerFromDescription"));
        assert!(factory.supports(ResourceKind::Mesh, "MeshFromVertices"));
        assert!(factory.supports(ResourceKind::Material, "MaterialFromFile"));
        assert!(factory.supports(ResourceKind::Material, "MaterialFromProperties"));
        assert!(factory.supports(ResourceKind::Material, "MaterialInstance"));
        assert!(!factory.supports(ResourceKind::Mesh, "TextureFromFile"));
    }

    #[test]
    fn test_mismatched_raw_args_are_rejected() {
        let factory = ResourceFactory::with_defaults();
        let manager = ResourceManager::new(std::env::temp_dir(), ResourceFactory::new());
        let wrong = SamplerFromDescription::default();
        let err = factory
            .load(&manager, ResourceKind::Texture2D, "TextureFromFile", &wrong)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ArgsMismatch { .. }));

        let right = TextureFromFile::new("missing.png");
        assert!(factory.load(&manager, ResourceKind::Texture2D, "TextureFromFile", &right).is_err());
    }
}
