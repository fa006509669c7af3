// src/error.rs
//! Error handling for the entire crate.
//!
//! - Enum discriminant per failure family, allocations only on error paths.
//! - Context chaining via [`Error::context`] and the [`crate::context`] extension traits.
//! - "Not found" in loader dispatch is never an error: it is `Ok(None)`.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type. Send + Sync + 'static so it can cross loader threads.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O errors (asset and config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Texture decoding failures.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// glTF parsing or buffer resolution failures.
    #[error("glTF error: {0}")]
    Gltf(#[from] gltf::Error),

    /// Config and material file (de)serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A file the caller asked for does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Device, adapter or swapchain failure.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// A surface could not be allocated. Fatal for pooled postprocess targets.
    #[error("surface allocation failed ({width}x{height} {format}): {reason}")]
    Allocation {
        width: u32,
        height: u32,
        format: String,
        reason: String,
    },

    /// A draw was submitted with the wrong inputs or targets for its pass.
    #[error("invalid draw for {pass} pass: {reason}")]
    InvalidDraw { pass: &'static str, reason: String },

    /// A loader received arguments of a type it was not registered for.
    #[error("loader for {resource}/{args} received mismatched arguments")]
    ArgsMismatch {
        resource: &'static str,
        args: &'static str,
    },

    /// A scene node handle is stale or was never issued.
    #[error("scene node {0} does not exist")]
    NodeNotFound(String),

    /// A node lacks a component the operation depends on.
    #[error("node {node} has no {component} component")]
    MissingComponent {
        node: String,
        component: &'static str,
    },

    /// Components are keyed by type, one per node.
    #[error("node {node} already has a {component} component")]
    DuplicateComponent {
        node: String,
        component: &'static str,
    },

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Add context to any error (chainable).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Quick static message.
    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn gpu<S: fmt::Display>(err: S) -> Self {
        Self::Gpu(err.to_string())
    }

    /// Strips context layers and returns the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self.root(), Error::Io(_) | Error::FileNotFound(_))
    }

    #[inline]
    pub fn is_allocation(&self) -> bool {
        matches!(self.root(), Error::Allocation { .. })
    }

    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self.root(), Error::Custom(_))
    }
}

/// Convenient `Result` alias: use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_keeps_root() {
        let err = Error::FileNotFound(PathBuf::from("missing.png"))
            .context("loading albedo")
            .context("binding material");
        assert!(err.is_io());
        assert!(!err.is_allocation());
        let text = err.to_string();
        assert!(text.starts_with("binding material: loading albedo"));
        assert!(text.contains("missing.png"));
    }

    #[test]
    fn test_allocation_display() {
        let err = Error::Allocation {
            width: 64,
            height: 32,
            format: "Rgba16Float".into(),
            reason: "out of memory".into(),
        };
        assert!(err.is_allocation());
        assert_eq!(
            err.to_string(),
            "surface allocation failed (64x32 Rgba16Float): out of memory"
        );
    }
}
