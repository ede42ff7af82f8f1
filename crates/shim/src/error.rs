//! Error types for shims.

use thiserror::Error;

use graft_core::CoreError;

#[derive(Debug, Error)]
pub enum ShimError {
    /// The framework backing this shim was not compiled in.
    #[error("{0} support is unavailable in this build (enable the matching cargo feature)")]
    FrameworkUnavailable(&'static str),

    /// The wrapped framework reported an error (numerical, device, shape...).
    #[error("{framework} error: {source}")]
    Framework {
        framework: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `b1`/`b2` don't select any update rule the shim knows how to build.
    #[error("Unsupported optimizer settings: b1 = {b1}, b2 = {b2} (b2 without b1 has no matching rule)")]
    UnsupportedOptimizer { b1: f32, b2: f32 },

    #[error("Could not decode shim bytes: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Could not encode shim bytes: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A decoded envelope lacks one of its two fields.
    #[error("Shim bytes are missing the `{0}` field")]
    MissingField(&'static str),

    /// Payload, shape or conversion problem on the orchestrator side.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ShimError {
    pub fn framework(
        framework: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ShimError::Framework {
            framework,
            source: Box::new(source),
        }
    }

    /// Whether this is a gradient/output structure mismatch.
    pub fn is_structure_mismatch(&self) -> bool {
        matches!(self, ShimError::Core(CoreError::StructureMismatch { .. }))
    }
}
