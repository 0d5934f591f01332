//! Built-in artifact stores for the Scriptor orchestration engine.
//!
//! # Main types
//!
//! - [`InMemoryArtifactStore`] — Process-local store for tests and short-lived runs.
//! - [`FileArtifactStore`] — One content file plus a JSON metadata sidecar per artifact.

/// In-memory artifact store.
pub mod artifact_store;
/// Filesystem-backed artifact store.
pub mod file_store;

pub use artifact_store::InMemoryArtifactStore;
pub use file_store::FileArtifactStore;
