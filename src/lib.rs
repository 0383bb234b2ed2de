//! Lain Build Core - manifest compiler and build orchestrator
//!
//! 1. Manifests compile to typed process definitions or fail loudly
//! 2. Structural validation always runs before compilation
//! 3. Prepare images are shared through the registry, newest wins
//! 4. Phase failures are results, collaborator faults are errors

pub mod cache;
pub mod config;
pub mod docker;
pub mod error;
pub mod hashing;
pub mod image;
pub mod manifest;
pub mod pipeline;
pub mod templates;
pub mod validation;
pub mod version;

pub use cache::{CacheError, LeasedResolver, InProcessLease, PrepareIdentity, PrepareResolver, SharedPrepareCache};
pub use config::ClusterConfig;
pub use docker::DockerCli;
pub use error::{ManifestError, Result};
pub use hashing::{canonical_json, compute_build_hash, compute_manifest_hash, prepare_script_hash};
pub use image::{image_name, ImageClient, ImageError, Store};
pub use manifest::proc::{ProcType, ProcessDefinition};
pub use manifest::{AppManifest, ManifestCompiler};
pub use pipeline::{BuildFailure, BuildPipeline, BuildPlan, BuildReport, Phase, PhaseOutcome, PipelineError};
pub use templates::{DockerfileRenderer, InstructionRenderer, TemplateKind};
pub use validation::{SchemaValidator, StructuralValidator, ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use version::{GitVersion, VersionSource};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
