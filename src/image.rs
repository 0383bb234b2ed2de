//! Image naming and the image builder / registry client seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::manifest::sections::CopyEntry;

/// Length of a short content id, without the `sha256:` prefix.
pub const SHORT_ID_LEN: usize = 12;

/// `{registry}/{appname}:{phase}-{meta_version}`; registry and version are
/// left out when absent.
pub fn image_name(appname: &str, phase: &str, meta_version: Option<&str>, registry: Option<&str>) -> String {
    let mut name = format!("{}:{}", appname, phase);
    if let Some(version) = meta_version {
        name = format!("{}-{}", name, version);
    }
    match registry {
        Some(registry) => format!("{}/{}", registry, name),
        None => name,
    }
}

/// `registry.lain.local/hello:build-123` -> `build`
pub fn image_phase(name: &str) -> Option<&str> {
    let (_, tag) = name.rsplit_once(':')?;
    tag.split('-').next()
}

/// `sha256:0123456789abcdef...` -> `0123456789ab`
pub fn short_id(id: &str) -> String {
    id.trim_start_matches("sha256:").chars().take(SHORT_ID_LEN).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Store {
    Local,
    Remote,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("docker {command} failed with status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("failed to run docker: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry request to {url} failed: {reason}")]
    Registry { url: String, reason: String },

    #[error("image {0} not found")]
    NotFound(String),

    #[error("invalid build arg {0}, expected KEY=VALUE")]
    InvalidBuildArg(String),

    #[error("{} already exists in the build context", .0.display())]
    ContextOccupied(PathBuf),
}

/// One image build from rendered instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub name: String,
    pub context: PathBuf,
    /// Rendered Dockerfile.
    pub instructions: String,
    pub build_args: Vec<String>,
    /// Paths appended to the build context's ignore list.
    pub ignore: Vec<String>,
    pub use_cache: bool,
}

/// Run `script` in a container of `base` with the source and `volumes`
/// mounted, then commit the container as `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBuildRequest {
    pub name: String,
    pub base: String,
    pub context: PathBuf,
    pub volumes: Vec<String>,
    pub script: Vec<String>,
}

/// Extract files from an image into a host staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub image: String,
    pub copies: Vec<CopyEntry>,
    /// Staging directory; each entry lands at `dest` joined under it.
    pub dest: PathBuf,
    pub context: PathBuf,
    /// Build-time volumes whose content lives outside the image.
    pub volumes: Vec<String>,
}

/// Image builder and registry client used by the cache resolver and the
/// build orchestrator.
pub trait ImageClient {
    /// Whether the image is present in the local store.
    fn exists(&self, name: &str) -> bool;
    fn pull(&self, name: &str) -> Result<(), ImageError>;
    fn push(&self, name: &str) -> Result<(), ImageError>;
    fn tag(&self, src: &str, dest: &str) -> Result<(), ImageError>;
    /// Returns the built image name.
    fn build(&self, request: &BuildRequest) -> Result<String, ImageError>;
    fn build_with_volumes(&self, request: &VolumeBuildRequest) -> Result<String, ImageError>;
    fn copy_to_host(&self, request: &CopyRequest) -> Result<(), ImageError>;
    fn remove_image(&self, name: &str) -> Result<(), ImageError>;
    /// Tags of `{registry}/{appname}` in the given store.
    fn list_tags(&self, store: Store, registry: &str, appname: &str) -> Result<Vec<String>, ImageError>;
    /// Full content id (`sha256:...`) of a local image.
    fn content_id(&self, name: &str) -> Result<String, ImageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name() {
        assert_eq!(
            image_name("hello", "build", Some("123-abc"), Some("registry.lain.local")),
            "registry.lain.local/hello:build-123-abc"
        );
        assert_eq!(image_name("hello", "meta", None, None), "hello:meta");
    }

    #[test]
    fn test_image_phase() {
        assert_eq!(image_phase("registry.lain.local/hello:release-123-abc"), Some("release"));
        assert_eq!(image_phase("hello"), None);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
