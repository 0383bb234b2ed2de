//! App-root based path resolution for volumes, secret files and cloud dirs.

use crate::config::{ClusterConfig, LAIN_ROOT};
use crate::error::{ManifestError, Result};

/// Join `path` onto `base` (an absolute `path` replaces it) and collapse
/// `.`/`..` segments. `..` never climbs above `/`.
pub fn resolve_path(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Paths a persistent volume may never resolve to.
pub fn reserved_volumes(config: &ClusterConfig) -> Vec<String> {
    vec![
        "/".to_string(),
        LAIN_ROOT.to_string(),
        resolve_path("/", &config.app_root),
    ]
}

/// Resolve a volume path against the app root and reject reserved targets.
pub fn resolve_volume(section: &str, path: &str, config: &ClusterConfig) -> Result<String> {
    let resolved = resolve_path(&config.app_root, path);
    let reserved = reserved_volumes(config);
    if reserved.contains(&resolved) {
        return Err(ManifestError::InvalidVolume {
            section: section.to_string(),
            path: path.to_string(),
            reserved,
        });
    }
    Ok(resolved)
}
