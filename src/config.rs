//! Cluster Configuration
//!
//! Registry and domain defaults are passed explicitly to the compiler and the
//! cache resolver. Nothing in the crate reads process-wide settings.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_DOMAIN: &str = "lain.local";
pub const DOCKER_APP_ROOT: &str = "/lain/app";
pub const LAIN_ROOT: &str = "/lain";
pub const LOG_VOLUME: &str = "/lain/logs";

pub const GLOBAL_CONFIG_FILE: &str = "/etc/lain/lain.conf.yaml";
pub const USER_CONFIG_DIR: &str = ".lain";
pub const USER_GLOBAL_CONFIG_FILE: &str = "global.conf.yaml";
pub const USER_CONFIG_FILE: &str = "lain.conf.yaml";
pub const REGISTRY_ENV: &str = "LAIN_DOCKER_REGISTRY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Private registry host images are pushed to and pulled from.
    #[serde(default)]
    pub registry: Option<String>,
    /// Cluster domains used for default web mountpoints.
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
    #[serde(default = "default_app_root")]
    pub app_root: String,
    /// Degrade malformed `cmd`/`entrypoint` values to an empty command
    /// instead of rejecting the manifest.
    #[serde(default)]
    pub lenient_commands: bool,
}

fn default_domains() -> Vec<String> {
    vec![DEFAULT_DOMAIN.to_string()]
}

fn default_app_root() -> String {
    DOCKER_APP_ROOT.to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            registry: None,
            domains: default_domains(),
            app_root: default_app_root(),
            lenient_commands: false,
        }
    }
}

impl ClusterConfig {
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Standard layered lookup: global file, then the user's global and
    /// per-user files under `~/.lain`.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(GLOBAL_CONFIG_FILE)];
        if let Some(home) = dirs::home_dir() {
            let dir = home.join(USER_CONFIG_DIR);
            paths.push(dir.join(USER_GLOBAL_CONFIG_FILE));
            paths.push(dir.join(USER_CONFIG_FILE));
        }
        paths
    }

    /// Merge config files in order; later files override earlier keys.
    /// Missing or unparsable files are skipped.
    pub fn load(paths: &[PathBuf]) -> Self {
        let mut merged = serde_yaml::Mapping::new();
        for path in paths {
            if let Some(Value::Mapping(layer)) = read_layer(path) {
                for (k, v) in layer {
                    merged.insert(k, v);
                }
            }
        }

        let mut config = Self::from_layer(&merged);
        if let Ok(registry) = std::env::var(REGISTRY_ENV) {
            if !registry.is_empty() {
                config.registry = Some(registry);
            }
        }
        config
    }

    fn from_layer(layer: &serde_yaml::Mapping) -> Self {
        let mut config = Self::default();
        if let Some(Value::String(registry)) = layer.get("private_docker_registry") {
            config.registry = Some(registry.clone());
        }
        if let Some(Value::String(domain)) = layer.get("domain") {
            config.domains = vec![domain.clone()];
        }
        if let Some(Value::Sequence(extra)) = layer.get("extra_domains") {
            config
                .domains
                .extend(extra.iter().filter_map(|d| d.as_str().map(str::to_string)));
        }
        if let Some(Value::Bool(lenient)) = layer.get("lenient_commands") {
            config.lenient_commands = *lenient;
        }
        config
    }
}

fn read_layer(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("skipping config {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.domains, vec!["lain.local"]);
        assert_eq!(config.app_root, "/lain/app");
        assert!(config.registry.is_none());
        assert!(!config.lenient_commands);
    }

    #[test]
    fn test_later_layers_override() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.yaml");
        let user = dir.path().join("user.yaml");
        writeln!(
            fs::File::create(&global).unwrap(),
            "private_docker_registry: registry.a.org\ndomain: a.org"
        )
        .unwrap();
        writeln!(
            fs::File::create(&user).unwrap(),
            "domain: b.org\nextra_domains: [c.org]"
        )
        .unwrap();

        let config = ClusterConfig::from_layer(&{
            let mut merged = serde_yaml::Mapping::new();
            for p in [&global, &user] {
                if let Some(Value::Mapping(m)) = read_layer(p) {
                    merged.extend(m);
                }
            }
            merged
        });
        assert_eq!(config.registry.as_deref(), Some("registry.a.org"));
        assert_eq!(config.domains, vec!["b.org", "c.org"]);
    }

    #[test]
    fn test_missing_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let config = ClusterConfig::from_layer(
            &read_layer(&missing)
                .and_then(|v| v.as_mapping().cloned())
                .unwrap_or_default(),
        );
        assert_eq!(config, ClusterConfig::default());
    }
}
