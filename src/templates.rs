//! Build Instruction Templates
//!
//! Every phase renders a Dockerfile from one of three templates and a
//! normalized parameter set. Templates use the same `{{ var }}` placeholders
//! as resource manifests; custom templates can be loaded from a directory.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::manifest::resource::render_text;

pub const BUILD_TEMPLATE: &str = "\
FROM {{ base }}
{{ args }}
WORKDIR {{ workdir }}
{{ copy }}
{{ run }}
";

pub const RELEASE_TEMPLATE: &str = "\
FROM {{ base }}
WORKDIR {{ workdir }}
{{ copy }}
";

pub const META_TEMPLATE: &str = "\
FROM {{ base }}
{{ labels }}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// prepare, build and test
    Build,
    Release,
    Meta,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 3] = [Self::Build, Self::Release, Self::Meta];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Build => "build.dockerfile",
            Self::Release => "release.dockerfile",
            Self::Meta => "meta.dockerfile",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Self::Build => BUILD_TEMPLATE,
            Self::Release => RELEASE_TEMPLATE,
            Self::Meta => META_TEMPLATE,
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Release => "release",
            Self::Meta => "meta",
        })
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot render {kind} template: {reason}")]
    Render { kind: TemplateKind, reason: String },

    #[error("cannot read templates: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized parameters shared by all templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionParams {
    pub base: String,
    pub workdir: String,
    pub copy_list: Vec<String>,
    pub scripts: Vec<String>,
    /// Build arg names declared with `ARG`.
    pub build_args: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

pub trait InstructionRenderer {
    fn render(&self, kind: TemplateKind, params: &InstructionParams) -> Result<String, TemplateError>;
}

fn dockerfile_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Template variables derived from the parameters.
fn template_context(kind: TemplateKind, params: &InstructionParams) -> BTreeMap<String, Value> {
    let copy_dest = match kind {
        TemplateKind::Release => "/".to_string(),
        _ => params.workdir.clone(),
    };
    let copy = params
        .copy_list
        .iter()
        .map(|src| format!("COPY {} {}", src, copy_dest))
        .collect::<Vec<_>>()
        .join("\n");
    let run = if params.scripts.is_empty() {
        String::new()
    } else {
        format!("RUN {}", params.scripts.join(" && "))
    };
    let args = params
        .build_args
        .iter()
        .map(|a| format!("ARG {}", a))
        .collect::<Vec<_>>()
        .join("\n");
    let labels = params
        .labels
        .iter()
        .map(|(k, v)| format!("LABEL {}={}", k, dockerfile_quote(v)))
        .collect::<Vec<_>>()
        .join("\n");

    [
        ("base", params.base.clone()),
        ("workdir", params.workdir.clone()),
        ("copy", copy),
        ("run", run),
        ("args", args),
        ("labels", labels),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Value::String(v)))
    .collect()
}

/// Renders Dockerfiles from the built-in templates or directory overrides.
pub struct DockerfileRenderer {
    templates: HashMap<TemplateKind, String>,
}

impl DockerfileRenderer {
    pub fn new() -> Self {
        Self {
            templates: TemplateKind::ALL
                .iter()
                .map(|k| (*k, k.builtin().to_string()))
                .collect(),
        }
    }

    /// Built-in templates, overridden by any `{kind}.dockerfile` in `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, TemplateError> {
        let mut renderer = Self::new();
        if dir.exists() {
            for kind in TemplateKind::ALL {
                let path = dir.join(kind.file_name());
                if path.is_file() {
                    debug!("using {} template {}", kind, path.display());
                    renderer.register(kind, fs::read_to_string(&path)?);
                }
            }
        }
        Ok(renderer)
    }

    pub fn register(&mut self, kind: TemplateKind, template: String) {
        self.templates.insert(kind, template);
    }

    pub fn get(&self, kind: TemplateKind) -> &str {
        self.templates
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.builtin())
    }
}

impl Default for DockerfileRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionRenderer for DockerfileRenderer {
    fn render(&self, kind: TemplateKind, params: &InstructionParams) -> Result<String, TemplateError> {
        let rendered = render_text(self.get(kind), &template_context(kind, params)).map_err(|e| {
            TemplateError::Render {
                kind,
                reason: e.to_string(),
            }
        })?;
        let mut lines: Vec<&str> = rendered.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Err(TemplateError::Render {
                kind,
                reason: "empty instructions".to_string(),
            });
        }
        lines.push("");
        Ok(lines.join("\n"))
    }
}
