//! Build, prepare, release and test sections.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::sync::OnceLock;

use super::shorthand::{describe, scalar_text, string_list};
use crate::error::{ManifestError, Result};

pub const AUTO_PREPARE_VERSION: &str = "0";

/// `( stmt )` so statements can be joined with `&&` safely.
pub fn wrap_script(statements: Vec<String>) -> Vec<String> {
    statements.into_iter().map(|s| format!("( {} )", s)).collect()
}

fn prepare_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("static prepare version pattern"))
}

/// Remove every top-level entry of the working dir except `keep`.
pub fn clean_script(keep: &[String]) -> String {
    let mut filters = String::new();
    for k in keep {
        let escaped = regex::escape(k).replace('\'', r"'\''");
        filters.push_str(&format!(r"| grep -v '\b{}\b' ", escaped));
    }
    format!("( ls -1 {}| xargs rm -rf )", filters)
}

fn script_field(section: &str, body: &Mapping) -> Result<Vec<String>> {
    Ok(wrap_script(string_list(section, "script", body.get("script"))?))
}

fn section_body<'a>(section: &str, value: &'a Value, empty: &'a Mapping) -> Result<&'a Mapping> {
    match value {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(empty),
        other => Err(ManifestError::malformed(section, "section", describe(other))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareSpec {
    pub version: String,
    pub script: Vec<String>,
    pub keep: Vec<String>,
    pub build_arg: Vec<String>,
}

impl PrepareSpec {
    pub fn load(value: &Value) -> Result<Self> {
        let (version, script, keep, build_arg) = match value {
            Value::Sequence(_) => (
                AUTO_PREPARE_VERSION.to_string(),
                string_list("build.prepare", "script", Some(value))?,
                vec![],
                vec![],
            ),
            Value::Mapping(m) => {
                let version = match m.get("version") {
                    None | Some(Value::Null) => AUTO_PREPARE_VERSION.to_string(),
                    Some(v) => scalar_text(v).unwrap_or_else(|| describe(v)).trim().to_string(),
                };
                if !prepare_version_pattern().is_match(&version) {
                    return Err(ManifestError::InvalidPrepareVersion(version));
                }
                (
                    version,
                    string_list("build.prepare", "script", m.get("script"))?,
                    string_list("build.prepare", "keep", m.get("keep"))?,
                    string_list("build.prepare", "build_arg", m.get("build_arg"))?,
                )
            }
            Value::Null => (AUTO_PREPARE_VERSION.to_string(), vec![], vec![], vec![]),
            other => return Err(ManifestError::malformed("build.prepare", "section", describe(other))),
        };

        let mut script = wrap_script(script);
        script.push(clean_script(&keep));
        Ok(Self {
            version,
            script,
            keep,
            build_arg,
        })
    }

    /// Unversioned prepare images are keyed by base image and script content.
    pub fn is_auto(&self) -> bool {
        self.version.is_empty() || self.version == AUTO_PREPARE_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub base: String,
    pub script: Vec<String>,
    pub build_arg: Vec<String>,
    pub prepare: Option<PrepareSpec>,
    /// Build-time volumes; switches build and test to the volume-mounted variant.
    pub volumes: Option<Vec<String>>,
}

impl BuildSpec {
    pub fn load(value: &Value) -> Result<Self> {
        let empty = Mapping::new();
        let body = section_body("build", value, &empty)?;
        let base = match body.get("base") {
            None | Some(Value::Null) => {
                return Err(ManifestError::MissingField {
                    section: "build".to_string(),
                    field: "base",
                })
            }
            Some(v) => scalar_text(v).ok_or_else(|| ManifestError::malformed("build", "base", describe(v)))?,
        };
        let prepare = match body.get("prepare") {
            Some(v) => Some(PrepareSpec::load(v)?),
            None => None,
        };
        let volumes = match body.get("volumes") {
            None | Some(Value::Null) => None,
            v => Some(string_list("build", "volumes", v)?),
        };
        Ok(Self {
            base,
            script: script_field("build", body)?,
            build_arg: string_list("build", "build_arg", body.get("build_arg"))?,
            prepare,
            volumes,
        })
    }

    /// Names of the declared build args, as declared with `ARG`.
    pub fn build_arg_names(&self) -> Vec<String> {
        self.build_arg
            .iter()
            .map(|arg| arg.split('=').next().unwrap_or_default().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyEntry {
    pub src: String,
    pub dest: String,
}

impl CopyEntry {
    pub fn same(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            src: path.clone(),
            dest: path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub script: Vec<String>,
    pub dest_base: String,
    pub copy: Vec<CopyEntry>,
}

impl ReleaseSpec {
    pub fn load(value: &Value) -> Result<Self> {
        let empty = Mapping::new();
        let body = section_body("release", value, &empty)?;
        let dest_base = match body.get("dest_base") {
            None | Some(Value::Null) => String::new(),
            Some(v) => scalar_text(v).ok_or_else(|| ManifestError::malformed("release", "dest_base", describe(v)))?,
        };

        let mut copy = Vec::new();
        if let Some(Value::Sequence(items)) = body.get("copy") {
            for item in items {
                match item {
                    Value::String(path) => copy.push(CopyEntry::same(path.clone())),
                    Value::Mapping(m) => {
                        let field = |name: &str| m.get(name).and_then(scalar_text);
                        match (field("src"), field("dest")) {
                            (Some(src), Some(dest)) => copy.push(CopyEntry { src, dest }),
                            (Some(src), None) => copy.push(CopyEntry::same(src)),
                            _ => return Err(ManifestError::malformed("release", "copy", describe(item))),
                        }
                    }
                    other => return Err(ManifestError::malformed("release", "copy", describe(other))),
                }
            }
        }

        Ok(Self {
            script: script_field("release", body)?,
            dest_base,
            copy,
        })
    }

    /// No script and no destination base: the build image is retagged.
    pub fn is_retag_only(&self) -> bool {
        self.script.is_empty() && self.dest_base.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub script: Vec<String>,
}

impl TestSpec {
    pub fn load(value: &Value) -> Result<Self> {
        let empty = Mapping::new();
        let body = section_body("test", value, &empty)?;
        Ok(Self {
            script: script_field("test", body)?,
        })
    }
}
