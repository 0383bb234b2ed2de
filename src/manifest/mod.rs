//! Manifest Compiler
//!
//! Turns `lain.yaml` text into an [`AppManifest`]: validated app identity,
//! process definitions (with `service.*` expanded into worker + portal
//! pairs), build/release/test sections and cross-app references.

pub mod paths;
pub mod proc;
pub mod resource;
pub mod sections;
pub mod shorthand;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::config::ClusterConfig;
use crate::error::{ManifestError, Result};
use crate::hashing::compute_manifest_hash;
use crate::validation::{SchemaValidator, StructuralValidator};
use proc::{ProcContext, ProcessDefinition};
use sections::{BuildSpec, ReleaseSpec, TestSpec};
use shorthand::{describe, scalar_text};

pub const RESERVED_APPNAMES: &[&str] = &["service", "resource", "portal"];

/// First segment of every top-level key that declares processes.
pub const PROC_SECTION_KEYWORDS: [&str; 6] = ["worker", "web", "oneshot", "portal", "proc", "service"];

pub fn is_proc_section(key: &str) -> bool {
    let keyword = key.split('.').next().unwrap_or_default();
    PROC_SECTION_KEYWORDS.contains(&keyword)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    App,
    Resource,
}

/// A resource consumed by the app: the services it uses and the remaining
/// parameters, later used as template variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUse {
    pub services: Vec<String>,
    pub context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppManifest {
    pub appname: String,
    pub giturl: Option<String>,
    pub apptype: AppType,
    pub meta_version: Option<String>,
    pub procs: BTreeMap<String, ProcessDefinition>,
    pub build: BuildSpec,
    pub release: ReleaseSpec,
    pub test: TestSpec,
    pub notify: Mapping,
    pub use_services: BTreeMap<String, Vec<String>>,
    pub use_resources: BTreeMap<String, ResourceUse>,
}

impl AppManifest {
    /// Stable digest of the compiled manifest.
    pub fn digest(&self) -> std::result::Result<String, serde_json::Error> {
        compute_manifest_hash(self)
    }

    /// Per-process annotations keyed by process name.
    pub fn annotations(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.procs
                .iter()
                .map(|(name, p)| (name.clone(), p.annotation()))
                .collect(),
        )
    }
}

pub struct ManifestCompiler {
    config: ClusterConfig,
    validator: Box<dyn StructuralValidator>,
}

impl ManifestCompiler {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            validator: Box::new(SchemaValidator::new()),
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn StructuralValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Validate and compile manifest text. Validation always runs first.
    #[instrument(skip(self, text))]
    pub fn compile(
        &self,
        text: &str,
        meta_version: Option<&str>,
        default_image: Option<&str>,
    ) -> Result<AppManifest> {
        let document: Value = serde_yaml::from_str(text)?;
        let result = self.validator.validate(&document);
        if !result.valid {
            return Err(ManifestError::StructuralValidation(result.message()));
        }
        self.compile_document(&document, meta_version, default_image)
    }

    /// Semantic compilation of an already-parsed document, without the
    /// structural pre-pass.
    pub fn compile_document(
        &self,
        document: &Value,
        meta_version: Option<&str>,
        default_image: Option<&str>,
    ) -> Result<AppManifest> {
        let meta = document
            .as_mapping()
            .ok_or_else(|| ManifestError::InvalidDocument(describe(document)))?;

        let appname = match meta.get("appname") {
            None | Some(Value::Null) => return Err(ManifestError::MissingAppname),
            Some(v) => scalar_text(v).ok_or_else(|| ManifestError::InvalidDocument(describe(v)))?,
        };
        if RESERVED_APPNAMES.contains(&appname.as_str()) {
            return Err(ManifestError::ReservedAppname(appname, RESERVED_APPNAMES));
        }

        let apptype = match meta.get("apptype").and_then(Value::as_str) {
            Some("resource") => AppType::Resource,
            _ => AppType::App,
        };

        let ctx = ProcContext {
            appname: &appname,
            meta_version,
            default_image,
            config: &self.config,
        };
        let procs = self.load_procs(meta, &ctx)?;

        let build = match meta.get("build") {
            None | Some(Value::Null) => return Err(ManifestError::MissingSection("build")),
            Some(v) => BuildSpec::load(v)?,
        };
        let release = match meta.get("release") {
            Some(v) => ReleaseSpec::load(v)?,
            None => ReleaseSpec::default(),
        };
        let test = match meta.get("test") {
            Some(v) => TestSpec::load(v)?,
            None => TestSpec::default(),
        };

        let notify = match meta.get("notify") {
            Some(Value::Mapping(m)) => m.clone(),
            _ => Mapping::new(),
        };

        debug!(appname = %appname, procs = procs.len(), "compiled manifest");
        Ok(AppManifest {
            giturl: meta.get("giturl").and_then(scalar_text),
            apptype,
            meta_version: meta_version.map(str::to_string),
            procs,
            build,
            release,
            test,
            notify,
            use_services: load_use_services(meta.get("use_services")),
            use_resources: load_use_resources(meta.get("use_resources"))?,
            appname,
        })
    }

    fn load_procs(&self, meta: &Mapping, ctx: &ProcContext<'_>) -> Result<BTreeMap<String, ProcessDefinition>> {
        let mut procs = BTreeMap::new();
        let mut insert = |p: ProcessDefinition| -> Result<()> {
            if procs.contains_key(&p.name) {
                return Err(ManifestError::DuplicateProcessName(p.name));
            }
            procs.insert(p.name.clone(), p);
            Ok(())
        };

        for (key, body) in meta {
            let Some(key) = key.as_str() else { continue };
            if !is_proc_section(key) {
                continue;
            }
            if key == "service" || key.starts_with("service.") {
                let (worker, portal) = expand_service(key, body, ctx)?;
                insert(worker)?;
                insert(portal)?;
            } else {
                insert(ProcessDefinition::build(key, body, ctx)?)?;
            }
        }
        Ok(procs)
    }
}

/// `service.X` -> worker `X` plus portal `portal-X` serving `X`.
fn expand_service(
    key: &str,
    body: &Value,
    ctx: &ProcContext<'_>,
) -> Result<(ProcessDefinition, ProcessDefinition)> {
    let name = match key.split('.').collect::<Vec<_>>().as_slice() {
        ["service", name] if !name.is_empty() => name.to_string(),
        _ => return Err(ManifestError::malformed(key, "service keyword", key)),
    };

    let mut worker_meta = match body {
        Value::Mapping(m) => m.clone(),
        other => return Err(ManifestError::malformed(key, "service section", describe(other))),
    };
    let mut portal_meta = match worker_meta.remove("portal") {
        Some(Value::Mapping(m)) => m,
        Some(Value::Null) | None => {
            return Err(ManifestError::MissingField {
                section: key.to_string(),
                field: "portal",
            })
        }
        Some(other) => return Err(ManifestError::malformed(key, "portal section", describe(&other))),
    };
    portal_meta.insert("service_name".into(), Value::String(name.clone()));

    let worker = ProcessDefinition::build(&format!("worker.{}", name), &Value::Mapping(worker_meta), ctx)?;
    let portal = ProcessDefinition::build(&format!("portal.portal-{}", name), &Value::Mapping(portal_meta), ctx)?;
    Ok((worker, portal))
}

fn load_use_services(meta: Option<&Value>) -> BTreeMap<String, Vec<String>> {
    let Some(Value::Mapping(meta)) = meta else {
        return BTreeMap::new();
    };
    meta.iter()
        .filter_map(|(app, procs)| {
            let app = scalar_text(app)?;
            let procs = procs
                .as_sequence()
                .map(|items| items.iter().filter_map(scalar_text).collect())
                .unwrap_or_default();
            Some((app, procs))
        })
        .collect()
}

fn load_use_resources(meta: Option<&Value>) -> Result<BTreeMap<String, ResourceUse>> {
    let Some(Value::Mapping(meta)) = meta else {
        return Ok(BTreeMap::new());
    };
    let invalid = || ManifestError::invalid("use_resources", format!("invalid resource definition: {}", describe(&Value::Mapping(meta.clone()))));

    let mut resources = BTreeMap::new();
    for (app, params) in meta {
        let app = scalar_text(app).ok_or_else(invalid)?;
        let Value::Mapping(params) = params else {
            return Err(invalid());
        };
        let mut context = BTreeMap::new();
        let mut services = None;
        for (k, v) in params {
            let k = scalar_text(k).ok_or_else(invalid)?;
            if k == "services" {
                let items = v.as_sequence().ok_or_else(invalid)?;
                services = Some(items.iter().filter_map(scalar_text).collect());
            } else {
                context.insert(k, v.clone());
            }
        }
        resources.insert(
            app,
            ResourceUse {
                services: services.ok_or_else(invalid)?,
                context,
            },
        );
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compiler() -> ManifestCompiler {
        ManifestCompiler::new(ClusterConfig::default().with_registry("registry.lain.local"))
    }

    const BASE: &str = "
appname: hello
build:
  base: golang
  script: [go build -o hello]
";

    fn compile(extra: &str) -> Result<AppManifest> {
        compiler().compile(&format!("{}{}", BASE, extra), Some("1428553798-7142797e"), None)
    }

    #[test]
    fn test_requires_appname() {
        let err = compiler()
            .compile_document(&serde_yaml::from_str("build: {base: a}").unwrap(), None, None)
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingAppname));
    }

    #[test]
    fn test_reserved_appname() {
        let doc = serde_yaml::from_str("appname: portal\nbuild: {base: a}").unwrap();
        let err = compiler().compile_document(&doc, None, None).unwrap_err();
        assert!(matches!(err, ManifestError::ReservedAppname(name, _) if name == "portal"));
    }

    #[test]
    fn test_missing_build() {
        let doc = serde_yaml::from_str("appname: hello").unwrap();
        let err = compiler().compile_document(&doc, None, None).unwrap_err();
        assert_eq!(err.to_string(), "no build section in lain.yaml");
    }

    #[test]
    fn test_structural_failure_reported() {
        let err = compiler().compile("appname: hello\nbuild: {base: a}\n", None, None).unwrap_err();
        assert!(matches!(err, ManifestError::StructuralValidation(_)));
    }

    #[test]
    fn test_service_expansion() {
        let m = compile(
            "
service.echo:
  cmd: ./echo -p 1234
  port: 1234
  num_instances: 3
  portal:
    allow_clients: '**'
    cmd: ./proxy
    port: 4321
",
        )
        .unwrap();
        assert_eq!(m.procs.keys().collect::<Vec<_>>(), vec!["echo", "portal-echo"]);
        let echo = &m.procs["echo"];
        assert_eq!(echo.proc_type, proc::ProcType::Worker);
        assert_eq!(echo.num_instances, 3);
        assert_eq!(echo.port[&1234].port, 1234);
        let portal = &m.procs["portal-echo"];
        assert_eq!(portal.proc_type, proc::ProcType::Portal);
        assert_eq!(portal.service_name, "echo");
        assert_eq!(portal.port[&4321].port, 4321);
    }

    #[test]
    fn test_service_requires_portal() {
        let err = compile("service.echo: {cmd: ./echo}\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingField { field: "portal", .. }));
    }

    #[test]
    fn test_duplicate_after_expansion() {
        let err = compile(
            "
proc.echo: {cmd: ./echo}
service.echo:
  cmd: ./echo
  portal: {cmd: ./proxy}
",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "duplicated proc name echo");
    }

    #[test]
    fn test_use_services_and_resources() {
        let m = compile(
            "
use_services:
  echo-server: [echo1, echo2]
  bark-server: [bark1]
use_resources:
  echo-server:
    memory: 128M
    cpu: 2
    services: [echo1, echo2]
  bark-server:
    services: [bark1]
",
        )
        .unwrap();
        assert_eq!(m.use_services["echo-server"], vec!["echo1", "echo2"]);
        let echo = &m.use_resources["echo-server"];
        assert_eq!(echo.services, vec!["echo1", "echo2"]);
        assert_eq!(echo.context["memory"], Value::from("128M"));
        assert_eq!(echo.context["cpu"], Value::from(2));
        assert!(m.use_resources["bark-server"].context.is_empty());

        let err = compile("use_resources:\n  redis: {memory: 128M}\n").unwrap_err();
        assert!(err.to_string().contains("invalid resource definition"));
    }

    #[test]
    fn test_notify_and_giturl() {
        let m = compile("giturl: http://git.example.com/hello\nnotify: {slack: '#hello'}\n").unwrap();
        assert_eq!(m.giturl.as_deref(), Some("http://git.example.com/hello"));
        assert_eq!(m.notify.get("slack"), Some(&Value::from("#hello")));
        let m = compile("").unwrap();
        assert!(m.notify.is_empty());
        assert_eq!(m.apptype, AppType::App);
    }

    #[test]
    fn test_digest_stable() {
        let a = compile("web: {cmd: hello}\n").unwrap();
        let b = compile("web: {cmd: hello}\n").unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }
}
