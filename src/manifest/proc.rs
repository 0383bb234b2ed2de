//! Process Definition Builder
//!
//! Turns one process section (`web`, `web.admin`, `proc.mailer`,
//! `portal.portal-x`, ...) plus the app's global context into a canonical
//! [`ProcessDefinition`], applying the type-specific rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use super::paths::{resolve_path, resolve_volume};
use super::shorthand::{
    describe, load_env, load_filters, load_labels, load_port, load_ports, scalar_text, string_list,
    to_exec_form, PortMapping, PortSpec, DEFAULT_WEB_PORT,
};
use crate::config::{ClusterConfig, LOG_VOLUME};
use crate::error::{ManifestError, Result};
use crate::image::image_name;

pub const MIN_SETUP_TIME: i64 = 0;
pub const MAX_SETUP_TIME: i64 = 120;
pub const MIN_KILL_TIMEOUT: i64 = 10;
pub const MAX_KILL_TIMEOUT: i64 = 60;
pub const DEFAULT_MEMORY: &str = "32m";
pub const DEFAULT_ALLOW_CLIENTS: &str = "**";
pub const DEFAULT_SYSTEM_VOLUMES: [&str; 2] = [
    "/data/lain/entrypoint:/lain/entrypoint:ro",
    "/etc/localtime:/etc/localtime:ro",
];

/// Fields a scale-only patch copies between two definitions.
pub const SIMPLE_SCALE_KEYWORDS: [&str; 3] = ["num_instances", "cpu", "memory"];

pub fn is_simple_scale_keyword(keyword: &str) -> bool {
    SIMPLE_SCALE_KEYWORDS.contains(&keyword)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcType {
    Worker,
    Web,
    Oneshot,
    Portal,
}

impl ProcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Web => "web",
            Self::Oneshot => "oneshot",
            Self::Portal => "portal",
        }
    }
}

impl FromStr for ProcType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "web" => Ok(Self::Web),
            "oneshot" => Ok(Self::Oneshot),
            "portal" => Ok(Self::Portal),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ProcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Increment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub procname: String,
    pub volume: String,
    pub schedule: String,
    pub expire: String,
    pub mode: BackupMode,
    pub pre_run: String,
    pub post_run: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudVolumeKind {
    Multi,
    Single,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudVolumes {
    pub kind: CloudVolumeKind,
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckOptions {
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub retries: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHealthcheck {
    pub cmd: String,
    #[serde(default)]
    pub options: Option<HealthcheckOptions>,
}

/// Global context a process section is compiled against.
#[derive(Debug, Clone, Copy)]
pub struct ProcContext<'a> {
    pub appname: &'a str,
    pub meta_version: Option<&'a str>,
    pub default_image: Option<&'a str>,
    pub config: &'a ClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub proc_type: ProcType,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub num_instances: u32,
    pub cpu: u32,
    pub memory: String,
    pub port: BTreeMap<u16, PortSpec>,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
    pub filters: Vec<String>,
    pub mountpoint: Vec<String>,
    pub https_only: bool,
    pub healthcheck: String,
    pub container_healthcheck: Option<ContainerHealthcheck>,
    pub user: String,
    pub working_dir: String,
    pub dns_search: Vec<String>,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    pub system_volumes: Vec<String>,
    pub cloud_volumes: Option<CloudVolumes>,
    pub secret_files: Vec<String>,
    pub secret_files_bypass: bool,
    pub service_name: String,
    pub allow_clients: String,
    pub backup: Vec<BackupJob>,
    pub logs: Vec<String>,
    pub stateful: bool,
    pub setup_time: i64,
    pub kill_timeout: i64,
}

/// Partial update applied to an already-built definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcPatch {
    #[serde(default)]
    pub entrypoint: Option<Value>,
    #[serde(default)]
    pub cmd: Option<Value>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub num_instances: Option<u32>,
    #[serde(default)]
    pub port: Option<Value>,
}

/// `a.b.c` -> `c.b.a`
pub fn app_domain(appname: &str) -> String {
    appname.split('.').rev().collect::<Vec<_>>().join(".")
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[1-9][0-9]*[mMgG]$").expect("static memory pattern"))
}

pub fn is_valid_memory(memory: &str) -> bool {
    memory_pattern().is_match(memory)
}

fn check_memory(section: &str, memory: String) -> Result<String> {
    if is_valid_memory(&memory) {
        Ok(memory)
    } else {
        Err(ManifestError::malformed(section, "memory", memory))
    }
}

fn restrict_value(v: i64, min: i64, max: i64) -> i64 {
    v.clamp(min, max)
}

/// Split a section key into its process type and name. A two-part key is
/// authoritative for the type except under `proc.`, which reads `type:`.
pub fn parse_section_key(key: &str, body: &Mapping) -> Result<(ProcType, String)> {
    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        [kind] => kind
            .parse()
            .map(|t| (t, kind.to_string()))
            .map_err(|_| ManifestError::malformed(key, "proc keyword", key)),
        [kind, name] if !name.is_empty() => {
            if let Ok(t) = kind.parse() {
                return Ok((t, name.to_string()));
            }
            if *kind != "proc" {
                return Err(ManifestError::malformed(key, "proc keyword", key));
            }
            let declared = match body.get("type") {
                None | Some(Value::Null) => "worker".to_string(),
                Some(v) => describe(v),
            };
            declared
                .parse()
                .map(|t| (t, name.to_string()))
                .map_err(|_| ManifestError::malformed(key, "proc type", declared))
        }
        _ => Err(ManifestError::malformed(key, "proc keyword", key)),
    }
}

struct Section<'a> {
    key: &'a str,
    body: &'a Mapping,
}

impl<'a> Section<'a> {
    fn get(&self, field: &str) -> Option<&'a Value> {
        match self.body.get(field) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }
    }

    fn string(&self, field: &'static str, default: &str) -> Result<String> {
        match self.get(field) {
            None => Ok(default.to_string()),
            Some(v) => scalar_text(v).ok_or_else(|| ManifestError::malformed(self.key, field, describe(v))),
        }
    }

    fn int(&self, field: &'static str, default: i64) -> Result<i64> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| ManifestError::malformed(self.key, field, n)),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| ManifestError::malformed(self.key, field, s)),
            Some(v) => Err(ManifestError::malformed(self.key, field, describe(v))),
        }
    }

    fn count(&self, field: &'static str, default: u32) -> Result<u32> {
        let n = self.int(field, i64::from(default))?;
        u32::try_from(n).map_err(|_| ManifestError::malformed(self.key, field, n))
    }

    fn flag(&self, field: &'static str) -> Result<bool> {
        match self.get(field) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(v) => Err(ManifestError::malformed(self.key, field, describe(v))),
        }
    }
}

impl ProcessDefinition {
    /// Compile one process section.
    pub fn build(key: &str, body: &Value, ctx: &ProcContext<'_>) -> Result<Self> {
        let empty = Mapping::new();
        let body = match body {
            Value::Mapping(m) => m,
            Value::Null => &empty,
            other => return Err(ManifestError::malformed(key, "proc section", describe(other))),
        };
        let section = Section { key, body };
        let config = ctx.config;

        let (proc_type, name) = parse_section_key(key, body)?;

        let default_image = match ctx.default_image {
            Some(image) => image.to_string(),
            None => image_name(ctx.appname, "release", ctx.meta_version, config.registry.as_deref()),
        };
        let image = section.string("image", &default_image)?;

        let entrypoint = to_exec_form(key, "entrypoint", body.get("entrypoint"), config.lenient_commands)?;
        let cmd = to_exec_form(key, "cmd", body.get("cmd"), config.lenient_commands)?;

        let user = section.string("user", "")?;
        let working_dir = match section.get("workdir") {
            Some(_) => section.string("workdir", "")?,
            None => section.string("working_dir", "")?,
        };

        let app_dns_search = format!("{}.lain", app_domain(ctx.appname));
        let mut dns_search = string_list(key, "dns_search", section.get("dns_search"))?;
        if !dns_search.contains(&app_dns_search) {
            dns_search.push(app_dns_search);
        }

        let cpu = section.count("cpu", 0)?;
        let memory = check_memory(key, section.string("memory", DEFAULT_MEMORY)?)?;
        let num_instances = section.count("num_instances", 1)?;

        let port = match section.get("port") {
            Some(meta) => load_port(key, meta)?,
            None if proc_type == ProcType::Web => {
                BTreeMap::from([(DEFAULT_WEB_PORT, PortSpec::tcp(DEFAULT_WEB_PORT))])
            }
            None => BTreeMap::new(),
        };
        let ports = match section.get("ports") {
            Some(meta) => load_ports(key, meta)?,
            None => vec![],
        };
        let labels = match section.get("labels") {
            Some(meta) => load_labels(key, meta)?,
            None => BTreeMap::new(),
        };
        let filters = match section.get("filters") {
            Some(meta) => load_filters(key, meta)?,
            None => vec![],
        };

        let stateful = section.flag("stateful")?;
        let setup_time = restrict_value(section.int("setup_time", 0)?, MIN_SETUP_TIME, MAX_SETUP_TIME);
        let kill_timeout = restrict_value(
            section.int("kill_timeout", MIN_KILL_TIMEOUT)?,
            MIN_KILL_TIMEOUT,
            MAX_KILL_TIMEOUT,
        );

        let (mountpoint, https_only, healthcheck) = if proc_type == ProcType::Web {
            let defaults = default_mountpoints(ctx.appname, &config.domains);
            let mountpoint = resolve_mountpoints(key, &name, section.get("mountpoint"), &defaults)?;
            (
                mountpoint,
                section.flag("https_only")?,
                section.string("healthcheck", "")?,
            )
        } else {
            (vec![], false, String::new())
        };

        let container_healthcheck = match section.get("container_healthcheck") {
            Some(v) => Some(
                serde_yaml::from_value(v.clone())
                    .map_err(|_| ManifestError::malformed(key, "container_healthcheck", describe(v)))?,
            ),
            None => None,
        };

        let env = load_env(key, section.get("env"))?;

        let procname = format!("{}.{}.{}", ctx.appname, proc_type, name);
        let volume_meta = section.get("persistent_dirs").or_else(|| section.get("volumes"));
        let (mut volumes, backup) = load_volumes(key, &procname, volume_meta, config)?;

        let logs = load_logs(key, section.get("logs"))?;
        if !logs.is_empty() && !volumes.iter().any(|v| v == LOG_VOLUME) {
            volumes.push(LOG_VOLUME.to_string());
        }

        let cloud_volumes = load_cloud_volumes(key, section.get("cloud_volumes"), config)?;

        let secret_files = string_list(key, "secret_files", section.get("secret_files"))?
            .iter()
            .map(|f| resolve_path(&config.app_root, f))
            .collect();
        let secret_files_bypass = section.flag("secret_files_bypass")?;

        let (service_name, allow_clients) = if proc_type == ProcType::Portal {
            let service_name = section
                .get("service_name")
                .and_then(scalar_text)
                .ok_or_else(|| ManifestError::MissingServiceName {
                    section: key.to_string(),
                })?;
            (service_name, section.string("allow_clients", DEFAULT_ALLOW_CLIENTS)?)
        } else {
            (String::new(), String::new())
        };

        Ok(Self {
            name,
            proc_type,
            image,
            entrypoint,
            cmd,
            num_instances,
            cpu,
            memory,
            port,
            ports,
            labels,
            filters,
            mountpoint,
            https_only,
            healthcheck,
            container_healthcheck,
            user,
            working_dir,
            dns_search,
            env,
            volumes,
            system_volumes: DEFAULT_SYSTEM_VOLUMES.iter().map(|v| v.to_string()).collect(),
            cloud_volumes,
            secret_files,
            secret_files_bypass,
            service_name,
            allow_clients,
            backup,
            logs,
            stateful,
            setup_time,
            kill_timeout,
        })
    }

    /// Overwrite command, resources and port from a partial payload. Every
    /// other field keeps its value. Nothing changes if any field is invalid.
    pub fn patch(&mut self, patch: &ProcPatch) -> Result<()> {
        let section = self.name.clone();
        let entrypoint = match &patch.entrypoint {
            Some(v) => Some(to_exec_form(&section, "entrypoint", Some(v), false)?),
            None => None,
        };
        let cmd = match &patch.cmd {
            Some(v) => Some(to_exec_form(&section, "cmd", Some(v), false)?),
            None => None,
        };
        let memory = match &patch.memory {
            Some(m) => Some(check_memory(&section, m.clone())?),
            None => None,
        };
        let port = match &patch.port {
            Some(v) if !v.is_null() => Some(load_port(&section, v)?),
            _ => None,
        };

        if let Some(entrypoint) = entrypoint {
            self.entrypoint = entrypoint;
        }
        if let Some(cmd) = cmd {
            self.cmd = cmd;
        }
        if let Some(memory) = memory {
            self.memory = memory;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(cpu) = patch.cpu {
            self.cpu = cpu;
        }
        if let Some(num_instances) = patch.num_instances {
            self.num_instances = num_instances;
        }
        Ok(())
    }

    /// Copy only the scale fields from another build of the same process.
    pub fn patch_scale(&mut self, other: &ProcessDefinition) {
        self.num_instances = other.num_instances;
        self.cpu = other.cpu;
        self.memory = other.memory.clone();
    }

    /// Metadata shipped with the meta image; empty members are left out.
    pub fn annotation(&self) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        if self.proc_type == ProcType::Web {
            data.insert("mountpoint".into(), serde_json::json!(self.mountpoint));
            data.insert("https_only".into(), serde_json::json!(self.https_only));
        }
        if !self.service_name.is_empty() {
            data.insert("service_name".into(), serde_json::json!(self.service_name));
        }
        if !self.backup.is_empty() {
            data.insert("backup".into(), serde_json::json!(self.backup));
        }
        if !self.healthcheck.is_empty() {
            data.insert("healthcheck".into(), serde_json::json!(self.healthcheck));
        }
        if !self.logs.is_empty() {
            data.insert("logs".into(), serde_json::json!(self.logs));
        }
        if !self.ports.is_empty() {
            data.insert("ports".into(), serde_json::json!(self.ports));
        }
        serde_json::Value::Object(data)
    }
}

/// `{appDomain}.{domain}` for every cluster domain, then `{appDomain}.lain`.
pub fn default_mountpoints(appname: &str, domains: &[String]) -> Vec<String> {
    let domain = app_domain(appname);
    domains
        .iter()
        .map(|d| format!("{}.{}", domain, d))
        .chain(std::iter::once(format!("{}.lain", domain)))
        .collect()
}

/// Merge declared mountpoints with the defaults and expand `/suffix`
/// entries onto every default base.
pub fn resolve_mountpoints(
    key: &str,
    name: &str,
    declared: Option<&Value>,
    defaults: &[String],
) -> Result<Vec<String>> {
    let declared: Vec<String> = match declared {
        Some(Value::Sequence(items)) => items.iter().filter_map(scalar_text).collect(),
        _ => vec![],
    };

    let mut merged = declared;
    if name == "web" {
        for d in defaults {
            if !merged.contains(d) {
                merged.push(d.clone());
            }
        }
    } else if merged.is_empty() {
        return Err(ManifestError::MissingMountpoint {
            section: key.to_string(),
        });
    }

    let (suffixes, mut mountpoints): (Vec<String>, Vec<String>) =
        merged.into_iter().partition(|mp| mp.starts_with('/'));
    for suffix in suffixes {
        for base in defaults {
            if suffix == "/" {
                mountpoints.push(base.clone());
            } else {
                mountpoints.push(format!("{}{}", base, suffix));
            }
        }
    }

    let mut seen = Vec::with_capacity(mountpoints.len());
    for mp in mountpoints {
        if !seen.contains(&mp) {
            seen.push(mp);
        }
    }
    Ok(seen)
}

fn load_volumes(
    key: &str,
    procname: &str,
    meta: Option<&Value>,
    config: &ClusterConfig,
) -> Result<(Vec<String>, Vec<BackupJob>)> {
    let items = match meta {
        None => return Ok((vec![], vec![])),
        Some(Value::Sequence(items)) => items,
        Some(other) => return Err(ManifestError::malformed(key, "volumes", describe(other))),
    };

    let mut volumes = Vec::new();
    let mut backup = Vec::new();
    for item in items {
        match item {
            Value::String(path) => volumes.push(resolve_volume(key, path, config)?),
            Value::Mapping(m) if m.is_empty() => {}
            Value::Mapping(m) if m.len() == 1 => {
                for (path, policies) in m {
                    let path = scalar_text(path)
                        .ok_or_else(|| ManifestError::malformed(key, "volumes", describe(item)))?;
                    if let Value::Mapping(policies) = policies {
                        backup.extend(load_backup_jobs(key, procname, &path, policies)?);
                    }
                    volumes.push(resolve_volume(key, &path, config)?);
                }
            }
            other => return Err(ManifestError::malformed(key, "volumes", describe(other))),
        }
    }
    Ok((volumes, backup))
}

fn load_backup_jobs(key: &str, procname: &str, volume: &str, policies: &Mapping) -> Result<Vec<BackupJob>> {
    let mut jobs = Vec::new();
    for (attr, setting) in policies {
        let mode = match attr.as_str() {
            Some("backup_full") => BackupMode::Full,
            Some("backup_increment") => BackupMode::Increment,
            _ => continue,
        };
        let setting = match setting {
            Value::Mapping(m) => m,
            other => return Err(ManifestError::malformed(key, "backup policy", describe(other))),
        };
        let field = |name: &str| setting.get(name).and_then(scalar_text).unwrap_or_default();
        let schedule = field("schedule");
        if schedule.is_empty() {
            continue;
        }
        jobs.push(BackupJob {
            procname: procname.to_string(),
            volume: volume.to_string(),
            schedule,
            expire: field("expire"),
            mode,
            pre_run: field("pre_run"),
            post_run: field("post_run"),
        });
    }
    Ok(jobs)
}

fn load_logs(key: &str, meta: Option<&Value>) -> Result<Vec<String>> {
    let mut logs: Vec<String> = Vec::new();
    for log in string_list(key, "logs", meta)? {
        if log.starts_with('/') {
            return Err(ManifestError::InvalidLogPath {
                section: key.to_string(),
                path: log,
            });
        }
        if !logs.contains(&log) {
            logs.push(log);
        }
    }
    Ok(logs)
}

fn load_cloud_volumes(key: &str, meta: Option<&Value>, config: &ClusterConfig) -> Result<Option<CloudVolumes>> {
    let meta = match meta {
        None => return Ok(None),
        Some(Value::Mapping(m)) => m,
        Some(other) => return Err(ManifestError::malformed(key, "cloud_volumes", describe(other))),
    };
    let kind = match meta.get("type").and_then(scalar_text).as_deref() {
        None | Some("multi") => CloudVolumeKind::Multi,
        Some("single") => CloudVolumeKind::Single,
        Some(other) => {
            return Err(ManifestError::UnsupportedCloudVolumeType {
                section: key.to_string(),
                kind: other.to_string(),
            })
        }
    };
    let dirs = string_list(key, "cloud_volumes.dirs", meta.get("dirs"))?
        .iter()
        .map(|d| resolve_path(&config.app_root, d))
        .collect();
    Ok(Some(CloudVolumes { kind, dirs }))
}
