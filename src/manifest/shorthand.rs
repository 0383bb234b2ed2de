//! Shorthand Normalizers
//!
//! Manifest fields accept several shapes (int, string, list, mapping).
//! Each field is first decoded into a small tagged variant, then the
//! semantic rules run against the variant only.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{ManifestError, Result};

pub const MIN_SOURCE_PORT: u16 = 9500;
pub const MAX_SOURCE_PORT: u16 = 10000;
pub const DEFAULT_WEB_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for SocketType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// One entry of the legacy `port` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(rename = "type")]
    pub socket_type: SocketType,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            socket_type: SocketType::Tcp,
        }
    }
}

/// One entry of the `ports` field: a source port bound to a container port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub srcport: u16,
    pub dstport: u16,
    pub proto: SocketType,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Render a scalar for error messages and text coercion.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn describe(value: &Value) -> String {
    scalar_text(value).unwrap_or_else(|| {
        serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
    })
}

// --- port ---

enum PortShorthand {
    Number(i64),
    Text(String),
    Qualified { port: Value, qualifiers: Value },
}

impl PortShorthand {
    fn decode(section: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| ManifestError::malformed(section, "port", n)),
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Mapping(m) if m.len() == 1 => {
                let (port, qualifiers) = m
                    .iter()
                    .next()
                    .ok_or_else(|| ManifestError::malformed(section, "port", describe(value)))?;
                Ok(Self::Qualified {
                    port: port.clone(),
                    qualifiers: qualifiers.clone(),
                })
            }
            other => Err(ManifestError::malformed(section, "port", describe(other))),
        }
    }
}

fn port_number(section: &str, text: &str, desc: &str) -> Result<u16> {
    text.trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| ManifestError::malformed(section, "port", desc))
}

fn socket_type(section: &str, text: &str, desc: &str) -> Result<SocketType> {
    text.trim()
        .parse()
        .map_err(|_| ManifestError::malformed(section, "port", desc))
}

fn load_single_port(section: &str, value: &Value) -> Result<PortSpec> {
    match PortShorthand::decode(section, value)? {
        PortShorthand::Number(n) => {
            let port = u16::try_from(n)
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| ManifestError::malformed(section, "port", n))?;
            Ok(PortSpec::tcp(port))
        }
        PortShorthand::Text(text) => {
            let parts: Vec<&str> = text.split(|c| c == ':' || c == '/').collect();
            match parts.as_slice() {
                [port] => Ok(PortSpec::tcp(port_number(section, port, &text)?)),
                [port, kind] => Ok(PortSpec {
                    port: port_number(section, port, &text)?,
                    socket_type: socket_type(section, kind, &text)?,
                }),
                _ => Err(ManifestError::malformed(section, "port", text)),
            }
        }
        PortShorthand::Qualified { port, qualifiers } => {
            let desc = describe(value);
            let port_text =
                scalar_text(&port).ok_or_else(|| ManifestError::malformed(section, "port", &desc))?;
            let port = port_number(section, &port_text, &desc)?;
            let first = match &qualifiers {
                Value::Sequence(items) => items.first().and_then(scalar_text),
                Value::String(s) => Some(s.clone()),
                _ => None,
            };
            let qualifier = first.ok_or_else(|| ManifestError::malformed(section, "port", &desc))?;
            match qualifier.split_once(':') {
                Some(("type", kind)) => Ok(PortSpec {
                    port,
                    socket_type: socket_type(section, kind, &desc)?,
                }),
                _ => Err(ManifestError::malformed(section, "port", desc)),
            }
        }
    }
}

/// Decode the legacy `port` field: a descriptor or a list of descriptors.
pub fn load_port(section: &str, value: &Value) -> Result<BTreeMap<u16, PortSpec>> {
    let items: Vec<&Value> = match value {
        Value::Sequence(items) => items.iter().collect(),
        other => vec![other],
    };
    let mut ports = BTreeMap::new();
    for item in items {
        let spec = load_single_port(section, item)?;
        ports.insert(spec.port, spec);
    }
    Ok(ports)
}

// --- ports ---

fn parse_port_descriptor(section: &str, desc: &str) -> Result<(u16, u16, SocketType)> {
    let (mapping, proto) = match desc.split_once('/') {
        Some((mapping, proto)) => (mapping, socket_type(section, proto, desc)?),
        None => (desc, SocketType::Tcp),
    };
    let (src, dst) = match mapping.split(':').collect::<Vec<_>>().as_slice() {
        [single] => (*single, *single),
        [src, dst] => (*src, *dst),
        _ => return Err(ManifestError::malformed(section, "ports", desc)),
    };

    let src: u16 = src
        .trim()
        .parse()
        .map_err(|_| ManifestError::malformed(section, "ports", desc))?;
    if !(MIN_SOURCE_PORT..MAX_SOURCE_PORT).contains(&src) {
        return Err(ManifestError::invalid(
            section,
            format!(
                "src port should between {} and {}: {}",
                MIN_SOURCE_PORT, MAX_SOURCE_PORT, desc
            ),
        ));
    }
    let dst: u16 = dst
        .trim()
        .parse()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| {
            ManifestError::invalid(section, format!("dst port should between 1 and 65535: {}", desc))
        })?;
    Ok((src, dst, proto))
}

fn port_key(section: &str, value: &Value) -> Result<String> {
    scalar_text(value).ok_or_else(|| ManifestError::malformed(section, "ports", describe(value)))
}

/// Decode the `ports` field into canonical mappings, rejecting a source port
/// bound more than once.
pub fn load_ports(section: &str, value: &Value) -> Result<Vec<PortMapping>> {
    let mut entries: Vec<(String, Option<&Value>)> = Vec::new();
    match value {
        Value::Number(_) | Value::String(_) => entries.push((port_key(section, value)?, None)),
        Value::Sequence(items) => {
            for item in items {
                match item {
                    Value::Mapping(m) => {
                        for (k, v) in m {
                            entries.push((port_key(section, k)?, Some(v)));
                        }
                    }
                    other => entries.push((port_key(section, other)?, None)),
                }
            }
        }
        Value::Mapping(m) => {
            for (k, v) in m {
                entries.push((port_key(section, k)?, Some(v)));
            }
        }
        other => return Err(ManifestError::malformed(section, "ports", describe(other))),
    }

    let mut mappings: Vec<PortMapping> = Vec::with_capacity(entries.len());
    for (desc, attrs) in entries {
        let (srcport, dstport, proto) = parse_port_descriptor(section, &desc)?;
        if mappings.iter().any(|m| m.srcport == srcport) {
            return Err(ManifestError::invalid(
                section,
                format!("cant bind src port to many dst ports {}", desc),
            ));
        }
        let mut extra = BTreeMap::new();
        if let Some(Value::Mapping(attrs)) = attrs {
            for (k, v) in attrs {
                if let Some(key) = scalar_text(k) {
                    let json = serde_json::to_value(v)
                        .map_err(|_| ManifestError::malformed(section, "ports", describe(v)))?;
                    extra.insert(key, json);
                }
            }
        }
        mappings.push(PortMapping {
            srcport,
            dstport,
            proto,
            extra,
        });
    }
    Ok(mappings)
}

// --- labels / filters ---

fn text_items(section: &str, what: &'static str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(vec![]),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(ManifestError::malformed(section, what, describe(other))),
            })
            .collect(),
        other => Err(ManifestError::malformed(section, what, describe(other))),
    }
}

/// `key:value` strings into a label map. The last `:` separates key from value.
pub fn load_labels(section: &str, value: &Value) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for item in text_items(section, "labels", value)? {
        let (key, val) = item
            .rsplit_once(':')
            .ok_or_else(|| ManifestError::malformed(section, "labels", &item))?;
        labels.insert(key.to_string(), val.to_string());
    }
    Ok(labels)
}

fn filter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(affinity|constraint):(.*)(==|!=)(.*)$").expect("static filter pattern")
    })
}

/// Scheduling filters such as `constraint:node==db1` or `affinity:app!=cache`.
pub fn load_filters(section: &str, value: &Value) -> Result<Vec<String>> {
    let filters = text_items(section, "filters", value)?;
    for filter in &filters {
        if !filter_pattern().is_match(filter) {
            return Err(ManifestError::malformed(section, "filters", filter));
        }
    }
    Ok(filters)
}

// --- env / commands / string lists ---

/// Environment entries: `KEY=value` strings or single-key `{KEY: value}` maps.
pub fn load_env(section: &str, value: Option<&Value>) -> Result<Vec<String>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(vec![]),
        Some(Value::Sequence(items)) => items,
        Some(other) => return Err(ManifestError::malformed(section, "env", describe(other))),
    };
    let mut env = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => env.push(s.clone()),
            Value::Mapping(m) if m.len() == 1 => {
                for (k, v) in m {
                    match (scalar_text(k), scalar_text(v)) {
                        (Some(k), Some(v)) => env.push(format!("{}={}", k, v)),
                        _ => return Err(ManifestError::malformed(section, "env", describe(item))),
                    }
                }
            }
            other => return Err(ManifestError::malformed(section, "env", describe(other))),
        }
    }
    Ok(env)
}

enum CommandShorthand {
    Absent,
    Shell(String),
    Exec(Vec<String>),
    Unsupported,
}

impl CommandShorthand {
    fn decode(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(s)) => Self::Shell(s.clone()),
            Some(Value::Sequence(items)) => {
                let words: Option<Vec<String>> =
                    items.iter().map(|i| i.as_str().map(str::to_string)).collect();
                words.map_or(Self::Unsupported, Self::Exec)
            }
            Some(_) => Self::Unsupported,
        }
    }
}

/// Normalize `cmd`/`entrypoint` into exec form. A shell string is split on
/// whitespace. Unsupported shapes fail unless `lenient`, where they degrade
/// to an empty command.
pub fn to_exec_form(
    section: &str,
    field: &'static str,
    value: Option<&Value>,
    lenient: bool,
) -> Result<Vec<String>> {
    match CommandShorthand::decode(value) {
        CommandShorthand::Absent => Ok(vec![]),
        CommandShorthand::Shell(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
        CommandShorthand::Exec(words) => Ok(words),
        CommandShorthand::Unsupported if lenient => {
            tracing::warn!("{}: ignoring unsupported {} {:?}", section, field, value);
            Ok(vec![])
        }
        CommandShorthand::Unsupported => Err(ManifestError::malformed(
            section,
            field,
            value.map(describe).unwrap_or_default(),
        )),
    }
}

/// A list of scalars (or one scalar) as strings; null yields an empty list.
pub fn string_list(section: &str, what: &'static str, value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|i| scalar_text(i).ok_or_else(|| ManifestError::malformed(section, what, describe(i))))
            .collect(),
        Some(other) => scalar_text(other)
            .map(|s| vec![s])
            .ok_or_else(|| ManifestError::malformed(section, what, describe(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_port_shapes() {
        assert_eq!(load_port("web", &yaml("80")).unwrap()[&80], PortSpec::tcp(80));
        let typed = load_port("web", &yaml("'53:udp'")).unwrap();
        assert_eq!(typed[&53].socket_type, SocketType::Udp);
        let mapped = load_port("web", &yaml("{80: ['type:udp']}")).unwrap();
        assert_eq!(mapped[&80].socket_type, SocketType::Udp);
        let listed = load_port("web", &yaml("[80, '81:tcp']")).unwrap();
        assert_eq!(listed.keys().copied().collect::<Vec<_>>(), vec![80, 81]);
    }

    #[test]
    fn test_port_too_many_parts() {
        let err = load_port("web", &yaml("'80:tcp:foo'")).unwrap_err();
        assert!(err.to_string().contains("not supported port desc 80:tcp:foo"));
    }

    #[test]
    fn test_port_bad_type() {
        assert!(load_port("web", &yaml("'80:sctp'")).is_err());
        assert!(load_port("web", &yaml("{80: ['kind:tcp']}")).is_err());
        assert!(load_port("web", &yaml("0")).is_err());
        assert!(load_port("web", &yaml("70000")).is_err());
    }

    #[test]
    fn test_ports_forms() {
        let ports = load_ports("worker", &yaml("['9501:80', '9502/udp', 9503]")).unwrap();
        assert_eq!(ports[0].srcport, 9501);
        assert_eq!(ports[0].dstport, 80);
        assert_eq!(ports[1].dstport, 9502);
        assert_eq!(ports[1].proto, SocketType::Udp);
        assert_eq!(ports[2].proto, SocketType::Tcp);

        let ports = load_ports("worker", &yaml("{'9600:8080/udp': {lb: true}}")).unwrap();
        assert_eq!(ports[0].proto, SocketType::Udp);
        assert_eq!(ports[0].extra["lb"], serde_json::json!(true));
    }

    #[test]
    fn test_ports_range_and_duplicates() {
        assert!(load_ports("worker", &yaml("'9499:80'")).is_err());
        assert!(load_ports("worker", &yaml("'10000:80'")).is_err());
        assert!(load_ports("worker", &yaml("'9999:0'")).is_err());
        let err = load_ports("worker", &yaml("['9501:80', '9501:81']")).unwrap_err();
        assert!(err.to_string().contains("cant bind src port"));
    }

    #[test]
    fn test_labels_and_filters() {
        let labels = load_labels("web", &yaml("['tier:frontend', 'a:b:c']")).unwrap();
        assert_eq!(labels["tier"], "frontend");
        assert_eq!(labels["a:b"], "c");
        assert!(load_labels("web", &yaml("nocolon")).is_err());

        let filters = load_filters("web", &yaml("constraint:node==db1")).unwrap();
        assert_eq!(filters, vec!["constraint:node==db1"]);
        assert!(load_filters("web", &yaml("['affinity:app!=cache', 'node==x']")).is_err());
    }

    #[test]
    fn test_exec_form() {
        let shell = yaml("./echo -p 1234");
        assert_eq!(
            to_exec_form("web", "cmd", Some(&shell), false).unwrap(),
            vec!["./echo", "-p", "1234"]
        );
        assert!(to_exec_form("web", "cmd", None, false).unwrap().is_empty());
        assert!(to_exec_form("web", "cmd", Some(&Value::Null), false).unwrap().is_empty());

        let bad = yaml("{run: x}");
        assert!(to_exec_form("web", "cmd", Some(&bad), false).is_err());
        assert!(to_exec_form("web", "cmd", Some(&bad), true).unwrap().is_empty());
    }

    #[test]
    fn test_env_entries() {
        let env = yaml("['A=1', {REDIS_ADDR: 'redis:3333'}]");
        assert_eq!(
            load_env("web", Some(&env)).unwrap(),
            vec!["A=1", "REDIS_ADDR=redis:3333"]
        );
        assert!(load_env("web", None).unwrap().is_empty());
    }
}
