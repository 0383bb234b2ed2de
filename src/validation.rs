//! Structural Validation - Rule/Policy Separation
//!
//! Rules produce structured violations over the raw manifest document.
//! Policy maps violations to pass/fail.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::sync::OnceLock;

use crate::manifest::proc::is_valid_memory;

const CORE_PATTERN: &str = "([a-zA-Z])([a-zA-Z0-9]*)(-[a-zA-Z0-9]+)*";

pub const TOP_LEVEL_KEYS: [&str; 9] = [
    "appname",
    "giturl",
    "apptype",
    "build",
    "test",
    "release",
    "use_services",
    "use_resources",
    "notify",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: ViolationSeverity::Error,
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn expected(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    fn remediation(mut self, hint: &str) -> Self {
        self.remediation.push(hint.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            valid: true,
            violations: vec![],
        }
    }

    pub fn failure(violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: false,
            violations,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    /// Error messages joined for display, one per line.
    pub fn message(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| format!("[{}] {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pre-pass run on the raw manifest before semantic compilation.
pub trait StructuralValidator: Send + Sync {
    fn validate(&self, document: &Value) -> ValidationResult;
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Any error fails the document.
    #[default]
    Block,
    /// Record every violation but never fail.
    Warn,
}

fn anchored(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static validation pattern")
}

fn appname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| anchored(&format!("^{}$", CORE_PATTERN)))
}

fn proc_key_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            anchored(&format!(r"^proc\.{}$", CORE_PATTERN)),
            anchored(&format!(r"^(web|worker|oneshot)(\.{})?$", CORE_PATTERN)),
            anchored(&format!(r"^portal\.{}$", CORE_PATTERN)),
            anchored(&format!(r"^service\.{}$", CORE_PATTERN)),
        ]
    })
}

fn is_typed_proc_key(key: &str) -> bool {
    proc_key_patterns()[1].is_match(key)
}

fn proc_sections(document: &Mapping) -> impl Iterator<Item = (&str, &Mapping)> {
    document.iter().filter_map(|(k, v)| {
        let key = k.as_str()?;
        let body = v.as_mapping()?;
        proc_key_patterns()
            .iter()
            .any(|p| p.is_match(key))
            .then_some((key, body))
    })
}

fn present(map: &Mapping, key: &str) -> bool {
    !matches!(map.get(key), None | Some(Value::Null))
}

// --- Concrete Rules ---

pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for field in ["appname", "build"] {
            if !present(document, field) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("'{}' is a required property", field))
                        .remediation("Declare the field at the top level of lain.yaml"),
                );
            }
        }
        let sections = [("build", &["base", "script"][..]), ("test", &["script"][..]), ("release", &["dest_base", "copy"][..])];
        for (section, fields) in sections {
            if let Some(Value::Mapping(body)) = document.get(section) {
                for field in fields {
                    if !present(body, field) {
                        violations.push(ValidationViolation::error(
                            self.name(),
                            format!("{}: '{}' is a required property", section, field),
                        ));
                    }
                }
            }
        }
        if let Some(Value::Mapping(build)) = document.get("build") {
            if let Some(Value::Mapping(prepare)) = build.get("prepare") {
                if !present(prepare, "script") {
                    violations.push(ValidationViolation::error(
                        self.name(),
                        "build.prepare: 'script' is a required property",
                    ));
                }
            }
        }
        violations
    }
}

pub struct AppnameRule;

impl ValidationRule for AppnameRule {
    fn name(&self) -> &'static str {
        "appname"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        if let Some(name) = document.get("appname") {
            match name.as_str() {
                Some(n) if appname_pattern().is_match(n) => {}
                _ => violations.push(
                    ValidationViolation::error(self.name(), "appname does not match pattern")
                        .expected(appname_pattern().as_str(), format!("{:?}", name)),
                ),
            }
        }
        if let Some(apptype) = document.get("apptype") {
            if !matches!(apptype.as_str(), Some("app") | Some("resource")) {
                violations.push(
                    ValidationViolation::error(self.name(), "apptype must be app or resource")
                        .expected("^(resource|app)$", format!("{:?}", apptype)),
                );
            }
        }
        violations
    }
}

pub struct TopLevelKeysRule;

impl ValidationRule for TopLevelKeysRule {
    fn name(&self) -> &'static str {
        "top_level_keys"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        document
            .keys()
            .filter_map(|k| {
                let key = k.as_str().map(str::to_string).unwrap_or_else(|| format!("{:?}", k));
                let known = TOP_LEVEL_KEYS.contains(&key.as_str())
                    || proc_key_patterns().iter().any(|p| p.is_match(&key));
                (!known).then(|| {
                    ValidationViolation::error(self.name(), format!("additional property '{}' is not allowed", key))
                        .remediation("Process sections are proc.NAME, web[.NAME], worker[.NAME], oneshot[.NAME], portal.NAME or service.NAME")
                })
            })
            .collect()
    }
}

pub struct ProcCommandRule;

impl ValidationRule for ProcCommandRule {
    fn name(&self) -> &'static str {
        "proc_command"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        proc_sections(document)
            .filter(|(key, body)| is_typed_proc_key(key) && !present(body, "cmd") && !present(body, "entrypoint"))
            .map(|(key, _)| {
                ValidationViolation::error(self.name(), format!("{}: requires cmd or entrypoint", key))
            })
            .collect()
    }
}

pub struct MemoryRule;

impl ValidationRule for MemoryRule {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (key, body) in proc_sections(document) {
            let mut bodies = vec![(key.to_string(), body)];
            if let Some(Value::Mapping(portal)) = body.get("portal") {
                bodies.push((format!("{}.portal", key), portal));
            }
            for (section, body) in bodies {
                match body.get("memory") {
                    None | Some(Value::Null) => {}
                    Some(Value::String(m)) if is_valid_memory(m) => {}
                    Some(other) => violations.push(
                        ValidationViolation::error(self.name(), format!("{}: invalid memory", section))
                            .expected(r"^[1-9][0-9]*[mMgG]$", format!("{:?}", other))
                            .remediation("Use a size such as 64M or 1G"),
                    ),
                }
            }
        }
        violations
    }
}

pub struct WebOnlyFieldsRule;

impl ValidationRule for WebOnlyFieldsRule {
    fn name(&self) -> &'static str {
        "web_only_fields"
    }

    fn validate(&self, document: &Mapping) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (key, body) in proc_sections(document) {
            let is_web = key == "web"
                || key.starts_with("web.")
                || (key.starts_with("proc.") && body.get("type").and_then(Value::as_str) == Some("web"));
            if is_web {
                continue;
            }
            for field in ["mountpoint", "https_only", "healthcheck"] {
                if present(body, field) {
                    violations.push(ValidationViolation {
                        rule: self.name().to_string(),
                        severity: ViolationSeverity::Warning,
                        message: format!("{}: {} is ignored for non-web processes", key, field),
                        expected: None,
                        actual: None,
                        remediation: vec![format!("Remove {} or make the process web", field)],
                    });
                }
            }
        }
        violations
    }
}

/// Validator orchestrates rules and applies policy
pub struct SchemaValidator {
    rules: Vec<Box<dyn ValidationRule>>,
    failure_mode: FailureMode,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(RequiredFieldsRule),
                Box::new(AppnameRule),
                Box::new(TopLevelKeysRule),
                Box::new(ProcCommandRule),
                Box::new(MemoryRule),
                Box::new(WebOnlyFieldsRule),
            ],
            failure_mode: FailureMode::Block,
        }
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }
}

impl StructuralValidator for SchemaValidator {
    fn validate(&self, document: &Value) -> ValidationResult {
        let Some(document) = document.as_mapping() else {
            return ValidationResult::failure(vec![ValidationViolation::error(
                "document",
                "manifest must be a mapping",
            )]);
        };

        let violations: Vec<_> = self.rules.iter().flat_map(|r| r.validate(document)).collect();
        let has_errors = violations.iter().any(|v| v.severity == ViolationSeverity::Error);

        match self.failure_mode {
            FailureMode::Block if has_errors => ValidationResult::failure(violations),
            // Warnings don't block
            FailureMode::Block | FailureMode::Warn => ValidationResult {
                valid: true,
                violations,
            },
        }
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}
