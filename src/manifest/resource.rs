//! Resource Instance Renderer
//!
//! A resource app ships a manifest template whose string leaves may carry
//! `{{ var|default('x')|int(1) }}` placeholders. Rendering it against a
//! consumer's `use_resources` context yields the manifest of the
//! `resource.<resource>.<client>` instance app.

use regex::{Captures, Regex};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::instrument;

use super::shorthand::{describe, scalar_text};
use super::{AppManifest, ManifestCompiler};
use crate::error::{ManifestError, Result};
use crate::image::image_name;

const SECTION: &str = "resource template";

pub fn resource_instance_name(resource_appname: &str, client_appname: &str) -> String {
    format!("resource.{}.{}", resource_appname, client_appname)
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("static placeholder pattern"))
}

fn filter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(?:\((.*)\))?$").expect("static filter pattern")
    })
}

/// Literal argument: quoted string or bare number.
fn literal(arg: &str) -> Option<String> {
    let arg = arg.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = arg.strip_prefix(quote).and_then(|a| a.strip_suffix(quote)) {
            return Some(inner.to_string());
        }
    }
    arg.parse::<f64>().ok().map(|_| arg.to_string())
}

fn context_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => scalar_text(other).unwrap_or_else(|| describe(other)),
    }
}

/// Evaluate one `{{ ... }}` expression. `None` means undefined.
fn evaluate(expr: &str, context: &BTreeMap<String, Value>) -> Result<Option<String>> {
    let mut parts = expr.split('|');
    let head = parts.next().unwrap_or_default().trim();
    let mut current = match literal(head) {
        Some(text) => Some(text),
        None => context.get(head).map(context_text),
    };

    for filter in parts {
        let caps = filter_pattern()
            .captures(filter.trim())
            .ok_or_else(|| ManifestError::invalid(SECTION, format!("unsupported filter '{}'", filter.trim())))?;
        let arg = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        current = match &caps[1] {
            "default" | "d" => current.or_else(|| literal(arg)),
            "int" => {
                let fallback = literal(arg).unwrap_or_else(|| "0".to_string());
                let text = current.unwrap_or_default();
                let parsed = text
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| text.trim().parse::<f64>().ok().map(|f| f.trunc() as i64));
                Some(parsed.map_or(fallback, |n| n.to_string()))
            }
            "string" => Some(current.unwrap_or_default()),
            "lower" => current.map(|s| s.to_lowercase()),
            "upper" => current.map(|s| s.to_uppercase()),
            "trim" => current.map(|s| s.trim().to_string()),
            other => {
                return Err(ManifestError::invalid(SECTION, format!("unsupported filter '{}'", other)));
            }
        };
    }
    Ok(current)
}

/// Substitute every placeholder in `text`; undefined values render empty.
pub fn render_text(text: &str, context: &BTreeMap<String, Value>) -> Result<String> {
    let mut failure = None;
    let rendered = placeholder_pattern().replace_all(text, |caps: &Captures| {
        match evaluate(&caps[1], context) {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

fn render_leaf(text: &str, context: &BTreeMap<String, Value>) -> Result<Value> {
    let rendered = render_text(text, context)?;
    Ok(match rendered.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(rendered),
    })
}

fn render_value(value: &mut Value, context: &BTreeMap<String, Value>) -> Result<()> {
    match value {
        Value::String(s) => *value = render_leaf(s, context)?,
        Value::Sequence(items) => {
            for item in items {
                render_value(item, context)?;
            }
        }
        Value::Mapping(m) => {
            for (_, v) in m.iter_mut() {
                render_value(v, context)?;
            }
        }
        Value::Tagged(tagged) => render_value(&mut tagged.value, context)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Parse the resource template and substitute every string leaf.
pub fn render_instance_yaml(template: &str, context: &BTreeMap<String, Value>) -> Result<Mapping> {
    let mut document: Value = serde_yaml::from_str(template)?;
    render_value(&mut document, context)?;
    match document {
        Value::Mapping(m) => Ok(m),
        other => Err(ManifestError::InvalidDocument(describe(&other))),
    }
}

/// Render the instance manifest text for `client_appname`.
///
/// The rendered template must compile as the resource itself before it is
/// renamed to the instance appname and stripped of its `apptype`.
#[instrument(skip(compiler, template, context))]
pub fn render_resource_instance(
    compiler: &ManifestCompiler,
    resource_appname: &str,
    resource_meta_version: &str,
    template: &str,
    client_appname: &str,
    context: &BTreeMap<String, Value>,
) -> Result<String> {
    let mut instance = render_instance_yaml(template, context)?;
    compiler.compile_document(&Value::Mapping(instance.clone()), Some(resource_meta_version), None)?;

    instance.insert(
        "appname".into(),
        Value::String(resource_instance_name(resource_appname, client_appname)),
    );
    instance.remove("apptype");
    Ok(serde_yaml::to_string(&instance)?)
}

/// Render and compile the instance app. Processes without an explicit image
/// run the resource's release image.
pub fn compile_resource_instance(
    compiler: &ManifestCompiler,
    resource_appname: &str,
    resource_meta_version: &str,
    template: &str,
    client_appname: &str,
    context: &BTreeMap<String, Value>,
) -> Result<AppManifest> {
    let text = render_resource_instance(
        compiler,
        resource_appname,
        resource_meta_version,
        template,
        client_appname,
        context,
    )?;
    let default_image = image_name(
        resource_appname,
        "release",
        Some(resource_meta_version),
        compiler.config().registry.as_deref(),
    );
    let document: Value = serde_yaml::from_str(&text)?;
    compiler.compile_document(&document, Some(resource_meta_version), Some(&default_image))
}
