//! Manifest Errors
//!
//! Every variant names the offending section and value so a failing
//! manifest can be fixed without reading the compiler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid lain conf: {0}")]
    InvalidDocument(String),

    #[error("invalid lain conf: no appname")]
    MissingAppname,

    #[error("invalid lain conf: appname {0} should not in {1:?}")]
    ReservedAppname(String, &'static [&'static str]),

    #[error("no {0} section in lain.yaml")]
    MissingSection(&'static str),

    #[error("no {field} in section {section}")]
    MissingField { section: String, field: &'static str },

    #[error("{section}: not supported {what} desc {value}")]
    Malformed {
        section: String,
        what: &'static str,
        value: String,
    },

    #[error("{section}: {message}")]
    Invalid { section: String, message: String },

    #[error("proc (type is web but name is not web) should have own mountpoint.\nkeyword: {section}")]
    MissingMountpoint { section: String },

    #[error("proc (type is portal) should have own service_name.\nkeyword: {section}")]
    MissingServiceName { section: String },

    #[error("duplicated proc name {0}")]
    DuplicateProcessName(String),

    #[error("{section}: cloud volume type {kind} not supported, only multi and single are valid")]
    UnsupportedCloudVolumeType { section: String, kind: String },

    #[error("{section}: invalid volume: abs volume {path} should not in {reserved:?}")]
    InvalidVolume {
        section: String,
        path: String,
        reserved: Vec<String>,
    },

    #[error("{section}: Log in Logs section MUST be a relative path based on /lain/logs. Wrong path: {path}")]
    InvalidLogPath { section: String, path: String },

    #[error("invalid prepare version: {0}\nVALID_PREPARE_VERSION_PATERN: r\"^[a-zA-Z0-9]+$\"")]
    InvalidPrepareVersion(String),

    #[error("structural validation failed: {0}")]
    StructuralValidation(String),
}

impl ManifestError {
    pub(crate) fn malformed(
        section: impl Into<String>,
        what: &'static str,
        value: impl std::fmt::Display,
    ) -> Self {
        Self::Malformed {
            section: section.into(),
            what,
            value: value.to_string(),
        }
    }

    pub(crate) fn invalid(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            section: section.into(),
            message: message.into(),
        }
    }
}
