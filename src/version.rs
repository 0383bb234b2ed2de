//! Meta version: `{commit timestamp}-{commit hash}` of the source tree.

use std::path::Path;
use std::process::Command;
use tracing::warn;

pub trait VersionSource {
    /// Version of `commit` (HEAD when empty), or `None` when unavailable.
    fn resolve(&self, repo_dir: &Path, commit: &str) -> Option<String>;
}

/// Reads the version from `git log`.
#[derive(Debug, Clone, Default)]
pub struct GitVersion;

impl VersionSource for GitVersion {
    fn resolve(&self, repo_dir: &Path, commit: &str) -> Option<String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(repo_dir)
            .args(["log", "-1", "--pretty=format:%ct-%H"]);
        if !commit.is_empty() {
            cmd.arg(commit);
        }
        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                warn!("failed to run git in {}: {}", repo_dir.display(), e);
                return None;
            }
        };
        if !output.status.success() {
            warn!("git log failed in {}", repo_dir.display());
            return None;
        }
        parse_version(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Accept only `<digits>-<hex>`.
pub fn parse_version(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (timestamp, hash) = raw.split_once('-')?;
    let valid = !timestamp.is_empty()
        && timestamp.chars().all(|c| c.is_ascii_digit())
        && !hash.is_empty()
        && hash.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("1428553798-7142797e64bb7b4d057455ef13de6be156ae81cc\n").as_deref(),
            Some("1428553798-7142797e64bb7b4d057455ef13de6be156ae81cc")
        );
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("fatal: not a git repository"), None);
    }

    #[test]
    fn test_git_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(GitVersion.resolve(dir.path(), ""), None);
    }
}
