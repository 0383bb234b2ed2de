//! `ImageClient` over the `docker` command line and the registry v2 API.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::DOCKER_APP_ROOT;
use crate::image::{BuildRequest, CopyRequest, ImageClient, ImageError, Store, VolumeBuildRequest};
use crate::manifest::paths::resolve_path;

const DOCKERFILE: &str = "Dockerfile";
const DOCKERIGNORE: &str = ".dockerignore";
const DOCKERIGNORE_BACKUP: &str = ".dockerignore.backup";
const GITIGNORE: &str = ".gitignore";
const SHARE_DIR: &str = "/lain_share";
const VOLUME_CACHE_DIR: &str = ".lain/volumes";
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DockerCli {
    binary: String,
    registry_timeout: Duration,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            registry_timeout: REGISTRY_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, args: &[String], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Run with inherited output; fail on non-zero status.
    fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<(), ImageError> {
        debug!("{} {}", self.binary, args.join(" "));
        let status = self.command(args, cwd).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ImageError::CommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                status: status.code().unwrap_or(-1),
            })
        }
    }

    /// Run and capture stdout.
    fn capture(&self, args: &[String]) -> Result<String, ImageError> {
        let output = self.command(args, None).stderr(Stdio::null()).output()?;
        if !output.status.success() {
            return Err(ImageError::CommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn volume_mounts(context: &Path, volumes: &[String]) -> Result<Vec<String>, ImageError> {
        let mut args = Vec::new();
        for volume in volumes {
            let host = volume_cache_dir(context, volume);
            fs::create_dir_all(&host)?;
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), volume));
        }
        Ok(args)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Host directory backing a build-time volume.
pub fn volume_cache_dir(context: &Path, volume: &str) -> PathBuf {
    let name = volume.trim_matches('/').replace('/', "_");
    context.join(VOLUME_CACHE_DIR).join(name)
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `KEY=$VAR` takes the value from the environment.
fn resolve_build_arg(arg: &str) -> Result<String, ImageError> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| ImageError::InvalidBuildArg(arg.to_string()))?;
    let value = match value.strip_prefix('$') {
        Some(var) => std::env::var(var).map_err(|_| ImageError::InvalidBuildArg(arg.to_string()))?,
        None => value.to_string(),
    };
    Ok(format!("{}={}", key, value))
}

/// Dockerfile and ignore list written into a build context; restored on drop.
struct StagedContext {
    dir: PathBuf,
    had_ignore: bool,
}

impl StagedContext {
    /// Refuses to touch a context that already holds a `Dockerfile` or a
    /// leftover ignore backup.
    fn write(dir: &Path, instructions: &str, ignore: &[String]) -> Result<Self, ImageError> {
        for occupied in [DOCKERFILE, DOCKERIGNORE_BACKUP] {
            let path = dir.join(occupied);
            if path.exists() {
                return Err(ImageError::ContextOccupied(path));
            }
        }
        let ignore_path = dir.join(DOCKERIGNORE);
        let had_ignore = ignore_path.exists();
        if had_ignore {
            fs::copy(&ignore_path, dir.join(DOCKERIGNORE_BACKUP))?;
        } else if dir.join(GITIGNORE).exists() {
            fs::copy(dir.join(GITIGNORE), &ignore_path)?;
        }
        let staged = Self {
            dir: dir.to_path_buf(),
            had_ignore,
        };

        let mut content = fs::read_to_string(&ignore_path).unwrap_or_default();
        content.push_str("# Appended by lain\n");
        for path in ignore {
            content.push_str(path);
            content.push('\n');
        }
        content.push_str("# end of lain\n");
        fs::write(&ignore_path, content)?;
        fs::write(dir.join(DOCKERFILE), instructions)?;
        Ok(staged)
    }
}

impl Drop for StagedContext {
    fn drop(&mut self) {
        for staged in [DOCKERFILE, DOCKERIGNORE] {
            let path = self.dir.join(staged);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot remove {}: {}", path.display(), e);
                }
            }
        }
        if self.had_ignore {
            let backup = self.dir.join(DOCKERIGNORE_BACKUP);
            if let Err(e) = fs::rename(&backup, self.dir.join(DOCKERIGNORE)) {
                warn!("cannot restore {} from {}: {}", DOCKERIGNORE, backup.display(), e);
            }
        }
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl ImageClient for DockerCli {
    fn exists(&self, name: &str) -> bool {
        self.capture(&args(["inspect", name])).is_ok()
    }

    fn pull(&self, name: &str) -> Result<(), ImageError> {
        info!("pulling image {} ...", name);
        self.run(&args(["pull", name]), None)
    }

    fn push(&self, name: &str) -> Result<(), ImageError> {
        info!("pushing image {} ...", name);
        self.run(&args(["push", name]), None)
    }

    fn tag(&self, src: &str, dest: &str) -> Result<(), ImageError> {
        info!("tag {} as {}", src, dest);
        self.run(&args(["tag", src, dest]), None)
    }

    fn build(&self, request: &BuildRequest) -> Result<String, ImageError> {
        info!("building image {} ...", request.name);
        let _staged = StagedContext::write(&request.context, &request.instructions, &request.ignore)?;

        let mut build = args(["build", "-t", &request.name]);
        if !request.use_cache {
            build.push("--no-cache".to_string());
        }
        for arg in &request.build_args {
            build.push("--build-arg".to_string());
            build.push(resolve_build_arg(arg)?);
        }
        build.push(".".to_string());

        match self.run(&build, Some(&request.context)) {
            Ok(()) => {
                info!("build succeeded: {}", request.name);
                Ok(request.name.clone())
            }
            Err(e) => {
                error!("build failed. See errors above.");
                Err(e)
            }
        }
    }

    fn build_with_volumes(&self, request: &VolumeBuildRequest) -> Result<String, ImageError> {
        info!("building image {} with volumes {:?} ...", request.name, request.volumes);
        let container = format!("{}-build", request.name.replace(['/', ':'], "-"));
        let script = if request.script.is_empty() {
            "true".to_string()
        } else {
            request.script.join(" && ")
        };

        let mut run = args(["run", "--name", &container, "-w", DOCKER_APP_ROOT]);
        run.push("-v".to_string());
        run.push(format!("{}:{}", request.context.display(), DOCKER_APP_ROOT));
        run.extend(Self::volume_mounts(&request.context, &request.volumes)?);
        run.extend(args([request.base.as_str(), "sh", "-c", &script]));

        let result = self
            .run(&run, None)
            .and_then(|_| self.run(&args(["commit", &container, &request.name]), None));
        let _ = self.run(&args(["rm", "-f", &container]), None);
        result.map(|_| request.name.clone())
    }

    fn copy_to_host(&self, request: &CopyRequest) -> Result<(), ImageError> {
        let mut steps = Vec::new();
        for entry in &request.copies {
            let src = resolve_path(DOCKER_APP_ROOT, &entry.src);
            let dest = format!("{}/{}", SHARE_DIR, entry.dest.trim_start_matches('/'));
            let parent = Path::new(&dest)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| SHARE_DIR.to_string());
            info!("copying {} in {} to {} in host ...", src, request.image, entry.dest);
            steps.push(format!(
                "mkdir -p {} && cp -r {} {}",
                shell_quote(&parent),
                shell_quote(&src),
                shell_quote(&dest)
            ));
        }
        if steps.is_empty() {
            return Ok(());
        }

        let mut run = args(["run", "--rm", "-v"]);
        run.push(format!("{}:{}", request.dest.display(), SHARE_DIR));
        run.extend(Self::volume_mounts(&request.context, &request.volumes)?);
        run.extend(args([request.image.as_str(), "sh", "-c", &steps.join(" && ")]));
        self.run(&run, None)
    }

    fn remove_image(&self, name: &str) -> Result<(), ImageError> {
        info!("removing {}", name);
        self.run(&args(["rmi", "-f", name]), None)
    }

    fn list_tags(&self, store: Store, registry: &str, appname: &str) -> Result<Vec<String>, ImageError> {
        let repository = format!("{}/{}", registry, appname);
        match store {
            Store::Local => {
                let listing = self.capture(&args(["images", "--format", "{{.Repository}}:{{.Tag}}", &repository]))?;
                let mut tags: Vec<String> = Vec::new();
                for line in listing.lines() {
                    if let Some((repo, tag)) = line.trim().rsplit_once(':') {
                        if repo == repository && !tags.iter().any(|t| t == tag) {
                            tags.push(tag.to_string());
                        }
                    }
                }
                Ok(tags)
            }
            Store::Remote => {
                let url = format!("http://{}/v2/{}/tags/list", registry, appname);
                let registry_error = |e: reqwest::Error| ImageError::Registry {
                    url: url.clone(),
                    reason: e.to_string(),
                };
                let client = reqwest::blocking::Client::builder()
                    .timeout(self.registry_timeout)
                    .build()
                    .map_err(registry_error)?;
                let list: TagList = client
                    .get(&url)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .and_then(|r| r.json())
                    .map_err(registry_error)?;
                Ok(list.tags.unwrap_or_default())
            }
        }
    }

    fn content_id(&self, name: &str) -> Result<String, ImageError> {
        let id = self
            .capture(&args(["inspect", "--format", "{{.Id}}", name]))
            .map_err(|_| ImageError::NotFound(name.to_string()))?;
        Ok(id.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/lain/app/a b"), "'/lain/app/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_volume_cache_dir() {
        let dir = volume_cache_dir(Path::new("/src"), "/lain/app/node_modules/");
        assert_eq!(dir, Path::new("/src/.lain/volumes/lain_app_node_modules"));
    }

    #[test]
    fn test_build_arg_resolution() {
        assert_eq!(resolve_build_arg("A=1").unwrap(), "A=1");
        std::env::set_var("LAINBUILD_TEST_ARG", "secret");
        assert_eq!(resolve_build_arg("B=$LAINBUILD_TEST_ARG").unwrap(), "B=secret");
        assert!(resolve_build_arg("C").is_err());
    }

    #[test]
    fn test_staged_context_restores_ignore() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DOCKERIGNORE), "target\n").unwrap();
        {
            let _staged = StagedContext::write(dir.path(), "FROM scratch\n", &[".git".to_string()]).unwrap();
            let ignore = fs::read_to_string(dir.path().join(DOCKERIGNORE)).unwrap();
            assert!(ignore.starts_with("target\n# Appended by lain\n.git\n"));
            assert!(dir.path().join(DOCKERFILE).exists());
        }
        assert_eq!(fs::read_to_string(dir.path().join(DOCKERIGNORE)).unwrap(), "target\n");
        assert!(!dir.path().join(DOCKERFILE).exists());
        assert!(!dir.path().join(DOCKERIGNORE_BACKUP).exists());
    }

    #[test]
    fn test_staged_context_keeps_user_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DOCKERFILE), "FROM custom\n").unwrap();

        let err = StagedContext::write(dir.path(), "FROM lain\n", &[]).err().unwrap();
        assert!(matches!(err, ImageError::ContextOccupied(ref p) if p.ends_with(DOCKERFILE)));
        assert_eq!(fs::read_to_string(dir.path().join(DOCKERFILE)).unwrap(), "FROM custom\n");
        assert!(!dir.path().join(DOCKERIGNORE).exists());
    }

    #[test]
    fn test_staged_context_keeps_stale_ignore_backup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DOCKERIGNORE), "appended\n").unwrap();
        fs::write(dir.path().join(DOCKERIGNORE_BACKUP), "target\n").unwrap();

        let err = StagedContext::write(dir.path(), "FROM lain\n", &[]).err().unwrap();
        assert!(matches!(err, ImageError::ContextOccupied(ref p) if p.ends_with(DOCKERIGNORE_BACKUP)));
        assert_eq!(fs::read_to_string(dir.path().join(DOCKERIGNORE_BACKUP)).unwrap(), "target\n");
        assert_eq!(fs::read_to_string(dir.path().join(DOCKERIGNORE)).unwrap(), "appended\n");
        assert!(!dir.path().join(DOCKERFILE).exists());
    }
}
