//! In-memory image client shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::PathBuf;

use lainbuild_core::image::{image_phase, BuildRequest, CopyRequest, ImageClient, ImageError, Store, VolumeBuildRequest};
use lainbuild_core::manifest::sections::CopyEntry;

pub const REGISTRY: &str = "registry.lain.local";
pub const BASE_ID: &str = "sha256:0123456789abcdef0123456789abcdef";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pull(String),
    Push(String),
    Tag(String, String),
    Build {
        name: String,
        context: PathBuf,
        instructions: String,
        build_args: Vec<String>,
        use_cache: bool,
    },
    BuildWithVolumes {
        name: String,
        base: String,
        volumes: Vec<String>,
        script: Vec<String>,
    },
    CopyToHost {
        image: String,
        copies: Vec<CopyEntry>,
        dest: PathBuf,
        dest_existed: bool,
        volumes: Vec<String>,
    },
    Remove(String),
    Exists(String),
    ListTags(Store),
    ContentId(String),
}

/// Records every call. Failures are configured per image or per phase.
#[derive(Default)]
pub struct FakeImageClient {
    pub calls: RefCell<Vec<Call>>,
    pub local_tags: Vec<String>,
    pub remote_tags: Vec<String>,
    pub remote_unreachable: bool,
    pub fail_pulls: Vec<String>,
    pub fail_push: bool,
    /// Phases whose image builds fail.
    pub fail_builds: Vec<&'static str>,
    pub fail_copy: bool,
    /// Images `exists` denies regardless of the stores.
    pub missing: Vec<String>,
}

impl FakeImageClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, local: &[&str], remote: &[&str]) -> Self {
        self.local_tags = local.iter().map(|s| s.to_string()).collect();
        self.remote_tags = remote.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    pub fn pulls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Pull(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Push(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Tag(src, dest) => Some((src, dest)),
                _ => None,
            })
            .collect()
    }

    /// Names of Dockerfile builds, in order.
    pub fn builds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Instructions of the first build whose name matches `name`.
    pub fn instructions_of(&self, name: &str) -> Option<String> {
        self.calls().into_iter().find_map(|c| match c {
            Call::Build {
                name: built, instructions, ..
            } if built == name => Some(instructions),
            _ => None,
        })
    }

    pub fn copies(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::CopyToHost { .. }))
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Remove(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn fails(&self, name: &str) -> bool {
        image_phase(name).is_some_and(|phase| self.fail_builds.contains(&phase))
    }
}

impl ImageClient for FakeImageClient {
    /// Present when listed in the local store, pulled or built earlier.
    fn exists(&self, name: &str) -> bool {
        let present = !self.missing.iter().any(|m| m == name)
            && (name
                .rsplit_once(':')
                .is_some_and(|(_, tag)| self.local_tags.iter().any(|t| t == tag))
                || self.calls().iter().any(|c| match c {
                    Call::Pull(pulled) => pulled == name,
                    Call::Build { name: built, .. } => built == name,
                    _ => false,
                }));
        self.record(Call::Exists(name.to_string()));
        present
    }

    fn pull(&self, name: &str) -> Result<(), ImageError> {
        self.record(Call::Pull(name.to_string()));
        if self.fail_pulls.iter().any(|n| n == name) {
            return Err(ImageError::CommandFailed {
                command: "pull".into(),
                status: 1,
            });
        }
        Ok(())
    }

    fn push(&self, name: &str) -> Result<(), ImageError> {
        self.record(Call::Push(name.to_string()));
        if self.fail_push {
            return Err(ImageError::CommandFailed {
                command: "push".into(),
                status: 1,
            });
        }
        Ok(())
    }

    fn tag(&self, src: &str, dest: &str) -> Result<(), ImageError> {
        self.record(Call::Tag(src.to_string(), dest.to_string()));
        Ok(())
    }

    fn build(&self, request: &BuildRequest) -> Result<String, ImageError> {
        self.record(Call::Build {
            name: request.name.clone(),
            context: request.context.clone(),
            instructions: request.instructions.clone(),
            build_args: request.build_args.clone(),
            use_cache: request.use_cache,
        });
        if self.fails(&request.name) {
            return Err(ImageError::CommandFailed {
                command: "build".into(),
                status: 1,
            });
        }
        Ok(request.name.clone())
    }

    fn build_with_volumes(&self, request: &VolumeBuildRequest) -> Result<String, ImageError> {
        self.record(Call::BuildWithVolumes {
            name: request.name.clone(),
            base: request.base.clone(),
            volumes: request.volumes.clone(),
            script: request.script.clone(),
        });
        if self.fails(&request.name) {
            return Err(ImageError::CommandFailed {
                command: "commit".into(),
                status: 1,
            });
        }
        Ok(request.name.clone())
    }

    fn copy_to_host(&self, request: &CopyRequest) -> Result<(), ImageError> {
        self.record(Call::CopyToHost {
            image: request.image.clone(),
            copies: request.copies.clone(),
            dest: request.dest.clone(),
            dest_existed: request.dest.is_dir(),
            volumes: request.volumes.clone(),
        });
        if self.fail_copy {
            return Err(ImageError::CommandFailed {
                command: "cp".into(),
                status: 1,
            });
        }
        Ok(())
    }

    fn remove_image(&self, name: &str) -> Result<(), ImageError> {
        self.record(Call::Remove(name.to_string()));
        Ok(())
    }

    fn list_tags(&self, store: Store, _registry: &str, _appname: &str) -> Result<Vec<String>, ImageError> {
        self.record(Call::ListTags(store));
        match store {
            Store::Local => Ok(self.local_tags.clone()),
            Store::Remote if self.remote_unreachable => Err(ImageError::Registry {
                url: format!("http://{}/v2/hello/tags/list", REGISTRY),
                reason: "connection refused".into(),
            }),
            Store::Remote => Ok(self.remote_tags.clone()),
        }
    }

    fn content_id(&self, name: &str) -> Result<String, ImageError> {
        self.record(Call::ContentId(name.to_string()));
        Ok(BASE_ID.to_string())
    }
}
