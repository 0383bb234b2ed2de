//! Build Phase Orchestrator
//!
//! Drives `prepare -> build -> release -> test -> meta` for one compiled
//! manifest. Each phase yields an image name or a [`BuildFailure`]; faults in
//! the collaborators that leave nothing to report (fatal base pull, fatal
//! prepare fetch) are returned as [`PipelineError`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheError, PrepareIdentity, PrepareResolver};
use crate::config::{ClusterConfig, DOCKER_APP_ROOT};
use crate::hashing::compute_build_hash;
use crate::image::{image_name, BuildRequest, CopyRequest, ImageClient, ImageError, VolumeBuildRequest};
use crate::manifest::sections::{CopyEntry, PrepareSpec};
use crate::manifest::AppManifest;
use crate::templates::{InstructionParams, InstructionRenderer, TemplateError, TemplateKind};
use crate::ENGINE_VERSION;

/// Paths never sent to the image builder.
pub const IGNORE: [&str; 2] = [".git", ".vagrant"];

pub const META_BASE: &str = "scratch";
pub const APPNAME_LABEL: &str = "lain.appname";
pub const META_VERSION_LABEL: &str = "lain.meta_version";
/// Base64 of the process annotations JSON.
pub const ANNOTATIONS_LABEL: &str = "lain.annotations";

/// `COPY` needs the trailing slash.
pub fn workdir() -> String {
    format!("{}/", DOCKER_APP_ROOT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Build,
    Release,
    Test,
    Meta,
    /// Release script layer on top of the build image.
    ScriptInter,
    CopyInter,
}

impl Phase {
    /// Phases of a full run, in order.
    pub const PLANNED: [Phase; 5] = [Self::Prepare, Self::Build, Self::Release, Self::Test, Self::Meta];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Build => "build",
            Self::Release => "release",
            Self::Test => "test",
            Self::Meta => "meta",
            Self::ScriptInter => "script_inter",
            Self::CopyInter => "copy_inter",
        }
    }

    pub fn template(&self) -> TemplateKind {
        match self {
            Self::Release => TemplateKind::Release,
            Self::Meta => TemplateKind::Meta,
            _ => TemplateKind::Build,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("docker pull {image} failed: {source}")]
    BasePull {
        image: String,
        #[source]
        source: ImageError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("cannot create staging directory: {0}")]
    Staging(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("phase {0} is not part of the build plan")]
    NotPlanned(Phase),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub phase: Phase,
    pub reason: String,
}

impl BuildFailure {
    fn new(phase: Phase, reason: impl fmt::Display) -> Self {
        Self {
            phase,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} phase failed: {}", self.phase, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum PhaseOutcome {
    Built(String),
    Failed(BuildFailure),
}

impl PhaseOutcome {
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Built(name) => Some(name),
            Self::Failed(_) => None,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built(_))
    }
}

/// Image name of every planned phase. Skipped phases are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub appname: String,
    pub meta_version: Option<String>,
    pub registry: Option<String>,
    pub images: BTreeMap<Phase, String>,
}

impl BuildPlan {
    pub fn new(manifest: &AppManifest, config: &ClusterConfig, ignore_prepare: bool) -> Self {
        let mut plan = Self {
            appname: manifest.appname.clone(),
            meta_version: manifest.meta_version.clone(),
            registry: config.registry.clone(),
            images: BTreeMap::new(),
        };
        for phase in Phase::PLANNED {
            let name = plan.image_name(phase);
            plan.images.insert(phase, name);
        }
        if ignore_prepare || manifest.build.prepare.is_none() {
            plan.images.remove(&Phase::Prepare);
        }
        plan
    }

    /// Default name for any phase, planned or intermediate.
    pub fn image_name(&self, phase: Phase) -> String {
        image_name(
            &self.appname,
            phase.as_str(),
            self.meta_version.as_deref(),
            self.registry.as_deref(),
        )
    }

    pub fn get(&self, phase: Phase) -> Option<&str> {
        self.images.get(&phase).map(String::as_str)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.images.contains_key(&phase)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.images.keys().copied().collect()
    }

    fn name(&self, phase: Phase) -> Result<String, PipelineError> {
        self.get(phase)
            .map(str::to_string)
            .ok_or(PipelineError::NotPlanned(phase))
    }
}

/// Result of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub id: String,
    pub appname: String,
    pub meta_version: Option<String>,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub manifest_hash: String,
    pub build_hash: String,
    pub images: BTreeMap<Phase, String>,
    pub failure: Option<BuildFailure>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct BuildPipeline<'a, C: ImageClient + ?Sized, R: PrepareResolver, T: InstructionRenderer> {
    manifest: &'a AppManifest,
    client: &'a C,
    resolver: R,
    renderer: T,
    context: PathBuf,
    plan: BuildPlan,
    built: BTreeMap<Phase, String>,
}

impl<'a, C, R, T> BuildPipeline<'a, C, R, T>
where
    C: ImageClient + ?Sized,
    R: PrepareResolver,
    T: InstructionRenderer,
{
    pub fn new(
        manifest: &'a AppManifest,
        plan: BuildPlan,
        context: impl Into<PathBuf>,
        client: &'a C,
        resolver: R,
        renderer: T,
    ) -> Self {
        Self {
            manifest,
            client,
            resolver,
            renderer,
            context: context.into(),
            plan,
            built: BTreeMap::new(),
        }
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// Images produced so far.
    pub fn built(&self) -> &BTreeMap<Phase, String> {
        &self.built
    }

    fn record(&mut self, phase: Phase, outcome: &PhaseOutcome) {
        if let PhaseOutcome::Built(name) = outcome {
            self.built.insert(phase, name.clone());
        }
    }

    fn build_image(
        &self,
        phase: Phase,
        name: &str,
        params: &InstructionParams,
        build_args: &[String],
        use_cache: bool,
        context: &Path,
    ) -> Result<PhaseOutcome, PipelineError> {
        let request = BuildRequest {
            name: name.to_string(),
            context: context.to_path_buf(),
            instructions: self.renderer.render(phase.template(), params)?,
            build_args: build_args.to_vec(),
            ignore: IGNORE.iter().map(|s| s.to_string()).collect(),
            use_cache,
        };
        Ok(match self.client.build(&request) {
            Ok(built) => PhaseOutcome::Built(built),
            Err(e) => {
                error!("FAILED: building {} image {}: {}", phase, name, e);
                PhaseOutcome::Failed(BuildFailure::new(phase, e))
            }
        })
    }

    fn build_with_volumes(&self, phase: Phase, name: String, base: String, script: &[String]) -> PhaseOutcome {
        let request = VolumeBuildRequest {
            name,
            base,
            context: self.context.clone(),
            volumes: self.manifest.build.volumes.clone().unwrap_or_default(),
            script: script.to_vec(),
        };
        match self.client.build_with_volumes(&request) {
            Ok(built) => PhaseOutcome::Built(built),
            Err(e) => {
                error!("FAILED: building {} image {} with volumes: {}", phase, request.name, e);
                PhaseOutcome::Failed(BuildFailure::new(phase, e))
            }
        }
    }

    fn prepare_spec(&self) -> Result<&'a PrepareSpec, PipelineError> {
        let manifest = self.manifest;
        match &manifest.build.prepare {
            Some(prepare) if self.plan.contains(Phase::Prepare) => Ok(prepare),
            _ => Err(PipelineError::NotPlanned(Phase::Prepare)),
        }
    }

    /// Pull the build base; the prepare identity depends on its content.
    fn prepare_identity(&self) -> Result<PrepareIdentity, PipelineError> {
        let base = &self.manifest.build.base;
        self.client.pull(base).map_err(|source| PipelineError::BasePull {
            image: base.clone(),
            source,
        })?;
        PrepareIdentity::for_build(&self.manifest.build, |image| self.client.content_id(image))?
            .ok_or(PipelineError::NotPlanned(Phase::Prepare))
    }

    /// Resolved prepare image, if it is actually present locally.
    fn usable_prepare(&self, identity: &PrepareIdentity) -> Result<Option<String>, PipelineError> {
        match self.resolver.resolve(&self.manifest.appname, identity)? {
            Some(name) if self.client.exists(&name) => Ok(Some(name)),
            Some(name) => {
                warn!("resolved prepare image {} is missing locally, rebuild ...", name);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn build_prepare_image(&mut self, name: String, base: String, prepare: &PrepareSpec) -> Result<PhaseOutcome, PipelineError> {
        let params = InstructionParams {
            base,
            workdir: workdir(),
            copy_list: vec![".".to_string()],
            scripts: prepare.script.clone(),
            build_args: names_of(&prepare.build_arg),
            ..Default::default()
        };
        let context = self.context.clone();
        let outcome = self.build_image(Phase::Prepare, &name, &params, &prepare.build_arg, true, &context)?;
        if let PhaseOutcome::Built(built) = &outcome {
            if let Err(e) = self.client.push(built) {
                warn!("FAILED: docker push {}: {}", built, e);
            }
            self.plan.images.insert(Phase::Prepare, built.clone());
        }
        self.record(Phase::Prepare, &outcome);
        Ok(outcome)
    }

    /// Reuse a shared prepare image or build and push a fresh one.
    #[instrument(skip(self), fields(appname = %self.manifest.appname))]
    pub fn build_prepare(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let prepare = self.prepare_spec()?;
        let identity = self.prepare_identity()?;
        match self.usable_prepare(&identity)? {
            Some(name) => {
                info!("using shared prepare image {}", name);
                self.plan.images.insert(Phase::Prepare, name.clone());
                let outcome = PhaseOutcome::Built(name);
                self.record(Phase::Prepare, &outcome);
                Ok(outcome)
            }
            None => {
                let name = self.resolver.new_image_name(&self.manifest.appname, &identity);
                info!("building prepare image {}", name);
                self.build_prepare_image(name, self.manifest.build.base.clone(), prepare)
            }
        }
    }

    /// Layer the prepare script on top of the current prepare image under a
    /// fresh name. Without a current image this is a plain prepare build.
    #[instrument(skip(self), fields(appname = %self.manifest.appname))]
    pub fn update_prepare(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let prepare = self.prepare_spec()?;
        let identity = self.prepare_identity()?;
        let base = match self.usable_prepare(&identity)? {
            Some(current) => current,
            None => self.manifest.build.base.clone(),
        };
        let name = self.resolver.new_image_name(&self.manifest.appname, &identity);
        info!("updating prepare image {} from {}", name, base);
        self.build_prepare_image(name, base, prepare)
    }

    fn ensure_built(&mut self, phase: Phase) -> Result<PhaseOutcome, PipelineError> {
        if let Some(name) = self.built.get(&phase) {
            return Ok(PhaseOutcome::Built(name.clone()));
        }
        match phase {
            Phase::Prepare => self.build_prepare(),
            Phase::Build => self.build_build(),
            other => Err(PipelineError::NotPlanned(other)),
        }
    }

    /// Build image from the prepare image, or the raw base without one.
    pub fn build_build(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let manifest = self.manifest;
        let build = &manifest.build;
        let base = if self.plan.contains(Phase::Prepare) {
            match self.ensure_built(Phase::Prepare)? {
                PhaseOutcome::Built(name) => name,
                failed => return Ok(failed),
            }
        } else {
            build.base.clone()
        };
        let name = self.plan.name(Phase::Build)?;

        let outcome = if build.volumes.is_some() {
            self.build_with_volumes(Phase::Build, name, base, &build.script)
        } else {
            let params = InstructionParams {
                base,
                workdir: workdir(),
                copy_list: vec![".".to_string()],
                scripts: build.script.clone(),
                build_args: build.build_arg_names(),
                ..Default::default()
            };
            self.build_image(Phase::Build, &name, &params, &build.build_arg, true, &self.context)?
        };
        self.record(Phase::Build, &outcome);
        Ok(outcome)
    }

    /// Release image: a retag of the build image, or the copy list staged on
    /// the host and laid over the destination base.
    pub fn build_release(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let build_image = match self.ensure_built(Phase::Build)? {
            PhaseOutcome::Built(name) => name,
            failed => return Ok(failed),
        };
        let manifest = self.manifest;
        let release = &manifest.release;
        let name = self.plan.name(Phase::Release)?;
        let mut intermediates = Vec::new();

        let script_inter = if release.script.is_empty() {
            build_image
        } else {
            let params = InstructionParams {
                base: build_image,
                workdir: workdir(),
                scripts: release.script.clone(),
                build_args: manifest.build.build_arg_names(),
                ..Default::default()
            };
            let inter = self.plan.image_name(Phase::ScriptInter);
            match self.build_image(Phase::ScriptInter, &inter, &params, &manifest.build.build_arg, true, &self.context)? {
                PhaseOutcome::Built(built) => {
                    intermediates.push(built.clone());
                    built
                }
                PhaseOutcome::Failed(failure) => {
                    return Ok(PhaseOutcome::Failed(BuildFailure::new(
                        Phase::Release,
                        format!("release script: {}", failure.reason),
                    )))
                }
            }
        };

        let volumes = manifest.build.volumes.clone().unwrap_or_default();
        let outcome = if release.dest_base.is_empty() && volumes.is_empty() {
            match self.client.tag(&script_inter, &name) {
                Ok(()) => Ok(PhaseOutcome::Built(name)),
                Err(e) => {
                    error!("FAILED: docker tag {} {}: {}", script_inter, name, e);
                    Ok(PhaseOutcome::Failed(BuildFailure::new(Phase::Release, e)))
                }
            }
        } else {
            let (dest_base, copies) = if release.dest_base.is_empty() {
                let copies = volumes
                    .iter()
                    .map(|v| CopyEntry::same(v.as_str()))
                    .chain(std::iter::once(CopyEntry::same(DOCKER_APP_ROOT)))
                    .collect();
                (script_inter.clone(), copies)
            } else {
                (release.dest_base.clone(), release.copy.clone())
            };
            self.stage_release(&name, &script_inter, dest_base, copies, volumes)
        };

        // intermediates go even when staging errors out
        for image in &intermediates {
            if let Err(e) = self.client.remove_image(image) {
                warn!("cannot remove intermediate image {}: {}", image, e);
            }
        }
        let outcome = outcome?;
        self.record(Phase::Release, &outcome);
        Ok(outcome)
    }

    /// Staging directory lives until this returns.
    fn stage_release(
        &self,
        name: &str,
        image: &str,
        dest_base: String,
        copies: Vec<CopyEntry>,
        volumes: Vec<String>,
    ) -> Result<PhaseOutcome, PipelineError> {
        let staging = tempfile::Builder::new().prefix("lain-release-").tempdir()?;
        let request = CopyRequest {
            image: image.to_string(),
            copies,
            dest: staging.path().to_path_buf(),
            context: self.context.clone(),
            volumes,
        };
        if let Err(e) = self.client.copy_to_host(&request) {
            error!("FAILED: copying release files out of {}: {}", image, e);
            return Ok(PhaseOutcome::Failed(BuildFailure::new(Phase::Release, e)));
        }
        let params = InstructionParams {
            base: dest_base,
            workdir: workdir(),
            copy_list: vec![".".to_string()],
            ..Default::default()
        };
        self.build_image(Phase::Release, name, &params, &[], true, staging.path())
    }

    /// Runs the test script on the build image, never from cache.
    pub fn build_test(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let build_image = match self.ensure_built(Phase::Build)? {
            PhaseOutcome::Built(name) => name,
            failed => return Ok(failed),
        };
        let manifest = self.manifest;
        let test = &manifest.test;
        let name = self.plan.name(Phase::Test)?;
        let outcome = if self.manifest.build.volumes.is_some() {
            self.build_with_volumes(Phase::Test, name, build_image, &test.script)
        } else {
            let params = InstructionParams {
                base: build_image,
                workdir: workdir(),
                scripts: test.script.clone(),
                ..Default::default()
            };
            self.build_image(Phase::Test, &name, &params, &[], false, &self.context)?
        };
        let outcome = match outcome {
            PhaseOutcome::Built(name) => {
                info!("Tests Passed");
                PhaseOutcome::Built(name)
            }
            PhaseOutcome::Failed(failure) => {
                error!("Tests Fail");
                PhaseOutcome::Failed(BuildFailure::new(Phase::Test, format!("tests fail: {}", failure.reason)))
            }
        };
        self.record(Phase::Test, &outcome);
        Ok(outcome)
    }

    /// Empty-base image carrying the manifest annotations as labels.
    pub fn build_meta(&mut self) -> Result<PhaseOutcome, PipelineError> {
        let name = self.plan.name(Phase::Meta)?;
        let annotations = serde_json::to_string(&self.manifest.annotations())?;
        let mut labels = BTreeMap::from([
            (APPNAME_LABEL.to_string(), self.manifest.appname.clone()),
            (ANNOTATIONS_LABEL.to_string(), STANDARD.encode(annotations)),
        ]);
        if let Some(version) = &self.manifest.meta_version {
            labels.insert(META_VERSION_LABEL.to_string(), version.clone());
        }
        let params = InstructionParams {
            base: META_BASE.to_string(),
            labels,
            ..Default::default()
        };
        let outcome = self.build_image(Phase::Meta, &name, &params, &[], true, &self.context)?;
        self.record(Phase::Meta, &outcome);
        Ok(outcome)
    }

    /// Every planned phase in order, stopping at the first failure.
    #[instrument(skip(self), fields(appname = %self.manifest.appname))]
    pub fn run_all(mut self) -> Result<BuildReport, PipelineError> {
        let manifest_hash = self.manifest.digest()?;
        let meta_version = self.manifest.meta_version.clone();
        let build_hash = compute_build_hash(
            &self.manifest.appname,
            meta_version.as_deref().unwrap_or_default(),
            &manifest_hash,
            ENGINE_VERSION,
        );

        let mut failure = None;
        for phase in self.plan.phases() {
            let outcome = match phase {
                Phase::Prepare => self.ensure_built(Phase::Prepare)?,
                Phase::Build => self.ensure_built(Phase::Build)?,
                Phase::Release => self.build_release()?,
                Phase::Test => self.build_test()?,
                Phase::Meta => self.build_meta()?,
                other => return Err(PipelineError::NotPlanned(other)),
            };
            if let PhaseOutcome::Failed(f) = outcome {
                error!("{}", f);
                failure = Some(f);
                break;
            }
        }

        Ok(BuildReport {
            id: Uuid::new_v4().to_string(),
            appname: self.manifest.appname.clone(),
            meta_version,
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            manifest_hash,
            build_hash,
            images: self.built,
            failure,
        })
    }
}

fn names_of(build_args: &[String]) -> Vec<String> {
    build_args
        .iter()
        .map(|arg| arg.split('=').next().unwrap_or_default().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::ScriptInter.to_string(), "script_inter");
        assert_eq!(Phase::Test.template(), TemplateKind::Build);
        assert_eq!(Phase::Release.template(), TemplateKind::Release);
        assert_eq!(serde_json::to_string(&Phase::CopyInter).unwrap(), "\"copy_inter\"");
    }

    #[test]
    fn test_workdir_and_names() {
        assert_eq!(workdir(), "/lain/app/");
        assert_eq!(names_of(&["A=1".to_string(), "B".to_string()]), vec!["A", "B"]);
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = PhaseOutcome::Failed(BuildFailure::new(Phase::Test, "tests fail"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"status": "failed", "value": {"phase": "test", "reason": "tests fail"}})
        );
        assert_eq!(PhaseOutcome::Built("a:b".into()).image(), Some("a:b"));
    }
}
