//! Shared Prepare-Image Cache
//!
//! Prepare images are expensive to build and shared between builds of the
//! same app through the private registry. Each prepare image is keyed by an
//! identity (explicit version, or a fingerprint of base image and script) and
//! carries a timestamp in its tag. Resolution reconciles the newest matching
//! image in the local store with the newest in the remote store, last
//! timestamp wins. There is no locking between concurrent resolvers; wrap a
//! resolver in [`LeasedResolver`] to serialize them per identity.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::ClusterConfig;
use crate::hashing::prepare_script_hash;
use crate::image::{short_id, ImageClient, ImageError, Store};
use crate::manifest::sections::BuildSpec;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote prepare fetching failed: docker pull {image}: {source}")]
    PrepareFetch {
        image: String,
        #[source]
        source: ImageError,
    },

    #[error("private_docker_registry is not configured")]
    NoRegistry,

    #[error("cannot read content id of base image {image}: {source}")]
    BaseImage {
        image: String,
        #[source]
        source: ImageError,
    },

    #[error("prepare lease for {0} was poisoned")]
    LeasePoisoned(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PrepareIdentity {
    /// `prepare-{version}-{timestamp}`
    Versioned { version: String },
    /// `prepare-{timestamp}-{base_id}-{script_hash}`
    Auto { base_id: String, script_hash: String },
}

impl PrepareIdentity {
    /// Identity of the build's prepare image; `None` without a prepare section.
    /// `base_content_id` is only read for unversioned prepare sections.
    pub fn for_build<F>(build: &BuildSpec, base_content_id: F) -> Result<Option<Self>, CacheError>
    where
        F: FnOnce(&str) -> Result<String, ImageError>,
    {
        let Some(prepare) = &build.prepare else {
            return Ok(None);
        };
        if !prepare.is_auto() {
            return Ok(Some(Self::Versioned {
                version: prepare.version.clone(),
            }));
        }
        let id = base_content_id(&build.base).map_err(|source| CacheError::BaseImage {
            image: build.base.clone(),
            source,
        })?;
        Ok(Some(Self::Auto {
            base_id: short_id(&id),
            script_hash: prepare_script_hash(&build.base, &prepare.script),
        }))
    }

    /// Cache key without the timestamp.
    pub fn key(&self) -> String {
        match self {
            Self::Versioned { version } => format!("prepare-{}", version),
            Self::Auto { base_id, script_hash } => format!("prepare-{}-{}", base_id, script_hash),
        }
    }

    pub fn tag_for(&self, timestamp: i64) -> String {
        match self {
            Self::Versioned { version } => format!("prepare-{}-{}", version, timestamp),
            Self::Auto { base_id, script_hash } => {
                format!("prepare-{}-{}-{}", timestamp, base_id, script_hash)
            }
        }
    }

    /// Timestamp of a tag belonging to this identity.
    pub fn timestamp_of(&self, tag: &str) -> Option<i64> {
        let digits = match self {
            Self::Versioned { version } => tag.strip_prefix(&format!("prepare-{}-", version))?,
            Self::Auto { base_id, script_hash } => tag
                .strip_prefix("prepare-")?
                .strip_suffix(&format!("-{}-{}", base_id, script_hash))?,
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImage {
    pub timestamp: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Remote is newer or the only copy.
    PullRemote,
    /// Local is newer or the only copy.
    PushLocal,
    /// Both stores hold the same image.
    UseLocal,
    /// Neither store has one.
    Build,
}

/// Last-timestamp-wins decision between the two stores' newest images.
pub fn reconcile(local: Option<&CachedImage>, remote: Option<&CachedImage>) -> SyncAction {
    match (local, remote) {
        (Some(l), Some(r)) if r.timestamp > l.timestamp => SyncAction::PullRemote,
        (Some(l), Some(r)) if l.timestamp > r.timestamp => SyncAction::PushLocal,
        (Some(_), Some(_)) => SyncAction::UseLocal,
        (None, Some(_)) => SyncAction::PullRemote,
        (Some(_), None) => SyncAction::PushLocal,
        (None, None) => SyncAction::Build,
    }
}

/// Finds a usable prepare image, syncing the stores as a side effect.
pub trait PrepareResolver {
    /// Name of a usable local prepare image, or `None` if one must be built.
    fn resolve(&self, appname: &str, identity: &PrepareIdentity) -> Result<Option<String>, CacheError>;

    /// Fresh, timestamped name for a prepare image about to be built.
    fn new_image_name(&self, appname: &str, identity: &PrepareIdentity) -> String;
}

pub struct SharedPrepareCache<'a, C: ImageClient + ?Sized> {
    client: &'a C,
    registry: String,
}

impl<'a, C: ImageClient + ?Sized> SharedPrepareCache<'a, C> {
    pub fn new(client: &'a C, config: &ClusterConfig) -> Result<Self, CacheError> {
        let registry = config.registry.clone().ok_or(CacheError::NoRegistry)?;
        Ok(Self { client, registry })
    }

    pub fn image_name(&self, appname: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.registry, appname, tag)
    }

    /// Newest image of `identity` in `store`. Unreachable stores count as empty.
    pub fn latest(&self, store: Store, appname: &str, identity: &PrepareIdentity) -> Option<CachedImage> {
        let tags = match self.client.list_tags(store, &self.registry, appname) {
            Ok(tags) => tags,
            Err(e) => {
                warn!("cannot list {} tags of {}/{}: {}", store, self.registry, appname, e);
                return None;
            }
        };
        tags.iter()
            .filter_map(|tag| {
                identity.timestamp_of(tag).map(|timestamp| CachedImage {
                    timestamp,
                    name: self.image_name(appname, tag),
                })
            })
            .max_by_key(|image| image.timestamp)
    }

    fn pull(&self, image: &CachedImage) -> Result<String, CacheError> {
        match self.client.pull(&image.name) {
            Ok(()) => Ok(image.name.clone()),
            Err(source) => {
                error!("FAILED: docker pull {}", image.name);
                Err(CacheError::PrepareFetch {
                    image: image.name.clone(),
                    source,
                })
            }
        }
    }

    fn push(&self, image: &CachedImage) -> String {
        if let Err(e) = self.client.push(&image.name) {
            warn!("FAILED: docker push {}: {}", image.name, e);
        }
        image.name.clone()
    }
}

impl<C: ImageClient + ?Sized> PrepareResolver for SharedPrepareCache<'_, C> {
    #[instrument(skip(self), fields(key = %identity.key()))]
    fn resolve(&self, appname: &str, identity: &PrepareIdentity) -> Result<Option<String>, CacheError> {
        let remote = self.latest(Store::Remote, appname, identity);
        let local = self.latest(Store::Local, appname, identity);

        match (reconcile(local.as_ref(), remote.as_ref()), local, remote) {
            (SyncAction::PullRemote, _, Some(remote)) => {
                info!("found shared prepare image {} at remote", remote.name);
                self.pull(&remote).map(Some)
            }
            (SyncAction::PushLocal, Some(local), _) => {
                info!("found shared prepare image {} at local, syncing to remote", local.name);
                Ok(Some(self.push(&local)))
            }
            (SyncAction::UseLocal, Some(local), _) => {
                info!("shared prepare image {} is in sync", local.name);
                Ok(Some(local.name))
            }
            _ => {
                warn!("found no proper shared prepare image neither at local nor remote, rebuild ...");
                Ok(None)
            }
        }
    }

    fn new_image_name(&self, appname: &str, identity: &PrepareIdentity) -> String {
        self.image_name(appname, &identity.tag_for(Utc::now().timestamp()))
    }
}

/// Mutual exclusion per prepare identity, held while a resolver runs.
pub trait PrepareLease {
    type Guard;

    fn acquire(&self, key: &str) -> Result<Self::Guard, CacheError>;
}

/// Lease shared by resolvers within one process.
#[derive(Debug, Clone, Default)]
pub struct InProcessLease {
    held: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

pub struct InProcessGuard {
    key: String,
    held: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

impl PrepareLease for InProcessLease {
    type Guard = InProcessGuard;

    fn acquire(&self, key: &str) -> Result<InProcessGuard, CacheError> {
        let (lock, released) = &*self.held;
        let mut held = lock
            .lock()
            .map_err(|_| CacheError::LeasePoisoned(key.to_string()))?;
        while held.contains(key) {
            held = released
                .wait(held)
                .map_err(|_| CacheError::LeasePoisoned(key.to_string()))?;
        }
        held.insert(key.to_string());
        Ok(InProcessGuard {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })
    }
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        let (lock, released) = &*self.held;
        if let Ok(mut held) = lock.lock() {
            held.remove(&self.key);
        }
        released.notify_all();
    }
}

/// Runs the wrapped resolver only while holding the identity's lease.
pub struct LeasedResolver<R, L> {
    inner: R,
    lease: L,
}

impl<R: PrepareResolver, L: PrepareLease> LeasedResolver<R, L> {
    pub fn new(inner: R, lease: L) -> Self {
        Self { inner, lease }
    }
}

impl<R: PrepareResolver, L: PrepareLease> PrepareResolver for LeasedResolver<R, L> {
    fn resolve(&self, appname: &str, identity: &PrepareIdentity) -> Result<Option<String>, CacheError> {
        let _guard = self.lease.acquire(&format!("{}/{}", appname, identity.key()))?;
        self.inner.resolve(appname, identity)
    }

    fn new_image_name(&self, appname: &str, identity: &PrepareIdentity) -> String {
        self.inner.new_image_name(appname, identity)
    }
}
