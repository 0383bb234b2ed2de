//! Shared prepare-image cache resolution against a recording image client.

mod common;

use pretty_assertions::assert_eq;

use common::{Call, FakeImageClient, REGISTRY};
use lainbuild_core::cache::{CacheError, InProcessLease, LeasedResolver, PrepareIdentity, PrepareResolver, SharedPrepareCache};
use lainbuild_core::{prepare_script_hash, ClusterConfig};

fn config() -> ClusterConfig {
    ClusterConfig::default().with_registry(REGISTRY)
}

fn v1() -> PrepareIdentity {
    PrepareIdentity::Versioned { version: "v1".into() }
}

fn full(tag: &str) -> String {
    format!("{}/hello:{}", REGISTRY, tag)
}

#[test]
fn test_remote_newer_is_pulled() {
    let client = FakeImageClient::new().with_tags(&["prepare-v1-100"], &["prepare-v1-200"]);
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    let resolved = cache.resolve("hello", &v1()).unwrap();
    assert_eq!(resolved, Some(full("prepare-v1-200")));
    assert_eq!(client.pulls(), vec![full("prepare-v1-200")]);
    assert!(client.pushes().is_empty());
}

#[test]
fn test_local_newer_is_pushed() {
    let client = FakeImageClient::new().with_tags(&["prepare-v1-300"], &["prepare-v1-200"]);
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    let resolved = cache.resolve("hello", &v1()).unwrap();
    assert_eq!(resolved, Some(full("prepare-v1-300")));
    assert_eq!(client.pushes(), vec![full("prepare-v1-300")]);
    assert!(client.pulls().is_empty());
}

#[test]
fn test_equal_timestamps_use_local() {
    let client = FakeImageClient::new().with_tags(&["prepare-v1-200"], &["prepare-v1-200"]);
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &v1()).unwrap(), Some(full("prepare-v1-200")));
    assert!(client.pulls().is_empty());
    assert!(client.pushes().is_empty());
}

#[test]
fn test_neither_store_means_rebuild() {
    let client = FakeImageClient::new().with_tags(&["release-1-abc"], &["prepare-v2-500"]);
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &v1()).unwrap(), None);
    assert!(client.pulls().is_empty());
    assert!(client.pushes().is_empty());
}

#[test]
fn test_latest_of_many_tags() {
    let client = FakeImageClient::new().with_tags(
        &[],
        &["prepare-v1-100", "prepare-v1-900", "prepare-v1-50", "prepare-v10-1000", "prepare-v1-x"],
    );
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &v1()).unwrap(), Some(full("prepare-v1-900")));
}

#[test]
fn test_failed_pull_is_fatal() {
    let mut client = FakeImageClient::new().with_tags(&[], &["prepare-v1-200"]);
    client.fail_pulls = vec![full("prepare-v1-200")];
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    let err = cache.resolve("hello", &v1()).unwrap_err();
    assert!(matches!(err, CacheError::PrepareFetch { ref image, .. } if *image == full("prepare-v1-200")));
    assert!(err.to_string().contains("remote prepare fetching failed"));
}

#[test]
fn test_failed_push_is_a_warning() {
    let mut client = FakeImageClient::new().with_tags(&["prepare-v1-200"], &[]);
    client.fail_push = true;
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &v1()).unwrap(), Some(full("prepare-v1-200")));
    assert_eq!(client.pushes(), vec![full("prepare-v1-200")]);
}

#[test]
fn test_unreachable_registry_counts_as_empty() {
    let mut client = FakeImageClient::new().with_tags(&["prepare-v1-200"], &["prepare-v1-900"]);
    client.remote_unreachable = true;
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &v1()).unwrap(), Some(full("prepare-v1-200")));
    assert!(client.pulls().is_empty());
}

#[test]
fn test_auto_identity_tags() {
    let script = vec!["( make deps )".to_string()];
    let identity = PrepareIdentity::Auto {
        base_id: "0123456789ab".into(),
        script_hash: prepare_script_hash("golang", &script),
    };
    let current = format!("prepare-500-0123456789ab-{}", prepare_script_hash("golang", &script));
    let client = FakeImageClient::new().with_tags(
        &[current.as_str(), "prepare-900-0123456789ab-0000000000000000"],
        &[current.as_str()],
    );
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    assert_eq!(cache.resolve("hello", &identity).unwrap(), Some(full(&current)));
}

#[test]
fn test_fingerprint_is_deterministic() {
    let script = vec!["( make deps )".to_string(), "( ls -1 | xargs rm -rf )".to_string()];
    let first = prepare_script_hash("golang", &script);
    assert_eq!(first, prepare_script_hash("golang", &script));
    assert_eq!(first.len(), 16);
    assert_ne!(first, prepare_script_hash("golang:1.8", &script));
    assert_ne!(first, prepare_script_hash("golang", &script[..1]));
}

#[test]
fn test_new_image_name() {
    let client = FakeImageClient::new();
    let cache = SharedPrepareCache::new(&client, &config()).unwrap();

    let name = cache.new_image_name("hello", &v1());
    let timestamp = name.strip_prefix(&full("prepare-v1-")).unwrap();
    assert!(!timestamp.is_empty() && timestamp.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(v1().timestamp_of(name.rsplit_once(':').unwrap().1), timestamp.parse::<i64>().ok());
}

#[test]
fn test_requires_registry() {
    let client = FakeImageClient::new();
    assert!(matches!(
        SharedPrepareCache::new(&client, &ClusterConfig::default()),
        Err(CacheError::NoRegistry)
    ));
}

#[test]
fn test_leased_resolver_delegates() {
    let client = FakeImageClient::new().with_tags(&["prepare-v1-100"], &["prepare-v1-200"]);
    let resolver = LeasedResolver::new(SharedPrepareCache::new(&client, &config()).unwrap(), InProcessLease::default());

    assert_eq!(resolver.resolve("hello", &v1()).unwrap(), Some(full("prepare-v1-200")));
    assert!(client.calls().contains(&Call::Pull(full("prepare-v1-200"))));
    assert!(resolver.new_image_name("hello", &v1()).starts_with(&full("prepare-v1-")));
}
