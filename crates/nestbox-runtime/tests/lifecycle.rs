//! Lifecycle tests against a scripted stand-in for enroot.

mod common;

use common::FakeEnroot;
use nestbox_runtime::{
    Container, ContainerOptions, ContainerState, ImageCache, ImageReference, Phase, RuntimeError,
    StartOptions, CONTAINER_PREFIX,
};
use std::path::Path;
use std::time::Duration;

const T: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_import_then_cache_hit() {
    let fake = FakeEnroot::new();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://python:3.11-slim").unwrap();

    let first = cache.ensure_imported(&fake.enroot(), &image, T).await.unwrap();
    let second = cache.ensure_imported(&fake.enroot(), &image, T).await.unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(fake.imports(), ["docker://python:3.11-slim"]);
    assert_eq!(cache.cached_images().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_imports_publish_one_artifact() {
    let fake = FakeEnroot::new();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://alpine:3.19").unwrap();
    let enroot = fake.enroot();

    let (a, b) = tokio::join!(
        cache.ensure_imported(&enroot, &image, T),
        cache.ensure_imported(&enroot, &image, T)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.path, b.path);

    let contents = std::fs::read_to_string(&a.path).unwrap();
    assert_eq!(contents.trim(), "squashfs:docker://alpine:3.19");
    // Only the published artifact remains; temp files are gone.
    assert_eq!(std::fs::read_dir(cache.root()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_import_failure_reports_cause() {
    let fake = FakeEnroot::new();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://invalid/image").unwrap();

    let err = cache
        .ensure_imported(&fake.enroot(), &image, T)
        .await
        .unwrap_err();
    match err {
        RuntimeError::Import { image, reason } => {
            assert_eq!(image, "docker://invalid/image");
            assert!(reason.contains("manifest unknown"), "reason: {reason}");
        }
        other => panic!("expected import error, got {other:?}"),
    }
    assert!(cache.cached_images().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(cache.root()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_import_timeout_removes_partial() {
    let fake = FakeEnroot::new();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://slow/image").unwrap();

    let err = cache
        .ensure_imported(&fake.enroot(), &image, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert_eq!(err.timeout_phase(), Some(Phase::Import));
    assert_eq!(std::fs::read_dir(cache.root()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_create_start_destroy() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://ubuntu:22.04").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let options = ContainerOptions {
        writable: true,
        root: true,
    };
    let mut container = Container::create(&enroot, &artifact.path, options, T)
        .await
        .unwrap();
    assert!(container.name().starts_with(CONTAINER_PREFIX));
    assert_eq!(container.state(), ContainerState::Ready);
    assert_eq!(fake.containers(), [container.name()]);

    let start = container.start_options(vec![("GREETING".into(), "hi".into())]);
    let output = enroot
        .start(container.name(), &start, ["sh", "-c", "echo $GREETING"], T)
        .run()
        .await
        .unwrap();
    assert_eq!(output.stdout, "hi\n");
    assert_eq!(fake.last_start(container.name()).as_deref(), Some("rw=1 root=1"));

    container.destroy(&enroot, T).await.unwrap();
    assert_eq!(container.state(), ContainerState::Removed);
    assert!(fake.containers().is_empty());

    // Second destroy is a no-op.
    container.destroy(&enroot, T).await.unwrap();
}

#[tokio::test]
async fn test_destroy_tolerates_externally_removed_container() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://ubuntu:22.04").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let mut container = Container::create(&enroot, &artifact.path, ContainerOptions::default(), T)
        .await
        .unwrap();
    let out = enroot.remove(container.name(), T).run().await.unwrap();
    assert!(out.success());

    container.destroy(&enroot, T).await.unwrap();
    assert_eq!(container.state(), ContainerState::Removed);
}

#[tokio::test]
async fn test_failed_create_is_unwound() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://nocreate/image").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let err = Container::create(&enroot, &artifact.path, ContainerOptions::default(), T)
        .await
        .unwrap_err();
    match err {
        RuntimeError::Create { name, reason } => {
            assert!(name.starts_with(CONTAINER_PREFIX));
            assert!(reason.contains("No space left"), "reason: {reason}");
        }
        other => panic!("expected create error, got {other:?}"),
    }
    assert!(fake.containers().is_empty());
}

#[tokio::test]
async fn test_unpack_file_exists_is_unwound_not_retried() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://clash/image").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let err = Container::create(&enroot, &artifact.path, ContainerOptions::default(), T)
        .await
        .unwrap_err();
    match err {
        RuntimeError::Create { reason, .. } => {
            assert!(reason.contains("File exists"), "reason: {reason}");
        }
        other => panic!("expected create error, got {other:?}"),
    }
    assert!(fake.containers().is_empty());
}

#[tokio::test]
async fn test_name_collision_leaves_existing_container() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://ubuntu:22.04").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let _existing =
        Container::create_named(&enroot, "nestbox-taken", &artifact.path, ContainerOptions::default(), T)
            .await
            .unwrap();
    let err =
        Container::create_named(&enroot, "nestbox-taken", &artifact.path, ContainerOptions::default(), T)
            .await
            .unwrap_err();
    assert!(matches!(err, RuntimeError::NameInUse(ref n) if n == "nestbox-taken"));
    assert_eq!(fake.containers(), ["nestbox-taken"]);
}

#[tokio::test]
async fn test_create_from_missing_artifact() {
    let fake = FakeEnroot::new();
    let err = Container::create(
        &fake.enroot(),
        Path::new("/nonexistent/image.sqsh"),
        ContainerOptions::default(),
        T,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RuntimeError::Create { .. }));
    assert!(fake.containers().is_empty());
}

#[tokio::test]
async fn test_list_by_prefix() {
    let fake = FakeEnroot::new();
    let enroot = fake.enroot();
    let cache = ImageCache::new(fake.cache_dir());
    let image = ImageReference::new("docker://ubuntu:22.04").unwrap();
    let artifact = cache.ensure_imported(&enroot, &image, T).await.unwrap();

    let ours = Container::create(&enroot, &artifact.path, ContainerOptions::default(), T)
        .await
        .unwrap();
    let _foreign =
        Container::create_named(&enroot, "someone-else", &artifact.path, ContainerOptions::default(), T)
            .await
            .unwrap();

    assert_eq!(
        enroot.containers(Some(CONTAINER_PREFIX), T).await.unwrap(),
        [ours.name()]
    );
    assert!(enroot.exists(ours.name(), T).await.unwrap());
    assert!(!enroot.exists("nestbox-missing", T).await.unwrap());
    assert!(enroot.is_available().await);
}

#[tokio::test]
async fn test_start_in_missing_container_is_reported_by_runtime() {
    let fake = FakeEnroot::new();
    let output = fake
        .enroot()
        .start("nestbox-ghost", &StartOptions::default(), ["true"], T)
        .run()
        .await
        .unwrap();
    assert!(!output.success());
    assert!(output.stderr.starts_with("[ERROR] No such file or directory"));
}
