mod common;

use common::init_logging;
use layercake::{layer::Cake, ImageFetcher, LayerId, LocalFetcher, VfsCake};
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn populate(dir: &Path) {
    fs::create_dir_all(dir.join("etc")).unwrap();
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("etc/hostname"), b"cake\n").unwrap();
    fs::write(dir.join("bin/sh"), b"#!not really a shell\n").unwrap();
    std::os::unix::fs::symlink("sh", dir.join("bin/bash")).unwrap();
}

fn layer_count(store: &Path) -> usize {
    match fs::read_dir(store.join("layers")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[test]
fn import_then_reuse() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let source = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        populate(source.path());

        let cake = Arc::new(VfsCake::new(store.path().to_path_buf()));
        let fetcher = LocalFetcher::new(cake.clone(), source.path().to_path_buf());
        let cancel = CancellationToken::new();
        let rootfs = source.path().to_str().unwrap();

        let first = fetcher.fetch(rootfs, 0, &cancel).await.unwrap();
        assert_eq!(first.layer_ids, vec![first.image_id.clone()]);
        assert!(first.env.is_empty());
        assert!(first.volumes.is_empty());

        let path = cake
            .path(&LayerId::DockerImage(first.image_id.clone()))
            .await
            .unwrap();
        assert_eq!(fs::read(path.join("etc/hostname")).unwrap(), b"cake\n");
        assert_eq!(
            fs::read_link(path.join("bin/bash")).unwrap(),
            Path::new("sh")
        );

        let second = fetcher.fetch(rootfs, 0, &cancel).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(layer_count(store.path()), 1);

        let id = fetcher.fetch_id(rootfs).await.unwrap();
        assert_eq!(id.graph_id(), first.image_id);
    })
}

#[test]
fn touching_source_changes_image_id() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let source = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        populate(source.path());

        let cake = Arc::new(VfsCake::new(store.path().to_path_buf()));
        let fetcher = LocalFetcher::new(cake.clone(), source.path().to_path_buf());
        let cancel = CancellationToken::new();
        let rootfs = source.path().to_str().unwrap();

        let before = fetcher.fetch(rootfs, 0, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(source.path().join("new-file"), b"hello").unwrap();
        let after = fetcher.fetch(rootfs, 0, &cancel).await.unwrap();

        assert_ne!(before.image_id, after.image_id);
        assert_eq!(layer_count(store.path()), 2);
        let path = cake
            .path(&LayerId::DockerImage(after.image_id.clone()))
            .await
            .unwrap();
        assert_eq!(fs::read(path.join("new-file")).unwrap(), b"hello");
    })
}

#[test]
fn empty_rootfs_uses_default_and_symlinks_resolve() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let source = tempfile::tempdir().unwrap();
        let links = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        populate(source.path());
        let link = links.path().join("rootfs");
        std::os::unix::fs::symlink(source.path(), &link).unwrap();

        let cake = Arc::new(VfsCake::new(store.path().to_path_buf()));
        let fetcher = LocalFetcher::new(cake, source.path().to_path_buf());
        let cancel = CancellationToken::new();

        let by_default = fetcher.fetch("", 0, &cancel).await.unwrap();
        let by_link = fetcher
            .fetch(link.to_str().unwrap(), 0, &cancel)
            .await
            .unwrap();
        assert_eq!(by_default.image_id, by_link.image_id);
        assert_eq!(layer_count(store.path()), 1);
    })
}

#[test]
fn missing_source_fails() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let store = tempfile::tempdir().unwrap();
        let cake = Arc::new(VfsCake::new(store.path().to_path_buf()));
        let fetcher = LocalFetcher::new(cake, store.path().join("nope"));
        let cancel = CancellationToken::new();
        assert!(fetcher.fetch("", 0, &cancel).await.is_err());
        assert!(fetcher.fetch_id("/definitely/not/here").await.is_err());
    })
}
