use std::fs;

use tempfile::TempDir;

use cask_domain::{FuzzyReference, Kind, Module, PackageInfo};

use super::*;

struct Fixture {
    _dirs: (TempDir, TempDir),
    repo: Repo,
    remote: DirRemote,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(root.path().join("repo"), root.path().join("run"));
    let remote = DirRemote::new(remote_dir.path());
    let repo = Repo::open(layout, Box::new(remote.clone())).unwrap();
    Fixture {
        _dirs: (root, remote_dir),
        repo,
        remote,
    }
}

fn app_info(id: &str, version: &str, module: &str) -> PackageInfo {
    PackageInfo {
        kind: Kind::App,
        id: id.into(),
        name: id.rsplit('.').next().unwrap_or(id).into(),
        channel: "stable".into(),
        version: version.into(),
        arch: "x86_64".into(),
        module: module.into(),
        base: "org.example.base/23".into(),
        runtime: Some("org.example.runtime/20".into()),
        uuid: None,
        description: None,
    }
}

fn dep_info(id: &str, version: &str, kind: Kind) -> PackageInfo {
    PackageInfo {
        kind,
        id: id.into(),
        name: id.into(),
        channel: "stable".into(),
        version: version.into(),
        arch: "x86_64".into(),
        module: "binary".into(),
        base: String::new(),
        runtime: None,
        uuid: None,
        description: None,
    }
}

fn host_app_info(id: &str, version: &str, module: &str) -> PackageInfo {
    let mut info = app_info(id, version, module);
    info.arch = cask_domain::Architecture::host().as_str().to_string();
    info
}

#[test]
fn pull_makes_layer_available_locally() {
    let fx = fixture();
    let info = app_info("org.example.editor", "1.0.0", "binary");
    let reference = fx
        .remote
        .add_layer(&info, &[("files/bin/editor", b"#!".as_slice())])
        .unwrap();

    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();

    assert_eq!(fx.repo.list_local().len(), 1);
    let dir = fx
        .repo
        .layer_dir(&reference, Some(&Module::binary()), None)
        .unwrap();
    assert!(dir.join(INFO_FILE).exists());
    assert!(dir.join("files/bin/editor").exists());
}

#[test]
fn pull_is_idempotent() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(&app_info("org.example.editor", "1.0.0", "binary"), &[])
        .unwrap();

    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();
    assert_eq!(fx.repo.list_local().len(), 1);
}

#[test]
fn import_layer_dir_applies_overlays_and_sub_ref() {
    let fx = fixture();
    let staged = tempfile::tempdir().unwrap();
    fs::write(
        staged.path().join(INFO_FILE),
        serde_json::to_string(&dep_info("org.example.runtime", "20", Kind::Runtime)).unwrap(),
    )
    .unwrap();
    fs::create_dir_all(staged.path().join("files")).unwrap();
    fs::write(staged.path().join("files/lib.so"), b"elf").unwrap();

    let overlay = tempfile::tempdir().unwrap();
    fs::write(overlay.path().join("signature"), b"sig").unwrap();

    let reference = fx
        .repo
        .import_layer_dir(
            staged.path(),
            &[overlay.path().to_path_buf()],
            Some("bundle-uuid"),
        )
        .unwrap();

    let dir = fx
        .repo
        .layer_dir(&reference, Some(&Module::binary()), Some("bundle-uuid"))
        .unwrap();
    assert!(dir.join("signature").exists());
    assert!(fx
        .repo
        .layer_dir(&reference, Some(&Module::binary()), None)
        .is_err());
}

#[test]
fn remove_deletes_layer_dir_once_unreferenced() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(&app_info("org.example.editor", "1.0.0", "binary"), &[])
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();
    let dir = fx
        .repo
        .layer_dir(&reference, Some(&Module::binary()), None)
        .unwrap();

    fx.repo
        .remove(&reference, &Module::binary(), None)
        .unwrap();
    assert!(!dir.exists());
    assert!(fx.repo.list_local().is_empty());

    // Removing again is an error, not a silent no-op.
    assert!(fx.repo.remove(&reference, &Module::binary(), None).is_err());
}

#[test]
fn clear_reference_local_prefers_latest_version() {
    let fx = fixture();
    for version in ["1.0.0", "1.1.0", "0.9.0"] {
        let reference = fx
            .remote
            .add_layer(&app_info("org.example.editor", version, "binary"), &[])
            .unwrap();
        fx.repo
            .pull(&SilentObserver, &reference, &Module::binary())
            .unwrap();
    }

    let fuzzy = FuzzyReference::parse("org.example.editor").unwrap();
    let resolved = fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::Local, None)
        .unwrap();
    assert_eq!(resolved.version.as_str(), "1.1.0");
}

#[test]
fn clear_reference_falls_back_to_remote() {
    let fx = fixture();
    fx.remote
        .add_layer(&host_app_info("org.example.editor", "2.0.0", "binary"), &[])
        .unwrap();

    let fuzzy = FuzzyReference::parse("org.example.editor").unwrap();
    assert!(fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::Local, None)
        .is_err());

    let resolved = fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::LocalThenRemote, None)
        .unwrap();
    assert_eq!(resolved.version.as_str(), "2.0.0");
}

#[test]
fn remote_resolution_filters_foreign_architectures() {
    let fx = fixture();
    let mut foreign = app_info("org.example.editor", "3.0.0", "binary");
    foreign.arch = "never-such-arch".into();
    fx.remote.add_layer(&foreign, &[]).unwrap();

    let fuzzy = FuzzyReference::parse("org.example.editor").unwrap();
    assert!(fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::Remote, None)
        .is_err());
}

#[test]
fn mark_deleted_hides_reference_from_resolution() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(&app_info("org.example.editor", "1.0.0", "binary"), &[])
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();

    fx.repo
        .mark_deleted(&reference, true, &Module::binary())
        .unwrap();
    let fuzzy = FuzzyReference::parse("org.example.editor").unwrap();
    assert!(fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::Local, None)
        .is_err());

    fx.repo
        .mark_deleted(&reference, false, &Module::binary())
        .unwrap();
    assert!(fx
        .repo
        .clear_reference(&fuzzy, ResolveScope::Local, None)
        .is_ok());
}

#[test]
fn export_replaces_previous_target() {
    let fx = fixture();
    let mut references = Vec::new();
    for version in ["1.0.0", "1.1.0"] {
        let reference = fx
            .remote
            .add_layer(
                &app_info("org.example.editor", version, "binary"),
                &[("entries/editor.desktop", b"[Desktop Entry]".as_slice())],
            )
            .unwrap();
        fx.repo
            .pull(&SilentObserver, &reference, &Module::binary())
            .unwrap();
        references.push(reference);
    }

    fx.repo.export_reference(&references[0]).unwrap();
    assert!(fx.repo.is_exported(&references[0]));

    fx.repo.export_reference(&references[1]).unwrap();
    assert!(fx.repo.is_exported(&references[1]));
    assert!(!fx.repo.is_exported(&references[0]));

    fx.repo.unexport_reference(&references[1]).unwrap();
    assert!(!fx.repo.is_exported(&references[1]));
}

#[test]
fn remote_module_list_keeps_caller_spelling_across_alias() {
    let fx = fixture();
    let info = app_info("org.example.editor", "1.0.0", "binary");
    let reference = fx.remote.add_layer(&info, &[]).unwrap();
    let develop = app_info("org.example.editor", "1.0.0", "develop");
    fx.remote.add_layer(&develop, &[]).unwrap();

    let desired = [
        Module::new("runtime"),
        Module::new("develop"),
        Module::new("debug"),
    ];
    let available = fx.repo.remote_module_list(&reference, &desired).unwrap();
    let names: Vec<_> = available.iter().map(Module::as_str).collect();
    assert_eq!(names, vec!["runtime", "develop"]);
}

#[test]
fn module_list_skips_deleted_and_dedupes_alias() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(&app_info("org.example.editor", "1.0.0", "binary"), &[])
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();

    assert_eq!(fx.repo.module_list(&reference).len(), 1);

    fx.repo
        .mark_deleted(&reference, true, &Module::binary())
        .unwrap();
    assert!(fx.repo.module_list(&reference).is_empty());
}

#[test]
fn prune_reclaims_unreferenced_commits() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(&app_info("org.example.editor", "1.0.0", "binary"), &[])
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();

    // An orphan directory left behind by a crash mid-import.
    let orphan = fx.repo.layout().layer_dir("deadbeef");
    fs::create_dir_all(&orphan).unwrap();
    fs::write(orphan.join("junk"), b"junk").unwrap();

    let summary = fx.repo.prune().unwrap();
    assert_eq!(summary.reclaimed, 1);
    assert!(!orphan.exists());

    let kept = fx
        .repo
        .layer_dir(&reference, Some(&Module::binary()), None)
        .unwrap();
    assert!(kept.exists());
}

#[test]
fn merged_module_dir_combines_modules() {
    let fx = fixture();
    let reference = fx
        .remote
        .add_layer(
            &app_info("org.example.editor", "1.0.0", "binary"),
            &[("files/bin/editor", b"#!".as_slice())],
        )
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::binary())
        .unwrap();
    let develop = app_info("org.example.editor", "1.0.0", "develop");
    fx.remote
        .add_layer(&develop, &[("files/include/editor.h", b"#pragma once".as_slice())])
        .unwrap();
    fx.repo
        .pull(&SilentObserver, &reference, &Module::new("develop"))
        .unwrap();

    fx.repo.merge_modules().unwrap();
    let merged = fx.repo.merged_module_dir(&reference).unwrap();
    assert!(merged.join("files/bin/editor").exists());
    assert!(merged.join("files/include/editor.h").exists());
}

#[test]
fn config_roundtrip() {
    let fx = fixture();
    let mut config = fx.repo.config();
    assert_eq!(config.default_repo, "main");

    config
        .repos
        .insert("mirror".into(), "file:///srv/mirror".into());
    config.default_repo = "mirror".into();
    fx.repo.set_config(config.clone()).unwrap();
    assert_eq!(fx.repo.config(), config);
}
