use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Copy a directory tree, merging into `dst` and overwriting existing files.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.exists() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Content digest of a directory: sha256 over the sorted relative paths and
/// file contents. Two trees with identical content share a commit id.
pub fn tree_digest(dir: &Path) -> Result<String> {
    let mut entries: Vec<_> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .collect::<walkdir::Result<_>>()
        .with_context(|| format!("failed to walk {}", dir.display()))?;
    entries.retain(|entry| !entry.file_type().is_dir());

    let mut hasher = Sha256::new();
    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir yields children of its root");
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.file_type().is_symlink() {
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
            continue;
        }
        let mut file = fs::File::open(entry.path())
            .with_context(|| format!("failed to open {}", entry.path().display()))?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Total size in bytes of the files under `dir`.
pub fn tree_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_across_copies() -> Result<()> {
        let src = tempfile::tempdir()?;
        fs::create_dir_all(src.path().join("bin"))?;
        fs::write(src.path().join("bin/app"), b"#!/bin/true")?;
        fs::write(src.path().join("info.json"), b"{}")?;

        let dst = tempfile::tempdir()?;
        copy_tree(src.path(), dst.path())?;

        assert_eq!(tree_digest(src.path())?, tree_digest(dst.path())?);
        Ok(())
    }

    #[test]
    fn digest_changes_with_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a"), b"one")?;
        let before = tree_digest(dir.path())?;
        fs::write(dir.path().join("a"), b"two")?;
        assert_ne!(before, tree_digest(dir.path())?);
        Ok(())
    }

    #[test]
    fn copy_merges_overlay_on_top() -> Result<()> {
        let base = tempfile::tempdir()?;
        fs::write(base.path().join("keep"), b"base")?;
        fs::write(base.path().join("shadow"), b"base")?;

        let overlay = tempfile::tempdir()?;
        fs::write(overlay.path().join("shadow"), b"overlay")?;

        let dst = tempfile::tempdir()?;
        copy_tree(base.path(), dst.path())?;
        copy_tree(overlay.path(), dst.path())?;

        assert_eq!(fs::read(dst.path().join("keep"))?, b"base");
        assert_eq!(fs::read(dst.path().join("shadow"))?, b"overlay");
        Ok(())
    }
}
