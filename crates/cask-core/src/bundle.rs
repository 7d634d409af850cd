//! Distributable package files.
//!
//! A `.layer` file is one layer tree packed as a gzipped tarball. A `.uab`
//! bundle carries several layers (`layers/<id>/<module>/`), a
//! `metadata.json` manifest, and optionally embedded signature data under
//! `sign/`. Both are unpacked into a scratch directory that is released on
//! every exit path.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tempfile::TempDir;

use cask_domain::PackageInfo;
use cask_repo::INFO_FILE;

const UAB_METADATA_FILE: &str = "metadata.json";
const UAB_LAYERS_DIR: &str = "layers";
const UAB_SIGN_DIR: &str = "sign";

fn unpack(path: &Path) -> Result<TempDir> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let dir = tempfile::tempdir()?;
    Archive::new(GzDecoder::new(file))
        .unpack(dir.path())
        .with_context(|| format!("failed to unpack {}", path.display()))?;
    Ok(dir)
}

/// An opened, unpacked `.layer` file.
pub struct LayerFile {
    dir: TempDir,
    info: PackageInfo,
}

impl LayerFile {
    pub fn open(path: &Path) -> Result<Self> {
        let dir = unpack(path)?;
        let info_path = dir.path().join(INFO_FILE);
        let contents = std::fs::read_to_string(&info_path)
            .with_context(|| format!("{} carries no layer metadata", path.display()))?;
        let info: PackageInfo = serde_json::from_str(&contents)
            .with_context(|| format!("{} has malformed layer metadata", path.display()))?;
        Ok(Self { dir, info })
    }

    #[must_use]
    pub fn info(&self) -> &PackageInfo {
        &self.info
    }

    /// The unpacked layer tree, valid as long as this value lives.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// One layer slot in a bundle manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UabLayer {
    pub info: PackageInfo,
    /// Minified layers are stripped to what the bundled app needs and are
    /// tagged with the bundle uuid on import.
    #[serde(default)]
    pub minified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UabMetaInfo {
    pub uuid: String,
    pub layers: Vec<UabLayer>,
}

/// An opened, unpacked `.uab` bundle.
pub struct UabFile {
    dir: TempDir,
    meta: UabMetaInfo,
}

impl UabFile {
    pub fn open(path: &Path) -> Result<Self> {
        let dir = unpack(path)?;
        let meta_path = dir.path().join(UAB_METADATA_FILE);
        let contents = std::fs::read_to_string(&meta_path)
            .with_context(|| format!("{} carries no bundle manifest", path.display()))?;
        let meta: UabMetaInfo = serde_json::from_str(&contents)
            .with_context(|| format!("{} has a malformed bundle manifest", path.display()))?;
        Ok(Self { dir, meta })
    }

    #[must_use]
    pub fn meta(&self) -> &UabMetaInfo {
        &self.meta
    }

    /// Verify the bundle: every layer the manifest declares must be
    /// materialized in the unpacked tree.
    pub fn verify(&self) -> Result<()> {
        for layer in &self.meta.layers {
            let dir = self.layer_dir(&layer.info);
            if !dir.join(INFO_FILE).exists() {
                bail!(
                    "bundle manifest declares {}/{} but the layer is missing",
                    layer.info.id,
                    layer.info.module
                );
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn layer_dir(&self, info: &PackageInfo) -> PathBuf {
        self.dir
            .path()
            .join(UAB_LAYERS_DIR)
            .join(&info.id)
            .join(&info.module)
    }

    /// Embedded signature data, staged as an import overlay for the app
    /// layer. Returns `None` when the bundle is unsigned.
    #[must_use]
    pub fn sign_data_dir(&self) -> Option<PathBuf> {
        let dir = self.dir.path().join(UAB_SIGN_DIR);
        dir.is_dir().then_some(dir)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;

    use flate2::{Compression, GzBuilder};
    use tar::Builder;

    use super::*;

    /// Pack `dir` into a gzipped tarball at `dest`.
    pub fn pack(dir: &Path, dest: &Path) -> Result<()> {
        let file = File::create(dest)?;
        let encoder = GzBuilder::new().write(file, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.append_dir_all(".", dir)?;
        builder.into_inner()?.finish()?;
        Ok(())
    }

    /// Author a `.layer` file for `info` with the given payload files.
    pub fn make_layer_file(
        info: &PackageInfo,
        payload: &[(&str, &[u8])],
        dest: &Path,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;
        fs::write(
            staging.path().join(INFO_FILE),
            serde_json::to_string_pretty(info)?,
        )?;
        for (rel, bytes) in payload {
            let path = staging.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)?;
        }
        pack(staging.path(), dest)
    }

    /// Author a `.uab` bundle from `(info, minified, payload)` layer slots.
    pub fn make_uab_file(
        uuid: &str,
        layers: &[(&PackageInfo, bool, &[(&str, &[u8])])],
        signed: bool,
        dest: &Path,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let meta = UabMetaInfo {
            uuid: uuid.to_string(),
            layers: layers
                .iter()
                .map(|(info, minified, _)| UabLayer {
                    info: (*info).clone(),
                    minified: *minified,
                })
                .collect(),
        };
        fs::write(
            staging.path().join(UAB_METADATA_FILE),
            serde_json::to_string_pretty(&meta)?,
        )?;
        for (info, _, payload) in layers {
            let layer_dir = staging
                .path()
                .join(UAB_LAYERS_DIR)
                .join(&info.id)
                .join(&info.module);
            fs::create_dir_all(&layer_dir)?;
            fs::write(
                layer_dir.join(INFO_FILE),
                serde_json::to_string_pretty(info)?,
            )?;
            for (rel, bytes) in *payload {
                let path = layer_dir.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, bytes)?;
            }
        }
        if signed {
            let sign_dir = staging.path().join(UAB_SIGN_DIR);
            fs::create_dir_all(&sign_dir)?;
            fs::write(sign_dir.join("signature"), b"signed")?;
        }
        pack(staging.path(), dest)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use cask_domain::Kind;

    fn info(module: &str) -> PackageInfo {
        PackageInfo {
            kind: Kind::App,
            id: "org.example.editor".into(),
            name: "Editor".into(),
            channel: "stable".into(),
            version: "1.0.0".into(),
            arch: "x86_64".into(),
            module: module.into(),
            base: "org.example.base/23".into(),
            runtime: None,
            uuid: None,
            description: None,
        }
    }

    #[test]
    fn layer_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("editor.layer");
        make_layer_file(
            &info("binary"),
            &[("files/bin/editor", b"#!".as_slice())],
            &path,
        )
        .unwrap();

        let layer = LayerFile::open(&path).unwrap();
        assert_eq!(layer.info().id, "org.example.editor");
        assert!(layer.dir().join("files/bin/editor").exists());
    }

    #[test]
    fn uab_verify_catches_missing_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("editor.uab");
        let app = info("binary");
        let no_payload: &[(&str, &[u8])] = &[];
        make_uab_file("bundle-uuid", &[(&app, false, no_payload)], true, &path).unwrap();

        let uab = UabFile::open(&path).unwrap();
        uab.verify().unwrap();
        assert!(uab.sign_data_dir().is_some());

        // A manifest declaring a layer the tree does not carry fails.
        let broken = dir.path().join("broken.uab");
        let staging = tempfile::tempdir().unwrap();
        let meta = UabMetaInfo {
            uuid: "bundle-uuid".into(),
            layers: vec![UabLayer {
                info: info("binary"),
                minified: false,
            }],
        };
        std::fs::write(
            staging.path().join("metadata.json"),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();
        pack(staging.path(), &broken).unwrap();
        assert!(UabFile::open(&broken).unwrap().verify().is_err());
    }
}
