//! Post-install cache generation.
//!
//! App layers get a per-commit cache directory (dynamic linker cache,
//! fontconfig cache) generated by external tools running inside a
//! transient sandbox. The sandbox runtime is a collaborator behind
//! [`CacheRunner`]; the default implementation shells out to the
//! configured container runner.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::error;

use cask_domain::{FuzzyReference, Module, Reference};
use cask_repo::{Repo, ResolveScope};

use crate::transaction::Transaction;

const CACHE_DEST: &str = "/run/cask/cache";
const FONT_CACHE_DEST: &str = "/var/cache/fontconfig";
const GENERATOR_DEST: &str = "/run/cask/generator";
const DEFAULT_GENERATOR_DIR: &str = "/usr/libexec/cask";
const DEFAULT_SANDBOX_RUNNER: &str = "cask-box";

/// Everything the sandbox needs to run the cache generators for one layer.
#[derive(Debug, Clone)]
pub struct CacheSpec {
    pub app_id: String,
    pub arch: String,
    /// Host directory mounted read-write at the cache destination.
    pub cache_dir: PathBuf,
    /// Host directory mounted read-write at the fontconfig cache.
    pub font_cache_dir: PathBuf,
    /// Host directory with the generator binaries, mounted read-only.
    pub generator_dir: PathBuf,
    pub app_dir: PathBuf,
    pub runtime_dir: Option<PathBuf>,
    pub base_dir: PathBuf,
}

/// Runs the cache generators inside a transient container.
pub trait CacheRunner: Send + Sync {
    fn generate(&self, spec: &CacheSpec) -> Result<()>;
}

/// Production runner: executes the sandbox runtime as a child process.
pub struct CommandCacheRunner {
    program: PathBuf,
}

impl CommandCacheRunner {
    #[must_use]
    pub fn from_env() -> Self {
        let program = env::var_os("CASK_SANDBOX_RUNNER")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SANDBOX_RUNNER));
        Self { program }
    }
}

impl CacheRunner for CommandCacheRunner {
    fn generate(&self, spec: &CacheSpec) -> Result<()> {
        let script = format!(
            "{GENERATOR_DEST}/ld-cache-generator {CACHE_DEST} {id} {arch}; \
             {GENERATOR_DEST}/font-cache-generator {CACHE_DEST} {id}",
            id = spec.app_id,
            arch = spec.arch,
        );

        let mut command = Command::new(&self.program);
        command
            .arg("run")
            .arg("--bind")
            .arg(format!("{}:{CACHE_DEST}:rw", spec.cache_dir.display()))
            .arg("--bind")
            .arg(format!(
                "{}:{FONT_CACHE_DEST}:rw",
                spec.font_cache_dir.display()
            ))
            .arg("--bind")
            .arg(format!(
                "{}:{GENERATOR_DEST}:ro",
                spec.generator_dir.display()
            ))
            .arg("--app")
            .arg(&spec.app_dir)
            .arg("--base")
            .arg(&spec.base_dir);
        if let Some(runtime_dir) = &spec.runtime_dir {
            command.arg("--runtime").arg(runtime_dir);
        }
        command.arg("--").arg("/bin/sh").arg("-c").arg(script);

        let output = command
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("cache generation failed: {stderr}");
        }
        Ok(())
    }
}

fn generator_dir() -> PathBuf {
    env::var_os("CASK_GENERATOR_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GENERATOR_DIR))
}

fn dependency_dir(
    repo: &Repo,
    declared: &str,
    sub_ref: Option<&str>,
) -> Result<PathBuf> {
    let fuzzy = FuzzyReference::parse(declared)?;
    let reference = repo.clear_reference(&fuzzy, ResolveScope::Local, None)?;
    let dir = match sub_ref {
        // Minified variants have no merged view; use the tagged layer.
        Some(sub_ref) => repo.layer_dir(&reference, Some(&Module::binary()), Some(sub_ref))?,
        None => repo.merged_module_dir(&reference)?,
    };
    Ok(dir)
}

/// Generate the caches for `reference`. On failure the partially written
/// cache directory is removed again.
pub fn generate_cache(repo: &Repo, runner: &dyn CacheRunner, reference: &Reference) -> Result<()> {
    let item = repo.layer_item(reference)?;
    let cache_dir = repo.layout().layer_cache_dir(&item.commit);
    let font_cache_dir = cache_dir.join("fontconfig");
    fs::create_dir_all(&font_cache_dir)
        .with_context(|| format!("failed to create {}", font_cache_dir.display()))?;

    let mut tx = Transaction::new();
    {
        let cache_dir = cache_dir.clone();
        tx.add_rollback(move || {
            if let Err(err) = fs::remove_dir_all(&cache_dir) {
                error!(path = %cache_dir.display(), %err, "failed to clean cache directory");
            }
        });
    }

    let info = &item.info;
    let runtime_dir = info
        .runtime
        .as_deref()
        .map(|declared| dependency_dir(repo, declared, info.uuid.as_deref()))
        .transpose()
        .context("failed to locate runtime layer for cache generation")?;
    let base_dir = dependency_dir(repo, &info.base, info.uuid.as_deref())
        .context("failed to locate base layer for cache generation")?;

    let spec = CacheSpec {
        app_id: reference.id.clone(),
        arch: reference.arch.as_str().to_string(),
        cache_dir,
        font_cache_dir,
        generator_dir: generator_dir(),
        app_dir: repo.merged_module_dir(reference)?,
        runtime_dir,
        base_dir,
    };
    runner.generate(&spec)?;

    tx.commit();
    Ok(())
}

/// Remove the generated caches of `reference`, if any.
pub fn remove_cache(repo: &Repo, reference: &Reference) -> Result<()> {
    let item = repo.layer_item(reference)?;
    let cache_dir = repo.layout().layer_cache_dir(&item.commit);
    if cache_dir.exists() {
        fs::remove_dir_all(&cache_dir)
            .with_context(|| format!("failed to remove {}", cache_dir.display()))?;
    }
    Ok(())
}

/// Remove the caches of a layer that is already gone from the index.
pub fn remove_cache_by_commit(repo: &Repo, commit: &str) {
    let cache_dir = repo.layout().layer_cache_dir(commit);
    if cache_dir.exists() {
        if let Err(err) = fs::remove_dir_all(&cache_dir) {
            error!(path = %cache_dir.display(), %err, "failed to remove cache directory");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records cache generation requests and writes a marker file so tests
    /// can observe which cache directories exist.
    pub struct RecordingCacheRunner {
        pub generated: Mutex<Vec<String>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingCacheRunner {
        pub fn new() -> Self {
            Self {
                generated: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            }
        }
    }

    impl CacheRunner for RecordingCacheRunner {
        fn generate(&self, spec: &CacheSpec) -> Result<()> {
            if *self.fail.lock().unwrap() {
                bail!("cache generator exploded");
            }
            std::fs::write(spec.cache_dir.join("ld.so.cache"), b"cache")?;
            self.generated.lock().unwrap().push(spec.app_id.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn generator_dir_defaults_without_env() {
        // Only meaningful when the variable is unset in the test runner.
        if env::var_os("CASK_GENERATOR_DIR").is_none() {
            assert_eq!(generator_dir(), Path::new(DEFAULT_GENERATOR_DIR));
        }
    }
}
