use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use fs4::FileExt;
use tracing::warn;

use cask_domain::Error;

static HELD: OnceLock<Mutex<HashMap<PathBuf, Weak<LockFile>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<LockFile>>> {
    HELD.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    file: File,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), %err, "failed to unlock repo sentinel");
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Scoped, exclusive, cross-process advisory write lock over the repo.
///
/// The guard holds an exclusive range lock on a sentinel file; dropping the
/// last guard releases the lock and removes the sentinel. Acquiring again
/// while this process already holds the lock returns a second guard over
/// the same sentinel instead of contending with itself.
#[derive(Debug)]
pub struct RepoLock {
    _inner: Arc<LockFile>,
}

impl RepoLock {
    /// Acquire the lock at `path`.
    ///
    /// Fails with [`Error::LockContended`] when another process holds the
    /// lock and [`Error::Io`] when the sentinel cannot be created.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let mut held = registry().lock().expect("lock registry poisoned");
        if let Some(inner) = held.get(path).and_then(Weak::upgrade) {
            return Ok(Self { _inner: inner });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::Io(format!("failed to create {}: {err}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(path)
            .map_err(|err| {
                Error::Io(format!(
                    "failed to create lock file {}: {err}",
                    path.display()
                ))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Err(Error::LockContended),
            Err(err) => {
                return Err(Error::Io(format!(
                    "failed to lock {}: {err}",
                    path.display()
                )))
            }
        }

        let inner = Arc::new(LockFile {
            path: path.to_path_buf(),
            file,
        });
        held.insert(path.to_path_buf(), Arc::downgrade(&inner));
        Ok(Self { _inner: inner })
    }
}
