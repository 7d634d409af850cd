use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cask_domain::api::ContainerStateInfo;
use cask_domain::Reference;

/// Live-container registry: one JSON state file per running sandbox under
/// `<run-root>/<user>/<pid>`.
///
/// The directory is written by the container launcher; this side only
/// reads. Entries whose process is gone are logged and skipped so a
/// crashed launcher cannot pin layers forever.
pub fn running_containers(run_root: &Path) -> Result<Vec<ContainerStateInfo>> {
    let mut result = Vec::new();
    if !run_root.exists() {
        return Ok(result);
    }

    let users = fs::read_dir(run_root)
        .with_context(|| format!("failed to list {}", run_root.display()))?;
    for user_entry in users {
        let user_entry = user_entry?;
        if !user_entry.file_type()?.is_dir() {
            // The lock sentinel lives next to the per-user directories.
            continue;
        }

        let processes = fs::read_dir(user_entry.path())
            .with_context(|| format!("failed to list {}", user_entry.path().display()))?;
        for process_entry in processes {
            let process_entry = process_entry?;
            if !process_entry.file_type()?.is_file() {
                continue;
            }

            let pid = process_entry.file_name();
            let proc_dir = Path::new("/proc").join(&pid);
            if !proc_dir.exists() {
                info!(
                    state_file = %process_entry.path().display(),
                    "ignoring container state, process is gone"
                );
                continue;
            }

            let contents = fs::read_to_string(process_entry.path()).with_context(|| {
                format!(
                    "failed to read container state {}",
                    process_entry.path().display()
                )
            })?;
            match serde_json::from_str::<ContainerStateInfo>(&contents) {
                Ok(state) => result.push(state),
                Err(err) => {
                    warn!(
                        state_file = %process_entry.path().display(),
                        %err,
                        "skipping malformed container state"
                    );
                }
            }
        }
    }

    Ok(result)
}

/// The set of app reference strings currently in use.
pub fn busy_refs(run_root: &Path) -> Result<HashSet<String>> {
    Ok(running_containers(run_root)?
        .into_iter()
        .map(|state| state.app)
        .collect())
}

/// Whether `reference` is used by a running container.
pub fn is_ref_busy(run_root: &Path, reference: &Reference) -> Result<bool> {
    Ok(busy_refs(run_root)?.contains(&reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_state(run_root: &Path, user: &str, pid: u32, app: &str) {
        let dir = run_root.join(user);
        fs::create_dir_all(&dir).unwrap();
        let state = ContainerStateInfo {
            app: app.to_string(),
            pid,
            container_id: Some(format!("c-{pid}")),
        };
        fs::write(
            dir.join(pid.to_string()),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn reports_live_processes_only() {
        let run_root = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        write_state(run_root.path(), "1000", own_pid, "stable:org.example.editor/1.0.0/x86_64");
        // A pid far beyond pid_max never has a /proc entry.
        write_state(run_root.path(), "1000", 999_999_999, "stable:org.example.gone/1.0.0/x86_64");

        let running = running_containers(run_root.path()).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, own_pid);

        let busy = busy_refs(run_root.path()).unwrap();
        assert!(busy.contains("stable:org.example.editor/1.0.0/x86_64"));
        assert!(!busy.contains("stable:org.example.gone/1.0.0/x86_64"));
    }

    #[test]
    fn skips_lock_sentinel_and_malformed_states() {
        let run_root = tempfile::tempdir().unwrap();
        fs::write(run_root.path().join("lock"), b"").unwrap();
        let dir = run_root.path().join("1000");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(std::process::id().to_string()), b"not json").unwrap();

        let running = running_containers(run_root.path()).unwrap();
        assert!(running.is_empty());
    }

    #[test]
    fn missing_run_root_is_empty() {
        let run_root = tempfile::tempdir().unwrap();
        let missing = run_root.path().join("does-not-exist");
        assert!(running_containers(&missing).unwrap().is_empty());
    }
}
