//! The install / update / uninstall orchestration engine.

mod file;
mod gc;
mod install;
mod jobs;
mod uninstall;
mod update;

use std::sync::Arc;

use anyhow::Result;
use tracing::error;

use cask_domain::api::{CommonResult, InteractionReply, RepoConfig};
use cask_domain::{codes, Error, FuzzyReference, Kind, Module, Reference};
use cask_repo::{containers, Repo, RepoLock, ResolveScope};

use crate::cache::{self, CacheRunner};
use crate::engine::{deferred_gc_interval, TaskEngine, WorkerQueue};
use crate::events::EventSink;
use crate::task::TaskHandle;

pub(crate) struct ManagerInner {
    pub(crate) repo: Arc<Repo>,
    pub(crate) engine: TaskEngine,
    pub(crate) cache_runner: Box<dyn CacheRunner>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) search_queue: WorkerQueue,
    pub(crate) prune_queue: WorkerQueue,
    pub(crate) cache_queue: WorkerQueue,
}

/// The package manager daemon core. RPC methods validate synchronously and
/// either reject with a [`CommonResult`] or hand a task / job to the
/// engine.
pub struct PackageManager {
    inner: Arc<ManagerInner>,
}

impl PackageManager {
    pub fn new(
        repo: Arc<Repo>,
        cache_runner: Box<dyn CacheRunner>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let engine = TaskEngine::new(Arc::clone(&sink));
        let inner = Arc::new(ManagerInner {
            repo,
            engine,
            cache_runner,
            sink,
            search_queue: WorkerQueue::new("cask-search"),
            prune_queue: WorkerQueue::new("cask-prune"),
            cache_queue: WorkerQueue::new("cask-cache"),
        });

        // The ticker must not keep the manager alive; it dies with the
        // engine at shutdown.
        let weak = Arc::downgrade(&inner);
        inner.engine.start_ticker(deferred_gc_interval(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.deferred_gc();
            }
        });

        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    /// Stop the engine: pending interaction waits flush as canceled and the
    /// worker threads join.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }

    /// Route a caller's reply to the task waiting on `object_path`.
    pub fn reply_interaction(&self, object_path: &str, reply: InteractionReply) {
        self.inner.engine.reply_interaction(object_path, reply);
    }

    /// The task owning `object_path`, finished or not.
    #[must_use]
    pub fn task(&self, object_path: &str) -> Option<TaskHandle> {
        self.inner.engine.task(object_path)
    }

    /// Whether the task owning `object_path` still holds its ref-specs.
    #[must_use]
    pub fn is_task_active(&self, object_path: &str) -> bool {
        self.inner.engine.is_active(object_path)
    }

    #[must_use]
    pub fn get_configuration(&self) -> RepoConfig {
        self.inner.repo.config()
    }

    pub fn set_configuration(&self, config: RepoConfig) -> Result<(), CommonResult> {
        let current = self.inner.repo.config();
        if config == current {
            return Ok(());
        }
        if !config.repos.contains_key(&config.default_repo) {
            return Err(CommonResult {
                code: codes::INVALID_ARGS,
                message: "default repository is missing after updating configuration".into(),
                reply_type: Default::default(),
            });
        }
        self.inner
            .repo
            .set_config(config)
            .map_err(|err| reject_message(codes::IO_ERROR, err.to_string()))
    }
}

impl Drop for PackageManager {
    fn drop(&mut self) {
        self.inner.engine.shutdown();
    }
}

impl ManagerInner {
    /// The key the engine uses to serialize writers per reference.
    pub(crate) fn ref_spec(
        &self,
        repo_name: &str,
        reference: &Reference,
        module: &Module,
    ) -> String {
        format!(
            "{}:{}/{}/{}/{}",
            repo_name, reference.channel, reference.id, reference.arch, module
        )
    }

    pub(crate) fn default_repo_name(&self) -> String {
        self.repo.config().default_repo
    }

    /// Whether `reference` is used by a running container. Takes the repo
    /// lock so the answer cannot race a concurrent reap.
    pub(crate) fn is_ref_busy(&self, reference: &Reference) -> Result<bool> {
        let _lock = RepoLock::acquire(&self.repo.layout().lock_file())?;
        Ok(containers::is_ref_busy(
            self.repo.layout().run_root(),
            reference,
        )?)
    }

    /// Resolve the newest remote candidate for an update. Applications may
    /// jump lines, so their pinned version is dropped before resolving;
    /// base and runtime layers only move within their declared line.
    pub(crate) fn latest_remote_reference(
        &self,
        kind: Kind,
        mut fuzzy: FuzzyReference,
    ) -> Result<Reference, Error> {
        if kind == Kind::App {
            fuzzy.version = None;
        }
        self.repo
            .clear_reference(&fuzzy, ResolveScope::Remote, None)
    }

    pub(crate) fn generate_cache(&self, reference: &Reference) -> Result<()> {
        cache::generate_cache(&self.repo, self.cache_runner.as_ref(), reference)
    }

    pub(crate) fn remove_cache(&self, reference: &Reference) {
        if let Err(err) = cache::remove_cache(&self.repo, reference) {
            error!(%reference, %err, "failed to remove cache");
        }
    }
}

/// Synchronous rejection carrying a stable code.
pub(crate) fn reject(err: Error) -> CommonResult {
    CommonResult::from_error(&err)
}

pub(crate) fn reject_message(code: i32, message: impl Into<String>) -> CommonResult {
    CommonResult {
        code,
        message: message.into(),
        reply_type: Default::default(),
    }
}
