use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use cask_domain::api::InteractionReply;
use cask_domain::Error;

use crate::events::EventSink;
use crate::task::{State, TaskHandle, WaitOutcome};

pub const DEFERRED_GC_ENV: &str = "CASK_DEFERRED_GC_SECS";
const DEFERRED_GC_DEFAULT_SECS: u64 = 3600;

/// Deferred-GC interval from the environment; invalid values warn and fall
/// back to the default.
#[must_use]
pub fn deferred_gc_interval() -> Duration {
    let Ok(raw) = std::env::var(DEFERRED_GC_ENV) else {
        return Duration::from_secs(DEFERRED_GC_DEFAULT_SECS);
    };
    match raw.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(err) => {
            warn!(%raw, %err, "failed to parse {DEFERRED_GC_ENV}, using default");
            Duration::from_secs(DEFERRED_GC_DEFAULT_SECS)
        }
    }
}

type Job = Box<dyn FnOnce(&TaskHandle) + Send>;

struct QueuedTask {
    task: TaskHandle,
    job: Job,
}

/// Cooperative task executor.
///
/// One primary thread drains submitted closures in order; at most one
/// active task exists per ref-spec, and conflicting submissions are
/// rejected instead of queued. Interaction replies route back to the
/// waiting task by object path.
pub struct TaskEngine {
    sink: Arc<dyn EventSink>,
    active: Arc<Mutex<HashMap<String, TaskHandle>>>,
    /// Every task ever submitted, by object path, for observation after the
    /// ref-spec is released.
    tasks: Mutex<HashMap<String, TaskHandle>>,
    queue_tx: Mutex<Option<Sender<QueuedTask>>>,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    executor: Mutex<Option<JoinHandle<()>>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (queue_tx, queue_rx) = unbounded::<QueuedTask>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let active: Arc<Mutex<HashMap<String, TaskHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let executor_active = Arc::clone(&active);
        let executor_shutdown = Arc::clone(&shutdown);
        let executor = thread::Builder::new()
            .name("cask-tasks".into())
            .spawn(move || {
                for queued in queue_rx {
                    let QueuedTask { task, job } = queued;
                    if executor_shutdown.load(Ordering::SeqCst) {
                        task.cancel("task engine is shutting down");
                    } else {
                        job(&task);
                        if !task.is_done() && task.state() != State::PartCompleted {
                            // A closure that returns without reaching a final
                            // state counts as finished work.
                            task.update_state(State::Succeed, "done");
                        }
                    }
                    let mut active = executor_active.lock().expect("active tasks poisoned");
                    active.retain(|_, held| held.id() != task.id());
                }
            })
            .expect("failed to spawn task executor");

        Self {
            sink,
            active,
            tasks: Mutex::new(HashMap::new()),
            queue_tx: Mutex::new(Some(queue_tx)),
            shutdown,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            executor: Mutex::new(Some(executor)),
            tickers: Mutex::new(Vec::new()),
        }
    }

    /// Submit a task bound to `ref_specs`.
    ///
    /// Fails with [`Error::Busy`] when another active task holds any of the
    /// specs; conflicting work is rejected, never queued behind.
    pub fn submit(
        &self,
        ref_specs: Vec<String>,
        job: impl FnOnce(&TaskHandle) + Send + 'static,
    ) -> Result<TaskHandle, Error> {
        let mut active = self.active.lock().expect("active tasks poisoned");
        if let Some(spec) = ref_specs.iter().find(|spec| active.contains_key(*spec)) {
            return Err(Error::Busy(spec.clone()));
        }

        let task = TaskHandle::new(ref_specs.clone(), Arc::clone(&self.sink));
        for spec in ref_specs {
            active.insert(spec, task.clone());
        }
        drop(active);
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .insert(task.object_path().to_string(), task.clone());

        let queued = QueuedTask {
            task: task.clone(),
            job: Box::new(job),
        };
        let sent = {
            let queue_tx = self.queue_tx.lock().expect("task queue poisoned");
            match queue_tx.as_ref() {
                Some(tx) => tx.send(queued).is_ok(),
                None => false,
            }
        };
        if !sent {
            task.cancel("task engine is shutting down");
        }
        Ok(task)
    }

    /// Route an interaction reply to the task that owns `object_path`.
    /// Replies for unknown paths are ignored.
    pub fn reply_interaction(&self, object_path: &str, reply: InteractionReply) {
        self.sink.reply_received(&reply);
        let active = self.active.lock().expect("active tasks poisoned");
        let Some(task) = active
            .values()
            .find(|task| task.object_path() == object_path)
        else {
            debug!(object_path, "dropping interaction reply for unknown task");
            return;
        };
        task.deliver(WaitOutcome::Reply(reply));
    }

    /// The task owning `object_path`, finished or not.
    #[must_use]
    pub fn task(&self, object_path: &str) -> Option<TaskHandle> {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.get(object_path).cloned()
    }

    /// Whether the task owning `object_path` still holds its ref-specs.
    #[must_use]
    pub fn is_active(&self, object_path: &str) -> bool {
        let active = self.active.lock().expect("active tasks poisoned");
        active
            .values()
            .any(|task| task.object_path() == object_path)
    }

    /// Start a periodic pass (the deferred-GC timer). The ticker stops when
    /// the engine shuts down.
    pub fn start_ticker(&self, interval: Duration, pass: impl Fn() + Send + 'static) {
        let shutdown_rx = self.shutdown_rx.clone();
        info!(interval_secs = interval.as_secs(), "starting deferred pass ticker");
        let handle = thread::Builder::new()
            .name("cask-deferred".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => pass(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn deferred ticker");
        self.tickers
            .lock()
            .expect("ticker registry poisoned")
            .push(handle);
    }

    /// Stop accepting work, flush pending interaction waits as canceled,
    /// and join the worker threads.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let active = self.active.lock().expect("active tasks poisoned");
            for task in active.values() {
                task.cancel("task engine is shutting down");
            }
        }
        // Closing the channels wakes the executor and every ticker.
        self.queue_tx.lock().expect("task queue poisoned").take();
        self.shutdown_tx.lock().expect("shutdown channel poisoned").take();

        let current = thread::current().id();
        if let Some(executor) = self.executor.lock().expect("executor handle poisoned").take() {
            if executor.thread().id() != current {
                let _ = executor.join();
            }
        }
        let mut tickers = self.tickers.lock().expect("ticker registry poisoned");
        for ticker in tickers.drain(..) {
            if ticker.thread().id() != current {
                let _ = ticker.join();
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A named worker thread draining closures in submission order; the
/// auxiliary queues (search, prune, cache generation) each own one.
pub struct WorkerQueue {
    tx: Option<Sender<Box<dyn FnOnce() + Send>>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerQueue {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send>>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn worker queue");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                warn!("worker queue is gone, dropping job");
            }
        }
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> TaskEngine {
        TaskEngine::new(Arc::new(NullSink))
    }

    #[test]
    fn conflicting_ref_specs_are_rejected() {
        let engine = engine();
        let (hold_tx, hold_rx) = unbounded::<()>();
        let first = engine
            .submit(vec!["main:stable/a/x86_64/binary".into()], move |task| {
                task.update_state(State::Processing, "working");
                let _ = hold_rx.recv();
                task.update_state(State::Succeed, "done");
            })
            .unwrap();

        // Wait for the first task to start running.
        while first.state() == State::Queued {
            thread::sleep(Duration::from_millis(1));
        }

        let second = engine.submit(vec!["main:stable/a/x86_64/binary".into()], |_| {});
        assert!(matches!(second, Err(Error::Busy(_))));

        let other = engine.submit(vec!["main:stable/b/x86_64/binary".into()], |task| {
            task.update_state(State::Succeed, "done");
        });
        assert!(other.is_ok());

        hold_tx.send(()).unwrap();
        while first.state() != State::Succeed {
            thread::sleep(Duration::from_millis(1));
        }

        // The ref-spec frees up once the engine retires the finished task.
        let mut again = engine.submit(vec!["main:stable/a/x86_64/binary".into()], |task| {
            task.update_state(State::Succeed, "done");
        });
        for _ in 0..500 {
            if again.is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
            again = engine.submit(vec!["main:stable/a/x86_64/binary".into()], |task| {
                task.update_state(State::Succeed, "done");
            });
        }
        assert!(again.is_ok());
    }

    #[test]
    fn reply_routes_to_matching_task_only() {
        let engine = engine();
        let task = engine
            .submit(vec!["main:stable/c/x86_64/binary".into()], |task| {
                task.update_state(State::Processing, "waiting");
                match task.request_interaction(
                    cask_domain::api::InteractionMessageType::Upgrade,
                    &Default::default(),
                ) {
                    WaitOutcome::Reply(reply) if reply.accepted() => {
                        task.update_state(State::Succeed, "accepted")
                    }
                    _ => task.update_state(State::Canceled, "declined"),
                }
            })
            .unwrap();

        while task.state() == State::Queued {
            thread::sleep(Duration::from_millis(1));
        }

        // A reply for some other path is ignored.
        engine.reply_interaction(
            "/org/cask/task/other",
            InteractionReply {
                action: "yes".into(),
            },
        );
        assert_eq!(task.state(), State::Processing);

        engine.reply_interaction(
            task.object_path(),
            InteractionReply {
                action: "yes".into(),
            },
        );
        while task.state() == State::Processing {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.state(), State::Succeed);
    }

    #[test]
    fn shutdown_flushes_pending_interaction_as_canceled() {
        let engine = engine();
        let task = engine
            .submit(vec!["main:stable/d/x86_64/binary".into()], |task| {
                task.update_state(State::Processing, "waiting");
                if let WaitOutcome::Canceled = task.request_interaction(
                    cask_domain::api::InteractionMessageType::Upgrade,
                    &Default::default(),
                ) {
                    task.update_state(State::Canceled, "canceled");
                }
            })
            .unwrap();

        while task.state() == State::Queued {
            thread::sleep(Duration::from_millis(1));
        }
        engine.shutdown();
        assert_eq!(task.state(), State::Canceled);
    }

    #[test]
    fn ticker_fires_until_shutdown() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        engine.start_ticker(Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(40));
        engine.shutdown();
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn invalid_deferred_interval_falls_back_to_default() {
        std::env::set_var(DEFERRED_GC_ENV, "not-a-number");
        assert_eq!(
            deferred_gc_interval(),
            Duration::from_secs(DEFERRED_GC_DEFAULT_SECS)
        );
        std::env::set_var(DEFERRED_GC_ENV, "120");
        assert_eq!(deferred_gc_interval(), Duration::from_secs(120));
        std::env::remove_var(DEFERRED_GC_ENV);
    }
}
