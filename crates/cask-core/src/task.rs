use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;
use uuid::Uuid;

use cask_domain::api::{InteractionContext, InteractionMessageType, InteractionReply};
use cask_repo::PullObserver;

use crate::events::EventSink;

/// Coarse task state. `Succeed`, `Failed` and `Canceled` are sticky: once
/// reached, later transitions are ignored. `PartCompleted` marks finished
/// batch items while the task keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Queued,
    Processing,
    Succeed,
    Failed,
    Canceled,
    PartCompleted,
}

impl State {
    #[must_use]
    pub fn is_sticky(self) -> bool {
        matches!(self, Self::Succeed | Self::Failed | Self::Canceled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::PartCompleted => "part-completed",
        }
    }
}

/// Fine-grained progress of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    PreAction,
    InstallApplication,
    InstallRuntime,
    InstallBase,
    PostAction,
    Uninstall,
    AllDone,
    /// Data changed but the user-visible effect is deferred (for example a
    /// running application that must be restarted).
    PackageManagerDone,
}

impl SubState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreAction => "pre-action",
            Self::InstallApplication => "install-application",
            Self::InstallRuntime => "install-runtime",
            Self::InstallBase => "install-base",
            Self::PostAction => "post-action",
            Self::Uninstall => "uninstall",
            Self::AllDone => "all-done",
            Self::PackageManagerDone => "package-manager-done",
        }
    }
}

/// What a blocked interaction wait resolved to.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Reply(InteractionReply),
    Canceled,
}

#[derive(Debug, Clone)]
struct Status {
    state: State,
    sub_state: SubState,
    message: String,
}

pub(crate) struct TaskInner {
    id: Uuid,
    object_path: String,
    ref_specs: Vec<String>,
    status: Mutex<Status>,
    wait_tx: Sender<WaitOutcome>,
    wait_rx: Receiver<WaitOutcome>,
}

/// Observable handle to one task, shared by the engine, the running
/// closure, and callers watching progress.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
    sink: Arc<dyn EventSink>,
}

impl TaskHandle {
    pub(crate) fn new(ref_specs: Vec<String>, sink: Arc<dyn EventSink>) -> Self {
        let id = Uuid::new_v4();
        let (wait_tx, wait_rx) = bounded(1);
        Self {
            inner: Arc::new(TaskInner {
                id,
                object_path: format!("/org/cask/task/{}", id.simple()),
                ref_specs,
                status: Mutex::new(Status {
                    state: State::Queued,
                    sub_state: SubState::PreAction,
                    message: String::new(),
                }),
                wait_tx,
                wait_rx,
            }),
            sink,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn object_path(&self) -> &str {
        &self.inner.object_path
    }

    #[must_use]
    pub fn ref_specs(&self) -> &[String] {
        &self.inner.ref_specs
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.status().state
    }

    #[must_use]
    pub fn sub_state(&self) -> SubState {
        self.status().sub_state
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.status().message
    }

    fn status(&self) -> Status {
        self.inner.status.lock().expect("task status poisoned").clone()
    }

    /// Whether the closure must stop mutating and return. Checked before
    /// and after every suspension point.
    #[must_use]
    pub fn is_done(&self) -> bool {
        let status = self.status();
        status.state.is_sticky() || status.sub_state == SubState::AllDone
    }

    /// Transition the task state. Transitions out of a sticky state are
    /// ignored; sticky states pin the sub-state to `AllDone`.
    pub fn update_state(&self, state: State, message: impl Into<String>) {
        let mut status = self.inner.status.lock().expect("task status poisoned");
        if status.state.is_sticky() {
            debug!(
                task = %self.inner.object_path,
                current = status.state.as_str(),
                requested = state.as_str(),
                "ignoring state transition on finished task"
            );
            return;
        }
        status.state = state;
        status.message = message.into();
        if state.is_sticky() {
            status.sub_state = SubState::AllDone;
        }
    }

    pub fn update_sub_state(&self, sub_state: SubState, message: impl Into<String>) {
        let mut status = self.inner.status.lock().expect("task status poisoned");
        if status.state.is_sticky() {
            return;
        }
        status.sub_state = sub_state;
        status.message = message.into();
    }

    /// Annotate a finished batch item without ending the task: used for the
    /// deferred "restart to apply" outcome.
    pub fn annotate_deferred(&self, message: impl Into<String>) {
        let mut status = self.inner.status.lock().expect("task status poisoned");
        status.sub_state = SubState::PackageManagerDone;
        status.message = message.into();
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.update_state(State::Failed, message);
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        let mut status = self.inner.status.lock().expect("task status poisoned");
        status.message = message.into();
    }

    /// Surface a prompt to the caller and block until the matching reply
    /// arrives or the task is canceled.
    pub fn request_interaction(
        &self,
        message_type: InteractionMessageType,
        context: &InteractionContext,
    ) -> WaitOutcome {
        self.sink
            .request_interaction(&self.inner.object_path, message_type, context);
        self.inner
            .wait_rx
            .recv()
            .unwrap_or(WaitOutcome::Canceled)
    }

    /// Deliver a wait outcome; at most one is ever buffered.
    pub(crate) fn deliver(&self, outcome: WaitOutcome) {
        let _ = self.inner.wait_tx.try_send(outcome);
    }

    /// Cooperative cancellation: mark the task canceled and release a
    /// pending interaction wait.
    pub fn cancel(&self, message: impl Into<String>) {
        self.update_state(State::Canceled, message);
        self.deliver(WaitOutcome::Canceled);
    }
}

impl PullObserver for TaskHandle {
    fn progress(&self, message: &str) {
        self.set_message(message);
    }

    fn is_canceled(&self) -> bool {
        self.is_done()
    }
}
