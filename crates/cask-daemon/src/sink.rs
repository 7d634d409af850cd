use std::io::Write;
use std::sync::Mutex;

use serde_json::json;
use tracing::warn;

use cask_core::EventSink;
use cask_domain::api::{
    InteractionContext, InteractionMessageType, InteractionReply, SearchResult,
};

/// Publishes daemon events as line-delimited JSON on stdout, where the bus
/// transport picks them up.
pub struct StdoutSink {
    out: Mutex<std::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(std::io::stdout()),
        }
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        let line = json!({ "event": event, "payload": payload });
        let mut out = self.out.lock().expect("stdout poisoned");
        if let Err(err) = writeln!(out, "{line}") {
            warn!(%err, event, "failed to publish event");
        }
    }
}

impl EventSink for StdoutSink {
    fn task_added(&self, object_path: &str) {
        self.emit("TaskAdded", json!({ "objectPath": object_path }));
    }

    fn request_interaction(
        &self,
        object_path: &str,
        message_type: InteractionMessageType,
        context: &InteractionContext,
    ) {
        self.emit(
            "RequestInteraction",
            json!({
                "objectPath": object_path,
                "messageType": message_type,
                "additionalMessage": context,
            }),
        );
    }

    fn reply_received(&self, reply: &InteractionReply) {
        self.emit("ReplyReceived", json!({ "reply": reply }));
    }

    fn search_finished(&self, job_id: &str, result: &SearchResult) {
        self.emit(
            "SearchFinished",
            json!({ "jobId": job_id, "result": result }),
        );
    }

    fn prune_finished(&self, job_id: &str, result: &SearchResult) {
        self.emit(
            "PruneFinished",
            json!({ "jobId": job_id, "result": result }),
        );
    }

    fn generate_cache_finished(&self, job_id: &str, success: bool) {
        self.emit(
            "GenerateCacheFinished",
            json!({ "jobId": job_id, "success": success }),
        );
    }
}
