use cask_domain::api::{
    InteractionContext, InteractionMessageType, InteractionReply, SearchResult,
};

/// Receives the events the daemon publishes to its callers.
///
/// The transport owns the real implementation; tests record what was
/// emitted.
pub trait EventSink: Send + Sync {
    fn task_added(&self, object_path: &str);

    fn request_interaction(
        &self,
        object_path: &str,
        message_type: InteractionMessageType,
        context: &InteractionContext,
    );

    fn reply_received(&self, reply: &InteractionReply);

    fn search_finished(&self, job_id: &str, result: &SearchResult);

    fn prune_finished(&self, job_id: &str, result: &SearchResult);

    fn generate_cache_finished(&self, job_id: &str, success: bool);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn task_added(&self, _object_path: &str) {}

    fn request_interaction(
        &self,
        _object_path: &str,
        _message_type: InteractionMessageType,
        _context: &InteractionContext,
    ) {
    }

    fn reply_received(&self, _reply: &InteractionReply) {}

    fn search_finished(&self, _job_id: &str, _result: &SearchResult) {}

    fn prune_finished(&self, _job_id: &str, _result: &SearchResult) {}

    fn generate_cache_finished(&self, _job_id: &str, _success: bool) {}
}
