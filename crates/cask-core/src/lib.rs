//! Task engine and package manager core of the cask daemon.
//!
//! [`PackageManager`] validates RPC requests synchronously and runs the
//! resulting work as cancellable tasks against the layer repo; the
//! [`engine::TaskEngine`] serializes writers per ref-spec and owns the
//! deferred garbage-collection timer.

pub mod bundle;
pub mod cache;
pub mod engine;
pub mod events;
mod manager;
pub mod task;
mod transaction;

pub use cache::{CacheRunner, CacheSpec, CommandCacheRunner};
pub use engine::{deferred_gc_interval, TaskEngine, WorkerQueue, DEFERRED_GC_ENV};
pub use events::{EventSink, NullSink};
pub use manager::PackageManager;
pub use task::{State, SubState, TaskHandle, WaitOutcome};
pub use transaction::Transaction;
