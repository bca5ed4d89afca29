//! Pipeline orchestration for codelore.
//!
//! This crate sequences the scanner, classifier and extractor into runs
//! persisted to the knowledge store, streams run progress over an
//! [`EventBus`], and re-triggers scoped runs on filesystem changes.

pub mod events;
pub mod pipeline;
pub mod service;
pub mod watcher;

pub use events::{EventBus, PipelineEvent, Subscription};
pub use pipeline::{Orchestrator, Phase, StatusSnapshot};
pub use service::DiscoveryService;
pub use watcher::{Backoff, Debouncer, Watcher, WatcherState};
