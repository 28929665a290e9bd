//! # sphereq
//!
//! A reliable in-process message processing engine for Rust.
//!
//! Producers enqueue units of work, a pool of workers executes them
//! through caller-supplied processing logic, failures are retried with
//! exponential backoff, and message state is durably tracked so work
//! survives restarts.
//!
//! ## Features
//!
//! - **Durable state**: append-only journal backend with crash
//!   recovery; at-least-once delivery
//! - **Bounded queue**: FIFO among eligible entries, blocking or
//!   fail-fast backpressure
//! - **Retries**: exponential backoff with jitter, dead-lettering with
//!   explicit revival
//! - **Graceful lifecycle**: start, drain (in-flight work finishes),
//!   hard stop
//! - **Observability**: counters, timers and gauges with a pluggable
//!   best-effort sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sphereq::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl MessageHandler for EmailHandler {
//!     async fn handle(&self, payload: serde_json::Value) -> SphereResult<()> {
//!         // Your processing logic here
//!         println!("sending email: {payload}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> SphereResult<()> {
//!     let service = SphereService::new(SphereConfig::default()).await?;
//!     service.start(Arc::new(EmailHandler)).await?;
//!
//!     service.enqueue(json!({"to": "user@example.com"})).await?;
//!
//!     service.drain(None).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod pagger;
pub mod processor;
pub mod queue;
pub mod repeater;
pub mod service;
pub mod stats;
pub mod store;

pub mod prelude {
    pub use crate::config::{
        EnqueueMode, LoggingConfig, QueueConfig, RetryOrdering, RetryPolicy, SphereConfig,
        StorageConfig, WorkerConfig,
    };
    pub use crate::error::{SphereError, SphereResult};
    pub use crate::message::{Message, MessageHandler, MessageId, MessageState, WorkerOutcome};
    pub use crate::pagger::{Page, PageCursor, Pagger};
    pub use crate::processor::{DrainReport, MessageProcessor};
    pub use crate::queue::TaskQueue;
    pub use crate::repeater::Repeater;
    pub use crate::service::SphereService;
    pub use crate::stats::{Stats, StatsSink, StatsSnapshot};
    pub use crate::store::{DurableStore, InMemoryStore, JournalStore, SharedStore};
    pub use async_trait::async_trait;
}

pub use crate::config::{
    EnqueueMode, LoggingConfig, QueueConfig, RetryOrdering, RetryPolicy, SphereConfig,
    StorageConfig, WorkerConfig, init_logging,
};
pub use crate::error::{SphereError, SphereResult};
pub use crate::message::{Message, MessageHandler, MessageId, MessageState, WorkerOutcome};
pub use crate::pagger::{Page, PageCursor, Pagger};
pub use crate::processor::{DrainReport, MessageProcessor};
pub use crate::queue::TaskQueue;
pub use crate::repeater::Repeater;
pub use crate::service::SphereService;
pub use crate::stats::{Stats, StatsSink, StatsSnapshot};
pub use crate::store::{DurableStore, InMemoryStore, JournalStore, SharedStore};
pub use async_trait::async_trait;
