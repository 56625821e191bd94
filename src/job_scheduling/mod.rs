//! Crawl scheduling subsystem
//!
//! The system is built around four main components:
//! - `TaskProducer`: the only writer of new queue entries
//! - `ConsumerPool`: bounded-concurrency loop dispatching claimed tasks to the extraction worker
//! - `CrawlScheduler`: cron-driven triggers plus the pause/resume/reset controls
//! - `RetentionSweeper`: periodic removal of expired completed/failed records

pub mod consumer_pool;
pub mod extraction;
pub mod producer;
pub mod retention;
pub mod scheduler;
pub mod types;

pub use consumer_pool::{ConsumerPool, ConsumerSettings};
pub use extraction::{ExtractionClient, ExtractionRequest, HttpExtractionClient};
pub use producer::TaskProducer;
pub use retention::{RetentionSweeper, SweepReport};
pub use scheduler::CrawlScheduler;
pub use types::*;
