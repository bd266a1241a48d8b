//! Magpie harvesting node.
//!
//! The node crawls a message source by following a query frontier,
//! deduplicates and durably stores what it finds, exchanges new messages
//! with peer nodes over HTTP, and answers structured search queries
//! against its local index.
//!
//! Component map:
//! - [`store`] — dedup write path, dump log, queryable index, schedules
//! - [`queue`] — bounded ingestion queue with backpressure
//! - [`crawler`] — depth-bounded, loop-preventing crawl frontier
//! - [`query`] — search syntax compiler
//! - [`caretaker`] — the periodic peer-synchronization loop
//! - [`peers`] — peer push/search/hello HTTP client
//! - [`importer`] — dump file import hand-off

pub mod caretaker;
pub mod config;
pub mod crawler;
pub mod error;
pub mod importer;
pub mod peers;
pub mod query;
pub mod queue;
pub mod scrape;
pub mod store;

pub use error::{Error, Result};
