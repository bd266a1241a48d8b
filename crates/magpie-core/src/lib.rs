//! Core types and shared utilities for the Magpie harvesting node.
//!
//! This crate provides:
//! - The message and author data model with peer wire serialization
//! - Timelines: ordered, deduplicating message collections
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod message;
pub mod metrics;
mod timeline;

pub use error::{Error, Result};
pub use message::{Author, Message, SourceType};
pub use timeline::Timeline;
