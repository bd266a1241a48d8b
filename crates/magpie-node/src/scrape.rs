//! The scraper seam.
//!
//! The crawler and the caretaker do not know where messages come from;
//! they call a [`Scraper`]. The shipped implementation scrapes by
//! querying an upstream node's search API, so a fresh node can bootstrap
//! its index from an established one.

use crate::error::Result;
use crate::peers::PeerClient;
use magpie_core::Timeline;

/// A source of messages for a query.
///
/// Implementations must return only messages not previously returned by
/// this instance for the same query; the crawler relies on new-results-only
/// semantics to terminate.
pub trait Scraper: Send + Sync {
    fn scrape(&self, query: &str) -> Result<Timeline>;
}

/// Scrapes by searching an upstream peer node.
pub struct PeerSearchScraper {
    client: PeerClient,
    upstream: String,
    timezone_offset: i32,
}

impl PeerSearchScraper {
    pub fn new(client: PeerClient, upstream: impl Into<String>) -> Self {
        Self {
            client,
            upstream: upstream.into(),
            timezone_offset: 0,
        }
    }
}

impl Scraper for PeerSearchScraper {
    fn scrape(&self, query: &str) -> Result<Timeline> {
        self.client
            .search(&self.upstream, query, self.timezone_offset)
    }
}
