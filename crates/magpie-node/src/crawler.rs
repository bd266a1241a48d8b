//! The crawl frontier.
//!
//! A depth-bounded, loop-preventing breadth-first exploration engine:
//! each pending term is scraped once, its results are written through the
//! store, and the mentions, hashtags and authors found in the new results
//! become child terms one depth level down. A decaying dedup map keeps
//! any query string from being crawled twice within the horizon.
//!
//! `process` is one bounded step; the caretaker calls it in a short loop
//! so the frontier never monopolizes a sync cycle.

use crate::error::Result;
use crate::scrape::Scraper;
use crate::store::Store;
use magpie_core::SourceType;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum crawl depth.
const MAX_DEPTH: u8 = 4;

/// How long a query stays in the dedup map before it may be re-stacked.
const DEDUP_HORIZON: Duration = Duration::from_secs(60 * 60);

/// Minimum length for a mention or hashtag to become a child term.
const MIN_TERM_LEN: usize = 2;

/// A pending frontier entry.
#[derive(Debug, Clone)]
pub struct CrawlTerm {
    pub query: String,
    /// Remaining expansion depth; 0 means scrape but do not expand.
    pub depth: u8,
    pub follow_hashtags: bool,
    pub follow_users: bool,
}

/// The frontier: pending terms plus the decaying dedup map.
///
/// Safe for concurrent `stack` and `process` calls.
pub struct Crawler {
    pending: Mutex<VecDeque<CrawlTerm>>,
    /// Query string to the time it was stacked.
    stacked: Mutex<HashMap<String, Instant>>,
    scraper: Arc<dyn Scraper>,
    store: Arc<Store>,
    horizon: Duration,
}

impl Crawler {
    pub fn new(scraper: Arc<dyn Scraper>, store: Arc<Store>) -> Self {
        Self::with_horizon(scraper, store, DEDUP_HORIZON)
    }

    pub fn with_horizon(scraper: Arc<dyn Scraper>, store: Arc<Store>, horizon: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            stacked: Mutex::new(HashMap::new()),
            scraper,
            store,
            horizon,
        }
    }

    /// Add a term to the frontier. Returns false without stacking if the
    /// query was already stacked within the horizon.
    pub fn stack(
        &self,
        query: &str,
        depth: u8,
        follow_hashtags: bool,
        follow_users: bool,
        at_front: bool,
    ) -> bool {
        let depth = depth.min(MAX_DEPTH);

        // Evict stale dedup entries only while the frontier is quiet;
        // this bounds the map without a timer thread.
        if self.pending.lock().is_empty() {
            let now = Instant::now();
            self.stacked
                .lock()
                .retain(|_, stacked_at| now.duration_since(*stacked_at) < self.horizon);
        }

        {
            // Check and record under one lock so concurrent stacks of the
            // same query cannot both pass.
            let mut stacked = self.stacked.lock();
            if stacked.contains_key(query) {
                metrics::counter!("crawler_terms_deduplicated_total").increment(1);
                return false;
            }
            stacked.insert(query.to_string(), Instant::now());
        }

        let term = CrawlTerm {
            query: query.to_string(),
            depth,
            follow_hashtags,
            follow_users,
        };
        let mut pending = self.pending.lock();
        if at_front {
            pending.push_front(term);
        } else {
            pending.push_back(term);
        }
        metrics::counter!("crawler_terms_stacked_total").increment(1);
        metrics::gauge!("crawler_pending").set(pending.len() as f64);
        true
    }

    /// One frontier step: scrape the next pending term, write its results,
    /// and stack the child terms. Returns the number of terms newly
    /// stacked; 0 when the frontier is empty or the term was a leaf.
    pub fn process(&self) -> usize {
        let Some(term) = self.pending.lock().pop_front() else {
            return 0;
        };
        metrics::counter!("crawler_steps_total").increment(1);

        let timeline = match self.scraper.scrape(&term.query) {
            Ok(timeline) => timeline,
            Err(e) => {
                warn!(query = %term.query, error = %e, "crawl scrape failed");
                return 0;
            }
        };
        debug!(query = %term.query, depth = term.depth, results = timeline.len(), "crawl step");
        metrics::counter!("crawler_messages_harvested_total").increment(timeline.len() as u64);

        if let Err(e) = self.write_results(&timeline) {
            warn!(query = %term.query, error = %e, "crawl result write failed");
        }

        if term.depth == 0 {
            return 0;
        }

        let mut candidates: HashSet<String> = HashSet::new();
        for message in timeline.iter() {
            if term.follow_users {
                candidates.extend(
                    message
                        .mentions
                        .iter()
                        .filter(|m| m.len() >= MIN_TERM_LEN)
                        .cloned(),
                );
            }
            if term.follow_hashtags {
                candidates.extend(
                    message
                        .hashtags
                        .iter()
                        .filter(|h| h.len() >= MIN_TERM_LEN)
                        .cloned(),
                );
            }
            // Authors are always followed, independent of the flags; this
            // keeps the frontier expanding even with both flags off.
            candidates.insert(message.screen_name.clone());
        }

        let mut newly_stacked = 0;
        for candidate in candidates {
            if self.stack(
                &candidate,
                term.depth - 1,
                term.follow_hashtags,
                term.follow_users,
                false,
            ) {
                newly_stacked += 1;
            }
        }
        newly_stacked
    }

    fn write_results(&self, timeline: &magpie_core::Timeline) -> Result<()> {
        for message in timeline.iter() {
            let Some(author) = timeline.author_of(message) else {
                warn!(id = %message.id, "dropping crawled message without author");
                continue;
            };
            let mut message = message.clone();
            message.source = SourceType::Scraped;
            message.analyse();
            self.store.write(&message, author, true, false)?;
        }
        Ok(())
    }

    /// Number of terms waiting in the frontier.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queries waiting in the frontier, front first.
    pub fn pending_queries(&self) -> Vec<String> {
        self.pending.lock().iter().map(|t| t.query.clone()).collect()
    }
}
