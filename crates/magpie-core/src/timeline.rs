//! Timelines: the unit of exchange between all components.
//!
//! A timeline is an ordered, deduplicating collection of (message, author)
//! pairs. Messages are keyed by `(created_at, id)` so iteration yields
//! reverse-chronological order; authors live in a side map keyed by screen
//! name. Every message in a timeline has its author in the side map.
//!
//! Timelines are constructed per operation (scrape result, search result,
//! queue batch), merged by union, and discarded after being drained into
//! the store or serialized to a peer document.

use crate::error::{Error, Result};
use crate::message::{Author, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Ordered multiset of messages plus an author side map.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Keyed by `(created_at millis, id)` for chronological ordering.
    messages: BTreeMap<(i64, String), Message>,
    authors: HashMap<String, Author>,
    /// Total hit count when this timeline is a truncated search result.
    hits: Option<u64>,
    /// The query that produced this timeline, if any.
    query: Option<String>,
    /// Scraper diagnostic string, passed through to peers.
    scraper_info: Option<String>,
}

/// One entry of the wire `statuses` array: a message with its author inlined.
#[derive(Serialize, Deserialize)]
struct Status {
    #[serde(flatten)]
    message: Message,
    user: Author,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message and its author. The author entry is last-write-wins,
    /// except that an author carrying an avatar is never replaced by one
    /// without.
    pub fn add(&mut self, message: Message, author: Author) {
        match self.authors.get(&author.screen_name) {
            Some(existing) if existing.has_avatar() && !author.has_avatar() => {}
            _ => {
                self.authors.insert(author.screen_name.clone(), author);
            }
        }
        let key = (message.created_at.timestamp_millis(), message.id.clone());
        self.messages.insert(key, message);
    }

    /// Union another timeline into this one.
    pub fn merge(&mut self, other: Timeline) {
        let Timeline {
            messages, authors, ..
        } = other;
        for author in authors.into_values() {
            match self.authors.get(&author.screen_name) {
                Some(existing) if existing.has_avatar() && !author.has_avatar() => {}
                _ => {
                    self.authors.insert(author.screen_name.clone(), author);
                }
            }
        }
        for (key, message) in messages {
            self.messages.insert(key, message);
        }
    }

    /// Messages in descending `(created_at, id)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().rev()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The author of a message in this timeline, if present.
    pub fn author_of(&self, message: &Message) -> Option<&Author> {
        self.authors.get(&message.screen_name)
    }

    pub fn authors(&self) -> impl Iterator<Item = &Author> {
        self.authors.values()
    }

    pub fn set_query(&mut self, query: Option<String>) {
        self.query = query;
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn set_hits(&mut self, hits: u64) {
        self.hits = Some(hits);
    }

    /// Total hit count; falls back to the timeline size when unknown.
    pub fn hits(&self) -> u64 {
        self.hits.unwrap_or(self.len() as u64).max(self.len() as u64)
    }

    pub fn set_scraper_info(&mut self, info: impl Into<String>) {
        self.scraper_info = Some(info.into());
    }

    /// Mean gap in milliseconds between consecutive messages, computed over
    /// the latest 20 entries. `None` when fewer than two messages are
    /// present and no period can be estimated. Used by scheduled retrieval
    /// to estimate when a query is worth re-running.
    pub fn period_millis(&self) -> Option<u64> {
        let mut latest: Option<i64> = None;
        let mut earliest = 0i64;
        let mut count = 0u32;
        for message in self.iter() {
            let t = message.created_at.timestamp_millis();
            match latest {
                None => latest = Some(t),
                Some(_) => {
                    earliest = t;
                    count += 1;
                    if count >= 19 {
                        break;
                    }
                }
            }
        }
        if count == 0 {
            return None;
        }
        let interval = (latest.unwrap_or(0) - earliest).max(0) as u64;
        let p = 1 + interval / count as u64;
        // Very dense bursts are damped so the scheduler does not spin.
        Some(if p < 4000 { p / 4 + 3000 } else { p })
    }

    /// Serialize to the peer wire format:
    /// `{"search_metadata": {...}, "statuses": [message + "user"]}`.
    pub fn to_json(&self) -> Value {
        let mut metadata = json!({
            "count": self.len().to_string(),
            "hits": self.hits(),
        });
        if let Some(q) = &self.query {
            metadata["query"] = json!(q);
        }
        if let Some(info) = &self.scraper_info {
            metadata["scraperInfo"] = json!(info);
        }
        let statuses: Vec<Value> = self
            .iter()
            .filter_map(|message| {
                let author = self.author_of(message)?;
                serde_json::to_value(Status {
                    message: message.clone(),
                    user: author.clone(),
                })
                .ok()
            })
            .collect();
        json!({
            "search_metadata": metadata,
            "statuses": statuses,
        })
    }

    /// Parse a peer wire document. Malformed statuses are skipped with a
    /// warning; inbound data is untrusted and one bad record must not drop
    /// the batch.
    pub fn from_json(doc: &Value) -> Result<Timeline> {
        let statuses = doc
            .get("statuses")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::MalformedTimeline("missing 'statuses' array".to_string()))?;

        let mut timeline = Timeline::new();
        for status in statuses {
            match serde_json::from_value::<Status>(status.clone()) {
                Ok(Status { mut message, user }) => {
                    message.analyse();
                    timeline.add(message, user);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed status in peer document");
                }
            }
        }

        if let Some(metadata) = doc.get("search_metadata") {
            if let Some(hits) = metadata.get("hits").and_then(Value::as_u64) {
                timeline.set_hits(hits);
            }
            if let Some(query) = metadata.get("query").and_then(Value::as_str) {
                timeline.set_query(Some(query.to_string()));
            }
        }
        Ok(timeline)
    }
}
