//! The queryable index seam.
//!
//! The store talks to its index through the [`MessageIndex`] trait:
//! get/put with create-only semantics for messages and authors, a total
//! count, and structured search with optional aggregations. The shipped
//! implementation is [`MemoryIndex`]; a disk-backed index slots in at the
//! same seam without touching the write path.

use crate::error::Result;
use crate::query::CompiledQuery;
use magpie_core::{Author, Message};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Result of an index search.
#[derive(Debug, Default)]
pub struct SearchResult {
    /// Matching messages, newest first, truncated to the requested limit.
    pub messages: Vec<Message>,

    /// Total number of matches before truncation.
    pub hits: u64,

    /// Requested aggregations: field name to ordered (bucket, count) pairs.
    pub aggregations: HashMap<String, Vec<(String, u64)>>,
}

/// Queryable message index.
///
/// `put` and `put_author` are create-only: a record whose key is already
/// present is left untouched and the call returns `false`. This makes the
/// index the dedup source of truth for the write path.
pub trait MessageIndex: Send + Sync {
    fn get(&self, id: &str) -> Option<Message>;

    /// Write a message unless its id is already present.
    /// Returns whether the record was created.
    fn put(&self, message: &Message) -> Result<bool>;

    fn get_author(&self, screen_name: &str) -> Option<Author>;

    /// Write an author unless the screen name is already present, or
    /// unconditionally when `overwrite` is set.
    /// Returns whether the record was created or replaced.
    fn put_author(&self, author: &Author, overwrite: bool) -> Result<bool>;

    /// Total number of messages in the index.
    fn count(&self) -> u64;

    /// Execute a compiled query. `aggregation_fields` may name `created_at`
    /// (time histogram over the query's range) or an entity list field such
    /// as `hashtags` or `mentions` (case-folded term counts). Aggregations
    /// are computed over all matches, not just the returned page.
    fn search(
        &self,
        query: &CompiledQuery,
        limit: usize,
        aggregation_fields: &[String],
    ) -> SearchResult;
}

/// In-memory index: ordered scan plus id and author lookup maps.
#[derive(Default)]
pub struct MemoryIndex {
    /// Messages by id.
    by_id: RwLock<HashMap<String, Message>>,
    /// Scan order: `(created_at millis, id)` to id.
    order: RwLock<BTreeMap<(i64, String), String>>,
    authors: RwLock<HashMap<String, Author>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageIndex for MemoryIndex {
    fn get(&self, id: &str) -> Option<Message> {
        self.by_id.read().get(id).cloned()
    }

    fn put(&self, message: &Message) -> Result<bool> {
        let mut by_id = self.by_id.write();
        if by_id.contains_key(&message.id) {
            return Ok(false);
        }
        by_id.insert(message.id.clone(), message.clone());
        self.order.write().insert(
            (message.created_at.timestamp_millis(), message.id.clone()),
            message.id.clone(),
        );
        Ok(true)
    }

    fn get_author(&self, screen_name: &str) -> Option<Author> {
        self.authors.read().get(screen_name).cloned()
    }

    fn put_author(&self, author: &Author, overwrite: bool) -> Result<bool> {
        let mut authors = self.authors.write();
        if !overwrite && authors.contains_key(&author.screen_name) {
            return Ok(false);
        }
        authors.insert(author.screen_name.clone(), author.clone());
        Ok(true)
    }

    fn count(&self) -> u64 {
        self.by_id.read().len() as u64
    }

    fn search(
        &self,
        query: &CompiledQuery,
        limit: usize,
        aggregation_fields: &[String],
    ) -> SearchResult {
        let by_id = self.by_id.read();
        let order = self.order.read();

        let mut result = SearchResult::default();
        let mut matched: Vec<&Message> = Vec::new();
        for id in order.values().rev() {
            let Some(message) = by_id.get(id) else {
                continue;
            };
            if query.matches(message) {
                matched.push(message);
            }
        }
        result.hits = matched.len() as u64;
        result.messages = matched.iter().take(limit).map(|m| (*m).clone()).collect();

        for field in aggregation_fields {
            let buckets = if field == "created_at" {
                histogram_aggregation(&matched, query)
            } else {
                term_aggregation(&matched, field)
            };
            result.aggregations.insert(field.clone(), buckets);
        }
        result
    }
}

/// Time-bucketed counts over the query's range, oldest bucket first.
fn histogram_aggregation(matched: &[&Message], query: &CompiledQuery) -> Vec<(String, u64)> {
    let interval = query.histogram_interval();
    let format = interval.bucket_format();
    let mut buckets: BTreeMap<String, u64> = BTreeMap::new();
    for message in matched {
        let label = message.created_at.format(format).to_string();
        *buckets.entry(label).or_insert(0) += 1;
    }
    buckets.into_iter().collect()
}

/// Case-folded term counts for an entity list field, highest count first.
fn term_aggregation(matched: &[&Message], field: &str) -> Vec<(String, u64)> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for message in matched {
        let terms = match field {
            "hashtags" => &message.hashtags,
            "mentions" => &message.mentions,
            "links" => &message.links,
            _ => continue,
        };
        for term in terms {
            *counts.entry(term.to_lowercase()).or_insert(0) += 1;
        }
    }
    let mut buckets: Vec<(String, u64)> = counts.into_iter().collect();
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    buckets
}
