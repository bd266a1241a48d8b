//! The durable store: dedup write path, read path, search, and the
//! outbound notification queue.
//!
//! The write path is the at-most-once heart of the node. Before any I/O
//! it checks a bounded in-memory cache and then the index for the message
//! id; only a miss on both proceeds to write the author, append to the
//! dump log, write the index record and populate the cache. The whole
//! check-then-write sequence runs inside one critical section, so no two
//! concurrent writers can both observe "absent" for the same id.
//!
//! Once transmission is enabled, newly written messages are also placed
//! on an outbound queue that the caretaker drains into peer pushes.

pub mod dump;
pub mod index;
pub mod schedule;

pub use dump::{DumpPaths, DumpWriter, DUMP_PREFIX};
pub use index::{MemoryIndex, MessageIndex, SearchResult};
pub use schedule::{eligible_for_retrieval, ScheduledQuery};

use crate::error::Result;
use crate::query::CompiledQuery;
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use magpie_core::{Author, Message, Timeline};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Capacity of the message and author caches.
const CACHE_CAPACITY: u64 = 10_000;

/// The store.
///
/// All components share one instance by `Arc`; there is no process-wide
/// singleton, so tests run isolated instances side by side.
pub struct Store {
    index: Arc<dyn MessageIndex>,
    message_cache: moka::sync::Cache<String, Message>,
    author_cache: moka::sync::Cache<String, Author>,
    dump: Option<DumpWriter>,
    /// Serializes the check-then-write sequence.
    write_lock: Mutex<()>,
    outbound_tx: Sender<(Message, Author)>,
    outbound_rx: Receiver<(Message, Author)>,
    /// Off by default; without peers the outbound queue has no consumer
    /// and must not accumulate.
    transmitting: AtomicBool,
    scheduled: RwLock<HashMap<String, ScheduledQuery>>,
}

impl Store {
    /// Create a store over the given index. `dump` is the optional own
    /// dump log; without it `persist_log` writes skip the log append.
    pub fn new(index: Arc<dyn MessageIndex>, dump: Option<DumpWriter>) -> Self {
        let (outbound_tx, outbound_rx) = unbounded();
        Self {
            index,
            message_cache: moka::sync::Cache::new(CACHE_CAPACITY),
            author_cache: moka::sync::Cache::new(CACHE_CAPACITY),
            dump,
            write_lock: Mutex::new(()),
            outbound_tx,
            outbound_rx,
            transmitting: AtomicBool::new(false),
            scheduled: RwLock::new(HashMap::new()),
        }
    }

    /// Start placing new writes on the outbound queue. Called once peers
    /// are configured and a consumer drains the queue.
    pub fn enable_transmission(&self) {
        self.transmitting.store(true, Ordering::SeqCst);
    }

    /// Write a message and its author unless the message id is already
    /// known. Returns whether the message was newly written.
    ///
    /// A dump log fault is logged and the write continues; a stuck
    /// message is preferable to a stuck node.
    pub fn write(
        &self,
        message: &Message,
        author: &Author,
        persist_log: bool,
        overwrite_author: bool,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();

        if self.message_cache.contains_key(&message.id) {
            metrics::counter!("store_messages_duplicate_total").increment(1);
            return Ok(false);
        }
        if let Some(existing) = self.index.get(&message.id) {
            self.message_cache.insert(existing.id.clone(), existing);
            metrics::counter!("store_messages_duplicate_total").increment(1);
            return Ok(false);
        }

        let author_known = self.author_cache.contains_key(&author.screen_name)
            || self.index.get_author(&author.screen_name).is_some();
        if !author_known || overwrite_author {
            self.index.put_author(author, overwrite_author)?;
            self.author_cache
                .insert(author.screen_name.clone(), author.clone());
            metrics::counter!("store_authors_written_total").increment(1);
        }

        if persist_log {
            if let Some(dump) = &self.dump {
                if let Err(e) = dump.append(message) {
                    warn!(id = %message.id, error = %e, "dump log append failed");
                }
            }
        }

        self.index.put(message)?;
        self.message_cache.insert(message.id.clone(), message.clone());
        metrics::counter!("store_messages_written_total").increment(1);

        // Notify the caretaker; the channel is unbounded and the receiver
        // lives as long as the store, so this cannot fail in practice.
        if self.transmitting.load(Ordering::SeqCst) {
            let _ = self.outbound_tx.send((message.clone(), author.clone()));
        }
        Ok(true)
    }

    /// Whether a message id is resident in the cache. Cheap early exit for
    /// the queue drain, skipping the write path's critical section.
    pub fn cached(&self, id: &str) -> bool {
        self.message_cache.contains_key(id)
    }

    /// Read a message by id: cache first, index on miss.
    pub fn read(&self, id: &str) -> Option<Message> {
        if let Some(message) = self.message_cache.get(id) {
            return Some(message);
        }
        let message = self.index.get(id)?;
        self.message_cache.insert(message.id.clone(), message.clone());
        Some(message)
    }

    /// Read an author by screen name: cache first, index on miss.
    pub fn read_author(&self, screen_name: &str) -> Option<Author> {
        if let Some(author) = self.author_cache.get(screen_name) {
            return Some(author);
        }
        let author = self.index.get_author(screen_name)?;
        self.author_cache
            .insert(author.screen_name.clone(), author.clone());
        Some(author)
    }

    /// Total number of stored messages.
    pub fn count(&self) -> u64 {
        self.index.count()
    }

    /// Execute a compiled query, resolving each hit's author. Hits whose
    /// author cannot be resolved are dropped; inbound data is untrusted
    /// and a record without an author is not worth a crash.
    pub fn search(
        &self,
        query: &CompiledQuery,
        limit: usize,
        aggregation_fields: &[String],
    ) -> (Timeline, HashMap<String, Vec<(String, u64)>>) {
        let result = self.index.search(query, limit, aggregation_fields);
        let mut timeline = Timeline::new();
        for message in result.messages {
            match self.read_author(&message.screen_name) {
                Some(author) => timeline.add(message, author),
                None => {
                    warn!(id = %message.id, screen_name = %message.screen_name,
                        "dropping search hit without author record");
                }
            }
        }
        timeline.set_hits(result.hits);
        timeline.set_query(Some(query.original.clone()));
        (timeline, result.aggregations)
    }

    /// Drain newly written messages into one timeline: collect up to
    /// `max_size` pairs, waiting at most `max_wait` in total. Returns
    /// whatever was gathered when the deadline passes.
    pub fn take_timeline(&self, max_size: usize, max_wait: Duration) -> Timeline {
        let deadline = Instant::now() + max_wait;
        let mut timeline = Timeline::new();
        while timeline.len() < max_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.outbound_rx.recv_timeout(remaining) {
                Ok((message, author)) => timeline.add(message, author),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        timeline
    }

    /// Flush the dump log.
    pub fn flush(&self) -> Result<()> {
        if let Some(dump) = &self.dump {
            dump.flush()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduled retrieval bookkeeping
    // ------------------------------------------------------------------

    /// Record that a query was run, creating or updating its schedule
    /// entry from the observed message period.
    pub fn record_query(
        &self,
        query: &str,
        timezone_offset: i32,
        message_period_millis: Option<u64>,
        by_user_query: bool,
    ) {
        let mut scheduled = self.scheduled.write();
        match scheduled.get_mut(query) {
            Some(entry) => entry.update(message_period_millis, by_user_query),
            None => {
                scheduled.insert(
                    query.to_string(),
                    ScheduledQuery::new(query, timezone_offset, message_period_millis, by_user_query),
                );
            }
        }
    }

    /// Queries due for re-retrieval, safest-subset only, ordered by
    /// `retrieval_next`, at most `limit` entries.
    pub fn due_queries(&self, limit: usize) -> Vec<ScheduledQuery> {
        let now = Utc::now();
        let scheduled = self.scheduled.read();
        let mut due: Vec<ScheduledQuery> = scheduled
            .values()
            .filter(|entry| entry.due(now) && eligible_for_retrieval(&entry.query))
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.retrieval_next);
        due.truncate(limit);
        due
    }

    /// Retire a query from scheduled retrieval. Returns whether an entry
    /// existed.
    pub fn delete_query(&self, query: &str) -> bool {
        self.scheduled.write().remove(query).is_some()
    }

    /// Number of tracked queries.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use magpie_core::SourceType;

    fn message(id: &str, author: &str) -> Message {
        Message {
            id: id.to_string(),
            screen_name: author.to_string(),
            created_at: Utc.with_ymd_and_hms(2015, 4, 1, 12, 0, 0).unwrap(),
            text: format!("message {id} with #beer"),
            mentions: Vec::new(),
            hashtags: vec!["beer".to_string()],
            links: Vec::new(),
            place_name: None,
            source: SourceType::Scraped,
        }
    }

    fn store() -> Store {
        Store::new(Arc::new(MemoryIndex::new()), None)
    }

    #[test]
    fn test_write_is_idempotent() {
        let store = store();
        let m = message("1", "alice");
        let a = Author::new("alice");
        assert!(store.write(&m, &a, false, false).unwrap());
        assert!(!store.write(&m, &a, false, false).unwrap());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_write_dedups_through_index_on_cold_cache() {
        let index: Arc<dyn MessageIndex> = Arc::new(MemoryIndex::new());
        let first = Store::new(Arc::clone(&index), None);
        let m = message("1", "alice");
        let a = Author::new("alice");
        assert!(first.write(&m, &a, false, false).unwrap());

        // A second store over the same index has an empty cache; the
        // index check still rejects the duplicate.
        let second = Store::new(index, None);
        assert!(!second.write(&m, &a, false, false).unwrap());
    }

    #[test]
    fn test_author_written_once_unless_forced() {
        let store = store();
        let a = Author::new("alice");
        store.write(&message("1", "alice"), &a, false, false).unwrap();

        let mut renamed = a.clone();
        renamed.name = "Alice".to_string();
        store
            .write(&message("2", "alice"), &renamed, false, false)
            .unwrap();
        assert_eq!(store.read_author("alice").unwrap().name, "");

        store
            .write(&message("3", "alice"), &renamed, false, true)
            .unwrap();
        assert_eq!(store.read_author("alice").unwrap().name, "Alice");
    }

    #[test]
    fn test_read_populates_cache_from_index() {
        let index: Arc<dyn MessageIndex> = Arc::new(MemoryIndex::new());
        index.put(&message("1", "alice")).unwrap();
        let store = Store::new(index, None);
        assert!(!store.cached("1"));
        assert!(store.read("1").is_some());
        assert!(store.cached("1"));
    }

    #[test]
    fn test_search_resolves_authors() {
        let store = store();
        store
            .write(&message("1", "alice"), &Author::new("alice"), false, false)
            .unwrap();
        store
            .write(&message("2", "bob"), &Author::new("bob"), false, false)
            .unwrap();

        let q = CompiledQuery::parse("#beer", 0);
        let (timeline, _) = store.search(&q, 10, &[]);
        assert_eq!(timeline.len(), 2);
        for m in timeline.iter() {
            assert!(timeline.author_of(m).is_some());
        }
    }

    #[test]
    fn test_search_drops_hit_without_author() {
        let index: Arc<dyn MessageIndex> = Arc::new(MemoryIndex::new());
        // Message placed directly in the index, bypassing the author write.
        index.put(&message("1", "ghost")).unwrap();
        let store = Store::new(index, None);

        let q = CompiledQuery::parse("#beer", 0);
        let (timeline, _) = store.search(&q, 10, &[]);
        assert_eq!(timeline.len(), 0);
    }

    #[test]
    fn test_no_outbound_buildup_without_transmission() {
        let store = store();
        store
            .write(&message("1", "alice"), &Author::new("alice"), false, false)
            .unwrap();
        assert!(store.outbound_rx.is_empty());
        let timeline = store.take_timeline(10, Duration::from_millis(10));
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_take_timeline_collects_new_writes() {
        let store = store();
        store.enable_transmission();
        store
            .write(&message("1", "alice"), &Author::new("alice"), false, false)
            .unwrap();
        store
            .write(&message("2", "alice"), &Author::new("alice"), false, false)
            .unwrap();

        let timeline = store.take_timeline(10, Duration::from_millis(50));
        assert_eq!(timeline.len(), 2);

        // Duplicates never reach the outbound queue.
        store
            .write(&message("1", "alice"), &Author::new("alice"), false, false)
            .unwrap();
        let timeline = store.take_timeline(10, Duration::from_millis(50));
        assert_eq!(timeline.len(), 0);
    }

    #[test]
    fn test_take_timeline_respects_max_size() {
        let store = store();
        store.enable_transmission();
        for i in 0..5 {
            store
                .write(
                    &message(&i.to_string(), "alice"),
                    &Author::new("alice"),
                    false,
                    false,
                )
                .unwrap();
        }
        let timeline = store.take_timeline(3, Duration::from_millis(50));
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn test_due_queries_filtered_and_ordered() {
        let store = store();
        store.record_query("beer", 0, Some(1000), true);
        store.record_query("from:alice", 0, Some(1000), true);
        store.record_query("a", 0, Some(1000), true);
        assert_eq!(store.scheduled_len(), 3);

        // Force everything due.
        {
            let mut scheduled = store.scheduled.write();
            for entry in scheduled.values_mut() {
                entry.retrieval_next = Utc::now() - chrono::Duration::seconds(1);
            }
        }
        let due = store.due_queries(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].query, "beer");
    }

    #[test]
    fn test_delete_query_retires_entry() {
        let store = store();
        store.record_query("beer", 0, Some(1000), true);
        assert!(store.delete_query("beer"));
        assert!(!store.delete_query("beer"));
        assert_eq!(store.scheduled_len(), 0);
    }
}
