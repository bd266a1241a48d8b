//! End-to-end scenarios over the public API: frontier-driven harvesting
//! and peer push deduplication.

use chrono::{TimeZone, Utc};
use magpie_core::{Author, Message, SourceType, Timeline};
use magpie_node::crawler::Crawler;
use magpie_node::scrape::Scraper;
use magpie_node::store::{DumpPaths, DumpWriter, MemoryIndex, Store};
use magpie_node::Result;
use std::io::BufRead;
use std::sync::Arc;
use tempfile::TempDir;

fn message(id: &str, author: &str, text: &str, minute: u32) -> Message {
    let mut m = Message {
        id: id.to_string(),
        screen_name: author.to_string(),
        created_at: Utc.with_ymd_and_hms(2015, 4, 1, 12, minute, 0).unwrap(),
        text: text.to_string(),
        mentions: Vec::new(),
        hashtags: Vec::new(),
        links: Vec::new(),
        place_name: None,
        source: SourceType::Scraped,
    };
    m.analyse();
    m
}

/// Returns two messages by alice tagged #fossasia for the "fosdem" query
/// and nothing for anything else, mimicking new-results-only semantics.
struct SeedScraper;

impl Scraper for SeedScraper {
    fn scrape(&self, query: &str) -> Result<Timeline> {
        let mut timeline = Timeline::new();
        if query == "fosdem" {
            timeline.add(
                message("t1", "alice", "fosdem rocks #fossasia", 1),
                Author::new("alice"),
            );
            timeline.add(
                message("t2", "alice", "more about fosdem #fossasia", 2),
                Author::new("alice"),
            );
        }
        Ok(timeline)
    }
}

#[test]
fn crawl_seed_expands_frontier_and_fills_store() {
    let store = Arc::new(Store::new(Arc::new(MemoryIndex::new()), None));
    let crawler = Crawler::new(Arc::new(SeedScraper), Arc::clone(&store));

    assert!(crawler.stack("fosdem", 2, true, true, false));
    let stacked = crawler.process();

    // The author and the hashtag become child terms.
    assert_eq!(stacked, 2);
    let mut pending = crawler.pending_queries();
    pending.sort();
    assert_eq!(pending, vec!["alice", "fossasia"]);

    // Every distinct scraped message reached the store.
    assert_eq!(store.count(), 2);

    // The already-crawled query is rejected by the frontier.
    assert!(!crawler.stack("fosdem", 2, true, true, false));

    // Child terms scrape nothing further and the frontier drains.
    assert_eq!(crawler.process(), 0);
    assert_eq!(crawler.process(), 0);
    assert_eq!(crawler.pending_len(), 0);
    assert_eq!(store.count(), 2);
}

/// Apply a pushed wire document to a store the way the push endpoint
/// does: parse, then dedup-write every record. Returns the number of
/// newly written messages.
fn receive_push(store: &Store, doc: &serde_json::Value) -> usize {
    let timeline = Timeline::from_json(doc).unwrap();
    let mut written = 0;
    for m in timeline.iter() {
        let author = timeline.author_of(m).unwrap();
        let mut m = m.clone();
        m.source = SourceType::Peer;
        if store.write(&m, author, true, false).unwrap() {
            written += 1;
        }
    }
    written
}

#[test]
fn double_push_writes_nothing_the_second_time() {
    let dir = TempDir::new().unwrap();
    let paths = DumpPaths::new(dir.path());
    let dump = DumpWriter::open(paths.clone()).unwrap();
    let peer_store = Store::new(Arc::new(MemoryIndex::new()), Some(dump));

    let mut outbound = Timeline::new();
    for i in 1..=3 {
        outbound.add(
            message(&format!("b{i}"), "bob", &format!("post {i}"), i),
            Author::new("bob"),
        );
    }
    let doc = outbound.to_json();

    assert_eq!(receive_push(&peer_store, &doc), 3);
    assert_eq!(peer_store.count(), 3);

    // The identical push again: everything is already present.
    assert_eq!(receive_push(&peer_store, &doc), 0);
    assert_eq!(peer_store.count(), 3);

    // At-most-once also holds for the dump log: exactly one line each.
    peer_store.flush().unwrap();
    let bucket = std::fs::read_dir(&paths.own)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "txt"))
        .expect("own dump bucket");
    let lines = magpie_node::store::dump::open_dump_reader(&bucket)
        .unwrap()
        .lines()
        .count();
    assert_eq!(lines, 3);
}
