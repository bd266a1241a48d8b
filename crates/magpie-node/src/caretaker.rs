//! The caretaker: the node's periodic synchronization loop.
//!
//! One long-lived thread that, each cycle: drains newly written messages
//! into a timeline and pushes it to the configured peers (with bounded
//! retry), runs an import pass over the dump hand-off directory, steps
//! the crawl frontier a bounded number of times, and re-runs scheduled
//! queries that are due.
//!
//! The loop throttles itself between cycles and observes a cooperative
//! shutdown signal; all sleeps are interruptible so shutdown is prompt.

use crate::crawler::Crawler;
use crate::importer::Importer;
use crate::peers::PeerClient;
use crate::queue::{Envelope, IndexQueue};
use crate::scrape::Scraper;
use crate::store::Store;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use magpie_core::Timeline;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How many times the crawler is stepped per cycle.
const CRAWL_STEPS_PER_CYCLE: usize = 10;

/// How many peer push attempts before a timeline is dropped.
const PUSH_ATTEMPTS: u32 = 3;

/// Base delay between push retries; grows linearly per attempt.
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How many due queries are re-run per cycle.
const RETRIEVALS_PER_CYCLE: usize = 10;

/// Lifecycle state of the caretaker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaretakerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl CaretakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CaretakerState::Starting,
            1 => CaretakerState::Running,
            2 => CaretakerState::Stopping,
            _ => CaretakerState::Stopped,
        }
    }
}

/// Caretaker tuning knobs.
#[derive(Debug, Clone)]
pub struct CaretakerConfig {
    /// Peer base URLs to push to.
    pub backends: Vec<String>,

    /// Identity announced in the hello call.
    pub peername: String,
    pub http_port: u16,
    pub https_port: u16,

    /// Whether due scheduled queries are re-run.
    pub retrieval_enabled: bool,

    /// Pause between cycles; protects peers from hammering.
    pub cycle_throttle: Duration,

    /// Outbound drain: batch size cap and wait bound.
    pub batch_max: usize,
    pub batch_wait: Duration,

    /// Pause between scheduled retrievals within one cycle.
    pub retrieval_throttle: Duration,
}

impl Default for CaretakerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            peername: "anonymous".to_string(),
            http_port: 9000,
            https_port: 0,
            retrieval_enabled: true,
            cycle_throttle: Duration::from_secs(3),
            batch_max: 200,
            batch_wait: Duration::from_secs(2),
            retrieval_throttle: Duration::from_secs(1),
        }
    }
}

/// The synchronizer loop.
pub struct Caretaker {
    store: Arc<Store>,
    crawler: Arc<Crawler>,
    importer: Importer,
    queue: IndexQueue,
    client: PeerClient,
    /// Source used for scheduled re-retrieval; `None` disables it even
    /// when configuration enables retrieval.
    retrieval_scraper: Option<Arc<dyn Scraper>>,
    config: CaretakerConfig,
    state: AtomicU8,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl Caretaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        crawler: Arc<Crawler>,
        importer: Importer,
        queue: IndexQueue,
        client: PeerClient,
        retrieval_scraper: Option<Arc<dyn Scraper>>,
        config: CaretakerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        if !config.backends.is_empty() {
            // Writes only feed the outbound queue once someone pushes.
            store.enable_transmission();
        }
        Arc::new(Self {
            store,
            crawler,
            importer,
            queue,
            client,
            retrieval_scraper,
            config,
            state: AtomicU8::new(CaretakerState::Starting as u8),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn state(&self) -> CaretakerState {
        CaretakerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CaretakerState) {
        self.state.store(state as u8, Ordering::SeqCst);
        metrics::gauge!("caretaker_state").set(state as u8 as f64);
    }

    /// Signal the loop to stop. The current cycle's already-started I/O
    /// finishes; pending retries are abandoned.
    pub fn shutdown(&self) {
        self.set_state(CaretakerState::Stopping);
        let _ = self.shutdown_tx.try_send(());
    }

    /// Start the caretaker thread.
    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(&self) {
        info!("caretaker starting");
        self.hello_all();
        self.set_state(CaretakerState::Running);

        loop {
            if !self.sleep_interruptible(self.config.cycle_throttle) {
                break;
            }
            self.cycle();
            if self.state() == CaretakerState::Stopping {
                break;
            }
        }

        self.set_state(CaretakerState::Stopped);
        info!("caretaker stopped");
    }

    /// One synchronization cycle. Every step logs its own failures; no
    /// error here may kill the loop.
    fn cycle(&self) {
        let timeline = self
            .store
            .take_timeline(self.config.batch_max, self.config.batch_wait);
        if !timeline.is_empty() && !self.config.backends.is_empty() {
            for peer in &self.config.backends {
                self.push_with_retry(peer, &timeline);
                if self.state() == CaretakerState::Stopping {
                    return;
                }
            }
        }

        match self.importer.import_pass() {
            Ok(stats) if stats.files > 0 => {
                info!(files = stats.files, lines = stats.lines, "import pass");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "import pass failed"),
        }

        for _ in 0..CRAWL_STEPS_PER_CYCLE {
            if self.crawler.process() == 0 {
                break;
            }
            if self.state() == CaretakerState::Stopping {
                return;
            }
        }

        if self.config.retrieval_enabled {
            self.retrieval_pass();
        }
    }

    /// Announce liveness to every configured peer, once at startup.
    fn hello_all(&self) {
        for peer in &self.config.backends {
            if let Err(e) = self.client.hello(
                peer,
                &self.config.peername,
                self.config.http_port,
                self.config.https_port,
            ) {
                warn!(peer, error = %e, "hello failed");
            }
        }
    }

    /// Push a timeline to one peer, retrying with a growing delay. After
    /// the last attempt the timeline is dropped; delivery is best-effort
    /// and bounded memory wins over guarantees.
    fn push_with_retry(&self, peer: &str, timeline: &Timeline) {
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.client.push(peer, timeline) {
                Ok(()) => {
                    debug!(peer, count = timeline.len(), attempt, "push ok");
                    return;
                }
                Err(e) => {
                    warn!(peer, attempt, error = %e, "push failed");
                }
            }
            if attempt < PUSH_ATTEMPTS && !self.sleep_interruptible(PUSH_RETRY_DELAY * attempt) {
                return;
            }
        }
        metrics::counter!("peer_push_dropped_total").increment(1);
        warn!(peer, count = timeline.len(), "dropping timeline after failed retries");
    }

    /// Re-run due scheduled queries against the retrieval source, feeding
    /// results into the ingestion queue.
    fn retrieval_pass(&self) {
        let Some(scraper) = &self.retrieval_scraper else {
            return;
        };
        for entry in self.store.due_queries(RETRIEVALS_PER_CYCLE) {
            metrics::counter!("retrieval_queries_total").increment(1);
            match scraper.scrape(&entry.query) {
                Ok(timeline) => {
                    debug!(query = %entry.query, results = timeline.len(), "scheduled retrieval");
                    self.store
                        .record_query(&entry.query, entry.timezone_offset, timeline.period_millis(), false);
                    for message in timeline.iter() {
                        if let Some(author) = timeline.author_of(message) {
                            self.queue.enqueue(Envelope {
                                message: message.clone(),
                                author: author.clone(),
                                persist_log: true,
                                overwrite_author: false,
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(query = %entry.query, error = %e, "scheduled retrieval failed");
                    self.store
                        .record_query(&entry.query, entry.timezone_offset, None, false);
                }
            }
            if !self.sleep_interruptible(self.config.retrieval_throttle) {
                return;
            }
        }
    }

    /// Sleep that wakes early on shutdown. Returns false if the loop
    /// should stop.
    fn sleep_interruptible(&self, duration: Duration) -> bool {
        match self.shutdown_rx.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => self.state() != CaretakerState::Stopping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::store::{DumpPaths, MemoryIndex};
    use chrono::{TimeZone, Utc};
    use magpie_core::{Author, Message, SourceType};
    use std::time::Instant;
    use tempfile::TempDir;

    struct StubScraper;

    impl Scraper for StubScraper {
        fn scrape(&self, query: &str) -> Result<Timeline> {
            let mut timeline = Timeline::new();
            let mut message = Message {
                id: format!("msg-{query}"),
                screen_name: "alice".to_string(),
                created_at: Utc.with_ymd_and_hms(2015, 4, 1, 12, 0, 0).unwrap(),
                text: format!("{query} result"),
                mentions: Vec::new(),
                hashtags: Vec::new(),
                links: Vec::new(),
                place_name: None,
                source: SourceType::Scraped,
            };
            message.analyse();
            timeline.add(message, Author::new("alice"));
            Ok(timeline)
        }
    }

    fn caretaker(dir: &TempDir) -> (Arc<Caretaker>, Arc<Store>, IndexQueue) {
        let store = Arc::new(Store::new(Arc::new(MemoryIndex::new()), None));
        let scraper: Arc<dyn Scraper> = Arc::new(StubScraper);
        let crawler = Arc::new(Crawler::new(Arc::clone(&scraper), Arc::clone(&store)));
        let paths = DumpPaths::new(dir.path());
        paths.ensure().unwrap();
        let queue = IndexQueue::with_capacity(64);
        let importer = Importer::new(paths, queue.clone());
        let client = PeerClient::new(Duration::from_millis(200), 10).unwrap();
        let config = CaretakerConfig {
            cycle_throttle: Duration::from_millis(10),
            batch_wait: Duration::from_millis(10),
            retrieval_throttle: Duration::from_millis(1),
            ..Default::default()
        };
        let caretaker = Caretaker::new(
            store.clone(),
            crawler,
            importer,
            queue.clone(),
            client,
            Some(scraper),
            config,
        );
        (caretaker, store, queue)
    }

    #[test]
    fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let (caretaker, _store, _queue) = caretaker(&dir);
        assert_eq!(caretaker.state(), CaretakerState::Starting);

        let handle = Arc::clone(&caretaker).spawn();
        let deadline = Instant::now() + Duration::from_secs(5);
        while caretaker.state() != CaretakerState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(caretaker.state(), CaretakerState::Running);

        caretaker.shutdown();
        handle.join().unwrap();
        assert_eq!(caretaker.state(), CaretakerState::Stopped);
    }

    #[test]
    fn test_cycle_drives_crawler() {
        let dir = TempDir::new().unwrap();
        let (caretaker, store, _queue) = caretaker(&dir);
        caretaker.crawler.stack("fosdem", 1, true, true, false);

        let handle = Arc::clone(&caretaker).spawn();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(store.count() > 0);

        caretaker.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_interrupts_sleep_promptly() {
        let dir = TempDir::new().unwrap();
        let (caretaker, _store, _queue) = caretaker(&dir);
        let handle = Arc::clone(&caretaker).spawn();
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        caretaker.shutdown();
        handle.join().unwrap();
        // Well under the batch wait plus throttle worst case.
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
