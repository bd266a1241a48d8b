//! Magpie node daemon.
//!
//! Wires the store, ingestion queue, crawler and caretaker together and
//! runs until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (data under ./data, no peers)
//! magpie-node
//!
//! # Bootstrap from an upstream node and seed the crawl frontier
//! MAGPIE_BACKENDS=http://peer:9000 magpie-node --seed fosdem --seed-depth 2
//! ```
//!
//! Configuration comes from `MAGPIE_*` environment variables (see
//! [`magpie_node::config::Config`]); command line flags cover the
//! run-scoped knobs.
//!
//! # Graceful Shutdown
//!
//! SIGINT stops the caretaker loop, drains the ingestion worker, and
//! flushes the dump log before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use magpie_core::metrics::{init_metrics, start_metrics_server};
use magpie_core::Timeline;
use magpie_node::caretaker::{Caretaker, CaretakerConfig, CaretakerState};
use magpie_node::config::Config;
use magpie_node::crawler::Crawler;
use magpie_node::importer::Importer;
use magpie_node::peers::PeerClient;
use magpie_node::queue::{IndexQueue, IndexWorker};
use magpie_node::scrape::{PeerSearchScraper, Scraper};
use magpie_node::store::{DumpPaths, DumpWriter, MemoryIndex, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Magpie harvesting node daemon.
#[derive(Parser, Debug)]
#[command(name = "magpie-node")]
#[command(about = "Distributed social-message harvesting and search node")]
#[command(version)]
struct Args {
    /// Upstream node to scrape from (defaults to the first backend)
    #[arg(long)]
    upstream: Option<String>,

    /// Seed query for the crawl frontier
    #[arg(long)]
    seed: Option<String>,

    /// Depth for the seed query
    #[arg(long, default_value = "2")]
    seed_depth: u8,

    /// Disable the own dump log
    #[arg(long)]
    no_dump: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

/// Scraper used when no upstream is configured; the frontier then only
/// consumes what imports and peers provide.
struct IdleScraper;

impl Scraper for IdleScraper {
    fn scrape(&self, _query: &str) -> magpie_node::Result<Timeline> {
        Ok(Timeline::new())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("magpie_node=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    tracing::info!("magpie node starting...");

    // The runtime only carries the metrics endpoint; everything else runs
    // on plain threads.
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    if args.metrics_port > 0 {
        let handle = init_metrics();
        runtime.block_on(start_metrics_server(args.metrics_port, handle))?;
    }

    // Storage
    let paths = DumpPaths::new(&config.data_dir);
    paths.ensure()?;
    let dump = if args.no_dump {
        None
    } else {
        Some(DumpWriter::open(paths.clone())?)
    };
    let store = Arc::new(Store::new(Arc::new(MemoryIndex::new()), dump));

    // Ingestion queue and its drain worker
    let queue = IndexQueue::new();
    let worker_running = Arc::new(AtomicBool::new(true));
    let worker = IndexWorker::spawn(
        Arc::clone(&store),
        queue.clone(),
        Arc::clone(&worker_running),
    );

    // Peer client and scraper
    let client = PeerClient::new(config.search_timeout, config.search_count_max)?;
    let upstream = args
        .upstream
        .clone()
        .or_else(|| config.backends.first().cloned());
    let scraper: Arc<dyn Scraper> = match &upstream {
        Some(peer) => {
            tracing::info!(upstream = %peer, "scraping via upstream node");
            Arc::new(PeerSearchScraper::new(client.clone(), peer.clone()))
        }
        None => {
            tracing::info!("no upstream configured; frontier will not scrape");
            Arc::new(IdleScraper)
        }
    };

    // Crawler and seed
    let crawler = Arc::new(Crawler::new(Arc::clone(&scraper), Arc::clone(&store)));
    if let Some(seed) = &args.seed {
        crawler.stack(seed, args.seed_depth, true, true, false);
        tracing::info!(seed = %seed, depth = args.seed_depth, "frontier seeded");
    }

    // Caretaker
    let retrieval_scraper = upstream.is_some().then(|| Arc::clone(&scraper));
    let caretaker = Caretaker::new(
        Arc::clone(&store),
        Arc::clone(&crawler),
        Importer::new(paths, queue.clone()),
        queue.clone(),
        client,
        retrieval_scraper,
        CaretakerConfig {
            backends: config.backends.clone(),
            peername: config.peername.clone(),
            http_port: config.http_port,
            https_port: config.https_port,
            retrieval_enabled: config.retrieval_enabled,
            ..Default::default()
        },
    );
    let caretaker_handle = Arc::clone(&caretaker).spawn();

    // Graceful shutdown on Ctrl+C
    {
        let caretaker = Arc::clone(&caretaker);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, stopping gracefully...");
            caretaker.shutdown();
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    // Run until the caretaker stops.
    caretaker_handle
        .join()
        .map_err(|_| anyhow::anyhow!("caretaker thread panicked"))?;
    debug_assert_eq!(caretaker.state(), CaretakerState::Stopped);

    // Drain and stop the ingestion worker.
    tracing::info!("draining ingestion queue ({} pending)...", queue.len());
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while !queue.is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    worker_running.store(false, Ordering::SeqCst);
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("queue worker thread panicked"))?;

    store.flush()?;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Messages stored:   {}", store.count());
    tracing::info!("Queries tracked:   {}", store.scheduled_len());
    tracing::info!("Frontier pending:  {}", crawler.pending_len());

    Ok(())
}
