//! Dump file importer.
//!
//! Other nodes and operators hand over message dumps by dropping them
//! into the import directory. One import pass consumes every waiting
//! file: each JSON line becomes an ingestion envelope, malformed lines
//! are counted and skipped, and a fully read file is moved to the
//! imported directory so it is never read twice.

use crate::error::Result;
use crate::queue::{Envelope, IndexQueue};
use crate::store::dump::{list_import_files, open_dump_reader, DumpPaths};
use magpie_core::{Author, Message, SourceType};
use serde_json::Value;
use std::fs;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Idle sleep between standalone worker passes.
const IDLE_SLEEP: Duration = Duration::from_secs(10);

/// Outcome of one import pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub files: usize,
    pub lines: usize,
    pub malformed: usize,
    /// Files abandoned because of a read fault (truncated gzip etc).
    pub failed: usize,
}

/// Imports dump files into the ingestion queue.
pub struct Importer {
    paths: DumpPaths,
    queue: IndexQueue,
}

impl Importer {
    pub fn new(paths: DumpPaths, queue: IndexQueue) -> Self {
        Self { paths, queue }
    }

    /// Consume every dump file currently in the import directory.
    ///
    /// A file that fails mid-read (a truncated or corrupt dump) is moved
    /// out of the import directory like a finished one, so it cannot
    /// block the files sorted after it; lines enqueued before the fault
    /// are deduplicated by the write path on any re-import.
    pub fn import_pass(&self) -> Result<ImportStats> {
        let mut stats = ImportStats::default();
        for path in list_import_files(&self.paths)? {
            let (lines, malformed) = match self.import_file(&path) {
                Ok(counts) => counts,
                Err(e) => {
                    stats.failed += 1;
                    metrics::counter!("import_files_failed_total").increment(1);
                    error!(file = %path.display(), error = %e, "unreadable dump file, setting aside");
                    if let Err(e) = self.shift_to_imported(&path) {
                        error!(file = %path.display(), error = %e, "could not move unreadable dump file");
                    }
                    continue;
                }
            };
            stats.files += 1;
            stats.lines += lines;
            stats.malformed += malformed;

            self.shift_to_imported(&path)?;
            metrics::counter!("import_files_total").increment(1);
            info!(
                file = %path.display(),
                lines,
                malformed,
                "imported dump file"
            );
        }
        Ok(stats)
    }

    fn shift_to_imported(&self, path: &Path) -> Result<()> {
        let target = self.paths.imported.join(
            path.file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("dump")),
        );
        fs::rename(path, &target)?;
        Ok(())
    }

    /// Run import passes on a dedicated thread until `running` clears.
    /// The caretaker normally drives imports from its own cycle; this
    /// wrapper serves deployments that run the importer standalone.
    pub fn spawn(self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            info!("import worker started");
            while running.load(Ordering::SeqCst) {
                match self.import_pass() {
                    Ok(stats) if stats.files > 0 => continue,
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "import pass failed"),
                }
                std::thread::sleep(IDLE_SLEEP);
            }
            info!("import worker stopped");
        })
    }

    fn import_file(&self, path: &Path) -> Result<(usize, usize)> {
        let reader = open_dump_reader(path)?;
        let mut lines = 0usize;
        let mut malformed = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            metrics::counter!("import_lines_total").increment(1);
            match parse_dump_line(&line) {
                Some((message, author)) => {
                    self.queue.enqueue(Envelope {
                        message,
                        author,
                        // Imported records came from a dump; do not dump
                        // them again.
                        persist_log: false,
                        overwrite_author: false,
                    });
                }
                None => {
                    malformed += 1;
                    metrics::counter!("import_lines_malformed_total").increment(1);
                    warn!(file = %path.display(), "skipping malformed dump line");
                }
            }
        }
        Ok((lines, malformed))
    }
}

/// Parse one dump line. The line is a message record, optionally carrying
/// an embedded `user` object; without one, a minimal author is derived
/// from the screen name.
fn parse_dump_line(line: &str) -> Option<(Message, Author)> {
    let mut doc: Value = serde_json::from_str(line).ok()?;
    let author = doc
        .as_object_mut()?
        .remove("user")
        .and_then(|user| serde_json::from_value::<Author>(user).ok());
    let mut message: Message = serde_json::from_value(doc).ok()?;
    message.source = SourceType::Import;
    message.analyse();
    let author = author.unwrap_or_else(|| Author::new(message.screen_name.clone()));
    Some((message, author))
}
