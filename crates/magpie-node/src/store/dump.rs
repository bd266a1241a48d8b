//! Append-only message dump log.
//!
//! Every accepted message can be appended, as one JSON line, to a dump
//! file under `dump/own/`. Files are bucketed by month
//! (`messages_YYYY-MM.txt`); when the month rolls over, the finished
//! bucket is sealed by gzip-compressing it in place.
//!
//! The same directory layout carries the import hand-off: peers and
//! operators drop dump files into `dump/import/`, and fully processed
//! files are moved to `dump/imported/`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use magpie_core::Message;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// File name prefix that marks a file as a message dump.
pub const DUMP_PREFIX: &str = "messages_";

/// Directory layout for the dump log and the import hand-off.
#[derive(Debug, Clone)]
pub struct DumpPaths {
    /// Own dump output: `<data>/dump/own`.
    pub own: PathBuf,
    /// Inbound hand-off: `<data>/dump/import`.
    pub import: PathBuf,
    /// Processed files: `<data>/dump/imported`.
    pub imported: PathBuf,
}

impl DumpPaths {
    pub fn new(data_dir: &Path) -> Self {
        let dump = data_dir.join("dump");
        Self {
            own: dump.join("own"),
            import: dump.join("import"),
            imported: dump.join("imported"),
        }
    }

    /// Create all three directories.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.own)?;
        fs::create_dir_all(&self.import)?;
        fs::create_dir_all(&self.imported)?;
        Ok(())
    }
}

/// Internal state for the bucket currently being written.
struct CurrentBucket {
    writer: BufWriter<File>,
    path: PathBuf,
    label: String,
    lines: usize,
}

/// Writer for the own dump log.
///
/// Thread-safe: uses internal locking for appends.
pub struct DumpWriter {
    paths: DumpPaths,
    current: Mutex<Option<CurrentBucket>>,
    /// Finished buckets whose seal failed; retried on rotation and flush.
    pending_seal: Mutex<Vec<PathBuf>>,
}

impl DumpWriter {
    pub fn open(paths: DumpPaths) -> Result<Self> {
        paths.ensure()?;
        info!("dump writer initialized: dir={}", paths.own.display());
        Ok(Self {
            paths,
            current: Mutex::new(None),
            pending_seal: Mutex::new(Vec::new()),
        })
    }

    /// Append one message as a JSON line to the current monthly bucket,
    /// rotating first if the month changed.
    pub fn append(&self, message: &Message) -> Result<()> {
        self.append_at(message, Utc::now())
    }

    fn append_at(&self, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let label = bucket_label(now);
        let line = serde_json::to_string(message)?;

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| c.label != label) {
            if let Some(finished) = current.take() {
                let path = finished.path.clone();
                if let Err(e) = seal_bucket(finished) {
                    error!(file = %path.display(), error = %e,
                        "bucket seal failed, leaving uncompressed for retry");
                    self.pending_seal.lock().push(path);
                }
            }
            self.retry_pending_seals();
        }
        if current.is_none() {
            *current = Some(self.open_bucket(label)?);
        }
        let bucket = current
            .as_mut()
            .ok_or_else(|| Error::DumpLog("no open bucket".to_string()))?;
        bucket.writer.write_all(line.as_bytes())?;
        bucket.writer.write_all(b"\n")?;
        bucket.lines += 1;
        metrics::counter!("store_dump_lines_total").increment(1);
        Ok(())
    }

    fn open_bucket(&self, label: String) -> Result<CurrentBucket> {
        let path = self.paths.own.join(format!("{DUMP_PREFIX}{label}.txt"));
        let file = File::options().create(true).append(true).open(&path)?;
        debug!("opened dump bucket {}", path.display());
        Ok(CurrentBucket {
            writer: BufWriter::new(file),
            path,
            label,
            lines: 0,
        })
    }

    /// Flush buffered lines to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(bucket) = self.current.lock().as_mut() {
            bucket.writer.flush()?;
        }
        self.retry_pending_seals();
        Ok(())
    }

    /// Re-attempt sealing buckets whose earlier seal failed. Persistent
    /// failures stay on the list and keep being reported.
    fn retry_pending_seals(&self) {
        self.pending_seal.lock().retain(|path| {
            match seal_file(path) {
                Ok(()) => {
                    info!("sealed dump bucket {} on retry", path.display());
                    false
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e,
                        "bucket seal retry failed, operator attention needed");
                    true
                }
            }
        });
    }
}

impl Drop for DumpWriter {
    fn drop(&mut self) {
        if let Some(bucket) = self.current.lock().as_mut() {
            let _ = bucket.writer.flush();
        }
    }
}

/// Monthly bucket label for a timestamp.
fn bucket_label(t: DateTime<Utc>) -> String {
    t.format("%Y-%m").to_string()
}

/// Seal a finished bucket: flush, gzip in place, remove the original.
fn seal_bucket(mut bucket: CurrentBucket) -> Result<()> {
    bucket.writer.flush()?;
    drop(bucket.writer);
    seal_file(&bucket.path)?;
    info!("sealed dump bucket {}: {} lines", bucket.label, bucket.lines);
    Ok(())
}

/// Gzip a dump file in place and remove the original.
fn seal_file(path: &Path) -> Result<()> {
    let gz_path = path.with_extension("txt.gz");
    let input = File::open(path)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    std::io::copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?.flush()?;
    fs::remove_file(path)?;
    metrics::counter!("store_dump_buckets_sealed_total").increment(1);
    Ok(())
}

/// Open a dump file for line-by-line reading.
///
/// Automatically detects and handles gzip-compressed dumps (`.txt.gz`).
pub fn open_dump_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let is_gzip = path.extension().is_some_and(|ext| ext == "gz");
    if is_gzip {
        Ok(Box::new(BufReader::new(flate2::read::GzDecoder::new(
            BufReader::new(file),
        ))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Dump files waiting in the import directory, sorted by name.
pub fn list_import_files(paths: &DumpPaths) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(&paths.import)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_file() && name.starts_with(DUMP_PREFIX) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use magpie_core::SourceType;
    use tempfile::TempDir;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            screen_name: "alice".to_string(),
            created_at: Utc.with_ymd_and_hms(2015, 4, 1, 12, 0, 0).unwrap(),
            text: format!("message {id}"),
            mentions: Vec::new(),
            hashtags: Vec::new(),
            links: Vec::new(),
            place_name: None,
            source: SourceType::Scraped,
        }
    }

    #[test]
    fn test_append_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let paths = DumpPaths::new(dir.path());
        let writer = DumpWriter::open(paths.clone()).unwrap();

        let now = Utc.with_ymd_and_hms(2015, 4, 10, 8, 0, 0).unwrap();
        writer.append_at(&message("1"), now).unwrap();
        writer.append_at(&message("2"), now).unwrap();
        writer.flush().unwrap();

        let path = paths.own.join("messages_2015-04.txt");
        let reader = open_dump_reader(&path).unwrap();
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        let back: Message = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(back.id, "1");
    }

    #[test]
    fn test_month_rollover_seals_bucket() {
        let dir = TempDir::new().unwrap();
        let paths = DumpPaths::new(dir.path());
        let writer = DumpWriter::open(paths.clone()).unwrap();

        let april = Utc.with_ymd_and_hms(2015, 4, 30, 23, 0, 0).unwrap();
        let may = Utc.with_ymd_and_hms(2015, 5, 1, 1, 0, 0).unwrap();
        writer.append_at(&message("1"), april).unwrap();
        writer.append_at(&message("2"), may).unwrap();
        writer.flush().unwrap();

        let sealed = paths.own.join("messages_2015-04.txt.gz");
        assert!(sealed.exists());
        assert!(!paths.own.join("messages_2015-04.txt").exists());
        assert!(paths.own.join("messages_2015-05.txt").exists());

        // The sealed bucket is still readable through the gzip-aware reader.
        let reader = open_dump_reader(&sealed).unwrap();
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_unsealed_bucket_sealed_on_flush() {
        let dir = TempDir::new().unwrap();
        let paths = DumpPaths::new(dir.path());
        let writer = DumpWriter::open(paths.clone()).unwrap();

        // A bucket whose seal failed earlier lingers uncompressed.
        let stale = paths.own.join("messages_2015-03.txt");
        fs::write(&stale, "{}\n").unwrap();
        writer.pending_seal.lock().push(stale.clone());

        writer.flush().unwrap();
        assert!(!stale.exists());
        assert!(paths.own.join("messages_2015-03.txt.gz").exists());
        assert!(writer.pending_seal.lock().is_empty());
    }

    #[test]
    fn test_unsealable_bucket_stays_pending() {
        let dir = TempDir::new().unwrap();
        let paths = DumpPaths::new(dir.path());
        let writer = DumpWriter::open(paths.clone()).unwrap();

        let gone = paths.own.join("messages_1999-01.txt");
        writer.pending_seal.lock().push(gone);

        writer.flush().unwrap();
        assert_eq!(writer.pending_seal.lock().len(), 1);
    }

    #[test]
    fn test_list_import_files_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let paths = DumpPaths::new(dir.path());
        paths.ensure().unwrap();

        fs::write(paths.import.join("messages_2015-03.txt"), "").unwrap();
        fs::write(paths.import.join("messages_2015-02.txt.gz"), "").unwrap();
        fs::write(paths.import.join("notes.txt"), "").unwrap();

        let files = list_import_files(&paths).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["messages_2015-02.txt.gz", "messages_2015-03.txt"]);
    }
}
