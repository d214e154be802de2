//! Bulk archive of received files.
//!
//! Once the receiver holds [`ARCHIVE_THRESHOLD`](crate::core::config::ARCHIVE_THRESHOLD)
//! files, every further completed file schedules a fresh zip over the
//! already-materialized blobs. The build runs on the blocking pool so
//! reception never waits for it; a newer build supersedes an older one that
//! has not finished yet.

use super::sink::DownloadSink;
use super::{notify, EventSender, TransferEvent};
use crate::core::config::ARCHIVE_NAME;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build a zip over `(name, bytes)` entries. Duplicate names get a ` (n)`
/// suffix.
pub fn build_zip(entries: &[(String, Bytes)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut used = HashSet::new();
    for (name, bytes) in entries {
        let entry_name = dedupe_name(&mut used, name);
        zip.start_file(entry_name, options)?;
        zip.write_all(bytes)?;
    }
    Ok(zip.finish()?.into_inner())
}

fn dedupe_name(used: &mut HashSet<String>, name: &str) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

type LatestArchive = Arc<Mutex<Option<(usize, Bytes)>>>;

pub struct ArchiveBuilder {
    threshold: usize,
    scheduled_for: usize,
    task: Option<JoinHandle<()>>,
    latest: LatestArchive,
    sink: Option<Arc<dyn DownloadSink>>,
    events: Option<EventSender>,
}

impl ArchiveBuilder {
    pub fn new(
        threshold: usize,
        sink: Option<Arc<dyn DownloadSink>>,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            threshold,
            scheduled_for: 0,
            task: None,
            latest: Arc::new(Mutex::new(None)),
            sink,
            events,
        }
    }

    /// Schedule a build if the file count reached the threshold and grew
    /// since the last build.
    pub fn on_files_changed(&mut self, entries: Vec<(String, Bytes)>) {
        let count = entries.len();
        if count < self.threshold || count <= self.scheduled_for {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.scheduled_for = count;

        let latest = self.latest.clone();
        let sink = self.sink.clone();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            let built = tokio::task::spawn_blocking(move || build_zip(&entries)).await;
            let archive = match built {
                Ok(Ok(zip)) => Bytes::from(zip),
                Ok(Err(e)) => {
                    warn!(event = "archive_failure", files = count, error = %e, "Failed to build archive");
                    return;
                }
                Err(e) => {
                    warn!(event = "archive_failure", files = count, error = %e, "Archive task failed");
                    return;
                }
            };

            let path = match sink {
                Some(sink) => {
                    let bytes = archive.clone();
                    match tokio::task::spawn_blocking(move || sink.replace(ARCHIVE_NAME, &bytes))
                        .await
                    {
                        Ok(Ok(path)) => path,
                        Ok(Err(e)) => {
                            warn!(event = "archive_write_failure", error = %e, "Failed to store archive");
                            None
                        }
                        Err(e) => {
                            warn!(event = "archive_write_failure", error = %e, "Archive write task failed");
                            None
                        }
                    }
                }
                None => None,
            };

            info!(event = "archive_ready", files = count, bytes = archive.len(), "Bulk archive ready");
            *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some((count, archive));
            notify(&events, TransferEvent::ArchiveReady { files: count, path });
        }));
    }

    /// Wait for the pending build, if any.
    pub async fn settle(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Wait for any pending build and return the newest archive.
    pub async fn finish(mut self) -> Option<Bytes> {
        self.settle().await;
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest.as_ref().map(|(_, bytes)| bytes.clone())
    }
}
