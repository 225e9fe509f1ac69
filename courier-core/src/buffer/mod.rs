//! Offline envelope buffer.
//!
//! Envelopes whose send failed are kept as one `<event_id>.envelope` file
//! each and resent later by the [`BufferFlusher`]. When the directory is
//! unusable the pipeline runs with a [`NoOpBuffer`] instead.

mod flusher;

pub use flusher::{BufferFlusher, FlushSummary};

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::client_report::ClientReportRecorder;
use crate::config::BufferConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::transport::{RetrySink, SendOutcome};
use crate::types::DiscardReason;

/// File extension of stored envelopes
pub const ENVELOPE_EXTENSION: &str = "envelope";

/// Durable store for envelopes awaiting a resend
pub trait EnvelopeBuffer: Send + Sync + fmt::Debug {
    /// Store an envelope.
    ///
    /// Fails with [`Error::BufferFull`] at capacity, after the envelope was
    /// recorded as `cache_overflow`.
    fn add(&self, envelope: &Envelope) -> Result<()>;

    /// Stored envelopes as of the call; unreadable entries are skipped
    fn iter(&self) -> Box<dyn Iterator<Item = Envelope> + Send + '_>;

    /// Remove a stored envelope, best effort
    fn discard(&self, envelope: &Envelope);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False if stored envelopes do not survive the process
    fn is_durable(&self) -> bool;
}

/// Directory-backed buffer, one file per envelope
#[derive(Debug)]
pub struct DiskBuffer {
    dir: PathBuf,
    max_events: usize,
    recorder: Arc<ClientReportRecorder>,
    /// Held from the capacity check through the rename
    add_lock: Mutex<()>,
}

impl DiskBuffer {
    /// Open (creating if needed) a buffer directory
    pub fn open(
        dir: impl Into<PathBuf>,
        max_events: usize,
        recorder: Arc<ClientReportRecorder>,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let probe = dir.join(".courier-probe");
        fs::write(&probe, b"")
            .map_err(|e| Error::Storage(format!("{} is not writable: {}", dir.display(), e)))?;
        let _ = fs::remove_file(&probe);

        Ok(Self {
            dir,
            max_events,
            recorder,
            add_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, event_id: Uuid) -> PathBuf {
        self.dir
            .join(format!("{}.{}", event_id.simple(), ENVELOPE_EXTENSION))
    }

    /// Stored files, oldest first
    fn stored_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list offline buffer");
                return Vec::new();
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_envelope_file(path))
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();
        files.sort();
        files.into_iter().map(|(_, path)| path).collect()
    }
}

fn is_envelope_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ENVELOPE_EXTENSION)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.'))
}

fn read_envelope(path: &Path) -> Option<Envelope> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read buffered envelope");
            return None;
        }
    };
    match Envelope::from_bytes(&bytes) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt buffered envelope");
            None
        }
    }
}

impl EnvelopeBuffer for DiskBuffer {
    fn add(&self, envelope: &Envelope) -> Result<()> {
        let path = self.path_for(envelope.event_id());
        let _guard = self.add_lock.lock();
        if path.exists() {
            tracing::debug!(event_id = %envelope.event_id(), "Envelope already buffered");
            return Ok(());
        }

        let stored = self.len();
        if stored >= self.max_events {
            tracing::warn!(
                event_id = %envelope.event_id(),
                max_events = self.max_events,
                "Offline buffer full, dropping envelope"
            );
            self.recorder
                .record_lost_envelope(DiscardReason::CacheOverflow, envelope);
            return Err(Error::BufferFull(stored));
        }

        let tmp = self
            .dir
            .join(format!(".{}.tmp", envelope.event_id().simple()));
        let write = || -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            envelope.write_to(&mut file)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        tracing::debug!(event_id = %envelope.event_id(), path = %path.display(), "Envelope buffered");
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Envelope> + Send + '_> {
        Box::new(
            self.stored_files()
                .into_iter()
                .filter_map(|path| read_envelope(&path)),
        )
    }

    fn discard(&self, envelope: &Envelope) {
        let path = self.path_for(envelope.event_id());
        match fs::remove_file(&path) {
            Ok(()) => tracing::trace!(event_id = %envelope.event_id(), "Buffered envelope discarded"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to discard buffered envelope")
            }
        }
    }

    fn len(&self) -> usize {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| is_envelope_file(&entry.path()))
                .count(),
            Err(_) => 0,
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Accepts and drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBuffer;

impl EnvelopeBuffer for NoOpBuffer {
    fn add(&self, envelope: &Envelope) -> Result<()> {
        tracing::trace!(event_id = %envelope.event_id(), "No offline buffer, envelope not stored");
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Envelope> + Send + '_> {
        Box::new(std::iter::empty())
    }

    fn discard(&self, _envelope: &Envelope) {}

    fn len(&self) -> usize {
        0
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Buffer for the configuration; falls back to [`NoOpBuffer`] when
/// disabled or when the directory cannot be used
pub fn open_buffer(
    config: &BufferConfig,
    recorder: Arc<ClientReportRecorder>,
) -> Arc<dyn EnvelopeBuffer> {
    if !config.enabled {
        tracing::debug!("Offline buffer disabled");
        return Arc::new(NoOpBuffer);
    }

    let dir = config.resolved_dir();
    match DiskBuffer::open(&dir, config.max_events, recorder) {
        Ok(buffer) => {
            tracing::info!(
                dir = %dir.display(),
                max_events = config.max_events,
                stored = buffer.len(),
                "Offline buffer ready"
            );
            Arc::new(buffer)
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Offline buffer unavailable, envelopes will not be stored");
            Arc::new(NoOpBuffer)
        }
    }
}

/// Stores failed captures in the buffer.
///
/// HTTP rejections are final and recorded as `network_error` instead.
#[derive(Debug)]
pub struct BufferSink {
    buffer: Arc<dyn EnvelopeBuffer>,
    recorder: Arc<ClientReportRecorder>,
}

impl BufferSink {
    pub fn new(buffer: Arc<dyn EnvelopeBuffer>, recorder: Arc<ClientReportRecorder>) -> Self {
        Self { buffer, recorder }
    }
}

impl RetrySink for BufferSink {
    fn store(&self, envelope: Envelope, outcome: SendOutcome) {
        if !outcome.is_retryable() {
            self.recorder
                .record_lost_envelope(DiscardReason::NetworkError, &envelope);
            return;
        }

        match self.buffer.add(&envelope) {
            Ok(()) => {}
            Err(Error::BufferFull(_)) => {}
            Err(e) => {
                tracing::error!(event_id = %envelope.event_id(), error = %e, "Failed to buffer envelope");
                self.recorder
                    .record_lost_envelope(DiscardReason::NetworkError, &envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Item;
    use crate::types::{DataCategory, ItemType};
    use tempfile::TempDir;

    fn event() -> Envelope {
        Envelope::from_item(
            Item::json(ItemType::Event, &serde_json::json!({"message": "boom"})).unwrap(),
        )
    }

    fn buffer(dir: &TempDir, max_events: usize) -> (DiskBuffer, Arc<ClientReportRecorder>) {
        let recorder = Arc::new(ClientReportRecorder::new());
        let buffer = DiskBuffer::open(dir.path(), max_events, Arc::clone(&recorder)).unwrap();
        (buffer, recorder)
    }

    #[test]
    fn test_add_iter_discard() {
        let dir = TempDir::new().unwrap();
        let (buffer, _) = buffer(&dir, 10);
        let envelope = event();

        buffer.add(&envelope).unwrap();
        assert_eq!(buffer.len(), 1);
        assert!(dir
            .path()
            .join(format!("{}.envelope", envelope.event_id().simple()))
            .exists());

        let stored: Vec<_> = buffer.iter().collect();
        assert_eq!(stored, vec![envelope.clone()]);

        buffer.discard(&envelope);
        assert!(buffer.is_empty());
        buffer.discard(&envelope);
    }

    #[test]
    fn test_same_id_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let (buffer, _) = buffer(&dir, 10);
        let envelope = event();

        buffer.add(&envelope).unwrap();
        buffer.add(&envelope).unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_capacity_rejects_and_records_cache_overflow() {
        let dir = TempDir::new().unwrap();
        let (buffer, recorder) = buffer(&dir, 2);

        buffer.add(&event()).unwrap();
        buffer.add(&event()).unwrap();
        assert!(matches!(buffer.add(&event()), Err(Error::BufferFull(2))));
        assert_eq!(buffer.len(), 2);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].reason, DiscardReason::CacheOverflow);
        assert_eq!(snapshot[0].category, DataCategory::Error);
        assert_eq!(snapshot[0].quantity, 1);
    }

    #[test]
    fn test_concurrent_adds_respect_capacity() {
        let dir = TempDir::new().unwrap();
        let (buffer, recorder) = buffer(&dir, 2);
        let buffer = Arc::new(buffer);
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let envelope = event();
                    barrier.wait();
                    buffer.add(&envelope).is_ok()
                })
            })
            .collect();
        let stored = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(stored, 2);
        assert_eq!(buffer.len(), 2);
        assert_eq!(recorder.snapshot()[0].quantity, 14);
    }

    #[test]
    fn test_corrupt_and_foreign_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (buffer, _) = buffer(&dir, 10);
        let envelope = event();
        buffer.add(&envelope).unwrap();

        fs::write(dir.path().join("garbage.envelope"), b"not an envelope").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let stored: Vec<_> = buffer.iter().collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_id(), envelope.event_id());
    }

    #[test]
    fn test_iteration_tolerates_vanished_files() {
        let dir = TempDir::new().unwrap();
        let (buffer, _) = buffer(&dir, 10);
        let first = event();
        let second = event();
        buffer.add(&first).unwrap();
        buffer.add(&second).unwrap();

        let mut iter = buffer.iter();
        let seen = iter.next().unwrap();
        let other = if seen.event_id() == first.event_id() {
            &second
        } else {
            &first
        };
        buffer.discard(other);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_open_buffer_falls_back_to_noop() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        let config = BufferConfig {
            dir: Some(blocker.join("envelopes")),
            ..BufferConfig::default()
        };
        let buffer = open_buffer(&config, Arc::new(ClientReportRecorder::new()));
        assert!(!buffer.is_durable());
        assert!(buffer.add(&event()).is_ok());
        assert!(buffer.is_empty());

        let disabled = BufferConfig {
            enabled: false,
            dir: Some(dir.path().to_path_buf()),
            ..BufferConfig::default()
        };
        assert!(!open_buffer(&disabled, Arc::new(ClientReportRecorder::new())).is_durable());
    }

    #[test]
    fn test_sink_stores_network_failures_and_records_rejections() {
        let dir = TempDir::new().unwrap();
        let (disk, recorder) = buffer(&dir, 10);
        let disk: Arc<dyn EnvelopeBuffer> = Arc::new(disk);
        let sink = BufferSink::new(Arc::clone(&disk), Arc::clone(&recorder));

        sink.store(event(), SendOutcome::NetworkError);
        sink.store(event(), SendOutcome::Throttled);
        assert_eq!(disk.len(), 2);
        assert!(!recorder.has_pending());

        sink.store(event(), SendOutcome::HttpError(400));
        assert_eq!(disk.len(), 2);
        assert_eq!(recorder.snapshot()[0].reason, DiscardReason::NetworkError);
    }
}
