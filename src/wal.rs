//! WAL instance management.
//!
//! The [`Wal`] struct owns the active segment and its buffered writer,
//! handling:
//! - Appends and checkpoint records through an in-memory write buffer
//! - Segment rotation when size limits are reached, with retention
//! - A background task that periodically flushes (and optionally fsyncs)
//! - Replay of the log, in full or from the most recent checkpoint
//! - Scan-and-truncate repair of a torn or corrupted active segment
//!
//! # File Layout
//!
//! ```text
//! /wal-dir/
//!   segment-0    # Oldest retained segment
//!   segment-1
//!   segment-2    # Active segment (current writes)
//! ```
//!
//! # Durability
//!
//! Appends land in an in-memory buffer and reach disk on the next sync:
//! the periodic background flush, an explicit [`Wal::sync`], the pre-sync
//! performed by [`Wal::create_checkpoint`], or [`Wal::close`]. Readers open
//! the segment with a fresh handle and therefore observe flushed data only.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::{WalError, WalResult};
use crate::record::Record;
use crate::replay;
use crate::segment;

/// Default rotation threshold in bytes (64 MB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of segment files retained.
pub const DEFAULT_MAX_SEGMENTS: u64 = 8;

/// Default period of the background sync task.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(200);

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for segment files. Created if absent.
    pub dir: PathBuf,
    /// When true, every sync also fsyncs the active segment file.
    pub enable_fsync: bool,
    /// Rotation threshold: a new segment is started once the active
    /// segment's on-disk plus buffered size would reach this many bytes.
    pub max_file_size: u64,
    /// Retention bound: once the active segment's index reaches this
    /// count, the oldest segment is deleted at rotation.
    pub max_segments: u64,
    /// Period of the background sync task.
    pub sync_interval: Duration,
}

impl WalConfig {
    /// Creates a configuration with defaults for the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enable_fsync: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Enables or disables fsync on every sync.
    #[must_use]
    pub const fn with_fsync(mut self, enable: bool) -> Self {
        self.enable_fsync = enable;
        self
    }

    /// Sets the rotation threshold in bytes.
    #[must_use]
    pub const fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets the number of segment files retained.
    #[must_use]
    pub const fn with_max_segments(mut self, count: u64) -> Self {
        self.max_segments = count;
        self
    }

    /// Sets the background sync period.
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any bound is zero.
    pub fn validate(&self) -> WalResult<()> {
        if self.max_file_size == 0 {
            return Err(WalError::Io {
                operation: "config",
                message: "max_file_size must be positive".to_string(),
            });
        }
        if self.max_segments == 0 {
            return Err(WalError::Io {
                operation: "config",
                message: "max_segments must be positive".to_string(),
            });
        }
        if self.sync_interval.is_zero() {
            return Err(WalError::Io {
                operation: "config",
                message: "sync_interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// State shared between the WAL handle and the background sync task.
struct WalInner {
    /// Configuration.
    config: WalConfig,
    /// Buffered writer over the active segment, in append mode.
    writer: BufWriter<File>,
    /// Path of the active segment.
    active_path: PathBuf,
    /// Index of the active segment.
    segment_index: u64,
    /// Last assigned sequence number.
    last_seq: u64,
    /// When the buffer was last flushed. The sync task sleeps until
    /// `last_sync + sync_interval`, so an explicit sync resets its timer.
    last_sync: Instant,
    /// Set by `close`; all operations are rejected afterwards.
    closed: bool,
}

/// Write-Ahead Log.
///
/// Cloning yields another handle to the same instance; all handles share
/// one mutex-guarded state and one background sync task.
#[derive(Clone)]
pub struct Wal {
    /// Shared state protected by mutex.
    inner: Arc<Mutex<WalInner>>,
    /// Wakes the sync task early (used by close).
    cancel: Arc<Notify>,
    /// Cleared by close to stop the sync task.
    syncer_running: Arc<AtomicBool>,
}

impl Wal {
    /// Opens a WAL in the given directory, creating it if needed.
    ///
    /// An empty directory gets a fresh `segment-0`. Otherwise the
    /// highest-index segment becomes the active one and the last sequence
    /// number is recovered by scanning it; a torn tail ends the scan at the
    /// last intact record (run [`Wal::repair`] to truncate it).
    ///
    /// The background sync task starts immediately, so `open` must be
    /// called within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or scanned, a
    /// segment file name is malformed, or the active segment cannot be
    /// opened.
    pub async fn open(config: WalConfig) -> WalResult<Self> {
        config.validate()?;

        fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| WalError::io("create_dir_all", e))?;

        let segments = segment::list_segments(&config.dir).await?;
        let segment_index = segments.last().map_or(0, |(index, _)| *index);

        let active_path = segment::segment_path(&config.dir, segment_index);
        let file = segment::create_segment(&config.dir, segment_index).await?;

        let data = fs::read(&active_path)
            .await
            .map_err(|e| WalError::io("read_segment", e))?;
        let last_seq = replay::recover_last_seq(data.into());

        info!(
            dir = %config.dir.display(),
            segment = segment_index,
            last_seq,
            "opened WAL"
        );

        let inner = Arc::new(Mutex::new(WalInner {
            config,
            writer: BufWriter::new(file),
            active_path,
            segment_index,
            last_seq,
            last_sync: Instant::now(),
            closed: false,
        }));

        let wal = Self {
            inner,
            cancel: Arc::new(Notify::new()),
            syncer_running: Arc::new(AtomicBool::new(true)),
        };
        wal.spawn_syncer();

        Ok(wal)
    }

    /// Spawns the background sync task.
    ///
    /// The task sleeps until one sync interval past the last sync, flushes,
    /// and goes back to sleep. Sync errors are logged and retried on the
    /// next tick; only cancellation stops the task.
    fn spawn_syncer(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = Arc::clone(&self.cancel);
        let running = Arc::clone(&self.syncer_running);

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let guard = inner.lock().await;
                    if guard.closed {
                        break;
                    }
                    guard.last_sync + guard.config.sync_interval
                };

                tokio::select! {
                    () = time::sleep_until(deadline) => {}
                    () = cancel.notified() => {}
                }

                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let mut guard = inner.lock().await;
                if guard.closed {
                    break;
                }
                // An explicit sync may have pushed the deadline forward
                // while we slept; only flush once the interval has truly
                // elapsed.
                if Instant::now() >= guard.last_sync + guard.config.sync_interval {
                    if let Err(e) = sync_inner(&mut guard).await {
                        warn!(error = %e, "background sync failed");
                    }
                }
            }
        });
    }

    /// Appends a payload to the log.
    ///
    /// Returns the assigned sequence number. The record is buffered; it
    /// becomes durable on the next sync (see the durability notes on this
    /// module).
    ///
    /// # Errors
    /// Returns an error if the WAL is closed or the write fails at the
    /// frame layer. The instance stays usable after an I/O error.
    pub async fn append(&self, payload: Bytes) -> WalResult<u64> {
        self.write_record(payload, false).await
    }

    /// Appends a checkpoint record to the log.
    ///
    /// Before the checkpoint record is written, all previously buffered
    /// records are flushed (and fsynced when enabled), so everything that
    /// precedes the marker is durable once this returns. The checkpoint
    /// record itself becomes durable on the next sync.
    ///
    /// # Errors
    /// Returns an error if the WAL is closed, the pre-sync fails, or the
    /// write fails.
    pub async fn create_checkpoint(&self, payload: Bytes) -> WalResult<u64> {
        self.write_record(payload, true).await
    }

    async fn write_record(&self, payload: Bytes, checkpoint: bool) -> WalResult<u64> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(WalError::Closed);
        }

        rotate_if_needed(&mut guard).await?;

        guard.last_seq += 1;
        let seq = guard.last_seq;

        if checkpoint {
            // Everything preceding the checkpoint marker must be durable
            // before the marker enters the buffer.
            sync_inner(&mut guard).await?;
        }

        let record = Record::new(seq, payload, checkpoint);
        let frame = record.encode_framed();
        guard
            .writer
            .write_all(&frame)
            .await
            .map_err(|e| WalError::io("append", e))?;

        debug!(seq, bytes = frame.len(), checkpoint, "appended record");
        Ok(seq)
    }

    /// Flushes the write buffer to the active segment, fsyncing when
    /// enabled, and resets the background sync timer.
    ///
    /// # Errors
    /// Returns an error if the WAL is closed or the flush/fsync fails.
    pub async fn sync(&self) -> WalResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(WalError::Closed);
        }
        sync_inner(&mut guard).await
    }

    /// Reads all records from the active segment.
    ///
    /// Opens the segment with a fresh read-only handle, so only flushed
    /// data is observed. With `from_checkpoint` set, returns the records
    /// from the most recent checkpoint (inclusive) onward, or an empty
    /// vector if the segment holds no checkpoint.
    ///
    /// # Errors
    /// Returns an error if the WAL is closed, the segment cannot be read,
    /// or a corrupted frame is encountered.
    pub async fn read_all(&self, from_checkpoint: bool) -> WalResult<Vec<Record>> {
        let path = {
            let guard = self.inner.lock().await;
            if guard.closed {
                return Err(WalError::Closed);
            }
            guard.active_path.clone()
        };

        let data = fs::read(&path)
            .await
            .map_err(|e| WalError::io("read_segment", e))?;
        let (records, checkpoint_seq) = replay::read_records(data.into(), from_checkpoint)?;

        if from_checkpoint && checkpoint_seq == 0 {
            return Ok(Vec::new());
        }
        Ok(records)
    }

    /// Reads records from every segment whose index is at least `offset`,
    /// concatenated in segment order.
    ///
    /// With `from_checkpoint` set, each checkpoint whose sequence number
    /// exceeds the previously seen one restarts accumulation at that
    /// checkpoint (inclusive). Unlike [`Wal::read_all`], when no checkpoint
    /// exists anywhere the full concatenation is returned.
    ///
    /// # Errors
    /// Returns an error if the WAL is closed, the directory cannot be
    /// scanned, a segment cannot be read, or a corrupted frame is
    /// encountered.
    pub async fn read_all_from_offset(
        &self,
        offset: u64,
        from_checkpoint: bool,
    ) -> WalResult<Vec<Record>> {
        let dir = {
            let guard = self.inner.lock().await;
            if guard.closed {
                return Err(WalError::Closed);
            }
            guard.config.dir.clone()
        };

        let segments = segment::list_segments(&dir).await?;

        let mut records = Vec::new();
        let mut prev_checkpoint = 0u64;

        for (index, path) in segments {
            if index < offset {
                continue;
            }
            let data = fs::read(&path)
                .await
                .map_err(|e| WalError::io("read_segment", e))?;
            let (from_segment, checkpoint_seq) =
                replay::read_records(data.into(), from_checkpoint)?;

            if from_checkpoint && checkpoint_seq > prev_checkpoint {
                records.clear();
                prev_checkpoint = checkpoint_seq;
            }
            records.extend(from_segment);
        }

        Ok(records)
    }

    /// Repairs the active segment.
    ///
    /// Scans frames from the start, verifying each record's checksum, and
    /// halts at the first torn or corrupted frame. If the segment ended
    /// cleanly the verified records are returned and the file is left
    /// untouched. Otherwise the file is atomically replaced (temp file +
    /// rename) with exactly the verified records, the write handle is
    /// reinstalled over the repaired file, and the sequence counter is
    /// reset to the last verified record.
    ///
    /// Corruption is never surfaced as an error; the bad tail is dropped.
    /// Intended to run right after [`Wal::open`], before new appends: any
    /// records still sitting in the write buffer are discarded by a
    /// rewrite.
    ///
    /// # Errors
    /// Returns an error if the WAL is closed, the directory scan fails, or
    /// the rewrite itself fails.
    pub async fn repair(&self) -> WalResult<Vec<Record>> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(WalError::Closed);
        }

        // Scan the directory rather than trusting the in-memory index, so
        // a malformed segment name surfaces here the same way it does at
        // open.
        let segments = segment::list_segments(&guard.config.dir).await?;
        let Some((_, path)) = segments.last() else {
            return Ok(Vec::new());
        };

        let data = fs::read(path)
            .await
            .map_err(|e| WalError::io("read_segment", e))?;
        let scan = replay::scan_for_repair(data.into());

        let Some((truncate_offset, reason)) = scan.truncate_at else {
            debug!(records = scan.records.len(), "repair scan clean, no rewrite");
            return Ok(scan.records);
        };

        warn!(
            path = %path.display(),
            offset = truncate_offset,
            reason = %reason,
            "truncating corrupted segment tail"
        );

        // Rewrite the verified prefix to a sibling temp file, then rename
        // over the segment. Rename is atomic at the OS layer.
        let tmp_path = {
            let mut name = path.clone().into_os_string();
            name.push(".tmp");
            PathBuf::from(name)
        };

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| WalError::io("create_tmp", e))?;
        for record in &scan.records {
            tmp.write_all(&record.encode_framed())
                .await
                .map_err(|e| WalError::io("write_tmp", e))?;
        }
        tmp.sync_all()
            .await
            .map_err(|e| WalError::io("fsync_tmp", e))?;
        drop(tmp);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| WalError::io("rename_tmp", e))?;

        // The old write handle points at the renamed-away inode; reinstall
        // it over the repaired file and bring the sequence counter back to
        // the surviving records.
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| WalError::io("open_segment", e))?;
        guard.writer = BufWriter::new(file);
        guard.last_seq = scan.records.last().map_or(0, |record| record.seq);

        info!(
            records = scan.records.len(),
            last_seq = guard.last_seq,
            "repaired active segment"
        );
        Ok(scan.records)
    }

    /// Returns the last assigned sequence number (0 if nothing was ever
    /// appended).
    pub async fn last_seq(&self) -> u64 {
        self.inner.lock().await.last_seq
    }

    /// Closes the WAL: stops the background sync task, flushes the buffer
    /// (fsyncing when enabled), and rejects all further operations.
    ///
    /// # Errors
    /// Returns [`WalError::Closed`] if already closed, or an I/O error if
    /// the final sync fails (the WAL is then still open and `close` may be
    /// retried).
    pub async fn close(&self) -> WalResult<()> {
        self.syncer_running.store(false, Ordering::SeqCst);
        self.cancel.notify_one();

        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(WalError::Closed);
        }
        sync_inner(&mut guard).await?;
        guard.closed = true;

        info!(last_seq = guard.last_seq, "closed WAL");
        Ok(())
    }
}

/// Flushes the buffer, fsyncs when enabled, and resets the sync timer.
async fn sync_inner(inner: &mut WalInner) -> WalResult<()> {
    inner
        .writer
        .flush()
        .await
        .map_err(|e| WalError::io("flush", e))?;
    if inner.config.enable_fsync {
        inner
            .writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| WalError::io("fsync", e))?;
    }
    inner.last_sync = Instant::now();
    Ok(())
}

/// Rotates the active segment if appending would cross the size threshold.
///
/// The check uses pre-append sizes (on-disk length plus buffered bytes), so
/// a single oversize record may push a segment moderately past the limit.
async fn rotate_if_needed(inner: &mut WalInner) -> WalResult<()> {
    let on_disk = inner
        .writer
        .get_ref()
        .metadata()
        .await
        .map_err(|e| WalError::io("stat", e))?
        .len();
    let buffered = inner.writer.buffer().len() as u64;

    if on_disk + buffered >= inner.config.max_file_size {
        rotate(inner).await?;
    }
    Ok(())
}

/// Flushes and closes the active segment, then opens the next one,
/// deleting the oldest segment when the retention bound is exceeded.
async fn rotate(inner: &mut WalInner) -> WalResult<()> {
    sync_inner(inner).await?;

    inner.segment_index += 1;
    if inner.segment_index >= inner.config.max_segments {
        delete_oldest(inner).await?;
    }

    let file = segment::create_segment(&inner.config.dir, inner.segment_index).await?;
    inner.active_path = segment::segment_path(&inner.config.dir, inner.segment_index);
    // Replacing the writer drops the previous segment's handle.
    inner.writer = BufWriter::new(file);

    info!(segment = inner.segment_index, "rotated to new segment");
    Ok(())
}

/// Deletes the oldest (smallest-index) segment, if any.
async fn delete_oldest(inner: &WalInner) -> WalResult<()> {
    let segments = segment::list_segments(&inner.config.dir).await?;
    if let Some((index, path)) = segments.first() {
        segment::remove_segment(path).await?;
        info!(segment = *index, "deleted oldest segment");
    }
    Ok(())
}
