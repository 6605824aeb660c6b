//! Seglog - crash-safe segmented write-ahead log.
//!
//! This crate provides an append-only record store that higher-level
//! components (key-value engines, state machines, replicators) use to make
//! mutations durable before applying them. Payloads are opaque bytes; the
//! log assigns each a monotonically increasing sequence number, persists it
//! with a CRC32 checksum inside length-prefixed frames across numbered
//! segment files, and replays everything (or the tail from the most recent
//! checkpoint) during recovery.
//!
//! # Design
//!
//! - **Crash safety**: torn or corrupted tails are detected by checksum and
//!   truncated by [`Wal::repair`]
//! - **Bounded segments**: size-triggered rotation with a retention cap on
//!   the number of segment files
//! - **Buffered writes**: appends land in memory and reach disk via a
//!   periodic background sync task (or an explicit [`Wal::sync`])
//! - **No unsafe code**
//!
//! # Example
//!
//! ```ignore
//! use seglog::{Wal, WalConfig};
//! use bytes::Bytes;
//!
//! let config = WalConfig::new("/var/lib/myapp/wal").with_fsync(true);
//! let wal = Wal::open(config).await?;
//!
//! // Append records.
//! wal.append(Bytes::from("set k1=v1")).await?;
//! wal.create_checkpoint(Bytes::from("snapshot @ 1")).await?;
//!
//! // Replay from the last checkpoint.
//! for record in wal.read_all(true).await? {
//!     apply(record.payload);
//! }
//!
//! wal.close().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod record;
mod replay;
mod segment;
mod wal;

pub use error::{WalError, WalResult};
pub use record::{Record, FRAME_LEN_SIZE};
pub use wal::{
    Wal, WalConfig, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_SEGMENTS, DEFAULT_SYNC_INTERVAL,
};
