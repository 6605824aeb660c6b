//! Frame streaming over segment contents.
//!
//! All read paths share one primitive: walk a segment's bytes frame by
//! frame, decoding and CRC-verifying each record. The three consumers
//! differ only in how they treat a bad frame: replay surfaces it,
//! sequence recovery stops silently, and repair records where to truncate.

use bytes::{Buf, Bytes};

use crate::error::{WalError, WalResult};
use crate::record::{Record, FRAME_LEN_SIZE};

/// Reads the next frame from `data`, verifying its checksum.
///
/// `offset` tracks the byte position within the segment and is advanced
/// past the consumed frame on success.
fn next_frame(data: &mut Bytes, offset: &mut u64) -> WalResult<Record> {
    if data.remaining() < FRAME_LEN_SIZE {
        return Err(WalError::CorruptedFrame {
            offset: *offset,
            reason: format!(
                "truncated frame length: need {FRAME_LEN_SIZE} bytes, have {}",
                data.remaining()
            ),
        });
    }
    let len = data.get_u32_le() as usize;
    let body_offset = *offset + FRAME_LEN_SIZE as u64;

    if data.remaining() < len {
        return Err(WalError::CorruptedFrame {
            offset: body_offset,
            reason: format!("truncated frame body: need {len} bytes, have {}", data.remaining()),
        });
    }
    let body = data.copy_to_bytes(len);

    let record = Record::decode(body, body_offset)?;
    if !record.verify_crc() {
        return Err(WalError::CorruptedFrame {
            offset: body_offset,
            reason: format!(
                "crc mismatch for seq {}: stored {:#010x}, computed {:#010x}",
                record.seq,
                record.crc,
                record.expected_crc()
            ),
        });
    }

    *offset = body_offset + len as u64;
    Ok(record)
}

/// Reads all records from a segment's contents.
///
/// Returns the records together with the sequence number of the last
/// checkpoint seen (0 if none). When `from_checkpoint` is true, every
/// checkpoint record clears the accumulator, so the returned records start
/// at the segment's most recent checkpoint (inclusive).
///
/// # Errors
/// Returns [`WalError::CorruptedFrame`] on the first unparseable or
/// checksum-failing frame.
pub(crate) fn read_records(
    mut data: Bytes,
    from_checkpoint: bool,
) -> WalResult<(Vec<Record>, u64)> {
    let mut records = Vec::new();
    let mut checkpoint_seq = 0u64;
    let mut offset = 0u64;

    while data.has_remaining() {
        let record = next_frame(&mut data, &mut offset)?;
        if from_checkpoint && record.is_checkpoint() {
            checkpoint_seq = record.seq;
            records.clear();
        }
        records.push(record);
    }

    Ok((records, checkpoint_seq))
}

/// Recovers the last sequence number from a segment's contents.
///
/// Walks frames from the start and remembers the last one that parsed and
/// verified. A torn or corrupt tail ends the scan without error; repair is
/// responsible for cleaning it up. Returns 0 for an empty segment.
pub(crate) fn recover_last_seq(mut data: Bytes) -> u64 {
    let mut last_seq = 0u64;
    let mut offset = 0u64;

    while data.has_remaining() {
        match next_frame(&mut data, &mut offset) {
            Ok(record) => last_seq = record.seq,
            Err(_) => break,
        }
    }

    last_seq
}

/// Result of a repair scan over a segment's contents.
pub(crate) struct RepairScan {
    /// Records verified up to the first bad frame (or the whole segment).
    pub records: Vec<Record>,
    /// When a rewrite is required: byte offset of the first bad frame and
    /// the reason it failed. `None` means the segment ended cleanly.
    pub truncate_at: Option<(u64, String)>,
}

/// Scans a segment's contents for repair.
///
/// Distinguishes a clean end (the data ends exactly on a frame boundary)
/// from a torn or corrupted tail. Corruption is never an error here; it
/// marks the truncation point.
pub(crate) fn scan_for_repair(mut data: Bytes) -> RepairScan {
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        if !data.has_remaining() {
            return RepairScan {
                records,
                truncate_at: None,
            };
        }
        let frame_start = offset;
        match next_frame(&mut data, &mut offset) {
            Ok(record) => records.push(record),
            Err(err) => {
                return RepairScan {
                    records,
                    truncate_at: Some((frame_start, err.to_string())),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn segment_bytes(records: &[Record]) -> Bytes {
        let mut buf = BytesMut::new();
        for record in records {
            buf.extend_from_slice(&record.encode_framed());
        }
        buf.freeze()
    }

    fn plain(seq: u64, payload: &'static str) -> Record {
        Record::new(seq, Bytes::from(payload), false)
    }

    #[test]
    fn test_read_records_in_order() {
        let records = vec![plain(1, "a"), plain(2, "b"), plain(3, "c")];
        let (read, checkpoint) = read_records(segment_bytes(&records), false).unwrap();
        assert_eq!(read, records);
        assert_eq!(checkpoint, 0);
    }

    #[test]
    fn test_read_records_restarts_at_checkpoint() {
        let records = vec![
            plain(1, "a"),
            plain(2, "b"),
            Record::new(3, Bytes::from("cp"), true),
            plain(4, "d"),
        ];
        let (read, checkpoint) = read_records(segment_bytes(&records), true).unwrap();
        assert_eq!(checkpoint, 3);
        let seqs: Vec<u64> = read.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_read_records_latest_checkpoint_wins() {
        let records = vec![
            Record::new(1, Bytes::from("cp1"), true),
            plain(2, "b"),
            Record::new(3, Bytes::from("cp2"), true),
            plain(4, "d"),
        ];
        let (read, checkpoint) = read_records(segment_bytes(&records), true).unwrap();
        assert_eq!(checkpoint, 3);
        assert_eq!(read.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_read_records_torn_tail_is_error() {
        let records = vec![plain(1, "a"), plain(2, "b")];
        let mut data = BytesMut::from(&segment_bytes(&records)[..]);
        data.truncate(data.len() - 3);

        let result = read_records(data.freeze(), false);
        assert!(matches!(result, Err(WalError::CorruptedFrame { .. })));
    }

    #[test]
    fn test_recover_last_seq() {
        let records = vec![plain(1, "a"), plain(2, "b"), plain(3, "c")];
        assert_eq!(recover_last_seq(segment_bytes(&records)), 3);
        assert_eq!(recover_last_seq(Bytes::new()), 0);
    }

    #[test]
    fn test_recover_last_seq_tolerates_torn_tail() {
        let records = vec![plain(1, "a"), plain(2, "b"), plain(3, "c")];
        let mut data = BytesMut::from(&segment_bytes(&records)[..]);
        data.truncate(data.len() - 2);

        assert_eq!(recover_last_seq(data.freeze()), 2);
    }

    #[test]
    fn test_scan_for_repair_clean() {
        let records = vec![plain(1, "a"), plain(2, "b")];
        let scan = scan_for_repair(segment_bytes(&records));
        assert_eq!(scan.records, records);
        assert!(scan.truncate_at.is_none());
    }

    #[test]
    fn test_scan_for_repair_truncated_body() {
        let records = vec![plain(1, "a"), plain(2, "b")];
        let full = segment_bytes(&records);
        let first_frame_len = records[0].encode_framed().len() as u64;

        let mut data = BytesMut::from(&full[..]);
        data.truncate(data.len() - 2);

        let scan = scan_for_repair(data.freeze());
        assert_eq!(scan.records, records[..1]);
        let (offset, _) = scan.truncate_at.expect("tail should need truncation");
        assert_eq!(offset, first_frame_len);
    }

    #[test]
    fn test_scan_for_repair_partial_length_prefix() {
        let records = vec![plain(1, "a")];
        let mut data = BytesMut::from(&segment_bytes(&records)[..]);
        // A couple of stray bytes after the last frame: not even a full
        // length prefix.
        data.put_u8(0xAA);
        data.put_u8(0xBB);

        let scan = scan_for_repair(data.freeze());
        assert_eq!(scan.records.len(), 1);
        assert!(scan.truncate_at.is_some());
    }

    #[test]
    fn test_scan_for_repair_crc_mismatch() {
        let records = vec![plain(1, "aaaa"), plain(2, "bbbb"), plain(3, "cccc")];
        let mut data = BytesMut::from(&segment_bytes(&records)[..]);

        // Flip a byte inside the second record's payload. Frame layout:
        // 4-byte length prefix, then body [tag, seq, tag, len, payload...].
        let second_payload = records[0].encode_framed().len() + FRAME_LEN_SIZE + 4;
        data[second_payload] ^= 0xFF;

        let scan = scan_for_repair(data.freeze());
        assert_eq!(scan.records, records[..1]);
        assert!(scan.truncate_at.is_some());
    }
}
