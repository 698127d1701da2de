//! Wire layout of one range chunk.
//!
//! ```text
//! int32 keyCount
//! int32 moreFlag            nonzero = more data may follow this chunk
//! keyCount x { int32 keyLen, int32 valueLen, key bytes, value bytes }
//! ```
//!
//! All integers use native byte order. Decoding validates every declared
//! length up front, then copies records out one at a time as the iterator
//! advances.

use std::ops::Range;

use crate::error::{RangeError, Result};
use crate::pool::{BufferPool, PooledBuffer};

const HEADER_LEN: usize = 8;
const ENTRY_HEADER_LEN: usize = 8;

/// One key/value pair returned by a scan.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} => {}",
            crate::selector::printable(&self.key),
            crate::selector::printable(&self.value)
        )
    }
}

/// Header of a chunk, readable without touching record bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSummary {
    pub key_count: usize,
    pub more: bool,
}

/// Reads the chunk header.
pub fn read_summary(buf: &[u8]) -> Result<ChunkSummary> {
    if buf.len() < HEADER_LEN {
        return Err(RangeError::malformed(format!(
            "chunk of {} bytes is shorter than its {HEADER_LEN}-byte header",
            buf.len()
        )));
    }
    let key_count = read_i32(buf, 0);
    let more = read_i32(buf, 4) != 0;
    if key_count < 0 {
        return Err(RangeError::malformed(format!(
            "negative key count {key_count}"
        )));
    }
    Ok(ChunkSummary {
        key_count: key_count as usize,
        more,
    })
}

#[derive(Clone, Debug)]
struct EntrySpan {
    key: Range<usize>,
    value: Range<usize>,
}

/// A validated chunk that owns its receive buffer.
///
/// Dropping the chunk releases the buffer back to its pool.
#[derive(Debug)]
pub struct DecodedChunk {
    buffer: PooledBuffer,
    entries: Vec<EntrySpan>,
    more: bool,
}

impl DecodedChunk {
    /// Validates the whole layout. On error the buffer is dropped (and thus
    /// released) before returning, and no record is ever exposed.
    pub fn decode(buffer: PooledBuffer) -> Result<Self> {
        let bytes = buffer.as_slice();
        let summary = read_summary(bytes)?;

        // A count can't exceed what the buffer could possibly hold.
        let max_entries = (bytes.len() - HEADER_LEN) / ENTRY_HEADER_LEN;
        if summary.key_count > max_entries {
            return Err(RangeError::malformed(format!(
                "key count {} cannot fit in {} bytes",
                summary.key_count,
                bytes.len()
            )));
        }

        let mut entries = Vec::with_capacity(summary.key_count);
        let mut pos = HEADER_LEN;
        for idx in 0..summary.key_count {
            let header_end = pos + ENTRY_HEADER_LEN;
            if header_end > bytes.len() {
                return Err(RangeError::malformed(format!(
                    "record {idx} header truncated at offset {pos}"
                )));
            }
            let key_len = read_len(bytes, pos, idx, "key")?;
            let value_len = read_len(bytes, pos + 4, idx, "value")?;
            let key_start = header_end;
            let value_start = key_start
                .checked_add(key_len)
                .ok_or_else(|| RangeError::malformed(format!("record {idx} key overflows")))?;
            let value_end = value_start
                .checked_add(value_len)
                .ok_or_else(|| RangeError::malformed(format!("record {idx} value overflows")))?;
            if value_end > bytes.len() {
                return Err(RangeError::malformed(format!(
                    "record {idx} needs {value_end} bytes but chunk has {}",
                    bytes.len()
                )));
            }
            entries.push(EntrySpan {
                key: key_start..value_start,
                value: value_start..value_end,
            });
            pos = value_end;
        }

        Ok(Self {
            buffer,
            entries,
            more: summary.more,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the store reported data beyond this chunk.
    pub fn has_more(&self) -> bool {
        self.more
    }

    /// Size of the raw chunk in bytes.
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn key(&self, idx: usize) -> Option<&[u8]> {
        let span = self.entries.get(idx)?;
        Some(&self.buffer.as_slice()[span.key.clone()])
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.key(self.entries.len().checked_sub(1)?)
    }

    /// Copies record `idx` out of the buffer.
    pub fn record(&self, idx: usize) -> Option<KeyValue> {
        let span = self.entries.get(idx)?;
        let bytes = self.buffer.as_slice();
        Some(KeyValue {
            key: bytes[span.key.clone()].to_vec(),
            value: bytes[span.value.clone()].to_vec(),
        })
    }

    /// Copies every record out, in chunk order.
    pub fn to_records(&self) -> Vec<KeyValue> {
        (0..self.len()).filter_map(|idx| self.record(idx)).collect()
    }
}

/// Serializes records into the chunk layout; the inverse of [`DecodedChunk`].
pub struct ChunkWriter {
    buffer: PooledBuffer,
    count: i32,
}

impl ChunkWriter {
    pub fn new(pool: &BufferPool, capacity: usize) -> Self {
        let mut buffer = pool.acquire(capacity.max(HEADER_LEN));
        buffer.as_mut_vec().extend_from_slice(&[0u8; HEADER_LEN]);
        Self { buffer, count: 0 }
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) {
        let out = self.buffer.as_mut_vec();
        out.extend_from_slice(&(key.len() as i32).to_ne_bytes());
        out.extend_from_slice(&(value.len() as i32).to_ne_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// Patches the header and hands back the finished buffer.
    pub fn finish(mut self, more: bool) -> PooledBuffer {
        let count = self.count;
        let out = self.buffer.as_mut_vec();
        out[0..4].copy_from_slice(&count.to_ne_bytes());
        out[4..8].copy_from_slice(&i32::from(more).to_ne_bytes());
        self.buffer
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    i32::from_ne_bytes(raw)
}

fn read_len(buf: &[u8], at: usize, idx: usize, what: &str) -> Result<usize> {
    let len = read_i32(buf, at);
    if len < 0 {
        return Err(RangeError::malformed(format!(
            "record {idx} has negative {what} length {len}"
        )));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(records: &[(&str, &str)], more: bool, pool: &BufferPool) -> PooledBuffer {
        let mut writer = ChunkWriter::new(pool, 64);
        for (key, value) in records {
            writer.push(key.as_bytes(), value.as_bytes());
        }
        writer.finish(more)
    }

    #[test]
    fn summary_reads_header_only() {
        let pool = BufferPool::default();
        let buf = encode(&[("a", "1"), ("b", "2")], true, &pool);
        let summary = read_summary(buf.as_slice()).expect("summary");
        assert_eq!(
            summary,
            ChunkSummary {
                key_count: 2,
                more: true
            }
        );
    }

    #[test]
    fn decode_exposes_records_in_order() {
        let pool = BufferPool::default();
        let buf = encode(&[("a", "1"), ("bb", ""), ("", "zz")], false, &pool);
        let chunk = DecodedChunk::decode(buf).expect("decode");
        assert_eq!(chunk.len(), 3);
        assert!(!chunk.has_more());
        assert_eq!(chunk.record(0), Some(KeyValue::new(b"a".to_vec(), b"1".to_vec())));
        assert_eq!(chunk.record(1), Some(KeyValue::new(b"bb".to_vec(), Vec::new())));
        assert_eq!(chunk.record(2), Some(KeyValue::new(Vec::new(), b"zz".to_vec())));
        assert_eq!(chunk.record(3), None);
        assert_eq!(chunk.last_key(), Some(&b""[..]));
        assert_eq!(pool.outstanding(), 1);
        drop(chunk);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn any_nonzero_more_flag_counts() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0i32.to_ne_bytes());
        raw.extend_from_slice(&(-7i32).to_ne_bytes());
        let summary = read_summary(&raw).expect("summary");
        assert!(summary.more);
        assert_eq!(summary.key_count, 0);
    }

    #[test]
    fn truncated_records_fail_without_yielding() {
        let pool = BufferPool::default();
        let buf = encode(&[("a", "1"), ("b", "2"), ("c", "3")], false, &pool);
        let mut raw = buf.as_slice().to_vec();
        raw.truncate(raw.len() - 1);
        drop(buf);

        let err = DecodedChunk::decode(PooledBuffer::standalone(raw)).expect_err("truncated");
        assert!(matches!(err, RangeError::MalformedChunk { .. }), "{err}");
    }

    #[test]
    fn truncated_buffer_is_still_released() {
        let pool = BufferPool::default();
        let mut buf = encode(&[("a", "1"), ("b", "2"), ("c", "3")], false, &pool);
        let len = buf.len();
        buf.as_mut_vec().truncate(len - 2);
        assert!(DecodedChunk::decode(buf).is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn negative_count_is_malformed() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(-1i32).to_ne_bytes());
        raw.extend_from_slice(&0i32.to_ne_bytes());
        let err = read_summary(&raw).expect_err("negative count");
        assert!(err.to_string().contains("negative key count"));
    }

    #[test]
    fn oversized_lengths_are_malformed() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1i32.to_ne_bytes());
        raw.extend_from_slice(&0i32.to_ne_bytes());
        raw.extend_from_slice(&i32::MAX.to_ne_bytes());
        raw.extend_from_slice(&1i32.to_ne_bytes());
        raw.extend_from_slice(b"k");
        let err = DecodedChunk::decode(PooledBuffer::standalone(raw)).expect_err("overflow");
        assert!(matches!(err, RangeError::MalformedChunk { .. }));
    }

    #[test]
    fn short_header_is_malformed() {
        let err = read_summary(&[0u8; 5]).expect_err("short");
        assert!(matches!(err, RangeError::MalformedChunk { .. }));
    }
}
