//! # Streaming Manifest Decoder
//!
//! Incrementally decodes a stream of concatenated JSON values from chunked
//! input without buffering the whole manifest. Values may be separated by any
//! run of `\n`/`\r`; plain whitespace between values is also consumed. A
//! decode failure is held while more input could still complete a value split
//! across a chunk boundary, and only re-raised at end of stream. Error
//! offsets are absolute from the start of the whole stream.

use std::collections::VecDeque;
use std::io::Read;

use serde_json::Value;

use crate::error::BuildError;

/// Smallest accepted read size; anything lower would degenerate into
/// re-parsing the buffer head for every byte.
pub const MIN_CHUNK_SIZE: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

/// Incremental decoder over an internal text buffer. Feed chunks in with
/// [`ConcatDecoder::feed`], pull values out with [`ConcatDecoder::try_next`].
#[derive(Debug, Default)]
pub struct ConcatDecoder {
    buf: String,
    // absolute stream offset of buf[0]
    consumed: u64,
}

impl ConcatDecoder {
    pub fn new() -> Self {
        ConcatDecoder::default()
    }

    pub fn feed(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn advance(&mut self, n: usize) {
        self.buf.drain(..n);
        self.consumed += n as u64;
    }

    /// Decode one JSON value from the buffer head.
    ///
    /// `Ok(Some(value))` consumes the value's span; `Ok(None)` means the
    /// buffer holds nothing but separators/whitespace. `Err` reports a decode
    /// failure at its absolute offset — the caller decides whether more input
    /// may still resolve it (a value split mid-chunk reports an unexpected
    /// end of input until the rest arrives).
    pub fn try_next(&mut self) -> Result<Option<Value>, BuildError> {
        loop {
            let sep = self
                .buf
                .bytes()
                .take_while(|&b| matches!(b, b'\n' | b'\r'))
                .count();
            if sep > 0 {
                self.advance(sep);
                continue;
            }
            if self.buf.is_empty() {
                return Ok(None);
            }

            let mut stream = serde_json::Deserializer::from_str(&self.buf).into_iter::<Value>();
            return match stream.next() {
                Some(Ok(value)) => {
                    let end = stream.byte_offset();
                    self.advance(end);
                    Ok(Some(value))
                }
                Some(Err(e)) => {
                    let offset =
                        self.consumed + line_col_offset(&self.buf, e.line(), e.column());
                    Err(BuildError::ManifestDecode { offset, message: e.to_string() })
                }
                // nothing but whitespace left
                None => {
                    let rest = self.buf.len();
                    self.advance(rest);
                    Ok(None)
                }
            };
        }
    }
}

/// Translate serde_json's 1-based line/column into a byte offset within `s`.
fn line_col_offset(s: &str, line: usize, column: usize) -> u64 {
    let mut offset = 0usize;
    for (idx, l) in s.split('\n').enumerate() {
        if idx + 1 == line {
            return (offset + column.saturating_sub(1)) as u64;
        }
        offset += l.len() + 1;
    }
    s.len() as u64
}

/// Lazy iterator of parsed JSON values over a chunked byte source.
///
/// Reads `chunk_size` bytes at a time, tolerates values and UTF-8 sequences
/// split across chunk boundaries, and yields values in stream order. After
/// the first hard error no further values are produced.
pub struct ManifestReader<R: Read> {
    source: R,
    decoder: ConcatDecoder,
    chunk_size: usize,
    // bytes of an incomplete UTF-8 sequence saved from the previous chunk
    partial: Vec<u8>,
    pending: Option<BuildError>,
    eof: bool,
    fused: bool,
}

impl<R: Read> ManifestReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_chunk_size(source, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(source: R, chunk_size: usize) -> Self {
        ManifestReader {
            source,
            decoder: ConcatDecoder::new(),
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
            partial: Vec::new(),
            pending: None,
            eof: false,
            fused: false,
        }
    }

    /// Pull one chunk from the source into the decode buffer. Sets `eof` on
    /// a zero-length read.
    fn fill(&mut self) -> Result<(), BuildError> {
        let mut chunk = vec![0u8; self.chunk_size];
        let n = self.source.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
            if !self.partial.is_empty() {
                let offset = self.decoder.consumed + self.decoder.buffered() as u64;
                return Err(BuildError::ManifestDecode {
                    offset,
                    message: "truncated UTF-8 sequence at end of stream".into(),
                });
            }
            return Ok(());
        }

        self.partial.extend_from_slice(&chunk[..n]);
        let bytes = std::mem::take(&mut self.partial);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.decoder.feed(text),
            Err(e) if e.error_len().is_none() => {
                // a multi-byte character was cut at the chunk edge
                let valid = e.valid_up_to();
                self.decoder
                    .feed(std::str::from_utf8(&bytes[..valid]).unwrap_or(""));
                self.partial = bytes[valid..].to_vec();
            }
            Err(e) => {
                let offset =
                    self.decoder.consumed + self.decoder.buffered() as u64 + e.valid_up_to() as u64;
                return Err(BuildError::ManifestDecode {
                    offset,
                    message: "invalid UTF-8 in manifest stream".into(),
                });
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ManifestReader<R> {
    type Item = Result<Value, BuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        loop {
            match self.decoder.try_next() {
                Ok(Some(value)) => {
                    self.pending = None;
                    return Some(Ok(value));
                }
                Ok(None) if self.eof => return None,
                Ok(None) => {}
                Err(e) if self.eof => {
                    self.fused = true;
                    return Some(Err(e));
                }
                Err(e) => {
                    // carry the error: the next chunk may complete the value
                    self.pending = Some(e);
                }
            }
            if let Err(e) = self.fill() {
                self.fused = true;
                return Some(Err(e));
            }
            if self.eof {
                if let Some(e) = self.pending.take() {
                    // end of stream never resolved the carried failure
                    self.fused = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Iterator of manifest entry values: flattens one level of JSON arrays, so
/// a stream of objects and arrays-of-objects becomes a stream of objects.
pub struct EntryStream<R: Read> {
    inner: ManifestReader<R>,
    queued: VecDeque<Value>,
}

impl<R: Read> EntryStream<R> {
    pub fn new(source: R) -> Self {
        EntryStream { inner: ManifestReader::new(source), queued: VecDeque::new() }
    }

    pub fn with_chunk_size(source: R, chunk_size: usize) -> Self {
        EntryStream {
            inner: ManifestReader::with_chunk_size(source, chunk_size),
            queued: VecDeque::new(),
        }
    }
}

impl<R: Read> Iterator for EntryStream<R> {
    type Item = Result<Value, BuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(v) = self.queued.pop_front() {
            return Some(Ok(v));
        }
        match self.inner.next()? {
            Ok(Value::Array(items)) => {
                self.queued.extend(items);
                self.next()
            }
            other => Some(other),
        }
    }
}

/// Decode every value of an in-memory manifest string. Convenience wrapper
/// used by tests and small callers.
pub fn decode_str(s: &str) -> Result<Vec<Value>, BuildError> {
    ManifestReader::new(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newline_separated_values_decode_in_order() {
        let values = decode_str("{\"a\":1}\n{\"b\":2}\r\n[3,4]\n").unwrap();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2}), json!([3, 4])]);
    }

    #[test]
    fn whitespace_separated_values_decode_without_newlines() {
        let values = decode_str("{\"a\":1} {\"b\":2}").unwrap();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn value_split_across_chunks_is_reassembled() {
        let reader = ManifestReader::with_chunk_size("{\"a\":1}\n{\"b\":2}".as_bytes(), 5);
        let values: Vec<Value> = reader.map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn multibyte_character_split_across_chunks_is_reassembled() {
        // "é" is two bytes; a 7-byte chunk cuts straight through the first one
        let input = "{\"k\":\"éé\"}".as_bytes();
        let reader = ManifestReader::with_chunk_size(input, 7);
        let values: Vec<Value> = reader.map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![json!({"k": "éé"})]);
    }

    #[test]
    fn decode_error_reports_absolute_offset() {
        let err = decode_str("{\"a\":1}\n{oops}").unwrap_err();
        match err {
            BuildError::ManifestDecode { offset, .. } => assert_eq!(offset, 9),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn truncated_trailing_value_errors_at_end_of_stream() {
        let mut reader = ManifestReader::new("{\"a\":1}\n{\"b\":".as_bytes());
        assert_eq!(reader.next().unwrap().unwrap(), json!({"a": 1}));
        assert!(matches!(
            reader.next(),
            Some(Err(BuildError::ManifestDecode { .. }))
        ));
        // the iterator fuses after the failure
        assert!(reader.next().is_none());
    }

    #[test]
    fn values_before_a_malformed_one_still_come_through() {
        let mut reader = ManifestReader::new("1\n2\nnope\n3".as_bytes());
        assert_eq!(reader.next().unwrap().unwrap(), json!(1));
        assert_eq!(reader.next().unwrap().unwrap(), json!(2));
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn entry_stream_flattens_arrays_one_level() {
        let stream = EntryStream::new("[{\"a\":1},{\"b\":2}]\n{\"c\":3}".as_bytes());
        let values: Vec<Value> = stream.map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
    }

    #[test]
    fn minimum_chunk_size_is_enforced() {
        let reader = ManifestReader::with_chunk_size("{\"a\": 1}".as_bytes(), 1);
        let values: Vec<Value> = reader.map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![json!({"a": 1})]);
    }
}
