//! Record-oriented reading of child process output.
//!
//! The extractor rewrites its progress line in place using carriage returns
//! when a terminal is attached, and keeps doing so on some code paths even
//! when piped. A plain `lines()` reader would sit on those `\r`-terminated
//! updates until a newline finally arrives, defeating stall detection. This
//! reader treats both `\n` and `\r` as record delimiters and surfaces each
//! record as soon as it is complete.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const READ_CHUNK: usize = 4096;

/// Yields trimmed, non-empty text records delimited by `\n` or `\r`.
pub struct RecordReader<R> {
    inner: BufReader<R>,
    carry: Vec<u8>,
    chunk: Box<[u8; READ_CHUNK]>,
    eof: bool,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R) -> Self {
        Self {
            inner: BufReader::new(source),
            carry: Vec::new(),
            chunk: Box::new([0u8; READ_CHUNK]),
            eof: false,
        }
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(record) = self.take_buffered_record() {
                return Ok(Some(record));
            }
            if self.eof {
                return Ok(self.flush_remainder());
            }

            let read = self.inner.read(&mut self.chunk[..]).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.carry.extend_from_slice(&self.chunk[..read]);
            }
        }
    }

    fn take_buffered_record(&mut self) -> Option<String> {
        while let Some(end) = self.carry.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            let raw: Vec<u8> = self.carry.drain(..=end).collect();
            let record = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim()
                .to_string();
            if !record.is_empty() {
                return Some(record);
            }
        }
        None
    }

    fn flush_remainder(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let record = String::from_utf8_lossy(&self.carry).trim().to_string();
        self.carry.clear();
        (!record.is_empty()).then_some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        let (mut tx, rx) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let _ = tx.write_all(input).await;
        });

        let mut reader = RecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn splits_on_both_delimiters() {
        let records = collect(b"one\rtwo\nthree\r\nfour").await;
        assert_eq!(records, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn skips_empty_records() {
        let records = collect(b"\r\r\na\n\n\rb\n").await;
        assert_eq!(records, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn flushes_trailing_record_at_eof() {
        let records = collect(b"tail-without-newline").await;
        assert_eq!(records, vec!["tail-without-newline"]);
    }

    #[tokio::test]
    async fn tolerates_invalid_utf8() {
        let records = collect(b"ok\n\xff\xfe\n").await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], "ok");
    }
}
