// MIT License - Copyright (c) 2026 Peter Wright
// Newline framing for the panel's ASCII line protocol

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::constants::LINE_TERMINATOR;

/// Encode one command line for the wire.
pub fn encode(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + LINE_TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
    bytes
}

/// Decode one raw line. Invalid UTF-8 is replaced, surrounding whitespace
/// (including `\r`) is trimmed, and blank lines yield `None`.
pub fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Splits a byte stream into message lines.
///
/// Tied to one socket: once it reports end-of-stream it stays there.
/// `next_line` is cancel safe; a partial line survives a timeout and is
/// completed by the next call.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            eof: false,
        }
    }

    /// Next non-blank line, or `Ok(None)` at end-of-stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            } else if self.buf.last() != Some(&b'\n') {
                // Partial line at end-of-stream; the next read returns 0.
                continue;
            }
            let line = decode_line(&self.buf);
            self.buf.clear();
            if line.is_some() {
                return Ok(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_terminator() {
        assert_eq!(encode("STATUS"), b"STATUS\n".to_vec());
        assert_eq!(encode("BYPASS 001"), b"BYPASS 001\n".to_vec());
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"ZO007\r\n"), Some("ZO007".to_string()));
        assert_eq!(decode_line(b"  \r\n"), None);
        assert_eq!(decode_line(b"\rRO"), Some("RO".to_string()));
        assert_eq!(decode_line(b"Z\xffO1"), Some("Z\u{fffd}O1".to_string()));
    }

    #[tokio::test]
    async fn test_line_reader_splits_and_drops_blanks() {
        let data: &[u8] = b"RO\r\n\r\nZO1\nMF\n   \nOK ArmAway";
        let mut reader = LineReader::new(data);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("RO"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ZO1"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("MF"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("OK ArmAway"));
        assert_eq!(reader.next_line().await.unwrap(), None);
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_survives_invalid_bytes() {
        let data: &[u8] = b"\xfe\xfd\nZC2\n";
        let mut reader = LineReader::new(data);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("\u{fffd}\u{fffd}"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ZC2"));
    }

    #[tokio::test]
    async fn test_line_reader_joins_split_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = LineReader::new(rx);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(b"ZB").await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"Y12\nRO\n").await.unwrap();
        });
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ZBY12"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("RO"));
        writer.await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), None);
    }
}
