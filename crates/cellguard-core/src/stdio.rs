use crate::config::MAX_OUTPUT_CHUNK;
use crate::process::OutputCallback;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

/// Shared writer that emits whole lines.
///
/// Every line, its newline and the flush happen under one lock, so concurrent
/// publishers never interleave bytes on the wire.
pub struct LineWriter(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>);

impl Clone for LineWriter {
    fn clone(&self) -> Self {
        LineWriter(self.0.clone())
    }
}

impl LineWriter {
    pub fn new(t: impl AsyncWrite + Unpin + Send + 'static) -> LineWriter {
        LineWriter(Arc::new(Mutex::new(Box::new(t))))
    }

    pub fn inner(&self) -> Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>> {
        self.0.clone()
    }

    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut lock = self.0.lock().await;
        lock.write_all(line.as_bytes()).await?;
        lock.write_all(b"\n").await?;
        lock.flush().await
    }
}

/// Splits a byte stream on `\n`, dropping a trailing `\r` and replacing invalid UTF-8.
///
/// Child processes are free to print anything, so unlike `LinesCodec` this never fails
/// on content. A line longer than `max_length` bytes is emitted in pieces of at most
/// `max_length` bytes instead of being buffered whole.
#[derive(Debug)]
pub struct LossyLinesCodec {
    next_index: usize,
    max_length: usize,
}

impl Default for LossyLinesCodec {
    fn default() -> Self {
        Self::with_max_length(MAX_OUTPUT_CHUNK)
    }
}

impl LossyLinesCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            // room for one whole UTF-8 character
            max_length: max_length.max(4),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Where to cut `bytes` (longer than `max`) so no UTF-8 character is split
fn chunk_end(bytes: &[u8], max: usize) -> usize {
    let mut end = max;
    while end > max - 3 && bytes[end] & 0xC0 == 0x80 {
        end -= 1;
    }
    if bytes[end] & 0xC0 == 0x80 { max } else { end }
}

impl Decoder for LossyLinesCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // a newline right after `max_length` bytes still ends a whole line
        let limit = src.len().min(self.max_length + 1);
        let scanned = self.next_index.min(limit);
        if let Some(offset) = src[scanned..limit].iter().position(|b| *b == b'\n') {
            self.next_index = 0;
            let line = src.split_to(scanned + offset + 1);
            return Ok(Some(decode_line(&line)));
        }

        if src.len() > self.max_length {
            self.next_index = 0;
            let chunk = src.split_to(chunk_end(src, self.max_length));
            return Ok(Some(String::from_utf8_lossy(&chunk).into_owned()));
        }
        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

/// Feed every line of `reader` to `sink`, awaiting each call before reading the next.
pub async fn pump_lines<R: AsyncRead + Unpin>(reader: R, sink: OutputCallback) -> io::Result<()> {
    let mut frames = FramedRead::new(reader, LossyLinesCodec::new());
    while let Some(line) = frames.next().await {
        sink(line?).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_concurrent_lines_do_not_interleave() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let writer = LineWriter::new(client);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let line = format!("{i}").repeat(500);
                writer.write_line(&line).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(writer);

        let mut output = String::new();
        server.read_to_string(&mut output).await.unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 8);
        for line in lines {
            let first = line.chars().next().unwrap();
            assert!(line.chars().all(|c| c == first), "interleaved line: {line}");
        }
    }

    #[tokio::test]
    async fn test_pump_lines_preserves_order_and_partial_tail() {
        let input: &[u8] = b"first\r\nsecond\n\xffbad\nno newline";
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: OutputCallback = {
            let collected = collected.clone();
            Arc::new(move |line: String| -> BoxFuture<'static, ()> {
                let collected = collected.clone();
                Box::pin(async move { collected.lock().unwrap().push(line) })
            })
        };

        pump_lines(input, sink).await.unwrap();

        let lines = collected.lock().unwrap().clone();
        assert_eq!(lines, vec!["first", "second", "\u{fffd}bad", "no newline"]);
    }

    #[test]
    fn test_codec_waits_for_newline() {
        let mut codec = LossyLinesCodec::new();
        let mut buffer = BytesMut::from(&b"par"[..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(b"tial\nnext");
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("partial".to_string()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buffer).unwrap(), Some("next".to_string()));
        assert_eq!(codec.decode_eof(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_codec_splits_overlong_lines() {
        let mut codec = LossyLinesCodec::with_max_length(8);
        let mut buffer = BytesMut::from(&b"abcdefghij\n12345678\nxyz"[..]);

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("abcdefgh".to_string()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("ij".to_string()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("12345678".to_string()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buffer).unwrap(), Some("xyz".to_string()));
    }

    #[test]
    fn test_codec_does_not_split_characters() {
        let mut codec = LossyLinesCodec::with_max_length(4);
        let mut buffer = BytesMut::from("abcé\n".as_bytes());

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("abc".to_string()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some("é".to_string()));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_pump_lines_bounds_output_without_newlines() {
        let input = "x".repeat(MAX_OUTPUT_CHUNK * 3 + 10);
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: OutputCallback = {
            let collected = collected.clone();
            Arc::new(move |line: String| -> BoxFuture<'static, ()> {
                let collected = collected.clone();
                Box::pin(async move { collected.lock().unwrap().push(line) })
            })
        };

        pump_lines(input.as_bytes(), sink).await.unwrap();

        let chunks = collected.lock().unwrap().clone();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.len() <= MAX_OUTPUT_CHUNK));
        assert_eq!(chunks.concat(), input);
    }
}
