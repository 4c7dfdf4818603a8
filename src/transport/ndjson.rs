//! Newline-delimited JSON encoding of stream events.

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::pipeline::StreamEvent;

/// Content type of an event stream.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Errors that can occur while delivering events.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes one event as a single JSON line, newline included.
pub fn encode_event(event: &StreamEvent) -> Result<Vec<u8>, TransportError> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes one line. Unknown statuses decode as `EventStatus::Unknown`.
pub fn decode_line(line: &str) -> Result<StreamEvent, TransportError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Writes events one line at a time, flushing after each.
pub struct NdjsonWriter<W> {
    inner: W,
    written: usize,
}

impl<W: AsyncWrite + Unpin> NdjsonWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Writes and flushes one event.
    pub async fn write_event(&mut self, event: &StreamEvent) -> Result<(), TransportError> {
        let line = encode_event(event)?;
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        self.written += 1;
        Ok(())
    }

    /// Drains `events` until the sender side closes.
    pub async fn forward(&mut self, events: &mut mpsc::Receiver<StreamEvent>) -> Result<usize, TransportError> {
        let start = self.written;
        while let Some(event) = events.recv().await {
            self.write_event(&event).await?;
        }
        Ok(self.written - start)
    }

    pub fn events_written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::EventStatus;
    use serde_json::json;

    #[test]
    fn test_encode_is_single_line() {
        let event = StreamEvent::fixing("multi\nline", json!({"code": "a\nb"}));
        let bytes = encode_event(&event).expect("encodes");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert_eq!(decode_line(&text).expect("decodes"), event);
    }

    #[test]
    fn test_decode_unknown_status() {
        let event = decode_line(r#"{"status":"queued","message":"wait","data":{}}"#).expect("decodes");
        assert_eq!(event.status, EventStatus::Unknown);
    }

    #[tokio::test]
    async fn test_writer_forwards_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(StreamEvent::info("one")).await.expect("send");
        tx.send(StreamEvent::error("two", json!(null))).await.expect("send");
        tx.send(StreamEvent::final_error("three", json!({})))
            .await
            .expect("send");
        drop(tx);

        let mut writer = NdjsonWriter::new(Vec::new());
        let count = writer.forward(&mut rx).await.expect("forwards");
        assert_eq!(count, 3);
        assert_eq!(writer.events_written(), 3);

        let output = String::from_utf8(writer.into_inner()).expect("utf8");
        let messages: Vec<String> = output
            .lines()
            .map(|line| decode_line(line).expect("decodes").message)
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_each_event_visible_before_next() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = NdjsonWriter::new(client);
        writer
            .write_event(&StreamEvent::info("first"))
            .await
            .expect("writes");

        let mut buf = vec![0u8; 1024];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .expect("reads");
        let line = std::str::from_utf8(&buf[..n]).expect("utf8");
        assert_eq!(decode_line(line).expect("decodes").message, "first");
    }
}
