//! Mock backend handles for testing.
//!
//! Inject them through `BrokerBuilder::with_writer_factory` /
//! `with_reader_factory`; no process-wide state is involved.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{BusError, Reader, Result, Writer};
use crate::context::{CancelHandle, Context};
use crate::message::Message;

/// Writer that records every message it is handed.
#[derive(Default)]
pub struct RecordingWriter {
    written: RwLock<Vec<Message>>,
    fail_on_write: RwLock<bool>,
    closes: AtomicUsize,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    pub async fn written(&self) -> Vec<Message> {
        self.written.read().await.clone()
    }

    pub async fn written_count(&self) -> usize {
        self.written.read().await.len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Writer for RecordingWriter {
    async fn write(&self, ctx: &Context, message: Message) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(BusError::Canceled("write"));
        }
        if *self.fail_on_write.read().await {
            return Err(BusError::Write {
                topic: "mock".to_string(),
                message: "Mock write failure".to_string(),
            });
        }
        self.written.write().await.push(message);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writer whose every operation fails.
#[derive(Default)]
pub struct FailingWriter;

impl FailingWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Writer for FailingWriter {
    async fn write(&self, _ctx: &Context, _message: Message) -> Result<()> {
        Err(BusError::Write {
            topic: "mock".to_string(),
            message: "connection reset".to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        Err(BusError::Connection("Mock close failure".to_string()))
    }
}

/// Reader that replays a script of messages.
///
/// A reader built with `new` ends its stream (read error) once the script is
/// exhausted. One built with `open` keeps the stream open and is fed through
/// the returned sender; dropping the sender ends the stream.
pub struct ScriptedReader {
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    fail_subscribe: bool,
    closed: CancelHandle,
    closed_ctx: Context,
    closes: AtomicUsize,
}

impl ScriptedReader {
    pub fn new(messages: impl IntoIterator<Item = Message>) -> Self {
        let (tx, reader) = Self::open();
        for message in messages {
            let _ = tx.send(message);
        }
        reader
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn open() -> (mpsc::UnboundedSender<Message>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_ctx, closed) = Context::with_cancel();
        let reader = Self {
            rx: Mutex::new(rx),
            fail_subscribe: false,
            closed,
            closed_ctx,
            closes: AtomicUsize::new(0),
        };
        (tx, reader)
    }

    /// Make `subscribe` fail the way a rejected queue declaration would.
    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reader for ScriptedReader {
    async fn subscribe(&self, _ctx: &Context) -> Result<()> {
        if self.fail_subscribe {
            return Err(BusError::Setup {
                topic: "mock".to_string(),
                message: "access refused".to_string(),
            });
        }
        Ok(())
    }

    async fn read_one(&self, ctx: &Context) -> Result<Message> {
        let mut rx = tokio::select! {
            _ = ctx.cancelled() => return Err(BusError::Canceled("read")),
            _ = self.closed_ctx.cancelled() => return Err(BusError::Closed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(BusError::Canceled("read")),
            _ = self.closed_ctx.cancelled() => Err(BusError::Closed),
            msg = rx.recv() => msg.ok_or_else(|| BusError::Read {
                topic: "mock".to_string(),
                message: "end of stream".to_string(),
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_recording_writer_records() {
        let writer = RecordingWriter::new();
        writer
            .write(&Context::background(), Message::new("a"))
            .await
            .unwrap();
        assert_eq!(writer.written_count().await, 1);
    }

    #[tokio::test]
    async fn test_recording_writer_fail_on_write() {
        let writer = RecordingWriter::new();
        writer.set_fail_on_write(true).await;
        let result = writer.write(&Context::background(), Message::new("a")).await;
        assert!(matches!(result, Err(BusError::Write { .. })));
        assert_eq!(writer.written_count().await, 0);
    }

    #[tokio::test]
    async fn test_scripted_reader_ends_after_script() {
        let reader = ScriptedReader::new(vec![Message::new("one")]);
        let ctx = Context::background();

        assert_eq!(reader.read_one(&ctx).await.unwrap().body, "one");
        assert!(matches!(reader.read_one(&ctx).await, Err(BusError::Read { .. })));
    }

    #[tokio::test]
    async fn test_scripted_reader_close_wakes_reader() {
        let (_tx, reader) = ScriptedReader::open();
        let reader = Arc::new(reader);
        let pending = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.read_one(&Context::background()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        reader.close().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BusError::Closed)));
        assert_eq!(reader.close_count(), 1);
    }
}
