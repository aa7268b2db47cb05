//! Topic registry: memoized backend handles per topic name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Backend, BusError, Reader, Result, TopicSpec, Writer};
use crate::config::BusSettings;

/// Upper bound on a single handle's close during `close_all`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Topics {
    writers: HashMap<String, Arc<dyn Writer>>,
    readers: HashMap<String, Arc<dyn Reader>>,
    closed: bool,
}

/// Lazily creates and memoizes one writer and one reader per topic.
///
/// A topic's handles, once created, are never replaced; `close_all` is the
/// only way they leave the map, and after it no new handles are created.
pub(crate) struct TopicRegistry {
    backend: Backend,
    brokers: Vec<String>,
    settings: BusSettings,
    topics: RwLock<Topics>,
}

impl TopicRegistry {
    pub(crate) fn new(backend: Backend, brokers: Vec<String>, settings: BusSettings) -> Self {
        Self {
            backend,
            brokers,
            settings,
            topics: RwLock::new(Topics::default()),
        }
    }

    fn spec<'a>(&'a self, topic: &'a str) -> TopicSpec<'a> {
        TopicSpec {
            brokers: &self.brokers,
            topic,
            settings: &self.settings,
        }
    }

    pub(crate) async fn writer(&self, topic: &str) -> Result<Arc<dyn Writer>> {
        if let Some(writer) = self.topics.read().await.writers.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let mut topics = self.topics.write().await;
        if topics.closed {
            return Err(BusError::Closed);
        }
        // Another caller may have won the race between the two locks.
        let writer = topics
            .writers
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, backend = self.backend.name, "Creating topic writer");
                (self.backend.writers)(&self.spec(topic))
            });
        Ok(Arc::clone(writer))
    }

    pub(crate) async fn reader(&self, topic: &str) -> Result<Arc<dyn Reader>> {
        if let Some(reader) = self.topics.read().await.readers.get(topic) {
            return Ok(Arc::clone(reader));
        }

        let mut topics = self.topics.write().await;
        if topics.closed {
            return Err(BusError::Closed);
        }
        let reader = topics
            .readers
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, backend = self.backend.name, "Creating topic reader");
                (self.backend.readers)(&self.spec(topic))
            });
        Ok(Arc::clone(reader))
    }

    /// Close every handle and empty the map. Later lookups fail with
    /// `BusError::Closed`. Individual close errors and timeouts are logged
    /// and suppressed.
    pub(crate) async fn close_all(&self) {
        let (writers, readers) = {
            let mut topics = self.topics.write().await;
            topics.closed = true;
            (
                std::mem::take(&mut topics.writers),
                std::mem::take(&mut topics.readers),
            )
        };

        for (topic, writer) in writers {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Failed to close writer"),
                Err(_) => warn!(topic = %topic, "Timed out closing writer"),
            }
        }
        for (topic, reader) in readers {
            match tokio::time::timeout(CLOSE_TIMEOUT, reader.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Failed to close reader"),
                Err(_) => warn!(topic = %topic, "Timed out closing reader"),
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn topic_count(&self) -> (usize, usize) {
        let topics = self.topics.read().await;
        (topics.writers.len(), topics.readers.len())
    }
}
