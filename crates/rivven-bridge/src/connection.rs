//! Connection traits for rivven-bridge
//!
//! Core abstractions for backend connectivity:
//! - Connection: one backend session with query execution
//! - RowStream: batched, pull-based row iteration
//! - ReaderRowStream: a RowStream over a driver's borrowed result cursor
//! - ConnectionFactory: opens sessions for a [`ProviderConfig`]
//!
//! Drivers implement these traits; everything above the pool talks to the
//! backend only through them.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::dialect::Provider;
use crate::error::Result;
use crate::types::{Row, Value};

/// A connection to a backend database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and stream results in batches
    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Box<dyn RowStream>>;

    /// Identity value generated by the last insert on this session.
    ///
    /// Providers that support `RETURNING` never need this.
    async fn last_insert_id(&self) -> Result<Option<i64>> {
        Ok(None)
    }

    /// Execute a query and return the first row (convenience method)
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Streaming row iterator
#[async_trait]
pub trait RowStream: Send {
    /// Pull up to `max` rows. An empty batch means the stream is drained.
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Row>>;
}

/// Row stream over rows that are already materialized
#[derive(Debug, Default)]
pub struct VecRowStream {
    rows: VecDeque<Row>,
}

impl VecRowStream {
    /// Create a stream over the given rows
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    /// Rows not yet pulled
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl RowStream for VecRowStream {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Row>> {
        let take = max.max(1).min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }
}

/// Row stream fed by a reader future that owns the session and its open
/// result.
///
/// Drivers whose cursors borrow the session move both into the reader.
/// The reader only runs while [`RowStream::next_batch`] waits on it, so at
/// most `capacity` rows sit decoded ahead of the consumer. Dropping the
/// stream drops the reader, and with it the session lock, immediately.
pub struct ReaderRowStream {
    reader: Option<BoxFuture<'static, ()>>,
    rx: mpsc::Receiver<Result<Row>>,
}

impl ReaderRowStream {
    /// Build a stream from a reader that sends rows into the given sender.
    /// The stream ends when the reader returns.
    pub fn new<F, Fut>(capacity: usize, read: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Row>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            reader: Some(Box::pin(read(tx))),
            rx,
        }
    }
}

#[async_trait]
impl RowStream for ReaderRowStream {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Row>> {
        let max = max.max(1);
        let mut rows = Vec::with_capacity(max);
        while rows.len() < max {
            let received = match self.reader.as_mut() {
                Some(reader) => tokio::select! {
                    biased;
                    item = self.rx.recv() => Some(item),
                    () = reader => None,
                },
                None => Some(self.rx.recv().await),
            };
            match received {
                // Reader finished; its sender is gone, so buffered rows
                // drain and then the channel closes
                None => self.reader = None,
                Some(Some(row)) => rows.push(row?),
                Some(None) => break,
            }
        }
        Ok(rows)
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn Connection>>;

    /// Provider this factory speaks to
    fn provider(&self) -> Provider;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> Row {
        Row::new(vec!["id".into()], vec![Value::Int64(id)])
    }

    #[tokio::test]
    async fn test_vec_row_stream_batches() {
        let mut stream = VecRowStream::new((1..=5).map(row).collect());

        let first = stream.next_batch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].get(0), Some(&Value::Int64(1)));
        assert_eq!(stream.remaining(), 3);

        let rest = stream.next_batch(10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(stream.next_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_stream_pulls_on_demand() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let mut stream = ReaderRowStream::new(2, move |tx| async move {
            for id in 1..=10 {
                if tx.send(Ok(row(id))).await.is_err() {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Nothing runs before the first pull
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        let first = stream.next_batch(1).await.unwrap();
        assert_eq!(first[0].get(0), Some(&Value::Int64(1)));
        assert!(sent.load(Ordering::SeqCst) <= 3);

        let rest = stream.next_batch(100).await.unwrap();
        assert_eq!(rest.len(), 9);
        assert!(stream.next_batch(100).await.unwrap().is_empty());
        assert_eq!(sent.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_reader_stream_drop_releases_reader() {
        use std::sync::Arc;

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&lock).lock_owned().await;
        let mut stream = ReaderRowStream::new(1, move |tx| async move {
            let _guard = guard;
            for id in 1.. {
                if tx.send(Ok(row(id))).await.is_err() {
                    return;
                }
            }
        });

        assert_eq!(stream.next_batch(2).await.unwrap().len(), 2);
        assert!(lock.try_lock().is_err());

        drop(stream);
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_reader_stream_surfaces_errors() {
        let mut stream = ReaderRowStream::new(4, |tx| async move {
            let _ = tx.send(Ok(row(1))).await;
            let _ = tx.send(Err(crate::error::Error::query("bad row"))).await;
        });
        assert!(stream.next_batch(10).await.is_err());
    }

    #[tokio::test]
    async fn test_vec_row_stream_zero_max_still_progresses() {
        let mut stream = VecRowStream::new(vec![row(1)]);
        assert_eq!(stream.next_batch(0).await.unwrap().len(), 1);
    }
}
