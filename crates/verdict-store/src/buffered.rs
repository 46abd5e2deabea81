use crate::{ScanFilter, StoreError, StoreStats, VerdictRecord, VerdictStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_BUFFERED_WRITES: usize = 10_000;

/// Wraps a backend so that backend outages degrade service instead of
/// failing requests: reads fall through to cache misses, writes are held
/// in memory and replayed once the backend answers again. The degraded
/// flag is what the readiness surface reports.
pub struct BufferedStore {
    inner: Arc<dyn VerdictStore>,
    buffer: Mutex<VecDeque<VerdictRecord>>,
    degraded: AtomicBool,
}

impl BufferedStore {
    pub fn new(inner: Arc<dyn VerdictStore>) -> Self {
        Self {
            inner,
            buffer: Mutex::new(VecDeque::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn buffered_writes(&self) -> usize {
        self.buffer.lock().len()
    }

    fn buffer_write(&self, record: VerdictRecord) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= MAX_BUFFERED_WRITES {
            // Oldest entries are the most likely to be refreshed anyway
            buffer.pop_front();
        }
        buffer.push_back(record);
        self.degraded.store(true, Ordering::Relaxed);
    }

    async fn drain_buffer(&self) {
        loop {
            let record = match self.buffer.lock().pop_front() {
                Some(record) => record,
                None => {
                    self.degraded.store(false, Ordering::Relaxed);
                    return;
                }
            };
            if let Err(err) = self.inner.put(record.clone()).await {
                tracing::error!("store still degraded while draining: {err:#}");
                self.buffer.lock().push_front(record);
                return;
            }
        }
    }
}

#[async_trait]
impl VerdictStore for BufferedStore {
    async fn get(&self, normalized: &str) -> Result<Option<(VerdictRecord, Duration)>, StoreError> {
        // A buffered write is fresher than whatever the backend has
        if let Some(record) = self
            .buffer
            .lock()
            .iter()
            .rev()
            .find(|r| r.email == normalized)
        {
            return Ok(Some((record.clone(), crate::age_of(record))));
        }

        match self.inner.get(normalized).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::error!("store read failed, treating as miss: {err:#}");
                self.degraded.store(true, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, record: VerdictRecord) -> Result<(), StoreError> {
        if self.is_degraded() {
            // Probe the backend with this write before replaying the rest
            match self.inner.put(record.clone()).await {
                Ok(()) => {
                    self.drain_buffer().await;
                    return Ok(());
                }
                Err(_) => {
                    self.buffer_write(record);
                    return Ok(());
                }
            }
        }

        match self.inner.put(record.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!("store write failed, buffering: {err:#}");
                self.buffer_write(record);
                Ok(())
            }
        }
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }

    async fn scan(&self, filter: ScanFilter) -> Result<Vec<VerdictRecord>, StoreError> {
        self.inner.scan(filter).await
    }
}
