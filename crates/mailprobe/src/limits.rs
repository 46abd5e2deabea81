use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("probe capacity saturated and wait queue full")]
pub struct Overloaded;

/// A held slot for one SMTP conversation: one unit of the global cap plus
/// one unit of the destination host's cap.
#[derive(Debug)]
pub struct ProbePermit {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

/// The fixed set of blocking resources. Waiting is bounded: once
/// `queue_depth` acquirers are parked, further requests fail fast with
/// `Overloaded` instead of building unbounded latency.
pub struct ProbeLimiter {
    global: Arc<Semaphore>,
    per_host: DashMap<String, Arc<Semaphore>>,
    per_host_limit: usize,
    enrichment: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProbeLimiter {
    pub fn new(global: usize, per_host: usize, enrichment: usize, queue_depth: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global)),
            per_host: DashMap::new(),
            per_host_limit: per_host,
            enrichment: Arc::new(Semaphore::new(enrichment)),
            waiting: AtomicUsize::new(0),
            queue_depth,
        }
    }

    fn enter_queue(&self) -> Result<WaitGuard, Overloaded> {
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(Overloaded);
        }
        Ok(WaitGuard(&self.waiting))
    }

    pub async fn acquire_smtp(&self, host: &str) -> Result<ProbePermit, Overloaded> {
        let _queued = self.enter_queue()?;

        let host_sema = self
            .per_host
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone();

        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Overloaded)?;
        let host = host_sema.acquire_owned().await.map_err(|_| Overloaded)?;

        Ok(ProbePermit {
            _global: global,
            _host: host,
        })
    }

    pub async fn acquire_enrichment(&self) -> Result<OwnedSemaphorePermit, Overloaded> {
        let _queued = self.enter_queue()?;
        self.enrichment
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Overloaded)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn per_host_cap_is_independent_of_global() {
        let limiter = Arc::new(ProbeLimiter::new(10, 1, 2, 16));

        let held = limiter.acquire_smtp("mx1.example.com").await.unwrap();

        // Same host is at its cap; a different host still gets through
        let other = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire_smtp("mx2.example.com"),
        )
        .await
        .expect("different host should not wait")
        .unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire_smtp("mx1.example.com"),
        )
        .await;
        assert!(blocked.is_err(), "same host should be blocked at cap 1");

        drop(held);
        drop(other);
        limiter.acquire_smtp("mx1.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_fails_fast_with_overloaded() {
        let limiter = Arc::new(ProbeLimiter::new(1, 4, 2, 1));

        let _held = limiter.acquire_smtp("mx.example.com").await.unwrap();

        // One waiter parks in the queue
        let parked = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_smtp("mx.example.com").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The queue is now full; the next acquirer is rejected immediately
        assert_eq!(
            limiter.acquire_smtp("mx.example.com").await.unwrap_err(),
            Overloaded
        );

        drop(_held);
        parked.await.unwrap().unwrap();
    }
}
