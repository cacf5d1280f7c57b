//! Fixed-size lease/return pool
//!
//! Clients are created once up front. A lease removes one client from the idle
//! list and the guard puts it back on drop, so a client is only ever used by
//! one holder at a time.

use crate::{metrics, PoolError};
use std::ops::Deref;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

pub struct ClientPool<C> {
    name: String,
    idle: Mutex<Vec<C>>,
    permits: Semaphore,
    size: usize,
    acquire_timeout: Duration,
}

impl<C> ClientPool<C> {
    /// Build a pool from pre-constructed clients.
    ///
    /// Returns [`PoolError::Empty`] when `clients` is empty, since every lease
    /// would otherwise wait out the full acquire timeout.
    pub fn new(
        name: impl Into<String>,
        clients: Vec<C>,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        if clients.is_empty() {
            return Err(PoolError::Empty { pool: name });
        }
        let size = clients.len();
        debug!(pool = %name, size, "ClickHouse client pool created");
        Ok(Self {
            name,
            permits: Semaphore::new(size),
            idle: Mutex::new(clients),
            size,
            acquire_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Clients not currently leased
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Lease a client, waiting up to the pool's acquire timeout
    pub async fn acquire(&self) -> Result<PooledClient<'_, C>, PoolError> {
        let start = Instant::now();

        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                metrics::record_acquire_error(&self.name, "closed");
                return Err(PoolError::Closed {
                    pool: self.name.clone(),
                });
            }
            Err(_) => {
                metrics::record_acquire_error(&self.name, "timeout");
                warn!(
                    pool = %self.name,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "ClickHouse client lease timed out"
                );
                return Err(PoolError::Timeout {
                    pool: self.name.clone(),
                    waited: start.elapsed(),
                });
            }
        };

        // A permit guarantees an idle client exists.
        let client = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .ok_or_else(|| PoolError::Empty {
                pool: self.name.clone(),
            })?;

        metrics::record_acquire(&self.name, start.elapsed(), self.available());

        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    /// Stop handing out leases. Pending and future `acquire` calls fail with
    /// [`PoolError::Closed`]; outstanding leases stay valid until dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    fn release(&self, client: C) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(client);
    }
}

/// A leased client. Returned to the pool when dropped.
pub struct PooledClient<'a, C> {
    pool: &'a ClientPool<C>,
    client: Option<C>,
    // Dropped after `Drop::drop` has pushed the client back.
    _permit: SemaphorePermit<'a>,
}

impl<C> Deref for PooledClient<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only taken in Drop
        match self.client.as_ref() {
            Some(client) => client,
            None => unreachable!("pooled client accessed after release"),
        }
    }
}

impl<C> Drop for PooledClient<'_, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
            // The permit is still held here, so count it as returned.
            metrics::record_release(&self.pool.name, self.pool.available() + 1);
        }
    }
}
