//! Idempotency cache for client transaction ids.
//!
//! Clients retry `PUT …/send/{type}/{txn_id}`; the first response is cached
//! per `(access_token, txn_id)` and replayed until it expires.  Concurrent
//! retries of the same transaction wait for the first one instead of racing
//! it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

pub const DEFAULT_TXN_TTL: Duration = Duration::from_secs(30 * 60);

struct Slot {
    created: Instant,
    response: Arc<OnceCell<Value>>,
}

pub struct TransactionCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), Slot>>,
}

impl Default for TransactionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TXN_TTL)
    }
}

impl TransactionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached response for `(access_token, txn_id)`, or run `send`
    /// and cache what it returns.
    ///
    /// `send` runs at most once per live transaction.  If it fails nothing is
    /// cached and the next retry runs it again.  Expired entries are swept on
    /// the way in.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        access_token: &str,
        txn_id: &str,
        send: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        let response = {
            let mut entries = self.entries.lock().await;
            let ttl = self.ttl;
            entries.retain(|_, slot| slot.created.elapsed() < ttl);
            entries
                .entry((access_token.to_string(), txn_id.to_string()))
                .or_insert_with(|| Slot {
                    created: Instant::now(),
                    response: Arc::new(OnceCell::new()),
                })
                .response
                .clone()
        };
        if let Some(cached) = response.get() {
            debug!(%txn_id, "replaying cached transaction");
            return Ok(cached.clone());
        }
        response.get_or_try_init(send).await.cloned()
    }

    /// Live transactions, including ones still in flight.
    pub async fn len(&self) -> usize {
        let ttl = self.ttl;
        self.entries
            .lock()
            .await
            .values()
            .filter(|slot| slot.created.elapsed() < ttl)
            .count()
    }
}
