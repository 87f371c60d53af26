//! Token refresh with an explicit single-flight cache.
//!
//! Refreshes are keyed by the composed identity (expired token, user id) so
//! the shared-resource sub-tasks of one run never stampede the auth service:
//! concurrent callers for the same key coalesce onto one in-flight refresh
//! and all observe its result. Entries expire after a fixed TTL; expiry is
//! checked against the injected clock, never wall time directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use carta_graph::Clock;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::SyncError;

/// The auth collaborator: exchange an expired token for a fresh one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, token: &str, user_id: &str) -> Result<String, SyncError>;
}

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: i64,
}

type FlightKey = (String, String);

pub struct TokenRefreshCache {
    inner: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    entries: DashMap<FlightKey, CacheEntry>,
    flights: Mutex<HashMap<FlightKey, Arc<Mutex<()>>>>,
}

impl TokenRefreshCache {
    pub fn new(inner: Arc<dyn TokenRefresher>, clock: Arc<dyn Clock>, ttl_ms: i64) -> Self {
        Self {
            inner,
            clock,
            ttl_ms,
            entries: DashMap::new(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the token for `(token, user_id)`, serving a cached result
    /// while it is within TTL and coalescing concurrent refreshes.
    pub async fn refresh(&self, token: &str, user_id: &str) -> Result<String, SyncError> {
        let key = (token.to_string(), user_id.to_string());

        if let Some(fresh) = self.cached(&key) {
            return Ok(fresh);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // A concurrent caller may have completed the refresh while this one
        // waited on the flight lock.
        if let Some(fresh) = self.cached(&key) {
            return Ok(fresh);
        }

        tracing::debug!(user = %user_id, "refreshing auth token");
        let value = self.inner.refresh(token, user_id).await?;
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: self.clock.now_ms() + self.ttl_ms,
            },
        );
        Ok(value)
    }

    /// Drop the cached result for one identity, forcing the next call to hit
    /// the refresher.
    pub fn invalidate(&self, token: &str, user_id: &str) {
        self.entries
            .remove(&(token.to_string(), user_id.to_string()));
    }

    fn cached(&self, key: &FlightKey) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > self.clock.now_ms() {
            Some(entry.value.clone())
        } else {
            None
        }
    }
}
