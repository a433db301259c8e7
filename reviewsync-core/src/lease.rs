//! Lease-based coordination of reconciliation runs per work item.
//!
//! Triggers arrive as independent webhook deliveries, often in bursts (a
//! review submission fires `submitted` and `review_request_removed` within
//! milliseconds). The gate makes sure at most one run per work item
//! effectively completes for such a burst.
//!
//! The lease lives in a [`LeaseStore`], so coordination works across
//! processes. The initial acquire is only eventually consistent: two
//! triggers may both believe they hold the key. When a coalescing window is
//! configured, the re-check after the window is what decides who acts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default age after which a held lease is presumed abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);
/// Default delay between claiming a lease and re-checking ownership.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(3);

/// Persisted, time-bounded ownership of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: impl Into<String>, holder: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            holder: holder.into(),
            acquired_at,
        }
    }

    /// Age of the lease at `now`. Leases from the future count as fresh.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }
}

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease storage failed during {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl LeaseStoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Durable key/value storage for leases.
///
/// Backends only need last-writer-wins semantics; the gate tolerates races
/// between concurrent writers.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Lease>, LeaseStoreError>;

    /// Store a lease (upsert semantics).
    async fn write(&self, lease: &Lease) -> Result<(), LeaseStoreError>;

    async fn delete(&self, key: &str) -> Result<(), LeaseStoreError>;

    /// Delete the lease only if `holder` still owns it. Returns whether a
    /// lease was deleted.
    ///
    /// The default is a read followed by a delete; backends that can do a
    /// conditional delete atomically should override it.
    async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LeaseStoreError> {
        match self.read(key).await? {
            Some(lease) if lease.holder == holder => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory lease store. Leases are lost on restart and not shared across
/// processes.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn read(&self, key: &str) -> Result<Option<Lease>, LeaseStoreError> {
        Ok(self.leases.read().await.get(key).cloned())
    }

    async fn write(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        self.leases
            .write()
            .await
            .insert(lease.key.clone(), lease.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LeaseStoreError> {
        self.leases.write().await.remove(key);
        Ok(())
    }

    async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LeaseStoreError> {
        let mut leases = self.leases.write().await;
        if leases.get(key).is_some_and(|lease| lease.holder == holder) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Age after which a held lease may be reclaimed by anyone.
    pub stale_after: Duration,
    /// Delay before re-checking ownership; `None` disables coalescing.
    pub coalesce_window: Option<Duration>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            coalesce_window: Some(DEFAULT_COALESCE_WINDOW),
        }
    }
}

/// Result of a plain [`CoordinationGate::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Acquired by reclaiming an abandoned lease.
    Reclaimed { previous_holder: String },
    /// Someone else holds a fresh lease.
    Held { holder: String },
}

/// What happened to a guarded action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome<T> {
    Completed(T),
    /// A more recent trigger took the key during the coalescing window.
    Superseded { by: String },
    /// Another holder owns a fresh lease.
    Contended { holder: String },
}

/// Single-flight/coalescing gate keyed by work item identifier.
#[derive(Clone)]
pub struct CoordinationGate {
    store: Arc<dyn LeaseStore>,
    config: GateConfig,
}

impl CoordinationGate {
    pub fn new(store: Arc<dyn LeaseStore>, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Take the key if it is free or its lease is stale.
    pub async fn acquire(&self, key: &str, holder: &str) -> Result<AcquireOutcome, LeaseStoreError> {
        let now = Utc::now();
        let outcome = match self.store.read(key).await? {
            None => AcquireOutcome::Acquired,
            Some(existing) if existing.is_stale(now, self.config.stale_after) => {
                warn!(
                    "Reclaiming stale lease on {} from holder {} (age {}s); previous run likely failed to release",
                    key,
                    existing.holder,
                    existing.age(now).as_secs()
                );
                AcquireOutcome::Reclaimed {
                    previous_holder: existing.holder,
                }
            }
            Some(existing) => {
                return Ok(AcquireOutcome::Held {
                    holder: existing.holder,
                })
            }
        };

        self.store.write(&Lease::new(key, holder, now)).await?;
        Ok(outcome)
    }

    /// Take the key unconditionally, superseding any current holder.
    pub async fn claim(&self, key: &str, holder: &str) -> Result<(), LeaseStoreError> {
        let now = Utc::now();
        if let Some(existing) = self.store.read(key).await? {
            if existing.is_stale(now, self.config.stale_after) {
                warn!(
                    "Overriding stale lease on {} from holder {} (age {}s)",
                    key,
                    existing.holder,
                    existing.age(now).as_secs()
                );
            } else {
                debug!("Superseding holder {} on {}", existing.holder, key);
            }
        }
        self.store.write(&Lease::new(key, holder, now)).await
    }

    /// Clear the lease if `holder` still owns it.
    pub async fn release(&self, key: &str, holder: &str) -> Result<(), LeaseStoreError> {
        if !self.store.delete_if_held(key, holder).await? {
            debug!("Lease on {} no longer held by {}, leaving it", key, holder);
        }
        Ok(())
    }

    /// Run `action` while holding the lease for `key`.
    ///
    /// The lease is released whether or not the action succeeds; the
    /// action's error is then returned unchanged. Superseded or contended
    /// runs return without calling `action`.
    pub async fn run<F, Fut, T>(&self, key: &str, action: F) -> anyhow::Result<GateOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let holder = Uuid::new_v4().to_string();

        match self.config.coalesce_window {
            Some(window) => {
                self.claim(key, &holder).await?;
                tokio::time::sleep(window).await;

                let current = match self.store.read(key).await {
                    Ok(current) => current,
                    Err(e) => {
                        self.release_logged(key, &holder).await;
                        return Err(e.into());
                    }
                };
                if let Some(current) = current {
                    if current.holder != holder {
                        info!(
                            "Trigger for {} superseded by {}, skipping",
                            key, current.holder
                        );
                        return Ok(GateOutcome::Superseded { by: current.holder });
                    }
                }
            }
            None => {
                if let AcquireOutcome::Held { holder: other } = self.acquire(key, &holder).await? {
                    info!("Lease on {} held by {}, skipping", key, other);
                    return Ok(GateOutcome::Contended { holder: other });
                }
            }
        }

        let result = action().await;
        self.release_logged(key, &holder).await;
        result.map(GateOutcome::Completed)
    }

    async fn release_logged(&self, key: &str, holder: &str) {
        if let Err(e) = self.release(key, holder).await {
            warn!("Failed to release lease on {}: {}", key, e);
        }
    }
}
