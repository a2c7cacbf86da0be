//! Expiry-aware token cache shared by all providers.
use std::{fmt, future::Future, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;

/// Source of the current time for expiry decisions.
///
/// Providers sign with the same clock they cache with, so a manual clock makes token
/// generation fully deterministic.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    /// Wall clock time
    #[default]
    System,
    /// Time that only moves when told to
    Manual(Arc<Mutex<DateTime<Utc>>>),
}

impl Clock {
    /// A manual clock starting at `start`.
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self::Manual(Arc::new(Mutex::new(start)))
    }

    /// Current time.
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Manual(t) => *t.lock(),
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Self::Manual(t) = self {
            *t.lock() += by;
        }
    }

    /// Set a manual clock. No-op for the system clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Self::Manual(t) = self {
            *t.lock() = to;
        }
    }
}

/// A value with an optional expiry.
///
/// A value without an expiry is always stale.
#[derive(Clone)]
pub struct Cached<T> {
    /// The cached value
    pub value: T,
    /// When the value stops being valid
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
    /// Wrap a value valid until `expires_at`.
    pub fn new(value: T, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    /// Whether the value must be refreshed at `now`, refreshing `skew` early.
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now + skew >= expires_at,
            None => true,
        }
    }
}

impl<T> fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A cached bearer token.
pub type CachedToken = Cached<SecretString>;

/// Cache holding at most one value, refreshed `skew` before it expires.
///
/// Refreshes through [`get_or_refresh`](Self::get_or_refresh) are single-flight: callers
/// that queue behind a running refresh reuse its result instead of refreshing again.
pub struct TokenCache<T = SecretString> {
    skew: Duration,
    clock: Clock,
    slot: RwLock<Option<Cached<T>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<T> fmt::Debug for TokenCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("skew", &self.skew)
            .field("expires_at", &self.slot.read().as_ref().map(|c| c.expires_at))
            .finish()
    }
}

impl<T: Clone> TokenCache<T> {
    /// An empty cache refreshing `skew` before expiry.
    pub fn new(skew: Duration) -> Self {
        Self {
            skew,
            clock: Clock::default(),
            slot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Use `clock` for expiry decisions.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The clock this cache decides expiry with.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The refresh margin.
    pub fn skew(&self) -> Duration {
        self.skew
    }

    /// True when nothing is cached, the expiry is unknown, or `now + skew >= expires_at`.
    pub fn needs_refresh(&self) -> bool {
        self.fresh().is_none()
    }

    /// The cached value if it does not need a refresh.
    pub fn fresh(&self) -> Option<T> {
        let now = self.clock.now();
        self.slot
            .read()
            .as_ref()
            .filter(|c| !c.is_stale(now, self.skew))
            .map(|c| c.value.clone())
    }

    /// The cached entry regardless of staleness.
    pub fn cached(&self) -> Option<Cached<T>> {
        self.slot.read().clone()
    }

    /// Replace the cached entry.
    pub fn store(&self, cached: Cached<T>) {
        *self.slot.write() = Some(cached);
    }

    /// Drop the cached entry.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Return the cached value, refreshing it with `refresh` first when it is stale.
    ///
    /// The value returned by `refresh` is returned as is, even if it is already stale.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Cached<T>, E>>,
    {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(value) = self.fresh() {
            return Ok(value);
        }
        self.run(refresh).await
    }

    /// Unconditionally refresh the cached value with `refresh`.
    ///
    /// On failure the previous entry is kept.
    pub async fn refresh_with<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Cached<T>, E>>,
    {
        let _guard = self.refresh_lock.lock().await;
        self.run(refresh).await
    }

    async fn run<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Cached<T>, E>>,
    {
        let cached = refresh().await?;
        let value = cached.value.clone();
        tracing::trace!(expires_at = ?cached.expires_at, "stored refreshed value");
        self.store(cached);
        Ok(value)
    }
}
