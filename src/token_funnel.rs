//! Per-route admission control.
//!
//! Every registered route owns a bucket of tokens that a background task tops
//! up to the route's quota once per tick. A request takes one token before it
//! is dispatched and waits, without a deadline, while the bucket is empty.
//! Routes that were never registered are not metered at all.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::RequestContext;

pub const DEFAULT_BUCKET_CAPACITY: usize = 100_000;
pub const DEFAULT_REPLENISH_INTERVAL: Duration = Duration::from_secs(1);

/// Warnings logged per unregistered route before going quiet.
pub const UNDEFINED_ROUTE_WARN_LIMIT: u32 = 10;

/// Outcome of [`TokenFunnel::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed from the route's bucket.
    Metered,
    /// The route has no quota entry and passed through unmetered.
    Unmetered { warned: bool },
}

#[derive(Clone)]
pub struct TokenFunnel {
    inner: Arc<FunnelInner>,
}

struct FunnelInner {
    capacity: usize,
    state: Mutex<FunnelState>,
}

#[derive(Default)]
struct FunnelState {
    default_quota: u32,
    routes: HashMap<String, RouteBucket>,
    undefined_warnings: HashMap<String, u32>,
}

struct RouteBucket {
    /// Quota resolved at registration; 0 falls back to the default at each tick.
    quota: u32,
    /// Available permits are the tokens currently queued in the bucket.
    tokens: Arc<Semaphore>,
}

impl FunnelState {
    fn effective_quota(&self, bucket: &RouteBucket) -> u32 {
        if bucket.quota == 0 {
            self.default_quota
        } else {
            bucket.quota
        }
    }

    fn register(&mut self, route: &str, quota: u32) {
        let resolved = if quota == 0 { self.default_quota } else { quota };
        let bucket = RouteBucket {
            quota: resolved,
            tokens: Arc::new(Semaphore::new(0)),
        };
        if let Some(old) = self.routes.insert(route.to_string(), bucket) {
            // Wakes waiters on the discarded bucket so they move to the new one.
            old.tokens.close();
        }
    }

    fn note_undefined(&mut self, route: &str) -> bool {
        let count = self.undefined_warnings.entry(route.to_string()).or_insert(0);
        if *count >= UNDEFINED_ROUTE_WARN_LIMIT {
            return false;
        }
        *count += 1;
        true
    }
}

impl TokenFunnel {
    /// Creates a funnel whose buckets hold at most `capacity` tokens.
    ///
    /// No tokens flow until [`start_replenish_task`](Self::start_replenish_task)
    /// is called or [`replenish`](Self::replenish) is driven by hand.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FunnelInner {
                capacity: capacity.clamp(1, Semaphore::MAX_PERMITS),
                state: Mutex::new(FunnelState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn set_default_quota(&self, quota_per_sec: u32) {
        self.inner.state.lock().default_quota = quota_per_sec;
    }

    pub fn default_quota(&self) -> u32 {
        self.inner.state.lock().default_quota
    }

    /// Registers or updates `route`. A quota of 0 takes the default quota as it
    /// is right now. Any tokens already queued for the route are discarded.
    pub fn set_quota(&self, route: &str, quota_per_sec: u32) {
        self.inner.state.lock().register(route, quota_per_sec);
    }

    /// Registers `route` with the default quota unless it already has an entry.
    pub fn autocomplete_quota(&self, route: &str) {
        let mut state = self.inner.state.lock();
        if !state.routes.contains_key(route) {
            state.register(route, 0);
        }
    }

    pub fn is_registered(&self, route: &str) -> bool {
        self.inner.state.lock().routes.contains_key(route)
    }

    /// Quota applied at the next tick, `None` for unregistered routes.
    pub fn quota(&self, route: &str) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .routes
            .get(route)
            .map(|bucket| state.effective_quota(bucket))
    }

    /// Tokens currently queued for `route`.
    pub fn tokens(&self, route: &str) -> Option<usize> {
        let state = self.inner.state.lock();
        state
            .routes
            .get(route)
            .map(|bucket| bucket.tokens.available_permits())
    }

    /// Takes one token for `route`, waiting as long as it takes for one to be
    /// produced. Unregistered routes pass straight through.
    pub async fn acquire(&self, route: &str, ctx: Option<&RequestContext>) -> Admission {
        let request_id = ctx.map(RequestContext::request_id).unwrap_or("-");
        loop {
            let bucket = self
                .inner
                .state
                .lock()
                .routes
                .get(route)
                .map(|bucket| Arc::clone(&bucket.tokens));
            let Some(bucket) = bucket else {
                let warned = self.inner.state.lock().note_undefined(route);
                if warned {
                    warn!(
                        request_id = %request_id,
                        route = %route,
                        "access token quota is not defined, passing request through"
                    );
                }
                return Admission::Unmetered { warned };
            };

            if bucket.available_permits() == 0 {
                debug!(request_id = %request_id, route = %route, "waiting for access token");
            }

            match bucket.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    return Admission::Metered;
                }
                // The route was re-registered while we waited.
                Err(_) => continue,
            };
        }
    }

    /// Tops every registered bucket up to its quota, bounded by the capacity.
    pub fn replenish(&self) {
        let state = self.inner.state.lock();
        for (route, bucket) in &state.routes {
            let quota = state.effective_quota(bucket) as usize;
            if quota == 0 {
                warn!(route = %route, "there is no token quota for route");
                continue;
            }
            let target = quota.min(self.inner.capacity);
            let queued = bucket.tokens.available_permits();
            if queued < target {
                bucket.tokens.add_permits(target - queued);
            }
        }
    }

    /// Spawns the replenishment loop on the current tokio runtime.
    ///
    /// The loop holds only a weak reference and ends once every clone of the
    /// funnel has been dropped.
    pub fn start_replenish_task(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<FunnelInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            // The first tick completes immediately, so buckets fill at startup.
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => TokenFunnel { inner }.replenish(),
                    None => break,
                }
            }
            debug!("token funnel dropped, replenish task finished");
        })
    }
}

impl Default for TokenFunnel {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_CAPACITY)
    }
}

impl std::fmt::Debug for TokenFunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TokenFunnel")
            .field("capacity", &self.inner.capacity)
            .field("default_quota", &state.default_quota)
            .field("routes", &state.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_unregistered_route_passes_through() {
        let funnel = TokenFunnel::default();
        for i in 0..15 {
            let admission = timeout(Duration::from_millis(100), funnel.acquire("/nope", None))
                .await
                .expect("unregistered routes never block");
            let expect_warning = i < UNDEFINED_ROUTE_WARN_LIMIT as usize;
            assert_eq!(admission, Admission::Unmetered { warned: expect_warning });
        }
        // Counters are kept per route name.
        assert_eq!(
            funnel.acquire("/other", None).await,
            Admission::Unmetered { warned: true }
        );
    }

    #[tokio::test]
    async fn test_replenish_fills_to_quota() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 5);
        assert_eq!(funnel.tokens("/x"), Some(0));

        funnel.replenish();
        assert_eq!(funnel.tokens("/x"), Some(5));

        for _ in 0..3 {
            assert_eq!(funnel.acquire("/x", None).await, Admission::Metered);
        }
        assert_eq!(funnel.tokens("/x"), Some(2));

        funnel.replenish();
        assert_eq!(funnel.tokens("/x"), Some(5));
    }

    #[tokio::test]
    async fn test_replenish_bounded_by_capacity() {
        let funnel = TokenFunnel::new(3);
        funnel.set_quota("/x", 10);
        funnel.replenish();
        funnel.replenish();
        assert_eq!(funnel.tokens("/x"), Some(3));
    }

    #[test]
    fn test_zero_quota_resolves_default_at_call_time() {
        let funnel = TokenFunnel::default();
        funnel.set_default_quota(4);
        funnel.set_quota("/x", 0);
        funnel.set_default_quota(9);
        assert_eq!(funnel.quota("/x"), Some(4));
    }

    #[test]
    fn test_route_without_any_quota_follows_later_default() {
        let funnel = TokenFunnel::default();
        funnel.autocomplete_quota("/x");
        funnel.replenish();
        assert_eq!(funnel.tokens("/x"), Some(0));

        funnel.set_default_quota(6);
        funnel.replenish();
        assert_eq!(funnel.tokens("/x"), Some(6));
    }

    #[test]
    fn test_autocomplete_is_idempotent() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 7);
        funnel.replenish();
        funnel.autocomplete_quota("/x");
        assert_eq!(funnel.quota("/x"), Some(7));
        assert_eq!(funnel.tokens("/x"), Some(7));
        assert!(!funnel.is_registered("/y"));
    }

    #[test]
    fn test_reregistering_discards_tokens() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 5);
        funnel.replenish();
        funnel.set_quota("/x", 2);
        assert_eq!(funnel.tokens("/x"), Some(0));
        assert_eq!(funnel.quota("/x"), Some(2));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_replenish() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 1);

        let waiter = tokio::spawn({
            let funnel = funnel.clone();
            async move { funnel.acquire("/x", None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        funnel.replenish();
        let admission = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(admission, Admission::Metered);
        assert_eq!(funnel.tokens("/x"), Some(0));
    }

    #[tokio::test]
    async fn test_waiter_moves_to_new_bucket() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 1);

        let waiter = tokio::spawn({
            let funnel = funnel.clone();
            async move { funnel.acquire("/x", None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        funnel.set_quota("/x", 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        funnel.replenish();
        let admission = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(admission, Admission::Metered);
    }

    #[tokio::test]
    async fn test_background_task_replenishes() {
        let funnel = TokenFunnel::default();
        funnel.set_quota("/x", 2);
        let _task = funnel.start_replenish_task(Duration::from_millis(30));

        for _ in 0..4 {
            let admission = timeout(Duration::from_secs(1), funnel.acquire("/x", None))
                .await
                .unwrap();
            assert_eq!(admission, Admission::Metered);
        }
    }

    #[tokio::test]
    async fn test_task_ends_when_funnel_dropped() {
        let funnel = TokenFunnel::default();
        let task = funnel.start_replenish_task(Duration::from_millis(10));
        drop(funnel);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("task should stop")
            .unwrap();
    }
}
