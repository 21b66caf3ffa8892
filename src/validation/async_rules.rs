//! Rules that have to await something (a lookup, a snapshot load) before
//! they can answer. Values are passed by value, so callers usually validate
//! an `Arc` of the candidate to keep clones cheap.

use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{ErrorType, Rule, VALIDATION_TIMEOUT, ValidationError, ValidationResult};

type AsyncCheck<T> = dyn Fn(T) -> BoxFuture<'static, ValidationResult> + Send + Sync;

pub struct AsyncRule<T> {
    name: Arc<str>,
    check: Arc<AsyncCheck<T>>,
}

impl<T> Clone for AsyncRule<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            check: Arc::clone(&self.check),
        }
    }
}

impl<T> AsyncRule<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: &str, check: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ValidationResult> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            check: Arc::new(move |value: T| check(value).boxed()),
        }
    }

    /// Lifts a synchronous rule.
    pub fn from_rule(name: &str, rule: Rule<T>) -> Self {
        Self::new(name, move |value: T| future::ready(rule.check(&value)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn check(&self, value: T) -> ValidationResult {
        (self.check)(value).await
    }

    /// Runs every rule concurrently and unions their failures.
    pub fn parallel(name: &str, rules: Vec<AsyncRule<T>>) -> Self {
        let rules = Arc::new(rules);
        Self::new(name, move |value: T| {
            let rules = Arc::clone(&rules);
            async move {
                let checks = rules.iter().map(|rule| rule.check(value.clone()));
                let merged: ValidationResult = future::join_all(checks).await.into_iter().collect();
                merged
            }
        })
    }

    /// Runs rules in order and stops at the first failure.
    pub fn sequential(name: &str, rules: Vec<AsyncRule<T>>) -> Self {
        let rules = Arc::new(rules);
        Self::new(name, move |value: T| {
            let rules = Arc::clone(&rules);
            async move {
                for rule in rules.iter() {
                    let result = rule.check(value.clone()).await;
                    if !result.is_success() {
                        debug!(rule = rule.name(), "sequential validation stopped");
                        return result;
                    }
                }
                ValidationResult::Success
            }
        })
    }

    /// Fails with [`VALIDATION_TIMEOUT`] when the rule does not finish in
    /// time; the pending check is dropped.
    pub fn with_timeout(self, limit: Duration) -> Self {
        let name = self.name.to_string();
        let label = name.clone();
        Self::new(&label, move |value: T| {
            let inner = self.clone();
            let name = name.clone();
            async move {
                match tokio::time::timeout(limit, inner.check(value)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(rule = %name, limit_ms = limit.as_millis() as u64, "validation rule timed out");
                        ValidationResult::fail(
                            ValidationError::new(
                                ErrorType::Internal,
                                format!("validation '{name}' exceeded {}ms", limit.as_millis()),
                            )
                            .with_code(VALIDATION_TIMEOUT),
                        )
                    }
                }
            }
        })
    }

    /// Re-runs a failing rule up to `attempts` times in total, waiting
    /// `delay` between tries. The last failure is returned.
    pub fn with_retry(self, attempts: u32, delay: Duration) -> Self {
        let attempts = attempts.max(1);
        let name = self.name.to_string();
        Self::new(&name, move |value: T| {
            let inner = self.clone();
            async move {
                let mut attempt = 1;
                loop {
                    let result = inner.check(value.clone()).await;
                    if result.is_success() || attempt >= attempts {
                        return result;
                    }
                    debug!(rule = inner.name(), attempt, "validation failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        })
    }

    /// Caches results by a caller-supplied key for `ttl`.
    pub fn memoized<K>(self, key: K, cache: MemoCache) -> Self
    where
        K: Fn(&T) -> String + Send + Sync + 'static,
    {
        let name = self.name.to_string();
        let key = Arc::new(key);
        Self::new(&name, move |value: T| {
            let inner = self.clone();
            let cache = cache.clone();
            let cache_key = key(&value);
            async move {
                if let Some(hit) = cache.get(&cache_key) {
                    return hit;
                }
                let result = inner.check(value).await;
                cache.insert(cache_key, result.clone());
                result
            }
        })
    }
}

/// Shared TTL cache used by [`AsyncRule::memoized`].
#[derive(Clone)]
pub struct MemoCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, (Instant, ValidationResult)>>>,
}

impl MemoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &str) -> Option<ValidationResult> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((stored, result)) if stored.elapsed() < self.ttl => Some(result.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, result: ValidationResult) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        entries.insert(key, (Instant::now(), result));
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(name: &str, message: &'static str) -> AsyncRule<u32> {
        AsyncRule::new(name, move |_value: u32| async move {
            ValidationResult::fail(ValidationError::business(message))
        })
    }

    fn counting(counter: Arc<AtomicUsize>) -> AsyncRule<u32> {
        AsyncRule::new("counting", move |_value: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ValidationResult::Success
            }
        })
    }

    #[tokio::test]
    async fn test_parallel_unions_failures() {
        let rule = AsyncRule::parallel("both", vec![failing("a", "first"), failing("b", "second")]);
        let result = rule.check(1).await;
        assert_eq!(result.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let rule = AsyncRule::sequential(
            "ordered",
            vec![failing("a", "first"), counting(Arc::clone(&counter))],
        );
        let result = rule.check(1).await;
        assert_eq!(result.errors().len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_reports_code() {
        let slow = AsyncRule::new("slow", |_value: u32| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            ValidationResult::Success
        });
        let result = slow.with_timeout(Duration::from_millis(20)).check(1).await;
        assert!(result.errors()[0].has_code(VALIDATION_TIMEOUT));
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tracked = Arc::clone(&calls);
        let rule = AsyncRule::new("flaky", move |_value: u32| {
            let calls = Arc::clone(&tracked);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                ValidationResult::fail(ValidationError::new(ErrorType::Database, format!("attempt {n}")))
            }
        });

        let result = rule.with_retry(3, Duration::from_millis(1)).check(1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.errors()[0].message, "attempt 3");
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tracked = Arc::clone(&calls);
        let rule = AsyncRule::new("eventually", move |_value: u32| {
            let calls = Arc::clone(&tracked);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ValidationResult::fail(ValidationError::new(ErrorType::Database, "busy"))
                } else {
                    ValidationResult::Success
                }
            }
        });
        assert!(rule.with_retry(5, Duration::from_millis(1)).check(1).await.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memoized_skips_repeat_lookups() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = MemoCache::new(Duration::from_secs(60));
        let rule = counting(Arc::clone(&counter)).memoized(|value: &u32| value.to_string(), cache.clone());

        assert!(rule.check(7).await.is_success());
        assert!(rule.check(7).await.is_success());
        assert!(rule.check(8).await.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_memo_entries_expire() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = MemoCache::new(Duration::from_millis(10));
        let rule = counting(Arc::clone(&counter)).memoized(|_: &u32| "k".to_string(), cache);

        let _ = rule.check(1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = rule.check(1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_from_rule_lifts_sync_check() {
        let rule = AsyncRule::from_rule(
            "even",
            Rule::new(|value: &u32| {
                ValidationResult::check(value % 2 == 0, || ValidationError::field("n", "odd"))
            }),
        );
        assert!(rule.check(2).await.is_success());
        assert!(!rule.check(3).await.is_success());
    }
}
