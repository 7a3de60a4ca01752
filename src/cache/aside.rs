//! Cache-aside helper: look up, otherwise compute and store.

use std::future::Future;

use super::{Cache, Ttl};

/// Returns the cached value for `key`, or runs `supplier`, caches an `Ok`
/// result under `key` with `ttl` and `tags`, and returns it.
///
/// Errors from `supplier` are passed through and never cached. Concurrent
/// misses on the same key may each run the supplier; the last write wins.
///
/// # Examples
///
/// ```
/// use hostgate::cache::{cached, Cache, CacheConfig, Ttl};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = Cache::new(CacheConfig::default());
/// let value: Result<u32, String> =
///     cached(&cache, "answer", Ttl::Default, &[], || async { Ok(42) }).await;
/// assert_eq!(value, Ok(42));
/// assert_eq!(cache.get("answer"), Some(42));
/// # }
/// ```
pub async fn cached<V, E, F, Fut>(
    cache: &Cache<V>,
    key: &str,
    ttl: Ttl,
    tags: &[&str],
    supplier: F,
) -> Result<V, E>
where
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    if let Some(hit) = cache.get(key) {
        return Ok(hit);
    }

    let value = supplier().await?;
    cache.set_with(key, value.clone(), ttl, tags);
    Ok(value)
}
