use async_trait::async_trait;
use std::future::Future;

use crate::error::BoxError;

/// A producer is the origin a cache reads through to.
///
/// It is called whenever the cache decides its value is stale. Calls may happen
/// any number of times over the lifetime of a cache, but a cache never keeps
/// more than one call outstanding at a time.
///
/// Any `Fn() -> impl Future<Output = Result<T, E>>` closure is a producer:
///
/// ```ignore
/// let cache = ValueCache::new("profile", Duration::from_secs(60), move || {
///     let client = client.clone();
///     async move { client.fetch_profile().await }
/// });
/// ```
#[async_trait]
pub trait Producer<T>: Send + Sync {
    /// Produce one fresh value.
    async fn produce(&self) -> Result<T, BoxError>;
}

#[async_trait]
impl<T, F, Fut, E> Producer<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn produce(&self) -> Result<T, BoxError> {
        (self)().await.map_err(Into::into)
    }
}
