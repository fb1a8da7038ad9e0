//! Transform trait and closure adapters.
//!
//! A transform is the unit of work a stage applies to each task. The engine
//! treats it as opaque: task in, zero or more tasks out.

use crate::errors::TransformError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for stage transformations.
///
/// A transform consumes one task and produces zero or more output tasks.
/// Returning an empty vector drops the task from the stream without error;
/// returning `Err` reports a fault and the worker applies the stage's retry
/// policy.
#[async_trait]
pub trait Transform<T>: Send + Sync {
    /// Applies the transformation to one task.
    async fn transform(&self, task: T) -> Result<Vec<T>, TransformError>;
}

/// A transform backed by a synchronous closure.
pub struct FnTransform<F> {
    func: F,
}

impl<F> FnTransform<F> {
    /// Creates a transform from a closure returning a full result batch.
    pub fn new<T>(func: F) -> Self
    where
        F: Fn(T) -> Result<Vec<T>, TransformError> + Send + Sync,
    {
        Self { func }
    }
}

impl<F> Debug for FnTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform").finish()
    }
}

#[async_trait]
impl<T, F> Transform<T> for FnTransform<F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<Vec<T>, TransformError> + Send + Sync,
{
    async fn transform(&self, task: T) -> Result<Vec<T>, TransformError> {
        (self.func)(task)
    }
}

/// A one-to-one mapping transform.
pub struct MapTransform<F> {
    func: F,
}

impl<F> MapTransform<F> {
    /// Creates a transform that maps each task to exactly one output.
    pub fn new<T>(func: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync,
    {
        Self { func }
    }
}

impl<F> Debug for MapTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapTransform").finish()
    }
}

#[async_trait]
impl<T, F> Transform<T> for MapTransform<F>
where
    T: Send + 'static,
    F: Fn(T) -> T + Send + Sync,
{
    async fn transform(&self, task: T) -> Result<Vec<T>, TransformError> {
        Ok(vec![(self.func)(task)])
    }
}

/// A zero-or-one mapping transform.
pub struct FilterMapTransform<F> {
    func: F,
}

impl<F> FilterMapTransform<F> {
    /// Creates a transform that maps each task to zero or one output.
    pub fn new<T>(func: F) -> Self
    where
        F: Fn(T) -> Option<T> + Send + Sync,
    {
        Self { func }
    }
}

impl<F> Debug for FilterMapTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterMapTransform").finish()
    }
}

#[async_trait]
impl<T, F> Transform<T> for FilterMapTransform<F>
where
    T: Send + 'static,
    F: Fn(T) -> Option<T> + Send + Sync,
{
    async fn transform(&self, task: T) -> Result<Vec<T>, TransformError> {
        Ok((self.func)(task).into_iter().collect())
    }
}

/// A transform backed by an async closure.
pub struct AsyncFnTransform<F, Fut> {
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnTransform<F, Fut> {
    /// Creates a transform from an async closure.
    pub fn new<T>(func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Vec<T>, TransformError>> + Send,
    {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnTransform<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnTransform").finish()
    }
}

#[async_trait]
impl<T, F, Fut> Transform<T> for AsyncFnTransform<F, Fut>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<T>, TransformError>> + Send,
{
    async fn transform(&self, task: T) -> Result<Vec<T>, TransformError> {
        (self.func)(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_transform() {
        let t = FnTransform::new(|x: u32| Ok(vec![x, x]));
        assert_eq!(t.transform(2).await.unwrap(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_map_transform() {
        let t = MapTransform::new(|x: u32| x * 2);
        assert_eq!(t.transform(21).await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_filter_map_transform() {
        let t = FilterMapTransform::new(|x: u32| (x % 2 == 0).then_some(x));
        assert_eq!(t.transform(4).await.unwrap(), vec![4]);
        assert!(t.transform(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_async_fn_transform() {
        let t = AsyncFnTransform::new(|x: u32| async move { Ok(vec![x + 1]) });
        assert_eq!(t.transform(1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_transform_error_propagates() {
        let t = FnTransform::new(|_: u32| Err(TransformError::new("boom")));
        let err = t.transform(1).await.unwrap_err();
        assert_eq!(err.message, "boom");
    }
}
