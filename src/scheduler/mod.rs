//! Timer-based call coalescing.
//!
//! `Debounce` runs on the trailing edge after a quiet period; `Throttle` runs
//! on the leading edge and coalesces hot-path calls into one trailing run per
//! interval. Both are built once per trigger and cloned freely; clones share
//! the same timer state.

pub mod debounce;
pub mod throttle;

use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;

pub use debounce::Debounce;
pub use throttle::Throttle;

/// A scheduled action. Takes the arguments of the call that ends up firing.
pub type Action<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

/// Boxes an async closure into an [`Action`].
pub fn action<A, F, Fut>(f: F) -> Action<A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}
