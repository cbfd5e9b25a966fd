//! Background executors that run compaction jobs.

use std::future::Future;

/// Spawns detached background jobs.
///
/// Jobs own everything they need; the executor never hands results back.
pub trait Executor: Send + Sync + 'static {
    /// Run `future` in the background.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

#[cfg(any(feature = "tokio", test))]
pub mod tokio {
    //! Tokio-backed executor.

    use std::future::Future;

    use tokio::runtime::Handle;

    use super::Executor;

    /// Executor spawning onto a tokio runtime handle.
    ///
    /// Spawning through the handle works from engine threads that are not runtime workers.
    #[derive(Clone, Debug)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        /// Spawn onto the runtime behind `handle`.
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// Spawn onto the runtime of the calling context, if there is one.
        pub fn try_current() -> Option<Self> {
            Handle::try_current().ok().map(Self::new)
        }
    }

    impl Executor for TokioExecutor {
        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            self.handle.spawn(future);
        }
    }

}
