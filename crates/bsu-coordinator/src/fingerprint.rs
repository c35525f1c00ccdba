//! Request coalescing (design spec §4.5.10).
//!
//! A fingerprint is `(operation kind, user-supplied name)`; the operation
//! kind is implicit in which `Coalescer` a caller uses. Two concurrent
//! callers with the same name share one in-flight future instead of racing
//! the cloud with duplicate submissions — CSI sidecars retry aggressively,
//! and without this two `CreateVolume` calls for the same name would each
//! create a volume.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use futures::future::{FutureExt, Shared};
use tokio::sync::Mutex;

use bsu_common::error::Result;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Coalesces concurrent callers keyed by fingerprint name, for operations
/// that return `T`.
pub struct Coalescer<T: Clone + Send + 'static> {
    inflight: Mutex<HashMap<String, Shared<BoxFuture<'static, Result<T>>>>>,
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `make` under the fingerprint `key`. If another caller is already
    /// running the same fingerprint, await its result instead of invoking
    /// `make` a second time.
    pub async fn run<F>(&self, key: String, make: F) -> Result<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        let shared = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let shared = make().shared();
                inflight.insert(key.clone(), shared.clone());
                shared
            }
        };

        let result = shared.await;
        // Best-effort cleanup: whoever observes completion first evicts the
        // entry so a later, distinct call for the same name starts fresh.
        self.inflight.lock().await.remove(&key);
        result
    }
}

impl<T: Clone + Send + 'static> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_callers_share_one_invocation() {
        let coalescer = Arc::new(Coalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("vol-a".to_string(), move || {
                        let calls = calls.clone();
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok(42)
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let coalescer = Coalescer::<u32>::new();
        let a = coalescer.run("a".to_string(), || Box::pin(async { Ok(1) })).await;
        let b = coalescer.run("b".to_string(), || Box::pin(async { Ok(2) })).await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_later_call_after_completion_runs_again() {
        let coalescer = Coalescer::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            coalescer
                .run("vol-a".to_string(), move || {
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
