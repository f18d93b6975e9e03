// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded parallel iteration for `for parallel(N, pacing)`.
//!
//! Workers share a semaphore capped at `N`; worker `i` additionally waits
//! `i * pacing` before starting when pacing is configured. Results come back
//! in input order regardless of completion order, and failed iterations are
//! reported per slot rather than aborting the whole loop.

use mlld_core::{MlldError, StructuredValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::cancel::CancellationToken;

/// Fallback worker cap when neither the directive nor
/// `MLLD_PARALLEL_LIMIT` supplies one.
pub const DEFAULT_PARALLEL_LIMIT: usize = 4;

/// Concurrency settings for one parallel loop.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Maximum concurrent workers.
    pub cap: usize,
    /// Delay applied to each successive worker start.
    pub pacing: Option<Duration>,
    /// Cooperative cancellation; pending workers are drained.
    pub cancel: Option<crate::cancel::CancellationToken>,
}

impl ParallelOptions {
    /// Options with an explicit cap and no pacing.
    #[must_use]
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            pacing: None,
            cancel: None,
        }
    }

    /// Cap from `MLLD_PARALLEL_LIMIT`, falling back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let cap = std::env::var("MLLD_PARALLEL_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PARALLEL_LIMIT);
        Self::with_cap(cap)
    }

    /// Set pacing (builder).
    #[must_use]
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Run `body` for indices `0..count` with bounded concurrency.
///
/// The returned vector has one slot per input index, in input order. The
/// caller turns `Err` slots into error markers and `@mx.errors` entries.
pub async fn parallel_map<F, Fut>(
    count: usize,
    options: &ParallelOptions,
    body: F,
) -> Vec<Result<StructuredValue, MlldError>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<StructuredValue, MlldError>>,
{
    let semaphore = Arc::new(Semaphore::new(options.cap));
    debug!(target: "mlld.pipeline", count, cap = options.cap, "parallel fan-out");

    let tasks = (0..count).map(|index| {
        let semaphore = Arc::clone(&semaphore);
        let pacing = options.pacing;
        let cancel = options.cancel.clone();
        let fut = &body;
        async move {
            if let Some(pacing) = pacing {
                tokio::time::sleep(pacing * index as u32).await;
            }
            let _permit = semaphore
                .acquire()
                .await
                .expect("parallel semaphore closed");
            // A worker that has not started yet drains instead of running.
            if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(MlldError::Cancelled);
            }
            fut(index).await
        }
    });

    futures::future::join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        let options = ParallelOptions::with_cap(3);
        let results = parallel_map(5, &options, |i| async move {
            // Later items finish first.
            tokio::time::sleep(Duration::from_millis(20 - 3 * i as u64)).await;
            Ok(StructuredValue::text(format!("item-{i}")))
        })
        .await;
        let texts: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().as_text())
            .collect();
        assert_eq!(texts, vec!["item-0", "item-1", "item-2", "item-3", "item-4"]);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let options = ParallelOptions::with_cap(2);
        let results = parallel_map(6, &options, |_i| {
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(StructuredValue::text("done"))
            }
        })
        .await;
        assert_eq!(results.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_stay_in_their_slot() {
        let options = ParallelOptions::with_cap(2);
        let results = parallel_map(3, &options, |i| async move {
            if i == 1 {
                Err(MlldError::execution("iteration failed", Some(1)))
            } else {
                Ok(StructuredValue::text(i.to_string()))
            }
        })
        .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn cancelled_token_drains_pending_workers() {
        let token = CancellationToken::new();
        token.cancel();
        let mut options = ParallelOptions::with_cap(2);
        options.cancel = Some(token);
        let results = parallel_map(3, &options, |i| async move {
            Ok(StructuredValue::text(i.to_string()))
        })
        .await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(MlldError::Cancelled))));
    }

    #[tokio::test]
    async fn zero_cap_is_clamped_to_one() {
        let options = ParallelOptions::with_cap(0);
        assert_eq!(options.cap, 1);
        let results =
            parallel_map(2, &options, |i| async move { Ok(StructuredValue::text(i.to_string())) })
                .await;
        assert_eq!(results.len(), 2);
    }
}
