//! Merging of several producer queues into one.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::concurrency::cancel::CancelRx;
use crate::concurrency::queue::BoundedQueue;
use crate::error::{ConveyorError, ConveyorResult};

/// Decrements the number of open upstreams when a relay ends, closing the output on the last one.
struct OpenUpstreams<T> {
    open: Arc<AtomicUsize>,
    output: BoundedQueue<T>,
}

impl<T> Drop for OpenUpstreams<T> {
    fn drop(&mut self) {
        if self.open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output.close();
        }
    }
}

/// Relays items from many upstream queues into a single output queue.
///
/// One relay task runs per upstream. The output is closed exactly when every upstream has been
/// closed and drained, regardless of the order in which they close. Items are moved, never
/// copied, so the output carries exactly the sum of what the upstreams produced. Ordering across
/// upstreams is not preserved.
#[derive(Debug)]
pub struct FanIn<T> {
    output: BoundedQueue<T>,
    relays: Vec<JoinHandle<ConveyorResult<usize>>>,
}

impl<T> FanIn<T>
where
    T: Send + 'static,
{
    /// Starts relaying `upstreams` into a new output queue of `capacity` items.
    ///
    /// Must be called from within a tokio runtime. With no upstreams the output is closed
    /// immediately.
    pub fn merge(upstreams: Vec<BoundedQueue<T>>, capacity: usize, cancel_rx: CancelRx) -> Self {
        let output = BoundedQueue::new(capacity, cancel_rx);
        if upstreams.is_empty() {
            output.close();
            return Self {
                output,
                relays: Vec::new(),
            };
        }

        let open = Arc::new(AtomicUsize::new(upstreams.len()));
        let relays = upstreams
            .into_iter()
            .enumerate()
            .map(|(upstream_index, upstream)| {
                let guard = OpenUpstreams {
                    open: open.clone(),
                    output: output.clone(),
                };

                tokio::spawn(relay(upstream_index, upstream, guard))
            })
            .collect();

        Self { output, relays }
    }

    /// Returns a handle to the merged queue.
    pub fn output(&self) -> BoundedQueue<T> {
        self.output.clone()
    }

    /// Waits for every relay to finish and returns the number of relayed items.
    ///
    /// Relay failures, for example cancellation, are aggregated into a single error.
    pub async fn wait(self) -> ConveyorResult<usize> {
        let mut relayed = 0;
        let mut errors: Vec<ConveyorError> = Vec::new();

        for relay in self.relays {
            match relay.await {
                Ok(Ok(count)) => relayed += count,
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => errors.push(join_err.into()),
            }
        }

        if errors.is_empty() {
            Ok(relayed)
        } else {
            Err(errors.into())
        }
    }
}

async fn relay<T>(
    upstream_index: usize,
    upstream: BoundedQueue<T>,
    guard: OpenUpstreams<T>,
) -> ConveyorResult<usize> {
    let mut relayed = 0;

    while let Some(item) = upstream.get().await? {
        guard.output.put(item).await?;
        relayed += 1;
    }

    debug!(upstream_index, relayed, "fan-in upstream closed");

    Ok(relayed)
}
