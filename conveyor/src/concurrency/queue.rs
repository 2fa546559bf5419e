//! Fixed-capacity blocking queue connecting pipeline stages.
//!
//! [`BoundedQueue`] is the only channel between stages. Producers block while the queue is full,
//! which is how backpressure travels from a slow stage back to the task source. Consumers block
//! while it is empty until either an item arrives or the queue is closed and drained.
//!
//! Every blocking call also observes the pipeline cancellation token and fails with
//! [`ErrorKind::Cancelled`] once it fires.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::bail;
use crate::concurrency::cancel::CancelRx;
use crate::error::{ConveyorResult, ErrorKind};

/// Error returned by [`BoundedQueue::try_put`], handing the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPutError<T> {
    /// The queue has no free slot right now.
    Full(T),
    /// The queue was closed.
    Closed(T),
    /// Cancellation was requested.
    Cancelled(T),
}

impl<T> TryPutError<T> {
    /// Returns the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            TryPutError::Full(item) | TryPutError::Closed(item) | TryPutError::Cancelled(item) => {
                item
            }
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Total number of items ever enqueued.
    pushed: u64,
    /// Total number of items ever taken out.
    popped: u64,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    /// Woken on every state change: item added or removed, queue closed.
    changed: Notify,
    capacity: usize,
}

impl<T> QueueShared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // The lock is never held across user code, a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items that may sit in the buffer at once.
    ///
    /// A zero-capacity queue still parks one item while its producer waits for the hand-off.
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }
}

/// A multi-producer multi-consumer blocking queue with a fixed capacity.
///
/// Cloning yields another handle to the same queue. With a single producer and a single consumer
/// items come out in insertion order. A capacity of zero turns the queue into a rendezvous point:
/// [`BoundedQueue::put`] returns only after a consumer took the item.
pub struct BoundedQueue<T> {
    shared: Arc<QueueShared<T>>,
    cancel_rx: CancelRx,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty open queue holding at most `capacity` items.
    pub fn new(capacity: usize, cancel_rx: CancelRx) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    // Grows on demand, the capacity may be far larger than what is ever buffered.
                    items: VecDeque::new(),
                    closed: false,
                    pushed: 0,
                    popped: 0,
                }),
                changed: Notify::new(),
                capacity,
            }),
            cancel_rx,
        }
    }

    /// Appends `item`, waiting while the queue is full.
    ///
    /// Fails with [`ErrorKind::QueueClosed`] if the queue is closed before the item could be
    /// enqueued and with [`ErrorKind::Cancelled`] if cancellation fires first. For a zero-capacity
    /// queue the item is withdrawn again when cancellation fires before a consumer took it.
    pub async fn put(&self, item: T) -> ConveyorResult<()> {
        let ticket = loop {
            let mut notified = pin!(self.shared.changed.notified());
            notified.as_mut().enable();

            if self.cancel_rx.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Put was cancelled");
            }

            {
                let mut state = self.shared.lock();
                if state.closed {
                    bail!(ErrorKind::QueueClosed, "Queue is closed");
                }

                if state.items.len() < self.shared.slots() {
                    state.items.push_back(item);
                    state.pushed += 1;
                    let ticket = state.pushed;
                    drop(state);

                    self.shared.changed.notify_waiters();
                    break ticket;
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel_rx.wait_for_cancel() => {
                    bail!(ErrorKind::Cancelled, "Put was cancelled");
                }
            }
        };

        if self.shared.capacity == 0 {
            self.wait_for_hand_off(ticket).await?;
        }

        Ok(())
    }

    /// Waits until the item with `ticket` was taken by a consumer.
    async fn wait_for_hand_off(&self, ticket: u64) -> ConveyorResult<()> {
        loop {
            let mut notified = pin!(self.shared.changed.notified());
            notified.as_mut().enable();

            if self.shared.lock().popped >= ticket {
                return Ok(());
            }

            if self.cancel_rx.is_cancelled() {
                let mut state = self.shared.lock();
                if state.popped >= ticket {
                    return Ok(());
                }

                // At most one item is parked in a zero-capacity queue and it is ours.
                state.items.pop_back();
                state.pushed -= 1;
                drop(state);

                self.shared.changed.notify_waiters();
                bail!(ErrorKind::Cancelled, "Put was cancelled before hand-off");
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel_rx.wait_for_cancel() => {}
            }
        }
    }

    /// Appends `item` without waiting.
    ///
    /// A zero-capacity queue only accepts items through [`BoundedQueue::put`], so this always
    /// reports [`TryPutError::Full`] for it.
    pub fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        if self.cancel_rx.is_cancelled() {
            return Err(TryPutError::Cancelled(item));
        }

        let mut state = self.shared.lock();
        if state.closed {
            return Err(TryPutError::Closed(item));
        }

        if self.shared.capacity == 0 || state.items.len() >= self.shared.capacity {
            return Err(TryPutError::Full(item));
        }

        state.items.push_back(item);
        state.pushed += 1;
        drop(state);

        self.shared.changed.notify_waiters();

        Ok(())
    }

    /// Removes the next item, waiting while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed and every buffered item was handed out.
    /// Cancellation is checked before buffered items are handed out, so no item is returned
    /// after the token fired.
    pub async fn get(&self) -> ConveyorResult<Option<T>> {
        loop {
            let mut notified = pin!(self.shared.changed.notified());
            notified.as_mut().enable();

            if self.cancel_rx.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Get was cancelled");
            }

            {
                let mut state = self.shared.lock();
                if let Some(item) = state.items.pop_front() {
                    state.popped += 1;
                    drop(state);

                    self.shared.changed.notify_waiters();
                    return Ok(Some(item));
                }

                if state.closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel_rx.wait_for_cancel() => {
                    bail!(ErrorKind::Cancelled, "Get was cancelled");
                }
            }
        }
    }

    /// Marks the queue as closed. Calling it again has no effect.
    ///
    /// Items already buffered stay available to consumers.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.shared.changed.notify_waiters();
    }

    /// Removes and returns every buffered item without waiting.
    ///
    /// Ignores cancellation, this is how abandoned items are accounted for during teardown.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.shared.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        state.popped += items.len() as u64;
        drop(state);

        if !items.is_empty() {
            self.shared.changed.notify_waiters();
        }

        items
    }

    /// Waits until the queue is closed and empty.
    pub async fn wait_drained(&self) -> ConveyorResult<()> {
        loop {
            let mut notified = pin!(self.shared.changed.notified());
            notified.as_mut().enable();

            if self.cancel_rx.is_cancelled() {
                bail!(ErrorKind::Cancelled, "Wait for drain was cancelled");
            }

            {
                let state = self.shared.lock();
                if state.closed && state.items.is_empty() {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel_rx.wait_for_cancel() => {
                    bail!(ErrorKind::Cancelled, "Wait for drain was cancelled");
                }
            }
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            cancel_rx: self.cancel_rx.clone(),
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.shared.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::cancel::create_cancel_channel;

    #[tokio::test]
    async fn single_producer_single_consumer_is_fifo() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(4, cancel_rx);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.put(i).await.unwrap();
                }
                queue.close();
            })
        };

        let mut received = Vec::new();
        while let Some(item) = queue.get().await.unwrap() {
            received.push(item);
        }
        producer.await.unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn huge_capacity_allocates_lazily() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::<u8>::new(usize::MAX, cancel_rx);

        queue.put(1).await.unwrap();
        queue.try_put(2).unwrap();

        assert_eq!(queue.capacity(), usize::MAX);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn put_blocks_while_full() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(1, cancel_rx);
        queue.put(1).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.put(2)).await;
        assert!(blocked.is_err());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.unwrap(), Some(1));
        queue.put(2).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn close_lets_consumers_drain_remaining_items() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(3, cancel_rx);
        queue.put("a").await.unwrap();
        queue.put("b").await.unwrap();
        queue.close();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.get().await.unwrap(), Some("a"));
        assert_eq!(queue.get().await.unwrap(), Some("b"));
        assert_eq!(queue.get().await.unwrap(), None);
        assert_eq!(queue.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_after_close_fails() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(3, cancel_rx);
        queue.close();

        let err = queue.put(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
        assert!(matches!(queue.try_put(1), Err(TryPutError::Closed(1))));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::<u32>::new(1, cancel_rx);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(1, cancel_rx);
        queue.put(1).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(2).await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::QueueClosed);
    }

    #[tokio::test]
    async fn cancellation_wakes_blocked_operations() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::<u32>::new(1, cancel_rx);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        cancel_tx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(queue.put(1).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn get_observes_cancellation_before_buffered_items() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(2, cancel_rx);
        queue.put(1).await.unwrap();

        cancel_tx.cancel();

        assert!(queue.get().await.unwrap_err().is_cancelled());
        assert_eq!(queue.drain(), vec![1]);
    }

    #[tokio::test]
    async fn zero_capacity_put_waits_for_consumer() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(0, cancel_rx);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(7).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.get().await.unwrap(), Some(7));
        producer.await.unwrap().unwrap();
        assert!(matches!(queue.try_put(8), Err(TryPutError::Full(8))));
    }

    #[tokio::test]
    async fn zero_capacity_put_withdraws_item_on_cancel() {
        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(0, cancel_rx);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(7).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.cancel();

        let result = producer.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn multiple_producers_and_consumers_lose_nothing() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(2, cancel_rx);

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        queue.put(p * 1000 + i).await.unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut items = Vec::new();
                    while let Some(item) = queue.get().await.unwrap() {
                        items.push(item);
                    }
                    items
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();

        let mut expected: Vec<_> = (0..4)
            .flat_map(|p| (0..50).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn wait_drained_completes_after_close_and_consumption() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let queue = BoundedQueue::new(2, cancel_rx);
        queue.put(1).await.unwrap();
        queue.close();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_drained().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(queue.get().await.unwrap(), Some(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
