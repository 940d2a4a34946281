use futures::{
    stream::{FusedStream, Stream},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

/// Best-effort fan-out bus. Each subscriber owns a bounded queue;
/// publication never blocks and drops the oldest pending item when a
/// subscriber's queue is full. Per-subscriber ordering is preserved.
#[derive(Debug)]
pub struct Bus<T>
where
    T: Clone + Send + 'static,
{
    capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberInner<T>>>>,
}
impl<T> Bus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");

        let subscribers = Vec::new();
        let subscribers = Mutex::new(subscribers);

        Self {
            capacity,
            subscribers,
        }
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        let inner = SubscriberInner::new(self.capacity);
        let inner = Arc::new(inner);

        self.subscribers.lock().push(Arc::downgrade(&inner));

        Subscriber { inner }
    }

    pub fn publish(
        &self,
        item: T,
    ) {
        self.subscribers.lock().retain(|subscriber| {
            let subscriber = match subscriber.upgrade() {
                Some(subscriber) => subscriber,
                None => return false,
            };
            subscriber.push(item.clone());
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|subscriber| subscriber.strong_count() > 0)
            .count()
    }
}

#[derive(Debug)]
struct SubscriberInner<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    dropped: AtomicUsize,
    waker: AtomicWaker,
}
impl<T> SubscriberInner<T> {
    fn new(capacity: usize) -> Self {
        let queue = VecDeque::with_capacity(capacity);
        let queue = Mutex::new(queue);

        Self {
            capacity,
            queue,
            dropped: AtomicUsize::new(0),
            waker: AtomicWaker::new(),
        }
    }

    fn push(
        &self,
        item: T,
    ) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        drop(queue);

        self.waker.wake();
    }
}

#[derive(Debug)]
pub struct Subscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}
impl<T> Subscriber<T> {
    /// Number of items lost to queue overflow since subscription.
    pub fn dropped_count(&self) -> usize {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
impl<T> Stream for Subscriber<T> {
    type Item = T;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let self_ = self.get_mut();

        if let Some(item) = self_.inner.queue.lock().pop_front() {
            return Poll::Ready(Some(item));
        }

        self_.inner.waker.register(cx.waker());

        match self_.inner.queue.lock().pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Pending,
        }
    }
}
impl<T> FusedStream for Subscriber<T> {
    fn is_terminated(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::Bus;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_in_order() {
        let bus = Bus::<usize>::new(8);
        let mut subscriber = bus.subscribe();

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);

        assert_eq!(subscriber.next().await, Some(1));
        assert_eq!(subscriber.next().await, Some(2));
        assert_eq!(subscriber.next().await, Some(3));
    }

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let bus = Bus::<usize>::new(2);
        let mut subscriber = bus.subscribe();

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);

        assert_eq!(subscriber.next().await, Some(2));
        assert_eq!(subscriber.next().await, Some(3));
        assert_eq!(subscriber.dropped_count(), 1);
    }

    #[test]
    fn forgets_dropped_subscribers() {
        let bus = Bus::<usize>::new(2);
        let subscriber = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(subscriber);
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
