use futures::future::FusedFuture;
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
};

/// One-shot broadcast flag. The sending half signals once; every receiver
/// (current and future) resolves. Receivers are cheap to clone and usable
/// inside `select!` (fused).
#[derive(Debug)]
struct Inner {
    signaled: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}
impl Inner {
    fn new() -> Self {
        let signaled = AtomicBool::new(false);

        let wakers = Vec::new();
        let wakers = Mutex::new(wakers);

        Self { signaled, wakers }
    }

    fn signal(&self) {
        if self.signaled.swap(true, Ordering::SeqCst) {
            return;
        }

        self.wakers.lock().drain(..).for_each(|waker| waker.wake());
    }
}

#[derive(Debug)]
pub struct Sender {
    inner: Arc<Inner>,
}
impl Sender {
    pub fn new() -> Self {
        let inner = Inner::new();
        let inner = Arc::new(inner);

        Self { inner }
    }

    pub fn receiver(&self) -> Receiver {
        Receiver {
            inner: self.inner.clone(),
            completed: false,
        }
    }

    pub fn signal(&self) {
        self.inner.signal();
    }
}

#[derive(Debug)]
pub struct Receiver {
    inner: Arc<Inner>,
    completed: bool,
}
impl Clone for Receiver {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            completed: false,
        }
    }
}
impl Future for Receiver {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let self_ = self.get_mut();

        if self_.inner.signaled.load(Ordering::SeqCst) {
            self_.completed = true;
            return Poll::Ready(());
        }

        let mut wakers = self_.inner.wakers.lock();
        // the flag may have been signaled between the check and the lock
        if self_.inner.signaled.load(Ordering::SeqCst) {
            self_.completed = true;
            return Poll::Ready(());
        }
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}
impl FusedFuture for Receiver {
    fn is_terminated(&self) -> bool {
        self.completed
    }
}

pub fn pair() -> (Sender, Receiver) {
    let sender = Sender::new();
    let receiver = sender.receiver();
    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::pair;
    use futures::FutureExt;

    #[test]
    fn pending_until_signaled() {
        let (sender, receiver) = pair();
        assert!(receiver.now_or_never().is_none());

        let receiver = sender.receiver();
        sender.signal();
        assert!(receiver.now_or_never().is_some());
    }

    #[test]
    fn late_receiver_resolves() {
        let (sender, _receiver) = pair();
        sender.signal();

        let late = sender.receiver();
        assert!(late.now_or_never().is_some());
    }

    #[test]
    fn double_signal_is_noop() {
        let (sender, receiver) = pair();
        sender.signal();
        sender.signal();
        assert!(receiver.now_or_never().is_some());
    }
}
