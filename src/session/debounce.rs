//! Coalescing of rapid triggers into one delayed call
//!
//! The first trigger arms a single-shot timer; triggers that arrive before it
//! fires only replace the pending argument. When the timer fires, the action
//! runs once with whatever argument is in the slot at that moment. A run that
//! is already in progress is never cancelled by a later trigger.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::common::emitter::lock;

type Action<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<A> {
    pending: bool,
    latest: Option<A>,
    timer: Option<JoinHandle<()>>,
}

/// Debounced async action taking the latest argument
pub struct Debouncer<A> {
    delay: Duration,
    slot: Arc<Mutex<Slot<A>>>,
    action: Action<A>,
}

impl<A: Send + 'static> Debouncer<A> {
    pub fn new<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            delay,
            slot: Arc::new(Mutex::new(Slot {
                pending: false,
                latest: None,
                timer: None,
            })),
            action: Arc::new(move |arg| action(arg).boxed()),
        }
    }

    /// Schedule the action with `arg`, replacing any pending argument
    pub fn trigger(&self, arg: A) {
        self.trigger_with(|_| arg);
    }

    /// Schedule the action with an argument derived from the pending one
    pub fn trigger_with<F>(&self, derive: F)
    where
        F: FnOnce(Option<A>) -> A,
    {
        let mut slot = lock(&self.slot);
        let previous = slot.latest.take();
        slot.latest = Some(derive(previous));
        if slot.pending {
            return;
        }
        slot.pending = true;

        let shared = self.slot.clone();
        let action = self.action.clone();
        let delay = self.delay;
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let arg = {
                let mut slot = lock(&shared);
                slot.pending = false;
                slot.timer = None;
                slot.latest.take()
            };
            if let Some(arg) = arg {
                action(arg).await;
            }
        }));
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending
    }

    /// Drop the pending call, if any
    pub fn cancel(&self) {
        let mut slot = lock(&self.slot);
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.pending = false;
        slot.latest = None;
    }
}

impl<A> Drop for Debouncer<A> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.slot).timer.take() {
            timer.abort();
        }
    }
}
