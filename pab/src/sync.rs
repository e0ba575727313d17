/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cooperative cancellation and one-shot signalling for the workload threads.
//!
//! These are deliberately primitive: a coarse mutex plus condvar each. The
//! workloads touch them on cold paths only (backoff sleeps, steady-state
//! waits, shutdown), never on the allocation hot path.

use std::mem;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::time::Duration;

/// A hierarchical cancellation token.
///
/// Cancelling a token cancels all tokens derived from it with
/// [`Cancellation::child`], but never its parent. Workers check
/// [`Cancellation::is_cancelled`] at loop heads and use
/// [`Cancellation::sleep`] for blocking waits, which wake immediately on
/// cancellation.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

fn cancel_inner(inner: &Arc<Inner>) {
    let children = {
        let mut state = inner.state.lock().expect("cancellation lock");
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        inner.cond.notify_all();
        mem::take(&mut state.children)
    };
    // Outside the lock; child trees never point back at ancestors.
    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_inner(&child);
        }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when `self` is, but can also be cancelled
    /// independently without affecting `self`.
    pub fn child(&self) -> Self {
        let child = Cancellation::new();
        let mut state = self.inner.state.lock().expect("cancellation lock");
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Signal cancellation, waking all sleepers on this token and its
    /// descendants. Idempotent.
    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().expect("cancellation lock").cancelled
    }

    /// Sleep for `duration`, waking early if cancelled. Returns true if the
    /// full duration elapsed, false if the sleep was interrupted (or the
    /// token was already cancelled).
    pub fn sleep(&self, duration: Duration) -> bool {
        let state = self.inner.state.lock().expect("cancellation lock");
        let (state, _timeout) = self
            .inner
            .cond
            .wait_timeout_while(state, duration, |state| !state.cancelled)
            .expect("cancellation lock");
        !state.cancelled
    }

    /// Arm a timer that cancels this token after `duration`. The timer is
    /// disarmed implicitly if the token is cancelled first.
    pub fn cancel_after(&self, duration: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            if token.sleep(duration) {
                token.cancel();
            }
        });
    }
}

/// A one-shot broadcast event.
///
/// Starts unsignalled; [`OnceEvent::signal`] flips it permanently and wakes
/// all waiters, present and future. Signalling is release-ordered with
/// respect to the signaller's prior writes (the mutex provides the edge).
#[derive(Debug, Default)]
pub struct OnceEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl OnceEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event. Idempotent; all current and future waiters proceed.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock().expect("event lock");
        *signalled = true;
        self.cond.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock().expect("event lock")
    }

    /// Block until the event is signalled.
    pub fn wait(&self) {
        let signalled = self.signalled.lock().expect("event lock");
        let _guard = self
            .cond
            .wait_while(signalled, |signalled| !*signalled)
            .expect("event lock");
    }

    /// Block until the event is signalled or `duration` elapses. Returns
    /// whether the event is signalled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let signalled = self.signalled.lock().expect("event lock");
        let (signalled, _timeout) = self
            .cond
            .wait_timeout_while(signalled, duration, |signalled| !*signalled)
            .expect("event lock");
        *signalled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel(); // idempotent
    }

    #[test]
    fn sleep_runs_to_completion_when_not_cancelled() {
        let token = Cancellation::new();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_interrupts_sleep() {
        let token = Cancellation::new();
        let sleeper = token.clone();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(60)));
        // Give the sleeper a moment to block.
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn sleep_on_cancelled_token_returns_immediately() {
        let token = Cancellation::new();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(60)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_propagates_to_children_not_parents() {
        let parent = Cancellation::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_token_is_born_cancelled() {
        let parent = Cancellation::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn cancel_after_fires() {
        let token = Cancellation::new();
        token.cancel_after(Duration::from_millis(10));
        assert!(!token.sleep(Duration::from_secs(60)));
        assert!(token.is_cancelled());
    }

    #[test]
    fn event_wakes_waiter() {
        let event = Arc::new(OnceEvent::new());
        let waiter = Arc::clone(&event);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        event.signal();
        handle.join().unwrap();
        assert!(event.is_signalled());
    }

    #[test]
    fn event_wait_timeout() {
        let event = OnceEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.signal();
        assert!(event.wait_timeout(Duration::from_millis(10)));
        event.wait(); // signalled, returns immediately
    }
}
