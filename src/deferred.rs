//! A synchronous-when-resolved promise primitive (spec.md §5 "Promise
//! discipline"): once `settle` is called, every continuation registered so
//! far runs immediately, in registration order, before `settle` returns.
//! Continuations registered after settlement run immediately too. This
//! gives callers (and tests) a deterministic order without needing an
//! executor — the crate otherwise has none; the host's own event loop,
//! reached through `pump()`, is the only scheduler.

use std::cell::RefCell;
use std::rc::Rc;

type Continuation<T> = Box<dyn FnOnce(T)>;

struct Inner<T: Clone> {
    value: Option<T>,
    waiters: Vec<Continuation<T>>,
}

/// A single-shot settled value. Clone shares the same underlying state —
/// all clones observe the same settlement.
pub struct Deferred<T: Clone> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred { inner: self.inner.clone() }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new() -> Self {
        Deferred {
            inner: Rc::new(RefCell::new(Inner { value: None, waiters: Vec::new() })),
        }
    }

    /// Settle with `value`. A second call is a no-op (first settlement
    /// wins) — this is what gives idempotent double-`destroy()` and
    /// at-most-once `onClose` their observable guarantee.
    pub fn settle(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.value.is_some() {
                return;
            }
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for w in waiters {
            w(value.clone());
        }
    }

    /// Register a continuation. Runs immediately (synchronously) if already
    /// settled; otherwise queued for when `settle` is called.
    pub fn on_settle(&self, f: impl FnOnce(T) + 'static) {
        enum Next<T> {
            RunNow(T),
            Queued,
        }
        let next = {
            let mut inner = self.inner.borrow_mut();
            match inner.value.clone() {
                Some(v) => Next::RunNow(v),
                None => {
                    inner.waiters.push(Box::new(f));
                    Next::Queued
                }
            }
        };
        if let Next::RunNow(v) = next {
            f(v);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    pub fn value(&self) -> Option<T> {
        self.inner.borrow().value.clone()
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn settle_runs_registered_continuations_in_order() {
        let d: Deferred<i32> = Deferred::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        d.on_settle(move |v| o1.borrow_mut().push(("a", v)));
        let o2 = order.clone();
        d.on_settle(move |v| o2.borrow_mut().push(("b", v)));
        d.settle(42);
        assert_eq!(*order.borrow(), vec![("a", 42), ("b", 42)]);
    }

    #[test]
    fn settle_twice_keeps_first_value() {
        let d: Deferred<i32> = Deferred::new();
        d.settle(1);
        d.settle(2);
        assert_eq!(d.value(), Some(1));
    }

    #[test]
    fn on_settle_after_settle_runs_immediately() {
        let d: Deferred<i32> = Deferred::new();
        d.settle(7);
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        d.on_settle(move |v| seen2.set(v));
        assert_eq!(seen.get(), 7);
    }
}
