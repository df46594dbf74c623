//! One-to-many change notification primitive.
//!
//! A [`Dispatcher`] owns a value and an ordered listener set. It does not
//! call listeners itself: listeners are plain data (handles into the
//! runtime), and the owner delivers values after asking the dispatcher what
//! changed. This keeps notification re-entrant against a single `&mut`
//! runtime without interior mutability.
//!
//! # Invariants
//!
//! 1. Listeners are notified in subscription order.
//! 2. [`Dispatcher::listen`] reports a newly added listener so the owner can
//!    deliver the current value immediately.
//! 3. Updating to a [`SameValue`]-equal value is a no-op.
//! 4. An update during an ongoing dispatch is coalesced into one more pass
//!    with the latest value once the current pass finishes.

use std::hash::Hash;

use indexmap::IndexSet;

use crate::value::SameValue;

#[derive(Debug)]
pub struct Dispatcher<T, L> {
    value: T,
    listeners: IndexSet<L>,
    dispatching: bool,
    pending_dispatch: bool,
}

impl<T: Default, L: Hash + Eq> Default for Dispatcher<T, L> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, L: Hash + Eq> Dispatcher<T, L> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            listeners: IndexSet::new(),
            dispatching: false,
            pending_dispatch: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Subscribe. Returns `true` when the listener was not yet subscribed;
    /// the caller must then deliver [`Dispatcher::value`] to it.
    pub fn listen(&mut self, listener: L) -> bool {
        self.listeners.insert(listener)
    }

    /// Unsubscribe. No-op when absent.
    pub fn unlisten(&mut self, listener: &L) -> bool {
        self.listeners.shift_remove(listener)
    }

    pub fn is_listening(&self, listener: &L) -> bool {
        self.listeners.contains(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Replace the value without comparing. Returns the previous value.
    pub fn replace(&mut self, value: T) -> T {
        std::mem::replace(&mut self.value, value)
    }

    /// Drop all listeners without notifying them.
    pub fn clear(&mut self) {
        self.listeners.clear();
        self.pending_dispatch = false;
    }

    /// Enter a dispatch pass. Returns `false` if a pass is already running;
    /// the running pass will then repeat once with the latest value.
    pub fn begin_dispatch(&mut self) -> bool {
        if self.dispatching {
            self.pending_dispatch = true;
            return false;
        }
        self.dispatching = true;
        true
    }

    /// Leave a dispatch pass. Returns `true` if another pass is required.
    pub fn end_dispatch(&mut self) -> bool {
        if self.pending_dispatch {
            self.pending_dispatch = false;
            return true;
        }
        self.dispatching = false;
        false
    }
}

impl<T: SameValue, L: Hash + Eq> Dispatcher<T, L> {
    /// Store `value` unless it is the same as the current one. Returns
    /// whether listeners must be notified.
    pub fn update(&mut self, value: T) -> bool {
        if self.value.same(&value) {
            return false;
        }
        self.value = value;
        true
    }
}

impl<T: Clone, L: Hash + Eq + Clone> Dispatcher<T, L> {
    /// Snapshot of the current value and listeners for delivery. Taking a
    /// copy lets listeners subscribe/unsubscribe while being notified.
    pub fn snapshot(&self) -> (T, Vec<L>) {
        (self.value.clone(), self.listeners.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn listen_reports_new_listeners_once() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::default();
        assert!(dispatcher.listen(1));
        assert!(!dispatcher.listen(1));
        assert_eq!(dispatcher.listener_count(), 1);
    }

    #[test]
    fn unlisten_missing_is_noop() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::default();
        assert!(!dispatcher.unlisten(&9));
        dispatcher.listen(9);
        assert!(dispatcher.unlisten(&9));
        assert!(!dispatcher.has_listeners());
    }

    #[test]
    fn listeners_keep_subscription_order() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::default();
        for l in [3, 1, 2] {
            dispatcher.listen(l);
        }
        dispatcher.unlisten(&1);
        dispatcher.listen(1);
        let (_, listeners) = dispatcher.snapshot();
        assert_eq!(listeners, vec![3, 2, 1]);
    }

    #[test]
    fn clear_drops_listeners_and_keeps_value() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::new(Value::from(1));
        dispatcher.listen(1);
        dispatcher.listen(2);
        dispatcher.clear();
        assert!(!dispatcher.has_listeners());
        assert_eq!(dispatcher.value(), &Value::from(1));
    }

    #[test]
    fn update_ignores_same_value() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::new(Value::from(1));
        assert!(!dispatcher.update(Value::from(1)));
        assert!(dispatcher.update(Value::from(2)));
        assert_eq!(dispatcher.value(), &Value::from(2));
    }

    #[test]
    fn nested_dispatch_is_coalesced() {
        let mut dispatcher: Dispatcher<Value, u32> = Dispatcher::default();
        assert!(dispatcher.begin_dispatch());
        assert!(!dispatcher.begin_dispatch());
        assert!(!dispatcher.begin_dispatch());
        // one extra pass, not two
        assert!(dispatcher.end_dispatch());
        assert!(!dispatcher.end_dispatch());
        assert!(dispatcher.begin_dispatch());
    }
}
