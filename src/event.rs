//! A small, synchronous observer registry.
//!
//! Replaces the `sigslot` signal/slot wiring of the original C++
//! implementation with something that fits a single-threaded
//! cooperative event loop: subscribing stores a closure, `emit` calls
//! every still-subscribed closure in order and then clears the list,
//! since every event this crate fires (`names_collated`, `auth_ready`,
//! `authenticated`) is a one-time transition a `Route`/`XMLStream`
//! passes through exactly once.

use std::cell::RefCell;

type Subscribers<A> = RefCell<Vec<Box<dyn FnMut(A)>>>;

/// A one-shot-per-subscriber event emitter.
pub struct EventEmitter<A> {
    subscribers: Subscribers<A>,
}

impl<A> Default for EventEmitter<A> {
    fn default() -> Self {
        EventEmitter {
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

impl<A: Clone> EventEmitter<A> {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure to be called the next time this event
    /// fires. Subscriptions do not persist across an `emit` call.
    pub fn subscribe(&self, f: impl FnMut(A) + 'static) {
        self.subscribers.borrow_mut().push(Box::new(f));
    }

    /// Whether anything is currently subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Fire the event: every subscriber registered so far is called
    /// once, in subscription order, and the subscriber list is then
    /// cleared.
    pub fn emit(&self, arg: A) {
        let subs = self.subscribers.take();
        for mut f in subs {
            f(arg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn subscribers_fire_in_order_and_once() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log1 = log.clone();
        emitter.subscribe(move |v| log1.borrow_mut().push(("a", v)));
        let log2 = log.clone();
        emitter.subscribe(move |v| log2.borrow_mut().push(("b", v)));

        emitter.emit(1);
        assert_eq!(*log.borrow(), vec![("a", 1), ("b", 1)]);

        // Subscriptions were consumed; firing again calls nobody.
        emitter.emit(2);
        assert_eq!(*log.borrow(), vec![("a", 1), ("b", 1)]);
    }

    #[test]
    fn late_subscribe_after_emit_is_just_a_new_registration() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        emitter.emit(1);

        let seen = Rc::new(Cell::new(None));
        let seen2 = seen.clone();
        emitter.subscribe(move |v| seen2.set(Some(v)));
        emitter.emit(2);
        assert_eq!(seen.get(), Some(2));
    }
}
