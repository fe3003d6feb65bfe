//! Single slot handoff between the kernel thread and the handler thread.
//!
//! The kernel thread sends one item at a time, the handler thread receives it. A sender blocks
//! while the slot is occupied *and* while the previously received item is still being processed,
//! so at most one item is ever in flight. Processing ends when the `Delivery` guard returned by
//! `receive` is dropped.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::{error, fmt};


/// Error returned when sending to a closed mailbox. Carries the item that could not be sent.
pub struct Closed<T>(pub T);

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sending to a closed mailbox")
    }
}

impl<T> error::Error for Closed<T> {}


#[derive(Debug)]
struct Slot<T> {
    item: Option<T>,
    in_flight: bool,
    closed: bool,
}

impl<T> Slot<T> {
    fn is_free(&self) -> bool {
        self.item.is_none() && !self.in_flight
    }
}

/// Single slot mailbox.
///
/// Safe to send from multiple threads, sends are serialized by the internal mutex.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    filled: Condvar,
    freed: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot { item: None, in_flight: false, closed: false }),
            filled: Condvar::new(),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an item into the mailbox.
    ///
    /// Blocks until the slot is free, i.e. the previous item was received and its `Delivery` was
    /// dropped. Returns the item back if the mailbox is (or gets) closed while waiting.
    pub fn send(&self, item: T) -> Result<(), Closed<T>> {
        let mut slot = self.lock();
        while !slot.closed && !slot.is_free() {
            slot = self.freed.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        if slot.closed {
            return Err(Closed(item));
        }
        slot.item = Some(item);
        self.filled.notify_one();
        Ok(())
    }

    /// Take the next item out of the mailbox.
    ///
    /// Blocks until an item is available. Returns `None` once the mailbox is closed and no item
    /// is left. The slot stays occupied until the returned `Delivery` is dropped.
    pub fn receive(&self) -> Option<Delivery<'_, T>> {
        let mut slot = self.lock();
        loop {
            if let Some(item) = slot.item.take() {
                slot.in_flight = true;
                return Some(Delivery { mailbox: self, item: Some(item) });
            }
            if slot.closed {
                return None;
            }
            slot = self.filled.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Close the mailbox. Pending and future sends fail, an item already in the slot can still
    /// be received.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        self.filled.notify_all();
        self.freed.notify_all();
    }

    /// Whether the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn release(&self) {
        let mut slot = self.lock();
        slot.in_flight = false;
        self.freed.notify_one();
    }
}


/// An item received from a mailbox. The mailbox slot is freed when this guard is dropped.
#[derive(Debug)]
pub struct Delivery<'a, T> {
    mailbox: &'a Mailbox<T>,
    item: Option<T>,
}

impl<'a, T> Delivery<'a, T> {
    /// Returns the received item, unless it was already taken.
    pub fn get(&self) -> Option<&T> {
        self.item.as_ref()
    }

    /// Take the received item out of the delivery. The slot stays occupied until the delivery
    /// itself is dropped.
    pub fn take(&mut self) -> Option<T> {
        self.item.take()
    }
}

impl<'a, T> Drop for Delivery<'a, T> {
    fn drop(&mut self) {
        // The item goes away before the slot is freed
        drop(self.item.take());
        self.mailbox.release();
    }
}
