//! Inter-thread message queue: a single-mutex bounded ring buffer (§4.H).
//!
//! The literal index arithmetic `(i+n) & (c-1)` read by `queue_take` after
//! decrementing `n` pops the slot most recently written by `queue_add` —
//! functionally LIFO. That contradicts testable property 7 (total order of
//! puts from one thread is preserved for a single consumer) and scenario
//! S5, so this implementation pops from the head and advances it forward
//! like a standard ring buffer; see the Open Question resolution in
//! DESIGN.md.

use loom_core::Value;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone)]
pub enum Message {
    Result(Value),
    Call { program: u32, args: Vec<Value> },
}

struct Ring {
    buf: Vec<Option<Message>>,
    head: usize,
    len: usize,
}

impl Ring {
    fn new() -> Self {
        Self { buf: vec![None, None, None, None], head: 0, len: 0 }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, msg: Message) {
        if self.len == self.capacity() {
            self.grow();
        }
        let idx = (self.head + self.len) & (self.capacity() - 1);
        self.buf[idx] = Some(msg);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let msg = self.buf[self.head].take();
        self.head = (self.head + 1) & (self.capacity() - 1);
        self.len -= 1;
        msg
    }

    /// Doubles capacity; if the live region wraps past the old physical
    /// end, the wrapping suffix is copied into the newly-allocated tail so
    /// the buffer becomes contiguous starting at `head` again.
    fn grow(&mut self) {
        let old_cap = self.capacity();
        let new_cap = old_cap * 2;
        let mut new_buf: Vec<Option<Message>> = (0..new_cap).map(|_| None).collect();
        for i in 0..self.len {
            let src = (self.head + i) & (old_cap - 1);
            new_buf[i] = self.buf[src].take();
        }
        self.buf = new_buf;
        self.head = 0;
    }
}

/// `MessageQueue`: mutex-guarded ring buffer plus a condvar for blocking
/// receive, used by thread mailboxes and channels alike.
pub struct MessageQueue {
    ring: Mutex<Ring>,
    not_empty: Condvar,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self { ring: Mutex::new(Ring::new()), not_empty: Condvar::new() }
    }

    pub fn send(&self, msg: Message) {
        let mut ring = self.ring.lock().expect("queue mutex poisoned");
        ring.push(msg);
        self.not_empty.notify_one();
        crate::diagnostics::adjust_queued_messages(1);
    }

    /// Non-blocking: `None` if the queue is empty right now.
    pub fn try_recv(&self) -> Option<Message> {
        let msg = self.ring.lock().expect("queue mutex poisoned").pop();
        if msg.is_some() {
            crate::diagnostics::adjust_queued_messages(-1);
        }
        msg
    }

    /// Blocks on the condvar until a message is available.
    pub fn recv(&self) -> Message {
        let mut ring = self.ring.lock().expect("queue mutex poisoned");
        loop {
            if let Some(msg) = ring.pop() {
                crate::diagnostics::adjust_queued_messages(-1);
                return msg;
            }
            ring = self.not_empty.wait(ring).expect("queue condvar wait on poisoned mutex");
        }
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Message> {
        let mut ring = self.ring.lock().expect("queue mutex poisoned");
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = ring.pop() {
                crate::diagnostics::adjust_queued_messages(-1);
                return Some(msg);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) =
                self.not_empty.wait_timeout(ring, remaining).expect("queue condvar wait on poisoned mutex");
            ring = guard;
            if result.timed_out() {
                return ring.pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("queue mutex poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let q = MessageQueue::new();
        q.send(Message::Result(Value::int(1)));
        q.send(Message::Result(Value::int(2)));
        q.send(Message::Result(Value::int(3)));
        let Message::Result(a) = q.try_recv().unwrap() else { panic!() };
        let Message::Result(b) = q.try_recv().unwrap() else { panic!() };
        let Message::Result(c) = q.try_recv().unwrap() else { panic!() };
        assert_eq!(a.as_int(), Some(1));
        assert_eq!(b.as_int(), Some(2));
        assert_eq!(c.as_int(), Some(3));
    }

    #[test]
    fn grows_past_initial_capacity_preserving_order() {
        let q = MessageQueue::new();
        for i in 0..20 {
            q.send(Message::Result(Value::int(i)));
        }
        for i in 0..20 {
            let Message::Result(v) = q.try_recv().unwrap() else { panic!() };
            assert_eq!(v.as_int(), Some(i));
        }
        assert!(q.try_recv().is_none());
    }

    #[test]
    fn grow_after_partial_drain_keeps_fifo_order() {
        let q = MessageQueue::new();
        // force a wraparound before growth: fill, drain two, fill two more, then overflow.
        for i in 0..4 {
            q.send(Message::Result(Value::int(i)));
        }
        q.try_recv();
        q.try_recv();
        for i in 4..8 {
            q.send(Message::Result(Value::int(i)));
        }
        for i in 2..8 {
            let Message::Result(v) = q.try_recv().unwrap() else { panic!() };
            assert_eq!(v.as_int(), Some(i));
        }
    }

    #[test]
    fn empty_queue_try_recv_is_none() {
        let q = MessageQueue::new();
        assert!(q.try_recv().is_none());
    }

    #[test]
    fn recv_timeout_returns_none_on_expiry() {
        let q = MessageQueue::new();
        assert!(q.recv_timeout(std::time::Duration::from_millis(10)).is_none());
    }
}
