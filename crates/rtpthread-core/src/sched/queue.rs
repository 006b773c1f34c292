//! Bounded FIFO message queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Bounded FIFO queue with blocking send/receive.
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Queue<T> {
    /// Queue holding at most `capacity` items (at least one).
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `item`, waiting at most `timeout` for room. The item is handed
    /// back when the queue stays full.
    pub fn send(&self, item: T, timeout: Option<Duration>) -> Result<(), T> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            match (timeout, deadline) {
                (None, _) | (Some(_), None) => self.not_full.wait(&mut items),
                (Some(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Err(item);
                    }
                    let _ = self.not_full.wait_until(&mut items, deadline);
                }
            }
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking send.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, waiting at most `timeout` for one to arrive.
    pub fn receive(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            match (timeout, deadline) {
                (None, _) | (Some(_), None) => self.not_empty.wait(&mut items),
                (Some(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    let _ = self.not_empty.wait_until(&mut items, deadline);
                }
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = Queue::bounded(3);
        q.try_send(1).unwrap();
        q.try_send(2).unwrap();
        q.try_send(3).unwrap();
        assert_eq!(q.try_send(4), Err(4));
        assert_eq!(q.try_receive(), Some(1));
        assert_eq!(q.try_receive(), Some(2));
        assert_eq!(q.try_receive(), Some(3));
        assert_eq!(q.try_receive(), None);
    }

    #[test]
    fn receive_times_out_on_empty_queue() {
        let q: Queue<u8> = Queue::bounded(1);
        assert_eq!(q.receive(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn blocked_receiver_gets_item() {
        let q = Arc::new(Queue::bounded(1));
        let rx = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.receive(None))
        };
        thread::sleep(Duration::from_millis(20));
        q.send(42_usize, None).unwrap();
        assert_eq!(rx.join().unwrap(), Some(42));
    }

    #[test]
    fn send_times_out_when_full() {
        let q = Queue::bounded(1);
        q.try_send('a').unwrap();
        assert_eq!(q.send('b', Some(Duration::from_millis(10))), Err('b'));
        assert_eq!(q.len(), 1);
        assert_eq!(q.capacity(), 1);
    }
}
