use std::collections::VecDeque;

use parking_lot::Mutex;

/// Unbounded FIFO intake buffer.
///
/// Safe for any number of producers. The worker is the only consumer, so
/// `peek` followed by `dequeue` observes the same head.
#[derive(Debug)]
pub struct TaskQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// `None` when empty; an empty queue is the normal idle condition.
    pub fn dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: Clone> TaskQueue<T> {
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
