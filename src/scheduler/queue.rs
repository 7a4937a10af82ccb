use std::collections::{HashMap, VecDeque};

/// Per-name FIFO lists serializing jobs that share a queue name.
///
/// The head of each list is the job currently allowed to run; the rest wait
/// for it to finish.
#[derive(Debug)]
pub struct NamedQueues<T> {
    queues: HashMap<String, VecDeque<T>>,
}

impl<T> Default for NamedQueues<T> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }
}

impl<T: Clone> NamedQueues<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `item` to `name`. Returns true when it is the head and may be
    /// dispatched right away.
    pub fn push(&mut self, name: &str, item: T) -> bool {
        let queue = self.queues.entry(name.to_string()).or_default();
        queue.push_back(item);
        queue.len() == 1
    }

    /// Removes the finished head of `name` and returns the next item to
    /// dispatch, if any.
    pub fn notify(&mut self, name: &str) -> Option<T> {
        let queue = self.queues.get_mut(name)?;
        queue.pop_front();
        match queue.front() {
            Some(next) => Some(next.clone()),
            None => {
                self.queues.remove(name);
                None
            }
        }
    }

    pub fn len(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Drops every parked item behind the heads, returning them.
    pub fn drain_waiting(&mut self) -> Vec<T> {
        let mut waiting = Vec::new();
        for queue in self.queues.values_mut() {
            if queue.len() > 1 {
                waiting.extend(queue.drain(1..));
            }
        }
        waiting
    }
}
