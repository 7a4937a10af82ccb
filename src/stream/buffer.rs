use std::collections::VecDeque;

/// Fixed-capacity ring keeping the most recent items.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item, evicting the oldest when full.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl RingBuffer<String> {
    pub fn joined(&self) -> String {
        self.items
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut ring = RingBuffer::new(0);
        ring.push("x");
        assert!(ring.is_empty());
    }

    #[test]
    fn joined_strings() {
        let mut ring = RingBuffer::new(2);
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.joined(), "b\nc");
    }
}
