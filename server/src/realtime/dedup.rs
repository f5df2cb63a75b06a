use std::collections::{HashSet, VecDeque};

/// Bounded set of recently delivered event keys. The oldest key is evicted
/// once `capacity` is reached.
#[derive(Debug)]
pub struct RecentKeys {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            keys: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `key`; false when it was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_exact_repeats() {
        let mut keys = RecentKeys::new(8);
        assert!(keys.insert("42:abc123"));
        assert!(!keys.insert("42:abc123"));
        assert!(keys.insert("42:abc124"));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut keys = RecentKeys::new(2);
        keys.insert("a");
        keys.insert("b");
        keys.insert("c");
        assert_eq!(keys.len(), 2);
        assert!(keys.insert("a"));
        assert!(!keys.insert("c"));
    }
}
