use std::collections::VecDeque;

/// Fixed-capacity FIFO buffer: appending to a full window evicts the oldest
/// entry, so `len() <= capacity()` always holds.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    /// A zero capacity is bumped to one so the latest sample is always kept.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    /// Mean of `value(sample)` over the newest `count` samples.
    ///
    /// Returns `None` while fewer than `count` samples exist: a mean over a
    /// partially filled window would understate the real load.
    pub fn mean_of_last<F>(&self, count: usize, value: F) -> Option<f64>
    where
        F: Fn(&T) -> f64,
    {
        if count == 0 || self.samples.len() < count {
            return None;
        }
        let skip = self.samples.len() - count;
        let sum: f64 = self.samples.iter().skip(skip).map(value).sum();
        Some(sum / count as f64)
    }

    /// Mean over everything currently held, `None` when empty.
    pub fn mean<F>(&self, value: F) -> Option<f64>
    where
        F: Fn(&T) -> f64,
    {
        self.mean_of_last(self.samples.len(), value)
    }
}

impl<T: Clone> RollingWindow<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }
}
