/// Circular buffer of free object addresses.
///
/// `count` entries live at `start..start + count` modulo the capacity,
/// which is fixed when the list is created.
#[derive(Debug, Clone)]
pub struct FreeList {
    buf: Box<[usize]>,
    start: usize,
    count: usize,
}

impl FreeList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)].into_boxed_slice(),
            start: 0,
            count: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.buf.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.count
    }

    /// Appends at the back. Returns `false` when full.
    #[inline]
    pub fn push(&mut self, addr: usize) -> bool {
        if self.is_full() {
            return false;
        }
        let cap = self.buf.len();
        self.buf[(self.start + self.count) % cap] = addr;
        self.count += 1;
        true
    }

    /// Takes from the back, so recently freed objects are reused first.
    #[inline]
    pub fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        let cap = self.buf.len();
        Some(self.buf[(self.start + self.count) % cap])
    }

    /// Takes from the front, the entries freed longest ago.
    #[inline]
    pub fn pop_front(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let addr = self.buf[self.start];
        self.start = (self.start + 1) % self.buf.len();
        self.count -= 1;
        Some(addr)
    }

    /// Removes up to `n` of the oldest entries.
    pub fn drain_front(&mut self, n: usize) -> Vec<usize> {
        let n = n.min(self.count);
        (0..n).filter_map(|_| self.pop_front()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let cap = self.buf.len();
        (0..self.count).map(move |i| self.buf[(self.start + i) % cap])
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.iter().any(|entry| entry == addr)
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_capacity() {
        let mut list = FreeList::with_capacity(4);
        for addr in [16, 32, 48] {
            assert!(list.push(addr));
        }
        assert_eq!(list.pop_front(), Some(16));
        assert_eq!(list.pop_front(), Some(32));
        for addr in [64, 80, 96] {
            assert!(list.push(addr));
        }
        assert!(list.is_full());
        assert!(!list.push(112));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![48, 64, 80, 96]);
        assert_eq!(list.iter().count(), list.len());

        assert_eq!(list.pop(), Some(96));
        assert_eq!(list.drain_front(2), vec![48, 64]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop(), Some(80));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn randomized_against_deque() {
        let mut list = FreeList::with_capacity(37);
        let mut model = std::collections::VecDeque::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for i in 0..10_000usize {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            match (seed >> 33) % 3 {
                0 => assert_eq!(list.pop(), model.pop_back()),
                1 => assert_eq!(list.pop_front(), model.pop_front()),
                _ => {
                    let pushed = list.push(i);
                    if model.len() < 37 {
                        assert!(pushed);
                        model.push_back(i);
                    } else {
                        assert!(!pushed);
                    }
                }
            }
            assert_eq!(list.len(), model.len());
        }
    }
}
