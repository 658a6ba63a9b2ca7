//! Outbound payload buffering for the session channels.
//!
//! Two container policies share one interface: a FIFO queue used where
//! delivery order is contractual (pending sends, tile requests) and a
//! LIFO stack usable interchangeably where it is not. `pop`/`peek` on an
//! empty container return `None`, never fail.

/// Common interface over the FIFO and LIFO container policies.
pub trait Queue<T> {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn peek(&self) -> Option<&T>;
}

/// First-in-first-out queue with amortized O(1) push/pop.
///
/// Consumed items are not removed eagerly; a read offset advances over
/// the backing storage and the buffer is compacted once the consumed
/// prefix reaches half of it, bounding unreclaimed memory without
/// paying per-op compaction cost.
#[derive(Debug)]
pub struct Fifo<T> {
    // Consumed slots stay behind as `None` until the next compaction.
    buf: Vec<Option<T>>,
    offset: usize,
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            offset: 0,
        }
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> for Fifo<T> {
    fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn push(&mut self, item: T) {
        self.buf.push(Some(item));
    }

    fn pop(&mut self) -> Option<T> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let item = self.buf[self.offset].take();
        self.offset += 1;
        if self.offset * 2 >= self.buf.len() {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
        item
    }

    fn peek(&self) -> Option<&T> {
        self.buf.get(self.offset).and_then(Option::as_ref)
    }
}

/// Last-in-first-out stack exposing the same interface as [`Fifo`].
#[derive(Debug)]
pub struct Lifo<T> {
    buf: Vec<T>,
}

impl<T> Lifo<T> {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }
}

impl<T> Default for Lifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> for Lifo<T> {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, item: T) {
        self.buf.push(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.buf.pop()
    }

    fn peek(&self) -> Option<&T> {
        self.buf.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_preserves_push_order() {
        let mut q = Fifo::new();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_empty_pop_and_peek_return_none() {
        let mut q: Fifo<u8> = Fifo::new();
        assert_eq!(q.pop(), None);
        assert_eq!(q.peek(), None);
    }

    #[test]
    fn fifo_peek_does_not_consume() {
        let mut q = Fifo::new();
        q.push("a");
        assert_eq!(q.peek(), Some(&"a"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some("a"));
    }

    #[test]
    fn fifo_interleaved_push_pop_stays_ordered() {
        let mut q = Fifo::new();
        let mut expected = Vec::new();
        let mut drained = Vec::new();
        for round in 0..10 {
            for i in 0..7 {
                let v = round * 7 + i;
                q.push(v);
                expected.push(v);
            }
            for _ in 0..4 {
                drained.push(q.pop().unwrap());
            }
        }
        while let Some(v) = q.pop() {
            drained.push(v);
        }
        assert_eq!(drained, expected);
    }

    #[test]
    fn lifo_pops_most_recent_first() {
        let mut s = Lifo::new();
        s.push(1);
        s.push(2);
        s.push(3);
        assert_eq!(s.peek(), Some(&3));
        assert_eq!(s.pop(), Some(3));
        assert_eq!(s.pop(), Some(2));
        assert_eq!(s.pop(), Some(1));
        assert_eq!(s.pop(), None);
    }
}
