/// Records that can be scrubbed and reused.
pub trait Recycle: Default {
    fn recycle(&mut self);
}

/// Bounded free list of reusable records, owned by one connection and
/// only touched under that connection's lock.
#[derive(Debug)]
pub struct FreeList<T> {
    items: Vec<T>,
    limit: usize,
    /// Records created because the list was empty
    created: u64,
    reused: u64,
}

impl<T: Recycle> FreeList<T> {
    pub fn new(limit: usize) -> Self {
        FreeList {
            items: Vec::with_capacity(limit),
            limit,
            created: 0,
            reused: 0,
        }
    }

    pub fn take(&mut self) -> T {
        match self.items.pop() {
            Some(item) => {
                self.reused += 1;
                item
            }
            None => {
                self.created += 1;
                T::default()
            }
        }
    }

    pub fn give_back(&mut self, mut item: T) {
        if self.items.len() < self.limit {
            item.recycle();
            self.items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.created, self.reused)
    }
}
