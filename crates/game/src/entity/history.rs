/// Anything addressable by a simulation step number.
pub trait Stamped {
    fn step(&self) -> u32;
}

/// Bounded history of step-stamped entries, newest first.
///
/// Invariant: steps are strictly descending, so index 0 holds the highest
/// step retained. Inserting into a full buffer evicts the oldest entry;
/// an entry older than everything retained is dropped instead.
#[derive(Debug, Clone)]
pub struct History<T> {
    entries: Vec<T>,
    capacity: usize,
}

impl<T: Stamped> History<T> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn newest(&self) -> Option<&T> {
        self.entries.first()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Index of the first entry with `step <= step`, or `len()` if every
    /// retained entry is newer.
    pub fn insertion_index(&self, step: u32) -> usize {
        self.entries
            .iter()
            .position(|e| e.step() <= step)
            .unwrap_or(self.entries.len())
    }

    /// Ordered insert. Returns false when the entry was dropped because the
    /// buffer is full and the entry is older than everything retained.
    /// An entry for an already-retained step replaces the old one.
    pub fn insert(&mut self, entry: T) -> bool {
        let i = self.insertion_index(entry.step());

        if let Some(existing) = self.entries.get_mut(i) {
            if existing.step() == entry.step() {
                *existing = entry;
                return true;
            }
        }

        if self.entries.len() == self.capacity {
            if i == self.entries.len() {
                return false;
            }
            self.entries.pop();
        }

        self.entries.insert(i, entry);
        true
    }

    /// Fast path for the simulation loop: the entry is known to be newer
    /// than everything retained.
    pub fn push_newest(&mut self, entry: T) {
        debug_assert!(self.newest().is_none_or(|n| n.step() < entry.step()));

        if self.entries.len() == self.capacity {
            self.entries.pop();
        }
        self.entries.insert(0, entry);
    }

    pub fn pop_oldest(&mut self) -> Option<T> {
        self.entries.pop()
    }

    /// Keep only the `keep` newest entries.
    pub fn truncate(&mut self, keep: usize) {
        self.entries.truncate(keep);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Stamped> std::ops::Index<usize> for History<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.entries[index]
    }
}
