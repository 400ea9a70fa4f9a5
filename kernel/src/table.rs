//! Fixed-size tables of kernel objects.
//!
//! The process table and the backing store table hand out small integer
//! identifiers. An identifier is valid from [`Table::alloc`] (or
//! [`Table::reserve`]) until [`Table::release`], and may be reused
//! afterwards.

use machine::spinlock::SpinLock;

#[derive(Clone)]
enum Slot<T> {
    Free,
    Reserved,
    Used(T),
}

/// A table of at most `size` objects, indexed by slot number.
pub struct Table<T: Clone> {
    name: &'static str,
    slots: SpinLock<Vec<Slot<T>>>,
}

impl<T: Clone> Table<T> {
    /// Create an empty table of `size` slots.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            slots: SpinLock::new(vec![Slot::Free; size]),
        }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut Vec<Slot<T>>) -> R) -> R {
        let mut slots = self.slots.lock();
        let result = f(&mut slots);
        slots.unlock();
        result
    }

    /// Store `obj` in the lowest free slot, returning its index.
    pub fn alloc(&self, obj: T) -> Option<usize> {
        let index = self.with_slots(|slots| {
            let index = slots.iter().position(|s| matches!(s, Slot::Free))?;
            slots[index] = Slot::Used(obj);
            Some(index)
        });
        if index.is_none() {
            warning!("{}: full.", self.name);
        }
        index
    }

    /// Take the lowest free slot without storing anything yet.
    ///
    /// The slot is filled later with [`Table::fill`]. Until then, [`get`]
    /// returns `None` for it.
    ///
    /// [`get`]: Table::get
    pub fn reserve(&self) -> Option<usize> {
        let index = self.with_slots(|slots| {
            let index = slots.iter().position(|s| matches!(s, Slot::Free))?;
            slots[index] = Slot::Reserved;
            Some(index)
        });
        if index.is_none() {
            warning!("{}: full.", self.name);
        }
        index
    }

    /// Store `obj` in the reserved slot `index`.
    ///
    /// # Panics
    /// Panics if `index` is not reserved.
    pub fn fill(&self, index: usize, obj: T) {
        let reserved = self.with_slots(|slots| match slots.get_mut(index) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Used(obj);
                true
            }
            _ => false,
        });
        assert!(reserved, "{}: slot {index} is not reserved.", self.name);
    }

    /// The object in slot `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        self.with_slots(|slots| match slots.get(index) {
            Some(Slot::Used(obj)) => Some(obj.clone()),
            _ => None,
        })
    }

    /// Free slot `index`, returning what it held.
    pub fn release(&self, index: usize) -> Option<T> {
        self.with_slots(|slots| {
            let slot = slots.get_mut(index)?;
            match std::mem::replace(slot, Slot::Free) {
                Slot::Used(obj) => Some(obj),
                _ => None,
            }
        })
    }

    /// Free every slot whose object satisfies `pred`. Returns how many were
    /// freed.
    pub fn release_where(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        self.with_slots(|slots| {
            let mut released = 0;
            for slot in slots.iter_mut() {
                if matches!(slot, Slot::Used(obj) if pred(obj)) {
                    *slot = Slot::Free;
                    released += 1;
                }
            }
            released
        })
    }

    /// Number of slots in use or reserved.
    pub fn in_use(&self) -> usize {
        self.with_slots(|slots| slots.iter().filter(|s| !matches!(s, Slot::Free)).count())
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.with_slots(|slots| slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_slot_first() {
        let table = Table::new("test", 3);
        assert_eq!(table.alloc("a"), Some(0));
        assert_eq!(table.alloc("b"), Some(1));
        assert_eq!(table.release(0), Some("a"));
        assert_eq!(table.alloc("c"), Some(0));
        assert_eq!(table.alloc("d"), Some(2));
        assert_eq!(table.alloc("e"), None);
        assert_eq!(table.in_use(), 3);
    }

    #[test]
    fn reserved_slots_are_taken_but_empty() {
        let table = Table::new("test", 2);
        let slot = table.reserve().unwrap();
        assert_eq!(table.get(slot), None);
        assert_eq!(table.alloc(7), Some(1));
        assert_eq!(table.alloc(8), None);
        table.fill(slot, 6);
        assert_eq!(table.get(slot), Some(6));
    }

    #[test]
    #[should_panic]
    fn fill_requires_reservation() {
        let table = Table::new("test", 1);
        table.fill(0, 1);
    }

    #[test]
    fn release_where_frees_matching() {
        let table = Table::new("test", 4);
        for v in [1, 2, 3, 4] {
            table.alloc(v);
        }
        assert_eq!(table.release_where(|v| v % 2 == 0), 2);
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(2), Some(3));
        assert_eq!(table.release(1), None);
    }
}
