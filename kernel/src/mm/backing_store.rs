//! Swap space of an address space.

use crate::KernelError;
use bitvec::prelude::*;
use machine::{
    Machine,
    addressing::{PAGE_SIZE, Pa},
    mmu::{PteFlags, TranslationEntry},
    spinlock::SpinLock,
    stats::Statistics,
    storage::{OpenFile, Storage},
};
use std::sync::Arc;

/// A page table shared by the threads of an address space.
pub type PageTable = Arc<SpinLock<Vec<TranslationEntry>>>;

/// Where the pages of one address space go when they are evicted.
///
/// Each backing store owns a swap file named `swap.<id>`, with one
/// page-sized slot per virtual page. A page that was written to the swap
/// file at least once is "contained" by the store; from then on the swap
/// file holds its authoritative content whenever it is not resident.
pub struct BackingStore {
    id: usize,
    file: OpenFile,
    page_table: PageTable,
    swapped: SpinLock<BitVec>,
}

impl BackingStore {
    /// Name of the swap file of store `id`.
    pub fn swap_file_name(id: usize) -> String {
        format!("swap.{id}")
    }

    /// Create the swap file of store `id` for the pages of `page_table`.
    ///
    /// # Errors
    /// Fails if the swap file cannot be created on `storage`.
    pub fn new(storage: &Storage, id: usize, page_table: PageTable) -> Result<Self, KernelError> {
        let name = Self::swap_file_name(id);
        let num_pages = Self::num_pages(&page_table);
        storage.create(&name, num_pages * PAGE_SIZE)?;
        let file = storage.open(&name).ok_or(KernelError::NoSuchEntry)?;
        Ok(Self {
            id,
            file,
            page_table,
            swapped: SpinLock::new(bitvec![0; num_pages]),
        })
    }

    fn num_pages(page_table: &PageTable) -> usize {
        let table = page_table.lock();
        let n = table.len();
        table.unlock();
        n
    }

    /// The store-table slot of this store.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The page table this store serves.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    fn with_entry<R>(&self, vpn: usize, f: impl FnOnce(&mut TranslationEntry) -> R) -> R {
        let mut table = self.page_table.lock();
        let result = table.get_mut(vpn).map(f);
        table.unlock();
        result.unwrap_or_else(|| panic!("Page {vpn} is outside of store {}.", self.id))
    }

    /// Returns true if page `vpn` was ever written to the swap file.
    pub fn contains(&self, vpn: usize) -> bool {
        let swapped = self.swapped.lock();
        let contained = swapped.get(vpn).is_some_and(|bit| *bit);
        swapped.unlock();
        contained
    }

    /// Evict page `vpn`: write it to the swap file if it is dirty, then
    /// invalidate it.
    ///
    /// The frame is left for the caller to free.
    pub fn page_out(&self, vpn: usize, machine: &Machine) {
        let (frame, dirty) = self.with_entry(vpn, |entry| {
            let dirty = entry.flags.contains(PteFlags::DIRTY);
            entry.flags.remove(PteFlags::VALID | PteFlags::DIRTY);
            (entry.physical_page, dirty)
        });
        let Some(frame) = frame else {
            return;
        };
        if dirty {
            let page = machine.memory.read_frame(frame);
            self.file.write_at(vpn * PAGE_SIZE, &page);
            let mut swapped = self.swapped.lock();
            swapped.set(vpn, true);
            swapped.unlock();
            Statistics::bump(&machine.stats.page_outs);
            debug!("Swap: page {vpn} of store {} written out.", self.id);
        }
    }

    /// Read page `vpn` from the swap file into the frame already assigned
    /// to it, and mark it valid.
    pub fn page_in(&self, vpn: usize, machine: &Machine) {
        let frame = self.with_entry(vpn, |entry| entry.physical_page);
        let Some(frame) = frame else {
            panic!("Page {vpn} of store {} paged in without a frame.", self.id);
        };
        let mut page = [0; PAGE_SIZE];
        self.file.read_at(vpn * PAGE_SIZE, &mut page);
        machine.memory.write(Pa::from_frame(frame), &page);
        self.with_entry(vpn, |entry| entry.flags.insert(PteFlags::VALID));
    }

    /// Test and clear the use bit of page `vpn`.
    pub(crate) fn take_use_bit(&self, vpn: usize) -> bool {
        self.with_entry(vpn, |entry| {
            let used = entry.flags.contains(PteFlags::USE);
            entry.flags.remove(PteFlags::USE);
            used
        })
    }

    /// Make room for `num_pages` pages in total.
    pub fn grow(&self, storage: &Storage, num_pages: usize) -> Result<(), KernelError> {
        storage.resize(&Self::swap_file_name(self.id), num_pages * PAGE_SIZE)?;
        let mut swapped = self.swapped.lock();
        swapped.resize(num_pages, false);
        swapped.unlock();
        Ok(())
    }

    /// Delete the swap file.
    pub fn remove(&self, storage: &Storage) {
        if let Err(e) = storage.remove(&Self::swap_file_name(self.id)) {
            warning!("Swap: {e}.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine::MachineConfig;

    fn setup() -> (Machine, BackingStore) {
        let machine = Machine::new(&MachineConfig {
            num_frames: 2,
            ..Default::default()
        });
        let page_table = Arc::new(SpinLock::new(
            (0..2).map(TranslationEntry::invalid).collect::<Vec<_>>(),
        ));
        let store = BackingStore::new(&machine.storage, 7, page_table).unwrap();
        (machine, store)
    }

    fn map(store: &BackingStore, vpn: usize, frame: usize, flags: PteFlags) {
        let mut table = store.page_table().lock();
        table[vpn].physical_page = Some(frame);
        table[vpn].flags = flags;
        table.unlock();
    }

    #[test]
    fn swap_file_is_sized_for_the_page_table() {
        let (machine, store) = setup();
        let file = machine.storage.open("swap.7").unwrap();
        assert_eq!(file.len(), 2 * PAGE_SIZE);
        store.remove(&machine.storage);
        assert!(!machine.storage.exists("swap.7"));
    }

    #[test]
    fn dirty_page_round_trip() {
        let (machine, store) = setup();
        let pattern = (0..PAGE_SIZE).map(|i| i as u8).collect::<Vec<_>>();
        machine.memory.write(Pa::from_frame(1), &pattern);
        map(&store, 1, 1, PteFlags::VALID | PteFlags::DIRTY);

        store.page_out(1, &machine);
        assert!(store.contains(1));
        let entry = store.page_table().lock();
        let flags = entry[1].flags;
        entry.unlock();
        assert!(!flags.intersects(PteFlags::VALID | PteFlags::DIRTY));

        machine.memory.zero_frame(1);
        store.page_in(1, &machine);
        assert_eq!(machine.memory.read_frame(1).to_vec(), pattern);
        assert_eq!(machine.stats.snapshot().page_outs, 1);
    }

    #[test]
    fn clean_page_is_not_written() {
        let (machine, store) = setup();
        map(&store, 0, 0, PteFlags::VALID);
        store.page_out(0, &machine);
        assert!(!store.contains(0));
        assert_eq!(machine.stats.snapshot().page_outs, 0);
    }

    #[test]
    fn grow_extends_swap_file() {
        let (machine, store) = setup();
        store.grow(&machine.storage, 10).unwrap();
        assert_eq!(machine.storage.open("swap.7").unwrap().len(), 10 * PAGE_SIZE);
        assert!(!store.contains(9));
    }
}
