//! The core map: which virtual page lives in which frame.

use super::{backing_store::BackingStore, frame::FrameAllocator};
use crate::EvictionPolicy;
use machine::spinlock::SpinLock;
use std::{collections::VecDeque, sync::Arc};

/// A resident page.
#[derive(Clone)]
pub struct CorePage {
    /// The backing store of the address space the page belongs to.
    pub store: Arc<BackingStore>,
    /// The frame holding the page.
    pub frame: usize,
    /// The virtual page number.
    pub vpn: usize,
}

/// Every resident user page, in the order they became resident.
///
/// The core map picks eviction victims. With [`EvictionPolicy::Fifo`] the
/// oldest page goes. With [`EvictionPolicy::SecondChance`] pages are
/// scanned from the oldest; a page referenced since the last scan has its
/// use bit cleared and is spared, and the first unreferenced page goes.
pub struct CoreMap {
    capacity: usize,
    policy: EvictionPolicy,
    pages: SpinLock<VecDeque<CorePage>>,
}

impl CoreMap {
    /// Create an empty core map for `capacity` frames.
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            pages: SpinLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a newly resident page.
    ///
    /// # Errors
    /// Gives `page` back if the map is full.
    pub fn add(&self, page: CorePage) -> Result<(), CorePage> {
        let mut pages = self.pages.lock();
        let result = if pages.len() == self.capacity {
            Err(page)
        } else {
            pages.push_back(page);
            Ok(())
        };
        pages.unlock();
        result
    }

    /// Choose a victim and remove it from the map.
    ///
    /// The victim is still mapped; the caller pages it out and frees its
    /// frame.
    pub fn evict(&self) -> Option<CorePage> {
        let mut pages = self.pages.lock();
        let victim = match (pages.len(), self.policy) {
            (0, _) => None,
            (1, _) | (_, EvictionPolicy::Fifo) => pages.pop_front(),
            (_, EvictionPolicy::SecondChance) => {
                let spared = pages
                    .iter()
                    .position(|page| !page.store.take_use_bit(page.vpn));
                // Every page was referenced: the oldest one, now cleared, goes.
                pages.remove(spared.unwrap_or(0))
            }
        };
        pages.unlock();
        victim
    }

    /// Remove every page of `store` and give their frames back to `frames`.
    ///
    /// Returns the number of frames released.
    pub fn evict_all(&self, store: &Arc<BackingStore>, frames: &FrameAllocator) -> usize {
        let mut pages = self.pages.lock();
        let mut released = Vec::new();
        pages.retain(|page| {
            let owned = Arc::ptr_eq(&page.store, store);
            if owned {
                released.push(page.frame);
            }
            !owned
        });
        pages.unlock();
        for frame in released.iter() {
            frames.free(*frame);
        }
        released.len()
    }

    /// Returns true if every frame is taken by a page of the map.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        let pages = self.pages.lock();
        let len = pages.len();
        pages.unlock();
        len
    }

    /// Returns true if no page is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The resident pages of `store`, oldest first, as `(vpn, frame)`.
    pub fn resident_pages(&self, store: &Arc<BackingStore>) -> Vec<(usize, usize)> {
        let pages = self.pages.lock();
        let result = pages
            .iter()
            .filter(|page| Arc::ptr_eq(&page.store, store))
            .map(|page| (page.vpn, page.frame))
            .collect();
        pages.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine::{
        mmu::{PteFlags, TranslationEntry},
        storage::Storage,
    };

    fn setup(policy: EvictionPolicy) -> (CoreMap, Arc<BackingStore>) {
        let storage = Storage::new(None);
        let page_table = Arc::new(SpinLock::new(
            (0..4).map(TranslationEntry::invalid).collect::<Vec<_>>(),
        ));
        let store = Arc::new(BackingStore::new(&storage, 0, page_table).unwrap());
        let core_map = CoreMap::new(3, policy);
        for vpn in 0..3 {
            core_map
                .add(CorePage {
                    store: store.clone(),
                    frame: vpn,
                    vpn,
                })
                .ok()
                .unwrap();
        }
        (core_map, store)
    }

    fn touch(store: &BackingStore, vpn: usize) {
        let mut table = store.page_table().lock();
        table[vpn].flags |= PteFlags::USE;
        table.unlock();
    }

    #[test]
    fn full_map_rejects_pages() {
        let (core_map, store) = setup(EvictionPolicy::Fifo);
        assert!(core_map.is_full());
        let page = CorePage {
            store,
            frame: 3,
            vpn: 3,
        };
        assert_eq!(core_map.add(page).err().map(|p| p.vpn), Some(3));
        assert_eq!(core_map.len(), 3);
    }

    #[test]
    fn fifo_evicts_oldest() {
        let (core_map, store) = setup(EvictionPolicy::Fifo);
        touch(&store, 0);
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(0));
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(1));
        assert_eq!(core_map.resident_pages(&store), vec![(2, 2)]);
    }

    #[test]
    fn second_chance_spares_used_pages() {
        let (core_map, store) = setup(EvictionPolicy::SecondChance);
        touch(&store, 0);
        touch(&store, 1);
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(2));
        // The scan cleared the bits of the spared pages.
        assert!(!store.take_use_bit(0));
        assert!(!store.take_use_bit(1));
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(0));
    }

    #[test]
    fn second_chance_with_every_page_used() {
        let (core_map, store) = setup(EvictionPolicy::SecondChance);
        (0..3).for_each(|vpn| touch(&store, vpn));
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(0));
        assert_eq!(core_map.len(), 2);
    }

    #[test]
    fn single_page_is_the_victim() {
        let (core_map, store) = setup(EvictionPolicy::SecondChance);
        core_map.evict();
        core_map.evict();
        touch(&store, 2);
        assert_eq!(core_map.evict().map(|p| p.vpn), Some(2));
        assert!(core_map.evict().is_none());
        assert!(core_map.is_empty());
    }
}
