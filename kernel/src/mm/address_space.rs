//! User address spaces.

use super::{
    backing_store::{BackingStore, PageTable},
    core_map::CorePage,
    noff::NoffHeader,
};
use crate::{Kernel, KernelError, user::UserProgram};
use machine::{
    addressing::{PAGE_SIZE, Pa, Va, div_round_up},
    mmu::{self, Exception, ExceptionType, PteFlags, TranslationEntry},
    spinlock::SpinLock,
    stats::Statistics,
    storage::OpenFile,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Bytes reserved for the stack of each user thread.
pub const USER_STACK_SIZE: usize = 1024;
/// Bytes reserved at the top of a new address space for the arguments.
pub const ARGUMENT_SIZE: usize = 512;
/// Longest argument accepted, terminating NUL included.
pub const MAX_ARGUMENT_LEN: usize = 50;
/// Largest image accepted: code, initialized and uninitialized data.
pub const MAX_IMAGE_SIZE: usize = 256 * 1024;

/// The initial register values of a user thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserRegisters {
    /// Stack pointer.
    pub sp: Va,
    /// Number of arguments.
    pub argc: usize,
    /// Address of the argument pointer array.
    pub argv: Va,
}

/// The address space of a user process.
///
/// The address space is a linear page table over a virtual range that
/// covers the segments of the executable, one user stack and the argument
/// area. Every page starts unmapped and is brought in on the first fault:
/// from the executable if it overlaps the code or initialized data, from the
/// backing store if it was swapped out before, and zero-filled otherwise.
///
/// The threads of a process share the address space; user-level forks add
/// a stack to it.
pub struct AddressSpace {
    header: NoffHeader,
    executable: OpenFile,
    page_table: PageTable,
    store: Arc<BackingStore>,
    arguments: SpinLock<Vec<Vec<u8>>>,
    entries: SpinLock<Vec<UserProgram>>,
    threads: AtomicUsize,
}

impl AddressSpace {
    /// Build the address space of `executable`, swapping to the backing
    /// store `store_id`.
    ///
    /// # Errors
    /// - [`KernelError::NoExec`] if the header of `executable` is invalid or
    ///   the image is larger than [`MAX_IMAGE_SIZE`].
    /// - The swap file cannot be created.
    pub fn new(kernel: &Kernel, executable: OpenFile, store_id: usize) -> Result<Arc<Self>, KernelError> {
        let header = NoffHeader::read_from(&executable)?;
        if header.image_size() > MAX_IMAGE_SIZE {
            return Err(KernelError::NoExec);
        }
        let size = header.image_size() + USER_STACK_SIZE + ARGUMENT_SIZE;
        let num_pages = div_round_up(size, PAGE_SIZE);
        debug!(
            "AddressSpace: {num_pages} pages ({} bytes), store {store_id}.",
            num_pages * PAGE_SIZE
        );

        let page_table: PageTable = Arc::new(SpinLock::new(
            (0..num_pages).map(TranslationEntry::invalid).collect(),
        ));
        let store = BackingStore::new(&kernel.machine.storage, store_id, page_table.clone())?;
        Ok(Arc::new(Self {
            header,
            executable,
            page_table,
            store: Arc::new(store),
            arguments: SpinLock::new(Vec::new()),
            entries: SpinLock::new(Vec::new()),
            threads: AtomicUsize::new(0),
        }))
    }

    /// The parsed header of the executable.
    pub fn header(&self) -> &NoffHeader {
        &self.header
    }

    /// The page table.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<BackingStore> {
        &self.store
    }

    /// Number of virtual pages.
    pub fn num_pages(&self) -> usize {
        let table = self.page_table.lock();
        let n = table.len();
        table.unlock();
        n
    }

    /// Size of the address space in bytes.
    pub fn size(&self) -> usize {
        self.num_pages() * PAGE_SIZE
    }

    /// A copy of the page table entry of page `vpn`.
    pub fn entry(&self, vpn: usize) -> Option<TranslationEntry> {
        let table = self.page_table.lock();
        let entry = table.get(vpn).cloned();
        table.unlock();
        entry
    }

    /// Make the page containing `va` resident.
    ///
    /// The core map must have room: the page fault handler evicts a victim
    /// first when it is full.
    ///
    /// # Errors
    /// - [`KernelError::BadAddress`] if `va` is outside of the space.
    /// - [`KernelError::NoMemory`] if no frame is free.
    pub fn alloc_virtual_page(&self, kernel: &Kernel, va: Va) -> Result<(), KernelError> {
        let vpn = va.page_number();
        if vpn >= self.num_pages() {
            return Err(KernelError::BadAddress);
        }
        let frame = kernel.frames.allocate().ok_or(KernelError::NoMemory)?;
        let page = CorePage {
            store: self.store.clone(),
            frame,
            vpn,
        };
        if kernel.core_map.add(page).is_err() {
            kernel.frames.free(frame);
            return Err(KernelError::NoMemory);
        }

        let mut table = self.page_table.lock();
        let entry = &mut table[vpn];
        entry.physical_page = Some(frame);
        entry.flags.remove(PteFlags::VALID | PteFlags::USE | PteFlags::DIRTY);
        table.unlock();

        let machine = &kernel.machine;
        machine.memory.zero_frame(frame);
        if self.store.contains(vpn) {
            self.store.page_in(vpn, machine);
            Statistics::bump(&machine.stats.page_ins);
        } else {
            let base = vpn * PAGE_SIZE;
            let mut populated = false;
            for segment in [self.header.code, self.header.init_data] {
                if let Some((start, end)) = segment.overlap(base, PAGE_SIZE) {
                    let mut buf = vec![0; end - start];
                    let offset = segment.in_file_addr as usize + start - segment.virtual_addr as usize;
                    self.executable.read_at(offset, &mut buf);
                    machine
                        .memory
                        .write(Pa::from_frame(frame) + (start - base), &buf);
                    populated = true;
                }
            }
            if populated {
                Statistics::bump(&machine.stats.page_ins);
            }
        }

        let mut table = self.page_table.lock();
        table[vpn].flags.insert(PteFlags::VALID);
        table.unlock();
        Ok(())
    }

    /// Translate `va` for an access of `size` bytes, servicing page faults.
    ///
    /// # Errors
    /// Any exception other than a page fault.
    pub fn translate(&self, kernel: &Kernel, va: Va, size: usize, writing: bool) -> Result<Pa, Exception> {
        let num_frames = kernel.machine.memory.num_frames();
        loop {
            let mut table = self.page_table.lock();
            let result = mmu::translate(&mut table, num_frames, va, size, writing);
            table.unlock();
            match result {
                Err(Exception {
                    kind: ExceptionType::PageFault,
                    ..
                }) => super::handle_page_fault(kernel, self, va),
                result => return result,
            }
        }
    }

    /// Copy user memory at `va` into `buf`.
    pub fn read_bytes(&self, kernel: &Kernel, va: Va, buf: &mut [u8]) -> Result<(), Exception> {
        for (i, b) in buf.iter_mut().enumerate() {
            let pa = self.translate(kernel, va + i, 1, false)?;
            kernel.machine.memory.read(pa, std::slice::from_mut(b));
        }
        Ok(())
    }

    /// Copy `data` into user memory at `va`.
    pub fn write_bytes(&self, kernel: &Kernel, va: Va, data: &[u8]) -> Result<(), Exception> {
        for (i, b) in data.iter().enumerate() {
            let pa = self.translate(kernel, va + i, 1, true)?;
            kernel.machine.memory.write(pa, std::slice::from_ref(b));
        }
        Ok(())
    }

    /// Read the aligned word at `va`.
    pub fn read_u32(&self, kernel: &Kernel, va: Va) -> Result<u32, Exception> {
        let pa = self.translate(kernel, va, 4, false)?;
        let mut word = [0; 4];
        kernel.machine.memory.read(pa, &mut word);
        Ok(u32::from_le_bytes(word))
    }

    /// Write the aligned word at `va`.
    pub fn write_u32(&self, kernel: &Kernel, va: Va, value: u32) -> Result<(), Exception> {
        let pa = self.translate(kernel, va, 4, true)?;
        kernel.machine.memory.write(pa, &value.to_le_bytes());
        Ok(())
    }

    /// Stage the arguments of the program. `argv[0]` is the program name.
    ///
    /// # Errors
    /// [`KernelError::ArgumentListTooLong`] if the arguments do not fit in
    /// the argument area.
    pub fn add_arguments(&self, argv: Vec<Vec<u8>>) -> Result<(), KernelError> {
        let strings: usize = argv.iter().map(|arg| arg.len() + 1).sum();
        if strings + 4 * argv.len() + 4 > ARGUMENT_SIZE {
            return Err(KernelError::ArgumentListTooLong);
        }
        let mut arguments = self.arguments.lock();
        *arguments = argv;
        arguments.unlock();
        Ok(())
    }

    /// Copy the staged arguments to the top of the address space.
    ///
    /// The strings are pushed first, then the 4-byte aligned array of their
    /// addresses. The stack starts 16 bytes below that array.
    pub fn load_arguments(&self, kernel: &Kernel) -> Result<UserRegisters, KernelError> {
        let mut arguments = self.arguments.lock();
        let argv = std::mem::take(&mut *arguments);
        arguments.unlock();

        let mut sp = Va::new(self.size());
        let mut pointers = Vec::with_capacity(argv.len());
        for arg in argv.iter() {
            sp -= arg.len() + 1;
            self.write_bytes(kernel, sp, arg)
                .and_then(|_| self.write_bytes(kernel, sp + arg.len(), &[0]))
                .map_err(|_| KernelError::BadAddress)?;
            pointers.push(sp);
        }
        sp -= argv.len() * 4;
        sp = Va::new(sp.into_usize() & !3);
        for (i, pointer) in pointers.iter().enumerate() {
            self.write_u32(kernel, sp + i * 4, pointer.into_usize() as u32)
                .map_err(|_| KernelError::BadAddress)?;
        }
        Ok(UserRegisters {
            sp: sp - 16,
            argc: argv.len(),
            argv: sp,
        })
    }

    /// Add a user stack for a new thread of this space.
    ///
    /// The new pages are unmapped and get a slot in the swap file. Returns
    /// the top of the new stack.
    pub fn allocate_thread_space(&self, kernel: &Kernel) -> Result<Va, KernelError> {
        let new_pages = div_round_up(USER_STACK_SIZE, PAGE_SIZE);
        let num_pages = self.num_pages() + new_pages;
        self.store.grow(&kernel.machine.storage, num_pages)?;

        let mut table = self.page_table.lock();
        let old = table.len();
        table.extend((old..num_pages).map(TranslationEntry::invalid));
        table.unlock();
        Ok(Va::new(num_pages * PAGE_SIZE))
    }

    /// Register the entry point of a user-level thread, returning its
    /// handle.
    pub fn register_entry(&self, entry: UserProgram) -> usize {
        let mut entries = self.entries.lock();
        entries.push(entry);
        let id = entries.len() - 1;
        entries.unlock();
        id
    }

    /// The entry point registered as `id`.
    pub fn entry_point(&self, id: usize) -> Option<UserProgram> {
        let entries = self.entries.lock();
        let entry = entries.get(id).cloned();
        entries.unlock();
        entry
    }

    /// One more thread runs in this space.
    pub fn add_thread(&self) {
        self.threads.fetch_add(1, Ordering::SeqCst);
    }

    /// One thread of this space exited. Returns the number left.
    pub fn remove_thread(&self) -> usize {
        self.threads.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Number of threads running in this space.
    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }

    /// Release every resource of the space: resident frames, the swap file
    /// and the store-table slot.
    pub fn teardown(&self, kernel: &Kernel) {
        let freed = kernel.core_map.evict_all(&self.store, &kernel.frames);
        self.store.remove(&kernel.machine.storage);
        kernel.stores.release(self.store.id());
        debug!(
            "AddressSpace: store {} torn down, {freed} frame(s) released.",
            self.store.id()
        );
    }
}
