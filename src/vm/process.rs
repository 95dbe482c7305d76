use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Weak,
	},
};

use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
	consts::{KERNEL_BASE, PAGE_SIZE, STACK_PAGE_LIMIT, STACK_SLACK},
	fs::inode::Inode,
	vm::{
		frame::{FrameGuard, FrameTable},
		page::{FileBacking, PageDir, PageEntry, PageKind, VirtAddr},
		swap::SwapStore,
	},
};

/// A condition that is fatal to the faulting process.
#[derive(Debug, Error)]
pub enum Fault {
	#[error("null pointer dereference")]
	NullDereference,

	#[error("access to unmapped address {0:?}")]
	NotMapped(VirtAddr),

	#[error("stack extension limit reached at {0:?}")]
	StackLimit(VirtAddr),

	#[error("write to read-only page at {0:?}")]
	ReadOnlyWrite(VirtAddr),

	#[error("backing file unreadable for page at {0:?}")]
	BackingFile(VirtAddr),
}

#[derive(Debug, Error)]
pub enum MmapError {
	#[error("mapping address {0:?} is not page-aligned")]
	Misaligned(VirtAddr),

	#[error("cannot map an empty file")]
	Empty,

	#[error("mapping at {0:?} overlaps an existing page")]
	Overlap(VirtAddr),

	#[error("mapping at {0:?} extends past the user address space")]
	OutOfRange(VirtAddr),

	#[error(transparent)]
	Fs(#[from] crate::fs::FsError),
}

/// Machine state at the moment of a fault: where the trap came from and
/// the user stack pointer recorded in the trap frame.
#[derive(Clone, Copy)]
pub struct TrapFrame {
	pub stack_pointer: VirtAddr,
	pub from_user: bool,
}

impl TrapFrame {
	pub fn user(stack_pointer: VirtAddr) -> Self {
		Self {
			stack_pointer,
			from_user: true,
		}
	}

	/// A fault taken while already in the kernel; the stack pointer in
	/// the frame is the kernel's and is ignored.
	pub fn kernel() -> Self {
		Self {
			stack_pointer: VirtAddr(0),
			from_user: false,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MapId(u32);

struct MmapRegion {
	base: VirtAddr,
	page_count: usize,
}

struct MmapState {
	next_id: u32,
	regions: HashMap<u32, MmapRegion>,
}

/// A page pinned into its frame for the duration of a kernel access.
/// The frame lock is held until the pin is dropped, which keeps the
/// eviction clock away from the page.
pub struct PinnedPage<'a> {
	page: Arc<PageEntry>,
	frame: FrameGuard<'a>,
}

impl<'a> PinnedPage<'a> {
	#[inline]
	pub fn page(&self) -> &Arc<PageEntry> {
		&self.page
	}

	#[inline]
	pub fn bytes(&self) -> &[u8] {
		&self.frame.slot.buf
	}

	#[inline]
	pub fn bytes_mut(&mut self) -> &mut [u8] {
		&mut self.frame.slot.buf
	}
}

/// One user process: its supplemental page table, its simulated hardware
/// page table, and the fault-handling policy that ties them to the frame
/// table and swap store.
pub struct Process {
	name: String,
	frames: Arc<FrameTable>,
	swap: Arc<SwapStore>,
	page_dir: PageDir,
	spt: Mutex<HashMap<VirtAddr, Arc<PageEntry>>>,
	/// User stack pointer memoized at the last user-mode trap, consulted
	/// when a kernel-mode access faults on a user address.
	stack_ptr: Mutex<Option<VirtAddr>>,
	stack_extensions: AtomicUsize,
	mmaps: Mutex<MmapState>,
	exit_status: Mutex<Option<i32>>,
	self_ref: Weak<Process>,
}

impl Process {
	pub(crate) fn new(
		name: impl Into<String>,
		frames: Arc<FrameTable>,
		swap: Arc<SwapStore>,
	) -> Arc<Self> {
		let name = name.into();
		Arc::new_cyclic(|self_ref| Self {
			name,
			frames,
			swap,
			page_dir: PageDir::new(),
			spt: Mutex::new(HashMap::new()),
			stack_ptr: Mutex::new(None),
			stack_extensions: AtomicUsize::new(0),
			mmaps: Mutex::new(MmapState {
				next_id: 0,
				regions: HashMap::new(),
			}),
			exit_status: Mutex::new(None),
			self_ref: self_ref.clone(),
		})
	}

	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline]
	pub fn exit_status(&self) -> Option<i32> {
		*self.exit_status.lock()
	}

	#[inline]
	pub(crate) fn page_dir(&self) -> &PageDir {
		&self.page_dir
	}

	/// Creates a page at `addr` (rounded down to its page base). A
	/// duplicate insert is rejected: the pre-existing entry is returned
	/// unchanged.
	pub fn page_allocate(
		&self,
		addr: VirtAddr,
		read_only: bool,
		kind: PageKind,
		backing: Option<FileBacking>,
	) -> Arc<PageEntry> {
		let mut spt = self.spt.lock();
		self.page_allocate_locked(&mut spt, addr, read_only, kind, backing)
	}

	fn page_allocate_locked(
		&self,
		spt: &mut HashMap<VirtAddr, Arc<PageEntry>>,
		addr: VirtAddr,
		read_only: bool,
		kind: PageKind,
		backing: Option<FileBacking>,
	) -> Arc<PageEntry> {
		let base = addr.page_base();
		if let Some(existing) = spt.get(&base) {
			return Arc::clone(existing);
		}
		let entry = Arc::new(PageEntry::new(
			base,
			kind,
			read_only,
			self.self_ref.clone(),
			backing,
		));
		spt.insert(base, Arc::clone(&entry));
		entry
	}

	pub fn page_for_addr(&self, addr: VirtAddr) -> Option<Arc<PageEntry>> {
		self.spt.lock().get(&addr.page_base()).cloned()
	}

	/// Materializes the page containing `addr` into a frame and installs
	/// its translation. The page must already have an SPT entry.
	pub fn page_in(&self, addr: VirtAddr) -> Result<(), Fault> {
		let page = self.page_for_addr(addr).ok_or(Fault::NotMapped(addr))?;
		self.page_in_entry(&page)
	}

	fn page_in_entry(&self, page: &Arc<PageEntry>) -> Result<(), Fault> {
		let mut frame = self.frames.try_alloc_and_lock(page);
		let mut from_swap = false;

		if page.swap_slot().is_some() {
			self.swap.swap_in(page, &mut frame.slot);
			from_swap = true;
		} else if let Some(backing) = page.backing() {
			let filled = backing
				.inode
				.read_at(&mut frame.slot.buf[..backing.bytes], backing.offset);
			match filled {
				Ok(read) if read == backing.bytes => {
					frame.slot.buf[backing.bytes..].fill(0);
				}
				_ => {
					// A short read of the backing file is fatal to the
					// process; undo the binding before reporting.
					drop(frame);
					self.frames.free(page);
					return Err(Fault::BackingFile(page.addr()));
				}
			}
		} else {
			frame.slot.buf.fill(0);
		}

		self.page_dir
			.set_page(page.addr(), frame.index, !page.read_only());
		if from_swap {
			// The slot was released on the way in, so the frame is now the
			// only copy; the page must write back on its next eviction.
			self.page_dir.set_dirty(page.addr());
		}
		Ok(())
	}

	/// Removes the page at `addr`, writing dirty mmap contents back and
	/// returning its frame and swap slot, if any.
	pub fn page_deallocate(&self, addr: VirtAddr) {
		let page = self.spt.lock().remove(&addr.page_base());
		if let Some(page) = page {
			self.reclaim_entry(&page);
		}
	}

	fn reclaim_entry(&self, page: &Arc<PageEntry>) {
		if let Some(frame) = self.frames.lock_frame_of(page) {
			if page.kind() == PageKind::Mmap && self.page_dir.is_dirty(page.addr()) {
				let backing = page.backing().expect("mmap page without a backing file");
				match backing
					.inode
					.write_at(&frame.slot.buf[..backing.bytes], backing.offset)
				{
					Ok(written) if written == backing.bytes => {}
					Ok(written) => warn!(
						"{}: mmap write-back of {:?} truncated to {written} bytes",
						self.name,
						page.addr()
					),
					Err(err) => warn!(
						"{}: mmap write-back of {:?} failed: {err}",
						self.name,
						page.addr()
					),
				}
			}
		}
		self.page_dir.clear_page(page.addr());
		self.frames.free(page);
		if let Some(slot) = page.swap_slot() {
			self.swap.release(slot);
			page.set_swap_slot(None);
		}
	}

	/// Pins the page containing `addr` into a frame for a kernel access,
	/// faulting it in first if necessary. Dropping the returned pin is
	/// the unlock. Fails without killing the process; callers on the
	/// fault path decide that.
	pub fn page_lock(&self, addr: VirtAddr, will_write: bool) -> Result<PinnedPage<'_>, Fault> {
		loop {
			let page = self.page_for_addr(addr).ok_or(Fault::NotMapped(addr))?;
			if will_write && page.read_only() {
				return Err(Fault::ReadOnlyWrite(addr));
			}
			// The page can be evicted between page-in and the frame lock;
			// `lock_frame_of` detects that and we simply fault again.
			if let Some(frame) = self.frames.lock_frame_of(&page) {
				return Ok(PinnedPage { page, frame });
			}
			self.page_in_entry(&page)?;
		}
	}

	/// The page-fault entry point. Kills the process (status −1) when the
	/// fault is not resolvable.
	pub fn page_fault(&self, fault_addr: VirtAddr, trap: &TrapFrame) -> Result<(), Fault> {
		let outcome = self.handle_fault(fault_addr, trap);
		if let Err(fault) = &outcome {
			self.kill(fault);
		}
		outcome
	}

	fn handle_fault(&self, fault_addr: VirtAddr, trap: &TrapFrame) -> Result<(), Fault> {
		if fault_addr.0 == 0 {
			return Err(Fault::NullDereference);
		}
		if !fault_addr.is_user() {
			return Err(Fault::NotMapped(fault_addr));
		}
		if self.page_for_addr(fault_addr).is_some() {
			return self.page_in(fault_addr);
		}

		// No entry: maybe a stack extension. A user-mode trap supplies the
		// stack pointer and memoizes it; a kernel-mode fault (syscall code
		// dereferencing user memory) relies on the memoized value.
		let stack_ptr = if trap.from_user {
			*self.stack_ptr.lock() = Some(trap.stack_pointer);
			trap.stack_pointer
		} else {
			(*self.stack_ptr.lock()).ok_or(Fault::NotMapped(fault_addr))?
		};

		if fault_addr.0 >= stack_ptr.0.saturating_sub(STACK_SLACK) {
			if self.stack_extensions.fetch_add(1, Ordering::Relaxed) >= STACK_PAGE_LIMIT {
				return Err(Fault::StackLimit(fault_addr));
			}
			self.page_allocate(fault_addr, false, PageKind::Stack, None);
			return self.page_in(fault_addr);
		}

		Err(Fault::NotMapped(fault_addr))
	}

	fn pin_for_access(
		&self,
		addr: VirtAddr,
		write: bool,
		trap: &TrapFrame,
	) -> Result<PinnedPage<'_>, Fault> {
		loop {
			match self.page_lock(addr, write) {
				Ok(pin) => return Ok(pin),
				Err(Fault::NotMapped(_)) => {
					self.handle_fault(addr, trap)?;
				}
				Err(fault) => return Err(fault),
			}
		}
	}

	/// Reads user memory, faulting pages in as needed. A failed access
	/// kills the process and returns the fault.
	pub fn read_bytes(
		&self,
		addr: VirtAddr,
		buf: &mut [u8],
		trap: &TrapFrame,
	) -> Result<(), Fault> {
		let outcome = self.read_bytes_inner(addr, buf, trap);
		if let Err(fault) = &outcome {
			self.kill(fault);
		}
		outcome
	}

	fn read_bytes_inner(
		&self,
		addr: VirtAddr,
		buf: &mut [u8],
		trap: &TrapFrame,
	) -> Result<(), Fault> {
		let mut copied = 0;
		while copied < buf.len() {
			let cur = VirtAddr(addr.0 + copied as u64);
			if !cur.is_user() {
				return Err(Fault::NotMapped(cur));
			}
			let offset = cur.page_offset();
			let chunk = (PAGE_SIZE - offset).min(buf.len() - copied);

			let pin = self.pin_for_access(cur, false, trap)?;
			self.page_dir.mark_access(cur, false);
			buf[copied..copied + chunk].copy_from_slice(&pin.bytes()[offset..offset + chunk]);
			drop(pin);

			copied += chunk;
		}
		Ok(())
	}

	/// Writes user memory, faulting pages in as needed. A failed access
	/// (including a write to a read-only page) kills the process.
	pub fn write_bytes(&self, addr: VirtAddr, data: &[u8], trap: &TrapFrame) -> Result<(), Fault> {
		let outcome = self.write_bytes_inner(addr, data, trap);
		if let Err(fault) = &outcome {
			self.kill(fault);
		}
		outcome
	}

	fn write_bytes_inner(
		&self,
		addr: VirtAddr,
		data: &[u8],
		trap: &TrapFrame,
	) -> Result<(), Fault> {
		let mut copied = 0;
		while copied < data.len() {
			let cur = VirtAddr(addr.0 + copied as u64);
			if !cur.is_user() {
				return Err(Fault::NotMapped(cur));
			}
			let offset = cur.page_offset();
			let chunk = (PAGE_SIZE - offset).min(data.len() - copied);

			let mut pin = self.pin_for_access(cur, true, trap)?;
			// The dirty bit must be set while the frame is pinned, or the
			// clock could discard the page as clean in the gap.
			self.page_dir.mark_access(cur, true);
			pin.bytes_mut()[offset..offset + chunk].copy_from_slice(&data[copied..copied + chunk]);
			drop(pin);

			copied += chunk;
		}
		Ok(())
	}

	/// Maps `inode` at page-aligned `addr`, one MMAP page per file page.
	pub fn mmap(&self, inode: &Arc<Inode>, addr: VirtAddr) -> Result<MapId, MmapError> {
		if addr != addr.page_base() || addr.0 == 0 {
			return Err(MmapError::Misaligned(addr));
		}
		let length = inode.length()?;
		if length == 0 {
			return Err(MmapError::Empty);
		}
		if addr.0 + length > KERNEL_BASE {
			return Err(MmapError::OutOfRange(addr));
		}
		let page_count = (length as usize).div_ceil(PAGE_SIZE);

		let mut spt = self.spt.lock();
		for i in 0..page_count {
			let page_addr = VirtAddr(addr.0 + (i * PAGE_SIZE) as u64);
			if spt.contains_key(&page_addr) {
				return Err(MmapError::Overlap(page_addr));
			}
		}
		for i in 0..page_count {
			let offset = (i * PAGE_SIZE) as u64;
			let bytes = PAGE_SIZE.min((length - offset) as usize);
			self.page_allocate_locked(
				&mut spt,
				VirtAddr(addr.0 + offset),
				false,
				PageKind::Mmap,
				Some(FileBacking {
					inode: Arc::clone(inode),
					offset,
					bytes,
				}),
			);
		}
		drop(spt);

		let mut mmaps = self.mmaps.lock();
		let id = mmaps.next_id;
		mmaps.next_id += 1;
		mmaps.regions.insert(id, MmapRegion {
			base: addr,
			page_count,
		});
		Ok(MapId(id))
	}

	/// Unmaps a region, writing dirty pages back to the file.
	pub fn munmap(&self, id: MapId) -> bool {
		let region = self.mmaps.lock().regions.remove(&id.0);
		let Some(region) = region else {
			return false;
		};
		for i in 0..region.page_count {
			self.page_deallocate(VirtAddr(region.base.0 + (i * PAGE_SIZE) as u64));
		}
		true
	}

	fn kill(&self, fault: &Fault) {
		warn!("{}: {fault}", self.name);
		self.exit(-1);
	}

	/// Cooperative termination: drains the SPT under the process lock,
	/// writing back dirty mmap pages and releasing frames and swap slots.
	/// Idempotent; the first status sticks.
	pub fn exit(&self, status: i32) {
		{
			let mut exit_status = self.exit_status.lock();
			if exit_status.is_some() {
				return;
			}
			*exit_status = Some(status);
		}
		info!("{}: exit({status})", self.name);

		let mut spt = self.spt.lock();
		for (_, page) in spt.drain() {
			self.reclaim_entry(&page);
		}
	}

	#[cfg(test)]
	pub(crate) fn resident_pages(&self) -> Vec<Arc<PageEntry>> {
		self.spt
			.lock()
			.values()
			.filter(|p| p.frame_index().is_some())
			.cloned()
			.collect()
	}
}
