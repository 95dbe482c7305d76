use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicI64, Ordering},
		Arc, Weak,
	},
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{
	consts::{KERNEL_BASE, PAGE_SIZE},
	fs::inode::Inode,
	vm::process::Process,
};

/// User virtual address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
	#[inline]
	pub fn page_base(self) -> VirtAddr {
		VirtAddr(self.0 & !(PAGE_SIZE as u64 - 1))
	}

	#[inline]
	pub fn page_offset(self) -> usize {
		(self.0 % PAGE_SIZE as u64) as usize
	}

	#[inline]
	pub fn is_user(self) -> bool {
		self.0 < KERNEL_BASE
	}
}

impl std::fmt::Debug for VirtAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

/// How a page is materialized and written back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
	/// Zero-filled on first touch, swapped thereafter.
	Stack,
	/// Optionally file-initialized, swapped thereafter.
	AnonData,
	/// File-backed, written back to the file when dirty.
	Mmap,
	/// File-backed and never written back.
	ReadonlyFile,
}

/// Backing-file slice for [`PageKind::Mmap`] and [`PageKind::ReadonlyFile`]
/// pages (and the initial contents of [`PageKind::AnonData`] pages).
#[derive(Clone)]
pub struct FileBacking {
	pub inode: Arc<Inode>,
	pub offset: u64,
	/// Valid bytes at `offset`; the rest of the page is zero-filled.
	pub bytes: usize,
}

const NO_INDEX: i64 = -1;

/// Supplemental page table entry: one user page and the state needed to
/// materialize it. Keys into the frame table and swap table are plain
/// integers; `-1` means absent. Both are only mutated under the owning
/// frame's lock (plus the scan lock for structural changes), so a page is
/// never observed resident and swapped at once.
pub struct PageEntry {
	addr: VirtAddr,
	kind: PageKind,
	read_only: bool,
	process: Weak<Process>,
	backing: Option<FileBacking>,
	frame: AtomicI64,
	swap_slot: AtomicI64,
}

impl PageEntry {
	pub(crate) fn new(
		addr: VirtAddr,
		kind: PageKind,
		read_only: bool,
		process: Weak<Process>,
		backing: Option<FileBacking>,
	) -> Self {
		debug_assert_eq!(addr, addr.page_base());
		debug_assert!(addr.is_user());
		Self {
			addr,
			kind,
			read_only,
			process,
			backing,
			frame: AtomicI64::new(NO_INDEX),
			swap_slot: AtomicI64::new(NO_INDEX),
		}
	}

	#[inline]
	pub fn addr(&self) -> VirtAddr {
		self.addr
	}

	#[inline]
	pub fn kind(&self) -> PageKind {
		self.kind
	}

	#[inline]
	pub fn read_only(&self) -> bool {
		self.read_only
	}

	#[inline]
	pub(crate) fn process(&self) -> &Weak<Process> {
		&self.process
	}

	#[inline]
	pub(crate) fn backing(&self) -> Option<&FileBacking> {
		self.backing.as_ref()
	}

	#[inline]
	pub fn frame_index(&self) -> Option<usize> {
		match self.frame.load(Ordering::Acquire) {
			NO_INDEX => None,
			index => Some(index as usize),
		}
	}

	#[inline]
	pub(crate) fn set_frame_index(&self, index: Option<usize>) {
		self.frame
			.store(index.map_or(NO_INDEX, |i| i as i64), Ordering::Release);
	}

	#[inline]
	pub fn swap_slot(&self) -> Option<usize> {
		match self.swap_slot.load(Ordering::Acquire) {
			NO_INDEX => None,
			slot => Some(slot as usize),
		}
	}

	#[inline]
	pub(crate) fn set_swap_slot(&self, slot: Option<usize>) {
		self.swap_slot
			.store(slot.map_or(NO_INDEX, |s| s as i64), Ordering::Release);
	}
}

bitflags! {
	pub(crate) struct Pte: u8 {
		const WRITABLE = 1 << 0;
		const ACCESSED = 1 << 1;
		const DIRTY = 1 << 2;
	}
}

#[derive(Clone, Copy)]
pub(crate) struct Translation {
	pub frame: usize,
	pub flags: Pte,
}

/// Stand-in for the hardware page table of one process: installed
/// translations plus their accessed and dirty bits. The fault handler
/// installs and removes translations; the memory-access paths set the
/// usage bits; the eviction clock reads and clears them.
pub(crate) struct PageDir {
	map: Mutex<HashMap<VirtAddr, Translation>>,
}

impl PageDir {
	pub fn new() -> Self {
		Self {
			map: Mutex::new(HashMap::new()),
		}
	}

	pub fn set_page(&self, addr: VirtAddr, frame: usize, writable: bool) {
		let mut flags = Pte::empty();
		if writable {
			flags |= Pte::WRITABLE;
		}
		self.map.lock().insert(addr.page_base(), Translation { frame, flags });
	}

	pub fn clear_page(&self, addr: VirtAddr) {
		self.map.lock().remove(&addr.page_base());
	}

	pub fn translate(&self, addr: VirtAddr) -> Option<Translation> {
		self.map.lock().get(&addr.page_base()).copied()
	}

	/// Records a completed access, as the MMU would.
	pub fn mark_access(&self, addr: VirtAddr, write: bool) {
		if let Some(tr) = self.map.lock().get_mut(&addr.page_base()) {
			tr.flags |= Pte::ACCESSED;
			if write {
				tr.flags |= Pte::DIRTY;
			}
		}
	}

	pub fn is_accessed(&self, addr: VirtAddr) -> bool {
		self.translate(addr)
			.is_some_and(|tr| tr.flags.contains(Pte::ACCESSED))
	}

	pub fn clear_accessed(&self, addr: VirtAddr) {
		if let Some(tr) = self.map.lock().get_mut(&addr.page_base()) {
			tr.flags.remove(Pte::ACCESSED);
		}
	}

	pub fn is_dirty(&self, addr: VirtAddr) -> bool {
		self.translate(addr)
			.is_some_and(|tr| tr.flags.contains(Pte::DIRTY))
	}

	pub fn set_dirty(&self, addr: VirtAddr) {
		if let Some(tr) = self.map.lock().get_mut(&addr.page_base()) {
			tr.flags |= Pte::DIRTY;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn addr_arithmetic() {
		let addr = VirtAddr(0x1234_5678);
		assert_eq!(addr.page_base(), VirtAddr(0x1234_5000));
		assert_eq!(addr.page_offset(), 0x678);
		assert!(addr.is_user());
		assert!(!VirtAddr(KERNEL_BASE).is_user());
	}

	#[test]
	fn page_dir_tracks_usage_bits() {
		let dir = PageDir::new();
		let addr = VirtAddr(0x8000_0000);

		dir.set_page(addr, 7, true);
		assert!(!dir.is_accessed(addr));
		assert!(!dir.is_dirty(addr));

		dir.mark_access(VirtAddr(addr.0 + 5), false);
		assert!(dir.is_accessed(addr));
		assert!(!dir.is_dirty(addr));

		dir.clear_accessed(addr);
		dir.mark_access(addr, true);
		assert!(dir.is_accessed(addr));
		assert!(dir.is_dirty(addr));

		dir.clear_page(addr);
		assert!(dir.translate(addr).is_none());
	}
}
