use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use static_assertions::assert_impl_all;

use crate::{
	consts::PAGE_SIZE,
	vm::{
		page::{PageEntry, PageKind},
		swap::SwapStore,
	},
};

/// One physical frame: the kernel-visible page of memory plus a weak
/// back-reference to the page currently occupying it. Both are guarded by
/// the frame's mutex; rebinding additionally requires the scan lock.
pub(crate) struct FrameSlot {
	pub page: Option<Weak<PageEntry>>,
	pub buf: Box<[u8]>,
}

impl FrameSlot {
	pub fn live_page(&self) -> Option<Arc<PageEntry>> {
		self.page.as_ref().and_then(Weak::upgrade)
	}
}

/// A locked frame. Dropping the guard releases the frame lock.
pub(crate) struct FrameGuard<'a> {
	pub index: usize,
	pub slot: MutexGuard<'a, FrameSlot>,
}

struct ScanState {
	hand: usize,
}

/// The global physical frame table. Allocation scans for a free frame and
/// falls back to clock eviction: the hand sweeps the array, giving each
/// recently-accessed page a second chance by clearing its accessed bit,
/// and evicts the first page found unaccessed.
pub struct FrameTable {
	frames: Box<[Mutex<FrameSlot>]>,
	scan: Mutex<ScanState>,
	swap: Arc<SwapStore>,
}

assert_impl_all!(FrameTable: Send, Sync);

impl FrameTable {
	pub fn new(frame_count: usize, swap: Arc<SwapStore>) -> Self {
		assert!(frame_count > 0, "frame table must hold at least one frame");
		Self {
			frames: (0..frame_count)
				.map(|_| {
					Mutex::new(FrameSlot {
						page: None,
						buf: vec![0; PAGE_SIZE].into_boxed_slice(),
					})
				})
				.collect(),
			scan: Mutex::new(ScanState { hand: 0 }),
			swap,
		}
	}

	#[inline]
	pub fn frame_count(&self) -> usize {
		self.frames.len()
	}

	pub(crate) fn lock(&self, index: usize) -> FrameGuard<'_> {
		FrameGuard {
			index,
			slot: self.frames[index].lock(),
		}
	}

	/// Locks the frame `page` is resident in, if it still is by the time
	/// the lock is held. `None` means the page was evicted (or was never
	/// resident) and the caller must re-fault.
	pub(crate) fn lock_frame_of(&self, page: &Arc<PageEntry>) -> Option<FrameGuard<'_>> {
		let index = page.frame_index()?;
		let slot = self.frames[index].lock();
		slot.live_page()
			.is_some_and(|bound| Arc::ptr_eq(&bound, page))
			.then_some(FrameGuard { index, slot })
	}

	/// Binds `page` to a frame and returns it locked. Runs the clock
	/// eviction algorithm when no frame is free; eviction writes the
	/// victim back according to its kind.
	pub(crate) fn try_alloc_and_lock(&self, page: &Arc<PageEntry>) -> FrameGuard<'_> {
		let mut scan = self.scan.lock();

		// First pass: any unbound frame whose lock is free.
		for (index, frame) in self.frames.iter().enumerate() {
			if let Some(mut slot) = frame.try_lock() {
				if slot.live_page().is_none() {
					Self::bind(index, &mut slot, page);
					return FrameGuard { index, slot };
				}
			}
		}

		// All frames are occupied; run the clock.
		let frame_count = self.frames.len();
		let mut steps = 0usize;
		loop {
			let index = scan.hand;
			scan.hand = (scan.hand + 1) % frame_count;

			steps += 1;
			if steps > 8 * frame_count {
				// Every frame stayed locked across repeated sweeps.
				panic!("frame table: no evictable frame");
			}

			// A frame whose lock is held is in active use; treat it as
			// recently accessed and move on.
			let Some(mut slot) = self.frames[index].try_lock() else {
				continue;
			};

			let Some(victim) = slot.live_page() else {
				Self::bind(index, &mut slot, page);
				return FrameGuard { index, slot };
			};
			let Some(owner) = victim.process().upgrade() else {
				// The owning process is gone mid-teardown; reclaim.
				slot.buf.fill(0);
				victim.set_frame_index(None);
				Self::bind(index, &mut slot, page);
				return FrameGuard { index, slot };
			};

			if owner.page_dir().is_accessed(victim.addr()) {
				owner.page_dir().clear_accessed(victim.addr());
				continue;
			}

			debug!(
				"evicting {:?} ({:?}) from frame {index}",
				victim.addr(),
				victim.kind()
			);
			self.evict(&victim, &owner, &mut slot);
			Self::bind(index, &mut slot, page);
			return FrameGuard { index, slot };
		}
	}

	/// Severs the page/frame binding. No-op if `page` is not resident.
	pub(crate) fn free(&self, page: &Arc<PageEntry>) {
		let Some(index) = page.frame_index() else {
			return;
		};
		let _scan = self.scan.lock();
		let mut slot = self.frames[index].lock();
		if slot
			.live_page()
			.is_some_and(|bound| Arc::ptr_eq(&bound, page))
		{
			slot.page = None;
			page.set_frame_index(None);
		}
	}

	fn bind(index: usize, slot: &mut FrameSlot, page: &Arc<PageEntry>) {
		slot.page = Some(Arc::downgrade(page));
		page.set_frame_index(Some(index));
	}

	/// Writes the victim back and unbinds it. The caller holds the scan
	/// lock and the victim's frame lock. The hardware mapping is removed
	/// before the frame is handed out for rebinding.
	fn evict(&self, victim: &Arc<PageEntry>, owner: &Arc<crate::vm::process::Process>, slot: &mut FrameSlot) {
		match victim.kind() {
			PageKind::Stack | PageKind::AnonData => {
				if let Err(err) = self.swap.swap_out(victim, slot) {
					panic!("evicting {:?}: {err}", victim.addr());
				}
			}
			PageKind::Mmap => {
				if owner.page_dir().is_dirty(victim.addr()) {
					let backing = victim.backing().expect("mmap page without a backing file");
					match backing.inode.write_at(&slot.buf[..backing.bytes], backing.offset) {
						Ok(written) if written == backing.bytes => {}
						Ok(written) => panic!(
							"mmap write-back of {:?} truncated to {written} bytes",
							victim.addr()
						),
						Err(err) => panic!("mmap write-back of {:?} failed: {err}", victim.addr()),
					}
				}
				owner.page_dir().clear_page(victim.addr());
				slot.buf.fill(0);
				slot.page = None;
				victim.set_frame_index(None);
			}
			PageKind::ReadonlyFile => {
				// Reconstructible from the file; never written back.
				owner.page_dir().clear_page(victim.addr());
				slot.buf.fill(0);
				slot.page = None;
				victim.set_frame_index(None);
			}
		}
	}
}
