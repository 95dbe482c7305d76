use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
	consts::{PAGE_SECTORS, SECTOR_SIZE},
	device::BlockDevice,
	utils::Bitmap,
	vm::{frame::FrameSlot, page::PageEntry},
};

#[derive(Debug, Error)]
pub enum SwapError {
	#[error("swap device is full")]
	Full,
}

struct SwapState {
	map: Bitmap,
	/// Allocation hint: index of the lowest slot believed free.
	first_free: usize,
}

/// Slot allocator over the swap device. Each slot holds one page as
/// [`PAGE_SECTORS`] contiguous sectors; slot `k` begins at sector
/// `k * PAGE_SECTORS`. The slot bitmap lock is the innermost lock on the
/// swap path.
pub struct SwapStore {
	device: Arc<dyn BlockDevice>,
	state: Mutex<SwapState>,
}

impl SwapStore {
	pub fn new(device: Arc<dyn BlockDevice>) -> Self {
		let slots = device.sector_count() as usize / PAGE_SECTORS;
		Self {
			device,
			state: Mutex::new(SwapState {
				map: Bitmap::new(slots),
				first_free: 0,
			}),
		}
	}

	/// Evicts `page` from the frame it occupies. The caller holds the
	/// frame's lock and passes its slot in.
	///
	/// A clean page has no contents worth keeping: it is dropped and will
	/// be rematerialized (zero-fill or file read) on the next fault. A
	/// dirty page is written to a fresh swap slot; `SwapError::Full` means
	/// no slot was available and the page is untouched.
	pub(crate) fn swap_out(&self, page: &PageEntry, slot: &mut FrameSlot) -> Result<(), SwapError> {
		let process = page.process().upgrade();
		let dirty = process
			.as_ref()
			.is_some_and(|p| p.page_dir().is_dirty(page.addr()));

		if !dirty {
			slot.buf.fill(0);
			page.set_swap_slot(None);
		} else {
			let index = self.allocate_slot().ok_or(SwapError::Full)?;
			let start = (index * PAGE_SECTORS) as u32;
			for i in 0..PAGE_SECTORS {
				let chunk = &slot.buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
				if let Err(err) = self.device.write(start + i as u32, chunk) {
					panic!("swap write of sector {} failed: {err}", start + i as u32);
				}
			}
			page.set_swap_slot(Some(index));
		}

		if let Some(process) = process {
			process.page_dir().clear_page(page.addr());
		}
		slot.page = None;
		page.set_frame_index(None);
		Ok(())
	}

	/// Reads `page`'s swap slot into the frame pinned to it (the caller
	/// holds the frame lock) and releases the slot.
	pub(crate) fn swap_in(&self, page: &PageEntry, slot: &mut FrameSlot) {
		let index = page
			.swap_slot()
			.expect("swap_in called for a page without a swap slot");
		let start = (index * PAGE_SECTORS) as u32;
		for i in 0..PAGE_SECTORS {
			let chunk = &mut slot.buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
			if let Err(err) = self.device.read(start + i as u32, chunk) {
				panic!("swap read of sector {} failed: {err}", start + i as u32);
			}
		}
		self.release(index);
		page.set_swap_slot(None);
	}

	/// Returns a slot to the free pool.
	pub(crate) fn release(&self, index: usize) {
		let mut state = self.state.lock();
		state.map.reset(index);
		if index < state.first_free {
			state.first_free = index;
		}
	}

	fn allocate_slot(&self) -> Option<usize> {
		let mut state = self.state.lock();
		let index = if state.first_free < state.map.len() && !state.map.get(state.first_free) {
			state.first_free
		} else {
			// The hint went stale; fall back to a full scan.
			state.map.scan(0)?
		};
		state.map.set(index);
		state.first_free = state
			.map
			.scan(index + 1)
			.or_else(|| state.map.scan(0))
			.unwrap_or(state.map.len());
		Some(index)
	}

	#[cfg(test)]
	pub(crate) fn used_slots(&self) -> usize {
		self.state.lock().map.count_set()
	}

	#[cfg(test)]
	pub(crate) fn slot_count(&self) -> usize {
		self.state.lock().map.len()
	}
}
