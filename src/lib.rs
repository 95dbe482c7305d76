//! A demand-paged virtual-memory core and a concurrent buffer-cache /
//! indexed-file core for a small teaching kernel, run in user space: the
//! "hardware" (page-table bits, block devices) is simulated, the policies
//! (clock eviction, swap, sparse indexed files, reader/writer sector
//! locking) are real.
//!
//! Every process-wide singleton (frame table, swap store, sector cache,
//! free map, open-inode registry) is owned by a [`Kernel`] value; there
//! are no hidden globals.

mod consts;
mod tasks;
mod utils;

pub mod device;
pub mod fs;
pub mod vm;

pub use consts::{KERNEL_BASE, PAGE_SIZE, SECTOR_SIZE};
pub use tasks::TaskRunner;

use std::{io, sync::Arc};

use static_assertions::assert_impl_all;

use crate::{
	device::BlockDevice,
	fs::{CacheConfig, Filesys},
	vm::{FrameTable, Process, SwapStore},
};

#[derive(Debug, Clone)]
pub struct KernelConfig {
	/// Physical frames backing user pages.
	pub frame_count: usize,
	pub cache: CacheConfig,
}

impl Default for KernelConfig {
	fn default() -> Self {
		Self {
			frame_count: 256,
			cache: CacheConfig::default(),
		}
	}
}

/// The kernel's memory hierarchy, assembled over a filesystem device and
/// a swap device.
pub struct Kernel {
	frames: Arc<FrameTable>,
	swap: Arc<SwapStore>,
	filesys: Filesys,
	/// Runs the cache's flush and read-ahead tasks.
	_tasks: TaskRunner,
}

assert_impl_all!(Kernel: Send, Sync);

impl Kernel {
	pub fn new(
		fs_device: Arc<dyn BlockDevice>,
		swap_device: Arc<dyn BlockDevice>,
		config: &KernelConfig,
	) -> Result<Self, io::Error> {
		let tasks = TaskRunner::new()?;
		let swap = Arc::new(SwapStore::new(swap_device));
		let frames = Arc::new(FrameTable::new(config.frame_count, Arc::clone(&swap)));
		let filesys = Filesys::new(fs_device, &config.cache, &tasks);
		Ok(Self {
			frames,
			swap,
			filesys,
			_tasks: tasks,
		})
	}

	#[inline]
	pub fn filesys(&self) -> &Filesys {
		&self.filesys
	}

	pub fn spawn_process(&self, name: impl Into<String>) -> Arc<Process> {
		Process::new(name, Arc::clone(&self.frames), Arc::clone(&self.swap))
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use crate::{
		device::MemDevice,
		fs::InodeKind,
		vm::{Fault, FileBacking, PageKind, TrapFrame, VirtAddr},
	};

	use super::*;

	fn test_kernel(frame_count: usize) -> Kernel {
		Kernel::new(
			Arc::new(MemDevice::new(4096)),
			Arc::new(MemDevice::new(4096)),
			&KernelConfig {
				frame_count,
				cache: CacheConfig {
					flush_period: Duration::from_secs(3600),
					retry_interval: Duration::from_millis(10),
				},
			},
		)
		.unwrap()
	}

	#[test]
	fn mmap_write_reaches_the_file_on_unmap() {
		// Dirty a mapped page, unmap, reopen, observe.
		let kernel = test_kernel(8);
		let fs = kernel.filesys();

		let sector = fs.create(PAGE_SIZE as u32, InodeKind::File).unwrap();
		let file = fs.open(sector).unwrap();

		let process = kernel.spawn_process("mapper");
		let addr = VirtAddr(0x2000_0000);
		let mapping = process.mmap(file.inode(), addr).unwrap();

		let trap = TrapFrame::user(VirtAddr(KERNEL_BASE));
		process.write_bytes(addr, &[0x01], &trap).unwrap();
		assert!(process.munmap(mapping));
		drop(file);

		let reopened = fs.open(sector).unwrap();
		let mut first = [0xff; 1];
		assert_eq!(reopened.read_at(&mut first, 0).unwrap(), 1);
		assert_eq!(first[0], 0x01);
	}

	#[test]
	fn evicted_mmap_pages_write_back_under_pressure() {
		// Four mapped pages against two frames: at least two dirty pages
		// are written back by the clock, the rest by munmap.
		let kernel = test_kernel(2);
		let fs = kernel.filesys();

		let len = 4 * PAGE_SIZE as u32;
		let sector = fs.create(len, InodeKind::File).unwrap();
		let file = fs.open(sector).unwrap();

		let process = kernel.spawn_process("pressured-mapper");
		let addr = VirtAddr(0x3000_0000);
		let mapping = process.mmap(file.inode(), addr).unwrap();

		let trap = TrapFrame::user(VirtAddr(KERNEL_BASE));
		for i in 0..4u64 {
			let fill = [i as u8 + 10; PAGE_SIZE];
			process
				.write_bytes(VirtAddr(addr.0 + i * PAGE_SIZE as u64), &fill, &trap)
				.unwrap();
		}
		assert!(process.munmap(mapping));

		let mut page = vec![0u8; PAGE_SIZE];
		for i in 0..4u64 {
			assert_eq!(
				file.read_at(&mut page, i * PAGE_SIZE as u64).unwrap(),
				PAGE_SIZE
			);
			assert!(
				page.iter().all(|b| *b == i as u8 + 10),
				"mapped page {i} lost its contents"
			);
		}
	}

	#[test]
	fn mmap_rejects_misaligned_and_overlapping_requests() {
		let kernel = test_kernel(4);
		let fs = kernel.filesys();
		let sector = fs.create(PAGE_SIZE as u32, InodeKind::File).unwrap();
		let file = fs.open(sector).unwrap();

		let process = kernel.spawn_process("picky");
		assert!(process.mmap(file.inode(), VirtAddr(0x1000_0010)).is_err());

		let addr = VirtAddr(0x1000_0000);
		process.mmap(file.inode(), addr).unwrap();
		assert!(process.mmap(file.inode(), addr).is_err());
	}

	#[test]
	fn executable_pages_materialize_from_the_file() {
		let kernel = test_kernel(4);
		let fs = kernel.filesys();

		let sector = fs.create(0, InodeKind::File).unwrap();
		let file = fs.open(sector).unwrap();
		let image: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 199) as u8).collect();
		file.write_at(&image, 0).unwrap();

		let process = kernel.spawn_process("exec");
		let addr = VirtAddr(0x0804_8000);
		process.page_allocate(
			addr,
			true,
			PageKind::ReadonlyFile,
			Some(FileBacking {
				inode: Arc::clone(file.inode()),
				offset: 0,
				bytes: PAGE_SIZE,
			}),
		);

		let trap = TrapFrame::user(VirtAddr(KERNEL_BASE));
		let mut back = vec![0u8; PAGE_SIZE];
		process.read_bytes(addr, &mut back, &trap).unwrap();
		assert_eq!(back, image);

		// The image is read-only.
		let err = process.write_bytes(addr, &[0], &trap).unwrap_err();
		assert!(matches!(err, Fault::ReadOnlyWrite(_)));
		assert_eq!(process.exit_status(), Some(-1));
	}

	#[test]
	fn short_backing_read_kills_the_process() {
		let kernel = test_kernel(4);
		let fs = kernel.filesys();

		// The file holds fewer bytes than the page entry claims.
		let sector = fs.create(0, InodeKind::File).unwrap();
		let file = fs.open(sector).unwrap();
		file.write_at(&[7; 100], 0).unwrap();

		let process = kernel.spawn_process("truncated");
		let addr = VirtAddr(0x0804_8000);
		process.page_allocate(
			addr,
			false,
			PageKind::AnonData,
			Some(FileBacking {
				inode: Arc::clone(file.inode()),
				offset: 0,
				bytes: PAGE_SIZE,
			}),
		);

		let trap = TrapFrame::user(VirtAddr(KERNEL_BASE));
		let mut buf = [0; 8];
		let err = process.read_bytes(addr, &mut buf, &trap).unwrap_err();
		assert!(matches!(err, Fault::BackingFile(_)));
		assert_eq!(process.exit_status(), Some(-1));
	}

	#[test]
	fn random_writes_round_trip_under_memory_pressure() {
		// Shadow-map check of write/read coherence while four frames
		// churn sixteen pages through swap.
		let kernel = test_kernel(4);
		let process = kernel.spawn_process("shadow");
		let trap = TrapFrame::user(VirtAddr(KERNEL_BASE));

		const PAGES: usize = 16;
		let base = 0x7000_0000u64;
		for i in 0..PAGES as u64 {
			process.page_allocate(
				VirtAddr(base + i * PAGE_SIZE as u64),
				false,
				PageKind::AnonData,
				None,
			);
		}

		let mut shadow = vec![0u8; PAGES * PAGE_SIZE];
		let mut state = 0x2545_f491_4f6c_dd1du64;
		let mut next = move || {
			// xorshift64
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			state
		};

		for _ in 0..4000 {
			let offset = (next() % (PAGES * PAGE_SIZE) as u64) as usize;
			let value = next() as u8;
			if next() % 4 == 0 {
				let mut byte = [0u8; 1];
				process
					.read_bytes(VirtAddr(base + offset as u64), &mut byte, &trap)
					.unwrap();
				assert_eq!(byte[0], shadow[offset], "mismatch at offset {offset}");
			} else {
				process
					.write_bytes(VirtAddr(base + offset as u64), &[value], &trap)
					.unwrap();
				shadow[offset] = value;
			}
		}

		let mut page = vec![0u8; PAGE_SIZE];
		for i in 0..PAGES {
			process
				.read_bytes(VirtAddr(base + (i * PAGE_SIZE) as u64), &mut page, &trap)
				.unwrap();
			assert_eq!(page, shadow[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
		}
	}
}
